pub mod add;
pub mod common;
pub mod conflicts;
pub mod delete;
pub mod edit;
pub mod history;
pub mod list;
pub mod logout;
pub mod queue;
pub mod replay;
pub mod sync;
