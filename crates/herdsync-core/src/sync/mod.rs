//! Sync engine: authority client, conflict handling and the drain loop.

mod authority;
mod conflict;
mod connectivity;
mod engine;

pub use authority::{Authority, AuthorityError, AuthorityResult, FailureKind, HttpAuthority};
pub use conflict::{detect, ConflictCheck};
pub use connectivity::{BackgroundTasks, Connectivity};
pub use engine::{DrainReport, SyncEngine};
