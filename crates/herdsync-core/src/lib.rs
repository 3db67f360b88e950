//! herdsync-core - Offline-first sync engine for herd records
//!
//! Local writes land in a `SQLite` entity store and a durable mutation queue.
//! The sync engine drains the queue to the remote authority when online,
//! detects stale edits, and parks them as conflicts for the user to resolve.
//! A separate replay layer stores mutating HTTP requests that never reached
//! the server and re-sends them on reconnect.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod replay;
pub mod state;
pub mod sync;
pub mod util;

#[cfg(test)]
mod test_support;

pub use config::EngineConfig;
pub use db::{Database, SharedDatabase};
pub use error::{Error, Result};
pub use models::{EntityKind, EntityRecord, Payload};
pub use replay::{ReplayLayer, ReplayPolicy, ReplayRequest};
pub use state::{SyncState, SyncStatus};
pub use sync::{Connectivity, HttpAuthority, SyncEngine};
