//! Error types for herdsync-core

use thiserror::Error;

use crate::replay::TransportFailure;
use crate::sync::AuthorityError;

/// Result type alias using herdsync-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in herdsync-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// `SQLite` error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Record, queue item or conflict not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid engine configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// The remote authority rejected or failed a request
    #[error("Authority error: {0}")]
    Authority(#[from] AuthorityError),

    /// A request outside the replay pattern failed at the transport level
    #[error(transparent)]
    Transport(#[from] TransportFailure),

    /// Operation requires connectivity
    #[error("Cannot sync while offline")]
    Offline,
}
