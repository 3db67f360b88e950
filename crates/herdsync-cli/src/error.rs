use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] herdsync_core::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("No fields provided; pass key=value pairs or --json")]
    EmptyPayload,
    #[error("Invalid field assignment '{0}'; expected key=value")]
    InvalidField(String),
    #[error("--json must be a JSON object")]
    PayloadNotObject,
    #[error("Record not found: {kind} {id}")]
    RecordNotFound { kind: String, id: String },
    #[error("Pass a conflict ID or --all")]
    MissingConflictTarget,
    #[error("Pass a queue item ID or --all")]
    MissingQueueTarget,
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("{0} queued change(s) have not reached the server. Run `herdsync sync` first, or pass --force to discard them.")]
    PendingChanges(usize),
}
