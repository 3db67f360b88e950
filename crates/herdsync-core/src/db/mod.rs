//! Database layer for herdsync

mod connection;
mod conflict_repository;
mod history_repository;
mod migrations;
mod queue_repository;
mod replay_repository;
mod repository;
mod settings_repository;

pub use connection::{Database, SharedDatabase};
pub use conflict_repository::ConflictRepository;
pub use history_repository::HistoryRepository;
pub use migrations::CURRENT_VERSION;
pub use queue_repository::QueueRepository;
pub use replay_repository::ReplayRepository;
pub use repository::{EntityStore, SqliteEntityStore};
pub use settings_repository::SettingsRepository;

use crate::models::Payload;

/// Decode a JSON object stored in a text column
fn parse_payload_column(index: usize, text: &str) -> rusqlite::Result<Payload> {
    serde_json::from_str(text).map_err(|error| {
        rusqlite::Error::FromSqlConversionFailure(
            index,
            rusqlite::types::Type::Text,
            Box::new(error),
        )
    })
}

/// Decode an enum stored by its string form
fn parse_text_column<T>(index: usize, text: &str) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = crate::Error>,
{
    text.parse().map_err(|error: crate::Error| {
        rusqlite::Error::FromSqlConversionFailure(
            index,
            rusqlite::types::Type::Text,
            Box::new(error),
        )
    })
}
