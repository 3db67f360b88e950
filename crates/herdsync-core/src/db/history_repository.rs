//! Sync history repository

use rusqlite::{params, Connection};

use super::parse_text_column;
use crate::error::Result;
use crate::models::HistoryEntry;

/// Append-only ledger of sync outcomes
pub struct HistoryRepository<'a> {
    conn: &'a Connection,
}

impl<'a> HistoryRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Append an entry and return its row id
    pub fn append(&self, entry: &HistoryEntry) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO sync_history
                (timestamp, operation, entity_kind, entity_id, entity_label, action, outcome, error_message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                entry.timestamp,
                entry.operation.as_str(),
                entry.entity_kind.as_str(),
                entry.entity_id,
                entry.entity_label,
                entry.action.as_str(),
                entry.outcome.as_str(),
                entry.error_message,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Newest entries first
    pub fn list(&self, limit: usize, offset: usize) -> Result<Vec<HistoryEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, timestamp, operation, entity_kind, entity_id, entity_label, action, outcome, error_message
             FROM sync_history
             ORDER BY timestamp DESC, id DESC
             LIMIT ?1 OFFSET ?2",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let offset = i64::try_from(offset).unwrap_or(i64::MAX);

        let entries = stmt
            .query_map(params![limit, offset], |row| {
                let operation: String = row.get(2)?;
                let kind: String = row.get(3)?;
                let action: String = row.get(6)?;
                let outcome: String = row.get(7)?;
                Ok(HistoryEntry {
                    id: row.get(0)?,
                    timestamp: row.get(1)?,
                    operation: parse_text_column(2, &operation)?,
                    entity_kind: parse_text_column(3, &kind)?,
                    entity_id: row.get(4)?,
                    entity_label: row.get(5)?,
                    action: parse_text_column(6, &action)?,
                    outcome: parse_text_column(7, &outcome)?,
                    error_message: row.get(8)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    /// Drop entries recorded before `cutoff` (Unix ms)
    pub fn prune_older_than(&self, cutoff: i64) -> Result<usize> {
        let rows = self
            .conn
            .execute("DELETE FROM sync_history WHERE timestamp < ?1", params![cutoff])?;
        Ok(rows)
    }

    pub fn clear(&self) -> Result<()> {
        self.conn.execute("DELETE FROM sync_history", [])?;
        Ok(())
    }
}
