//! Persisted request replay queue

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;
use crate::replay::{ReplayEntry, ReplayRequest};

const ENTRY_COLUMNS: &str = "id, method, url, headers, body, enqueued_at, attempts, last_error";

pub struct ReplayRepository<'a> {
    conn: &'a Connection,
}

impl<'a> ReplayRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Store a request for later delivery and return its id
    pub fn insert(&self, request: &ReplayRequest, enqueued_at: i64) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO replay_queue (method, url, headers, body, enqueued_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                request.method,
                request.url,
                serde_json::to_string(&request.headers)?,
                request.body,
                enqueued_at,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Oldest stored request
    pub fn front(&self) -> Result<Option<ReplayEntry>> {
        let entry = self
            .conn
            .query_row(
                &format!("SELECT {ENTRY_COLUMNS} FROM replay_queue ORDER BY enqueued_at ASC, id ASC LIMIT 1"),
                [],
                Self::parse_entry,
            )
            .optional()?;
        Ok(entry)
    }

    /// Every stored request, oldest first
    pub fn list(&self) -> Result<Vec<ReplayEntry>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ENTRY_COLUMNS} FROM replay_queue ORDER BY enqueued_at ASC, id ASC"
        ))?;
        let entries = stmt
            .query_map([], Self::parse_entry)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    pub fn remove(&self, id: i64) -> Result<bool> {
        let rows = self
            .conn
            .execute("DELETE FROM replay_queue WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    /// Count a failed delivery attempt
    pub fn record_attempt(&self, id: i64, error: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE replay_queue SET attempts = attempts + 1, last_error = ?2 WHERE id = ?1",
            params![id, error],
        )?;
        Ok(())
    }

    /// Drop requests stored before `cutoff` (Unix ms)
    pub fn prune_older_than(&self, cutoff: i64) -> Result<usize> {
        let rows = self
            .conn
            .execute("DELETE FROM replay_queue WHERE enqueued_at < ?1", params![cutoff])?;
        Ok(rows)
    }

    pub fn count(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM replay_queue", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    pub fn clear(&self) -> Result<()> {
        self.conn.execute("DELETE FROM replay_queue", [])?;
        Ok(())
    }

    fn parse_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<ReplayEntry> {
        let headers: String = row.get(3)?;
        let headers = serde_json::from_str(&headers).map_err(|error| {
            rusqlite::Error::FromSqlConversionFailure(
                3,
                rusqlite::types::Type::Text,
                Box::new(error),
            )
        })?;
        Ok(ReplayEntry {
            id: row.get(0)?,
            request: ReplayRequest {
                method: row.get(1)?,
                url: row.get(2)?,
                headers,
                body: row.get(4)?,
            },
            enqueued_at: row.get(5)?,
            attempts: row.get(6)?,
            last_error: row.get(7)?,
        })
    }
}
