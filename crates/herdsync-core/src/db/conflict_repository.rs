//! Conflict artifact repository

use std::collections::HashSet;

use rusqlite::{params, Connection, OptionalExtension};

use super::{parse_payload_column, parse_text_column};
use crate::error::Result;
use crate::models::{ConflictArtifact, ConflictChoice, EntityKind};

const CONFLICT_COLUMNS: &str = "id, entity_kind, entity_id, local_payload, remote_payload,
    local_updated_at, remote_updated_at, detected_at, resolved, resolution, resolved_at";

pub struct ConflictRepository<'a> {
    conn: &'a Connection,
}

impl<'a> ConflictRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Persist a newly detected conflict and return its id
    pub fn insert(&self, conflict: &ConflictArtifact) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO sync_conflicts
                (entity_kind, entity_id, local_payload, remote_payload,
                 local_updated_at, remote_updated_at, detected_at, resolved, resolution, resolved_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                conflict.entity_kind.as_str(),
                conflict.entity_id,
                serde_json::to_string(&conflict.local_payload)?,
                serde_json::to_string(&conflict.remote_payload)?,
                conflict.local_updated_at,
                conflict.remote_updated_at,
                conflict.detected_at,
                i32::from(conflict.resolved),
                conflict.resolution.map(ConflictChoice::as_str),
                conflict.resolved_at,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get(&self, id: i64) -> Result<Option<ConflictArtifact>> {
        let conflict = self
            .conn
            .query_row(
                &format!("SELECT {CONFLICT_COLUMNS} FROM sync_conflicts WHERE id = ?1"),
                params![id],
                Self::parse_conflict,
            )
            .optional()?;
        Ok(conflict)
    }

    /// Conflicts newest first, optionally including resolved ones
    pub fn list(&self, include_resolved: bool, limit: usize) -> Result<Vec<ConflictArtifact>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {CONFLICT_COLUMNS} FROM sync_conflicts
             WHERE resolved = 0 OR ?1
             ORDER BY detected_at DESC, id DESC
             LIMIT ?2"
        ))?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let conflicts = stmt
            .query_map(params![include_resolved, limit], Self::parse_conflict)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(conflicts)
    }

    pub fn count_unresolved(&self) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sync_conflicts WHERE resolved = 0",
            [],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    /// Entities of `kind` with an open conflict
    pub fn unresolved_entity_ids(&self, kind: EntityKind) -> Result<HashSet<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT entity_id FROM sync_conflicts WHERE entity_kind = ?1 AND resolved = 0",
        )?;
        let ids = stmt
            .query_map(params![kind.as_str()], |row| row.get(0))?
            .collect::<rusqlite::Result<HashSet<String>>>()?;
        Ok(ids)
    }

    /// Record how a conflict was settled
    pub fn mark_resolved(&self, id: i64, choice: ConflictChoice, resolved_at: i64) -> Result<bool> {
        let rows = self.conn.execute(
            "UPDATE sync_conflicts
             SET resolved = 1, resolution = ?2, resolved_at = ?3
             WHERE id = ?1 AND resolved = 0",
            params![id, choice.as_str(), resolved_at],
        )?;
        Ok(rows > 0)
    }

    pub fn clear(&self) -> Result<()> {
        self.conn.execute("DELETE FROM sync_conflicts", [])?;
        Ok(())
    }

    fn parse_conflict(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConflictArtifact> {
        let kind: String = row.get(1)?;
        let local: String = row.get(3)?;
        let remote: String = row.get(4)?;
        let resolution: Option<String> = row.get(9)?;
        Ok(ConflictArtifact {
            id: row.get(0)?,
            entity_kind: parse_text_column(1, &kind)?,
            entity_id: row.get(2)?,
            local_payload: parse_payload_column(3, &local)?,
            remote_payload: parse_payload_column(4, &remote)?,
            local_updated_at: row.get(5)?,
            remote_updated_at: row.get(6)?,
            detected_at: row.get(7)?,
            resolved: row.get::<_, i32>(8)? != 0,
            resolution: resolution
                .map(|value| parse_text_column(9, &value))
                .transpose()?,
            resolved_at: row.get(10)?,
        })
    }
}
