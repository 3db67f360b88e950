//! Settings repository implementation

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;

const LAST_SYNC_TIME_KEY: &str = "last_sync_time";

/// Key/value settings persisted next to the records
pub struct SettingsRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SettingsRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn remove_setting(&self, key: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM settings WHERE key = ?1", params![key])?;
        Ok(())
    }

    /// When the last full drain finished (Unix ms)
    pub fn last_sync_time(&self) -> Result<Option<i64>> {
        Ok(self
            .get_setting(LAST_SYNC_TIME_KEY)?
            .and_then(|value| value.parse().ok()))
    }

    pub fn set_last_sync_time(&self, timestamp: i64) -> Result<()> {
        self.set_setting(LAST_SYNC_TIME_KEY, &timestamp.to_string())
    }

    pub fn clear_last_sync_time(&self) -> Result<()> {
        self.remove_setting(LAST_SYNC_TIME_KEY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    #[test]
    fn test_missing_setting_is_none() {
        let db = Database::open_in_memory().unwrap();
        let repo = SettingsRepository::new(db.connection());

        assert_eq!(repo.get_setting("theme").unwrap(), None);
        assert_eq!(repo.last_sync_time().unwrap(), None);
    }

    #[test]
    fn test_last_sync_time_round_trip() {
        let db = Database::open_in_memory().unwrap();
        let repo = SettingsRepository::new(db.connection());

        repo.set_last_sync_time(1_700_000_000_000).unwrap();
        repo.set_last_sync_time(1_700_000_000_500).unwrap();
        assert_eq!(repo.last_sync_time().unwrap(), Some(1_700_000_000_500));

        repo.clear_last_sync_time().unwrap();
        assert_eq!(repo.last_sync_time().unwrap(), None);
    }
}
