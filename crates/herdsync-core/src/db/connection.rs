//! Database connection management

use std::path::Path;
use std::sync::Arc;

use rusqlite::Connection;
use tokio::sync::Mutex;

use super::{
    migrations, ConflictRepository, EntityStore, HistoryRepository, QueueRepository,
    ReplayRepository, SettingsRepository, SqliteEntityStore,
};
use crate::error::Result;

/// Database handle shared between the sync engine and the replay layer
pub type SharedDatabase = Arc<Mutex<Database>>;

/// Database wrapper for the local `SQLite` store
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open a database at the given path, creating it if it doesn't exist
    ///
    /// Runs migrations automatically.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        tracing::debug!("Opened local store at {}", path.display());

        let database = Self { conn };
        database.configure()?;
        database.migrate()?;
        Ok(database)
    }

    /// Open an in-memory database (useful for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;

        let database = Self { conn };
        database.configure()?;
        database.migrate()?;
        Ok(database)
    }

    /// Wrap the database for sharing across async tasks
    pub fn into_shared(self) -> SharedDatabase {
        Arc::new(Mutex::new(self))
    }

    /// Configure `SQLite` for an embedded, single-writer workload
    fn configure(&self) -> Result<()> {
        // journal_mode returns a row; in-memory databases report "memory"
        self.conn
            .query_row("PRAGMA journal_mode = WAL;", [], |_| Ok(()))
            .ok();
        self.conn.execute_batch(
            "PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        Ok(())
    }

    /// Run database migrations
    fn migrate(&self) -> Result<()> {
        migrations::run(&self.conn)
    }

    /// Current schema version
    pub fn schema_version(&self) -> Result<i32> {
        migrations::current_version(&self.conn)
    }

    /// Get a reference to the underlying connection
    pub const fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Wipe everything belonging to the signed-in user in one transaction.
    ///
    /// Shared reference data (master feeds) survives.
    pub fn clear_user_data(&self) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        SqliteEntityStore::new(&tx).clear()?;
        QueueRepository::new(&tx).clear()?;
        ConflictRepository::new(&tx).clear()?;
        HistoryRepository::new(&tx).clear()?;
        ReplayRepository::new(&tx).clear()?;
        SettingsRepository::new(&tx).clear_last_sync_time()?;
        tx.commit()?;

        tracing::info!("Cleared local user data");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_open_in_memory() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(db.schema_version().unwrap(), migrations::CURRENT_VERSION);
    }

    #[test]
    fn test_open_creates_parent_directories() {
        let tmp = tempdir().unwrap();
        let db_path = tmp.path().join("nested").join("herdsync.db");

        let db = Database::open(&db_path).unwrap();
        assert!(db_path.exists());
        drop(db);

        // Reopening an existing file must not fail or re-run migrations
        let reopened = Database::open(&db_path).unwrap();
        assert_eq!(
            reopened.schema_version().unwrap(),
            migrations::CURRENT_VERSION
        );
    }

    #[test]
    fn test_clear_user_data_keeps_reference_feeds() {
        use crate::models::{EntityKind, EntityRecord, MutationOp};
        use crate::test_support::payload;
        use serde_json::json;

        let db = Database::open_in_memory().unwrap();
        let store = SqliteEntityStore::new(db.connection());
        let queue = QueueRepository::new(db.connection());

        let master = EntityRecord::new_local(
            EntityKind::Feed,
            payload(json!({ "name": "Wheat bran", "is_custom": false })),
        );
        let cow = EntityRecord::new_local(EntityKind::Animal, payload(json!({ "name": "Bessie" })));
        store.put(&master).unwrap();
        store.put(&cow).unwrap();
        queue
            .enqueue(EntityKind::Animal, &cow.id, MutationOp::Create, cow.data.clone())
            .unwrap();
        SettingsRepository::new(db.connection())
            .set_last_sync_time(42)
            .unwrap();

        db.clear_user_data().unwrap();

        assert!(store.get(EntityKind::Feed, &master.id).unwrap().is_some());
        assert!(store.get(EntityKind::Animal, &cow.id).unwrap().is_none());
        assert_eq!(queue.count().unwrap(), 0);
        assert_eq!(
            SettingsRepository::new(db.connection())
                .last_sync_time()
                .unwrap(),
            None
        );
    }
}
