//! Database migrations
//!
//! Migrations are additive: each step only creates tables and indexes that
//! do not exist yet, so a database written by any earlier release opens
//! without data loss. Never edit a step once it has shipped; append a new
//! one instead.

use rusqlite::Connection;

use crate::error::Result;

/// Current schema version
pub const CURRENT_VERSION: i32 = 4;

/// One ordered, idempotent schema step
pub struct Migration {
    pub version: i32,
    pub description: &'static str,
    pub statements: &'static [&'static str],
}

/// Every migration in application order
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "herd records and mutation queue",
        statements: &[
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY
            )",
            "CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS animals (
                id TEXT PRIMARY KEY,
                data TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                synced INTEGER NOT NULL DEFAULT 0,
                deleted INTEGER NOT NULL DEFAULT 0,
                ever_synced INTEGER NOT NULL DEFAULT 0,
                is_reference INTEGER NOT NULL DEFAULT 0
            )",
            "CREATE INDEX IF NOT EXISTS idx_animals_synced ON animals(synced, deleted)",
            "CREATE TABLE IF NOT EXISTS feeds (
                id TEXT PRIMARY KEY,
                data TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                synced INTEGER NOT NULL DEFAULT 0,
                deleted INTEGER NOT NULL DEFAULT 0,
                ever_synced INTEGER NOT NULL DEFAULT 0,
                is_reference INTEGER NOT NULL DEFAULT 0
            )",
            "CREATE INDEX IF NOT EXISTS idx_feeds_synced ON feeds(synced, deleted)",
            "CREATE INDEX IF NOT EXISTS idx_feeds_reference ON feeds(is_reference)",
            "CREATE TABLE IF NOT EXISTS diet_plans (
                id TEXT PRIMARY KEY,
                data TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                synced INTEGER NOT NULL DEFAULT 0,
                deleted INTEGER NOT NULL DEFAULT 0,
                ever_synced INTEGER NOT NULL DEFAULT 0,
                is_reference INTEGER NOT NULL DEFAULT 0
            )",
            "CREATE INDEX IF NOT EXISTS idx_diet_plans_synced ON diet_plans(synced, deleted)",
            "CREATE TABLE IF NOT EXISTS milk_logs (
                id TEXT PRIMARY KEY,
                data TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                synced INTEGER NOT NULL DEFAULT 0,
                deleted INTEGER NOT NULL DEFAULT 0,
                ever_synced INTEGER NOT NULL DEFAULT 0,
                is_reference INTEGER NOT NULL DEFAULT 0
            )",
            "CREATE INDEX IF NOT EXISTS idx_milk_logs_synced ON milk_logs(synced, deleted)",
            "CREATE TABLE IF NOT EXISTS sync_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                entity_kind TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                operation TEXT NOT NULL,
                payload TEXT NOT NULL,
                enqueued_at INTEGER NOT NULL,
                base_updated_at INTEGER,
                revision INTEGER NOT NULL DEFAULT 0,
                retry_count INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                rejected INTEGER NOT NULL DEFAULT 0
            )",
            "CREATE INDEX IF NOT EXISTS idx_sync_queue_entity ON sync_queue(entity_kind, entity_id)",
            "CREATE INDEX IF NOT EXISTS idx_sync_queue_enqueued ON sync_queue(enqueued_at, id)",
        ],
    },
    Migration {
        version: 2,
        description: "extension-worker records",
        statements: &[
            "CREATE TABLE IF NOT EXISTS organizations (
                id TEXT PRIMARY KEY,
                data TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                synced INTEGER NOT NULL DEFAULT 0,
                deleted INTEGER NOT NULL DEFAULT 0,
                ever_synced INTEGER NOT NULL DEFAULT 0,
                is_reference INTEGER NOT NULL DEFAULT 0
            )",
            "CREATE INDEX IF NOT EXISTS idx_organizations_synced ON organizations(synced, deleted)",
            "CREATE TABLE IF NOT EXISTS farmer_profiles (
                id TEXT PRIMARY KEY,
                data TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                synced INTEGER NOT NULL DEFAULT 0,
                deleted INTEGER NOT NULL DEFAULT 0,
                ever_synced INTEGER NOT NULL DEFAULT 0,
                is_reference INTEGER NOT NULL DEFAULT 0
            )",
            "CREATE INDEX IF NOT EXISTS idx_farmer_profiles_synced ON farmer_profiles(synced, deleted)",
            "CREATE TABLE IF NOT EXISTS yield_samples (
                id TEXT PRIMARY KEY,
                data TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                synced INTEGER NOT NULL DEFAULT 0,
                deleted INTEGER NOT NULL DEFAULT 0,
                ever_synced INTEGER NOT NULL DEFAULT 0,
                is_reference INTEGER NOT NULL DEFAULT 0
            )",
            "CREATE INDEX IF NOT EXISTS idx_yield_samples_synced ON yield_samples(synced, deleted)",
        ],
    },
    Migration {
        version: 3,
        description: "conflict artifacts and sync history",
        statements: &[
            "CREATE TABLE IF NOT EXISTS sync_conflicts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                entity_kind TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                local_payload TEXT NOT NULL,
                remote_payload TEXT NOT NULL,
                local_updated_at INTEGER,
                remote_updated_at INTEGER NOT NULL,
                detected_at INTEGER NOT NULL,
                resolved INTEGER NOT NULL DEFAULT 0,
                resolution TEXT,
                resolved_at INTEGER
            )",
            "CREATE INDEX IF NOT EXISTS idx_sync_conflicts_entity ON sync_conflicts(entity_kind, entity_id)",
            "CREATE INDEX IF NOT EXISTS idx_sync_conflicts_resolved ON sync_conflicts(resolved, detected_at DESC)",
            "CREATE TABLE IF NOT EXISTS sync_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp INTEGER NOT NULL,
                operation TEXT NOT NULL,
                entity_kind TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                entity_label TEXT NOT NULL,
                action TEXT NOT NULL,
                outcome TEXT NOT NULL,
                error_message TEXT
            )",
            "CREATE INDEX IF NOT EXISTS idx_sync_history_timestamp ON sync_history(timestamp DESC)",
        ],
    },
    Migration {
        version: 4,
        description: "health events and request replay queue",
        statements: &[
            "CREATE TABLE IF NOT EXISTS health_events (
                id TEXT PRIMARY KEY,
                data TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                synced INTEGER NOT NULL DEFAULT 0,
                deleted INTEGER NOT NULL DEFAULT 0,
                ever_synced INTEGER NOT NULL DEFAULT 0,
                is_reference INTEGER NOT NULL DEFAULT 0
            )",
            "CREATE INDEX IF NOT EXISTS idx_health_events_synced ON health_events(synced, deleted)",
            "CREATE TABLE IF NOT EXISTS replay_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                method TEXT NOT NULL,
                url TEXT NOT NULL,
                headers TEXT NOT NULL,
                body BLOB,
                enqueued_at INTEGER NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT
            )",
            "CREATE INDEX IF NOT EXISTS idx_replay_queue_enqueued ON replay_queue(enqueued_at, id)",
        ],
    },
];

/// Run all pending migrations
pub fn run(conn: &Connection) -> Result<()> {
    run_up_to(conn, CURRENT_VERSION)
}

/// Run pending migrations up to and including `target`
pub(crate) fn run_up_to(conn: &Connection, target: i32) -> Result<()> {
    let version = current_version(conn)?;

    for migration in MIGRATIONS
        .iter()
        .filter(|migration| migration.version > version && migration.version <= target)
    {
        apply(conn, migration)?;
    }

    Ok(())
}

/// Get the current schema version
pub fn current_version(conn: &Connection) -> Result<i32> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
        [],
        |row| row.get(0),
    )?;

    if !exists {
        return Ok(0);
    }

    let version = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;

    Ok(version)
}

fn apply(conn: &Connection, migration: &Migration) -> Result<()> {
    // Dropping the transaction without commit rolls the step back
    let tx = conn.unchecked_transaction()?;
    for statement in migration.statements {
        tx.execute_batch(statement)?;
    }
    tx.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        [migration.version],
    )?;
    tx.commit()?;

    tracing::info!(
        "Migrated local store to version {} ({})",
        migration.version,
        migration.description
    );
    Ok(())
}
