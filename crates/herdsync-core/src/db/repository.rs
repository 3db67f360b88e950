//! Entity store implementation

use std::collections::HashSet;

use rusqlite::{params, Connection, OptionalExtension};

use super::parse_payload_column;
use crate::error::Result;
use crate::models::{EntityKind, EntityRecord};

/// Trait for local record storage operations
///
/// Every write is a single-row upsert of the whole record, so a reader never
/// observes a half-applied revision. Read methods never return tombstoned
/// records.
pub trait EntityStore {
    /// Get a visible record by kind and id
    fn get(&self, kind: EntityKind, id: &str) -> Result<Option<EntityRecord>>;

    /// Insert or replace a record
    fn put(&self, record: &EntityRecord) -> Result<()>;

    /// Insert or replace many records of one kind
    fn bulk_put(&self, kind: EntityKind, records: &[EntityRecord]) -> Result<usize>;

    /// Hard-remove a record
    fn delete(&self, kind: EntityKind, id: &str) -> Result<bool>;

    /// Visible records of a kind matching `predicate`
    fn query(
        &self,
        kind: EntityKind,
        predicate: &dyn Fn(&EntityRecord) -> bool,
    ) -> Result<Vec<EntityRecord>>;

    /// All visible records of a kind, most recently updated first
    fn list(&self, kind: EntityKind) -> Result<Vec<EntityRecord>>;

    /// Empty every entity table except shared reference data
    fn clear(&self) -> Result<()>;
}

/// `SQLite` implementation of `EntityStore`
pub struct SqliteEntityStore<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteEntityStore<'a> {
    /// Create a new store with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Get a record even when tombstoned (sync internals only)
    pub fn get_including_deleted(&self, kind: EntityKind, id: &str) -> Result<Option<EntityRecord>> {
        let sql = format!(
            "SELECT id, data, updated_at, synced, deleted FROM {} WHERE id = ?1",
            kind.table()
        );
        let record = self
            .conn
            .query_row(&sql, params![id], |row| Self::parse_record(kind, row))
            .optional()?;
        Ok(record)
    }

    /// Flip the synced flag after the authority accepted the revision,
    /// adopting the authority's timestamp when it reported one
    pub fn mark_synced(
        &self,
        kind: EntityKind,
        id: &str,
        remote_updated_at: Option<i64>,
    ) -> Result<bool> {
        let sql = format!(
            "UPDATE {} SET synced = 1, ever_synced = 1, updated_at = COALESCE(?2, updated_at)
             WHERE id = ?1",
            kind.table()
        );
        let rows = self.conn.execute(&sql, params![id, remote_updated_at])?;
        Ok(rows > 0)
    }

    /// Record that the authority holds the entity while a newer local
    /// revision is still pending
    pub fn mark_ever_synced(&self, kind: EntityKind, id: &str) -> Result<bool> {
        let sql = format!("UPDATE {} SET ever_synced = 1 WHERE id = ?1", kind.table());
        let rows = self.conn.execute(&sql, params![id])?;
        Ok(rows > 0)
    }

    /// Whether the authority has ever accepted any revision of this record
    pub fn was_ever_synced(&self, kind: EntityKind, id: &str) -> Result<bool> {
        let sql = format!(
            "SELECT COALESCE(MAX(ever_synced), 0) FROM {} WHERE id = ?1",
            kind.table()
        );
        let flag: i64 = self.conn.query_row(&sql, params![id], |row| row.get(0))?;
        Ok(flag != 0)
    }

    /// Number of visible records with local changes not yet accepted
    pub fn count_unsynced(&self, kind: EntityKind) -> Result<usize> {
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE synced = 0 AND deleted = 0",
            kind.table()
        );
        let count: i64 = self.conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    /// Replace the table's user records with the authority's records, keeping
    /// any record listed in `keep` (records with pending local mutations).
    /// Reference rows are left alone.
    pub fn replace_with_remote(
        &self,
        kind: EntityKind,
        records: &[EntityRecord],
        keep: &HashSet<String>,
    ) -> Result<usize> {
        let existing = self.ids(kind)?;
        let delete_sql = format!("DELETE FROM {} WHERE id = ?1", kind.table());
        for id in existing.iter().filter(|id| !keep.contains(*id)) {
            self.conn.execute(&delete_sql, params![id])?;
        }

        let incoming: Vec<EntityRecord> = records
            .iter()
            .filter(|record| !keep.contains(&record.id))
            .cloned()
            .collect();
        self.bulk_put(kind, &incoming)
    }

    /// Move a record to the id the authority assigned on create
    pub fn remap_id(&self, kind: EntityKind, old_id: &str, new_id: &str) -> Result<bool> {
        let table = kind.table();
        self.conn.execute(
            &format!("DELETE FROM {table} WHERE id = ?2 AND EXISTS (SELECT 1 FROM {table} WHERE id = ?1)"),
            params![old_id, new_id],
        )?;
        let rows = self.conn.execute(
            &format!("UPDATE {table} SET id = ?2, data = json_set(data, '$.id', ?2) WHERE id = ?1"),
            params![old_id, new_id],
        )?;
        Ok(rows > 0)
    }

    /// Ids of user records (reference rows excluded)
    fn ids(&self, kind: EntityKind) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT id FROM {} WHERE is_reference = 0",
            kind.table()
        ))?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(ids)
    }

    /// Parse a record from a database row
    fn parse_record(kind: EntityKind, row: &rusqlite::Row<'_>) -> rusqlite::Result<EntityRecord> {
        let data: String = row.get(1)?;
        Ok(EntityRecord {
            id: row.get(0)?,
            kind,
            data: parse_payload_column(1, &data)?,
            updated_at: row.get(2)?,
            synced: row.get::<_, i32>(3)? != 0,
            deleted: row.get::<_, i32>(4)? != 0,
        })
    }

    fn write(&self, record: &EntityRecord) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (id, data, updated_at, synced, deleted, ever_synced, is_reference)
             VALUES (?1, ?2, ?3, ?4, ?5, ?4, ?6)
             ON CONFLICT(id) DO UPDATE SET
                data = excluded.data,
                updated_at = excluded.updated_at,
                synced = excluded.synced,
                deleted = excluded.deleted,
                ever_synced = MAX(ever_synced, excluded.ever_synced),
                is_reference = excluded.is_reference",
            record.kind.table()
        );
        let data = serde_json::to_string(&record.data)?;
        self.conn.execute(
            &sql,
            params![
                record.id,
                data,
                record.updated_at,
                i32::from(record.synced),
                i32::from(record.deleted),
                i32::from(record.is_reference()),
            ],
        )?;
        Ok(())
    }
}

impl EntityStore for SqliteEntityStore<'_> {
    fn get(&self, kind: EntityKind, id: &str) -> Result<Option<EntityRecord>> {
        Ok(self
            .get_including_deleted(kind, id)?
            .filter(|record| !record.deleted))
    }

    fn put(&self, record: &EntityRecord) -> Result<()> {
        self.write(record)
    }

    fn bulk_put(&self, kind: EntityKind, records: &[EntityRecord]) -> Result<usize> {
        // Batch in one transaction unless the caller already opened one
        let tx = if self.conn.is_autocommit() {
            Some(self.conn.unchecked_transaction()?)
        } else {
            None
        };

        for record in records {
            if record.kind != kind {
                return Err(crate::Error::InvalidInput(format!(
                    "cannot store {} record {} in {kind}",
                    record.kind, record.id
                )));
            }
            self.write(record)?;
        }

        if let Some(tx) = tx {
            tx.commit()?;
        }
        Ok(records.len())
    }

    fn delete(&self, kind: EntityKind, id: &str) -> Result<bool> {
        let sql = format!("DELETE FROM {} WHERE id = ?1", kind.table());
        let rows = self.conn.execute(&sql, params![id])?;
        Ok(rows > 0)
    }

    fn query(
        &self,
        kind: EntityKind,
        predicate: &dyn Fn(&EntityRecord) -> bool,
    ) -> Result<Vec<EntityRecord>> {
        Ok(self
            .list(kind)?
            .into_iter()
            .filter(|record| predicate(record))
            .collect())
    }

    fn list(&self, kind: EntityKind) -> Result<Vec<EntityRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT id, data, updated_at, synced, deleted
             FROM {}
             WHERE deleted = 0
             ORDER BY updated_at DESC, id ASC",
            kind.table()
        ))?;

        let records = stmt
            .query_map([], |row| Self::parse_record(kind, row))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(records)
    }

    fn clear(&self) -> Result<()> {
        for kind in EntityKind::ALL {
            let sql = if kind.has_reference_data() {
                format!("DELETE FROM {} WHERE is_reference = 0", kind.table())
            } else {
                format!("DELETE FROM {}", kind.table())
            };
            self.conn.execute(&sql, [])?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::test_support::payload;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn setup() -> Database {
        Database::open_in_memory().unwrap()
    }

    fn animal(name: &str) -> EntityRecord {
        EntityRecord::new_local(EntityKind::Animal, payload(json!({ "name": name })))
    }

    #[test]
    fn test_put_and_get() {
        let db = setup();
        let store = SqliteEntityStore::new(db.connection());

        let record = animal("Bessie");
        store.put(&record).unwrap();

        let fetched = store.get(EntityKind::Animal, &record.id).unwrap().unwrap();
        assert_eq!(fetched, record);
        assert!(store.get(EntityKind::Feed, &record.id).unwrap().is_none());
    }

    #[test]
    fn test_put_replaces_whole_record() {
        let db = setup();
        let store = SqliteEntityStore::new(db.connection());

        let mut record = animal("Bessie");
        store.put(&record).unwrap();

        record.data = payload(json!({ "id": record.id, "name": "Daisy" }));
        record.synced = true;
        store.put(&record).unwrap();

        let fetched = store.get(EntityKind::Animal, &record.id).unwrap().unwrap();
        assert_eq!(fetched.data, record.data);
        assert!(fetched.synced);
    }

    #[test]
    fn test_deleted_records_are_hidden() {
        let db = setup();
        let store = SqliteEntityStore::new(db.connection());

        let mut record = animal("Ghost");
        record.deleted = true;
        store.put(&record).unwrap();

        assert!(store.get(EntityKind::Animal, &record.id).unwrap().is_none());
        assert!(store.list(EntityKind::Animal).unwrap().is_empty());
        assert!(store
            .query(EntityKind::Animal, &|_| true)
            .unwrap()
            .is_empty());
        assert!(store
            .get_including_deleted(EntityKind::Animal, &record.id)
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_bulk_put_and_query() {
        let db = setup();
        let store = SqliteEntityStore::new(db.connection());

        let records = vec![animal("Bessie"), animal("Daisy"), animal("Gauri")];
        assert_eq!(store.bulk_put(EntityKind::Animal, &records).unwrap(), 3);

        let starts_with_d = store
            .query(EntityKind::Animal, &|record| {
                record.data["name"].as_str().is_some_and(|name| name.starts_with('D'))
            })
            .unwrap();
        assert_eq!(starts_with_d.len(), 1);
        assert_eq!(starts_with_d[0].data["name"], json!("Daisy"));
    }

    #[test]
    fn test_bulk_put_rejects_mixed_kinds() {
        let db = setup();
        let store = SqliteEntityStore::new(db.connection());

        let feed = EntityRecord::new_local(EntityKind::Feed, payload(json!({})));
        assert!(store.bulk_put(EntityKind::Animal, &[animal("A"), feed]).is_err());
        // The failed batch rolled back
        assert!(store.list(EntityKind::Animal).unwrap().is_empty());
    }

    #[test]
    fn test_delete_is_hard_remove() {
        let db = setup();
        let store = SqliteEntityStore::new(db.connection());

        let record = animal("Bessie");
        store.put(&record).unwrap();
        assert!(store.delete(EntityKind::Animal, &record.id).unwrap());
        assert!(store
            .get_including_deleted(EntityKind::Animal, &record.id)
            .unwrap()
            .is_none());
        assert!(!store.delete(EntityKind::Animal, &record.id).unwrap());
    }

    #[test]
    fn test_ever_synced_survives_local_edits() {
        let db = setup();
        let store = SqliteEntityStore::new(db.connection());

        let mut record = animal("Bessie");
        store.put(&record).unwrap();
        assert!(!store.was_ever_synced(EntityKind::Animal, &record.id).unwrap());

        store.mark_synced(EntityKind::Animal, &record.id, Some(99)).unwrap();
        assert_eq!(
            store.get(EntityKind::Animal, &record.id).unwrap().unwrap().updated_at,
            99
        );
        record.synced = false;
        store.put(&record).unwrap();

        assert!(store.was_ever_synced(EntityKind::Animal, &record.id).unwrap());
        assert_eq!(store.count_unsynced(EntityKind::Animal).unwrap(), 1);
        assert!(!store.was_ever_synced(EntityKind::Animal, "missing").unwrap());
    }

    #[test]
    fn test_clear_keeps_master_feeds() {
        let db = setup();
        let store = SqliteEntityStore::new(db.connection());

        let master = EntityRecord::new_local(
            EntityKind::Feed,
            payload(json!({ "name": "Maize silage", "is_custom": false })),
        );
        let custom = EntityRecord::new_local(
            EntityKind::Feed,
            payload(json!({ "name": "My mix", "is_custom": true })),
        );
        store.put(&master).unwrap();
        store.put(&custom).unwrap();
        store.put(&animal("Bessie")).unwrap();

        store.clear().unwrap();

        let feeds = store.list(EntityKind::Feed).unwrap();
        assert_eq!(feeds.len(), 1);
        assert_eq!(feeds[0].id, master.id);
        assert!(store.list(EntityKind::Animal).unwrap().is_empty());
    }

    #[test]
    fn test_replace_with_remote_keeps_pending_records() {
        let db = setup();
        let store = SqliteEntityStore::new(db.connection());

        let pending = animal("Local edit");
        let stale = animal("Stale");
        store.put(&pending).unwrap();
        store.put(&stale).unwrap();

        let remote = EntityRecord::from_remote(
            EntityKind::Animal,
            payload(json!({ "id": "srv-1", "name": "Server", "updated_at": 10 })),
        )
        .unwrap();
        let keep = HashSet::from([pending.id.clone()]);
        store
            .replace_with_remote(EntityKind::Animal, &[remote], &keep)
            .unwrap();

        let mut ids: Vec<String> = store
            .list(EntityKind::Animal)
            .unwrap()
            .into_iter()
            .map(|record| record.id)
            .collect();
        ids.sort();
        let mut expected = vec![pending.id, "srv-1".to_string()];
        expected.sort();
        assert_eq!(ids, expected);
    }

    #[test]
    fn test_remap_id_moves_record() {
        let db = setup();
        let store = SqliteEntityStore::new(db.connection());

        let record = animal("Bessie");
        store.put(&record).unwrap();
        store.mark_ever_synced(EntityKind::Animal, &record.id).unwrap();
        assert!(store.remap_id(EntityKind::Animal, &record.id, "srv-9").unwrap());

        assert!(store.get(EntityKind::Animal, &record.id).unwrap().is_none());
        let moved = store.get(EntityKind::Animal, "srv-9").unwrap().unwrap();
        assert_eq!(moved.data["id"], json!("srv-9"));
        assert_eq!(moved.data["name"], json!("Bessie"));
        assert!(!moved.synced);
        assert!(store.was_ever_synced(EntityKind::Animal, "srv-9").unwrap());
        assert!(!store.remap_id(EntityKind::Animal, "missing", "srv-10").unwrap());
    }
}
