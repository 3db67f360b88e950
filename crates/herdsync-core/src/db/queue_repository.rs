//! Mutation queue repository

use std::collections::HashSet;

use rusqlite::{params, Connection, OptionalExtension};

use super::{parse_payload_column, parse_text_column, SqliteEntityStore};
use crate::error::Result;
use crate::models::{
    merge_payload, EnqueueOutcome, EntityKind, MutationOp, Payload, QueueItem, SettleOutcome,
};

const ITEM_COLUMNS: &str = "id, entity_kind, entity_id, operation, payload, enqueued_at,
    base_updated_at, revision, retry_count, last_error, rejected";

/// Durable, coalescing queue of pending mutations
pub struct QueueRepository<'a> {
    conn: &'a Connection,
}

impl<'a> QueueRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Queue a mutation, coalescing it with any pending item for the same
    /// entity.
    ///
    /// - an update merges into a pending create or update
    /// - a delete cancels a pending create outright, replaces a pending
    ///   update, and is otherwise queued only if the authority ever accepted
    ///   the entity
    pub fn enqueue(
        &self,
        kind: EntityKind,
        entity_id: &str,
        operation: MutationOp,
        payload: Payload,
    ) -> Result<EnqueueOutcome> {
        let pending = self.find(kind, entity_id)?;
        let pending_op = |op: MutationOp| pending.iter().find(|item| item.operation == op);

        match operation {
            MutationOp::Create => {
                if let Some(create) = pending_op(MutationOp::Create) {
                    self.merge_into(create, payload)?;
                    return Ok(EnqueueOutcome::Merged(create.id));
                }
                let id = self.insert(kind, entity_id, operation, &payload, None)?;
                Ok(EnqueueOutcome::Queued(id))
            }
            MutationOp::Update => {
                if let Some(item) =
                    pending_op(MutationOp::Create).or_else(|| pending_op(MutationOp::Update))
                {
                    self.merge_into(item, payload)?;
                    return Ok(EnqueueOutcome::Merged(item.id));
                }
                let base = SqliteEntityStore::new(self.conn)
                    .get_including_deleted(kind, entity_id)?
                    .map(|record| record.updated_at);
                let id = self.insert(kind, entity_id, operation, &payload, base)?;
                Ok(EnqueueOutcome::Queued(id))
            }
            MutationOp::Delete => {
                if pending_op(MutationOp::Create).is_some() {
                    self.remove_for_entity(kind, entity_id)?;
                    tracing::debug!("Delete cancelled pending create for {kind} {entity_id}");
                    return Ok(EnqueueOutcome::Cancelled);
                }
                if let Some(update) = pending_op(MutationOp::Update) {
                    self.replace_with_delete(update)?;
                    return Ok(EnqueueOutcome::Queued(update.id));
                }
                if let Some(delete) = pending_op(MutationOp::Delete) {
                    return Ok(EnqueueOutcome::Merged(delete.id));
                }
                if SqliteEntityStore::new(self.conn).was_ever_synced(kind, entity_id)? {
                    let id = self.insert(kind, entity_id, operation, &Payload::new(), None)?;
                    Ok(EnqueueOutcome::Queued(id))
                } else {
                    Ok(EnqueueOutcome::Skipped)
                }
            }
        }
    }

    /// Append a delete without coalescing (used when a create finished
    /// pushing after the entity was deleted locally)
    pub fn enqueue_orphan_delete(&self, kind: EntityKind, entity_id: &str) -> Result<i64> {
        self.insert(kind, entity_id, MutationOp::Delete, &Payload::new(), None)
    }

    /// All pending items in enqueue order
    pub fn list(&self) -> Result<Vec<QueueItem>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ITEM_COLUMNS} FROM sync_queue ORDER BY enqueued_at ASC, id ASC"
        ))?;
        let items = stmt
            .query_map([], Self::parse_item)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(items)
    }

    /// Get a single item
    pub fn get(&self, item_id: i64) -> Result<Option<QueueItem>> {
        let item = self
            .conn
            .query_row(
                &format!("SELECT {ITEM_COLUMNS} FROM sync_queue WHERE id = ?1"),
                params![item_id],
                Self::parse_item,
            )
            .optional()?;
        Ok(item)
    }

    /// Pending items for one entity, in enqueue order
    pub fn find(&self, kind: EntityKind, entity_id: &str) -> Result<Vec<QueueItem>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ITEM_COLUMNS} FROM sync_queue
             WHERE entity_kind = ?1 AND entity_id = ?2
             ORDER BY enqueued_at ASC, id ASC"
        ))?;
        let items = stmt
            .query_map(params![kind.as_str(), entity_id], Self::parse_item)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(items)
    }

    /// Ids of entities of `kind` with at least one pending item
    pub fn pending_entity_ids(&self, kind: EntityKind) -> Result<HashSet<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT entity_id FROM sync_queue WHERE entity_kind = ?1")?;
        let ids = stmt
            .query_map(params![kind.as_str()], |row| row.get(0))?
            .collect::<rusqlite::Result<HashSet<String>>>()?;
        Ok(ids)
    }

    /// Remove an item
    pub fn remove(&self, item_id: i64) -> Result<bool> {
        let rows = self
            .conn
            .execute("DELETE FROM sync_queue WHERE id = ?1", params![item_id])?;
        Ok(rows > 0)
    }

    /// Remove every item for one entity
    pub fn remove_for_entity(&self, kind: EntityKind, entity_id: &str) -> Result<usize> {
        let rows = self.conn.execute(
            "DELETE FROM sync_queue WHERE entity_kind = ?1 AND entity_id = ?2",
            params![kind.as_str(), entity_id],
        )?;
        Ok(rows)
    }

    /// Record a retriable failure and return the new retry count
    pub fn increment_retry(&self, item_id: i64, error: &str) -> Result<u32> {
        let count = self
            .conn
            .query_row(
                "UPDATE sync_queue
                 SET retry_count = retry_count + 1, last_error = ?2
                 WHERE id = ?1
                 RETURNING retry_count",
                params![item_id, error],
                |row| row.get(0),
            )
            .optional()?;
        count.ok_or_else(|| crate::Error::NotFound(format!("queue item {item_id}")))
    }

    /// Park an item the authority rejected with a client error
    pub fn mark_rejected(&self, item_id: i64, error: &str) -> Result<()> {
        let rows = self.conn.execute(
            "UPDATE sync_queue SET rejected = 1, last_error = ?2 WHERE id = ?1",
            params![item_id, error],
        )?;
        if rows == 0 {
            return Err(crate::Error::NotFound(format!("queue item {item_id}")));
        }
        Ok(())
    }

    /// Make a parked item eligible for the next drain again
    pub fn reset(&self, item_id: i64) -> Result<bool> {
        let rows = self.conn.execute(
            "UPDATE sync_queue SET retry_count = 0, rejected = 0, last_error = NULL WHERE id = ?1",
            params![item_id],
        )?;
        Ok(rows > 0)
    }

    /// Settle an item whose push the authority accepted.
    ///
    /// The item is removed only if nothing was merged into it while the
    /// push was in flight; otherwise it stays queued with the merged payload,
    /// rebased on `remote_updated_at`.
    pub fn settle_pushed(
        &self,
        item: &QueueItem,
        remote_updated_at: Option<i64>,
    ) -> Result<SettleOutcome> {
        let current: Option<(i64, String)> = self
            .conn
            .query_row(
                "SELECT revision, operation FROM sync_queue WHERE id = ?1",
                params![item.id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((revision, operation)) = current else {
            return Ok(SettleOutcome::Gone);
        };

        if revision == item.revision {
            self.remove(item.id)?;
            return Ok(SettleOutcome::Removed);
        }

        // The pushed create already exists remotely; the merged fields go as an update
        let outcome = if operation == MutationOp::Create.as_str() {
            SettleOutcome::Rebased
        } else {
            SettleOutcome::Retained
        };
        self.conn.execute(
            "UPDATE sync_queue
             SET operation = CASE operation WHEN 'create' THEN 'update' ELSE operation END,
                 base_updated_at = ?2
             WHERE id = ?1",
            params![item.id, remote_updated_at],
        )?;
        Ok(outcome)
    }

    /// Replace the base timestamp the conflict check compares against
    pub fn rebase(&self, item_id: i64, base_updated_at: Option<i64>) -> Result<()> {
        self.conn.execute(
            "UPDATE sync_queue SET base_updated_at = ?2 WHERE id = ?1",
            params![item_id, base_updated_at],
        )?;
        Ok(())
    }

    /// Point pending items at the id the authority assigned
    pub fn remap_entity(&self, kind: EntityKind, old_id: &str, new_id: &str) -> Result<usize> {
        let rows = self.conn.execute(
            "UPDATE sync_queue SET entity_id = ?3 WHERE entity_kind = ?1 AND entity_id = ?2",
            params![kind.as_str(), old_id, new_id],
        )?;
        Ok(rows)
    }

    /// Number of pending items
    pub fn count(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM sync_queue", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    /// Number of items parked for manual attention
    pub fn count_needing_attention(&self, max_retries: u32) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sync_queue WHERE rejected = 1 OR retry_count >= ?1",
            params![max_retries],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    /// Drop every pending item (logout only)
    pub fn clear(&self) -> Result<()> {
        self.conn.execute("DELETE FROM sync_queue", [])?;
        Ok(())
    }

    fn insert(
        &self,
        kind: EntityKind,
        entity_id: &str,
        operation: MutationOp,
        payload: &Payload,
        base_updated_at: Option<i64>,
    ) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO sync_queue (entity_kind, entity_id, operation, payload, enqueued_at, base_updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                kind.as_str(),
                entity_id,
                operation.as_str(),
                serde_json::to_string(payload)?,
                crate::util::now_millis(),
                base_updated_at,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Merge a payload into an existing item. A fresh edit also clears any
    /// parked state so the corrected mutation gets another attempt.
    fn merge_into(&self, item: &QueueItem, patch: Payload) -> Result<()> {
        let mut payload = item.payload.clone();
        merge_payload(&mut payload, patch);
        self.conn.execute(
            "UPDATE sync_queue
             SET payload = ?2, revision = revision + 1,
                 retry_count = 0, rejected = 0, last_error = NULL
             WHERE id = ?1",
            params![item.id, serde_json::to_string(&payload)?],
        )?;
        Ok(())
    }

    fn replace_with_delete(&self, item: &QueueItem) -> Result<()> {
        self.conn.execute(
            "UPDATE sync_queue
             SET operation = 'delete', payload = '{}', revision = revision + 1,
                 retry_count = 0, rejected = 0, last_error = NULL
             WHERE id = ?1",
            params![item.id],
        )?;
        Ok(())
    }

    fn parse_item(row: &rusqlite::Row<'_>) -> rusqlite::Result<QueueItem> {
        let kind: String = row.get(1)?;
        let operation: String = row.get(3)?;
        let payload: String = row.get(4)?;
        Ok(QueueItem {
            id: row.get(0)?,
            entity_kind: parse_text_column(1, &kind)?,
            entity_id: row.get(2)?,
            operation: parse_text_column(3, &operation)?,
            payload: parse_payload_column(4, &payload)?,
            enqueued_at: row.get(5)?,
            base_updated_at: row.get(6)?,
            revision: row.get(7)?,
            retry_count: row.get(8)?,
            last_error: row.get(9)?,
            rejected: row.get::<_, i32>(10)? != 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Database, EntityStore};
    use crate::models::EntityRecord;
    use crate::test_support::payload;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};

    fn setup() -> Database {
        Database::open_in_memory().unwrap()
    }

    #[test]
    fn test_list_is_in_enqueue_order() {
        let db = setup();
        let queue = QueueRepository::new(db.connection());

        for id in ["a", "b", "c"] {
            queue
                .enqueue(EntityKind::Animal, id, MutationOp::Create, Payload::new())
                .unwrap();
        }

        let ids: Vec<String> = queue
            .list()
            .unwrap()
            .into_iter()
            .map(|item| item.entity_id)
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_updates_coalesce_into_one_item() {
        let db = setup();
        let store = SqliteEntityStore::new(db.connection());
        let queue = QueueRepository::new(db.connection());

        let mut record =
            EntityRecord::new_local(EntityKind::Animal, payload(json!({"id": "cow-1"})));
        record.synced = true;
        store.put(&record).unwrap();

        let patches = [
            json!({"name": "Bessie", "weight_kg": 400}),
            json!({"weight_kg": 410, "breed": "Gir"}),
            json!({"notes": "calm", "weight_kg": 415}),
        ];
        for patch in patches {
            queue
                .enqueue(EntityKind::Animal, "cow-1", MutationOp::Update, payload(patch))
                .unwrap();
        }

        let items = queue.list().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].operation, MutationOp::Update);
        assert_eq!(items[0].revision, 2);
        assert_eq!(items[0].base_updated_at, Some(record.updated_at));
        assert_eq!(
            Value::Object(items[0].payload.clone()),
            json!({"name": "Bessie", "weight_kg": 415, "breed": "Gir", "notes": "calm"})
        );
    }

    #[test]
    fn test_update_merges_into_pending_create() {
        let db = setup();
        let queue = QueueRepository::new(db.connection());

        let created = queue
            .enqueue(
                EntityKind::Animal,
                "cow-1",
                MutationOp::Create,
                payload(json!({"name": "Bessie"})),
            )
            .unwrap();
        let merged = queue
            .enqueue(
                EntityKind::Animal,
                "cow-1",
                MutationOp::Update,
                payload(json!({"breed": "Gir"})),
            )
            .unwrap();

        let EnqueueOutcome::Queued(id) = created else {
            panic!("expected queued create");
        };
        assert_eq!(merged, EnqueueOutcome::Merged(id));

        let items = queue.list().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].operation, MutationOp::Create);
        assert_eq!(
            Value::Object(items[0].payload.clone()),
            json!({"name": "Bessie", "breed": "Gir"})
        );
    }

    #[test]
    fn test_delete_cancels_pending_create() {
        let db = setup();
        let queue = QueueRepository::new(db.connection());

        queue
            .enqueue(EntityKind::Animal, "cow-1", MutationOp::Create, Payload::new())
            .unwrap();
        queue
            .enqueue(EntityKind::Animal, "cow-1", MutationOp::Update, Payload::new())
            .unwrap();
        let outcome = queue
            .enqueue(EntityKind::Animal, "cow-1", MutationOp::Delete, Payload::new())
            .unwrap();

        assert_eq!(outcome, EnqueueOutcome::Cancelled);
        assert_eq!(queue.count().unwrap(), 0);
    }

    #[test]
    fn test_delete_replaces_pending_update_in_place() {
        let db = setup();
        let queue = QueueRepository::new(db.connection());

        queue
            .enqueue(EntityKind::Animal, "first", MutationOp::Create, Payload::new())
            .unwrap();
        let EnqueueOutcome::Queued(update_id) = queue
            .enqueue(
                EntityKind::Animal,
                "cow-1",
                MutationOp::Update,
                payload(json!({"name": "x"})),
            )
            .unwrap()
        else {
            panic!("expected queued update");
        };
        queue
            .enqueue(EntityKind::Animal, "last", MutationOp::Create, Payload::new())
            .unwrap();

        let outcome = queue
            .enqueue(EntityKind::Animal, "cow-1", MutationOp::Delete, Payload::new())
            .unwrap();
        assert_eq!(outcome, EnqueueOutcome::Queued(update_id));

        let items = queue.list().unwrap();
        assert_eq!(items.len(), 3);
        assert_eq!(items[1].entity_id, "cow-1");
        assert_eq!(items[1].operation, MutationOp::Delete);
        assert!(items[1].payload.is_empty());
    }

    #[test]
    fn test_delete_of_never_synced_entity_is_skipped() {
        let db = setup();
        let store = SqliteEntityStore::new(db.connection());
        let queue = QueueRepository::new(db.connection());

        let record = EntityRecord::new_local(EntityKind::Feed, payload(json!({"id": "f1"})));
        store.put(&record).unwrap();
        let outcome = queue
            .enqueue(EntityKind::Feed, "f1", MutationOp::Delete, Payload::new())
            .unwrap();
        assert_eq!(outcome, EnqueueOutcome::Skipped);

        store.mark_synced(EntityKind::Feed, "f1", None).unwrap();
        let outcome = queue
            .enqueue(EntityKind::Feed, "f1", MutationOp::Delete, Payload::new())
            .unwrap();
        assert!(matches!(outcome, EnqueueOutcome::Queued(_)));

        // A second delete does not duplicate the item
        let again = queue
            .enqueue(EntityKind::Feed, "f1", MutationOp::Delete, Payload::new())
            .unwrap();
        assert!(matches!(again, EnqueueOutcome::Merged(_)));
        assert_eq!(queue.count().unwrap(), 1);
    }

    #[test]
    fn test_retry_and_attention_tracking() {
        let db = setup();
        let queue = QueueRepository::new(db.connection());

        let EnqueueOutcome::Queued(id) = queue
            .enqueue(EntityKind::MilkLog, "m1", MutationOp::Create, Payload::new())
            .unwrap()
        else {
            panic!("expected queued create");
        };

        for expected in 1..=5 {
            assert_eq!(queue.increment_retry(id, "offline").unwrap(), expected);
        }
        assert_eq!(queue.count_needing_attention(5).unwrap(), 1);
        let item = queue.get(id).unwrap().unwrap();
        assert_eq!(item.last_error.as_deref(), Some("offline"));

        assert!(queue.reset(id).unwrap());
        assert_eq!(queue.count_needing_attention(5).unwrap(), 0);

        queue.mark_rejected(id, "422 invalid").unwrap();
        assert!(queue.get(id).unwrap().unwrap().rejected);
        assert!(queue.increment_retry(999, "x").is_err());
    }

    #[test]
    fn test_merge_clears_rejection() {
        let db = setup();
        let queue = QueueRepository::new(db.connection());

        let EnqueueOutcome::Queued(id) = queue
            .enqueue(
                EntityKind::Animal,
                "cow-1",
                MutationOp::Create,
                payload(json!({"weight_kg": -1})),
            )
            .unwrap()
        else {
            panic!("expected queued create");
        };
        queue.mark_rejected(id, "weight must be positive").unwrap();

        queue
            .enqueue(
                EntityKind::Animal,
                "cow-1",
                MutationOp::Update,
                payload(json!({"weight_kg": 380})),
            )
            .unwrap();

        let item = queue.get(id).unwrap().unwrap();
        assert!(!item.rejected);
        assert_eq!(item.last_error, None);
        assert_eq!(item.payload["weight_kg"], json!(380));
    }

    #[test]
    fn test_settle_pushed_respects_in_flight_merges() {
        let db = setup();
        let queue = QueueRepository::new(db.connection());

        queue
            .enqueue(
                EntityKind::Animal,
                "cow-1",
                MutationOp::Create,
                payload(json!({"name": "A"})),
            )
            .unwrap();
        let snapshot = queue.list().unwrap().remove(0);

        // Edit lands while the create is on the wire
        queue
            .enqueue(
                EntityKind::Animal,
                "cow-1",
                MutationOp::Update,
                payload(json!({"name": "B"})),
            )
            .unwrap();

        assert_eq!(
            queue.settle_pushed(&snapshot, Some(77)).unwrap(),
            SettleOutcome::Rebased
        );
        let item = queue.get(snapshot.id).unwrap().unwrap();
        assert_eq!(item.operation, MutationOp::Update);
        assert_eq!(item.base_updated_at, Some(77));
        assert_eq!(item.payload["name"], json!("B"));

        let snapshot = queue.get(snapshot.id).unwrap().unwrap();
        assert_eq!(
            queue.settle_pushed(&snapshot, None).unwrap(),
            SettleOutcome::Removed
        );
        assert_eq!(
            queue.settle_pushed(&snapshot, None).unwrap(),
            SettleOutcome::Gone
        );
    }

    #[test]
    fn test_pending_entity_ids_and_remap() {
        let db = setup();
        let queue = QueueRepository::new(db.connection());

        queue
            .enqueue(EntityKind::Animal, "local-1", MutationOp::Create, Payload::new())
            .unwrap();
        queue
            .enqueue(EntityKind::Feed, "feed-1", MutationOp::Create, Payload::new())
            .unwrap();

        assert_eq!(queue.remap_entity(EntityKind::Animal, "local-1", "srv-1").unwrap(), 1);
        let ids = queue.pending_entity_ids(EntityKind::Animal).unwrap();
        assert_eq!(ids, HashSet::from(["srv-1".to_string()]));
    }
}
