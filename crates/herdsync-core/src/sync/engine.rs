//! Sync orchestrator.
//!
//! Local writes land in the store and the mutation queue in one transaction
//! and are visible immediately. A drain cycle then pushes queued mutations to
//! the authority in enqueue order. The database lock is never held while a
//! request is in flight.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rusqlite::Connection;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use super::authority::{Authority, AuthorityError, FailureKind};
use super::conflict::{self, ConflictCheck};
use super::connectivity::{BackgroundTasks, Connectivity};
use crate::config::EngineConfig;
use crate::db::{
    ConflictRepository, Database, EntityStore, HistoryRepository, QueueRepository,
    SettingsRepository, SharedDatabase, SqliteEntityStore,
};
use crate::error::{Error, Result};
use crate::models::{
    merge_payload, payload_id, payload_label, remote_updated_at, ConflictArtifact, EnqueueOutcome,
    EntityKind, EntityRecord, HistoryEntry, MutationOp, Payload, QueueItem, SettleOutcome,
    SyncDirection, SyncOutcome,
};
use crate::state::SyncStatus;
use crate::util::now_millis;

/// Totals for one `sync_now` call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub pushed: usize,
    pub conflicts: usize,
    pub failed: usize,
    /// Items parked for attention, or removed before their turn
    pub skipped: usize,
    pub last_error: Option<String>,
}

impl DrainReport {
    fn absorb(&mut self, pass: Self) {
        self.pushed += pass.pushed;
        self.conflicts += pass.conflicts;
        self.failed += pass.failed;
        self.skipped += pass.skipped;
        if pass.last_error.is_some() {
            self.last_error = pass.last_error;
        }
    }
}

enum ItemOutcome {
    Pushed,
    Conflict,
    Failed(String),
    Skipped,
}

/// Cheaply cloneable handle to the sync service
pub struct SyncEngine<A> {
    inner: Arc<EngineInner<A>>,
}

impl<A> Clone for SyncEngine<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct EngineInner<A> {
    db: SharedDatabase,
    authority: A,
    config: EngineConfig,
    connectivity: Connectivity,
    syncing: AtomicBool,
    rerun: AtomicBool,
    status: watch::Sender<SyncStatus>,
}

impl<A: Authority> SyncEngine<A> {
    pub fn new(
        db: SharedDatabase,
        authority: A,
        config: EngineConfig,
        connectivity: Connectivity,
    ) -> Self {
        let (status, _rx) = watch::channel(SyncStatus {
            is_online: connectivity.is_online(),
            ..SyncStatus::default()
        });
        Self {
            inner: Arc::new(EngineInner {
                db,
                authority,
                config,
                connectivity,
                syncing: AtomicBool::new(false),
                rerun: AtomicBool::new(false),
                status,
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.inner.connectivity
    }

    pub fn authority(&self) -> &A {
        &self.inner.authority
    }

    pub fn database(&self) -> &SharedDatabase {
        &self.inner.db
    }

    pub fn is_online(&self) -> bool {
        self.inner.connectivity.is_online()
    }

    /// Run `f` against the database. The lock is released before returning,
    /// so callers never hold it across a network call.
    pub(super) async fn with_db<T, F>(&self, f: F) -> Result<T>
    where
        T: Send,
        F: FnOnce(&Database) -> Result<T> + Send,
    {
        let db = self.inner.db.lock().await;
        f(&db)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Prune old history and publish the initial status.
    ///
    /// A failed prune is logged and never blocks startup.
    pub async fn initialize(&self) -> Result<()> {
        let cutoff = now_millis() - self.inner.config.history_retention_millis();
        match self
            .with_db(move |db| HistoryRepository::new(db.connection()).prune_older_than(cutoff))
            .await
        {
            Ok(0) => {}
            Ok(pruned) => tracing::info!("Pruned {pruned} old sync history entries"),
            Err(error) => tracing::warn!("Failed to prune sync history: {error}"),
        }
        self.refresh_status().await
    }

    /// Initialize and spawn the connectivity listener and optional timer.
    ///
    /// Drains immediately when already online.
    pub async fn start(&self) -> Result<BackgroundTasks> {
        self.initialize().await?;
        let mut tasks = BackgroundTasks::default();

        let engine = self.clone();
        let mut online_rx = self.inner.connectivity.subscribe();
        // Read before spawning so a flip ahead of the first poll is still a transition
        let mut was_online = *online_rx.borrow_and_update();
        tasks.push(tokio::spawn(async move {
            while online_rx.changed().await.is_ok() {
                let online = *online_rx.borrow_and_update();
                engine.publish(|status| status.is_online = online);
                if online && !was_online {
                    tracing::info!("Back online; draining mutation queue");
                    if let Err(error) = engine.sync_now().await {
                        tracing::warn!("Sync after reconnect failed: {error}");
                    }
                }
                was_online = online;
            }
        }));

        if let Some(period) = self.inner.config.sync_interval() {
            let engine = self.clone();
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                // The first tick completes immediately
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if engine.is_online() {
                        if let Err(error) = engine.sync_now().await {
                            tracing::warn!("Periodic sync failed: {error}");
                        }
                    }
                }
            }));
        }

        if self.is_online() {
            self.trigger_sync();
        }
        Ok(tasks)
    }

    /// Drain in the background
    pub fn trigger_sync(&self) {
        let engine = self.clone();
        tokio::spawn(async move {
            if let Err(error) = engine.sync_now().await {
                tracing::warn!("Background sync failed: {error}");
            }
        });
    }

    // ------------------------------------------------------------------
    // Status
    // ------------------------------------------------------------------

    pub fn status(&self) -> SyncStatus {
        self.inner.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.inner.status.subscribe()
    }

    fn publish(&self, update: impl FnOnce(&mut SyncStatus)) {
        self.inner.status.send_modify(update);
    }

    /// Re-read counts from the database and publish them
    pub async fn refresh_status(&self) -> Result<()> {
        let max_retries = self.inner.config.max_retries;
        let (pending, attention, conflicts, last_sync) = self
            .with_db(move |db| {
                let conn = db.connection();
                let queue = QueueRepository::new(conn);
                Ok((
                    queue.count()?,
                    queue.count_needing_attention(max_retries)?,
                    ConflictRepository::new(conn).count_unresolved()?,
                    SettingsRepository::new(conn).last_sync_time()?,
                ))
            })
            .await?;
        let online = self.is_online();

        self.publish(|status| {
            status.pending_count = pending;
            status.attention_count = attention;
            status.conflict_count = conflicts;
            status.last_sync_time = last_sync;
            status.is_online = online;
        });
        Ok(())
    }

    /// Refresh counts and, when online, schedule a drain
    pub(super) async fn after_local_write(&self) {
        if let Err(error) = self.refresh_status().await {
            tracing::warn!("Failed to refresh sync status: {error}");
        }
        if self.is_online() {
            self.trigger_sync();
        }
    }

    // ------------------------------------------------------------------
    // Local writes
    // ------------------------------------------------------------------

    /// Store a new record and queue its create
    pub async fn create(&self, kind: EntityKind, data: Payload) -> Result<EntityRecord> {
        let record = EntityRecord::new_local(kind, data);
        let stored = record.clone();

        self.with_db(move |db| {
            let tx = db.connection().unchecked_transaction()?;
            let store = SqliteEntityStore::new(&tx);
            if store.get_including_deleted(kind, &record.id)?.is_some() {
                return Err(Error::InvalidInput(format!(
                    "{kind} {} already exists",
                    record.id
                )));
            }
            store.put(&record)?;
            QueueRepository::new(&tx).enqueue(kind, &record.id, MutationOp::Create, record.data.clone())?;
            tx.commit()?;
            Ok(())
        })
        .await?;

        tracing::debug!("Created {kind} {}", stored.id);
        self.after_local_write().await;
        Ok(stored)
    }

    /// Apply changed fields to a record and queue them
    pub async fn update(&self, kind: EntityKind, id: &str, mut patch: Payload) -> Result<EntityRecord> {
        patch.remove("id");
        if patch.is_empty() {
            return Err(Error::InvalidInput("nothing to update".to_string()));
        }
        let id = id.to_string();

        let record = self
            .with_db(move |db| {
                let tx = db.connection().unchecked_transaction()?;
                let store = SqliteEntityStore::new(&tx);
                let mut record = store
                    .get(kind, &id)?
                    .ok_or_else(|| Error::NotFound(format!("{kind} {id}")))?;

                // Queue before writing so the item's base is the pre-edit revision
                QueueRepository::new(&tx).enqueue(kind, &id, MutationOp::Update, patch.clone())?;

                merge_payload(&mut record.data, patch);
                record.updated_at = now_millis();
                record.synced = false;
                store.put(&record)?;
                tx.commit()?;
                Ok(record)
            })
            .await?;

        tracing::debug!("Updated {kind} {}", record.id);
        self.after_local_write().await;
        Ok(record)
    }

    /// Delete a record. Records the authority never saw are removed outright;
    /// others are tombstoned until the delete is confirmed.
    pub async fn delete(&self, kind: EntityKind, id: &str) -> Result<()> {
        let id = id.to_string();
        self.with_db(move |db| {
            let tx = db.connection().unchecked_transaction()?;
            let store = SqliteEntityStore::new(&tx);
            let mut record = store
                .get(kind, &id)?
                .ok_or_else(|| Error::NotFound(format!("{kind} {id}")))?;

            match QueueRepository::new(&tx).enqueue(kind, &id, MutationOp::Delete, Payload::new())? {
                EnqueueOutcome::Cancelled | EnqueueOutcome::Skipped => {
                    store.delete(kind, &id)?;
                }
                EnqueueOutcome::Queued(_) | EnqueueOutcome::Merged(_) => {
                    record.deleted = true;
                    record.synced = false;
                    record.updated_at = now_millis();
                    store.put(&record)?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await?;

        self.after_local_write().await;
        Ok(())
    }

    pub async fn get(&self, kind: EntityKind, id: &str) -> Result<Option<EntityRecord>> {
        let id = id.to_string();
        self.with_db(move |db| SqliteEntityStore::new(db.connection()).get(kind, &id))
            .await
    }

    pub async fn list(&self, kind: EntityKind) -> Result<Vec<EntityRecord>> {
        self.with_db(move |db| SqliteEntityStore::new(db.connection()).list(kind))
            .await
    }

    /// Visible records of `kind` matching `predicate`
    pub async fn query<P>(&self, kind: EntityKind, predicate: P) -> Result<Vec<EntityRecord>>
    where
        P: Fn(&EntityRecord) -> bool + Send,
    {
        self.with_db(move |db| SqliteEntityStore::new(db.connection()).query(kind, &predicate))
            .await
    }

    // ------------------------------------------------------------------
    // Queue management
    // ------------------------------------------------------------------

    pub async fn list_queue(&self) -> Result<Vec<QueueItem>> {
        self.with_db(|db| QueueRepository::new(db.connection()).list())
            .await
    }

    /// Make a parked item eligible again and drain
    pub async fn retry_item(&self, item_id: i64) -> Result<()> {
        let reset = self
            .with_db(move |db| QueueRepository::new(db.connection()).reset(item_id))
            .await?;
        if !reset {
            return Err(Error::NotFound(format!("queue item {item_id}")));
        }
        self.after_local_write().await;
        Ok(())
    }

    /// Retry every parked item
    pub async fn retry_all(&self) -> Result<usize> {
        let max_retries = self.inner.config.max_retries;
        let count = self
            .with_db(move |db| {
                let tx = db.connection().unchecked_transaction()?;
                let queue = QueueRepository::new(&tx);
                let mut count = 0;
                for item in queue.list()? {
                    if item.needs_attention(max_retries) && queue.reset(item.id)? {
                        count += 1;
                    }
                }
                tx.commit()?;
                Ok(count)
            })
            .await?;
        self.after_local_write().await;
        Ok(count)
    }

    /// Drop a queued mutation without pushing it.
    ///
    /// Discarding the create of a record the authority never saw also removes
    /// the local record; discarding a delete restores the tombstoned record.
    pub async fn discard_item(&self, item_id: i64) -> Result<QueueItem> {
        let item = self
            .with_db(move |db| {
                let tx = db.connection().unchecked_transaction()?;
                let queue = QueueRepository::new(&tx);
                let store = SqliteEntityStore::new(&tx);
                let item = queue
                    .get(item_id)?
                    .ok_or_else(|| Error::NotFound(format!("queue item {item_id}")))?;
                queue.remove(item.id)?;

                match item.operation {
                    MutationOp::Create
                        if !store.was_ever_synced(item.entity_kind, &item.entity_id)? =>
                    {
                        store.delete(item.entity_kind, &item.entity_id)?;
                    }
                    MutationOp::Delete => {
                        if let Some(mut record) =
                            store.get_including_deleted(item.entity_kind, &item.entity_id)?
                        {
                            record.deleted = false;
                            store.put(&record)?;
                        }
                    }
                    _ => {}
                }
                tx.commit()?;
                Ok(item)
            })
            .await?;

        tracing::info!(
            "Discarded queued {} for {} {}",
            item.operation,
            item.entity_kind,
            item.entity_id
        );
        self.after_local_write().await;
        Ok(item)
    }

    // ------------------------------------------------------------------
    // History and logout
    // ------------------------------------------------------------------

    /// Newest entries first
    pub async fn list_history(&self, limit: usize, offset: usize) -> Result<Vec<HistoryEntry>> {
        self.with_db(move |db| HistoryRepository::new(db.connection()).list(limit, offset))
            .await
    }

    /// Wipe local user data (logout)
    pub async fn clear_user_data(&self) -> Result<()> {
        self.with_db(Database::clear_user_data).await?;
        self.publish(|status| status.last_error = None);
        self.refresh_status().await
    }

    // ------------------------------------------------------------------
    // Drain
    // ------------------------------------------------------------------

    /// Caller-initiated drain; fails fast when offline
    pub async fn manual_sync(&self) -> Result<DrainReport> {
        if !self.is_online() {
            return Err(Error::Offline);
        }
        self.sync_now().await
    }

    /// Drain the mutation queue.
    ///
    /// Offline calls and calls made while a drain is running return an empty
    /// report; the latter make the running drain take one more pass.
    pub async fn sync_now(&self) -> Result<DrainReport> {
        if !self.is_online() {
            tracing::debug!("Offline; skipping sync");
            return Ok(DrainReport::default());
        }
        if self.inner.syncing.swap(true, Ordering::AcqRel) {
            self.inner.rerun.store(true, Ordering::Release);
            tracing::debug!("Sync already running; scheduling another pass");
            return Ok(DrainReport::default());
        }

        let mut report = DrainReport::default();
        let result = loop {
            self.inner.rerun.store(false, Ordering::Release);
            let pass = self.drain_cycle().await;
            self.inner.syncing.store(false, Ordering::Release);

            match pass {
                Ok(pass) => report.absorb(pass),
                Err(error) => break Err(error),
            }
            if !self.inner.rerun.swap(false, Ordering::AcqRel) || !self.is_online() {
                break Ok(());
            }
            // Someone else already started the next pass
            if self.inner.syncing.swap(true, Ordering::AcqRel) {
                break Ok(());
            }
        };

        let last_error = match &result {
            Ok(()) => report.last_error.clone(),
            Err(error) => Some(error.to_string()),
        };
        self.publish(|status| {
            status.is_syncing = false;
            status.last_error = last_error;
        });
        self.refresh_status().await?;
        result.map(|()| report)
    }

    async fn drain_cycle(&self) -> Result<DrainReport> {
        let max_retries = self.inner.config.max_retries;
        let items = self.list_queue().await?;
        let (ready, parked): (Vec<QueueItem>, Vec<QueueItem>) = items
            .into_iter()
            .partition(|item| !item.needs_attention(max_retries));

        let mut report = DrainReport {
            skipped: parked.len(),
            ..DrainReport::default()
        };
        let total = ready.len();
        self.publish(|status| {
            status.is_syncing = true;
            status.sync_progress = 0;
        });
        if total > 0 {
            tracing::info!("Draining {total} queued mutations");
        }

        for (index, item) in ready.into_iter().enumerate() {
            match self.process_item(item).await {
                Ok(ItemOutcome::Pushed) => report.pushed += 1,
                Ok(ItemOutcome::Conflict) => report.conflicts += 1,
                Ok(ItemOutcome::Skipped) => report.skipped += 1,
                Ok(ItemOutcome::Failed(message)) => {
                    report.failed += 1;
                    report.last_error = Some(message);
                }
                Err(error) => {
                    tracing::warn!("Failed to record sync outcome: {error}");
                    report.failed += 1;
                    report.last_error = Some(error.to_string());
                }
            }

            let progress = u8::try_from((index + 1) * 100 / total).unwrap_or(100);
            self.publish(|status| status.sync_progress = progress);
        }

        let finished_at = now_millis();
        self.with_db(move |db| {
            SettingsRepository::new(db.connection()).set_last_sync_time(finished_at)
        })
        .await?;

        if total > 0 {
            tracing::info!(
                "Sync cycle finished: {} pushed, {} conflicts, {} failed, {} skipped",
                report.pushed,
                report.conflicts,
                report.failed,
                report.skipped
            );
        }
        Ok(report)
    }

    async fn process_item(&self, snapshot: QueueItem) -> Result<ItemOutcome> {
        let max_retries = self.inner.config.max_retries;
        let item_id = snapshot.id;
        // Re-read: the item may have been merged into or removed since the snapshot
        let Some(item) = self
            .with_db(move |db| QueueRepository::new(db.connection()).get(item_id))
            .await?
        else {
            return Ok(ItemOutcome::Skipped);
        };
        if item.needs_attention(max_retries) {
            return Ok(ItemOutcome::Skipped);
        }

        if item.operation == MutationOp::Update {
            match conflict::detect(&self.inner.authority, &item).await {
                ConflictCheck::Stale {
                    remote,
                    remote_updated_at,
                } => {
                    self.park_conflict(item, remote, remote_updated_at).await?;
                    return Ok(ItemOutcome::Conflict);
                }
                ConflictCheck::Inconclusive(reason) => tracing::debug!(
                    "Conflict check for {} {} inconclusive ({reason}); pushing",
                    item.entity_kind,
                    item.entity_id
                ),
                ConflictCheck::Clear => {}
            }
        }

        let pushed = self.push(&item).await;
        match pushed {
            Ok(response) => {
                let response = self.with_authority_timestamp(&item, response).await;
                self.confirm_push(item, response).await?;
                Ok(ItemOutcome::Pushed)
            }
            // A delete the authority no longer knows about is already applied
            Err(AuthorityError::Client { status: 404, .. })
                if item.operation == MutationOp::Delete =>
            {
                self.confirm_push(item, None).await?;
                Ok(ItemOutcome::Pushed)
            }
            Err(error) => {
                let message = error.to_string();
                self.record_push_failure(item, &error).await?;
                Ok(ItemOutcome::Failed(message))
            }
        }
    }

    async fn push(&self, item: &QueueItem) -> std::result::Result<Option<Payload>, AuthorityError> {
        let authority = &self.inner.authority;
        match item.operation {
            MutationOp::Create => authority.create(item.entity_kind, &item.payload).await,
            MutationOp::Update => {
                authority
                    .update(item.entity_kind, &item.entity_id, &item.payload)
                    .await
            }
            MutationOp::Delete => authority
                .delete(item.entity_kind, &item.entity_id)
                .await
                .map(|()| None),
        }
    }

    /// Fill in the authority's revision when a create or update response
    /// carries none, so the next edit is based on what the authority stored.
    async fn with_authority_timestamp(
        &self,
        item: &QueueItem,
        response: Option<Payload>,
    ) -> Option<Payload> {
        if item.operation == MutationOp::Delete
            || response.as_ref().and_then(remote_updated_at).is_some()
        {
            return response;
        }
        let id = response
            .as_ref()
            .and_then(payload_id)
            .unwrap_or_else(|| item.entity_id.clone());
        match self.inner.authority.fetch(item.entity_kind, &id).await {
            Ok(remote) => match remote_updated_at(&remote) {
                Some(remote_ts) => {
                    let mut response = response.unwrap_or_default();
                    response.insert("updated_at".to_string(), Value::from(remote_ts));
                    Some(response)
                }
                None => response,
            },
            Err(error) => {
                tracing::debug!(
                    "Could not read back {} {id} after push: {error}",
                    item.entity_kind
                );
                response
            }
        }
    }

    async fn confirm_push(&self, item: QueueItem, response: Option<Payload>) -> Result<()> {
        let remote_ts = response.as_ref().and_then(remote_updated_at);
        let remote_id = response
            .as_ref()
            .and_then(payload_id)
            .filter(|remote_id| *remote_id != item.entity_id);

        let outcome = self
            .with_db(move |db| {
                let tx = db.connection().unchecked_transaction()?;
                let queue = QueueRepository::new(&tx);
                let store = SqliteEntityStore::new(&tx);
                let kind = item.entity_kind;
                let label = entity_label(&tx, &item)?;

                let outcome = queue.settle_pushed(&item, remote_ts)?;
                match (item.operation, outcome) {
                    (MutationOp::Delete, SettleOutcome::Removed) => {
                        store.delete(kind, &item.entity_id)?;
                    }
                    (MutationOp::Create | MutationOp::Update, SettleOutcome::Removed) => {
                        store.mark_synced(kind, &item.entity_id, remote_ts)?;
                    }
                    (_, SettleOutcome::Rebased | SettleOutcome::Retained) => {
                        store.mark_ever_synced(kind, &item.entity_id)?;
                    }
                    (MutationOp::Create, SettleOutcome::Gone) => {
                        // Deleted locally while the create was in flight
                        let remote = remote_id.as_deref().unwrap_or(&item.entity_id);
                        queue.enqueue_orphan_delete(kind, remote)?;
                    }
                    (_, SettleOutcome::Gone) => {}
                }

                let mut final_id = item.entity_id.clone();
                if item.operation == MutationOp::Create && outcome != SettleOutcome::Gone {
                    if let Some(remote_id) = &remote_id {
                        store.remap_id(kind, &item.entity_id, remote_id)?;
                        queue.remap_entity(kind, &item.entity_id, remote_id)?;
                        final_id.clone_from(remote_id);
                    }
                }

                HistoryRepository::new(&tx).append(&HistoryEntry::now(
                    SyncDirection::Push,
                    kind,
                    final_id,
                    label,
                    item.operation,
                    SyncOutcome::Success,
                ))?;
                tx.commit()?;
                Ok((item, outcome))
            })
            .await?;

        let (item, outcome) = outcome;
        tracing::debug!(
            "Pushed {} for {} {} ({outcome:?})",
            item.operation,
            item.entity_kind,
            item.entity_id
        );
        Ok(())
    }

    async fn record_push_failure(&self, item: QueueItem, error: &AuthorityError) -> Result<()> {
        let max_retries = self.inner.config.max_retries;
        let message = error.to_string();
        let kind = error.kind();

        self.with_db(move |db| {
            let tx = db.connection().unchecked_transaction()?;
            let queue = QueueRepository::new(&tx);
            let label = entity_label(&tx, &item)?;

            if kind == FailureKind::Client {
                queue.mark_rejected(item.id, &message)?;
                tracing::warn!(
                    "Authority rejected {} for {} {}: {message}",
                    item.operation,
                    item.entity_kind,
                    item.entity_id
                );
            } else {
                let retries = queue.increment_retry(item.id, &message)?;
                if retries >= max_retries {
                    tracing::warn!(
                        "{} for {} {} failed {retries} times; parked until retried: {message}",
                        item.operation,
                        item.entity_kind,
                        item.entity_id
                    );
                } else {
                    tracing::warn!(
                        "Push of {} for {} {} failed (attempt {retries}): {message}",
                        item.operation,
                        item.entity_kind,
                        item.entity_id
                    );
                }
            }

            HistoryRepository::new(&tx).append(
                &HistoryEntry::now(
                    SyncDirection::Push,
                    item.entity_kind,
                    item.entity_id.clone(),
                    label,
                    item.operation,
                    SyncOutcome::Failed,
                )
                .with_error(message),
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn park_conflict(
        &self,
        item: QueueItem,
        remote: Payload,
        remote_updated_at: i64,
    ) -> Result<()> {
        let conflict_id = self
            .with_db(move |db| {
                let tx = db.connection().unchecked_transaction()?;
                let queue = QueueRepository::new(&tx);
                // Edits merged while the check ran belong in the artifact
                let current = queue.get(item.id)?.unwrap_or(item);
                let label = entity_label(&tx, &current)?;

                let id = ConflictRepository::new(&tx).insert(&ConflictArtifact {
                    id: 0,
                    entity_kind: current.entity_kind,
                    entity_id: current.entity_id.clone(),
                    local_payload: current.payload.clone(),
                    remote_payload: remote,
                    local_updated_at: current.base_updated_at,
                    remote_updated_at,
                    detected_at: now_millis(),
                    resolved: false,
                    resolution: None,
                    resolved_at: None,
                })?;
                queue.remove(current.id)?;
                HistoryRepository::new(&tx).append(&HistoryEntry::now(
                    SyncDirection::Push,
                    current.entity_kind,
                    current.entity_id.clone(),
                    label,
                    MutationOp::Update,
                    SyncOutcome::Conflict,
                ))?;
                tx.commit()?;
                Ok(id)
            })
            .await?;

        tracing::warn!("Parked conflict {conflict_id}: authority changed the record after the local edit");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Pull
    // ------------------------------------------------------------------

    /// Replace local records of `kind` with the authority's set.
    ///
    /// Records with pending mutations or open conflicts are kept as they are.
    pub async fn force_pull(&self, kind: EntityKind) -> Result<usize> {
        if !self.is_online() {
            return Err(Error::Offline);
        }

        let payloads = match self.inner.authority.fetch_all(kind).await {
            Ok(payloads) => payloads,
            Err(error) => {
                let message = error.to_string();
                self.with_db(move |db| {
                    HistoryRepository::new(db.connection()).append(
                        &HistoryEntry::now(
                            SyncDirection::Pull,
                            kind,
                            "*",
                            format!("{kind} records"),
                            MutationOp::Update,
                            SyncOutcome::Failed,
                        )
                        .with_error(message),
                    )
                })
                .await?;
                return Err(error.into());
            }
        };

        let records: Vec<EntityRecord> = payloads
            .into_iter()
            .filter_map(|payload| match EntityRecord::from_remote(kind, payload) {
                Ok(record) => Some(record),
                Err(error) => {
                    tracing::warn!("Skipping malformed {kind} record: {error}");
                    None
                }
            })
            .collect();

        let stored = self
            .with_db(move |db| {
                let tx = db.connection().unchecked_transaction()?;
                let mut keep = QueueRepository::new(&tx).pending_entity_ids(kind)?;
                keep.extend(ConflictRepository::new(&tx).unresolved_entity_ids(kind)?);

                let stored = SqliteEntityStore::new(&tx).replace_with_remote(kind, &records, &keep)?;
                HistoryRepository::new(&tx).append(&HistoryEntry::now(
                    SyncDirection::Pull,
                    kind,
                    "*",
                    format!("{stored} {kind} records"),
                    MutationOp::Update,
                    SyncOutcome::Success,
                ))?;
                tx.commit()?;
                Ok(stored)
            })
            .await?;

        tracing::info!("Pulled {stored} {kind} records from the authority");
        self.refresh_status().await?;
        Ok(stored)
    }
}

/// History label for a queue item: the record's label, or the payload's
pub(super) fn entity_label(conn: &Connection, item: &QueueItem) -> Result<String> {
    Ok(SqliteEntityStore::new(conn)
        .get_including_deleted(item.entity_kind, &item.entity_id)?
        .map_or_else(
            || payload_label(item.entity_kind, &item.entity_id, &item.payload),
            |record| record.label(),
        ))
}
