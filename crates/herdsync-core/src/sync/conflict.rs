//! Conflict detection and resolution.
//!
//! Before an update is pushed, the authority's copy is fetched. If the
//! authority changed the record after the revision the local edit was based
//! on, the edit is parked as a conflict artifact instead of overwriting it.
//! A failed or unreadable pre-check lets the push go ahead.

use serde_json::Value;

use super::authority::Authority;
use super::engine::SyncEngine;
use crate::db::{ConflictRepository, EntityStore, HistoryRepository, QueueRepository, SqliteEntityStore};
use crate::error::{Error, Result};
use crate::models::{
    payload_label, remote_updated_at, ConflictArtifact, ConflictChoice, EnqueueOutcome,
    EntityRecord, HistoryEntry, MutationOp, Payload, QueueItem, SyncDirection, SyncOutcome,
};
use crate::util::now_millis;

/// Result of the pre-push check for one queue item
#[derive(Debug, Clone, PartialEq)]
pub enum ConflictCheck {
    /// Safe to push
    Clear,
    /// The check could not run; push anyway
    Inconclusive(String),
    /// The authority holds a newer revision than the local edit's base
    Stale {
        remote: Payload,
        remote_updated_at: i64,
    },
}

/// Compare the authority's copy against the item's base timestamp.
///
/// Only updates with a known base are checked.
pub async fn detect<A: Authority>(authority: &A, item: &QueueItem) -> ConflictCheck {
    if item.operation != MutationOp::Update {
        return ConflictCheck::Clear;
    }
    let Some(base) = item.base_updated_at else {
        return ConflictCheck::Clear;
    };

    match authority.fetch(item.entity_kind, &item.entity_id).await {
        Ok(remote) => match remote_updated_at(&remote) {
            Some(remote_ts) if remote_ts > base => ConflictCheck::Stale {
                remote,
                remote_updated_at: remote_ts,
            },
            Some(_) => ConflictCheck::Clear,
            None => ConflictCheck::Inconclusive("authority record has no updated_at".to_string()),
        },
        Err(error) => ConflictCheck::Inconclusive(error.to_string()),
    }
}

impl<A: Authority> SyncEngine<A> {
    /// Conflicts newest first
    pub async fn list_conflicts(
        &self,
        include_resolved: bool,
        limit: usize,
    ) -> Result<Vec<ConflictArtifact>> {
        self.with_db(move |db| ConflictRepository::new(db.connection()).list(include_resolved, limit))
            .await
    }

    /// Settle one conflict and drain.
    ///
    /// `Remote` overwrites the local record with the authority's copy and
    /// drops pending local edits for it. `Local` queues the local fields as a
    /// fresh update based on the authority's revision. A delete queued after
    /// the conflict was parked is kept either way.
    pub async fn resolve_conflict(&self, id: i64, choice: ConflictChoice) -> Result<ConflictArtifact> {
        let resolved = self.apply_resolution(id, choice).await?;
        self.after_local_write().await;
        Ok(resolved)
    }

    /// Settle every open conflict the same way; returns how many were resolved
    pub async fn resolve_all(&self, choice: ConflictChoice) -> Result<usize> {
        let open = self.list_conflicts(false, usize::MAX).await?;
        let mut resolved = 0;
        for conflict in open {
            match self.apply_resolution(conflict.id, choice).await {
                Ok(_) => resolved += 1,
                Err(error) => tracing::warn!("Failed to resolve conflict {}: {error}", conflict.id),
            }
        }
        self.after_local_write().await;
        Ok(resolved)
    }

    async fn apply_resolution(&self, id: i64, choice: ConflictChoice) -> Result<ConflictArtifact> {
        let resolved = self
            .with_db(move |db| {
                let tx = db.connection().unchecked_transaction()?;
                let conflicts = ConflictRepository::new(&tx);
                let conflict = conflicts
                    .get(id)?
                    .ok_or_else(|| Error::NotFound(format!("conflict {id}")))?;
                if conflict.resolved {
                    return Err(Error::InvalidInput(format!("conflict {id} is already resolved")));
                }

                let kind = conflict.entity_kind;
                let entity_id = conflict.entity_id.clone();
                let store = SqliteEntityStore::new(&tx);
                let queue = QueueRepository::new(&tx);

                // A delete queued after the conflict was parked still wins
                let pending_delete = queue
                    .find(kind, &entity_id)?
                    .iter()
                    .any(|item| item.operation == MutationOp::Delete);

                let entry = match choice {
                    ConflictChoice::Remote => {
                        let mut data = conflict.remote_payload.clone();
                        if !data.contains_key("id") {
                            data.insert("id".to_string(), Value::String(entity_id.clone()));
                        }
                        let record = EntityRecord {
                            id: entity_id.clone(),
                            kind,
                            data,
                            updated_at: conflict.remote_updated_at,
                            synced: !pending_delete,
                            deleted: pending_delete,
                        };
                        store.put(&record)?;
                        for pending in queue.find(kind, &entity_id)? {
                            if pending.operation != MutationOp::Delete {
                                queue.remove(pending.id)?;
                            }
                        }
                        HistoryEntry::now(
                            SyncDirection::Pull,
                            kind,
                            entity_id,
                            record.label(),
                            MutationOp::Update,
                            SyncOutcome::Success,
                        )
                    }
                    ConflictChoice::Local if pending_delete => {
                        tracing::debug!("{kind} {entity_id} is pending deletion; local copy not re-queued");
                        let label = store
                            .get_including_deleted(kind, &entity_id)?
                            .map_or_else(
                                || payload_label(kind, &entity_id, &conflict.local_payload),
                                |record| record.label(),
                            );
                        HistoryEntry::now(
                            SyncDirection::Push,
                            kind,
                            entity_id,
                            label,
                            MutationOp::Delete,
                            SyncOutcome::Success,
                        )
                    }
                    ConflictChoice::Local => {
                        let label = match store.get(kind, &entity_id)? {
                            Some(mut record) => {
                                record.updated_at = conflict.remote_updated_at;
                                record.synced = false;
                                store.put(&record)?;
                                record.label()
                            }
                            None => payload_label(kind, &entity_id, &conflict.local_payload),
                        };
                        let outcome = queue.enqueue(
                            kind,
                            &entity_id,
                            MutationOp::Update,
                            conflict.local_payload.clone(),
                        )?;
                        if let EnqueueOutcome::Queued(item_id) | EnqueueOutcome::Merged(item_id) = outcome {
                            queue.rebase(item_id, Some(conflict.remote_updated_at))?;
                        }
                        HistoryEntry::now(
                            SyncDirection::Push,
                            kind,
                            entity_id,
                            label,
                            MutationOp::Update,
                            SyncOutcome::Success,
                        )
                    }
                };
                HistoryRepository::new(&tx).append(&entry)?;

                let resolved_at = now_millis();
                conflicts.mark_resolved(id, choice, resolved_at)?;
                tx.commit()?;

                Ok(ConflictArtifact {
                    resolved: true,
                    resolution: Some(choice),
                    resolved_at: Some(resolved_at),
                    ..conflict
                })
            })
            .await?;

        tracing::info!(
            "Resolved conflict {id} on {} {} keeping the {choice} copy",
            resolved.entity_kind,
            resolved.entity_id
        );
        Ok(resolved)
    }
}
