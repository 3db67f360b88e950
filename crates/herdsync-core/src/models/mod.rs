//! Data models for herdsync

mod history;
mod queue_item;
mod record;
mod sync_conflict;

pub use history::{HistoryEntry, SyncDirection, SyncOutcome};
pub use queue_item::{EnqueueOutcome, MutationOp, QueueItem, SettleOutcome};
pub use record::{
    merge_payload, payload_id, payload_label, remote_updated_at, EntityKind, EntityRecord, Payload,
};
pub use sync_conflict::{ConflictArtifact, ConflictChoice};
