//! Observable sync state.

use serde::Serialize;

/// Coarse sync state for status indicators.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Offline,
    Syncing,
    Pending,
    Synced,
}

/// Snapshot published on the engine's status channel.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    /// Items waiting in the mutation queue
    pub pending_count: usize,
    pub is_syncing: bool,
    /// 0-100 within the current drain cycle
    pub sync_progress: u8,
    /// Unix ms of the last completed drain
    pub last_sync_time: Option<i64>,
    /// Unresolved conflict artifacts
    pub conflict_count: usize,
    /// Items parked at the retry ceiling or rejected by the authority
    pub attention_count: usize,
    pub last_error: Option<String>,
    pub is_online: bool,
}

impl SyncStatus {
    pub const fn state(&self) -> SyncState {
        if !self.is_online {
            SyncState::Offline
        } else if self.is_syncing {
            SyncState::Syncing
        } else if self.pending_count > 0 || self.conflict_count > 0 {
            SyncState::Pending
        } else {
            SyncState::Synced
        }
    }
}
