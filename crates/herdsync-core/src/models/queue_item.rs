//! Mutation queue item model

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::{EntityKind, Payload};
use crate::error::{Error, Result};

/// Kind of pending mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationOp {
    Create,
    Update,
    Delete,
}

impl MutationOp {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for MutationOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MutationOp {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(Error::InvalidInput(format!("unknown operation '{other}'"))),
        }
    }
}

/// A pending mutation waiting to be pushed to the authority
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    /// Monotonic queue identifier
    pub id: i64,
    pub entity_kind: EntityKind,
    pub entity_id: String,
    pub operation: MutationOp,
    /// Fields to send (the full record for creates, changed fields for updates)
    pub payload: Payload,
    /// Enqueue timestamp (Unix ms)
    pub enqueued_at: i64,
    /// Local record timestamp when the mutation was first queued
    pub base_updated_at: Option<i64>,
    /// Bumped whenever another mutation is merged into this item
    pub revision: i64,
    pub retry_count: u32,
    pub last_error: Option<String>,
    /// The authority answered with a 4xx; never retried automatically
    pub rejected: bool,
}

impl QueueItem {
    /// Whether the item is parked until the caller retries or discards it.
    pub const fn needs_attention(&self, max_retries: u32) -> bool {
        self.rejected || self.retry_count >= max_retries
    }
}

/// What `enqueue` did with a mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new queue item was appended
    Queued(i64),
    /// The mutation was merged into an existing item
    Merged(i64),
    /// A delete cancelled a pending, never-pushed create
    Cancelled,
    /// Nothing to send: the authority never received the entity
    Skipped,
}

/// What happened to a queue item after its push was confirmed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleOutcome {
    /// The item was removed
    Removed,
    /// A merge arrived while the create was in flight; it is now an update
    Rebased,
    /// A merge arrived while in flight; the item stays queued
    Retained,
    /// The item was already gone (cancelled by a local delete)
    Gone,
}
