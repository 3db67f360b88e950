//! Sync history model

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::{EntityKind, MutationOp};
use crate::error::{Error, Result};

/// Direction of a recorded sync step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncDirection {
    Push,
    Pull,
}

/// Result of a recorded sync step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncOutcome {
    Success,
    Failed,
    Conflict,
}

impl SyncDirection {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Push => "push",
            Self::Pull => "pull",
        }
    }
}

impl SyncOutcome {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Conflict => "conflict",
        }
    }
}

impl fmt::Display for SyncDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for SyncOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncDirection {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "push" => Ok(Self::Push),
            "pull" => Ok(Self::Pull),
            other => Err(Error::InvalidInput(format!("unknown sync direction '{other}'"))),
        }
    }
}

impl FromStr for SyncOutcome {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "conflict" => Ok(Self::Conflict),
            other => Err(Error::InvalidInput(format!("unknown sync outcome '{other}'"))),
        }
    }
}

/// One row of the append-only sync ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Row identifier (0 until appended)
    pub id: i64,
    /// Unix ms
    pub timestamp: i64,
    pub operation: SyncDirection,
    pub entity_kind: EntityKind,
    pub entity_id: String,
    pub entity_label: String,
    pub action: MutationOp,
    pub outcome: SyncOutcome,
    pub error_message: Option<String>,
}

impl HistoryEntry {
    /// Build an entry stamped with the current time
    pub fn now(
        operation: SyncDirection,
        entity_kind: EntityKind,
        entity_id: impl Into<String>,
        entity_label: impl Into<String>,
        action: MutationOp,
        outcome: SyncOutcome,
    ) -> Self {
        Self {
            id: 0,
            timestamp: crate::util::now_millis(),
            operation,
            entity_kind,
            entity_id: entity_id.into(),
            entity_label: entity_label.into(),
            action,
            outcome,
            error_message: None,
        }
    }

    #[must_use]
    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }
}
