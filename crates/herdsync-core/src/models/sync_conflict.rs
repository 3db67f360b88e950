//! Sync conflict model

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::{EntityKind, Payload};
use crate::error::{Error, Result};

/// Which side wins when resolving a conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictChoice {
    /// Re-push the local payload as a fresh update
    Local,
    /// Overwrite the local record with the authority's payload
    Remote,
}

impl ConflictChoice {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
        }
    }
}

impl fmt::Display for ConflictChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictChoice {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            // "server" is what the mobile client has always called it
            "remote" | "server" => Ok(Self::Remote),
            other => Err(Error::InvalidInput(format!(
                "unknown conflict choice '{other}' (expected local or remote)"
            ))),
        }
    }
}

/// A parked local/remote divergence awaiting resolution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictArtifact {
    /// Conflict row identifier
    pub id: i64,
    pub entity_kind: EntityKind,
    pub entity_id: String,
    /// Fields the local update tried to push
    pub local_payload: Payload,
    /// The authority's record at detection time
    pub remote_payload: Payload,
    /// Base timestamp of the local update (Unix ms)
    pub local_updated_at: Option<i64>,
    /// The authority's `updated_at` (Unix ms)
    pub remote_updated_at: i64,
    /// Detection timestamp (Unix ms)
    pub detected_at: i64,
    pub resolved: bool,
    pub resolution: Option<ConflictChoice>,
    pub resolved_at: Option<i64>,
}
