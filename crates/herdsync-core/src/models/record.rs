//! Entity record model

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Domain fields of a record, as exchanged with the authority.
pub type Payload = serde_json::Map<String, Value>;

/// Domain record types managed by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Animal,
    Feed,
    DietPlan,
    MilkLog,
    FarmerProfile,
    YieldSample,
    HealthEvent,
    Organization,
}

impl EntityKind {
    /// Every kind, in declaration order
    pub const ALL: [Self; 8] = [
        Self::Animal,
        Self::Feed,
        Self::DietPlan,
        Self::MilkLog,
        Self::FarmerProfile,
        Self::YieldSample,
        Self::HealthEvent,
        Self::Organization,
    ];

    /// Stable identifier used in queue rows, history rows and config keys
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Animal => "animal",
            Self::Feed => "feed",
            Self::DietPlan => "diet_plan",
            Self::MilkLog => "milk_log",
            Self::FarmerProfile => "farmer_profile",
            Self::YieldSample => "yield_sample",
            Self::HealthEvent => "health_event",
            Self::Organization => "organization",
        }
    }

    /// Local table holding records of this kind
    pub(crate) const fn table(self) -> &'static str {
        match self {
            Self::Animal => "animals",
            Self::Feed => "feeds",
            Self::DietPlan => "diet_plans",
            Self::MilkLog => "milk_logs",
            Self::FarmerProfile => "farmer_profiles",
            Self::YieldSample => "yield_samples",
            Self::HealthEvent => "health_events",
            Self::Organization => "organizations",
        }
    }

    /// Authority collection path used when no override is configured
    pub const fn default_endpoint(self) -> &'static str {
        match self {
            Self::Animal => "/api/v1/cows",
            Self::Feed => "/api/v1/feeds/custom",
            Self::DietPlan => "/api/v1/diet",
            Self::MilkLog => "/api/v1/milk-logs",
            Self::FarmerProfile => "/api/v1/farmer-profiles",
            Self::YieldSample => "/api/v1/yield-data",
            Self::HealthEvent => "/api/v1/health-events",
            Self::Organization => "/api/v1/organizations",
        }
    }

    /// Whether this kind mixes user records with shared master data that
    /// survives a logout.
    pub const fn has_reference_data(self) -> bool {
        matches!(self, Self::Feed)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| Error::InvalidInput(format!("unknown entity kind '{s}'")))
    }
}

/// A locally stored record plus its sync control flags
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    /// Record identifier (client-generated UUID v7 unless supplied)
    pub id: String,
    /// Entity kind
    pub kind: EntityKind,
    /// Domain fields
    pub data: Payload,
    /// Local revision timestamp (Unix ms)
    pub updated_at: i64,
    /// This exact revision has been accepted by the authority
    pub synced: bool,
    /// Tombstoned locally, awaiting a confirmed remote delete
    pub deleted: bool,
}

impl EntityRecord {
    /// Create an unsynced local record. Uses `data.id` when present,
    /// otherwise generates a UUID v7.
    pub fn new_local(kind: EntityKind, mut data: Payload) -> Self {
        let id = data
            .get("id")
            .and_then(id_from_value)
            .unwrap_or_else(|| Uuid::now_v7().to_string());
        data.insert("id".to_string(), Value::String(id.clone()));

        Self {
            id,
            kind,
            data,
            updated_at: crate::util::now_millis(),
            synced: false,
            deleted: false,
        }
    }

    /// Build a synced record from an authority payload, kept verbatim.
    pub fn from_remote(kind: EntityKind, data: Payload) -> Result<Self> {
        let id = data
            .get("id")
            .and_then(id_from_value)
            .ok_or_else(|| Error::InvalidInput(format!("{kind} payload has no id")))?;
        let updated_at = remote_updated_at(&data)
            .ok_or_else(|| Error::InvalidInput(format!("{kind} {id} has no updated_at")))?;

        Ok(Self {
            id,
            kind,
            data,
            updated_at,
            synced: true,
            deleted: false,
        })
    }

    /// Human-readable label for history entries and listings
    #[must_use]
    pub fn label(&self) -> String {
        payload_label(self.kind, &self.id, &self.data)
    }

    /// Shared master data that `clear` keeps across sessions
    #[must_use]
    pub fn is_reference(&self) -> bool {
        self.kind.has_reference_data()
            && matches!(self.data.get("is_custom"), Some(Value::Bool(false)))
    }
}

/// Label a payload by its most descriptive field.
pub fn payload_label(kind: EntityKind, id: &str, data: &Payload) -> String {
    ["name", "title", "cow_name"]
        .iter()
        .find_map(|field| data.get(*field).and_then(Value::as_str))
        .map(str::trim)
        .filter(|label| !label.is_empty())
        .map_or_else(
            || format!("{kind} {}", id.chars().take(8).collect::<String>()),
            str::to_string,
        )
}

/// Identifier carried in a payload, if any
pub fn payload_id(data: &Payload) -> Option<String> {
    data.get("id").and_then(id_from_value)
}

/// Merge `patch` into `target`. Nested objects merge recursively; any other
/// value replaces the existing one.
pub fn merge_payload(target: &mut Payload, patch: Payload) {
    for (key, value) in patch {
        let replacement = match (target.get_mut(&key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                merge_payload(existing, incoming);
                None
            }
            (_, value) => Some(value),
        };
        if let Some(value) = replacement {
            target.insert(key, value);
        }
    }
}

/// Read the authority's last-modified timestamp from a payload.
///
/// Accepts `updated_at` or `updatedAt`, as Unix ms or an ISO-8601 string.
pub fn remote_updated_at(data: &Payload) -> Option<i64> {
    data.get("updated_at")
        .or_else(|| data.get("updatedAt"))
        .and_then(parse_timestamp)
}

fn parse_timestamp(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number.as_i64(),
        Value::String(text) => {
            let text = text.trim();
            if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
                return Some(parsed.timestamp_millis());
            }
            // Naive timestamps from the authority are UTC.
            NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|naive| naive.and_utc().timestamp_millis())
        }
        _ => None,
    }
}

fn id_from_value(value: &Value) -> Option<String> {
    match value {
        Value::String(id) if !id.trim().is_empty() => Some(id.trim().to_string()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}
