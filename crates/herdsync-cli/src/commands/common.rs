use std::path::{Path, PathBuf};

use chrono::{TimeZone, Utc};
use herdsync_core::models::{ConflictArtifact, EntityRecord, HistoryEntry, Payload, QueueItem};
use herdsync_core::replay::ReplayEntry;
use herdsync_core::sync::{Connectivity, HttpAuthority, SyncEngine};
use herdsync_core::{Database, EngineConfig, SharedDatabase};
use serde::Serialize;
use serde_json::Value;

use crate::error::CliError;

/// Database location and engine settings shared by every command
pub struct Context {
    pub db_path: PathBuf,
    pub config: EngineConfig,
}

impl Context {
    pub fn new(db_path: Option<PathBuf>, config_path: Option<&Path>) -> Result<Self, CliError> {
        Ok(Self {
            db_path: db_path.unwrap_or_else(default_db_path),
            config: load_config(config_path)?,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct RecordListItem {
    pub id: String,
    pub kind: String,
    pub label: String,
    pub synced: bool,
    pub updated_at: i64,
    pub relative_time: String,
    pub data: Payload,
}

#[derive(Debug, Serialize)]
pub struct ReplayListItem {
    pub id: i64,
    pub method: String,
    pub url: String,
    pub enqueued_at: i64,
    pub attempts: u32,
    pub last_error: Option<String>,
}

pub fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("herdsync")
        .join("herdsync.db")
}

/// Config file when given, otherwise defaults overlaid with the environment
pub fn load_config(path: Option<&Path>) -> Result<EngineConfig, CliError> {
    let config = match path {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::from_env()?,
    };
    tracing::debug!("Using engine config: {config:?}");
    Ok(config)
}

pub fn open_database(path: &Path) -> Result<SharedDatabase, CliError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(Database::open(path)?.into_shared())
}

/// Build an engine over the local database.
///
/// Local edits and conflict resolution run with the engine offline so they
/// only queue; `sync` and `pull` open it online.
pub async fn open_engine(
    ctx: &Context,
    online: bool,
) -> Result<SyncEngine<HttpAuthority>, CliError> {
    let db = open_database(&ctx.db_path)?;
    let authority = HttpAuthority::new(&ctx.config)?;
    let engine = SyncEngine::new(
        db,
        authority,
        ctx.config.clone(),
        Connectivity::new(online),
    );
    engine.initialize().await?;
    Ok(engine)
}

/// Build a payload from an optional JSON object plus `key=value` pairs.
///
/// Values that parse as JSON (numbers, booleans, null, quoted strings,
/// objects) keep that type; anything else is stored as a string.
pub fn parse_fields(fields: &[String], json: Option<&str>) -> Result<Payload, CliError> {
    let mut payload = match json.map(str::trim).filter(|raw| !raw.is_empty()) {
        Some(raw) => match serde_json::from_str::<Value>(raw)? {
            Value::Object(map) => map,
            _ => return Err(CliError::PayloadNotObject),
        },
        None => Payload::new(),
    };

    for field in fields {
        let Some((key, raw_value)) = field.split_once('=') else {
            return Err(CliError::InvalidField(field.clone()));
        };
        let key = key.trim();
        if key.is_empty() {
            return Err(CliError::InvalidField(field.clone()));
        }
        let value = serde_json::from_str(raw_value.trim())
            .unwrap_or_else(|_| Value::String(raw_value.to_string()));
        payload.insert(key.to_string(), value);
    }

    if payload.is_empty() {
        return Err(CliError::EmptyPayload);
    }
    Ok(payload)
}

pub fn record_to_list_item(record: &EntityRecord) -> RecordListItem {
    RecordListItem {
        id: record.id.clone(),
        kind: record.kind.to_string(),
        label: record.label(),
        synced: record.synced,
        updated_at: record.updated_at,
        relative_time: format_relative_time(record.updated_at, Utc::now().timestamp_millis()),
        data: record.data.clone(),
    }
}

pub fn replay_entry_to_item(entry: &ReplayEntry) -> ReplayListItem {
    ReplayListItem {
        id: entry.id,
        method: entry.request.method.clone(),
        url: entry.request.url.clone(),
        enqueued_at: entry.enqueued_at,
        attempts: entry.attempts,
        last_error: entry.last_error.clone(),
    }
}

pub fn format_record_lines(records: &[EntityRecord]) -> Vec<String> {
    let now_ms = Utc::now().timestamp_millis();
    records
        .iter()
        .map(|record| {
            let short_id = record.id.chars().take(13).collect::<String>();
            let marker = if record.synced { ' ' } else { '*' };
            format!(
                "{short_id}{marker} {:<32} ({})",
                record.label(),
                format_relative_time(record.updated_at, now_ms)
            )
        })
        .collect()
}

pub fn format_queue_lines(items: &[QueueItem], max_retries: u32) -> Vec<String> {
    items
        .iter()
        .map(|item| {
            let state = if item.rejected {
                "rejected"
            } else if item.retry_count >= max_retries {
                "parked"
            } else if item.retry_count > 0 {
                "retrying"
            } else {
                "pending"
            };
            let mut line = format!(
                "#{:<5} {:<6} {} {} [{state}, {} retries]",
                item.id, item.operation, item.entity_kind, item.entity_id, item.retry_count
            );
            if let Some(error) = &item.last_error {
                line.push_str(&format!(" - {error}"));
            }
            line
        })
        .collect()
}

pub fn format_conflict_lines(conflicts: &[ConflictArtifact]) -> Vec<String> {
    conflicts
        .iter()
        .map(|conflict| {
            let state = conflict.resolution.map_or_else(
                || "open".to_string(),
                |choice| format!("kept {choice}"),
            );
            let changed = conflict
                .local_payload
                .keys()
                .map(String::as_str)
                .collect::<Vec<_>>()
                .join(", ");
            format!(
                "#{:<5} {} {} [{state}] local: {changed} | server updated {}",
                conflict.id,
                conflict.entity_kind,
                conflict.entity_id,
                format_sync_timestamp(conflict.remote_updated_at)
            )
        })
        .collect()
}

pub fn format_history_lines(entries: &[HistoryEntry]) -> Vec<String> {
    entries
        .iter()
        .map(|entry| {
            let mut line = format!(
                "{} {:<4} {:<6} {:<8} {}",
                format_sync_timestamp(entry.timestamp),
                entry.operation,
                entry.action,
                entry.outcome,
                entry.entity_label
            );
            if let Some(error) = &entry.error_message {
                line.push_str(&format!(" - {error}"));
            }
            line
        })
        .collect()
}

pub fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff = now_ms.saturating_sub(timestamp_ms);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;
    let week = 7 * day;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else if diff < week {
        format!("{}d ago", diff / day)
    } else {
        format!("{}w ago", diff / week)
    }
}

pub fn format_sync_timestamp(timestamp_ms: i64) -> String {
    Utc.timestamp_millis_opt(timestamp_ms)
        .single()
        .map_or_else(
            || timestamp_ms.to_string(),
            |time| time.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        )
}

/// Absolute URL for a replay target given as a path or full URL
pub fn resolve_target_url(base_url: &str, target: &str) -> Result<String, CliError> {
    let target = target.trim();
    if target.starts_with("http://") || target.starts_with("https://") {
        return Ok(target.to_string());
    }
    if !target.starts_with('/') {
        return Err(CliError::InvalidRequest(format!(
            "target must be an absolute URL or start with '/' (got '{target}')"
        )));
    }
    Ok(format!("{}{target}", base_url.trim_end_matches('/')))
}
