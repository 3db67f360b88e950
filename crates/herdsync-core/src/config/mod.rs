//! Engine configuration.
//!
//! An `EngineConfig` is either parsed from a JSON file or assembled from
//! defaults plus environment variables. Every constructor validates the result,
//! so a config handed to the engine is always usable.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::EntityKind;
use crate::replay::ReplayPolicy;
use crate::util::{compact_text, is_http_url, normalize_text_option};

pub const API_URL_ENV: &str = "HERDSYNC_API_URL";
pub const API_TOKEN_ENV: &str = "HERDSYNC_API_TOKEN";

const DEFAULT_API_BASE_URL: &str = "http://localhost:8000";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MAX_RETRIES: u32 = 5;
const DEFAULT_HISTORY_RETENTION_DAYS: u32 = 30;
const DEFAULT_REPLAY_RETENTION_HOURS: u32 = 24;
const DEFAULT_REPLAY_PATH_PREFIX: &str = "/api/";

/// Runtime settings for the sync engine and replay layer.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct EngineConfig {
    /// Authority base URL, without a trailing slash
    pub api_base_url: String,
    /// Bearer token sent with every authority request
    pub auth_token: Option<String>,
    pub request_timeout_secs: u64,
    /// Failed pushes before an item is parked for attention
    pub max_retries: u32,
    pub history_retention_days: u32,
    pub replay_retention_hours: u32,
    /// Periodic drain interval; `None` disables the timer
    pub sync_interval_secs: Option<u64>,
    pub replay_path_prefix: String,
    /// Per-kind endpoint overrides, keyed by kind name
    pub endpoints: BTreeMap<EntityKind, String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            auth_token: None,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            max_retries: DEFAULT_MAX_RETRIES,
            history_retention_days: DEFAULT_HISTORY_RETENTION_DAYS,
            replay_retention_hours: DEFAULT_REPLAY_RETENTION_HOURS,
            sync_interval_secs: None,
            replay_path_prefix: DEFAULT_REPLAY_PATH_PREFIX.to_string(),
            endpoints: BTreeMap::new(),
        }
    }
}

impl std::fmt::Debug for EngineConfig {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("EngineConfig")
            .field("api_base_url", &self.api_base_url)
            .field(
                "auth_token",
                &self.auth_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("max_retries", &self.max_retries)
            .field("history_retention_days", &self.history_retention_days)
            .field("replay_retention_hours", &self.replay_retention_hours)
            .field("sync_interval_secs", &self.sync_interval_secs)
            .field("replay_path_prefix", &self.replay_path_prefix)
            .field("endpoints", &self.endpoints)
            .finish()
    }
}

impl EngineConfig {
    /// Load and validate a JSON config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|error| {
            Error::Config(format!("failed to read {}: {error}", path.display()))
        })?;
        parse_engine_config(&raw)
    }

    /// Defaults overlaid with `HERDSYNC_API_URL` / `HERDSYNC_API_TOKEN`
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values from `lookup`
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(url) = normalize_text_option(lookup(API_URL_ENV)) {
            config.api_base_url = url;
        }
        config.auth_token = normalize_text_option(lookup(API_TOKEN_ENV));
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Check invariants the engine relies on
    pub fn validate(&self) -> Result<()> {
        if !is_http_url(&self.api_base_url) {
            return Err(Error::Config(
                "api_base_url must include http:// or https://".to_string(),
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(Error::Config(
                "request_timeout_secs must be positive".to_string(),
            ));
        }
        if self.max_retries == 0 {
            return Err(Error::Config("max_retries must be positive".to_string()));
        }
        if self.replay_retention_hours == 0 {
            return Err(Error::Config(
                "replay_retention_hours must be positive".to_string(),
            ));
        }
        if self.sync_interval_secs == Some(0) {
            return Err(Error::Config(
                "sync_interval_secs must be positive when set".to_string(),
            ));
        }
        if !self.replay_path_prefix.starts_with('/') {
            return Err(Error::Config(
                "replay_path_prefix must start with '/'".to_string(),
            ));
        }
        if let Some((kind, path)) = self.endpoints.iter().find(|(_, path)| !path.starts_with('/')) {
            return Err(Error::Config(format!(
                "endpoint for {kind} must start with '/' (got '{}')",
                compact_text(path)
            )));
        }
        Ok(())
    }

    /// Endpoint path for `kind`, honoring overrides
    pub fn endpoint(&self, kind: EntityKind) -> &str {
        self.endpoints
            .get(&kind)
            .map_or_else(|| kind.default_endpoint(), String::as_str)
    }

    /// Absolute collection URL for `kind`
    pub fn collection_url(&self, kind: EntityKind) -> String {
        format!("{}{}", self.api_base_url, self.endpoint(kind))
    }

    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn sync_interval(&self) -> Option<Duration> {
        self.sync_interval_secs.map(Duration::from_secs)
    }

    /// History older than this is pruned at startup (Unix ms span)
    pub fn history_retention_millis(&self) -> i64 {
        i64::from(self.history_retention_days) * 24 * 60 * 60 * 1000
    }

    /// Which outgoing requests the replay layer captures
    pub fn replay_policy(&self) -> ReplayPolicy {
        ReplayPolicy::new(
            self.replay_path_prefix.clone(),
            Duration::from_secs(u64::from(self.replay_retention_hours) * 60 * 60),
        )
    }

    fn normalize(&mut self) {
        self.api_base_url = self.api_base_url.trim().trim_end_matches('/').to_string();
        self.auth_token = normalize_text_option(self.auth_token.take());
    }
}

/// Parse and validate an engine config from raw JSON.
pub fn parse_engine_config(raw: &str) -> Result<EngineConfig> {
    let mut config: EngineConfig = serde_json::from_str(raw)
        .map_err(|error| Error::Config(format!("invalid engine config JSON: {error}")))?;
    config.normalize();
    config.validate()?;
    Ok(config)
}
