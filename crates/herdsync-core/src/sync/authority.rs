//! Remote authority client.

use std::future::Future;

use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::config::EngineConfig;
use crate::models::{EntityKind, Payload};
use crate::util::compact_text;

/// How a failed authority call should be treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The request may not have reached the authority; retry later
    Network,
    /// 4xx: the authority refused this mutation; retrying will not help
    Client,
    /// 5xx: try again on the next cycle
    Server,
    /// The response could not be understood
    Payload,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthorityError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("Request timed out")]
    Timeout,
    #[error("Rejected by authority: {message} ({status})")]
    Client { status: u16, message: String },
    #[error("Authority failed: {message} ({status})")]
    Server { status: u16, message: String },
    #[error("Invalid authority payload: {0}")]
    InvalidPayload(String),
}

pub type AuthorityResult<T> = Result<T, AuthorityError>;

impl AuthorityError {
    /// Classify a non-success HTTP status
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        if (400..500).contains(&status) {
            Self::Client { status, message }
        } else {
            Self::Server { status, message }
        }
    }

    pub const fn kind(&self) -> FailureKind {
        match self {
            Self::Network(_) | Self::Timeout => FailureKind::Network,
            Self::Client { .. } => FailureKind::Client,
            Self::Server { .. } => FailureKind::Server,
            Self::InvalidPayload(_) => FailureKind::Payload,
        }
    }

    pub const fn status(&self) -> Option<u16> {
        match self {
            Self::Client { status, .. } | Self::Server { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for AuthorityError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::Timeout
        } else if error.is_decode() {
            Self::InvalidPayload(error.to_string())
        } else if let Some(status) = error.status() {
            Self::from_status(status.as_u16(), error.to_string())
        } else {
            Self::Network(error.to_string())
        }
    }
}

/// The remote system of record.
///
/// Implementations must be cheap to share across tasks; the engine calls
/// them without holding the database lock.
pub trait Authority: Send + Sync + 'static {
    /// Create a record; returns the authority's copy when it sends one back
    fn create(
        &self,
        kind: EntityKind,
        payload: &Payload,
    ) -> impl Future<Output = AuthorityResult<Option<Payload>>> + Send;

    /// Apply changed fields to a record
    fn update(
        &self,
        kind: EntityKind,
        id: &str,
        payload: &Payload,
    ) -> impl Future<Output = AuthorityResult<Option<Payload>>> + Send;

    fn delete(&self, kind: EntityKind, id: &str)
        -> impl Future<Output = AuthorityResult<()>> + Send;

    /// Current authority copy of one record
    fn fetch(&self, kind: EntityKind, id: &str)
        -> impl Future<Output = AuthorityResult<Payload>> + Send;

    /// Every record of a kind visible to the signed-in user
    fn fetch_all(&self, kind: EntityKind)
        -> impl Future<Output = AuthorityResult<Vec<Payload>>> + Send;
}

/// REST authority over reqwest
#[derive(Clone)]
pub struct HttpAuthority {
    client: reqwest::Client,
    config: EngineConfig,
}

impl HttpAuthority {
    pub fn new(config: &EngineConfig) -> crate::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|error| crate::Error::Config(format!("failed to build HTTP client: {error}")))?;
        Ok(Self {
            client,
            config: config.clone(),
        })
    }

    fn collection_url(&self, kind: EntityKind) -> String {
        self.config.collection_url(kind)
    }

    fn record_url(&self, kind: EntityKind, id: &str) -> String {
        format!(
            "{}/{}",
            self.collection_url(kind),
            urlencoding::encode(id)
        )
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let builder = self
            .client
            .request(method, url)
            .header(reqwest::header::ACCEPT, "application/json");
        match &self.config.auth_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> AuthorityResult<String> {
        let response = builder.send().await?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if status.is_success() {
            Ok(body)
        } else {
            Err(AuthorityError::from_status(
                status.as_u16(),
                parse_api_error(status, &body),
            ))
        }
    }
}

impl Authority for HttpAuthority {
    async fn create(&self, kind: EntityKind, payload: &Payload) -> AuthorityResult<Option<Payload>> {
        let url = self.collection_url(kind);
        let body = self
            .send(self.request(reqwest::Method::POST, &url).json(payload))
            .await?;
        Ok(parse_record_lenient(&body))
    }

    async fn update(
        &self,
        kind: EntityKind,
        id: &str,
        payload: &Payload,
    ) -> AuthorityResult<Option<Payload>> {
        let url = self.record_url(kind, id);
        let body = self
            .send(self.request(reqwest::Method::PUT, &url).json(payload))
            .await?;
        Ok(parse_record_lenient(&body))
    }

    async fn delete(&self, kind: EntityKind, id: &str) -> AuthorityResult<()> {
        let url = self.record_url(kind, id);
        self.send(self.request(reqwest::Method::DELETE, &url))
            .await?;
        Ok(())
    }

    async fn fetch(&self, kind: EntityKind, id: &str) -> AuthorityResult<Payload> {
        let url = self.record_url(kind, id);
        let body = self.send(self.request(reqwest::Method::GET, &url)).await?;
        parse_record_lenient(&body).ok_or_else(|| {
            AuthorityError::InvalidPayload(format!(
                "expected a {kind} object, got: {}",
                compact_text(&body)
            ))
        })
    }

    async fn fetch_all(&self, kind: EntityKind) -> AuthorityResult<Vec<Payload>> {
        let url = self.collection_url(kind);
        let body = self.send(self.request(reqwest::Method::GET, &url)).await?;
        parse_record_list(&body)
    }
}

/// A single record, possibly wrapped in `{"data": {...}}`
fn parse_record_lenient(body: &str) -> Option<Payload> {
    match serde_json::from_str::<Value>(body).ok()? {
        Value::Object(mut map) => match map.remove("data") {
            Some(Value::Object(inner)) if !map.contains_key("id") => Some(inner),
            Some(other) => {
                map.insert("data".to_string(), other);
                Some(map)
            }
            None => Some(map),
        },
        _ => None,
    }
}

/// A bare array or an array under `items` / `data`
fn parse_record_list(body: &str) -> AuthorityResult<Vec<Payload>> {
    let value: Value = serde_json::from_str(body)
        .map_err(|error| AuthorityError::InvalidPayload(error.to_string()))?;
    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("items").or_else(|| map.remove("data")) {
            Some(Value::Array(items)) => items,
            _ => {
                return Err(AuthorityError::InvalidPayload(
                    "response did not include a record list".to_string(),
                ))
            }
        },
        _ => {
            return Err(AuthorityError::InvalidPayload(
                "response did not include a record list".to_string(),
            ))
        }
    };

    Ok(items
        .into_iter()
        .filter_map(|item| match item {
            Value::Object(map) => Some(map),
            _ => None,
        })
        .collect())
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    detail: Option<Value>,
    error: Option<String>,
    message: Option<String>,
}

fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<ApiErrorBody>(body) {
        let detail = payload.detail.map(|detail| match detail {
            Value::String(text) => text,
            other => other.to_string(),
        });
        if let Some(message) = detail.or(payload.message).or(payload.error) {
            return compact_text(&message);
        }
    }

    let trimmed = compact_text(body);
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        trimmed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::payload;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn authority_for(server: &MockServer) -> HttpAuthority {
        let config = EngineConfig {
            api_base_url: server.uri(),
            auth_token: Some("token-123".to_string()),
            request_timeout_secs: 2,
            ..EngineConfig::default()
        };
        HttpAuthority::new(&config).unwrap()
    }

    #[tokio::test]
    async fn create_posts_payload_and_returns_authority_copy() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/cows"))
            .and(header("authorization", "Bearer token-123"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "id": "srv-1",
                "name": "Bessie",
                "updated_at": "2024-05-01T10:00:00Z"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let created = authority_for(&server)
            .create(EntityKind::Animal, &payload(json!({"id": "local-1", "name": "Bessie"})))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(created["id"], json!("srv-1"));
    }

    #[tokio::test]
    async fn update_encodes_record_id() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/api/v1/milk-logs/log%201"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let updated = authority_for(&server)
            .update(EntityKind::MilkLog, "log 1", &payload(json!({"litres": 12.5})))
            .await
            .unwrap();
        assert_eq!(updated, None);
    }

    #[tokio::test]
    async fn status_codes_are_classified() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/api/v1/cows/cow-1"))
            .respond_with(
                ResponseTemplate::new(409).set_body_json(json!({"detail": "Tag number already used"})),
            )
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/api/v1/cows/cow-1"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let authority = authority_for(&server);
        let conflict = authority
            .update(EntityKind::Animal, "cow-1", &Payload::new())
            .await
            .unwrap_err();
        assert_eq!(
            conflict,
            AuthorityError::Client {
                status: 409,
                message: "Tag number already used".to_string()
            }
        );
        assert_eq!(conflict.kind(), FailureKind::Client);

        let unavailable = authority
            .delete(EntityKind::Animal, "cow-1")
            .await
            .unwrap_err();
        assert_eq!(unavailable.kind(), FailureKind::Server);
        assert_eq!(unavailable.status(), Some(503));
    }

    #[tokio::test]
    async fn unreachable_authority_is_a_network_failure() {
        let config = EngineConfig {
            api_base_url: "http://127.0.0.1:1".to_string(),
            request_timeout_secs: 2,
            ..EngineConfig::default()
        };
        let error = HttpAuthority::new(&config)
            .unwrap()
            .fetch(EntityKind::Feed, "f1")
            .await
            .unwrap_err();
        assert_eq!(error.kind(), FailureKind::Network);
    }

    #[tokio::test]
    async fn fetch_all_accepts_wrapped_lists() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/feeds/custom"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": [
                    {"id": "f1", "name": "Mix A", "updated_at": 1},
                    {"id": "f2", "name": "Mix B", "updated_at": 2},
                    "not a record"
                ]
            })))
            .mount(&server)
            .await;

        let records = authority_for(&server)
            .fetch_all(EntityKind::Feed)
            .await
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1]["name"], json!("Mix B"));
    }

    #[tokio::test]
    async fn fetch_rejects_non_object_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/diet/d1"))
            .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
            .mount(&server)
            .await;

        let error = authority_for(&server)
            .fetch(EntityKind::DietPlan, "d1")
            .await
            .unwrap_err();
        assert_eq!(error.kind(), FailureKind::Payload);
    }

    #[test]
    fn parse_api_error_falls_back_to_status() {
        assert_eq!(parse_api_error(StatusCode::BAD_GATEWAY, "  "), "HTTP 502");
        assert_eq!(
            parse_api_error(StatusCode::BAD_REQUEST, r#"{"message":"weight must be positive"}"#),
            "weight must be positive"
        );
    }
}
