//! Request replay for mutating API calls.
//!
//! Requests that never reached the server are stored and re-sent in order
//! once connectivity returns. Any response, including 4xx and 5xx, settles a
//! request: it is never stored or replayed again.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::db::{ReplayRepository, SharedDatabase};
use crate::error::Result;
use crate::sync::{BackgroundTasks, Connectivity};
use crate::util::now_millis;

const REPLAY_METHODS: [&str; 4] = ["POST", "PUT", "PATCH", "DELETE"];

/// An outgoing HTTP request in a storable form
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayRequest {
    pub method: String,
    /// Absolute URL
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

impl ReplayRequest {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// JSON body with a matching content type
    pub fn json<T: Serialize>(mut self, body: &T) -> Result<Self> {
        self.body = Some(serde_json::to_vec(body)?);
        Ok(self.header("content-type", "application/json"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

/// The request never produced a response (connect failure, timeout, reset)
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Transport failure: {0}")]
pub struct TransportFailure(pub String);

/// A stored request awaiting replay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayEntry {
    pub id: i64,
    pub request: ReplayRequest,
    /// Unix ms
    pub enqueued_at: i64,
    pub attempts: u32,
    pub last_error: Option<String>,
}

/// Something that can put a request on the wire
pub trait RequestSender: Send + Sync + 'static {
    fn send(
        &self,
        request: &ReplayRequest,
    ) -> impl Future<Output = std::result::Result<ReplayResponse, TransportFailure>> + Send;
}

impl RequestSender for reqwest::Client {
    async fn send(
        &self,
        request: &ReplayRequest,
    ) -> std::result::Result<ReplayResponse, TransportFailure> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|error| TransportFailure(format!("invalid method: {error}")))?;
        let mut builder = self.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder
            .send()
            .await
            .map_err(|error| TransportFailure(error.to_string()))?;
        let status = response.status().as_u16();
        // The server answered; a body that fails to read does not change that
        let body = response
            .bytes()
            .await
            .map(|bytes| bytes.to_vec())
            .unwrap_or_default();
        Ok(ReplayResponse { status, body })
    }
}

/// Which requests are captured and how long they are kept
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayPolicy {
    path_prefix: String,
    retention: Duration,
}

impl ReplayPolicy {
    pub fn new(path_prefix: impl Into<String>, retention: Duration) -> Self {
        Self {
            path_prefix: path_prefix.into(),
            retention,
        }
    }

    /// Mutating method and a URL path under the prefix
    pub fn matches(&self, request: &ReplayRequest) -> bool {
        let method = request.method.to_ascii_uppercase();
        if !REPLAY_METHODS.contains(&method.as_str()) {
            return false;
        }
        reqwest::Url::parse(&request.url)
            .is_ok_and(|url| url.path().starts_with(&self.path_prefix))
    }

    pub const fn retention(&self) -> Duration {
        self.retention
    }

    fn retention_millis(&self) -> i64 {
        i64::try_from(self.retention.as_millis()).unwrap_or(i64::MAX)
    }
}

/// What `ReplayLayer::send` did with a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    Delivered(ReplayResponse),
    /// Stored for replay after a transport failure
    Queued { entry_id: i64 },
}

/// Totals for one replay pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
    pub delivered: usize,
    /// Answered with 4xx and dropped
    pub rejected: usize,
    /// Answered with 5xx and dropped
    pub dropped: usize,
    /// Older than the retention window
    pub expired: usize,
    pub remaining: usize,
    /// Stopped at a transport failure
    pub stalled: bool,
}

/// Store-and-forward wrapper around a `RequestSender`
pub struct ReplayLayer<S> {
    inner: Arc<ReplayInner<S>>,
}

impl<S> Clone for ReplayLayer<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct ReplayInner<S> {
    sender: S,
    db: SharedDatabase,
    connectivity: Connectivity,
    policy: ReplayPolicy,
    replaying: AtomicBool,
}

impl<S: RequestSender> ReplayLayer<S> {
    pub fn new(
        sender: S,
        db: SharedDatabase,
        connectivity: Connectivity,
        policy: ReplayPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(ReplayInner {
                sender,
                db,
                connectivity,
                policy,
                replaying: AtomicBool::new(false),
            }),
        }
    }

    pub fn policy(&self) -> &ReplayPolicy {
        &self.inner.policy
    }

    /// Send a request, storing it for replay if it matches the policy and
    /// never reached the server
    pub async fn send(&self, request: ReplayRequest) -> Result<Dispatch> {
        match self.inner.sender.send(&request).await {
            Ok(response) => Ok(Dispatch::Delivered(response)),
            Err(failure) if self.inner.policy.matches(&request) => {
                let enqueued_at = now_millis();
                let entry_id = {
                    let db = self.inner.db.lock().await;
                    ReplayRepository::new(db.connection()).insert(&request, enqueued_at)?
                };
                tracing::info!(
                    "Stored {} {} for replay: {failure}",
                    request.method,
                    request.url
                );
                Ok(Dispatch::Queued { entry_id })
            }
            Err(failure) => Err(failure.into()),
        }
    }

    /// Stored requests, oldest first
    pub async fn pending(&self) -> Result<Vec<ReplayEntry>> {
        let db = self.inner.db.lock().await;
        ReplayRepository::new(db.connection()).list()
    }

    /// Re-send stored requests in order.
    ///
    /// Expired entries are dropped first. A transport failure leaves the
    /// request at the head of the queue and ends the pass.
    pub async fn replay(&self) -> Result<ReplayReport> {
        if self.inner.replaying.swap(true, Ordering::AcqRel) {
            return Ok(ReplayReport::default());
        }
        let result = self.replay_pass().await;
        self.inner.replaying.store(false, Ordering::Release);
        result
    }

    async fn replay_pass(&self) -> Result<ReplayReport> {
        let mut report = ReplayReport::default();
        let cutoff = now_millis() - self.inner.policy.retention_millis();
        report.expired = {
            let db = self.inner.db.lock().await;
            ReplayRepository::new(db.connection()).prune_older_than(cutoff)?
        };
        if report.expired > 0 {
            tracing::warn!("Dropped {} expired replay requests", report.expired);
        }

        loop {
            let front = {
                let db = self.inner.db.lock().await;
                ReplayRepository::new(db.connection()).front()?
            };
            let Some(entry) = front else {
                break;
            };

            let sent = self.inner.sender.send(&entry.request).await;
            let db = self.inner.db.lock().await;
            let repo = ReplayRepository::new(db.connection());
            match sent {
                Ok(response) if response.status >= 500 => {
                    repo.remove(entry.id)?;
                    report.dropped += 1;
                    tracing::warn!(
                        "Replay of {} {} failed with HTTP {}; dropping",
                        entry.request.method,
                        entry.request.url,
                        response.status
                    );
                }
                Ok(response) if response.status >= 400 => {
                    repo.remove(entry.id)?;
                    report.rejected += 1;
                    tracing::warn!(
                        "Replay of {} {} rejected with HTTP {}",
                        entry.request.method,
                        entry.request.url,
                        response.status
                    );
                }
                Ok(_) => {
                    repo.remove(entry.id)?;
                    report.delivered += 1;
                }
                Err(failure) => {
                    repo.record_attempt(entry.id, &failure.0)?;
                    report.stalled = true;
                    tracing::debug!("Replay stalled: {failure}");
                    break;
                }
            }
        }

        report.remaining = {
            let db = self.inner.db.lock().await;
            ReplayRepository::new(db.connection()).count()?
        };
        if report.delivered > 0 {
            tracing::info!("Replayed {} stored requests", report.delivered);
        }
        Ok(report)
    }

    /// Replay now if online, then again on every reconnect
    pub fn start(&self) -> BackgroundTasks {
        let mut tasks = BackgroundTasks::default();
        let layer = self.clone();
        let mut online_rx = self.inner.connectivity.subscribe();
        let mut was_online = *online_rx.borrow_and_update();

        tasks.push(tokio::spawn(async move {
            if was_online {
                layer.replay_logged().await;
            }
            while online_rx.changed().await.is_ok() {
                let online = *online_rx.borrow_and_update();
                if online && !was_online {
                    layer.replay_logged().await;
                }
                was_online = online;
            }
        }));
        tasks
    }

    async fn replay_logged(&self) {
        if let Err(error) = self.replay().await {
            tracing::warn!("Request replay failed: {error}");
        }
    }
}
