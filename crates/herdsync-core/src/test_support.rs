//! In-memory doubles for the authority and the replay transport.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

use serde_json::Value;

use crate::models::{merge_payload, payload_id, remote_updated_at, EntityKind, Payload};
use crate::replay::{ReplayRequest, ReplayResponse, RequestSender, TransportFailure};
use crate::sync::{Authority, AuthorityError, AuthorityResult};
use crate::util::now_millis;

pub fn payload(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        other => panic!("expected a JSON object, got {other}"),
    }
}

#[derive(Default)]
struct AuthorityState {
    records: BTreeMap<(EntityKind, String), Payload>,
    push_failures: HashMap<String, AuthorityError>,
    fetch_failure: Option<AuthorityError>,
    calls: Vec<String>,
    last_stamp: i64,
    server_ids: bool,
    empty_push_responses: bool,
}

impl AuthorityState {
    fn stamp(&mut self, previous: Option<i64>) -> i64 {
        let floor = previous.unwrap_or(0).max(self.last_stamp) + 1;
        self.last_stamp = now_millis().max(floor);
        self.last_stamp
    }

    fn push_failure(&self, id: &str) -> AuthorityResult<()> {
        self.push_failures
            .get(id)
            .map_or(Ok(()), |error| Err(error.clone()))
    }
}

/// Authority backed by a map, with scriptable failures
#[derive(Default)]
pub struct MockAuthority {
    state: Mutex<AuthorityState>,
}

impl MockAuthority {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a record as-is, as if another client wrote it
    pub fn seed(&self, kind: EntityKind, data: Payload) {
        let id = payload_id(&data).expect("seeded record needs an id");
        self.state.lock().unwrap().records.insert((kind, id), data);
    }

    pub fn record(&self, kind: EntityKind, id: &str) -> Option<Payload> {
        self.state
            .lock()
            .unwrap()
            .records
            .get(&(kind, id.to_string()))
            .cloned()
    }

    /// Fail every create, update or delete of `id`
    pub fn fail_pushes_for(&self, id: &str, error: AuthorityError) {
        self.state
            .lock()
            .unwrap()
            .push_failures
            .insert(id.to_string(), error);
    }

    pub fn fail_fetches(&self, error: AuthorityError) {
        self.state.lock().unwrap().fetch_failure = Some(error);
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock().unwrap();
        state.push_failures.clear();
        state.fetch_failure = None;
    }

    /// Calls in order, e.g. `create animal cow-1`
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Give created records a `srv-` prefixed id
    pub fn assign_server_ids(&self) {
        self.state.lock().unwrap().server_ids = true;
    }

    /// Accept creates and updates without echoing the stored record
    pub fn answer_pushes_without_body(&self) {
        self.state.lock().unwrap().empty_push_responses = true;
    }
}

impl Authority for MockAuthority {
    async fn create(&self, kind: EntityKind, payload: &Payload) -> AuthorityResult<Option<Payload>> {
        let mut state = self.state.lock().unwrap();
        let local_id = payload_id(payload).unwrap_or_else(|| "new".to_string());
        state.calls.push(format!("create {kind} {local_id}"));
        state.push_failure(&local_id)?;

        let id = if state.server_ids {
            format!("srv-{local_id}")
        } else {
            local_id
        };
        let mut stored = payload.clone();
        stored.insert("id".to_string(), Value::String(id.clone()));
        let stamp = state.stamp(None);
        stored.insert("updated_at".to_string(), Value::from(stamp));
        state.records.insert((kind, id), stored.clone());
        Ok((!state.empty_push_responses).then_some(stored))
    }

    async fn update(
        &self,
        kind: EntityKind,
        id: &str,
        payload: &Payload,
    ) -> AuthorityResult<Option<Payload>> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("update {kind} {id}"));
        state.push_failure(id)?;

        let key = (kind, id.to_string());
        let Some(mut stored) = state.records.get(&key).cloned() else {
            return Err(AuthorityError::from_status(404, "Not found"));
        };
        merge_payload(&mut stored, payload.clone());
        stored.insert("id".to_string(), Value::String(id.to_string()));
        let stamp = state.stamp(remote_updated_at(&stored));
        stored.insert("updated_at".to_string(), Value::from(stamp));
        state.records.insert(key, stored.clone());
        Ok((!state.empty_push_responses).then_some(stored))
    }

    async fn delete(&self, kind: EntityKind, id: &str) -> AuthorityResult<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("delete {kind} {id}"));
        state.push_failure(id)?;
        match state.records.remove(&(kind, id.to_string())) {
            Some(_) => Ok(()),
            None => Err(AuthorityError::from_status(404, "Not found")),
        }
    }

    async fn fetch(&self, kind: EntityKind, id: &str) -> AuthorityResult<Payload> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("fetch {kind} {id}"));
        if let Some(error) = &state.fetch_failure {
            return Err(error.clone());
        }
        state
            .records
            .get(&(kind, id.to_string()))
            .cloned()
            .ok_or_else(|| AuthorityError::from_status(404, "Not found"))
    }

    async fn fetch_all(&self, kind: EntityKind) -> AuthorityResult<Vec<Payload>> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("fetch_all {kind}"));
        if let Some(error) = &state.fetch_failure {
            return Err(error.clone());
        }
        Ok(state
            .records
            .iter()
            .filter(|((record_kind, _), _)| *record_kind == kind)
            .map(|(_, data)| data.clone())
            .collect())
    }
}

#[derive(Default)]
struct SenderState {
    scripted: VecDeque<u16>,
    fallback: Option<u16>,
    sent: Vec<String>,
}

/// Replay transport answering from a script, or failing when none is set
#[derive(Default)]
pub struct MockSender {
    state: Mutex<SenderState>,
}

impl MockSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every request with `status`
    pub fn respond(&self, status: u16) {
        self.state.lock().unwrap().fallback = Some(status);
    }

    /// Answer the next requests with these statuses, in order
    pub fn respond_in_order(&self, statuses: &[u16]) {
        self.state.lock().unwrap().scripted.extend(statuses);
    }

    pub fn fail_transport(&self) {
        self.state.lock().unwrap().fallback = None;
    }

    /// URLs of every attempted request, including failed ones
    pub fn sent_urls(&self) -> Vec<String> {
        self.state.lock().unwrap().sent.clone()
    }
}

impl RequestSender for MockSender {
    async fn send(&self, request: &ReplayRequest) -> Result<ReplayResponse, TransportFailure> {
        let mut state = self.state.lock().unwrap();
        state.sent.push(request.url.clone());
        let status = state.scripted.pop_front().or(state.fallback);
        status
            .map(|status| ReplayResponse {
                status,
                body: Vec::new(),
            })
            .ok_or_else(|| TransportFailure("connection refused".to_string()))
    }
}
