//! In-memory fakes for tests.
//!
//! [`ScriptedBackend`] replays canned attempt outcomes underneath a
//! [`RetryingTransport`](crate::RetryingTransport). [`MemoryRegistry`] stands in
//! for the whole registry API behind the [`Transport`] trait.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde_json::{json, Value};

use crate::endpoints;
use crate::entity::EntitySummary;
use crate::error::{body_preview, NetworkError, NetworkErrorKind, TransportError};
use crate::transport::{ApiRequest, ApiResponse, HttpBackend, RawResponse, Transport};

type Attempt = Result<RawResponse, NetworkError>;

// ---------------------------------------------------------------------------
// ScriptedBackend
// ---------------------------------------------------------------------------

/// Replays queued outcomes, one per attempt.
pub struct ScriptedBackend {
    script: Mutex<VecDeque<Attempt>>,
    fallback: Option<Attempt>,
    requests: Mutex<Vec<ApiRequest>>,
}

impl ScriptedBackend {
    pub fn new(script: impl IntoIterator<Item = Attempt>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            fallback: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Every attempt yields the same outcome.
    pub fn always(outcome: Attempt) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Some(outcome),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<ApiRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl HttpBackend for ScriptedBackend {
    async fn execute(&self, request: &ApiRequest) -> Result<RawResponse, NetworkError> {
        self.requests.lock().unwrap().push(request.clone());
        let next = self.script.lock().unwrap().pop_front();
        match (next, &self.fallback) {
            (Some(outcome), _) => outcome,
            (None, Some(outcome)) => outcome.clone(),
            (None, None) => Err(NetworkError::new(
                NetworkErrorKind::InvalidRequest,
                "script exhausted",
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// MemoryRegistry
// ---------------------------------------------------------------------------

/// How the fake renders listing responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListShape {
    /// `{"results": [...], "totalCount": n}`
    Paged,
    /// `{"items": [...]}` with no total.
    PagedWithoutTotal,
    /// The whole collection as a bare array.
    Bare,
}

#[derive(Default)]
struct RegistryState {
    user_order: Vec<String>,
    users: HashMap<String, Value>,
    subjects: Vec<Value>,
    projects: Vec<Value>,
    concepts_loaded: HashMap<String, bool>,
    document_counts: HashMap<String, u64>,
    failing_details: HashMap<String, u16>,
    failing_writes: HashMap<String, u16>,
    max_page_size: Option<u32>,
    requests: Vec<ApiRequest>,
    writes: Vec<ApiRequest>,
}

/// An in-memory registry answering the endpoints in [`crate::endpoints`].
pub struct MemoryRegistry {
    shape: ListShape,
    latency: Option<Duration>,
    state: Mutex<RegistryState>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::with_shape(ListShape::Paged)
    }

    pub fn with_shape(shape: ListShape) -> Self {
        Self {
            shape,
            latency: None,
            state: Mutex::new(RegistryState::default()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Delay every response, so concurrent callers overlap.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Insert or replace a user, keyed by the first id key it carries.
    pub fn insert_user(&self, user: Value) {
        let id = EntitySummary::from_value(user.clone()).id.unwrap_or_default();
        let mut state = self.state.lock().unwrap();
        if !state.users.contains_key(&id) {
            state.user_order.push(id.clone());
        }
        state.users.insert(id, user);
    }

    pub fn insert_subject(&self, subject: Value, concepts_loaded: Option<bool>, documents: u64) {
        let id = subject["id"].as_str().unwrap_or_default().to_string();
        let mut state = self.state.lock().unwrap();
        if let Some(loaded) = concepts_loaded {
            state.concepts_loaded.insert(id.clone(), loaded);
        }
        state.document_counts.insert(id, documents);
        state.subjects.push(subject);
    }

    pub fn insert_project(&self, project: Value) {
        self.state.lock().unwrap().projects.push(project);
    }

    /// Detail fetches for `id` answer with `status`.
    pub fn fail_detail(&self, id: &str, status: u16) {
        self.state
            .lock()
            .unwrap()
            .failing_details
            .insert(id.to_string(), status);
    }

    /// Writes for `id` answer with `status`.
    pub fn fail_write(&self, id: &str, status: u16) {
        self.state
            .lock()
            .unwrap()
            .failing_writes
            .insert(id.to_string(), status);
    }

    /// Listing requests with a larger `pageSize` answer 500.
    pub fn reject_page_size_over(&self, max: u32) {
        self.state.lock().unwrap().max_page_size = Some(max);
    }

    pub fn user(&self, id: &str) -> Option<Value> {
        self.state.lock().unwrap().users.get(id).cloned()
    }

    pub fn user_count(&self) -> usize {
        self.state.lock().unwrap().users.len()
    }

    /// Every PUT and POST received, in arrival order.
    pub fn writes(&self) -> Vec<ApiRequest> {
        self.state.lock().unwrap().writes.clone()
    }

    pub fn requests(&self) -> Vec<ApiRequest> {
        self.state.lock().unwrap().requests.clone()
    }

    /// Requests made against `path`, ignoring the query string.
    pub fn calls_to(&self, path: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .requests
            .iter()
            .filter(|r| r.path == path)
            .count()
    }

    /// Highest number of requests observed in flight at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn respond(&self, request: &ApiRequest) -> Result<Value, (u16, String)> {
        let mut state = self.state.lock().unwrap();
        state.requests.push(request.clone());

        let path = request.path.as_str();
        let user_id = path
            .strip_prefix(endpoints::USERS)
            .and_then(|rest| rest.strip_prefix('/'))
            .filter(|rest| !rest.is_empty() && !rest.contains('/'))
            .map(decode_segment);
        let user_id = user_id.as_deref();
        let subject_status = path
            .strip_prefix(endpoints::SUBJECTS)
            .and_then(|rest| rest.strip_prefix('/'))
            .and_then(|rest| rest.strip_suffix("/status/clinical-concepts"))
            .filter(|rest| !rest.contains('/'))
            .map(decode_segment);
        let subject_status = subject_status.as_deref();

        match request.method {
            Method::GET if path == endpoints::USERS => {
                let users: Vec<Value> = state
                    .user_order
                    .iter()
                    .filter_map(|id| state.users.get(id).cloned())
                    .collect();
                self.list(&state, request, users)
            }
            Method::GET if path == endpoints::SUBJECTS => {
                let subjects = state.subjects.clone();
                self.list(&state, request, subjects)
            }
            Method::GET if path == endpoints::PROJECTS => Ok(Value::Array(state.projects.clone())),
            Method::GET if path == endpoints::DOCUMENTS => {
                let subject = request.query_value("subjectId").unwrap_or_default();
                let total = state.document_counts.get(subject).copied().unwrap_or(0);
                Ok(json!({"results": [], "totalCount": total}))
            }
            Method::GET => {
                if let Some(id) = user_id {
                    if let Some(status) = state.failing_details.get(id) {
                        return Err((*status, format!("detail failure for {}", id)));
                    }
                    return state
                        .users
                        .get(id)
                        .cloned()
                        .ok_or_else(|| (404, format!("user {} not found", id)));
                }
                if let Some(id) = subject_status {
                    return state
                        .concepts_loaded
                        .get(id)
                        .map(|loaded| json!({"loaded": loaded}))
                        .ok_or_else(|| (404, format!("no status for {}", id)));
                }
                Err((404, format!("no route for GET {}", path)))
            }
            Method::PUT => {
                let Some(id) = user_id else {
                    return Err((404, format!("no route for PUT {}", path)));
                };
                state.writes.push(request.clone());
                if let Some(status) = state.failing_writes.get(id) {
                    return Err((*status, format!("write failure for {}", id)));
                }
                if !state.users.contains_key(id) {
                    return Err((404, format!("user {} not found", id)));
                }
                let body = request.body.clone().unwrap_or(Value::Null);
                state.users.insert(id.to_string(), body.clone());
                Ok(body)
            }
            Method::POST if path == endpoints::USERS => {
                state.writes.push(request.clone());
                let body = request.body.clone().unwrap_or(Value::Null);
                let id = body["id"].as_str().unwrap_or_default().to_string();
                let email = body["email"].as_str().unwrap_or_default().to_string();
                if let Some(status) = state
                    .failing_writes
                    .get(&id)
                    .or_else(|| state.failing_writes.get(&email))
                {
                    return Err((*status, format!("create failure for {}", email)));
                }
                if id.is_empty() || state.users.contains_key(&id) {
                    return Err((409, format!("cannot create user {:?}", id)));
                }
                state.user_order.push(id.clone());
                state.users.insert(id, body.clone());
                Ok(body)
            }
            _ => Err((405, format!("no route for {} {}", request.method, path))),
        }
    }

    fn list(
        &self,
        state: &RegistryState,
        request: &ApiRequest,
        all: Vec<Value>,
    ) -> Result<Value, (u16, String)> {
        if self.shape == ListShape::Bare {
            return Ok(Value::Array(all));
        }
        let page_number: usize = request
            .query_value("pageNumber")
            .and_then(|v| v.parse().ok())
            .unwrap_or(1);
        let page_size: usize = request
            .query_value("pageSize")
            .and_then(|v| v.parse().ok())
            .unwrap_or(50);
        if let Some(max) = state.max_page_size {
            if page_size > max as usize {
                return Err((500, "page size too large".to_string()));
            }
        }
        let total = all.len();
        let page: Vec<Value> = all
            .into_iter()
            .skip(page_number.saturating_sub(1) * page_size)
            .take(page_size)
            .collect();
        Ok(match self.shape {
            ListShape::Paged => json!({"results": page, "totalCount": total}),
            _ => json!({"items": page}),
        })
    }
}

fn decode_segment(segment: &str) -> String {
    urlencoding::decode(segment)
        .map(|decoded| decoded.into_owned())
        .unwrap_or_else(|_| segment.to_string())
}

#[async_trait]
impl Transport for MemoryRegistry {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, TransportError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let outcome = self.respond(&request);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match outcome {
            Ok(body) => Ok(ApiResponse::new(200, request.path, body.to_string())),
            Err((status, message)) => Err(TransportError::Status {
                method: request.method.to_string(),
                path: request.path,
                status,
                body_preview: body_preview(&message),
            }),
        }
    }
}
