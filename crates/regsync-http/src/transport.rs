//! HTTP transport with bounded retry.
//!
//! [`HttpBackend`] performs exactly one attempt on the wire.
//! [`RetryingTransport`] wraps a backend with the retry policy and is the
//! only [`Transport`] used in production. Tests swap the backend for
//! [`crate::fakes::ScriptedBackend`] or the whole transport for
//! [`crate::fakes::MemoryRegistry`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE, RETRY_AFTER};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::{RetryPolicy, RunConfig};
use crate::error::{body_preview, LastFailure, NetworkError, NetworkErrorKind, TransportError};

/// Statuses that are retried with backoff.
pub const RETRYABLE_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

pub const USER_AGENT: &str = concat!("regsync/", env!("CARGO_PKG_VERSION"));

/// Tenant header attached when a project id is configured.
pub const PROJECT_HEADER: &str = "ProjectId";

pub fn is_retryable_status(status: u16) -> bool {
    RETRYABLE_STATUSES.contains(&status)
}

// ---------------------------------------------------------------------------
// Request / response
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn put(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::PUT, path).with_body(body)
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::POST, path).with_body(body)
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// What one attempt saw on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct RawResponse {
    pub status: u16,
    /// `Retry-After` in delta-seconds form, when the server sent one.
    pub retry_after: Option<Duration>,
    pub body: String,
}

impl RawResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            retry_after: None,
            body: body.into(),
        }
    }

    pub fn json(status: u16, body: &Value) -> Self {
        Self::new(status, body.to_string())
    }

    pub fn with_retry_after(mut self, delay: Duration) -> Self {
        self.retry_after = Some(delay);
        self
    }
}

/// A successful (2xx) response.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub path: String,
    pub body: String,
}

impl ApiResponse {
    pub fn new(status: u16, path: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            status,
            path: path.into(),
            body: body.into(),
        }
    }

    /// Parse the body as JSON. An empty body parses as `null`.
    pub fn json(&self) -> Result<Value, TransportError> {
        if self.body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&self.body).map_err(|e| self.malformed(e.to_string()))
    }

    pub fn json_as<T: DeserializeOwned>(&self) -> Result<T, TransportError> {
        serde_json::from_str(&self.body).map_err(|e| self.malformed(e.to_string()))
    }

    fn malformed(&self, reason: String) -> TransportError {
        TransportError::Malformed {
            path: self.path.clone(),
            reason,
            body_preview: body_preview(&self.body),
        }
    }
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// One attempt, no retry.
#[async_trait]
pub trait HttpBackend: Send + Sync {
    async fn execute(&self, request: &ApiRequest) -> Result<RawResponse, NetworkError>;
}

/// The request surface every component talks to.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, TransportError>;

    async fn get_json(&self, path: &str) -> Result<Value, TransportError> {
        self.send(ApiRequest::get(path)).await?.json()
    }
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, TransportError> {
        (**self).send(request).await
    }
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Attempt counters shared with run metrics.
#[derive(Debug, Default)]
pub struct TransportStats {
    requests_sent: AtomicU64,
    retries: AtomicU64,
    gave_up: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStatsSnapshot {
    pub requests_sent: u64,
    pub retries: u64,
    pub gave_up: u64,
}

impl TransportStats {
    pub fn snapshot(&self) -> TransportStatsSnapshot {
        TransportStatsSnapshot {
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            gave_up: self.gave_up.load(Ordering::Relaxed),
        }
    }
}

// ---------------------------------------------------------------------------
// RetryingTransport
// ---------------------------------------------------------------------------

pub struct RetryingTransport<B> {
    backend: B,
    policy: RetryPolicy,
    stats: Arc<TransportStats>,
}

impl<B: HttpBackend> RetryingTransport<B> {
    pub fn new(backend: B, policy: RetryPolicy) -> Self {
        Self {
            backend,
            policy,
            stats: Arc::new(TransportStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<TransportStats> {
        Arc::clone(&self.stats)
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }
}

#[async_trait]
impl<B: HttpBackend> Transport for RetryingTransport<B> {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, TransportError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let method = request.method.to_string();
        let mut last = LastFailure::Network(NetworkError::connect("no attempt made"));

        for attempt in 1..=max_attempts {
            self.stats.requests_sent.fetch_add(1, Ordering::Relaxed);
            if attempt > 1 {
                self.stats.retries.fetch_add(1, Ordering::Relaxed);
            }

            let retry_after = match self.backend.execute(&request).await {
                Ok(raw) if (200..300).contains(&raw.status) => {
                    debug!(method = %method, path = %request.path, status = raw.status, attempt, "request ok");
                    return Ok(ApiResponse::new(raw.status, request.path.clone(), raw.body));
                }
                Ok(raw) if is_retryable_status(raw.status) => {
                    warn!(
                        method = %method,
                        path = %request.path,
                        status = raw.status,
                        attempt,
                        max_attempts,
                        "retryable status"
                    );
                    last = LastFailure::Status {
                        status: raw.status,
                        body_preview: body_preview(&raw.body),
                    };
                    raw.retry_after
                }
                Ok(raw) => {
                    return Err(TransportError::Status {
                        method,
                        path: request.path,
                        status: raw.status,
                        body_preview: body_preview(&raw.body),
                    });
                }
                Err(err) if err.is_retryable() => {
                    warn!(
                        method = %method,
                        path = %request.path,
                        attempt,
                        max_attempts,
                        error = %err,
                        "network error"
                    );
                    last = LastFailure::Network(err);
                    None
                }
                Err(err) => return Err(TransportError::InvalidRequest(err.message)),
            };

            if attempt < max_attempts {
                tokio::time::sleep(self.policy.delay_with_hint(attempt, retry_after)).await;
            }
        }

        self.stats.gave_up.fetch_add(1, Ordering::Relaxed);
        warn!(method = %method, path = %request.path, attempts = max_attempts, last = %last, "giving up");
        Err(TransportError::Exhausted {
            method,
            path: request.path,
            attempts: max_attempts,
            last,
        })
    }
}

// ---------------------------------------------------------------------------
// reqwest backend
// ---------------------------------------------------------------------------

/// Production backend. Holds one pooled `reqwest::Client`.
pub struct ReqwestBackend {
    client: reqwest::Client,
    base_url: String,
    token: String,
    project_id: Option<String>,
}

impl ReqwestBackend {
    pub fn new(config: &RunConfig) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
        Ok(Self {
            client,
            base_url: config.base_url().to_string(),
            token: config.token().to_string(),
            project_id: config.project_id.clone(),
        })
    }
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[async_trait]
impl HttpBackend for ReqwestBackend {
    async fn execute(&self, request: &ApiRequest) -> Result<RawResponse, NetworkError> {
        let url = reqwest::Url::parse(&format!("{}{}", self.base_url, request.path))
            .map_err(|e| NetworkError::new(NetworkErrorKind::InvalidRequest, e.to_string()))?;

        let mut builder = self
            .client
            .request(request.method.clone(), url)
            .bearer_auth(&self.token)
            .header(ACCEPT, "application/json")
            .header(CONTENT_TYPE, "application/json");
        if let Some(project_id) = &self.project_id {
            builder = builder.header(PROJECT_HEADER, project_id);
        }
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let retry_after = parse_retry_after(response.headers());
        let body = response.text().await?;
        Ok(RawResponse {
            status,
            retry_after,
            body,
        })
    }
}

/// Production transport for a run.
pub fn http_transport(config: &RunConfig) -> Result<RetryingTransport<ReqwestBackend>, TransportError> {
    Ok(RetryingTransport::new(ReqwestBackend::new(config)?, config.retry))
}
