//! Error types for regsync-http

use std::fmt;

use thiserror::Error;

/// Maximum number of characters kept from a response body for diagnostics.
pub const BODY_PREVIEW_LIMIT: usize = 800;

/// Collapse whitespace and bound `text` to `limit` characters.
pub fn preview(text: &str, limit: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= limit {
        return collapsed;
    }
    let mut out: String = collapsed.chars().take(limit).collect();
    out.push_str("...<truncated>");
    out
}

/// Bounded body preview using [`BODY_PREVIEW_LIMIT`].
pub fn body_preview(text: &str) -> String {
    preview(text, BODY_PREVIEW_LIMIT)
}

/// Classification of a single failed attempt that never produced a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkErrorKind {
    Connect,
    Timeout,
    /// Connection dropped mid-request or the body could not be read.
    Io,
    /// The request could not be constructed. Never retried.
    InvalidRequest,
}

/// A network-level failure of one attempt.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind:?}: {message}")]
pub struct NetworkError {
    pub kind: NetworkErrorKind,
    pub message: String,
}

impl NetworkError {
    pub fn new(kind: NetworkErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(NetworkErrorKind::Timeout, message)
    }

    pub fn connect(message: impl Into<String>) -> Self {
        Self::new(NetworkErrorKind::Connect, message)
    }

    pub fn is_retryable(&self) -> bool {
        self.kind != NetworkErrorKind::InvalidRequest
    }
}

impl From<reqwest::Error> for NetworkError {
    fn from(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            NetworkErrorKind::Timeout
        } else if err.is_connect() {
            NetworkErrorKind::Connect
        } else if err.is_builder() {
            NetworkErrorKind::InvalidRequest
        } else {
            NetworkErrorKind::Io
        };
        NetworkError::new(kind, err.to_string())
    }
}

/// The last thing observed before the transport gave up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LastFailure {
    Status { status: u16, body_preview: String },
    Network(NetworkError),
}

impl fmt::Display for LastFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LastFailure::Status {
                status,
                body_preview,
            } => write!(f, "last_status={} body={}", status, body_preview),
            LastFailure::Network(err) => write!(f, "network error {}", err),
        }
    }
}

/// Errors surfaced by [`crate::Transport::send`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Non-retryable HTTP status.
    #[error("HTTP {status} for {method} {path} body={body_preview}")]
    Status {
        method: String,
        path: String,
        status: u16,
        body_preview: String,
    },

    /// Retryable failures persisted through every attempt.
    #[error("{method} {path} exhausted {attempts} attempt(s); {last}")]
    Exhausted {
        method: String,
        path: String,
        attempts: u32,
        last: LastFailure,
    },

    /// The response body was not the JSON we expected.
    #[error("malformed response from {path}: {reason} body={body_preview}")]
    Malformed {
        path: String,
        reason: String,
        body_preview: String,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl TransportError {
    /// The last HTTP status observed, if any response was received.
    pub fn status(&self) -> Option<u16> {
        match self {
            TransportError::Status { status, .. } => Some(*status),
            TransportError::Exhausted {
                last: LastFailure::Status { status, .. },
                ..
            } => Some(*status),
            _ => None,
        }
    }

    /// Short label for result rows and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            TransportError::Status { .. } => "http_status",
            TransportError::Exhausted { .. } => "retries_exhausted",
            TransportError::Malformed { .. } => "malformed_response",
            TransportError::InvalidRequest(_) => "invalid_request",
        }
    }
}

/// Errors produced while walking a paged listing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PaginationError {
    #[error("page {page} request failed: {source}")]
    Page {
        page: u32,
        #[source]
        source: TransportError,
    },

    #[error("unexpected list payload on page {page}: {preview}")]
    UnexpectedShape { page: u32, preview: String },

    #[error("pagination of {path} exceeded {max_pages} pages")]
    PageLimitExceeded { path: String, max_pages: u32 },
}

impl PaginationError {
    /// The first page failed with HTTP 500 after retries.
    pub fn is_first_page_server_error(&self) -> bool {
        matches!(self, PaginationError::Page { page: 1, source } if source.status() == Some(500))
    }
}

/// Invalid run configuration. Always a precondition failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("bearer token is required (use --token or REGSYNC_BEARER_TOKEN)")]
    MissingToken,

    #[error("invalid base URL {url:?}: {reason}")]
    InvalidBaseUrl { url: String, reason: String },

    #[error("{field} must be at least {min}")]
    OutOfRange { field: &'static str, min: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_collapses_whitespace() {
        assert_eq!(preview("  a\n b\t c  ", 10), "a b c");
    }

    #[test]
    fn preview_truncates_long_bodies() {
        let body = "x".repeat(900);
        let p = body_preview(&body);
        assert!(p.ends_with("...<truncated>"));
        assert_eq!(p.chars().count(), BODY_PREVIEW_LIMIT + "...<truncated>".len());
    }

    #[test]
    fn preview_respects_char_boundaries() {
        let body = "é".repeat(10);
        assert_eq!(preview(&body, 3), "ééé...<truncated>");
    }

    #[test]
    fn exhausted_error_reports_last_status() {
        let err = TransportError::Exhausted {
            method: "GET".to_string(),
            path: "/x".to_string(),
            attempts: 5,
            last: LastFailure::Status {
                status: 503,
                body_preview: "busy".to_string(),
            },
        };
        assert_eq!(err.status(), Some(503));
        let msg = err.to_string();
        assert!(msg.contains("5 attempt(s)"));
        assert!(msg.contains("last_status=503"));
        assert_eq!(err.kind(), "retries_exhausted");
    }

    #[test]
    fn network_exhaustion_has_no_status() {
        let err = TransportError::Exhausted {
            method: "GET".to_string(),
            path: "/x".to_string(),
            attempts: 2,
            last: LastFailure::Network(NetworkError::timeout("deadline elapsed")),
        };
        assert_eq!(err.status(), None);
        assert!(err.to_string().contains("deadline elapsed"));
    }

    #[test]
    fn invalid_request_is_not_retryable() {
        let err = NetworkError::new(NetworkErrorKind::InvalidRequest, "bad url");
        assert!(!err.is_retryable());
        assert!(NetworkError::connect("refused").is_retryable());
    }

    #[test]
    fn first_page_server_error_detection() {
        let err = PaginationError::Page {
            page: 1,
            source: TransportError::Exhausted {
                method: "GET".to_string(),
                path: "/users".to_string(),
                attempts: 3,
                last: LastFailure::Status {
                    status: 500,
                    body_preview: String::new(),
                },
            },
        };
        assert!(err.is_first_page_server_error());

        let later = PaginationError::Page {
            page: 2,
            source: TransportError::Status {
                method: "GET".to_string(),
                path: "/users".to_string(),
                status: 500,
                body_preview: String::new(),
            },
        };
        assert!(!later.is_first_page_server_error());
    }
}
