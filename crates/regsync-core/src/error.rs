//! Error taxonomy for sync runs.
//!
//! Failures inside one entity's pipeline are [`PipelineError`]s and end up as
//! `failed` rows. Failures before any entity is processed are
//! [`SyncError`]s and end the run.

use std::path::PathBuf;

use regsync_http::error::{preview, BODY_PREVIEW_LIMIT};
use regsync_http::{ConfigError, PaginationError, TransportError};

/// Planner refusals.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum PlanError {
    #[error("entity has no id")]
    MissingEntityId,
}

/// Errors from one entity's fetch, plan or apply step.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("fetch failed: {0}")]
    Fetch(#[source] TransportError),

    #[error("write failed: {0}")]
    Write(#[source] TransportError),

    #[error("unexpected detail record: {0}")]
    Detail(String),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error("task panicked: {0}")]
    Panicked(String),
}

impl PipelineError {
    /// HTTP status behind the failure, if one was observed.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            PipelineError::Fetch(e) | PipelineError::Write(e) => e.status(),
            _ => None,
        }
    }

    /// Bounded one-line description for result rows.
    pub fn row_detail(&self) -> String {
        let kind = match self {
            PipelineError::Fetch(e) | PipelineError::Write(e) => e.kind(),
            PipelineError::Detail(_) => "malformed_response",
            PipelineError::Plan(_) => "plan_error",
            PipelineError::Panicked(_) => "panic",
        };
        let text = match self.http_status() {
            Some(status) => format!("{} (HTTP {}): {}", kind, status, self),
            None => format!("{}: {}", kind, self),
        };
        preview(&text, BODY_PREVIEW_LIMIT)
    }
}

/// Result file errors.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("cannot create {path}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("sink already finalized")]
    Finalized,
}

/// Conditions that must hold before any output file is created.
#[derive(Debug, thiserror::Error)]
pub enum PreconditionError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("invalid change: {0}")]
    InvalidChange(String),

    #[error("invalid input {path}: {reason}")]
    InvalidInput { path: PathBuf, reason: String },
}

/// Run-level failures.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Precondition(#[from] PreconditionError),

    #[error("listing {path} failed: {source}")]
    Listing {
        path: String,
        #[source]
        source: PaginationError,
    },

    #[error("transport setup failed: {0}")]
    Transport(#[from] TransportError),

    #[error("result sink: {0}")]
    Sink(#[from] SinkError),

    #[error("run cancelled before any entity was processed")]
    Cancelled,
}

impl SyncError {
    pub fn is_precondition(&self) -> bool {
        matches!(self, SyncError::Precondition(_))
    }
}

/// Result type for run-level operations.
pub type Result<T> = std::result::Result<T, SyncError>;
