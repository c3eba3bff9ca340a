//! Run configuration: connection settings, retry policy and apply mode.
//!
//! A [`RunConfig`] is built once per run through [`RunConfigBuilder`],
//! validated, and then shared read-only.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::paginate::{DEFAULT_MAX_PAGES, DEFAULT_PAGE_SIZE};

pub const DEFAULT_BASE_URL: &str = "https://partner.xcures.com";
pub const DEFAULT_CONCURRENCY: usize = 8;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Whether mutations are submitted or only planned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyMode {
    #[default]
    DryRun,
    Apply,
}

impl ApplyMode {
    pub fn from_apply_flag(apply: bool) -> Self {
        if apply {
            ApplyMode::Apply
        } else {
            ApplyMode::DryRun
        }
    }

    pub fn is_apply(self) -> bool {
        self == ApplyMode::Apply
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ApplyMode::DryRun => "dry_run",
            ApplyMode::Apply => "apply",
        }
    }
}

impl fmt::Display for ApplyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bounded exponential backoff.
///
/// `max_attempts` counts every attempt including the first. The delay after
/// failed attempt `n` (1-based) is `base_delay * 2^(n-1)`, capped at
/// `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(20),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// Delay to wait after `attempt` failed.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Like [`delay_for`](Self::delay_for) but a server-provided `Retry-After`
    /// wins when present. Both are capped at `max_delay`.
    pub fn delay_with_hint(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        match retry_after {
            Some(hint) => hint.min(self.max_delay),
            None => self.delay_for(attempt),
        }
    }
}

/// Immutable settings for one run.
#[derive(Clone)]
pub struct RunConfig {
    base_url: String,
    token: String,
    pub project_id: Option<String>,
    pub concurrency: usize,
    pub retry: RetryPolicy,
    pub timeout: Duration,
    pub page_size: u32,
    pub max_pages: u32,
    pub mode: ApplyMode,
}

impl RunConfig {
    pub fn builder(base_url: impl Into<String>, token: impl Into<String>) -> RunConfigBuilder {
        RunConfigBuilder {
            base_url: base_url.into(),
            token: token.into(),
            project_id: None,
            concurrency: DEFAULT_CONCURRENCY,
            retry: RetryPolicy::default(),
            timeout: DEFAULT_TIMEOUT,
            page_size: DEFAULT_PAGE_SIZE,
            max_pages: DEFAULT_MAX_PAGES,
            mode: ApplyMode::DryRun,
        }
    }

    /// Base URL without a trailing slash.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Absolute URL for an API path such as `/api/patient-registry/user`.
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl fmt::Debug for RunConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunConfig")
            .field("base_url", &self.base_url)
            .field("token", &"<redacted>")
            .field("project_id", &self.project_id)
            .field("concurrency", &self.concurrency)
            .field("retry", &self.retry)
            .field("timeout", &self.timeout)
            .field("page_size", &self.page_size)
            .field("max_pages", &self.max_pages)
            .field("mode", &self.mode)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct RunConfigBuilder {
    base_url: String,
    token: String,
    project_id: Option<String>,
    concurrency: usize,
    retry: RetryPolicy,
    timeout: Duration,
    page_size: u32,
    max_pages: u32,
    mode: ApplyMode,
}

impl RunConfigBuilder {
    pub fn project_id(mut self, project_id: Option<String>) -> Self {
        self.project_id = project_id.filter(|p| !p.trim().is_empty());
        self
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn max_pages(mut self, max_pages: u32) -> Self {
        self.max_pages = max_pages;
        self
    }

    pub fn mode(mut self, mode: ApplyMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn build(self) -> Result<RunConfig, ConfigError> {
        let token = self.token.trim().to_string();
        if token.is_empty() {
            return Err(ConfigError::MissingToken);
        }

        let base_url = self.base_url.trim().trim_end_matches('/').to_string();
        if !(base_url.starts_with("https://") || base_url.starts_with("http://")) {
            return Err(ConfigError::InvalidBaseUrl {
                url: self.base_url,
                reason: "expected an http:// or https:// URL".to_string(),
            });
        }
        if base_url.split("://").nth(1).map_or(true, str::is_empty) {
            return Err(ConfigError::InvalidBaseUrl {
                url: self.base_url,
                reason: "missing host".to_string(),
            });
        }

        if self.concurrency == 0 {
            return Err(ConfigError::OutOfRange {
                field: "concurrency",
                min: 1,
            });
        }
        if self.page_size == 0 {
            return Err(ConfigError::OutOfRange {
                field: "page_size",
                min: 1,
            });
        }
        if self.max_pages == 0 {
            return Err(ConfigError::OutOfRange {
                field: "max_pages",
                min: 1,
            });
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::OutOfRange {
                field: "max_attempts",
                min: 1,
            });
        }

        Ok(RunConfig {
            base_url,
            token,
            project_id: self.project_id,
            concurrency: self.concurrency,
            retry: self.retry,
            timeout: self.timeout,
            page_size: self.page_size,
            max_pages: self.max_pages,
            mode: self.mode,
        })
    }
}
