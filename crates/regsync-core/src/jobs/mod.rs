//! Bulk jobs.
//!
//! A [`Job`] says where its work units come from and what one unit's
//! pipeline does. Scheduling, output files and progress are handled by
//! [`crate::run::run_job`].

pub mod audit_status;
pub mod backup;
pub mod create_users;
pub mod update;

use std::sync::Arc;

use async_trait::async_trait;
use regsync_http::{endpoints, EntityDetail, EntitySummary, Paginator, RunConfig, Transport};

use crate::error::{PipelineError, SyncError};
use crate::metrics::RunMetrics;
use crate::pool::WorkUnit;
use crate::sink::ResultRow;

pub use audit_status::AuditStatusJob;
pub use backup::BackupJob;
pub use create_users::{CreateUserRow, CreateUsersJob};
pub use update::UpdateJob;

/// Shared, read-only state handed to every pipeline.
#[derive(Clone)]
pub struct JobContext {
    pub transport: Arc<dyn Transport>,
    pub config: Arc<RunConfig>,
    pub metrics: Arc<RunMetrics>,
}

impl JobContext {
    pub fn new(transport: Arc<dyn Transport>, config: RunConfig) -> Self {
        Self {
            transport,
            config: Arc::new(config),
            metrics: Arc::new(RunMetrics::new()),
        }
    }

    pub fn with_metrics(mut self, metrics: RunMetrics) -> Self {
        self.metrics = Arc::new(metrics);
        self
    }
}

#[async_trait]
pub trait Job: Send + Sync + 'static {
    type Unit: WorkUnit;

    /// File stem and log label.
    fn name(&self) -> &'static str;

    /// Business columns written after `id,status,detail`.
    fn columns(&self) -> Vec<String>;

    /// Human-readable change, recorded in the result metadata.
    fn describe(&self) -> Option<String> {
        None
    }

    async fn units(&self, ctx: &JobContext) -> Result<Vec<Self::Unit>, SyncError>;

    async fn process(&self, ctx: &JobContext, unit: Self::Unit) -> Result<ResultRow, PipelineError>;
}

/// Every entity behind a paged listing.
pub async fn list_entities(ctx: &JobContext, path: &str) -> Result<Vec<EntitySummary>, SyncError> {
    Paginator::from_config(ctx.transport.as_ref(), &ctx.config)
        .collect(path)
        .await
        .map_err(|source| SyncError::Listing {
            path: path.to_string(),
            source,
        })
}

/// Fetch a user's full record, exactly as the registry returns it.
pub async fn fetch_user(ctx: &JobContext, id: &str) -> Result<EntityDetail, PipelineError> {
    let value = ctx
        .transport
        .get_json(&endpoints::user(id))
        .await
        .map_err(PipelineError::Fetch)?;
    EntityDetail::from_value(value).map_err(PipelineError::Detail)
}

fn columns(names: &[&str]) -> Vec<String> {
    names.iter().map(|c| c.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use regsync_http::fakes::MemoryRegistry;
    use serde_json::json;

    fn ctx(registry: Arc<MemoryRegistry>) -> JobContext {
        let config = RunConfig::builder("https://registry.test", "t").build().unwrap();
        JobContext::new(registry, config)
    }

    #[tokio::test]
    async fn fetch_user_keeps_record_as_fetched() {
        let registry = Arc::new(MemoryRegistry::new());
        let record = json!({"userId": "u1", "email": "a@b.com", "permissions": []});
        registry.insert_user(record.clone());
        let detail = fetch_user(&ctx(registry), "u1").await.unwrap();
        assert_eq!(detail.email.as_deref(), Some("a@b.com"));
        assert_eq!(detail.to_value(), record);
        assert!(detail.to_value().get("id").is_none());
    }

    #[tokio::test]
    async fn fetch_user_maps_http_errors() {
        let registry = Arc::new(MemoryRegistry::new());
        let err = fetch_user(&ctx(registry), "missing").await.unwrap_err();
        assert_eq!(err.http_status(), Some(404));
    }

    #[tokio::test]
    async fn listing_failure_is_run_level() {
        let registry = Arc::new(MemoryRegistry::new());
        registry.reject_page_size_over(10);
        let err = list_entities(&ctx(registry), endpoints::USERS).await.unwrap_err();
        assert!(matches!(err, SyncError::Listing { .. }));
    }
}
