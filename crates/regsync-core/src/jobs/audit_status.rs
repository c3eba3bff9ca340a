//! Read-only audit of subjects: clinical-concepts load flag and document
//! count. Both lookups run concurrently per subject; a row is `failed` when
//! either one fails, keeping whatever the other returned.

use async_trait::async_trait;
use regsync_http::{endpoints, ApiRequest, EntitySummary};
use serde_json::Value;

use super::{columns, list_entities, Job, JobContext};
use crate::error::{PipelineError, SyncError};
use crate::sink::ResultRow;

#[derive(Debug, Default)]
pub struct AuditStatusJob;

impl AuditStatusJob {
    pub fn new() -> Self {
        Self
    }
}

async fn concepts_loaded(ctx: &JobContext, subject_id: &str) -> Result<bool, PipelineError> {
    let body = ctx
        .transport
        .get_json(&endpoints::subject_concepts_status(subject_id))
        .await
        .map_err(PipelineError::Fetch)?;
    body.get("loaded")
        .and_then(Value::as_bool)
        .ok_or_else(|| PipelineError::Detail(format!("status response has no boolean `loaded`: {}", body)))
}

async fn document_count(ctx: &JobContext, subject_id: &str) -> Result<u64, PipelineError> {
    let request = ApiRequest::get(endpoints::DOCUMENTS)
        .with_query("subjectId", subject_id)
        .with_query("pageNumber", 1)
        .with_query("pageSize", 1);
    let body = ctx
        .transport
        .send(request)
        .await
        .and_then(|resp| resp.json())
        .map_err(PipelineError::Fetch)?;
    body.get("totalCount")
        .and_then(Value::as_u64)
        .ok_or_else(|| PipelineError::Detail(format!("document listing has no integer totalCount: {}", body)))
}

#[async_trait]
impl Job for AuditStatusJob {
    type Unit = EntitySummary;

    fn name(&self) -> &'static str {
        "audit_status"
    }

    fn columns(&self) -> Vec<String> {
        columns(&["loaded", "document_count", "http_status"])
    }

    async fn units(&self, ctx: &JobContext) -> Result<Vec<EntitySummary>, SyncError> {
        list_entities(ctx, endpoints::SUBJECTS).await
    }

    async fn process(&self, ctx: &JobContext, unit: EntitySummary) -> Result<ResultRow, PipelineError> {
        let id = unit.id.unwrap_or_default();
        let (loaded, documents) = futures::join!(concepts_loaded(ctx, &id), document_count(ctx, &id));

        let mut row = match (&loaded, &documents) {
            (Ok(_), Ok(_)) => ResultRow::applied(&id, "status read"),
            (Err(err), _) | (_, Err(err)) => ResultRow::failed(&id, err),
        };
        if let Ok(loaded) = loaded {
            row = row.with_field("loaded", loaded.to_string());
        }
        if let Ok(count) = documents {
            row = row.with_field("document_count", count.to_string());
        }
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::RowStatus;
    use regsync_http::fakes::MemoryRegistry;
    use regsync_http::RunConfig;
    use serde_json::json;
    use std::sync::Arc;

    fn ctx(registry: &Arc<MemoryRegistry>) -> JobContext {
        let config = RunConfig::builder("https://registry.test", "t").build().unwrap();
        JobContext::new(registry.clone(), config)
    }

    #[tokio::test]
    async fn reads_flag_and_count() {
        let registry = Arc::new(MemoryRegistry::new());
        registry.insert_subject(json!({"id": "s1"}), Some(true), 7);
        let row = AuditStatusJob
            .process(&ctx(&registry), EntitySummary::new("s1"))
            .await
            .unwrap();
        assert_eq!(row.status, RowStatus::Applied);
        assert_eq!(row.fields["loaded"], "true");
        assert_eq!(row.fields["document_count"], "7");

        let docs = registry
            .requests()
            .into_iter()
            .find(|r| r.path == endpoints::DOCUMENTS)
            .unwrap();
        assert_eq!(docs.query_value("subjectId"), Some("s1"));
        assert_eq!(docs.query_value("pageSize"), Some("1"));
    }

    #[tokio::test]
    async fn missing_status_keeps_document_count() {
        let registry = Arc::new(MemoryRegistry::new());
        registry.insert_subject(json!({"id": "s2"}), None, 3);
        let row = AuditStatusJob
            .process(&ctx(&registry), EntitySummary::new("s2"))
            .await
            .unwrap();
        assert_eq!(row.status, RowStatus::Failed);
        assert_eq!(row.fields["http_status"], "404");
        assert_eq!(row.fields["document_count"], "3");
        assert!(!row.fields.contains_key("loaded"));
    }
}
