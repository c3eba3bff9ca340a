//! Snapshot every user's permissions and project ids before a bulk change.

use async_trait::async_trait;
use regsync_http::{endpoints, CollectionField, EntitySummary};

use super::{columns, fetch_user, list_entities, Job, JobContext};
use crate::error::{PipelineError, SyncError};
use crate::sink::ResultRow;

#[derive(Debug, Default)]
pub struct BackupJob {
    /// Keep the whole fetched record as the row payload.
    pub include_full: bool,
}

impl BackupJob {
    pub fn new(include_full: bool) -> Self {
        Self { include_full }
    }
}

#[async_trait]
impl Job for BackupJob {
    type Unit = EntitySummary;

    fn name(&self) -> &'static str {
        "permissions_backup"
    }

    fn columns(&self) -> Vec<String> {
        columns(&["email", "name", "permissions", "projectIds", "http_status"])
    }

    async fn units(&self, ctx: &JobContext) -> Result<Vec<EntitySummary>, SyncError> {
        list_entities(ctx, endpoints::USERS).await
    }

    async fn process(&self, ctx: &JobContext, unit: EntitySummary) -> Result<ResultRow, PipelineError> {
        let id = unit.id.unwrap_or_default();
        let detail = fetch_user(ctx, &id).await?;

        let list = |field| detail.collection(field).map(<[String]>::to_vec).unwrap_or_default();
        let row = ResultRow::applied(&id, "backed up")
            .with_field("email", detail.email.clone().unwrap_or_default())
            .with_field("name", detail.display_name().unwrap_or_default())
            .with_list_field("permissions", &list(CollectionField::Permissions))
            .with_list_field("projectIds", &list(CollectionField::ProjectIds));

        Ok(if self.include_full {
            row.with_payload(detail.to_value())
        } else {
            row
        })
    }
}
