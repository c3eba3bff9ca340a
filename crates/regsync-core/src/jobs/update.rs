//! Fetch, plan and write back user records.
//!
//! Permission backfills, project backfills and email-domain rewrites are the
//! same pipeline with a different [`ChangeSpec`].

use async_trait::async_trait;
use regsync_http::{endpoints, ApiRequest, CollectionField, EntitySummary};
use tracing::debug;

use super::{columns, fetch_user, list_entities, Job, JobContext};
use crate::error::{PipelineError, PreconditionError, SyncError};
use crate::planner::{plan, Change, ChangeSpec, Disposition, ExclusionRule};
use crate::sink::ResultRow;

/// Domain that must never be rewritten or backfilled by default.
pub const DEFAULT_PROTECTED_DOMAIN: &str = "xcures.com";

pub struct UpdateJob {
    name: &'static str,
    spec: ChangeSpec,
}

impl UpdateJob {
    pub fn new(name: &'static str, spec: ChangeSpec) -> Self {
        Self { name, spec }
    }

    pub fn permissions(
        add: Vec<String>,
        remove: Vec<String>,
        exclude_domains: Vec<String>,
    ) -> Result<Self, PreconditionError> {
        let exclusions = exclude_domains
            .iter()
            .map(|d| ExclusionRule::email_domain(d))
            .collect();
        let spec = ChangeSpec::new(
            Change::collection(CollectionField::Permissions, add, remove),
            exclusions,
        )?;
        Ok(Self::new("permissions", spec))
    }

    pub fn projects(add: Vec<String>, remove: Vec<String>) -> Result<Self, PreconditionError> {
        let spec = ChangeSpec::new(
            Change::collection(CollectionField::ProjectIds, add, remove),
            Vec::new(),
        )?;
        Ok(Self::new("projects", spec))
    }

    pub fn email_domain(
        from_domain: &str,
        to_domain: &str,
        protected_domains: Vec<String>,
    ) -> Result<Self, PreconditionError> {
        let exclusions = protected_domains
            .iter()
            .map(|d| ExclusionRule::email_domain(d))
            .collect();
        let spec = ChangeSpec::new(Change::email_rewrite(from_domain, to_domain), exclusions)?;
        Ok(Self::new("email_domain", spec))
    }

    pub fn spec(&self) -> &ChangeSpec {
        &self.spec
    }
}

/// Ids of every project, for backfills that grant all of them.
pub async fn all_project_ids(ctx: &JobContext) -> Result<Vec<String>, SyncError> {
    let projects = list_entities(ctx, endpoints::PROJECTS).await?;
    Ok(projects.into_iter().filter_map(|p| p.id).collect())
}

#[async_trait]
impl Job for UpdateJob {
    type Unit = EntitySummary;

    fn name(&self) -> &'static str {
        self.name
    }

    fn columns(&self) -> Vec<String> {
        columns(&["email", "before", "after", "http_status"])
    }

    fn describe(&self) -> Option<String> {
        Some(self.spec.describe())
    }

    async fn units(&self, ctx: &JobContext) -> Result<Vec<EntitySummary>, SyncError> {
        list_entities(ctx, endpoints::USERS).await
    }

    async fn process(&self, ctx: &JobContext, unit: EntitySummary) -> Result<ResultRow, PipelineError> {
        let id = unit.id.unwrap_or_default();
        let detail = fetch_user(ctx, &id).await?;
        let plan = plan(&id, &detail, &self.spec, ctx.config.mode)?;
        debug!(entity_id = %plan.entity_id, disposition = ?plan.disposition, "planned");

        let email = detail.email.clone().unwrap_or_default();
        let annotate = |row: ResultRow| {
            row.with_field("email", email.clone())
                .with_list_field("before", &plan.before)
                .with_list_field("after", &plan.after)
        };

        let row = match plan.disposition {
            Disposition::Excluded => ResultRow::excluded(&plan.entity_id, &plan.note),
            Disposition::Unchanged | Disposition::NotApplicable => {
                ResultRow::skipped(&plan.entity_id, &plan.note)
            }
            Disposition::Change if !plan.should_submit() => {
                let row = ResultRow::dry_run(&plan.entity_id, &plan.note);
                match &plan.payload {
                    Some(payload) => row.with_payload(payload.clone()),
                    None => row,
                }
            }
            Disposition::Change => {
                let payload = plan.payload.clone().unwrap_or_else(|| detail.to_value());
                ctx.metrics.inc_writes_issued();
                match ctx
                    .transport
                    .send(ApiRequest::put(endpoints::user(&plan.entity_id), payload))
                    .await
                {
                    Ok(_) => ResultRow::applied(&plan.entity_id, &plan.note),
                    Err(err) => ResultRow::failed(&plan.entity_id, &PipelineError::Write(err)),
                }
            }
        };
        Ok(annotate(row))
    }
}
