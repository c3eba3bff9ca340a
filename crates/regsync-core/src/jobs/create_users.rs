//! Create users from a CSV file.
//!
//! Required columns: `email`, `firstName`, `lastName`. Optional: `roleCode`,
//! `npi`, `tin`. Header names are matched case-insensitively. A row with an
//! empty required value or a malformed email is recorded as `skipped`.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use regsync_http::{endpoints, ApiRequest};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use super::{columns, Job, JobContext};
use crate::error::{PipelineError, PreconditionError, SyncError};
use crate::pool::WorkUnit;
use crate::sink::ResultRow;

pub const REQUIRED_COLUMNS: [&str; 3] = ["email", "firstName", "lastName"];
pub const OPTIONAL_COLUMNS: [&str; 3] = ["roleCode", "npi", "tin"];

const IDENTITY_PROVIDER: &str = "auth0";
const USER_TYPE: &str = "patient_registry_user";

/// One data row of the input file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateUserRow {
    /// 1-based line number in the file, header included.
    pub line: usize,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub role_code: String,
    pub npi: String,
    pub tin: String,
    /// Required columns that were empty on this row.
    pub missing: Vec<&'static str>,
}

impl CreateUserRow {
    /// Local part and domain both present, no whitespace.
    pub fn has_valid_email(&self) -> bool {
        match self.email.rsplit_once('@') {
            Some((local, domain)) => {
                !local.is_empty()
                    && !domain.is_empty()
                    && domain.contains('.')
                    && !self.email.contains(char::is_whitespace)
            }
            None => false,
        }
    }

    fn label(&self) -> String {
        if self.email.is_empty() {
            format!("line {}", self.line)
        } else {
            self.email.clone()
        }
    }
}

impl WorkUnit for CreateUserRow {
    fn unit_id(&self) -> Option<String> {
        if self.email.is_empty() {
            Some(format!("line {}", self.line))
        } else {
            Some(self.email.to_ascii_lowercase())
        }
    }
}

fn normalize_header(header: &str) -> String {
    header.trim().trim_start_matches('\u{feff}').to_ascii_lowercase()
}

/// Read every data row. A missing required column fails the whole file.
pub fn read_rows(path: &Path) -> Result<Vec<CreateUserRow>, PreconditionError> {
    let invalid = |reason: String| PreconditionError::InvalidInput {
        path: path.to_path_buf(),
        reason,
    };

    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|e| invalid(e.to_string()))?;

    let headers = reader.headers().map_err(|e| invalid(e.to_string()))?.clone();
    let index: HashMap<String, usize> = headers
        .iter()
        .enumerate()
        .map(|(i, h)| (normalize_header(h), i))
        .collect();

    let missing: Vec<&str> = REQUIRED_COLUMNS
        .iter()
        .copied()
        .filter(|c| !index.contains_key(&c.to_ascii_lowercase()))
        .collect();
    if !missing.is_empty() {
        return Err(invalid(format!(
            "missing required columns: {} (optional: {})",
            missing.join(", "),
            OPTIONAL_COLUMNS.join(", ")
        )));
    }

    let mut rows = Vec::new();
    for (n, record) in reader.records().enumerate() {
        let record = record.map_err(|e| invalid(e.to_string()))?;
        if record.iter().all(str::is_empty) {
            continue;
        }
        let get = |column: &str| -> String {
            index
                .get(&column.to_ascii_lowercase())
                .and_then(|i| record.get(*i))
                .unwrap_or_default()
                .to_string()
        };
        let line = record
            .position()
            .map_or(n + 2, |p| p.line() as usize);
        let mut row = CreateUserRow {
            line,
            email: get("email"),
            first_name: get("firstName"),
            last_name: get("lastName"),
            role_code: get("roleCode"),
            npi: get("npi"),
            tin: get("tin"),
            missing: Vec::new(),
        };
        row.missing = REQUIRED_COLUMNS
            .iter()
            .copied()
            .filter(|c| match *c {
                "email" => row.email.is_empty(),
                "firstName" => row.first_name.is_empty(),
                _ => row.last_name.is_empty(),
            })
            .collect();
        rows.push(row);
    }
    Ok(rows)
}

pub struct CreateUsersJob {
    rows: Vec<CreateUserRow>,
    permissions: Vec<String>,
    project_ids: Vec<String>,
}

impl CreateUsersJob {
    /// Every created user receives `permissions` and `project_ids`.
    pub fn new(
        rows: Vec<CreateUserRow>,
        permissions: Vec<String>,
        project_ids: Vec<String>,
    ) -> Result<Self, PreconditionError> {
        if permissions.iter().all(|p| p.trim().is_empty()) {
            return Err(PreconditionError::InvalidChange(
                "at least one permission is required for new users".to_string(),
            ));
        }
        Ok(Self {
            rows,
            permissions,
            project_ids,
        })
    }

    pub fn from_csv(
        path: &Path,
        permissions: Vec<String>,
        project_ids: Vec<String>,
    ) -> Result<Self, PreconditionError> {
        Self::new(read_rows(path)?, permissions, project_ids)
    }

    /// The create body for one row, under a freshly generated id.
    pub fn payload(&self, row: &CreateUserRow, user_id: &str) -> Value {
        let mut body = Map::new();
        body.insert("id".into(), json!(user_id));
        body.insert(
            "identityProviderId".into(),
            json!(format!("{}|{}", IDENTITY_PROVIDER, user_id)),
        );
        body.insert("permissions".into(), json!(self.permissions));
        body.insert("projectIds".into(), json!(self.project_ids));
        body.insert("email".into(), json!(row.email));
        body.insert("firstName".into(), json!(row.first_name));
        body.insert("lastName".into(), json!(row.last_name));
        body.insert("type".into(), json!(USER_TYPE));
        body.insert("roleCode".into(), json!(row.role_code));
        body.insert("npi".into(), json!(row.npi));
        body.insert("tin".into(), json!(row.tin));
        body.insert("identityProvider".into(), json!(IDENTITY_PROVIDER));
        body.insert("organizationMembership".into(), json!({}));
        body.insert("blocked".into(), json!(false));
        Value::Object(body)
    }
}

#[async_trait]
impl Job for CreateUsersJob {
    type Unit = CreateUserRow;

    fn name(&self) -> &'static str {
        "create_users"
    }

    fn columns(&self) -> Vec<String> {
        columns(&["email", "firstName", "lastName", "http_status"])
    }

    fn describe(&self) -> Option<String> {
        Some(format!(
            "create users with permissions [{}] projects [{}]",
            self.permissions.join(", "),
            self.project_ids.join(", ")
        ))
    }

    async fn units(&self, _ctx: &JobContext) -> Result<Vec<CreateUserRow>, SyncError> {
        Ok(self.rows.clone())
    }

    async fn process(&self, ctx: &JobContext, row: CreateUserRow) -> Result<ResultRow, PipelineError> {
        let annotate = |result: ResultRow| {
            result
                .with_field("email", row.email.clone())
                .with_field("firstName", row.first_name.clone())
                .with_field("lastName", row.last_name.clone())
        };

        if !row.missing.is_empty() {
            return Ok(annotate(ResultRow::skipped(
                row.label(),
                format!("line {}: missing {}", row.line, row.missing.join(", ")),
            )));
        }
        if !row.has_valid_email() {
            return Ok(annotate(ResultRow::skipped(
                row.label(),
                format!("line {}: invalid email {:?}", row.line, row.email),
            )));
        }

        let user_id = Uuid::new_v4().to_string();
        let payload = self.payload(&row, &user_id);

        if !ctx.config.mode.is_apply() {
            return Ok(annotate(
                ResultRow::dry_run(&user_id, format!("would create {}", row.email)).with_payload(payload),
            ));
        }

        ctx.metrics.inc_writes_issued();
        let result = match ctx.transport.send(ApiRequest::post(endpoints::USERS, payload)).await {
            Ok(_) => ResultRow::applied(&user_id, format!("created {}", row.email)),
            Err(err) => ResultRow::failed(&user_id, &PipelineError::Write(err)),
        };
        Ok(annotate(result))
    }
}
