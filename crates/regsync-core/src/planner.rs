//! Mutation planning.
//!
//! [`plan`] is pure: given an entity id, its fetched record, the run's
//! [`ChangeSpec`] and the apply mode, it decides whether a write is needed
//! and builds the exact payload. The payload carries the fetched keys and
//! nothing else. Dry-run and apply produce identical plans; only
//! [`MutationPlan::should_submit`] differs.

use std::fmt;

use regsync_http::{ApplyMode, CollectionField, EntityDetail};
use serde::Serialize;
use serde_json::Value;

use crate::error::{PlanError, PreconditionError};

/// Scalar fields that support a domain rewrite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RewriteField {
    Email,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    /// Ensure values are present in / absent from a multi-valued field.
    Collection {
        field: CollectionField,
        ensure_present: Vec<String>,
        ensure_absent: Vec<String>,
    },
    /// Replace the domain part of an address.
    Rewrite {
        field: RewriteField,
        from_domain: String,
        to_domain: String,
    },
}

impl Change {
    pub fn collection<P, A>(field: CollectionField, ensure_present: P, ensure_absent: A) -> Self
    where
        P: IntoIterator,
        P::Item: Into<String>,
        A: IntoIterator,
        A::Item: Into<String>,
    {
        Change::Collection {
            field,
            ensure_present: clean_values(ensure_present),
            ensure_absent: clean_values(ensure_absent),
        }
    }

    pub fn email_rewrite(from_domain: &str, to_domain: &str) -> Self {
        Change::Rewrite {
            field: RewriteField::Email,
            from_domain: normalize_domain(from_domain),
            to_domain: normalize_domain(to_domain),
        }
    }
}

/// Trimmed, non-empty, first occurrence kept.
fn clean_values<I>(values: I) -> Vec<String>
where
    I: IntoIterator,
    I::Item: Into<String>,
{
    let mut out: Vec<String> = Vec::new();
    for value in values {
        let value = value.into().trim().to_string();
        if !value.is_empty() && !out.contains(&value) {
            out.push(value);
        }
    }
    out
}

pub fn normalize_domain(domain: &str) -> String {
    domain.trim().trim_start_matches('@').to_ascii_lowercase()
}

/// Domain part of an address, after the last `@`.
pub fn email_domain(email: &str) -> Option<&str> {
    email
        .trim()
        .rsplit_once('@')
        .map(|(_, domain)| domain)
        .filter(|d| !d.is_empty())
}

/// Entities a run must never touch. Checked before the change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExclusionRule {
    EmailDomain(String),
    EntityId(String),
}

impl ExclusionRule {
    pub fn email_domain(domain: &str) -> Self {
        ExclusionRule::EmailDomain(normalize_domain(domain))
    }

    fn matches(&self, entity_id: &str, detail: &EntityDetail) -> bool {
        match self {
            ExclusionRule::EmailDomain(domain) => detail
                .email
                .as_deref()
                .and_then(email_domain)
                .is_some_and(|d| d.eq_ignore_ascii_case(domain)),
            ExclusionRule::EntityId(id) => id == entity_id,
        }
    }
}

impl fmt::Display for ExclusionRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExclusionRule::EmailDomain(d) => write!(f, "email domain {}", d),
            ExclusionRule::EntityId(id) => write!(f, "entity id {}", id),
        }
    }
}

/// The one change a run applies, plus its exclusions. Validated on
/// construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSpec {
    change: Change,
    exclusions: Vec<ExclusionRule>,
}

impl ChangeSpec {
    pub fn new(change: Change, exclusions: Vec<ExclusionRule>) -> Result<Self, PreconditionError> {
        match &change {
            Change::Collection {
                field,
                ensure_present,
                ensure_absent,
            } => {
                if ensure_present.is_empty() && ensure_absent.is_empty() {
                    return Err(PreconditionError::InvalidChange(format!(
                        "nothing to add to or remove from {}",
                        field.key()
                    )));
                }
                if let Some(both) = ensure_present.iter().find(|v| ensure_absent.contains(v)) {
                    return Err(PreconditionError::InvalidChange(format!(
                        "{:?} is both added and removed",
                        both
                    )));
                }
            }
            Change::Rewrite {
                from_domain,
                to_domain,
                ..
            } => {
                for domain in [from_domain, to_domain] {
                    if domain.is_empty() || domain.contains('@') || domain.contains(char::is_whitespace) {
                        return Err(PreconditionError::InvalidChange(format!(
                            "invalid domain {:?}",
                            domain
                        )));
                    }
                }
                if from_domain == to_domain {
                    return Err(PreconditionError::InvalidChange(format!(
                        "source and target domain are both {}",
                        from_domain
                    )));
                }
                for rule in &exclusions {
                    if let ExclusionRule::EmailDomain(protected) = rule {
                        if protected == from_domain || protected == to_domain {
                            return Err(PreconditionError::InvalidChange(format!(
                                "refusing to rewrite from or to protected domain {}",
                                protected
                            )));
                        }
                    }
                }
            }
        }
        Ok(Self { change, exclusions })
    }

    pub fn change(&self) -> &Change {
        &self.change
    }

    pub fn exclusions(&self) -> &[ExclusionRule] {
        &self.exclusions
    }

    /// One-line summary for logs and result metadata.
    pub fn describe(&self) -> String {
        match &self.change {
            Change::Collection {
                field,
                ensure_present,
                ensure_absent,
            } => format!(
                "{}: add [{}] remove [{}]",
                field.key(),
                ensure_present.join(", "),
                ensure_absent.join(", ")
            ),
            Change::Rewrite {
                from_domain,
                to_domain,
                ..
            } => format!("email: @{} -> @{}", from_domain, to_domain),
        }
    }
}

/// Why a plan does or does not write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    Change,
    Unchanged,
    NotApplicable,
    Excluded,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationPlan {
    pub entity_id: String,
    pub noop: bool,
    pub payload: Option<Value>,
    pub disposition: Disposition,
    pub mode: ApplyMode,
    /// Value-level changes, e.g. `+Summary_Checklist`.
    pub changes: Vec<String>,
    pub before: Vec<String>,
    pub after: Vec<String>,
    pub note: String,
}

impl MutationPlan {
    fn noop(entity_id: String, disposition: Disposition, mode: ApplyMode, note: String) -> Self {
        Self {
            entity_id,
            noop: true,
            payload: None,
            disposition,
            mode,
            changes: Vec::new(),
            before: Vec::new(),
            after: Vec::new(),
            note,
        }
    }

    pub fn should_submit(&self) -> bool {
        !self.noop && self.mode.is_apply()
    }
}

/// Plan one entity. `entity_id` is the id the entity was listed under.
pub fn plan(
    entity_id: &str,
    detail: &EntityDetail,
    spec: &ChangeSpec,
    mode: ApplyMode,
) -> Result<MutationPlan, PlanError> {
    let entity_id = entity_id.trim();
    if entity_id.is_empty() {
        return Err(PlanError::MissingEntityId);
    }
    let entity_id = entity_id.to_string();

    if let Some(rule) = spec
        .exclusions
        .iter()
        .find(|rule| rule.matches(&entity_id, detail))
    {
        return Ok(MutationPlan::noop(
            entity_id,
            Disposition::Excluded,
            mode,
            format!("excluded by {}", rule),
        ));
    }

    match &spec.change {
        Change::Collection {
            field,
            ensure_present,
            ensure_absent,
        } => Ok(plan_collection(
            entity_id,
            detail,
            *field,
            ensure_present,
            ensure_absent,
            mode,
        )),
        Change::Rewrite {
            from_domain,
            to_domain,
            ..
        } => Ok(plan_rewrite(entity_id, detail, from_domain, to_domain, mode)),
    }
}

fn plan_collection(
    entity_id: String,
    detail: &EntityDetail,
    field: CollectionField,
    ensure_present: &[String],
    ensure_absent: &[String],
    mode: ApplyMode,
) -> MutationPlan {
    let original: Vec<String> = detail.collection(field).map(<[String]>::to_vec).unwrap_or_default();
    let mut next = original.clone();
    let mut changes = Vec::new();

    for value in ensure_present {
        if !next.contains(value) {
            next.push(value.clone());
            changes.push(format!("+{}", value));
        }
    }
    for value in ensure_absent {
        if next.contains(value) {
            next.retain(|v| v != value);
            changes.push(format!("-{}", value));
        }
    }

    if next == original {
        let mut plan = MutationPlan::noop(
            entity_id,
            Disposition::Unchanged,
            mode,
            format!("{} already up to date", field.key()),
        );
        plan.before = original.clone();
        plan.after = original;
        return plan;
    }

    let mut updated = detail.clone();
    updated.set_collection(field, next.clone());
    MutationPlan {
        entity_id,
        noop: false,
        payload: Some(updated.to_value()),
        disposition: Disposition::Change,
        mode,
        note: format!("{} {}", field.key(), changes.join(" ")),
        changes,
        before: original,
        after: next,
    }
}

fn plan_rewrite(
    entity_id: String,
    detail: &EntityDetail,
    from_domain: &str,
    to_domain: &str,
    mode: ApplyMode,
) -> MutationPlan {
    let current = detail.email.as_deref().map(str::trim).unwrap_or_default();
    let not_applicable = |note: String| {
        let mut plan = MutationPlan::noop(entity_id.clone(), Disposition::NotApplicable, mode, note);
        if !current.is_empty() {
            plan.before = vec![current.to_string()];
            plan.after = vec![current.to_string()];
        }
        plan
    };

    if current.is_empty() {
        return not_applicable("no email".to_string());
    }
    let Some((local, domain)) = current.rsplit_once('@') else {
        return not_applicable("email has no domain".to_string());
    };
    if !domain.eq_ignore_ascii_case(from_domain) {
        return not_applicable(format!("email domain {} is not {}", domain, from_domain));
    }

    let rewritten = format!("{}@{}", local, to_domain);
    if rewritten == current {
        let mut plan = MutationPlan::noop(
            entity_id,
            Disposition::Unchanged,
            mode,
            "email already up to date".to_string(),
        );
        plan.before = vec![rewritten.clone()];
        plan.after = vec![rewritten];
        return plan;
    }

    let mut updated = detail.clone();
    updated.set_email(rewritten.clone());
    MutationPlan {
        entity_id,
        noop: false,
        payload: Some(updated.to_value()),
        disposition: Disposition::Change,
        mode,
        changes: vec![format!("{} -> {}", current, rewritten)],
        note: format!("email {} -> {}", current, rewritten),
        before: vec![current.to_string()],
        after: vec![rewritten],
    }
}
