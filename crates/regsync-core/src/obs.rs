//! Structured lifecycle events for sync runs.
//!
//! - [`run_span`]: a span carrying `run_id` and `job`, attached to the run
//!   future with `tracing::Instrument`
//! - `emit_*`: one `info!` event per lifecycle step

use tracing::{info, warn};

use crate::sink::{ResultRow, RowStatus, RunSummary};

pub fn run_span(run_id: &str, job: &str) -> tracing::Span {
    tracing::info_span!("regsync.run", run_id = %run_id, job = %job)
}

pub fn emit_run_started(run_id: &str, job: &str, mode: &str, base_url: &str) {
    info!(
        event = "run.started",
        run_id = %run_id,
        job = %job,
        mode = %mode,
        base_url = %base_url,
    );
}

/// The listing finished; `units` will be scheduled.
pub fn emit_run_listed(run_id: &str, units: usize, duplicates: usize, limited_to: Option<usize>) {
    info!(
        event = "run.listed",
        run_id = %run_id,
        units = units,
        duplicates = duplicates,
        limited_to = ?limited_to,
    );
}

pub fn emit_entity_finished(row: &ResultRow) {
    match row.status {
        RowStatus::Failed => warn!(
            event = "entity.finished",
            entity_id = %row.entity_id,
            status = row.status.as_str(),
            detail = %row.detail,
        ),
        _ => tracing::debug!(
            event = "entity.finished",
            entity_id = %row.entity_id,
            status = row.status.as_str(),
        ),
    }
}

pub fn emit_run_finished(run_id: &str, summary: &RunSummary, not_started: usize, cancelled: bool) {
    let duration_ms = (summary.finished_at - summary.started_at).num_milliseconds();
    info!(
        event = "run.finished",
        run_id = %run_id,
        duration_ms = duration_ms,
        applied = summary.counts.applied,
        dry_run = summary.counts.dry_run,
        skipped = summary.counts.skipped,
        excluded = summary.counts.excluded,
        failed = summary.counts.failed,
        write_errors = summary.counts.write_errors,
        not_started = not_started,
        cancelled = cancelled,
        csv = %summary.csv_path.display(),
        json = %summary.json_path.display(),
    );
}

pub fn emit_sink_error(entity_id: &str, error: &dyn std::fmt::Display) {
    warn!(event = "sink.write_error", entity_id = %entity_id, error = %error);
}
