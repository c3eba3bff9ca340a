//! Run orchestration: list, fan out, persist, summarize.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::error::{Result, SyncError};
use crate::jobs::{Job, JobContext};
use crate::obs;
use crate::pool::{self, PoolConfig};
use crate::progress::{self, ProgressMode};
use crate::sink::{ResultSink, RowSink, RunSummary, SinkMetadata};

pub const EXIT_OK: u8 = 0;
pub const EXIT_FAILURES: u8 = 1;
pub const EXIT_PRECONDITION: u8 = 2;
pub const EXIT_CANCELLED: u8 = 130;

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub out_dir: PathBuf,
    /// Process only the first N distinct listed units.
    pub limit: Option<usize>,
    pub progress: ProgressMode,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            out_dir: PathBuf::from("."),
            limit: None,
            progress: ProgressMode::None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: String,
    pub summary: RunSummary,
    pub not_started: usize,
    pub duplicates: usize,
    pub cancelled: bool,
}

impl RunOutcome {
    pub fn exit_code(&self) -> u8 {
        if self.cancelled && self.not_started > 0 {
            EXIT_CANCELLED
        } else if self.summary.counts.has_failures() {
            EXIT_FAILURES
        } else {
            EXIT_OK
        }
    }
}

/// Run `job` to completion, or until `cancel` fires.
///
/// Result files are only created once the listing has succeeded; a listing
/// failure or a cancellation during listing leaves no output behind.
pub async fn run_job<J: Job>(
    job: Arc<J>,
    ctx: JobContext,
    options: RunOptions,
    cancel: CancellationToken,
) -> Result<RunOutcome> {
    let run_id = uuid::Uuid::new_v4().to_string();
    let span = obs::run_span(&run_id, job.name());
    execute(job, ctx, options, cancel, run_id).instrument(span).await
}

async fn execute<J: Job>(
    job: Arc<J>,
    ctx: JobContext,
    options: RunOptions,
    cancel: CancellationToken,
    run_id: String,
) -> Result<RunOutcome> {
    let started_at = Utc::now();
    obs::emit_run_started(&run_id, job.name(), ctx.config.mode.as_str(), ctx.config.base_url());

    let listed = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(SyncError::Cancelled),
        listed = job.units(&ctx) => listed?,
    };
    let (mut units, duplicates) = pool::dedupe(listed);
    if let Some(limit) = options.limit {
        units.truncate(limit);
    }
    obs::emit_run_listed(&run_id, units.len(), duplicates, options.limit);

    let sink = Arc::new(ResultSink::create(
        &options.out_dir,
        SinkMetadata {
            run_id: run_id.clone(),
            job: job.name().to_string(),
            mode: ctx.config.mode.as_str().to_string(),
            base_url: ctx.config.base_url().to_string(),
            change: job.describe(),
            columns: job.columns(),
            started_at,
        },
    )?);

    let pipeline = {
        let job = Arc::clone(&job);
        let ctx = ctx.clone();
        move |unit: J::Unit| {
            let job = Arc::clone(&job);
            let ctx = ctx.clone();
            async move { job.process(&ctx, unit).await }
        }
    };
    let reporter = progress::reporter(options.progress, job.name());
    let row_sink: Arc<dyn RowSink> = sink.clone();
    let report = pool::run(
        units,
        pipeline,
        PoolConfig::new(ctx.config.concurrency)
            .with_cancel(cancel)
            .with_metrics(Arc::clone(&ctx.metrics)),
        row_sink,
        reporter.as_ref(),
    )
    .await;

    let summary = sink.finalize()?;
    ctx.metrics.flush();
    obs::emit_run_finished(&run_id, &summary, report.not_started, report.cancelled);

    Ok(RunOutcome {
        run_id,
        summary,
        not_started: report.not_started,
        duplicates: duplicates + report.duplicates,
        cancelled: report.cancelled,
    })
}
