//! Bounded fan-out of per-entity pipelines.
//!
//! At most `limit` pipelines run at once. A permit is taken before a unit is
//! spawned, so queued units are plain values, not idle tasks. A failing or
//! panicking pipeline only produces a `failed` row for its own unit. Rows are
//! appended on the blocking pool so file I/O never holds a runtime worker.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use regsync_http::EntitySummary;
use tokio::sync::Semaphore;
use tokio::task::{self, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};

use crate::error::PipelineError;
use crate::metrics::RunMetrics;
use crate::obs;
use crate::progress::ProgressReporter;
use crate::sink::{ResultRow, RowSink};

pub const MISSING_ID_DETAIL: &str = "missing entity id in list response";

/// One item handed to the pool.
pub trait WorkUnit: Send + 'static {
    /// Partition key. Units sharing an id are processed once.
    fn unit_id(&self) -> Option<String>;
}

impl WorkUnit for EntitySummary {
    fn unit_id(&self) -> Option<String> {
        self.id.clone()
    }
}

#[derive(Clone)]
pub struct PoolConfig {
    pub limit: usize,
    pub cancel: CancellationToken,
    pub metrics: Arc<RunMetrics>,
}

impl PoolConfig {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            cancel: CancellationToken::new(),
            metrics: Arc::new(RunMetrics::new()),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<RunMetrics>) -> Self {
        self.metrics = metrics;
        self
    }
}

#[derive(Debug, Default)]
pub struct PoolReport {
    /// Rows in completion order.
    pub rows: Vec<ResultRow>,
    /// Units never started because the run was cancelled.
    pub not_started: usize,
    /// Units dropped because their id was already scheduled.
    pub duplicates: usize,
    pub cancelled: bool,
}

/// Drop repeated ids, first occurrence wins. Units without an id are kept.
pub fn dedupe<U: WorkUnit>(units: Vec<U>) -> (Vec<U>, usize) {
    let mut seen = HashSet::new();
    let mut kept = Vec::with_capacity(units.len());
    let mut dropped = 0;
    for unit in units {
        let Some(id) = unit.unit_id() else {
            kept.push(unit);
            continue;
        };
        if seen.insert(id) {
            kept.push(unit);
        } else {
            dropped += 1;
        }
    }
    (kept, dropped)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

struct Tally<'a> {
    rows: Vec<ResultRow>,
    /// Entity id of every task still in the set.
    spawned: HashMap<task::Id, String>,
    total: usize,
    progress: &'a dyn ProgressReporter,
    metrics: &'a RunMetrics,
}

impl Tally<'_> {
    fn record(&mut self, row: ResultRow) {
        obs::emit_entity_finished(&row);
        self.metrics.inc_units_completed();
        self.rows.push(row);
        self.progress.on_unit_complete(self.rows.len(), self.total);
    }

    /// Rows produced outside a worker are appended here.
    fn record_local(&mut self, row: ResultRow, sink: &dyn RowSink) {
        if let Err(err) = sink.append(&row) {
            obs::emit_sink_error(&row.entity_id, &err);
        }
        self.record(row);
    }

    fn joined(&mut self, joined: Result<(task::Id, ResultRow), JoinError>, sink: &dyn RowSink) {
        match joined {
            Ok((task, row)) => {
                self.spawned.remove(&task);
                self.record(row);
            }
            Err(err) => {
                let entity_id = self.spawned.remove(&err.id()).unwrap_or_default();
                warn!(entity_id = %entity_id, error = %err, "worker task did not complete");
                let row = ResultRow::failed(entity_id, &PipelineError::Panicked(err.to_string()));
                self.record_local(row, sink);
            }
        }
    }
}

/// Append on the blocking pool. A panicking sink is re-raised in the worker.
async fn persist(sink: Arc<dyn RowSink>, row: &ResultRow) {
    let owned = row.clone();
    match task::spawn_blocking(move || sink.append(&owned)).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => obs::emit_sink_error(&row.entity_id, &err),
        Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
        Err(err) => warn!(entity_id = %row.entity_id, error = %err, "row append did not run"),
    }
}

/// Run `pipeline` over `units` with at most `config.limit` in flight.
///
/// Each worker appends its own row to `sink`; the coordinator reports
/// progress after every completion.
#[instrument(skip_all, fields(units = units.len(), limit = config.limit))]
pub async fn run<U, F, Fut>(
    units: Vec<U>,
    pipeline: F,
    config: PoolConfig,
    sink: Arc<dyn RowSink>,
    progress: &dyn ProgressReporter,
) -> PoolReport
where
    U: WorkUnit,
    F: Fn(U) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ResultRow, PipelineError>> + Send + 'static,
{
    let (units, duplicates) = dedupe(units);
    if duplicates > 0 {
        warn!(duplicates, "dropped units with repeated ids");
    }

    let pipeline = Arc::new(pipeline);
    let semaphore = Arc::new(Semaphore::new(config.limit.max(1)));
    let mut tasks: JoinSet<ResultRow> = JoinSet::new();
    let mut tally = Tally {
        rows: Vec::with_capacity(units.len()),
        spawned: HashMap::new(),
        total: units.len(),
        progress,
        metrics: &config.metrics,
    };
    let mut not_started = 0;
    let mut cancelled = false;

    let mut queue = units.into_iter();
    while let Some(unit) = queue.next() {
        let Some(id) = unit.unit_id() else {
            tally.record_local(ResultRow::skipped("", MISSING_ID_DETAIL), sink.as_ref());
            continue;
        };

        let permit = loop {
            tokio::select! {
                biased;
                _ = config.cancel.cancelled() => break None,
                Some(joined) = tasks.join_next_with_id() => tally.joined(joined, sink.as_ref()),
                permit = Arc::clone(&semaphore).acquire_owned() => break permit.ok(),
            }
        };
        let Some(permit) = permit else {
            cancelled = true;
            not_started = 1 + queue.len();
            break;
        };

        let pipeline = Arc::clone(&pipeline);
        let sink = Arc::clone(&sink);
        let entity_id = id.clone();
        let handle = tasks.spawn(async move {
            let _permit = permit;
            let outcome = AssertUnwindSafe(async move { pipeline(unit).await })
                .catch_unwind()
                .await;
            let row = match outcome {
                Ok(Ok(row)) => row,
                Ok(Err(err)) => ResultRow::failed(id, &err),
                Err(panic) => {
                    ResultRow::failed(id, &PipelineError::Panicked(panic_message(panic.as_ref())))
                }
            };
            persist(sink, &row).await;
            row
        });
        tally.spawned.insert(handle.id(), entity_id);
    }

    while let Some(joined) = tasks.join_next_with_id().await {
        tally.joined(joined, sink.as_ref());
    }
    progress.finish();

    if cancelled {
        warn!(not_started, "run cancelled; remaining units were not started");
    }

    PoolReport {
        rows: tally.rows,
        not_started,
        duplicates,
        cancelled,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoProgress;
    use crate::sink::{MemorySink, RowStatus};
    use crate::error::SinkError;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    fn summaries(ids: &[&str]) -> Vec<EntitySummary> {
        ids.iter().map(|id| EntitySummary::new(*id)).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn never_exceeds_limit() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (f, p) = (Arc::clone(&in_flight), Arc::clone(&peak));

        let ids: Vec<String> = (0..20).map(|i| format!("u{}", i)).collect();
        let units: Vec<EntitySummary> = ids.iter().map(EntitySummary::new).collect();
        let report = run(
            units,
            move |unit: EntitySummary| {
                let (f, p) = (Arc::clone(&f), Arc::clone(&p));
                async move {
                    let now = f.fetch_add(1, Ordering::SeqCst) + 1;
                    p.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    f.fetch_sub(1, Ordering::SeqCst);
                    Ok(ResultRow::applied(unit.id.unwrap_or_default(), "ok"))
                }
            },
            PoolConfig::new(3),
            Arc::new(MemorySink::new()),
            &NoProgress,
        )
        .await;

        assert_eq!(report.rows.len(), 20);
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(peak.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn failures_and_panics_stay_isolated() {
        let sink = Arc::new(MemorySink::new());
        let report = run(
            summaries(&["a", "b", "c", "d"]),
            |unit: EntitySummary| async move {
                let id = unit.id.unwrap_or_default();
                match id.as_str() {
                    "b" => Err(PipelineError::Detail("bad record".to_string())),
                    "c" => panic!("boom"),
                    _ => Ok(ResultRow::applied(id, "ok")),
                }
            },
            PoolConfig::new(2),
            sink.clone(),
            &NoProgress,
        )
        .await;

        let mut statuses: Vec<(String, RowStatus)> = report
            .rows
            .iter()
            .map(|r| (r.entity_id.clone(), r.status))
            .collect();
        statuses.sort();
        assert_eq!(
            statuses,
            vec![
                ("a".to_string(), RowStatus::Applied),
                ("b".to_string(), RowStatus::Failed),
                ("c".to_string(), RowStatus::Failed),
                ("d".to_string(), RowStatus::Applied),
            ]
        );
        let panicked = report.rows.iter().find(|r| r.entity_id == "c").unwrap();
        assert!(panicked.detail.contains("boom"));
        assert_eq!(sink.rows().len(), 4);
    }

    #[tokio::test]
    async fn duplicates_dropped_and_missing_ids_skipped() {
        let mut units = summaries(&["a", "b", "a"]);
        units.push(EntitySummary::from_value(serde_json::json!({"name": "anon"})));
        let calls = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&calls);

        let report = run(
            units,
            move |unit: EntitySummary| {
                let seen = Arc::clone(&seen);
                async move {
                    let id = unit.id.unwrap_or_default();
                    seen.lock().unwrap().push(id.clone());
                    Ok(ResultRow::applied(id, "ok"))
                }
            },
            PoolConfig::new(4),
            Arc::new(MemorySink::new()),
            &NoProgress,
        )
        .await;

        assert_eq!(report.duplicates, 1);
        assert_eq!(report.rows.len(), 3);
        let skipped: Vec<_> = report
            .rows
            .iter()
            .filter(|r| r.status == RowStatus::Skipped)
            .collect();
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].detail, MISSING_ID_DETAIL);
        let mut called = calls.lock().unwrap().clone();
        called.sort();
        assert_eq!(called, vec!["a", "b"]);
    }

    #[test]
    fn dedupe_keeps_first_occurrence() {
        let mut units = summaries(&["a", "b", "a", "c", "b"]);
        units.push(EntitySummary::from_value(serde_json::json!({"name": "anon"})));
        units.push(EntitySummary::from_value(serde_json::json!({"name": "other"})));
        let (kept, dropped) = dedupe(units);
        assert_eq!(dropped, 2);
        let ids: Vec<Option<String>> = kept.into_iter().map(|u| u.id).collect();
        assert_eq!(
            ids,
            vec![Some("a".into()), Some("b".into()), Some("c".into()), None, None]
        );
    }

    /// Panics the first time a row for `target` is appended.
    struct PanicOnce {
        target: &'static str,
        tripped: AtomicBool,
        inner: MemorySink,
    }

    impl RowSink for PanicOnce {
        fn append(&self, row: &ResultRow) -> Result<(), SinkError> {
            if row.entity_id == self.target && !self.tripped.swap(true, Ordering::SeqCst) {
                panic!("disk went away");
            }
            self.inner.append(row)
        }
    }

    #[tokio::test]
    async fn lost_worker_is_reported_under_its_entity_id() {
        let sink = Arc::new(PanicOnce {
            target: "b",
            tripped: AtomicBool::new(false),
            inner: MemorySink::new(),
        });
        let report = run(
            summaries(&["a", "b", "c"]),
            |unit: EntitySummary| async move { Ok(ResultRow::applied(unit.id.unwrap_or_default(), "ok")) },
            PoolConfig::new(2),
            sink.clone(),
            &NoProgress,
        )
        .await;

        assert_eq!(report.rows.len(), 3);
        let lost = report.rows.iter().find(|r| r.status == RowStatus::Failed).unwrap();
        assert_eq!(lost.entity_id, "b");
        assert!(lost.detail.contains("disk went away"));
        let mut persisted: Vec<String> = sink.inner.rows().into_iter().map(|r| r.entity_id).collect();
        persisted.sort();
        assert_eq!(persisted, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn cancelled_before_start_runs_nothing() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = run(
            summaries(&["a", "b", "c"]),
            |unit: EntitySummary| async move { Ok(ResultRow::applied(unit.id.unwrap_or_default(), "ok")) },
            PoolConfig::new(2).with_cancel(cancel),
            Arc::new(MemorySink::new()),
            &NoProgress,
        )
        .await;
        assert!(report.cancelled);
        assert_eq!(report.not_started, 3);
        assert!(report.rows.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_mid_run_lets_in_flight_finish() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let report = run(
            summaries(&["a", "b", "c", "d", "e"]),
            move |unit: EntitySummary| {
                let trigger = trigger.clone();
                async move {
                    let id = unit.id.unwrap_or_default();
                    if id == "a" {
                        trigger.cancel();
                    }
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(ResultRow::applied(id, "ok"))
                }
            },
            PoolConfig::new(1).with_cancel(cancel),
            Arc::new(MemorySink::new()),
            &NoProgress,
        )
        .await;
        assert!(report.cancelled);
        assert_eq!(report.rows.len(), 1);
        assert_eq!(report.rows[0].status, RowStatus::Applied);
        assert_eq!(report.not_started, 4);
    }

    struct Counting(AtomicUsize, AtomicUsize);

    impl ProgressReporter for Counting {
        fn on_unit_complete(&self, current: usize, total: usize) {
            self.0.fetch_add(1, Ordering::SeqCst);
            self.1.store(total, Ordering::SeqCst);
            assert!(current <= total);
        }
    }

    #[tokio::test]
    async fn progress_sees_every_completion() {
        let progress = Counting(AtomicUsize::new(0), AtomicUsize::new(0));
        let metrics = Arc::new(RunMetrics::new());
        run(
            summaries(&["a", "b", "c"]),
            |unit: EntitySummary| async move { Ok(ResultRow::skipped(unit.id.unwrap_or_default(), "noop")) },
            PoolConfig::new(8).with_metrics(Arc::clone(&metrics)),
            Arc::new(MemorySink::new()),
            &progress,
        )
        .await;
        assert_eq!(progress.0.load(Ordering::SeqCst), 3);
        assert_eq!(progress.1.load(Ordering::SeqCst), 3);
        assert_eq!(metrics.units_completed(), 3);
    }
}
