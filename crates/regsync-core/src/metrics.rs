//! Per-run counters.
//!
//! Counters are bumped at the call site and emitted once, as a single
//! `tracing::info!` event, by [`RunMetrics::flush`] at the end of a run.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use regsync_http::TransportStats;

#[derive(Default)]
pub struct RunMetrics {
    units_completed: AtomicU64,
    writes_issued: AtomicU64,
    transport: Option<Arc<TransportStats>>,
}

impl RunMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Include the transport's attempt counters in [`flush`](Self::flush).
    pub fn with_transport(mut self, stats: Arc<TransportStats>) -> Self {
        self.transport = Some(stats);
        self
    }

    pub fn inc_units_completed(&self) {
        self.units_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_writes_issued(&self) {
        self.writes_issued.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "writes_issued", "counter incremented");
    }

    pub fn units_completed(&self) -> u64 {
        self.units_completed.load(Ordering::Relaxed)
    }

    pub fn writes_issued(&self) -> u64 {
        self.writes_issued.load(Ordering::Relaxed)
    }

    pub fn flush(&self) {
        let transport = self
            .transport
            .as_ref()
            .map(|t| t.snapshot())
            .unwrap_or_default();
        tracing::info!(
            metric = "flush",
            requests_sent = transport.requests_sent,
            retries = transport.retries,
            requests_gave_up = transport.gave_up,
            units_completed = self.units_completed(),
            writes_issued = self.writes_issued(),
        );
    }
}
