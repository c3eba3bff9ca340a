//! Progress reporting.
//!
//! The pool calls [`ProgressReporter::on_unit_complete`] after every
//! finished unit. Reporters only observe; they never affect the run.

use std::io::IsTerminal;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

pub trait ProgressReporter: Send + Sync {
    fn on_unit_complete(&self, current: usize, total: usize);

    fn finish(&self) {}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProgressMode {
    /// Terminal bar, hidden when stderr is not a terminal.
    #[default]
    Bar,
    /// A log line whenever the integer percentage changes.
    Log,
    None,
}

impl FromStr for ProgressMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bar" => Ok(ProgressMode::Bar),
            "log" => Ok(ProgressMode::Log),
            "none" | "off" => Ok(ProgressMode::None),
            other => Err(format!("unknown progress mode: {other}")),
        }
    }
}

/// Build the reporter for `mode`.
pub fn reporter(mode: ProgressMode, label: &str) -> Box<dyn ProgressReporter> {
    match mode {
        ProgressMode::Bar => Box::new(BarProgress::new(label)),
        ProgressMode::Log => Box::new(LogProgress::new(label)),
        ProgressMode::None => Box::new(NoProgress),
    }
}

// ---------------------------------------------------------------------------

pub struct BarProgress {
    bar: ProgressBar,
}

impl BarProgress {
    pub fn new(label: &str) -> Self {
        if !std::io::stderr().is_terminal() {
            return Self {
                bar: ProgressBar::hidden(),
            };
        }
        let bar = ProgressBar::new(0);
        if let Ok(style) = ProgressStyle::with_template(
            "{prefix} |{bar:30.cyan/blue}| {percent:>3}% ({pos}/{len}) {elapsed_precise}",
        ) {
            bar.set_style(style.progress_chars("█▉-"));
        }
        bar.set_prefix(label.to_string());
        bar.enable_steady_tick(Duration::from_millis(200));
        Self { bar }
    }
}

impl ProgressReporter for BarProgress {
    fn on_unit_complete(&self, current: usize, total: usize) {
        self.bar.set_length(total as u64);
        self.bar.set_position(current as u64);
    }

    fn finish(&self) {
        self.bar.finish();
    }
}

// ---------------------------------------------------------------------------

pub struct LogProgress {
    label: String,
    last_percent: AtomicU64,
}

impl LogProgress {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            last_percent: AtomicU64::new(u64::MAX),
        }
    }

    /// Integer percentage, `100` for an empty run.
    pub fn percent(current: usize, total: usize) -> u64 {
        if total == 0 {
            return 100;
        }
        (current as u64 * 100) / total as u64
    }
}

impl ProgressReporter for LogProgress {
    fn on_unit_complete(&self, current: usize, total: usize) {
        let percent = Self::percent(current, total);
        if self.last_percent.swap(percent, Ordering::Relaxed) != percent {
            info!(progress = %self.label, current, total, percent, "progress");
        }
    }
}

// ---------------------------------------------------------------------------

pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn on_unit_complete(&self, _current: usize, _total: usize) {}
}
