//! Per-entity results and their on-disk form.
//!
//! Every run writes `<job>_<stamp>_<run>.csv` and `<job>_<stamp>_<run>.json`
//! into the output directory, where `<run>` is the start of the run id. Both
//! are appended to and flushed row by row, so an interrupted run leaves every
//! completed row on disk. Existing files are never overwritten.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{PipelineError, SinkError};

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowStatus {
    Applied,
    DryRun,
    Skipped,
    Excluded,
    Failed,
}

impl RowStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RowStatus::Applied => "applied",
            RowStatus::DryRun => "dry_run",
            RowStatus::Skipped => "skipped",
            RowStatus::Excluded => "excluded",
            RowStatus::Failed => "failed",
        }
    }
}

/// The outcome for one entity. Immutable once handed to a sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultRow {
    pub entity_id: String,
    pub status: RowStatus,
    pub detail: String,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl ResultRow {
    pub fn new(entity_id: impl Into<String>, status: RowStatus, detail: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            status,
            detail: detail.into(),
            fields: BTreeMap::new(),
            payload: None,
        }
    }

    pub fn applied(entity_id: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(entity_id, RowStatus::Applied, detail)
    }

    pub fn dry_run(entity_id: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(entity_id, RowStatus::DryRun, detail)
    }

    pub fn skipped(entity_id: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(entity_id, RowStatus::Skipped, detail)
    }

    pub fn excluded(entity_id: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(entity_id, RowStatus::Excluded, detail)
    }

    pub fn failed(entity_id: impl Into<String>, error: &PipelineError) -> Self {
        let mut row = Self::new(entity_id, RowStatus::Failed, error.row_detail());
        if let Some(status) = error.http_status() {
            row.fields.insert("http_status".to_string(), status.to_string());
        }
        row
    }

    pub fn with_field(mut self, key: &str, value: impl Into<String>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    /// Multi-valued columns are pipe-delimited.
    pub fn with_list_field(self, key: &str, values: &[String]) -> Self {
        self.with_field(key, values.join("|"))
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// Anything rows can be appended to from many workers at once.
pub trait RowSink: Send + Sync {
    fn append(&self, row: &ResultRow) -> Result<(), SinkError>;
}

// ---------------------------------------------------------------------------
// Counts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunCounts {
    pub applied: u64,
    pub dry_run: u64,
    pub skipped: u64,
    pub excluded: u64,
    pub failed: u64,
    /// Rows that could not be persisted.
    pub write_errors: u64,
}

impl RunCounts {
    pub fn record(&mut self, status: RowStatus) {
        match status {
            RowStatus::Applied => self.applied += 1,
            RowStatus::DryRun => self.dry_run += 1,
            RowStatus::Skipped => self.skipped += 1,
            RowStatus::Excluded => self.excluded += 1,
            RowStatus::Failed => self.failed += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.applied + self.dry_run + self.skipped + self.excluded + self.failed
    }

    pub fn has_failures(&self) -> bool {
        self.failed > 0 || self.write_errors > 0
    }
}

// ---------------------------------------------------------------------------
// File sink
// ---------------------------------------------------------------------------

/// Run-level header written before any row.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SinkMetadata {
    pub run_id: String,
    pub job: String,
    pub mode: String,
    pub base_url: String,
    pub change: Option<String>,
    pub columns: Vec<String>,
    pub started_at: DateTime<Utc>,
}

/// What `finalize` reports.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub counts: RunCounts,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub csv_path: PathBuf,
    pub json_path: PathBuf,
}

struct SinkFiles {
    csv: csv::Writer<File>,
    json: BufWriter<File>,
    rows_written: u64,
    counts: RunCounts,
    finished: bool,
}

/// CSV + JSON result files for one run. One mutex covers both.
pub struct ResultSink {
    columns: Vec<String>,
    started_at: DateTime<Utc>,
    csv_path: PathBuf,
    json_path: PathBuf,
    files: Mutex<SinkFiles>,
}

/// Characters of the run id kept in file names.
const RUN_TAG_LEN: usize = 8;

fn create_file(path: &Path) -> Result<File, SinkError> {
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|source| SinkError::Create {
            path: path.to_path_buf(),
            source,
        })
}

impl ResultSink {
    /// Create both files and write their headers.
    pub fn create(out_dir: &Path, metadata: SinkMetadata) -> Result<Self, SinkError> {
        fs::create_dir_all(out_dir).map_err(|source| SinkError::Create {
            path: out_dir.to_path_buf(),
            source,
        })?;

        let stamp = metadata.started_at.format("%Y%m%dT%H%M%SZ");
        let run_tag: String = metadata
            .run_id
            .chars()
            .filter(char::is_ascii_alphanumeric)
            .take(RUN_TAG_LEN)
            .collect();
        let stem = format!("{}_{}_{}", metadata.job, stamp, run_tag);
        let csv_path = out_dir.join(format!("{}.csv", stem));
        let json_path = out_dir.join(format!("{}.json", stem));

        let mut csv = csv::Writer::from_writer(create_file(&csv_path)?);
        let mut header = vec!["id", "status", "detail"];
        header.extend(metadata.columns.iter().map(String::as_str));
        csv.write_record(&header)?;
        csv.flush()?;

        let mut json = BufWriter::new(create_file(&json_path)?);
        json.write_all(b"{\n\"metadata\": ")?;
        serde_json::to_writer(&mut json, &metadata)?;
        json.write_all(b",\n\"rows\": [")?;
        json.flush()?;

        Ok(Self {
            columns: metadata.columns,
            started_at: metadata.started_at,
            csv_path,
            json_path,
            files: Mutex::new(SinkFiles {
                csv,
                json,
                rows_written: 0,
                counts: RunCounts::default(),
                finished: false,
            }),
        })
    }

    pub fn csv_path(&self) -> &Path {
        &self.csv_path
    }

    pub fn json_path(&self) -> &Path {
        &self.json_path
    }

    pub fn counts(&self) -> RunCounts {
        self.lock().counts
    }

    fn lock(&self) -> MutexGuard<'_, SinkFiles> {
        // A panic while holding the lock leaves the files as they were.
        self.files.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_row(&self, files: &mut SinkFiles, row: &ResultRow) -> Result<(), SinkError> {
        let mut record = vec![
            row.entity_id.as_str(),
            row.status.as_str(),
            row.detail.as_str(),
        ];
        record.extend(
            self.columns
                .iter()
                .map(|c| row.fields.get(c).map(String::as_str).unwrap_or("")),
        );
        files.csv.write_record(&record)?;
        files.csv.flush()?;

        let separator: &[u8] = if files.rows_written == 0 { b"\n" } else { b",\n" };
        files.json.write_all(separator)?;
        serde_json::to_writer(&mut files.json, row)?;
        files.json.flush()?;
        files.rows_written += 1;
        Ok(())
    }

    /// Close the JSON document and return the final counts.
    pub fn finalize(&self) -> Result<RunSummary, SinkError> {
        let mut files = self.lock();
        if files.finished {
            return Err(SinkError::Finalized);
        }
        files.finished = true;

        let summary = RunSummary {
            counts: files.counts,
            started_at: self.started_at,
            finished_at: Utc::now(),
            csv_path: self.csv_path.clone(),
            json_path: self.json_path.clone(),
        };

        files.csv.flush()?;
        files.json.write_all(b"\n],\n\"summary\": ")?;
        serde_json::to_writer(
            &mut files.json,
            &serde_json::json!({
                "counts": summary.counts,
                "total": summary.counts.total(),
                "finishedAt": summary.finished_at,
            }),
        )?;
        files.json.write_all(b"\n}\n")?;
        files.json.flush()?;
        Ok(summary)
    }
}

impl RowSink for ResultSink {
    fn append(&self, row: &ResultRow) -> Result<(), SinkError> {
        let mut files = self.lock();
        if files.finished {
            files.counts.write_errors += 1;
            return Err(SinkError::Finalized);
        }
        files.counts.record(row.status);
        let written = self.write_row(&mut files, row);
        if written.is_err() {
            files.counts.write_errors += 1;
        }
        written
    }
}

/// Keeps rows in memory. Used where no files are wanted.
#[derive(Default)]
pub struct MemorySink {
    rows: Mutex<Vec<ResultRow>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self) -> Vec<ResultRow> {
        self.rows
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl RowSink for MemorySink {
    fn append(&self, row: &ResultRow) -> Result<(), SinkError> {
        self.rows
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(row.clone());
        Ok(())
    }
}
