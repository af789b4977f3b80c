//! Run results and live progress

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Outcome of one file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FileStatus {
    Completed,
    Aborted { reason: String },
}

/// Per-file counters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileSummary {
    pub file: PathBuf,
    pub level: String,
    /// Data rows read, including rejected ones
    pub processed: u64,
    /// Rows durably written
    pub inserted: u64,
    /// Rows rejected for an incomplete identifier
    pub skipped: u64,
    /// Cells kept as text after a failed type coercion
    pub degraded: u64,
    /// Chunks applied and committed
    pub chunks: u64,
    #[serde(flatten)]
    pub status: FileStatus,
}

impl FileSummary {
    pub fn new(file: PathBuf, level: impl Into<String>) -> Self {
        Self {
            file,
            level: level.into(),
            processed: 0,
            inserted: 0,
            skipped: 0,
            degraded: 0,
            chunks: 0,
            status: FileStatus::Completed,
        }
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self.status, FileStatus::Aborted { .. })
    }
}

/// Result of a whole run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub survey_id: i32,
    pub total_processed: u64,
    pub total_inserted: u64,
    pub total_skipped: u64,
    pub total_degraded: u64,
    pub files: Vec<FileSummary>,
    pub elapsed_secs: f64,
}

impl RunSummary {
    pub fn new(survey_id: i32) -> Self {
        Self {
            survey_id,
            total_processed: 0,
            total_inserted: 0,
            total_skipped: 0,
            total_degraded: 0,
            files: Vec::new(),
            elapsed_secs: 0.0,
        }
    }

    /// Fold a finished file into the totals.
    pub fn add_file(&mut self, file: FileSummary) {
        self.total_processed += file.processed;
        self.total_inserted += file.inserted;
        self.total_skipped += file.skipped;
        self.total_degraded += file.degraded;
        self.files.push(file);
    }

    pub fn aborted_files(&self) -> usize {
        self.files.iter().filter(|f| f.is_aborted()).count()
    }

    /// No skips, no degraded cells, no aborted files
    pub fn is_clean(&self) -> bool {
        self.total_skipped == 0 && self.total_degraded == 0 && self.aborted_files() == 0
    }
}

/// Snapshot of an in-flight run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunProgress {
    pub current_file: Option<String>,
    pub files_done: u64,
    pub processed: u64,
    pub inserted: u64,
    pub skipped: u64,
}

#[derive(Debug, Default)]
struct ProgressState {
    files_done: AtomicU64,
    processed: AtomicU64,
    inserted: AtomicU64,
    skipped: AtomicU64,
    current_file: Mutex<Option<String>>,
}

/// Cloneable view of the driver's counters, safe to poll from another task
#[derive(Debug, Clone, Default)]
pub struct ProgressHandle {
    state: Arc<ProgressState>,
}

impl ProgressHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> RunProgress {
        RunProgress {
            current_file: self
                .state
                .current_file
                .lock()
                .map(|f| f.clone())
                .unwrap_or_default(),
            files_done: self.state.files_done.load(Ordering::Relaxed),
            processed: self.state.processed.load(Ordering::Relaxed),
            inserted: self.state.inserted.load(Ordering::Relaxed),
            skipped: self.state.skipped.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn start_file(&self, name: &str) {
        if let Ok(mut current) = self.state.current_file.lock() {
            *current = Some(name.to_string());
        }
    }

    pub(crate) fn finish_file(&self) {
        self.state.files_done.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut current) = self.state.current_file.lock() {
            *current = None;
        }
    }

    pub(crate) fn record_rows(&self, processed: u64, skipped: u64) {
        self.state.processed.fetch_add(processed, Ordering::Relaxed);
        self.state.skipped.fetch_add(skipped, Ordering::Relaxed);
    }

    pub(crate) fn record_inserted(&self, inserted: u64) {
        self.state.inserted.fetch_add(inserted, Ordering::Relaxed);
    }

    /// Take back inserts that were rolled back.
    pub(crate) fn retract_inserted(&self, inserted: u64) {
        self.state.inserted.fetch_sub(inserted, Ordering::Relaxed);
    }
}
