//! Task and result types produced by a batch run.
//!
//! A run moves each input through three shapes:
//!
//! ```text
//! SourceFile ──naming──▶ FileTask ──converter──▶ ConversionOutcome
//! (discovered)           (has output path)       (success or BatchError)
//! ```
//!
//! All of them serialise to JSON so a [`BatchRunReport`] can be written next
//! to the PDFs or printed by the CLI with `--json`.

use crate::error::BatchError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// An input file found during discovery, before an output path is chosen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFile {
    pub input_path: PathBuf,
    /// Path relative to the discovery root; drives
    /// `preserve_directory_structure`.
    pub relative_input_path: PathBuf,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
}

impl SourceFile {
    /// Describe a file that is not on disk (or whose metadata is irrelevant).
    pub fn new(input_path: impl Into<PathBuf>) -> Self {
        let input_path = input_path.into();
        let relative_input_path = input_path
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| input_path.clone());
        Self {
            input_path,
            relative_input_path,
            size: 0,
            last_modified: None,
        }
    }
}

/// One unit of work: convert `input_path` into `output_path`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTask {
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub relative_input_path: PathBuf,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
}

impl FileTask {
    pub fn from_source(source: SourceFile, output_path: PathBuf) -> Self {
        Self {
            input_path: source.input_path,
            output_path,
            relative_input_path: source.relative_input_path,
            size: source.size,
            last_modified: source.last_modified,
        }
    }

    /// Same task, different destination.
    pub fn with_output_path(mut self, output_path: PathBuf) -> Self {
        self.output_path = output_path;
        self
    }
}

/// What the converter produced for one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvertedFile {
    pub output_path: PathBuf,
    /// Size of the written PDF in bytes.
    pub size: u64,
    pub duration_ms: u64,
}

/// Terminal result for one dispatched task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ConversionOutcome {
    Success {
        input_path: PathBuf,
        file: ConvertedFile,
    },
    Failure(BatchError),
}

impl ConversionOutcome {
    pub fn input_path(&self) -> &Path {
        match self {
            ConversionOutcome::Success { input_path, .. } => input_path,
            ConversionOutcome::Failure(e) => &e.input_path,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ConversionOutcome::Success { .. })
    }

    pub fn error(&self) -> Option<&BatchError> {
        match self {
            ConversionOutcome::Failure(e) => Some(e),
            ConversionOutcome::Success { .. } => None,
        }
    }
}

/// Aggregate result of a batch run.
///
/// `success` is true when nothing failed **or** the run was configured with
/// `continue_on_error`. Check `failed_files` (or `errors`) to detect partial
/// failure; `success` alone does not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRunReport {
    pub success: bool,
    pub total_files: usize,
    pub successful_files: usize,
    pub failed_files: usize,
    pub processing_time_ms: u64,
    /// Waves dispatched (0 for an empty run).
    pub waves: usize,
    pub errors: Vec<BatchError>,
    /// One outcome per task, in input order.
    pub results: Vec<ConversionOutcome>,
    /// Planned tasks after conflict resolution, in input order. Recovery
    /// uses these to find each failed file's destination.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tasks: Vec<FileTask>,
    #[serde(skip)]
    index: OutcomeIndex,
}

/// Position of each input's outcome in `results`.
///
/// Derived from `results`, so it is ignored by equality and serde. Lookups
/// verify the slot and fall back to a scan when `results` was edited
/// directly or the report was deserialised.
#[derive(Debug, Clone, Default)]
struct OutcomeIndex(HashMap<PathBuf, usize>);

impl PartialEq for OutcomeIndex {
    fn eq(&self, _other: &Self) -> bool {
        true
    }
}

impl OutcomeIndex {
    fn rebuild(&mut self, results: &[ConversionOutcome]) {
        self.0 = results
            .iter()
            .enumerate()
            .map(|(i, o)| (o.input_path().to_path_buf(), i))
            .collect();
    }

    fn position(&self, results: &[ConversionOutcome], input_path: &Path) -> Option<usize> {
        match self.0.get(input_path) {
            Some(&i) if results.get(i).is_some_and(|o| o.input_path() == input_path) => Some(i),
            _ => results.iter().position(|o| o.input_path() == input_path),
        }
    }
}

impl BatchRunReport {
    /// A zero-valued report. Nothing failed, so it counts as a success.
    pub fn empty() -> Self {
        Self {
            success: true,
            total_files: 0,
            successful_files: 0,
            failed_files: 0,
            processing_time_ms: 0,
            waves: 0,
            errors: Vec::new(),
            results: Vec::new(),
            tasks: Vec::new(),
            index: OutcomeIndex::default(),
        }
    }

    /// Files with a terminal outcome so far.
    pub fn settled_files(&self) -> usize {
        self.successful_files + self.failed_files
    }

    pub fn has_failures(&self) -> bool {
        self.failed_files > 0
    }

    /// Look up the outcome for an input path.
    pub fn outcome_for(&self, input_path: &Path) -> Option<&ConversionOutcome> {
        self.index
            .position(&self.results, input_path)
            .map(|i| &self.results[i])
    }

    /// Outputs written by successful conversions.
    pub fn output_paths(&self) -> impl Iterator<Item = &Path> {
        self.results.iter().filter_map(|o| match o {
            ConversionOutcome::Success { file, .. } => Some(file.output_path.as_path()),
            ConversionOutcome::Failure(_) => None,
        })
    }

    /// Fold one settled outcome into the counters.
    pub(crate) fn record(&mut self, outcome: ConversionOutcome) {
        match &outcome {
            ConversionOutcome::Success { .. } => self.successful_files += 1,
            ConversionOutcome::Failure(e) => {
                self.failed_files += 1;
                self.errors.push(e.clone());
            }
        }
        self.index
            .0
            .insert(outcome.input_path().to_path_buf(), self.results.len());
        self.results.push(outcome);
    }

    /// Put results and errors into task order and settle the `success` flag.
    pub(crate) fn finalize(&mut self, continue_on_error: bool) {
        let position: HashMap<&Path, usize> = self
            .tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.input_path.as_path(), i))
            .collect();
        let key = |p: &Path| position.get(p).copied().unwrap_or(usize::MAX);
        self.results.sort_by_key(|o| key(o.input_path()));
        self.errors.sort_by_key(|e| key(&e.input_path));
        self.index.rebuild(&self.results);
        self.success = self.failed_files == 0 || continue_on_error;
    }

    /// Replace a failure with a later success (used after recovery retries).
    pub fn mark_recovered(&mut self, input_path: &Path, file: ConvertedFile) -> bool {
        let Some(i) = self
            .index
            .position(&self.results, input_path)
            .filter(|&i| !self.results[i].is_success())
        else {
            return false;
        };
        self.results[i] = ConversionOutcome::Success {
            input_path: input_path.to_path_buf(),
            file,
        };
        self.errors.retain(|e| e.input_path != input_path);
        self.failed_files -= 1;
        self.successful_files += 1;
        true
    }
}
