//! Configuration types for batch Markdown-to-PDF runs.
//!
//! Run behaviour is controlled through [`BatchRunConfig`], built via its
//! [`BatchRunConfigBuilder`]. Resource and retry policies live in their own
//! small structs ([`Thresholds`], [`GovernorConfig`], [`RecoveryStrategy`])
//! because they are owned by long-lived components rather than by a single
//! run.
//!
//! Every type here is `Serialize + Deserialize` so a run's full configuration
//! can be logged next to its report and two runs can be diffed.

use crate::error::{ErrorKind, Md2PdfError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

/// Default number of files converted at once.
pub const DEFAULT_MAX_CONCURRENCY: usize = 2;

/// Configuration for one batch run.
///
/// Built via [`BatchRunConfig::builder()`] or using
/// [`BatchRunConfig::default()`].
///
/// # Example
/// ```rust
/// use md2pdf_batch::{BatchRunConfig, FilenameFormat};
///
/// let config = BatchRunConfig::builder()
///     .max_concurrency(4)
///     .output_directory("out")
///     .preserve_directory_structure(true)
///     .filename_format(FilenameFormat::WithDate)
///     .build()
///     .unwrap();
/// assert_eq!(config.max_concurrency, 4);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchRunConfig {
    /// Files converted per wave. Default: 2. Values below 1 are clamped to 1.
    ///
    /// Each conversion typically drives a heavyweight render process, so the
    /// ceiling is deliberately small.
    pub max_concurrency: usize,

    /// Keep going after a file fails. Default: true.
    ///
    /// When false, the wave containing the first failure is allowed to
    /// settle and the run then aborts with [`Md2PdfError::Aborted`].
    pub continue_on_error: bool,

    /// Directory that receives all PDFs. `None` writes each PDF next to its
    /// source file.
    pub output_directory: Option<PathBuf>,

    /// Mirror each input's relative directory under `output_directory`.
    /// Default: false.
    pub preserve_directory_structure: bool,

    /// How output filenames are derived. Default: [`FilenameFormat::Original`].
    pub filename_format: FilenameFormat,

    /// Glob used by [`crate::BatchScheduler::run_pattern`], e.g. `docs/**/*.md`.
    pub input_pattern: Option<String>,

    /// Globs removed from the discovered set.
    pub exclude_patterns: Vec<String>,

    /// Overwrite PDFs that already exist on disk instead of suffixing the new
    /// name. Existing files are backed up first when the recovery strategy
    /// asks for it. Default: false.
    pub overwrite_existing: bool,

    /// Let the resource governor shrink (never grow past
    /// `max_concurrency`) each wave. Default: false.
    pub adaptive_concurrency: bool,

    /// Wait between checks when the governor asks to pause. Default: 1000.
    pub pause_delay_ms: u64,
}

impl Default for BatchRunConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            continue_on_error: true,
            output_directory: None,
            preserve_directory_structure: false,
            filename_format: FilenameFormat::default(),
            input_pattern: None,
            exclude_patterns: Vec::new(),
            overwrite_existing: false,
            adaptive_concurrency: false,
            pause_delay_ms: 1000,
        }
    }
}

impl BatchRunConfig {
    /// Create a new builder for `BatchRunConfig`.
    pub fn builder() -> BatchRunConfigBuilder {
        BatchRunConfigBuilder {
            config: Self::default(),
        }
    }

    /// `max_concurrency` with the lower bound applied, for configs that were
    /// deserialised or mutated without going through the builder.
    pub fn effective_concurrency(&self) -> usize {
        self.max_concurrency.max(1)
    }
}

/// Builder for [`BatchRunConfig`].
#[derive(Debug)]
pub struct BatchRunConfigBuilder {
    config: BatchRunConfig,
}

impl BatchRunConfigBuilder {
    pub fn max_concurrency(mut self, n: usize) -> Self {
        self.config.max_concurrency = n.max(1);
        self
    }

    pub fn continue_on_error(mut self, v: bool) -> Self {
        self.config.continue_on_error = v;
        self
    }

    pub fn output_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.output_directory = Some(dir.into());
        self
    }

    pub fn preserve_directory_structure(mut self, v: bool) -> Self {
        self.config.preserve_directory_structure = v;
        self
    }

    pub fn filename_format(mut self, format: FilenameFormat) -> Self {
        self.config.filename_format = format;
        self
    }

    pub fn input_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.config.input_pattern = Some(pattern.into());
        self
    }

    pub fn exclude_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.config.exclude_patterns.push(pattern.into());
        self
    }

    pub fn overwrite_existing(mut self, v: bool) -> Self {
        self.config.overwrite_existing = v;
        self
    }

    pub fn adaptive_concurrency(mut self, v: bool) -> Self {
        self.config.adaptive_concurrency = v;
        self
    }

    pub fn pause_delay_ms(mut self, ms: u64) -> Self {
        self.config.pause_delay_ms = ms;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<BatchRunConfig, Md2PdfError> {
        let c = &self.config;
        if let FilenameFormat::Custom(pattern) = &c.filename_format {
            if pattern.trim().is_empty() {
                return Err(Md2PdfError::Validation {
                    field: "filename_format",
                    reason: "custom filename pattern must not be empty".into(),
                });
            }
            if !pattern.contains("{name}")
                && !pattern.contains("{date}")
                && !pattern.contains("{timestamp}")
            {
                return Err(Md2PdfError::Validation {
                    field: "filename_format",
                    reason: format!(
                        "custom pattern '{pattern}' has no {{name}}, {{date}} or {{timestamp}} placeholder; every file would get the same name"
                    ),
                });
            }
        }
        if c.preserve_directory_structure && c.output_directory.is_none() {
            return Err(Md2PdfError::Validation {
                field: "preserve_directory_structure",
                reason: "requires an output directory".into(),
            });
        }
        if let Some(pattern) = &c.input_pattern {
            if pattern.trim().is_empty() {
                return Err(Md2PdfError::Validation {
                    field: "input_pattern",
                    reason: "must not be empty".into(),
                });
            }
        }
        Ok(self.config)
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// How each output filename is derived from its source file.
///
/// | Variant | `notes.md` becomes |
/// |---------|--------------------|
/// | `Original` | `notes.pdf` |
/// | `WithTimestamp` | `notes_2026-10-16T08-34-00-000Z.pdf` |
/// | `WithDate` | `notes_2026-10-16.pdf` |
/// | `Custom("{date}-{name}")` | `2026-10-16-notes.pdf` |
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilenameFormat {
    #[default]
    Original,
    WithTimestamp,
    WithDate,
    /// Pattern with `{name}`, `{date}` and `{timestamp}` placeholders.
    /// `.pdf` is appended when missing.
    Custom(String),
}

// ── Resource governor ────────────────────────────────────────────────────

/// Stress thresholds. Any single one exceeded puts the host under stress.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    /// System memory used, percent. Default: 85.
    pub max_memory_usage_pct: f64,
    /// Load average relative to core count, percent. Default: 80.
    pub max_cpu_usage_pct: f64,
    /// Free system memory floor, MiB. Default: 512.
    pub min_free_memory_mb: u64,
    /// Process resident memory relative to system memory, percent. Default: 80.
    pub max_heap_usage_pct: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            max_memory_usage_pct: 85.0,
            max_cpu_usage_pct: 80.0,
            min_free_memory_mb: 512,
            max_heap_usage_pct: 80.0,
        }
    }
}

/// Configuration for [`crate::ResourceGovernor`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorConfig {
    pub thresholds: Thresholds,
    /// Background sampling period. Default: 5 s.
    pub sample_interval: Duration,
    /// Samples kept per series. Default: 100.
    pub history_capacity: usize,
    /// Warnings kept. Default: 50.
    pub warning_capacity: usize,
    /// Volume checked by the health gate. Default: current directory.
    pub disk_check_path: PathBuf,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            thresholds: Thresholds::default(),
            sample_interval: Duration::from_secs(5),
            history_capacity: 100,
            warning_capacity: 50,
            disk_check_path: PathBuf::from("."),
        }
    }
}

// ── Recovery ─────────────────────────────────────────────────────────────

/// Retry and safe-overwrite policy for [`crate::RecoveryCoordinator`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryStrategy {
    /// Attempts per failed file. Default: 3.
    pub max_retries: u32,
    /// Linear backoff unit: attempt `n` waits `n × retry_delay_ms`. Default: 1000.
    pub retry_delay_ms: u64,
    /// Kinds eligible for retry. Default: every kind whose
    /// [`ErrorKind::is_retryable`] is true.
    pub recoverable_kinds: BTreeSet<ErrorKind>,
    /// Copy existing outputs aside before overwriting them. Default: true.
    pub backup_original_files: bool,
    /// Delete partial outputs of failed files. Default: true.
    pub cleanup_on_failure: bool,
}

impl Default for RecoveryStrategy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 1000,
            recoverable_kinds: ErrorKind::ALL
                .iter()
                .copied()
                .filter(|k| k.is_retryable())
                .collect(),
            backup_original_files: true,
            cleanup_on_failure: true,
        }
    }
}

impl RecoveryStrategy {
    /// Delay before the 1-based `attempt`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_delay_ms.saturating_mul(u64::from(attempt)))
    }
}
