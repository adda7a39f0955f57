//! # md2pdf-batch
//!
//! Convert many Markdown documents to PDF at once, without falling over.
//!
//! ## Why this crate?
//!
//! Converting one Markdown file is a solved problem: pandoc, a headless
//! browser or any other engine will do it. Converting five thousand is not.
//! Run them one at a time and the batch takes all night; run them all at
//! once and the machine swaps itself to death. Outputs collide, an
//! interrupted run leaves half-written PDFs on top of good ones, and one
//! flaky render loses the whole batch.
//!
//! This crate is the batch engine around the converter. It does not parse
//! Markdown or draw PDFs. It decides how many conversions run at once,
//! backs off when the host is under pressure, gives every output a unique
//! and valid path, keeps pre-existing files safe, and retries the failures
//! that are worth retrying.
//!
//! ## Architecture
//!
//! ```text
//! Markdown files
//!  │
//!  ├─ 1. Discover   glob + excludes → sorted SourceFiles
//!  ├─ 2. Plan       filename format → FileTask per file
//!  ├─ 3. Paths      create dirs, `_N` conflict suffixes, validate, back up
//!  ├─ 4. Waves      ≤ max_concurrency conversions at once (governor-sized)
//!  ├─ 5. Tidy       remove partial outputs, restore or discard backups
//!  └─ 6. Recover    retry transient failures with linear backoff
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use md2pdf_batch::{BatchRunConfig, BatchScheduler, CommandConverter, ConversionOptions};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let converter = CommandConverter::from_template("pandoc {input} -o {output}")?;
//!     let scheduler = BatchScheduler::new(Arc::new(converter));
//!
//!     let config = BatchRunConfig::builder()
//!         .input_pattern("docs/**/*.md")
//!         .output_directory("pdf")
//!         .preserve_directory_structure(true)
//!         .max_concurrency(4)
//!         .build()?;
//!
//!     let mut report = scheduler.run_pattern(&ConversionOptions::default(), &config).await?;
//!     if report.has_failures() {
//!         let summary = scheduler.recover(&mut report, &ConversionOptions::default()).await;
//!         eprintln!("recovered {} file(s)", summary.recovered.len());
//!     }
//!     println!("{}/{} converted", report.successful_files, report.total_files);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `md2pdf` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library to avoid pulling in CLI-only deps:
//! ```toml
//! md2pdf-batch = { version = "0.1", default-features = false }
//! ```
//!
//! ## Partial success
//!
//! A run is not a transaction. With `continue_on_error` (the default) every
//! file gets a terminal outcome and the report says which ones failed;
//! `report.success` stays true, so check `failed_files`. With
//! `continue_on_error(false)` the wave holding the first failure settles and
//! the run returns [`Md2PdfError::Aborted`] carrying the partial report.

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod convert;
pub mod engine;
pub mod error;
pub mod output;
pub mod progress;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{
    BatchRunConfig, BatchRunConfigBuilder, FilenameFormat, GovernorConfig, RecoveryStrategy,
    Thresholds, DEFAULT_MAX_CONCURRENCY,
};
pub use convert::{CommandConverter, ConversionOptions, DocumentConverter};
pub use engine::discover::{discover_all, discover_sources};
pub use engine::{
    BackupSet, BatchScheduler, ConcurrencyAdvice, ConfigSuggestions, HealthCheck, MetricsSource,
    OutputPathManager, OutputReport, PathValidation, RecoveryCoordinator, RecoveryPlan,
    RecoverySuggestions, RecoverySummary, ResourceGovernor, ResourceReport, ResourceWarning,
    RetryOutcome, StressReason, StressVerdict, SystemHealth,
};
pub use error::{BatchError, ConversionError, ErrorKind, Md2PdfError};
pub use output::{BatchRunReport, ConversionOutcome, ConvertedFile, FileTask, SourceFile};
pub use progress::{BatchProgressCallback, NoopProgressCallback, ProgressCallback};

pub use host_probe::{CpuLoad, DiskSpace, HostProbe, MemoryUsage, ProcessSample, SystemSample};
