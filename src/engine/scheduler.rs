//! Wave scheduler: turns a list of source files into a [`BatchRunReport`].
//!
//! ## Run pipeline
//!
//! ```text
//! files ─▶ plan names ─▶ create dirs ─▶ resolve conflicts ─▶ validate
//!                                                              │
//!          ┌────────────────────── invalid → failed outcomes ◀─┤
//!          │                                                   ▼
//!          │                                     back up outputs to overwrite
//!          │                                                   │
//!          │     ┌──────────── wave 1 ─────────┐               ▼
//!          │     │ convert ∥ convert ∥ convert │ ◀── governor advice
//!          │     └─────────────┬───────────────┘
//!          │                   ▼  (every file settles)
//!          │                 wave 2 …
//!          ▼                   ▼
//!       report ◀── clean up failed outputs, restore/discard backups
//! ```
//!
//! ## Why waves?
//!
//! A wave is a batch of at most `max_concurrency` conversions that all settle
//! before the next one starts. Compared to a sliding window this wastes a
//! little throughput at the tail of each wave, but it gives two properties
//! the engine relies on: the governor sees a quiet moment between waves to
//! resize the next one, and fail-fast can stop cleanly on a wave boundary
//! without cancelling conversions that are already running.

use crate::config::{BatchRunConfig, RecoveryStrategy};
use crate::convert::{ConversionOptions, DocumentConverter};
use crate::engine::discover::discover_sources;
use crate::engine::governor::{HealthCheck, ResourceGovernor};
use crate::engine::naming::plan_tasks;
use crate::engine::paths::{BackupSet, OutputPathManager};
use crate::engine::recovery::{RecoveryCoordinator, RecoverySummary};
use crate::error::{BatchError, Md2PdfError};
use crate::output::{BatchRunReport, ConversionOutcome, FileTask, SourceFile};
use crate::progress::{NoopProgressCallback, ProgressCallback};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Times the scheduler waits for memory to recover before forcing a
/// single-file wave.
pub const MAX_PAUSES: u32 = 5;

/// Runs batches of conversions in concurrency-bounded waves.
///
/// # Example
///
/// ```rust,no_run
/// use md2pdf_batch::{BatchRunConfig, BatchScheduler, CommandConverter, ConversionOptions, SourceFile};
/// use std::sync::Arc;
///
/// # async fn demo() -> Result<(), md2pdf_batch::Md2PdfError> {
/// let converter = CommandConverter::from_template("pandoc {input} -o {output}")?;
/// let scheduler = BatchScheduler::new(Arc::new(converter));
/// let config = BatchRunConfig::builder().max_concurrency(3).output_directory("pdf").build()?;
/// let files = vec![SourceFile::new("a.md"), SourceFile::new("b.md")];
/// let report = scheduler.run(files, &ConversionOptions::default(), &config).await?;
/// println!("{}/{} converted", report.successful_files, report.total_files);
/// # Ok(())
/// # }
/// ```
pub struct BatchScheduler {
    converter: Arc<dyn DocumentConverter>,
    paths: OutputPathManager,
    governor: Option<Arc<ResourceGovernor>>,
    strategy: RecoveryStrategy,
    progress: ProgressCallback,
}

impl std::fmt::Debug for BatchScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchScheduler")
            .field("converter", &self.converter.name())
            .field("governor", &self.governor.is_some())
            .field("strategy", &self.strategy)
            .finish_non_exhaustive()
    }
}

impl BatchScheduler {
    pub fn new(converter: Arc<dyn DocumentConverter>) -> Self {
        Self {
            converter,
            paths: OutputPathManager::new(),
            governor: None,
            strategy: RecoveryStrategy::default(),
            progress: Arc::new(NoopProgressCallback),
        }
    }

    /// Attach a governor. Used for adaptive wave sizing and as the health
    /// gate for recovery.
    pub fn with_governor(mut self, governor: Arc<ResourceGovernor>) -> Self {
        self.governor = Some(governor);
        self
    }

    pub fn with_recovery_strategy(mut self, strategy: RecoveryStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = progress;
        self
    }

    pub fn governor(&self) -> Option<&Arc<ResourceGovernor>> {
        self.governor.as_ref()
    }

    pub fn converter(&self) -> &Arc<dyn DocumentConverter> {
        &self.converter
    }

    pub fn paths(&self) -> &OutputPathManager {
        &self.paths
    }

    /// A coordinator sharing this scheduler's strategy, gated on the
    /// governor when one is attached.
    pub fn recovery_coordinator(&self) -> RecoveryCoordinator {
        match &self.governor {
            Some(g) => {
                let gate: Arc<dyn HealthCheck> = g.clone();
                RecoveryCoordinator::new(self.strategy.clone(), gate)
            }
            None => RecoveryCoordinator::without_health_gate(self.strategy.clone()),
        }
    }

    /// Discover files from `config.input_pattern` and run them.
    pub async fn run_pattern(
        &self,
        options: &ConversionOptions,
        config: &BatchRunConfig,
    ) -> Result<BatchRunReport, Md2PdfError> {
        let pattern = config
            .input_pattern
            .as_deref()
            .ok_or_else(|| Md2PdfError::Validation {
                field: "input_pattern",
                reason: "required for pattern runs".into(),
            })?;

        let files = discover_sources(pattern, &config.exclude_patterns).await?;
        if files.is_empty() {
            return Err(Md2PdfError::NoInputFiles {
                pattern: pattern.to_string(),
            });
        }
        info!("Pattern '{}' matched {} file(s)", pattern, files.len());
        self.run(files, options, config).await
    }

    /// Convert `files` in waves of at most `max_concurrency`.
    ///
    /// Returns `Err(Md2PdfError::Aborted)` when `continue_on_error` is false
    /// and a file fails; the error carries the partial report. Any other
    /// `Err` means the run never dispatched a conversion.
    pub async fn run(
        &self,
        files: Vec<SourceFile>,
        options: &ConversionOptions,
        config: &BatchRunConfig,
    ) -> Result<BatchRunReport, Md2PdfError> {
        let start = Instant::now();
        if files.is_empty() {
            debug!("empty batch");
            return Ok(BatchRunReport::empty());
        }

        let concurrency = config.effective_concurrency();
        info!(
            "Starting batch: {} file(s), concurrency {}",
            files.len(),
            concurrency
        );

        // ── 1. Prepare destinations ──────────────────────────────────────
        if let Some(dir) = &config.output_directory {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|source| Md2PdfError::DirectoryCreation {
                    path: dir.clone(),
                    source,
                })?;
        }

        let tasks = plan_tasks(files, config, Utc::now());
        self.paths.prepare_directories(&tasks).await?;
        let tasks = self
            .paths
            .resolve_conflicts(tasks, config.overwrite_existing)
            .await;
        let validation = self.paths.validate_paths(tasks.clone()).await;

        let mut report = BatchRunReport::empty();
        report.total_files = tasks.len();
        report.tasks = tasks;
        self.progress.on_batch_start(report.total_files);

        // ── 2. Invalid destinations fail without conversion ───────────────
        let mut first_invalid = None;
        for (task, error) in validation.invalid {
            let failure = BatchError::new(task.input_path, error);
            warn!("Skipping {}", failure);
            self.progress.on_file_error(
                &failure.input_path.display().to_string(),
                &failure.error.to_string(),
            );
            first_invalid.get_or_insert_with(|| failure.clone());
            self.settle(&mut report, ConversionOutcome::Failure(failure));
        }
        if let Some(error) = first_invalid.filter(|_| !config.continue_on_error) {
            return Err(self.abort(report, error, config, start));
        }

        let valid = validation.valid;
        let preexisting = if config.overwrite_existing {
            existing_outputs(&valid).await
        } else {
            HashSet::new()
        };
        let backups = if config.overwrite_existing && self.strategy.backup_original_files {
            self.paths.create_backups(&valid).await?
        } else {
            BackupSet::default()
        };

        // ── 3. Waves ─────────────────────────────────────────────────────
        let mut next = 0;
        let mut wave_size = concurrency;
        let mut abort_with = None;

        while next < valid.len() {
            if config.adaptive_concurrency {
                wave_size = self
                    .adapt_wave_size(wave_size, concurrency, valid.len() - next, config)
                    .await;
            }

            let end = (next + wave_size).min(valid.len());
            let wave = &valid[next..end];
            report.waves += 1;
            debug!(wave = report.waves, size = wave.len(), "dispatching wave");
            self.progress.on_wave_start(report.waves, wave.len());

            self.run_wave(wave, options, &mut report).await;
            next = end;

            if !config.continue_on_error {
                let failed = wave.iter().find_map(|t| {
                    report
                        .outcome_for(&t.input_path)
                        .and_then(ConversionOutcome::error)
                        .cloned()
                });
                if let Some(error) = failed {
                    abort_with = Some(error);
                    break;
                }
            }
        }

        // ── 4. Tidy up ───────────────────────────────────────────────────
        self.finish_outputs(&report, &valid, backups, &preexisting).await;

        match abort_with {
            Some(error) => Err(self.abort(report, error, config, start)),
            None => {
                report.finalize(config.continue_on_error);
                report.processing_time_ms = start.elapsed().as_millis() as u64;
                self.progress
                    .on_batch_complete(report.total_files, report.successful_files);
                info!(
                    "Batch complete: {}/{} succeeded in {} wave(s), {}ms",
                    report.successful_files,
                    report.total_files,
                    report.waves,
                    report.processing_time_ms
                );
                Ok(report)
            }
        }
    }

    /// Retry the report's recoverable failures with this scheduler's
    /// converter and strategy.
    pub async fn recover(
        &self,
        report: &mut BatchRunReport,
        options: &ConversionOptions,
    ) -> RecoverySummary {
        let tasks = report.tasks.clone();
        self.recovery_coordinator()
            .recover_batch(report, &tasks, self.converter.as_ref(), options)
            .await
    }

    /// Run a batch on a fresh tokio runtime, for callers without one.
    pub fn run_blocking(
        &self,
        files: Vec<SourceFile>,
        options: &ConversionOptions,
        config: &BatchRunConfig,
    ) -> Result<BatchRunReport, Md2PdfError> {
        tokio::runtime::Runtime::new()
            .map_err(|e| Md2PdfError::Internal(format!("Failed to create tokio runtime: {}", e)))?
            .block_on(self.run(files, options, config))
    }

    // ── Internals ────────────────────────────────────────────────────────

    /// Dispatch every task in `wave` at once and fold outcomes as they settle.
    async fn run_wave(&self, wave: &[FileTask], options: &ConversionOptions, report: &mut BatchRunReport) {
        let mut settled = stream::iter(wave.iter().map(|task| self.convert_one(task, options)))
            .buffer_unordered(wave.len().max(1));

        while let Some(outcome) = settled.next().await {
            self.settle(report, outcome);
        }
    }

    async fn convert_one(&self, task: &FileTask, options: &ConversionOptions) -> ConversionOutcome {
        let input = task.input_path.display().to_string();
        self.progress.on_file_start(&input);

        match self
            .converter
            .convert(&task.input_path, &task.output_path, options)
            .await
        {
            Ok(file) => {
                debug!(input = %input, output = %file.output_path.display(), ms = file.duration_ms, "converted");
                self.progress.on_file_complete(
                    &input,
                    &file.output_path.display().to_string(),
                    file.duration_ms,
                );
                ConversionOutcome::Success {
                    input_path: task.input_path.clone(),
                    file,
                }
            }
            Err(e) => {
                warn!("{}: {}", input, e);
                self.progress.on_file_error(&input, &e.to_string());
                ConversionOutcome::Failure(BatchError::new(task.input_path.clone(), e))
            }
        }
    }

    /// Record one outcome and emit progress.
    fn settle(&self, report: &mut BatchRunReport, outcome: ConversionOutcome) {
        let current = outcome.input_path().display().to_string();
        report.record(outcome);

        let percent = if report.total_files == 0 {
            100.0
        } else {
            report.settled_files() as f64 / report.total_files as f64 * 100.0
        };
        self.progress.on_progress(percent, &current);
    }

    /// Ask the governor how big the next wave should be.
    async fn adapt_wave_size(
        &self,
        current: usize,
        max: usize,
        remaining: usize,
        config: &BatchRunConfig,
    ) -> usize {
        let Some(governor) = &self.governor else {
            return current;
        };

        let advice = match governor.recommend(current, remaining).await {
            Ok(a) => a,
            Err(e) => {
                warn!("Governor unavailable, keeping concurrency {}: {}", current, e);
                return current;
            }
        };

        if advice.should_pause {
            let delay = Duration::from_millis(config.pause_delay_ms);
            for pause in 1..=MAX_PAUSES {
                warn!(
                    "Resources critical, pausing {}ms ({}/{})",
                    config.pause_delay_ms, pause, MAX_PAUSES
                );
                tokio::time::sleep(delay).await;
                match governor.recommend(current, remaining).await {
                    Ok(a) if a.should_pause => {}
                    Ok(_) => break,
                    Err(e) => {
                        warn!("Governor unavailable during pause: {}", e);
                        break;
                    }
                }
            }
            return 1;
        }

        for note in &advice.notes {
            info!("{}", note);
        }
        advice.recommended_concurrency.clamp(1, max)
    }

    /// Remove partial outputs of failed tasks and settle backups.
    async fn finish_outputs(
        &self,
        report: &BatchRunReport,
        dispatched: &[FileTask],
        backups: BackupSet,
        preexisting: &HashSet<PathBuf>,
    ) {
        let failed_outputs: HashSet<PathBuf> = dispatched
            .iter()
            .filter(|t| {
                report
                    .outcome_for(&t.input_path)
                    .is_some_and(|o| !o.is_success())
            })
            .map(|t| t.output_path.clone())
            .collect();

        if self.strategy.cleanup_on_failure && !failed_outputs.is_empty() {
            // An output that was on disk before the run is only removed when
            // a backup can put it back.
            let doomed: Vec<PathBuf> = failed_outputs
                .iter()
                .filter(|p| !preexisting.contains(*p) || backups.backup_for(p).is_some())
                .cloned()
                .collect();
            self.paths.cleanup_failed_files(&doomed).await;
        }

        if backups.is_empty() {
            return;
        }
        let (restore, discard) = backups.partition(&failed_outputs);
        let restored = self.paths.restore_backups(&restore).await;
        if restored > 0 {
            info!("Restored {} original output(s) after failures", restored);
        }
        self.paths.discard_backups(&discard).await;
    }

    fn abort(
        &self,
        mut report: BatchRunReport,
        error: BatchError,
        config: &BatchRunConfig,
        start: Instant,
    ) -> Md2PdfError {
        report.finalize(config.continue_on_error);
        report.processing_time_ms = start.elapsed().as_millis() as u64;
        self.progress
            .on_batch_complete(report.total_files, report.successful_files);
        warn!(
            "Batch aborted after {}/{} file(s): {}",
            report.settled_files(),
            report.total_files,
            error
        );
        Md2PdfError::Aborted {
            error,
            report: Box::new(report),
        }
    }
}

async fn existing_outputs(tasks: &[FileTask]) -> HashSet<PathBuf> {
    let mut found = HashSet::new();
    for task in tasks {
        if tokio::fs::try_exists(&task.output_path).await.unwrap_or(false) {
            found.insert(task.output_path.clone());
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ConversionError, ErrorKind};
    use crate::output::ConvertedFile;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Writes a tiny file; fails for inputs whose name contains "bad".
    struct Writer {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DocumentConverter for Writer {
        async fn convert(
            &self,
            input: &Path,
            output: &Path,
            _options: &ConversionOptions,
        ) -> Result<ConvertedFile, ConversionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if input.to_string_lossy().contains("bad") {
                tokio::fs::write(output, b"partial").await?;
                return Err(ConversionError::new(ErrorKind::RenderError, "bad input"));
            }
            tokio::fs::write(output, b"%PDF").await?;
            Ok(ConvertedFile {
                output_path: output.to_path_buf(),
                size: 4,
                duration_ms: 1,
            })
        }
    }

    fn writer() -> Arc<Writer> {
        Arc::new(Writer {
            calls: AtomicUsize::new(0),
        })
    }

    fn sources(dir: &Path, names: &[&str]) -> Vec<SourceFile> {
        names
            .iter()
            .map(|n| {
                let p = dir.join(n);
                std::fs::write(&p, "# doc").unwrap();
                SourceFile::new(p)
            })
            .collect()
    }

    #[tokio::test]
    async fn empty_batch_is_a_successful_no_op() {
        let s = BatchScheduler::new(writer());
        let report = s
            .run(vec![], &ConversionOptions::default(), &BatchRunConfig::default())
            .await
            .unwrap();
        assert!(report.success);
        assert_eq!(report.waves, 0);
        assert_eq!(report.total_files, 0);
    }

    #[tokio::test]
    async fn failed_outputs_are_cleaned_up() {
        let dir = tempfile::tempdir().unwrap();
        let conv = writer();
        let s = BatchScheduler::new(conv.clone());
        let config = BatchRunConfig::builder()
            .output_directory(dir.path().join("out"))
            .build()
            .unwrap();
        let report = s
            .run(
                sources(dir.path(), &["good.md", "bad.md"]),
                &ConversionOptions::default(),
                &config,
            )
            .await
            .unwrap();

        assert!(report.success, "continue_on_error keeps success true");
        assert_eq!(report.failed_files, 1);
        assert!(dir.path().join("out/good.pdf").exists());
        assert!(!dir.path().join("out/bad.pdf").exists());
        assert_eq!(conv.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn overwrite_restores_original_when_conversion_fails() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        std::fs::create_dir_all(&out).unwrap();
        std::fs::write(out.join("bad.pdf"), "precious").unwrap();
        std::fs::write(out.join("good.pdf"), "old").unwrap();

        let s = BatchScheduler::new(writer());
        let config = BatchRunConfig::builder()
            .output_directory(&out)
            .overwrite_existing(true)
            .build()
            .unwrap();
        s.run(
            sources(dir.path(), &["good.md", "bad.md"]),
            &ConversionOptions::default(),
            &config,
        )
        .await
        .unwrap();

        assert_eq!(std::fs::read_to_string(out.join("bad.pdf")).unwrap(), "precious");
        assert_eq!(std::fs::read_to_string(out.join("good.pdf")).unwrap(), "%PDF");
        let leftovers: Vec<_> = std::fs::read_dir(&out)
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().contains("_backup_"))
            .collect();
        assert!(leftovers.is_empty(), "backups should be restored or discarded");
    }

    #[tokio::test]
    async fn overwrite_without_backups_keeps_preexisting_file() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        std::fs::create_dir_all(&out).unwrap();
        std::fs::write(out.join("bad.pdf"), "precious").unwrap();

        let s = BatchScheduler::new(writer()).with_recovery_strategy(RecoveryStrategy {
            backup_original_files: false,
            ..Default::default()
        });
        let config = BatchRunConfig::builder()
            .output_directory(&out)
            .overwrite_existing(true)
            .build()
            .unwrap();
        s.run(sources(dir.path(), &["bad.md"]), &ConversionOptions::default(), &config)
            .await
            .unwrap();

        // The converter overwrote it; without a backup it is not deleted either.
        assert!(out.join("bad.pdf").exists());
    }

    #[tokio::test]
    async fn invalid_destination_fails_without_conversion() {
        let dir = tempfile::tempdir().unwrap();
        let conv = writer();
        let s = BatchScheduler::new(conv.clone());
        let config = BatchRunConfig::builder()
            .output_directory(dir.path().join("out"))
            .build()
            .unwrap();
        let report = s
            .run(
                sources(dir.path(), &["aux.md", "fine.md"]),
                &ConversionOptions::default(),
                &config,
            )
            .await
            .unwrap();

        assert_eq!(report.failed_files, 1);
        assert_eq!(report.errors[0].kind(), ErrorKind::InvalidFormat);
        assert_eq!(conv.calls.load(Ordering::SeqCst), 1);
        // Results come back in input order.
        assert!(report.results[0].input_path().ends_with("aux.md"));
    }

    #[tokio::test]
    async fn invalid_destination_aborts_fail_fast_before_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let conv = writer();
        let s = BatchScheduler::new(conv.clone());
        let config = BatchRunConfig::builder()
            .output_directory(dir.path().join("out"))
            .continue_on_error(false)
            .build()
            .unwrap();
        let err = s
            .run(
                sources(dir.path(), &["fine.md", "nul.md"]),
                &ConversionOptions::default(),
                &config,
            )
            .await
            .unwrap_err();

        let Md2PdfError::Aborted { error, report } = err else {
            panic!("expected abort");
        };
        assert_eq!(error.kind(), ErrorKind::InvalidFormat);
        assert_eq!(report.waves, 0);
        assert_eq!(conv.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn run_pattern_reports_no_matches() {
        let dir = tempfile::tempdir().unwrap();
        let s = BatchScheduler::new(writer());
        let config = BatchRunConfig::builder()
            .input_pattern(format!("{}/**/*.md", dir.path().display()))
            .build()
            .unwrap();
        let err = s
            .run_pattern(&ConversionOptions::default(), &config)
            .await
            .unwrap_err();
        assert!(matches!(err, Md2PdfError::NoInputFiles { .. }));
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn recover_uses_report_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let s = BatchScheduler::new(writer()).with_recovery_strategy(RecoveryStrategy {
            retry_delay_ms: 1,
            max_retries: 1,
            ..Default::default()
        });
        let config = BatchRunConfig::builder()
            .output_directory(dir.path().join("out"))
            .build()
            .unwrap();
        let mut report = s
            .run(sources(dir.path(), &["bad.md"]), &ConversionOptions::default(), &config)
            .await
            .unwrap();

        let summary = s.recover(&mut report, &ConversionOptions::default()).await;
        assert_eq!(summary.still_failed.len(), 1);
        assert_eq!(report.failed_files, 1);
    }
}
