//! Failure classification and retry.
//!
//! A failed file is retried only when both sides agree: its kind is in the
//! strategy's `recoverable_kinds` and the producer marked it `can_retry`.
//! Retries back off linearly (`retry_delay_ms × attempt`) and every attempt
//! is gated on a live [`HealthCheck`], so a host that is already drowning is
//! not handed more work.

use crate::config::{BatchRunConfig, RecoveryStrategy};
use crate::convert::{ConversionOptions, DocumentConverter};
use crate::engine::governor::{HealthCheck, SystemHealth};
use crate::engine::paths::{BackupSet, OutputPathManager};
use crate::error::{BatchError, ConversionError, ErrorKind, Md2PdfError};
use crate::output::{BatchRunReport, ConvertedFile, FileTask};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Assumed wall-clock cost of one conversion attempt, for plan estimates.
pub const ESTIMATED_MS_PER_ATTEMPT: u64 = 10_000;

/// Batches with more errors than this get a "split the batch" suggestion.
const LARGE_FAILURE_COUNT: usize = 10;

/// A health gate that always passes.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysHealthy;

#[async_trait]
impl HealthCheck for AlwaysHealthy {
    async fn check_system_health(&self) -> SystemHealth {
        SystemHealth {
            healthy: true,
            ..Default::default()
        }
    }
}

// ── Result types ─────────────────────────────────────────────────────────

/// How a retry loop for one file ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryOutcome {
    Succeeded { file: ConvertedFile, attempts: u32 },
    /// Every attempt failed, or an attempt returned a non-recoverable error.
    /// `last_error` is `None` only when `max_retries` is zero.
    Exhausted {
        last_error: Option<ConversionError>,
        attempts: u32,
    },
    /// The health gate refused before an attempt could run.
    Unhealthy { health: SystemHealth, attempts: u32 },
}

impl RetryOutcome {
    pub fn succeeded(&self) -> bool {
        matches!(self, RetryOutcome::Succeeded { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            RetryOutcome::Succeeded { attempts, .. }
            | RetryOutcome::Exhausted { attempts, .. }
            | RetryOutcome::Unhealthy { attempts, .. } => *attempts,
        }
    }
}

/// Config changes worth trying on the next run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigSuggestions {
    pub max_concurrency: Option<usize>,
    pub continue_on_error: Option<bool>,
}

impl ConfigSuggestions {
    pub fn is_empty(&self) -> bool {
        self.max_concurrency.is_none() && self.continue_on_error.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryPlan {
    pub retryable_files: Vec<PathBuf>,
    pub manual_review_files: Vec<PathBuf>,
    pub config_suggestions: ConfigSuggestions,
    /// Worst case: every retryable file uses every attempt.
    pub estimated_time_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoverySuggestions {
    pub immediate: Vec<String>,
    pub long_term: Vec<String>,
    pub system_level: Vec<String>,
}

impl RecoverySuggestions {
    pub fn is_empty(&self) -> bool {
        self.immediate.is_empty() && self.long_term.is_empty() && self.system_level.is_empty()
    }
}

/// Result of [`RecoveryCoordinator::recover_batch`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecoverySummary {
    pub recovered: Vec<PathBuf>,
    pub still_failed: Vec<PathBuf>,
    /// Failures never retried because their kind or hint rules it out.
    pub skipped: Vec<PathBuf>,
    /// Set when the health gate stopped recovery early.
    pub halted: Option<SystemHealth>,
}

// ── Coordinator ──────────────────────────────────────────────────────────

/// Decides what to retry and drives the retries.
pub struct RecoveryCoordinator {
    strategy: RecoveryStrategy,
    health: Arc<dyn HealthCheck>,
    paths: OutputPathManager,
}

/// What was on disk at an output path before its retries began.
#[derive(Debug, Default)]
struct OutputGuard {
    existed: bool,
    backups: BackupSet,
}

impl std::fmt::Debug for RecoveryCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryCoordinator")
            .field("strategy", &self.strategy)
            .finish_non_exhaustive()
    }
}

impl RecoveryCoordinator {
    pub fn new(strategy: RecoveryStrategy, health: Arc<dyn HealthCheck>) -> Self {
        Self {
            strategy,
            health,
            paths: OutputPathManager::new(),
        }
    }

    /// A coordinator whose retries are never refused by a health gate.
    pub fn without_health_gate(strategy: RecoveryStrategy) -> Self {
        Self::new(strategy, Arc::new(AlwaysHealthy))
    }

    pub fn strategy(&self) -> &RecoveryStrategy {
        &self.strategy
    }

    /// Whether `error` is worth another attempt.
    pub fn classify(&self, error: &BatchError) -> bool {
        error.can_retry && self.strategy.recoverable_kinds.contains(&error.kind())
    }

    fn is_recoverable(&self, error: &ConversionError) -> bool {
        error.retryable && self.strategy.recoverable_kinds.contains(&error.kind)
    }

    /// Retry one task up to `max_retries` times.
    ///
    /// Before attempt `n` the health gate is consulted, then the loop sleeps
    /// `retry_delay_ms × n`.
    pub async fn retry(
        &self,
        task: &FileTask,
        converter: &dyn DocumentConverter,
        options: &ConversionOptions,
    ) -> RetryOutcome {
        let max = self.strategy.max_retries;
        let mut last_error = None;

        for attempt in 1..=max {
            let health = self.health.check_system_health().await;
            if !health.healthy {
                warn!(
                    "{}: retry stopped, system unhealthy: {}",
                    task.input_path.display(),
                    health.issues.join("; ")
                );
                return RetryOutcome::Unhealthy {
                    health,
                    attempts: attempt - 1,
                };
            }

            let delay = self.strategy.backoff(attempt);
            info!(
                "{}: retry {}/{} after {}ms",
                task.input_path.display(),
                attempt,
                max,
                delay.as_millis()
            );
            sleep(delay).await;

            match converter
                .convert(&task.input_path, &task.output_path, options)
                .await
            {
                Ok(file) => {
                    info!("{}: recovered on attempt {}", task.input_path.display(), attempt);
                    return RetryOutcome::Succeeded {
                        file,
                        attempts: attempt,
                    };
                }
                Err(e) => {
                    warn!("{}: attempt {} failed: {}", task.input_path.display(), attempt, e);
                    let stop = !self.is_recoverable(&e);
                    last_error = Some(e);
                    if stop {
                        return RetryOutcome::Exhausted {
                            last_error,
                            attempts: attempt,
                        };
                    }
                }
            }
        }

        RetryOutcome::Exhausted {
            last_error,
            attempts: max,
        }
    }

    /// Split failures into retry and manual-review piles and suggest config
    /// changes for the dominant failure kind.
    pub fn plan(&self, errors: &[BatchError], config: &BatchRunConfig) -> RecoveryPlan {
        let mut plan = RecoveryPlan::default();
        if errors.is_empty() {
            return plan;
        }

        for e in errors {
            if self.classify(e) {
                plan.retryable_files.push(e.input_path.clone());
            } else {
                plan.manual_review_files.push(e.input_path.clone());
            }
        }

        let counts = kind_counts(errors);
        let dominant = |kind: ErrorKind| counts.get(&kind).copied().unwrap_or(0) * 2 > errors.len();

        if dominant(ErrorKind::SystemError) {
            plan.config_suggestions.max_concurrency = Some((config.effective_concurrency() / 2).max(1));
        }
        if dominant(ErrorKind::RenderError) {
            plan.config_suggestions.continue_on_error = Some(true);
        }

        plan.estimated_time_ms = (plan.retryable_files.len() as u64)
            .saturating_mul(ESTIMATED_MS_PER_ATTEMPT)
            .saturating_mul(u64::from(self.strategy.max_retries));
        plan
    }

    /// Human-facing advice derived from which kinds of error occurred.
    pub fn suggest(&self, errors: &[BatchError]) -> RecoverySuggestions {
        let mut s = RecoverySuggestions::default();

        for kind in kind_counts(errors).into_keys() {
            match kind {
                ErrorKind::Validation => {
                    push_unique(&mut s.immediate, "Review the run configuration and input paths");
                }
                ErrorKind::FileNotFound => {
                    push_unique(&mut s.immediate, "Check that the input files still exist and the paths are spelled correctly");
                    push_unique(&mut s.long_term, "Avoid moving or deleting inputs while a batch is running");
                }
                ErrorKind::PermissionDenied => {
                    push_unique(&mut s.immediate, "Check read permission on the inputs and write permission on the output directory");
                    push_unique(&mut s.system_level, "Run as a user that owns the output directory");
                }
                ErrorKind::SystemError => {
                    push_unique(&mut s.immediate, "Retry the failed files with a lower max_concurrency");
                    push_unique(&mut s.long_term, "Enable adaptive concurrency so the batch slows down under load");
                    push_unique(&mut s.system_level, "Free memory or close other applications before the next run");
                }
                ErrorKind::ParseError => {
                    push_unique(&mut s.immediate, "Inspect the failing Markdown files for malformed syntax");
                    push_unique(&mut s.long_term, "Lint Markdown before conversion");
                }
                ErrorKind::RenderError => {
                    push_unique(&mut s.immediate, "Retry the failed files; rendering failures are often transient");
                    push_unique(&mut s.long_term, "Check the PDF engine installation and pin its version");
                }
                ErrorKind::InvalidFormat => {
                    push_unique(&mut s.immediate, "Use a filename format that avoids reserved names and special characters");
                }
            }
        }

        if errors.len() > LARGE_FAILURE_COUNT {
            push_unique(&mut s.long_term, "Split large batches into smaller runs");
        }
        s
    }

    /// Retry every recoverable failure in `report`, one file at a time,
    /// rewriting recovered entries as successes.
    pub async fn recover_batch(
        &self,
        report: &mut BatchRunReport,
        tasks: &[FileTask],
        converter: &dyn DocumentConverter,
        options: &ConversionOptions,
    ) -> RecoverySummary {
        let by_input: HashMap<&std::path::Path, &FileTask> =
            tasks.iter().map(|t| (t.input_path.as_path(), t)).collect();
        let mut summary = RecoverySummary::default();
        let failures = report.errors.clone();

        for error in &failures {
            let path = error.input_path.clone();
            if summary.halted.is_some() {
                summary.still_failed.push(path);
                continue;
            }
            let task = match by_input.get(path.as_path()) {
                Some(task) if self.classify(error) => *task,
                _ => {
                    debug!(input = %path.display(), kind = %error.kind(), "not retried");
                    summary.skipped.push(path);
                    continue;
                }
            };

            let guard = match self.guard_output(task).await {
                Ok(guard) => guard,
                Err(e) => {
                    warn!("{}: not retried: {}", path.display(), e);
                    summary.still_failed.push(path);
                    continue;
                }
            };

            let outcome = self.retry(task, converter, options).await;
            self.settle_output(task, guard, outcome.succeeded()).await;
            match outcome {
                RetryOutcome::Succeeded { file, .. } => {
                    report.mark_recovered(&path, file);
                    summary.recovered.push(path);
                }
                RetryOutcome::Exhausted { .. } => summary.still_failed.push(path),
                RetryOutcome::Unhealthy { health, .. } => {
                    summary.still_failed.push(path);
                    summary.halted = Some(health);
                }
            }
        }

        if report.failed_files == 0 {
            report.success = true;
        }
        if !summary.recovered.is_empty() || !summary.still_failed.is_empty() {
            info!(
                "Recovery: {} recovered, {} still failing, {} skipped",
                summary.recovered.len(),
                summary.still_failed.len(),
                summary.skipped.len()
            );
        }
        summary
    }

    /// Back up an existing output before any retry can overwrite it.
    async fn guard_output(&self, task: &FileTask) -> Result<OutputGuard, Md2PdfError> {
        let existed = tokio::fs::try_exists(&task.output_path)
            .await
            .map_err(|e| Md2PdfError::io("stat", task.output_path.clone(), e))?;
        let backups = if existed && self.strategy.backup_original_files {
            self.paths.create_backups(std::slice::from_ref(task)).await?
        } else {
            BackupSet::default()
        };
        Ok(OutputGuard { existed, backups })
    }

    /// Keep a recovered output, or put the pre-retry file back.
    async fn settle_output(&self, task: &FileTask, guard: OutputGuard, succeeded: bool) {
        if succeeded {
            self.paths.discard_backups(&guard.backups).await;
            return;
        }
        // An output that was there before the retries is only removed when
        // a backup can put it back.
        if self.strategy.cleanup_on_failure && (!guard.existed || !guard.backups.is_empty()) {
            self.paths
                .cleanup_failed_files(std::slice::from_ref(&task.output_path))
                .await;
        }
        if self.paths.restore_backups(&guard.backups).await > 0 {
            debug!(output = %task.output_path.display(), "restored output after failed retries");
        }
    }
}

fn kind_counts(errors: &[BatchError]) -> BTreeMap<ErrorKind, usize> {
    let mut counts = BTreeMap::new();
    for e in errors {
        *counts.entry(e.kind()).or_insert(0) += 1;
    }
    counts
}

fn push_unique(list: &mut Vec<String>, item: &str) {
    if !list.iter().any(|s| s == item) {
        list.push(item.to_string());
    }
}
