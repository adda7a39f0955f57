//! Resource governor: host sampling, stress detection, concurrency advice.
//!
//! ## How it works
//!
//! Every reading comes from a [`MetricsSource`] (a [`HostProbe`] in
//! production, a stub in tests) and is recorded into fixed-capacity
//! histories. Stress is never cached: each call to
//! [`ResourceGovernor::is_under_stress`] takes a fresh sample and evaluates
//! it against [`Thresholds`]. Every threshold is checked independently, so a
//! host can be reported as short on memory *and* CPU-bound at once.
//!
//! ```text
//!                         ┌─────────────────────┐
//!  sample_now() ─────────▶│ MetricsSource        │  (spawn_blocking)
//!  monitoring tick ──────▶│  memory, load, rss   │
//!                         └──────────┬──────────┘
//!                                    ▼
//!                    evaluate(thresholds) ──▶ StressVerdict
//!                                    │
//!                    ┌───────────────┼──────────────────┐
//!                    ▼               ▼                  ▼
//!             system history   process history     warnings
//!               (ring, 100)      (ring, 100)       (ring, 50)
//! ```
//!
//! ## Why the load average?
//!
//! Conversions are bursty child processes. A one-shot CPU percentage taken
//! between two of them reads near zero; the 1-minute load average still
//! shows the queue of work the host is carrying.

use crate::config::{GovernorConfig, Thresholds};
use crate::engine::ring::RingBuffer;
use crate::error::Md2PdfError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use host_probe::{DiskSpace, HostProbe, ProbeError, ProcessSample, SystemSample, BYTES_PER_MB};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Memory or heap above this pauses dispatch entirely.
pub const PAUSE_PCT: f64 = 95.0;

/// Upper bound on concurrency the governor will grow to by itself.
pub const MAX_SUGGESTED_CONCURRENCY: usize = 4;

// Health gate limits.
const HEALTH_MAX_MEMORY_PCT: f64 = 90.0;
const HEALTH_MIN_FREE_MEMORY_MB: u64 = 100;
const HEALTH_WARN_LOAD_PCT: f64 = 100.0;
const HEALTH_MAX_LOAD_PCT: f64 = 200.0;
const HEALTH_MIN_DISK_MB: u64 = 100;
const HEALTH_WARN_DISK_MB: u64 = 1024;

/// Warnings included in a [`ResourceReport`].
const REPORT_RECENT_WARNINGS: usize = 10;

const MIN_SAMPLE_INTERVAL: Duration = Duration::from_millis(10);

// ── Metrics source ───────────────────────────────────────────────────────

/// Where readings come from.
///
/// Calls may block briefly; the governor always invokes them from
/// `spawn_blocking`.
pub trait MetricsSource: Send + Sync + 'static {
    fn sample(&self) -> Result<(SystemSample, ProcessSample), ProbeError>;

    /// Free space on the volume holding `path`. `None` when unknown.
    fn disk_space(&self, path: &Path) -> Option<DiskSpace>;

    fn cores(&self) -> usize;
}

impl MetricsSource for HostProbe {
    fn sample(&self) -> Result<(SystemSample, ProcessSample), ProbeError> {
        let system = self.sample_system();
        let process = self.sample_process(system.memory.total)?;
        Ok((system, process))
    }

    fn disk_space(&self, path: &Path) -> Option<DiskSpace> {
        HostProbe::disk_space(self, path)
    }

    fn cores(&self) -> usize {
        HostProbe::cores(self)
    }
}

// ── Verdicts and advice ──────────────────────────────────────────────────

/// One exceeded threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum StressReason {
    HighMemoryUsage { pct: f64, limit: f64 },
    LowFreeMemory { free_mb: u64, min_mb: u64 },
    HighCpuLoad { pct: f64, limit: f64 },
    HighHeapUsage { pct: f64, limit: f64 },
}

impl StressReason {
    /// Memory-related reasons call for shedding work, not just slowing down.
    pub fn is_memory(&self) -> bool {
        !self.is_cpu()
    }

    pub fn is_cpu(&self) -> bool {
        matches!(self, StressReason::HighCpuLoad { .. })
    }
}

impl fmt::Display for StressReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StressReason::HighMemoryUsage { pct, limit } => {
                write!(f, "memory usage {pct:.1}% exceeds {limit:.0}%")
            }
            StressReason::LowFreeMemory { free_mb, min_mb } => {
                write!(f, "free memory {free_mb} MB below {min_mb} MB")
            }
            StressReason::HighCpuLoad { pct, limit } => {
                write!(f, "CPU load {pct:.1}% of cores exceeds {limit:.0}%")
            }
            StressReason::HighHeapUsage { pct, limit } => {
                write!(f, "process memory {pct:.1}% exceeds {limit:.0}%")
            }
        }
    }
}

/// Result of checking one sample against [`Thresholds`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StressVerdict {
    pub under_stress: bool,
    pub reasons: Vec<StressReason>,
}

impl StressVerdict {
    pub fn memory_stress(&self) -> bool {
        self.reasons.iter().any(StressReason::is_memory)
    }

    pub fn cpu_stress(&self) -> bool {
        self.reasons.iter().any(StressReason::is_cpu)
    }
}

/// Check a sample against every threshold.
pub fn evaluate(thresholds: &Thresholds, system: &SystemSample, process: &ProcessSample) -> StressVerdict {
    let mut reasons = Vec::new();

    if system.memory.pct > thresholds.max_memory_usage_pct {
        reasons.push(StressReason::HighMemoryUsage {
            pct: system.memory.pct,
            limit: thresholds.max_memory_usage_pct,
        });
    }
    let free_mb = system.memory.free_mb();
    if free_mb < thresholds.min_free_memory_mb {
        reasons.push(StressReason::LowFreeMemory {
            free_mb,
            min_mb: thresholds.min_free_memory_mb,
        });
    }
    if system.cpu.pct > thresholds.max_cpu_usage_pct {
        reasons.push(StressReason::HighCpuLoad {
            pct: system.cpu.pct,
            limit: thresholds.max_cpu_usage_pct,
        });
    }
    if process.heap_pct > thresholds.max_heap_usage_pct {
        reasons.push(StressReason::HighHeapUsage {
            pct: process.heap_pct,
            limit: thresholds.max_heap_usage_pct,
        });
    }

    StressVerdict {
        under_stress: !reasons.is_empty(),
        reasons,
    }
}

/// What the scheduler should do with its next wave.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConcurrencyAdvice {
    pub recommended_concurrency: usize,
    pub should_pause: bool,
    pub should_reduce: bool,
    pub notes: Vec<String>,
}

/// Turn a verdict into advice for a run at `current` concurrency with
/// `total_files` still to go.
pub fn advise(
    current: usize,
    total_files: usize,
    cores: usize,
    system: &SystemSample,
    process: &ProcessSample,
    verdict: &StressVerdict,
) -> ConcurrencyAdvice {
    let current = current.max(1);
    let mut recommended = current;
    let mut notes = Vec::new();

    if verdict.memory_stress() {
        recommended = (recommended / 2).max(1);
        notes.push(format!(
            "Memory pressure ({:.1}% used, {} MB free): halving concurrency; close other applications to release memory",
            system.memory.pct,
            system.memory.free_mb()
        ));
    }
    if verdict.cpu_stress() {
        recommended = recommended.saturating_sub(1).max(1);
        notes.push(format!(
            "CPU load at {:.1}% of {} cores: reducing concurrency by one",
            system.cpu.pct, system.cpu.cores
        ));
    }

    let should_pause = system.memory.pct > PAUSE_PCT || process.heap_pct > PAUSE_PCT;
    if should_pause {
        notes.push(format!(
            "Memory critical (system {:.1}%, process {:.1}%): pause before the next wave",
            system.memory.pct, process.heap_pct
        ));
    }

    let ceiling = cores.clamp(1, MAX_SUGGESTED_CONCURRENCY);
    if !verdict.under_stress && total_files > current * 2 && current < ceiling {
        recommended = current + 1;
        notes.push(format!(
            "Headroom available: raising concurrency to {recommended}"
        ));
    }

    ConcurrencyAdvice {
        recommended_concurrency: recommended,
        should_pause,
        should_reduce: recommended < current,
        notes,
    }
}

// ── History ──────────────────────────────────────────────────────────────

/// A reading with the time it was taken.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timestamped<T> {
    pub at: DateTime<Utc>,
    pub value: T,
}

/// A threshold breach seen by background monitoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceWarning {
    pub at: DateTime<Utc>,
    pub reason: StressReason,
    pub message: String,
}

struct History {
    system: RingBuffer<Timestamped<SystemSample>>,
    process: RingBuffer<Timestamped<ProcessSample>>,
    warnings: RingBuffer<ResourceWarning>,
}

/// Summary of everything recorded so far.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceReport {
    pub samples: usize,
    pub average_memory_pct: f64,
    pub peak_memory_pct: f64,
    pub average_cpu_pct: f64,
    pub peak_heap_pct: f64,
    pub latest: Option<SystemSample>,
    /// Newest last.
    pub recent_warnings: Vec<ResourceWarning>,
}

// ── Health gate ──────────────────────────────────────────────────────────

/// Outcome of a live health check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemHealth {
    /// False when any issue was found. Warnings alone keep the host healthy.
    pub healthy: bool,
    pub issues: Vec<String>,
    pub warnings: Vec<String>,
}

/// Answers "is it safe to try again now?".
#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn check_system_health(&self) -> SystemHealth;
}

// ── Governor ─────────────────────────────────────────────────────────────

struct Inner {
    source: Arc<dyn MetricsSource>,
    config: GovernorConfig,
    history: Mutex<History>,
}

impl Inner {
    fn history(&self) -> MutexGuard<'_, History> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn read(&self) -> Result<(SystemSample, ProcessSample), Md2PdfError> {
        let source = Arc::clone(&self.source);
        tokio::task::spawn_blocking(move || source.sample())
            .await
            .map_err(|e| Md2PdfError::Internal(format!("Metrics task panicked: {}", e)))?
            .map_err(Md2PdfError::from)
    }

    async fn sample_and_record(&self) -> Result<(SystemSample, ProcessSample), Md2PdfError> {
        let (system, process) = self.read().await?;
        let at = Utc::now();
        let mut history = self.history();
        history.system.push(Timestamped { at, value: system });
        history.process.push(Timestamped { at, value: process });
        Ok((system, process))
    }

    async fn tick(&self) {
        let (system, process) = match self.sample_and_record().await {
            Ok(s) => s,
            Err(e) => {
                warn!("Resource sampling failed: {}", e);
                return;
            }
        };
        let verdict = evaluate(&self.config.thresholds, &system, &process);
        if !verdict.under_stress {
            return;
        }
        let at = Utc::now();
        let mut history = self.history();
        for reason in verdict.reasons {
            let message = reason.to_string();
            warn!("Resource warning: {}", message);
            history.warnings.push(ResourceWarning { at, reason, message });
        }
    }

    async fn disk_space(&self) -> Option<DiskSpace> {
        let source = Arc::clone(&self.source);
        let path: PathBuf = self.config.disk_check_path.clone();
        tokio::task::spawn_blocking(move || source.disk_space(&path))
            .await
            .ok()
            .flatten()
    }
}

/// Samples host resources and turns them into concurrency advice.
///
/// Cheap to share behind an `Arc`. Background monitoring, once started,
/// stops when [`stop_monitoring`](Self::stop_monitoring) is called or the
/// governor is dropped.
pub struct ResourceGovernor {
    inner: Arc<Inner>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for ResourceGovernor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceGovernor")
            .field("config", &self.inner.config)
            .field("monitoring", &self.is_monitoring())
            .finish()
    }
}

impl ResourceGovernor {
    pub fn new(source: Arc<dyn MetricsSource>, config: GovernorConfig) -> Self {
        let history = History {
            system: RingBuffer::new(config.history_capacity),
            process: RingBuffer::new(config.history_capacity),
            warnings: RingBuffer::new(config.warning_capacity),
        };
        Self {
            inner: Arc::new(Inner {
                source,
                config,
                history: Mutex::new(history),
            }),
            ticker: Mutex::new(None),
        }
    }

    /// A governor reading the real host.
    pub fn for_host(config: GovernorConfig) -> Result<Self, Md2PdfError> {
        let probe = HostProbe::new()?;
        Ok(Self::new(Arc::new(probe), config))
    }

    pub fn config(&self) -> &GovernorConfig {
        &self.inner.config
    }

    /// Take and record one reading.
    pub async fn sample_now(&self) -> Result<(SystemSample, ProcessSample), Md2PdfError> {
        self.inner.sample_and_record().await
    }

    /// Fresh reading checked against the configured thresholds.
    pub async fn is_under_stress(&self) -> Result<StressVerdict, Md2PdfError> {
        let (system, process) = self.sample_now().await?;
        Ok(evaluate(&self.inner.config.thresholds, &system, &process))
    }

    /// Concurrency advice for the next wave.
    pub async fn recommend(&self, current: usize, total_files: usize) -> Result<ConcurrencyAdvice, Md2PdfError> {
        let (system, process) = self.sample_now().await?;
        let verdict = evaluate(&self.inner.config.thresholds, &system, &process);
        let advice = advise(
            current,
            total_files,
            self.inner.source.cores(),
            &system,
            &process,
            &verdict,
        );
        debug!(
            current,
            recommended = advice.recommended_concurrency,
            pause = advice.should_pause,
            "concurrency advice"
        );
        Ok(advice)
    }

    /// Start sampling every `sample_interval` in the background.
    ///
    /// Replaces any sampler already running. Must be called from within a
    /// tokio runtime.
    pub fn start_monitoring(&self) {
        let mut slot = self.ticker.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = slot.take() {
            previous.abort();
        }

        let inner = Arc::clone(&self.inner);
        let period = inner.config.sample_interval.max(MIN_SAMPLE_INTERVAL);
        info!("Resource monitoring started (every {:?})", period);

        *slot = Some(tokio::spawn(async move {
            let mut interval_timer = tokio::time::interval(period);
            interval_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                interval_timer.tick().await;
                inner.tick().await;
            }
        }));
    }

    /// Stop background sampling. A no-op when not running.
    pub fn stop_monitoring(&self) {
        let handle = self
            .ticker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
            info!("Resource monitoring stopped");
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.ticker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    // ── Copy-on-read accessors ────────────────────────────────────────────

    pub fn system_history(&self) -> Vec<Timestamped<SystemSample>> {
        self.inner.history().system.to_vec()
    }

    pub fn process_history(&self) -> Vec<Timestamped<ProcessSample>> {
        self.inner.history().process.to_vec()
    }

    pub fn warnings(&self) -> Vec<ResourceWarning> {
        self.inner.history().warnings.to_vec()
    }

    /// Summarise recorded history. Takes no new sample.
    pub fn resource_report(&self) -> ResourceReport {
        let history = self.inner.history();
        if history.system.is_empty() {
            return ResourceReport::default();
        }
        let samples = history.system.len();

        let (mut mem_sum, mut mem_peak, mut cpu_sum) = (0.0, 0.0_f64, 0.0);
        for s in history.system.iter() {
            mem_sum += s.value.memory.pct;
            mem_peak = mem_peak.max(s.value.memory.pct);
            cpu_sum += s.value.cpu.pct;
        }
        let peak_heap_pct = history
            .process
            .iter()
            .map(|p| p.value.heap_pct)
            .fold(0.0_f64, f64::max);

        let warnings = history.warnings.to_vec();
        let skip = warnings.len().saturating_sub(REPORT_RECENT_WARNINGS);

        ResourceReport {
            samples,
            average_memory_pct: mem_sum / samples as f64,
            peak_memory_pct: mem_peak,
            average_cpu_pct: cpu_sum / samples as f64,
            peak_heap_pct,
            latest: history.system.latest().map(|s| s.value),
            recent_warnings: warnings.into_iter().skip(skip).collect(),
        }
    }
}

impl Drop for ResourceGovernor {
    fn drop(&mut self) {
        if let Some(handle) = self
            .ticker
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

#[async_trait]
impl HealthCheck for ResourceGovernor {
    async fn check_system_health(&self) -> SystemHealth {
        let mut health = SystemHealth::default();

        match self.inner.read().await {
            Ok((system, _)) => {
                if system.memory.pct > HEALTH_MAX_MEMORY_PCT {
                    health.issues.push(format!(
                        "Memory usage {:.1}% above {:.0}%",
                        system.memory.pct, HEALTH_MAX_MEMORY_PCT
                    ));
                }
                if system.memory.free_mb() < HEALTH_MIN_FREE_MEMORY_MB {
                    health.issues.push(format!(
                        "Only {} MB of memory free",
                        system.memory.free_mb()
                    ));
                }
                if system.cpu.pct > HEALTH_MAX_LOAD_PCT {
                    health.issues.push(format!(
                        "Load average {:.2} is over twice the {} cores",
                        system.cpu.avg, system.cpu.cores
                    ));
                } else if system.cpu.pct > HEALTH_WARN_LOAD_PCT {
                    health.warnings.push(format!(
                        "Load average {:.2} exceeds {} cores",
                        system.cpu.avg, system.cpu.cores
                    ));
                }
            }
            Err(e) => health.issues.push(format!("Cannot read system metrics: {e}")),
        }

        match self.inner.disk_space().await {
            Some(disk) => {
                let free_mb = disk.available_bytes / BYTES_PER_MB;
                if free_mb < HEALTH_MIN_DISK_MB {
                    health.issues.push(format!(
                        "Only {} MB free on '{}'",
                        free_mb,
                        disk.mount_point.display()
                    ));
                } else if free_mb < HEALTH_WARN_DISK_MB {
                    health.warnings.push(format!(
                        "Low disk space: {} MB free on '{}'",
                        free_mb,
                        disk.mount_point.display()
                    ));
                }
            }
            None => health.warnings.push(format!(
                "Disk space for '{}' could not be determined",
                self.inner.config.disk_check_path.display()
            )),
        }

        health.healthy = health.issues.is_empty();
        health
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use host_probe::{CpuLoad, MemoryUsage};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const GB: u64 = 1024 * BYTES_PER_MB;

    fn system(total: u64, free: u64, load: f64, cores: usize) -> SystemSample {
        SystemSample {
            memory: MemoryUsage::from_total_and_free(total, free),
            cpu: CpuLoad::from_load_average(load, cores),
        }
    }

    fn process(resident: u64, total: u64) -> ProcessSample {
        ProcessSample::new(resident, resident * 2, total)
    }

    struct FixedSource {
        system: SystemSample,
        process: ProcessSample,
        disk: Option<DiskSpace>,
        calls: AtomicUsize,
    }

    impl FixedSource {
        fn new(system: SystemSample, process: ProcessSample) -> Self {
            Self {
                system,
                process,
                disk: Some(DiskSpace {
                    mount_point: "/".into(),
                    available_bytes: 50 * GB,
                    total_bytes: 100 * GB,
                }),
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl MetricsSource for FixedSource {
        fn sample(&self) -> Result<(SystemSample, ProcessSample), ProbeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok((self.system, self.process))
        }
        fn disk_space(&self, _path: &Path) -> Option<DiskSpace> {
            self.disk.clone()
        }
        fn cores(&self) -> usize {
            self.system.cpu.cores
        }
    }

    #[test]
    fn healthy_sample_has_no_reasons() {
        let v = evaluate(
            &Thresholds::default(),
            &system(8 * GB, 4 * GB, 1.0, 4),
            &process(100 * BYTES_PER_MB, 8 * GB),
        );
        assert!(!v.under_stress);
        assert!(v.reasons.is_empty());
    }

    #[test]
    fn low_free_memory_reports_both_memory_reasons() {
        // 5% of 8 GB free: 95% used and ~410 MB free.
        let total = 8 * GB;
        let v = evaluate(
            &Thresholds::default(),
            &system(total, total / 20, 1.0, 4),
            &process(100 * BYTES_PER_MB, total),
        );
        assert!(v.under_stress);
        assert!(v.reasons.iter().any(|r| matches!(r, StressReason::HighMemoryUsage { .. })));
        assert!(v.reasons.iter().any(|r| matches!(r, StressReason::LowFreeMemory { .. })));
        assert!(!v.cpu_stress());
    }

    #[test]
    fn cpu_and_heap_trigger_independently() {
        let total = 8 * GB;
        let v = evaluate(
            &Thresholds::default(),
            &system(total, 4 * GB, 4.0, 4),
            &process(7 * GB, total),
        );
        assert!(v.cpu_stress());
        assert!(v.reasons.iter().any(|r| matches!(r, StressReason::HighHeapUsage { .. })));
        assert_eq!(v.reasons.len(), 2);
    }

    #[test]
    fn advice_halves_on_memory_and_decrements_on_cpu() {
        let total = 8 * GB;
        // 90% used: memory stress without reaching the pause line.
        let sys = system(total, total / 10, 4.0, 4);
        let proc_s = process(100 * BYTES_PER_MB, total);
        let v = evaluate(&Thresholds::default(), &sys, &proc_s);
        let a = advise(4, 100, 4, &sys, &proc_s, &v);
        // 4 → 2 (memory) → 1 (cpu)
        assert_eq!(a.recommended_concurrency, 1);
        assert!(a.should_reduce);
        assert!(!a.should_pause);
        assert!(a.notes.iter().any(|n| n.contains("release memory")));
    }

    #[test]
    fn advice_pauses_above_95_percent() {
        let total = 8 * GB;
        let sys = system(total, total / 50, 0.5, 4);
        let proc_s = process(100 * BYTES_PER_MB, total);
        let v = evaluate(&Thresholds::default(), &sys, &proc_s);
        let a = advise(1, 10, 4, &sys, &proc_s, &v);
        assert!(a.should_pause);
        assert_eq!(a.recommended_concurrency, 1);
    }

    #[test]
    fn advice_grows_only_with_headroom_and_backlog() {
        let total = 8 * GB;
        let sys = system(total, 6 * GB, 0.5, 8);
        let proc_s = process(100 * BYTES_PER_MB, total);
        let v = evaluate(&Thresholds::default(), &sys, &proc_s);

        assert_eq!(advise(2, 10, 8, &sys, &proc_s, &v).recommended_concurrency, 3);
        // Small backlog: stay.
        assert_eq!(advise(2, 4, 8, &sys, &proc_s, &v).recommended_concurrency, 2);
        // Already at the ceiling of min(cores, 4).
        assert_eq!(advise(4, 100, 8, &sys, &proc_s, &v).recommended_concurrency, 4);
        assert_eq!(advise(2, 100, 2, &sys, &proc_s, &v).recommended_concurrency, 2);
    }

    #[tokio::test]
    async fn history_is_bounded_and_copied() {
        let total = 8 * GB;
        let source = Arc::new(FixedSource::new(
            system(total, 4 * GB, 1.0, 4),
            process(GB, total),
        ));
        let config = GovernorConfig {
            history_capacity: 3,
            ..Default::default()
        };
        let g = ResourceGovernor::new(source.clone(), config);
        for _ in 0..5 {
            g.sample_now().await.unwrap();
        }
        assert_eq!(source.calls.load(Ordering::SeqCst), 5);
        assert_eq!(g.system_history().len(), 3);
        assert_eq!(g.process_history().len(), 3);

        let report = g.resource_report();
        assert_eq!(report.samples, 3);
        assert!((report.average_memory_pct - 50.0).abs() < 1e-9);
        assert!(report.latest.is_some());
    }

    #[tokio::test]
    async fn empty_report_is_zeroed() {
        let total = 8 * GB;
        let g = ResourceGovernor::new(
            Arc::new(FixedSource::new(system(total, 4 * GB, 1.0, 4), process(GB, total))),
            GovernorConfig::default(),
        );
        assert_eq!(g.resource_report(), ResourceReport::default());
    }

    #[tokio::test]
    async fn monitoring_records_warnings_and_stops() {
        let total = 8 * GB;
        let source = Arc::new(FixedSource::new(
            system(total, total / 20, 1.0, 4),
            process(GB, total),
        ));
        let g = ResourceGovernor::new(
            source.clone(),
            GovernorConfig {
                sample_interval: Duration::from_millis(20),
                ..Default::default()
            },
        );
        g.start_monitoring();
        assert!(g.is_monitoring());
        // Restarting replaces the running task.
        g.start_monitoring();
        tokio::time::sleep(Duration::from_millis(120)).await;
        g.stop_monitoring();
        assert!(!g.is_monitoring());

        let warnings = g.warnings();
        assert!(!warnings.is_empty());
        assert!(warnings
            .iter()
            .any(|w| matches!(w.reason, StressReason::LowFreeMemory { .. })));

        tokio::time::sleep(Duration::from_millis(10)).await;
        let calls = source.calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), calls);
    }

    #[tokio::test]
    async fn health_gate_flags_low_memory_and_disk() {
        let total = 8 * GB;
        let mut source = FixedSource::new(system(total, 50 * BYTES_PER_MB, 1.0, 4), process(GB, total));
        source.disk = Some(DiskSpace {
            mount_point: "/".into(),
            available_bytes: 500 * BYTES_PER_MB,
            total_bytes: 100 * GB,
        });
        let g = ResourceGovernor::new(Arc::new(source), GovernorConfig::default());
        let h = g.check_system_health().await;
        assert!(!h.healthy);
        assert!(h.issues.iter().any(|i| i.contains("MB of memory free")));
        assert!(h.warnings.iter().any(|w| w.contains("Low disk space")));
    }

    #[tokio::test]
    async fn health_gate_degrades_missing_disk_to_warning() {
        let total = 8 * GB;
        let mut source = FixedSource::new(system(total, 4 * GB, 5.0, 4), process(GB, total));
        source.disk = None;
        let g = ResourceGovernor::new(Arc::new(source), GovernorConfig::default());
        let h = g.check_system_health().await;
        assert!(h.healthy, "{h:?}");
        assert_eq!(h.warnings.len(), 2);
    }
}
