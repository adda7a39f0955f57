//! The batch execution engine.
//!
//! Each submodule owns one concern of a run. The scheduler is the only one
//! that knows about the others; every other module is usable on its own.
//!
//! ## Data Flow
//!
//! ```text
//! discover ──▶ naming ──▶ paths ──▶ scheduler ──▶ recovery
//! (glob)       (output    (dirs,    (waves,       (classify,
//!               names)     conflicts, converter)   retry, plan)
//!                          backups)       ▲
//!                                         │
//!                                     governor
//!                                 (samples, stress,
//!                                  concurrency advice)
//! ```
//!
//! 1. [`discover`]  — expand an input glob into sorted [`crate::SourceFile`]s;
//!    the directory walk runs in `spawn_blocking`
//! 2. [`naming`]    — pure filename-format policy; a `FileTask` per source
//! 3. [`paths`]     — [`OutputPathManager`]: directory prep, `_N` conflict
//!    suffixes, writability checks, backup and restore
//! 4. [`governor`]  — [`ResourceGovernor`]: host sampling, stress verdicts,
//!    background monitoring, health gate
//! 5. [`recovery`]  — [`RecoveryCoordinator`]: retry gating, linear backoff,
//!    recovery plans and suggestions
//! 6. [`scheduler`] — [`BatchScheduler`]: wave dispatch and aggregation
//! 7. [`ring`]      — fixed-capacity history buffer used by the governor

pub mod discover;
pub mod governor;
pub mod naming;
pub mod paths;
pub mod recovery;
pub mod ring;
pub mod scheduler;

pub use governor::{
    ConcurrencyAdvice, HealthCheck, MetricsSource, ResourceGovernor, ResourceReport,
    ResourceWarning, StressReason, StressVerdict, SystemHealth,
};
pub use paths::{BackupSet, OutputPathManager, OutputReport, PathValidation};
pub use recovery::{
    ConfigSuggestions, RecoveryCoordinator, RecoveryPlan, RecoverySuggestions, RecoverySummary,
    RetryOutcome,
};
pub use scheduler::BatchScheduler;
