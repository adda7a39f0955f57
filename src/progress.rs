//! Progress-callback trait for per-file batch events.
//!
//! Attach an [`Arc<dyn BatchProgressCallback>`] with
//! [`crate::BatchScheduler::with_progress`] to receive events as each file
//! settles.
//!
//! # Why callbacks instead of channels?
//!
//! The callback is the least-invasive integration point: callers can forward
//! events to a channel, a terminal progress bar or a log without the library
//! knowing how the host application communicates. The trait is `Send + Sync`
//! because files within a wave settle concurrently.
//!
//! # Example
//!
//! ```rust
//! use md2pdf_batch::BatchProgressCallback;
//! use std::sync::Mutex;
//!
//! #[derive(Default)]
//! struct LastPercent(Mutex<f64>);
//!
//! impl BatchProgressCallback for LastPercent {
//!     fn on_progress(&self, percent: f64, _current_file: &str) {
//!         *self.0.lock().unwrap() = percent;
//!     }
//! }
//! ```

use std::sync::Arc;

/// Called by the scheduler as it moves through a batch.
///
/// All methods default to no-ops so callers only override what they care
/// about. Within a wave, `on_file_start`, `on_file_complete`,
/// `on_file_error` and `on_progress` may be called concurrently.
pub trait BatchProgressCallback: Send + Sync {
    /// Called once, after planning, with the number of tasks to settle.
    fn on_batch_start(&self, total_files: usize) {
        let _ = total_files;
    }

    /// Called when a wave is about to be dispatched.
    ///
    /// # Arguments
    /// * `wave`      — 1-based wave number
    /// * `wave_size` — files in this wave
    fn on_wave_start(&self, wave: usize, wave_size: usize) {
        let _ = (wave, wave_size);
    }

    /// Called just before the converter is invoked for a file.
    fn on_file_start(&self, input_path: &str) {
        let _ = input_path;
    }

    /// Called when a file converted successfully.
    ///
    /// # Arguments
    /// * `input_path`  — the source file
    /// * `output_path` — the written PDF
    /// * `duration_ms` — wall-clock conversion time
    fn on_file_complete(&self, input_path: &str, output_path: &str, duration_ms: u64) {
        let _ = (input_path, output_path, duration_ms);
    }

    /// Called when a file failed.
    fn on_file_error(&self, input_path: &str, error: &str) {
        let _ = (input_path, error);
    }

    /// Called after every file settles, success or failure.
    ///
    /// # Arguments
    /// * `percent`      — `completed / total × 100`
    /// * `current_file` — the file that just settled
    fn on_progress(&self, percent: f64, current_file: &str) {
        let _ = (percent, current_file);
    }

    /// Called once after every task has settled (or the run aborted).
    fn on_batch_complete(&self, total_files: usize, successful_files: usize) {
        let _ = (total_files, successful_files);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl BatchProgressCallback for NoopProgressCallback {}

/// Convenience alias for the type held by the scheduler.
pub type ProgressCallback = Arc<dyn BatchProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct TrackingCallback {
        completes: AtomicUsize,
        errors: AtomicUsize,
        percents: Mutex<Vec<f64>>,
    }

    impl BatchProgressCallback for TrackingCallback {
        fn on_file_complete(&self, _input: &str, _output: &str, _ms: u64) {
            self.completes.fetch_add(1, Ordering::SeqCst);
        }

        fn on_file_error(&self, _input: &str, _error: &str) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }

        fn on_progress(&self, percent: f64, _current: &str) {
            self.percents.lock().unwrap().push(percent);
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb = NoopProgressCallback;
        cb.on_batch_start(3);
        cb.on_wave_start(1, 2);
        cb.on_file_start("a.md");
        cb.on_file_complete("a.md", "a.pdf", 12);
        cb.on_file_error("b.md", "boom");
        cb.on_progress(66.6, "b.md");
        cb.on_batch_complete(3, 2);
    }

    #[test]
    fn tracking_callback_receives_events() {
        let tracker = TrackingCallback::default();
        tracker.on_file_complete("a.md", "a.pdf", 1);
        tracker.on_progress(50.0, "a.md");
        tracker.on_file_error("b.md", "engine crashed");
        tracker.on_progress(100.0, "b.md");

        assert_eq!(tracker.completes.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.errors.load(Ordering::SeqCst), 1);
        assert_eq!(*tracker.percents.lock().unwrap(), vec![50.0, 100.0]);
    }

    #[test]
    fn arc_dyn_callback_works() {
        let cb: ProgressCallback = Arc::new(NoopProgressCallback);
        cb.on_batch_start(10);
        cb.on_progress(10.0, "a.md");
    }
}
