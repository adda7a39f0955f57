//! Error types for the md2pdf-batch library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`Md2PdfError`] — **Fatal**: the run cannot proceed or was aborted
//!   (bad configuration, output directory cannot be created, backup failed,
//!   fail-fast tripped). Returned as `Err(Md2PdfError)` from the scheduler.
//!
//! * [`ConversionError`] — **Non-fatal**: a single file failed (engine
//!   crashed, unreadable input) but every other file is fine. Wrapped into a
//!   [`BatchError`] and stored in the run report so callers can inspect
//!   partial success rather than losing the whole batch to one bad file.
//!
//! Both carry an [`ErrorKind`]. The kind, not the Rust type, decides whether
//! a failure is worth retrying.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::output::BatchRunReport;

// ── Kinds ────────────────────────────────────────────────────────────────

/// Closed classification of every failure the engine can observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Bad configuration or paths.
    Validation,
    FileNotFound,
    PermissionDenied,
    /// Resource or OS-level failure.
    SystemError,
    /// The engine could not parse the Markdown. May be transient under memory pressure.
    ParseError,
    /// The engine failed while producing the PDF.
    RenderError,
    /// Output name not representable on the target filesystem.
    InvalidFormat,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 7] = [
        ErrorKind::Validation,
        ErrorKind::FileNotFound,
        ErrorKind::PermissionDenied,
        ErrorKind::SystemError,
        ErrorKind::ParseError,
        ErrorKind::RenderError,
        ErrorKind::InvalidFormat,
    ];

    /// Default retry policy for this kind.
    pub const fn is_retryable(self) -> bool {
        match self {
            ErrorKind::SystemError | ErrorKind::ParseError | ErrorKind::RenderError => true,
            ErrorKind::Validation
            | ErrorKind::FileNotFound
            | ErrorKind::PermissionDenied
            | ErrorKind::InvalidFormat => false,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Validation => "VALIDATION",
            ErrorKind::FileNotFound => "FILE_NOT_FOUND",
            ErrorKind::PermissionDenied => "PERMISSION_DENIED",
            ErrorKind::SystemError => "SYSTEM_ERROR",
            ErrorKind::ParseError => "PARSE_ERROR",
            ErrorKind::RenderError => "RENDER_ERROR",
            ErrorKind::InvalidFormat => "INVALID_FORMAT",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Per-file errors ──────────────────────────────────────────────────────

/// A non-fatal failure for a single file, as reported by the converter or
/// by path validation.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct ConversionError {
    pub kind: ErrorKind,
    pub message: String,
    /// Whether the producer believes another attempt could succeed.
    pub retryable: bool,
}

impl ConversionError {
    /// Build an error whose `retryable` flag follows the kind's default policy.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: kind.is_retryable(),
        }
    }

    /// Generic processing failure for errors that carry no kind of their own.
    pub fn processing(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::SystemError, message)
    }

    /// Override the producer's retry hint.
    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }
}

impl From<std::io::Error> for ConversionError {
    fn from(e: std::io::Error) -> Self {
        let kind = match e.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::FileNotFound,
            std::io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
            _ => ErrorKind::SystemError,
        };
        Self::new(kind, e.to_string())
    }
}

/// A per-file failure recorded in the run report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchError {
    pub input_path: PathBuf,
    pub error: ConversionError,
    pub can_retry: bool,
}

impl BatchError {
    pub fn new(input_path: impl Into<PathBuf>, error: ConversionError) -> Self {
        let can_retry = error.retryable;
        Self {
            input_path: input_path.into(),
            error,
            can_retry,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.error.kind
    }
}

impl fmt::Display for BatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.input_path.display(), self.error)
    }
}

// ── Fatal errors ─────────────────────────────────────────────────────────

/// All fatal errors returned by the md2pdf-batch library.
///
/// Per-file failures use [`BatchError`] and are stored in
/// [`BatchRunReport`] rather than propagated here, unless the run was
/// configured to stop on the first failure.
#[derive(Debug, Error)]
pub enum Md2PdfError {
    // ── Configuration ─────────────────────────────────────────────────────
    /// Builder or run validation failed.
    #[error("Invalid configuration: {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    /// The input glob could not be compiled.
    #[error("Invalid glob pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: globset::Error,
    },

    /// The input pattern matched nothing.
    #[error("No input files match '{pattern}'")]
    NoInputFiles { pattern: String },

    // ── Filesystem preparation ────────────────────────────────────────────
    /// Walking the input tree failed.
    #[error("Failed to scan '{path}': {source}")]
    Discovery {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },

    /// An output directory could not be created.
    #[error("Failed to create output directory '{path}': {source}")]
    DirectoryCreation {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// An existing output could not be copied aside before overwrite.
    #[error("Failed to back up '{original}' to '{backup}': {source}")]
    Backup {
        original: PathBuf,
        backup: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Any other filesystem call made by the engine itself.
    #[error("Filesystem {operation} failed for '{path}': {source}")]
    Io {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Runtime ───────────────────────────────────────────────────────────
    /// Host metrics could not be read.
    #[error("Resource metrics unavailable: {0}")]
    Metrics(#[from] host_probe::ProbeError),

    /// `continue_on_error = false` and a file failed. The report holds every
    /// outcome settled before the abort.
    #[error("Batch aborted after {} of {} files: {error}", .report.settled_files(), .report.total_files)]
    Aborted {
        error: BatchError,
        report: Box<BatchRunReport>,
    },

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Md2PdfError {
    /// Map a fatal error onto the shared kind taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Md2PdfError::Validation { .. }
            | Md2PdfError::InvalidPattern { .. }
            | Md2PdfError::NoInputFiles { .. } => ErrorKind::Validation,
            Md2PdfError::Discovery { source, .. } => match source.io_error().map(|e| e.kind()) {
                Some(std::io::ErrorKind::NotFound) => ErrorKind::FileNotFound,
                Some(std::io::ErrorKind::PermissionDenied) => ErrorKind::PermissionDenied,
                _ => ErrorKind::SystemError,
            },
            Md2PdfError::DirectoryCreation { source, .. }
            | Md2PdfError::Backup { source, .. }
            | Md2PdfError::Io { source, .. } => match source.kind() {
                std::io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
                std::io::ErrorKind::NotFound => ErrorKind::FileNotFound,
                _ => ErrorKind::SystemError,
            },
            Md2PdfError::Metrics(_) | Md2PdfError::Internal(_) => ErrorKind::SystemError,
            Md2PdfError::Aborted { error, .. } => error.kind(),
        }
    }

    pub(crate) fn io(operation: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Md2PdfError::Io {
            operation,
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_policy_is_closed_over_all_kinds() {
        let retryable: Vec<_> = ErrorKind::ALL
            .iter()
            .copied()
            .filter(|k| k.is_retryable())
            .collect();
        assert_eq!(
            retryable,
            vec![ErrorKind::SystemError, ErrorKind::ParseError, ErrorKind::RenderError]
        );
    }

    #[test]
    fn kind_serialises_screaming_snake() {
        let json = serde_json::to_string(&ErrorKind::FileNotFound).unwrap();
        assert_eq!(json, "\"FILE_NOT_FOUND\"");
        assert_eq!(ErrorKind::InvalidFormat.to_string(), "INVALID_FORMAT");
    }

    #[test]
    fn io_errors_map_to_kinds() {
        let e: ConversionError = std::io::Error::from(std::io::ErrorKind::NotFound).into();
        assert_eq!(e.kind, ErrorKind::FileNotFound);
        assert!(!e.retryable);

        let e: ConversionError = std::io::Error::other("disk on fire").into();
        assert_eq!(e.kind, ErrorKind::SystemError);
        assert!(e.retryable);
    }

    #[test]
    fn batch_error_inherits_retry_hint() {
        let err = ConversionError::new(ErrorKind::RenderError, "engine crashed").with_retryable(false);
        let be = BatchError::new("a.md", err);
        assert!(!be.can_retry);
        assert_eq!(be.kind(), ErrorKind::RenderError);
        assert!(be.to_string().contains("a.md"));
        assert!(be.to_string().contains("RENDER_ERROR"));
    }

    #[test]
    fn directory_creation_permission_maps_to_kind() {
        let e = Md2PdfError::DirectoryCreation {
            path: "/root/out".into(),
            source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        };
        assert_eq!(e.kind(), ErrorKind::PermissionDenied);
        assert!(e.to_string().contains("/root/out"));
    }

    #[test]
    fn aborted_display_counts_settled_files() {
        let mut report = BatchRunReport::empty();
        report.total_files = 4;
        report.successful_files = 1;
        report.failed_files = 1;
        let e = Md2PdfError::Aborted {
            error: BatchError::new("b.md", ConversionError::processing("boom")),
            report: Box::new(report),
        };
        let msg = e.to_string();
        assert!(msg.contains("2 of 4"), "got: {msg}");
        assert_eq!(e.kind(), ErrorKind::SystemError);
    }
}
