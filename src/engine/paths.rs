//! Output path management: directories, conflicts, validation, backups.
//!
//! Everything here runs before the first conversion (or after the last), so
//! the scheduler's waves only ever see tasks whose destinations are unique,
//! valid and writable.
//!
//! ## Failure policy
//!
//! | Operation | On failure |
//! |-----------|------------|
//! | [`OutputPathManager::prepare_directories`] | fatal, `DirectoryCreation` |
//! | [`OutputPathManager::validate_paths`] | per task, moved to `invalid` |
//! | [`OutputPathManager::create_backups`] | fatal, `Backup` (partial backups removed) |
//! | [`OutputPathManager::restore_backups`] | logged, remaining restores continue |
//! | [`OutputPathManager::cleanup_failed_files`] | logged and swallowed |

use crate::config::{BatchRunConfig, FilenameFormat};
use crate::error::{ConversionError, ErrorKind, Md2PdfError};
use crate::output::FileTask;
use chrono::Utc;
use futures::future::join_all;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Longest filename accepted, in UTF-8 bytes.
pub const MAX_FILENAME_BYTES: usize = 255;

/// Timestamp used in backup names (no `:` so it is valid everywhere).
const BACKUP_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H-%M-%S-%3fZ";

static RESERVED_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(con|prn|aux|nul|com[1-9]|lpt[1-9])(\..*)?$").unwrap());

static FORBIDDEN_CHARS: Lazy<Regex> = Lazy::new(|| Regex::new(r#"[<>:"/\\|?*]"#).unwrap());

static CONTROL_CHARS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[\x00-\x1f]").unwrap());

// ── Result types ─────────────────────────────────────────────────────────

/// Tasks split by whether their destination can be written.
#[derive(Debug, Clone, Default)]
pub struct PathValidation {
    pub valid: Vec<FileTask>,
    pub invalid: Vec<(FileTask, ConversionError)>,
}

/// Pre-existing outputs copied aside, keyed by original path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupSet {
    entries: BTreeMap<PathBuf, PathBuf>,
}

impl BackupSet {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Backup path for an original output, if one was made.
    pub fn backup_for(&self, original: &Path) -> Option<&Path> {
        self.entries.get(original).map(PathBuf::as_path)
    }

    /// `(original, backup)` pairs in path order.
    pub fn iter(&self) -> impl Iterator<Item = (&Path, &Path)> {
        self.entries
            .iter()
            .map(|(o, b)| (o.as_path(), b.as_path()))
    }

    /// Split into backups whose original is in `originals` and the rest.
    pub fn partition(self, originals: &HashSet<PathBuf>) -> (BackupSet, BackupSet) {
        let (hit, miss): (BTreeMap<_, _>, BTreeMap<_, _>) = self
            .entries
            .into_iter()
            .partition(|(original, _)| originals.contains(original));
        (BackupSet { entries: hit }, BackupSet { entries: miss })
    }

    fn insert(&mut self, original: PathBuf, backup: PathBuf) {
        self.entries.insert(original, backup);
    }
}

/// An output path claimed by more than one input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathConflict {
    pub output_path: PathBuf,
    pub inputs: Vec<PathBuf>,
}

/// Dry-run description of where a batch will write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputReport {
    pub summary: String,
    /// Distinct output directories, sorted.
    pub directories: Vec<PathBuf>,
    pub conflicts: Vec<PathConflict>,
}

// ── Manager ──────────────────────────────────────────────────────────────

/// Filesystem side of a batch run, backed by `tokio::fs`.
#[derive(Debug, Clone, Default)]
pub struct OutputPathManager {
    _private: (),
}

impl OutputPathManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create every distinct parent directory, concurrently.
    ///
    /// Idempotent: existing directories are not an error.
    pub async fn prepare_directories(&self, tasks: &[FileTask]) -> Result<(), Md2PdfError> {
        let dirs: BTreeSet<PathBuf> = tasks
            .iter()
            .filter_map(|t| parent_dir(&t.output_path))
            .collect();
        debug!(count = dirs.len(), "preparing output directories");

        let results = join_all(dirs.into_iter().map(|dir| async move {
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|source| Md2PdfError::DirectoryCreation { path: dir, source })
        }))
        .await;

        results.into_iter().collect()
    }

    /// Give every task a unique destination.
    ///
    /// A path already claimed by an earlier task, or already present on disk
    /// (unless `overwrite_existing`), gets the lowest free `_N` suffix.
    /// Earlier tasks win, so the result depends only on input order.
    pub async fn resolve_conflicts(&self, tasks: Vec<FileTask>, overwrite_existing: bool) -> Vec<FileTask> {
        let mut claimed: HashSet<PathBuf> = HashSet::with_capacity(tasks.len());
        let mut resolved = Vec::with_capacity(tasks.len());

        for task in tasks {
            let original = task.output_path.clone();
            let mut candidate = original.clone();
            let mut n = 0u32;
            loop {
                let taken = claimed.contains(&candidate)
                    || (!overwrite_existing && path_exists(&candidate).await);
                if !taken {
                    break;
                }
                n += 1;
                candidate = with_suffix(&original, n);
            }
            if n > 0 {
                debug!(
                    input = %task.input_path.display(),
                    from = %original.display(),
                    to = %candidate.display(),
                    "resolved output conflict"
                );
            }
            claimed.insert(candidate.clone());
            resolved.push(task.with_output_path(candidate));
        }
        resolved
    }

    /// Check each destination's name and directory.
    ///
    /// Directories are created if needed and probed once with a throwaway
    /// file, so a read-only mount is caught before any conversion runs.
    pub async fn validate_paths(&self, tasks: Vec<FileTask>) -> PathValidation {
        let mut dir_results: HashMap<PathBuf, Result<(), ConversionError>> = HashMap::new();
        let mut validation = PathValidation::default();

        for task in tasks {
            if let Err(e) = check_file_name(&task.output_path) {
                validation.invalid.push((task, e));
                continue;
            }

            let dir = parent_dir(&task.output_path).unwrap_or_else(|| PathBuf::from("."));
            let dir_result = match dir_results.get(&dir) {
                Some(r) => r.clone(),
                None => {
                    let r = probe_directory(&dir).await;
                    dir_results.insert(dir.clone(), r.clone());
                    r
                }
            };

            match dir_result {
                Ok(()) => validation.valid.push(task),
                Err(e) => validation.invalid.push((task, e)),
            }
        }

        if !validation.invalid.is_empty() {
            warn!(
                invalid = validation.invalid.len(),
                valid = validation.valid.len(),
                "some output paths failed validation"
            );
        }
        validation
    }

    /// Copy every existing output aside before it is overwritten.
    pub async fn create_backups(&self, tasks: &[FileTask]) -> Result<BackupSet, Md2PdfError> {
        let stamp = Utc::now().format(BACKUP_TIMESTAMP_FORMAT).to_string();
        let mut set = BackupSet::default();

        for task in tasks {
            let original = &task.output_path;
            if !path_exists(original).await {
                continue;
            }
            let backup = backup_path(original, &stamp);
            if let Err(source) = tokio::fs::copy(original, &backup).await {
                // Leave no half-made set behind.
                self.discard_backups(&set).await;
                return Err(Md2PdfError::Backup {
                    original: original.clone(),
                    backup,
                    source,
                });
            }
            debug!(original = %original.display(), backup = %backup.display(), "backed up");
            set.insert(original.clone(), backup);
        }

        if !set.is_empty() {
            info!("Backed up {} existing output(s)", set.len());
        }
        Ok(set)
    }

    /// Put every backup back in place and delete it. Returns how many were
    /// restored; failures are logged and skipped.
    pub async fn restore_backups(&self, set: &BackupSet) -> usize {
        let mut restored = 0;
        for (original, backup) in set.iter() {
            if let Err(e) = tokio::fs::copy(backup, original).await {
                warn!(
                    "Failed to restore '{}' from '{}': {}",
                    original.display(),
                    backup.display(),
                    e
                );
                continue;
            }
            if let Err(e) = tokio::fs::remove_file(backup).await {
                warn!("Restored '{}' but could not remove backup: {}", original.display(), e);
            }
            restored += 1;
        }
        restored
    }

    /// Delete backups that are no longer needed.
    pub async fn discard_backups(&self, set: &BackupSet) {
        let results = join_all(set.iter().map(|(_, backup)| remove_if_present(backup))).await;
        for (path, err) in results.into_iter().flatten() {
            warn!("Failed to delete backup '{}': {}", path.display(), err);
        }
    }

    /// Best-effort removal of outputs left by failed conversions.
    ///
    /// Missing files are fine. Returns how many files were actually removed.
    pub async fn cleanup_failed_files(&self, paths: &[PathBuf]) -> usize {
        let existing: Vec<bool> =
            join_all(paths.iter().map(|p| path_exists(p))).await;
        let results = join_all(paths.iter().map(|p| remove_if_present(p))).await;

        let mut removed = 0;
        for ((path, existed), result) in paths.iter().zip(existing).zip(results) {
            match result {
                Some((_, err)) => warn!("Failed to clean up '{}': {}", path.display(), err),
                None if existed => removed += 1,
                None => {}
            }
        }
        if removed > 0 {
            debug!(removed, "cleaned up partial outputs");
        }
        removed
    }

    /// Describe where `tasks` will write under `config`, without touching disk.
    pub fn generate_report(&self, config: &BatchRunConfig, tasks: &[FileTask]) -> OutputReport {
        let directories: BTreeSet<PathBuf> = tasks
            .iter()
            .map(|t| parent_dir(&t.output_path).unwrap_or_else(|| PathBuf::from(".")))
            .collect();

        let mut by_output: BTreeMap<&Path, Vec<PathBuf>> = BTreeMap::new();
        for task in tasks {
            by_output
                .entry(task.output_path.as_path())
                .or_default()
                .push(task.input_path.clone());
        }
        let conflicts: Vec<PathConflict> = by_output
            .into_iter()
            .filter(|(_, inputs)| inputs.len() > 1)
            .map(|(output, inputs)| PathConflict {
                output_path: output.to_path_buf(),
                inputs,
            })
            .collect();

        let target = match &config.output_directory {
            Some(dir) => format!("'{}'", dir.display()),
            None => "alongside inputs".to_string(),
        };
        let layout = if config.preserve_directory_structure {
            "preserved"
        } else {
            "flat"
        };
        let summary = format!(
            "{} file(s) to {} ({} director{}, {} structure, {} names, {} conflict(s))",
            tasks.len(),
            target,
            directories.len(),
            if directories.len() == 1 { "y" } else { "ies" },
            layout,
            format_label(&config.filename_format),
            conflicts.len()
        );

        OutputReport {
            summary,
            directories: directories.into_iter().collect(),
            conflicts,
        }
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────

fn format_label(format: &FilenameFormat) -> &str {
    match format {
        FilenameFormat::Original => "original",
        FilenameFormat::WithTimestamp => "timestamped",
        FilenameFormat::WithDate => "dated",
        FilenameFormat::Custom(pattern) => pattern,
    }
}

fn parent_dir(path: &Path) -> Option<PathBuf> {
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
}

async fn path_exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

/// `None` on success or when the file is already gone.
async fn remove_if_present(path: &Path) -> Option<(PathBuf, std::io::Error)> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => None,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => Some((path.to_path_buf(), e)),
    }
}

fn split_name(path: &Path) -> (String, Option<String>) {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path.extension().map(|e| e.to_string_lossy().into_owned());
    (stem, ext)
}

/// `dir/doc.pdf` → `dir/doc_N.pdf`.
fn with_suffix(path: &Path, n: u32) -> PathBuf {
    let (stem, ext) = split_name(path);
    let name = match ext {
        Some(ext) => format!("{stem}_{n}.{ext}"),
        None => format!("{stem}_{n}"),
    };
    path.with_file_name(name)
}

/// `dir/doc.pdf` → `dir/doc_backup_<stamp>.pdf`.
fn backup_path(path: &Path, stamp: &str) -> PathBuf {
    let (stem, ext) = split_name(path);
    let name = match ext {
        Some(ext) => format!("{stem}_backup_{stamp}.{ext}"),
        None => format!("{stem}_backup_{stamp}"),
    };
    path.with_file_name(name)
}

fn check_file_name(path: &Path) -> Result<(), ConversionError> {
    let Some(name) = path.file_name() else {
        return Err(ConversionError::new(
            ErrorKind::InvalidFormat,
            format!("'{}' has no file name", path.display()),
        ));
    };
    let name = name.to_string_lossy();

    if name.len() > MAX_FILENAME_BYTES {
        return Err(ConversionError::new(
            ErrorKind::InvalidFormat,
            format!(
                "file name is {} bytes (max {}): '{}'",
                name.len(),
                MAX_FILENAME_BYTES,
                name
            ),
        ));
    }
    if RESERVED_NAME.is_match(&name) {
        return Err(ConversionError::new(
            ErrorKind::InvalidFormat,
            format!("'{name}' is a reserved device name"),
        ));
    }
    if FORBIDDEN_CHARS.is_match(&name) || CONTROL_CHARS.is_match(&name) {
        return Err(ConversionError::new(
            ErrorKind::InvalidFormat,
            format!("'{}' contains characters not allowed in file names", name.escape_debug()),
        ));
    }
    Ok(())
}

/// Create `dir` if needed and prove a file can be written in it.
async fn probe_directory(dir: &Path) -> Result<(), ConversionError> {
    if let Err(e) = tokio::fs::create_dir_all(dir).await {
        return Err(dir_error(dir, "cannot create directory", e));
    }

    let owned = dir.to_path_buf();
    let probe = tokio::task::spawn_blocking(move || {
        tempfile::Builder::new()
            .prefix(".md2pdf-probe-")
            .tempfile_in(&owned)
            .map(drop)
    })
    .await;

    match probe {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(dir_error(dir, "directory is not writable", e)),
        Err(e) => Err(ConversionError::processing(format!(
            "write probe for '{}' panicked: {}",
            dir.display(),
            e
        ))),
    }
}

fn dir_error(dir: &Path, what: &str, e: std::io::Error) -> ConversionError {
    let kind = match e.kind() {
        std::io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
        _ => ErrorKind::SystemError,
    };
    ConversionError::new(kind, format!("{what} '{}': {}", dir.display(), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn task(input: &str, output: &Path) -> FileTask {
        FileTask {
            input_path: PathBuf::from(input),
            output_path: output.to_path_buf(),
            relative_input_path: PathBuf::from(input),
            size: 1,
            last_modified: None,
        }
    }

    #[test]
    fn suffix_and_backup_names() {
        let p = Path::new("out/doc.pdf");
        assert_eq!(with_suffix(p, 2), PathBuf::from("out/doc_2.pdf"));
        assert_eq!(
            backup_path(p, "2026-10-16T08-00-00-000Z"),
            PathBuf::from("out/doc_backup_2026-10-16T08-00-00-000Z.pdf")
        );
    }

    #[test]
    fn file_name_rules() {
        assert!(check_file_name(Path::new("out/ok.pdf")).is_ok());
        for bad in ["CON.pdf", "nul", "Lpt3.pdf", "a<b.pdf", "a|b.pdf", "a\u{7}.pdf"] {
            let err = check_file_name(&Path::new("out").join(bad)).unwrap_err();
            assert_eq!(err.kind, ErrorKind::InvalidFormat, "{bad}");
        }
        assert!(check_file_name(Path::new("console.pdf")).is_ok());
        let long = "a".repeat(252) + ".pdf";
        assert_eq!(
            check_file_name(Path::new(&long)).unwrap_err().kind,
            ErrorKind::InvalidFormat
        );
    }

    #[tokio::test]
    async fn prepare_directories_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let tasks = vec![
            task("a.md", &dir.path().join("x/y/a.pdf")),
            task("b.md", &dir.path().join("x/y/b.pdf")),
            task("c.md", &dir.path().join("z/c.pdf")),
        ];
        let m = OutputPathManager::new();
        m.prepare_directories(&tasks).await.unwrap();
        m.prepare_directories(&tasks).await.unwrap();
        assert!(dir.path().join("x/y").is_dir());
        assert!(dir.path().join("z").is_dir());
    }

    #[tokio::test]
    async fn prepare_directories_reports_blocking_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("blocker"), "").unwrap();
        let tasks = vec![task("a.md", &dir.path().join("blocker/a.pdf"))];
        let err = OutputPathManager::new()
            .prepare_directories(&tasks)
            .await
            .unwrap_err();
        assert!(matches!(err, Md2PdfError::DirectoryCreation { .. }));
    }

    #[tokio::test]
    async fn conflicts_get_lowest_free_suffix_in_input_order() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("doc.pdf");
        fs::write(&out, "old").unwrap();
        fs::write(dir.path().join("doc_2.pdf"), "old").unwrap();

        let tasks = vec![task("a/doc.md", &out), task("b/doc.md", &out)];
        let m = OutputPathManager::new();
        let resolved = m.resolve_conflicts(tasks.clone(), false).await;
        assert_eq!(resolved[0].output_path, dir.path().join("doc_1.pdf"));
        assert_eq!(resolved[1].output_path, dir.path().join("doc_3.pdf"));

        let again = m.resolve_conflicts(tasks.clone(), false).await;
        assert_eq!(resolved, again);

        let overwrite = m.resolve_conflicts(tasks, true).await;
        assert_eq!(overwrite[0].output_path, out);
        assert_eq!(overwrite[1].output_path, dir.path().join("doc_1.pdf"));
    }

    #[tokio::test]
    async fn validate_paths_splits_invalid_names() {
        let dir = tempfile::tempdir().unwrap();
        let tasks = vec![
            task("a.md", &dir.path().join("a.pdf")),
            task("con.md", &dir.path().join("con.pdf")),
        ];
        let v = OutputPathManager::new().validate_paths(tasks).await;
        assert_eq!(v.valid.len(), 1);
        assert_eq!(v.invalid.len(), 1);
        assert_eq!(v.invalid[0].1.kind, ErrorKind::InvalidFormat);
    }

    #[tokio::test]
    async fn validate_paths_flags_uncreatable_directory() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("blocker"), "").unwrap();
        let tasks = vec![task("a.md", &dir.path().join("blocker/sub/a.pdf"))];
        let v = OutputPathManager::new().validate_paths(tasks).await;
        assert!(v.valid.is_empty());
        assert_eq!(v.invalid[0].1.kind, ErrorKind::SystemError);
    }

    #[tokio::test]
    async fn backup_restore_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("doc.pdf");
        fs::write(&out, "original").unwrap();
        let tasks = vec![
            task("doc.md", &out),
            task("new.md", &dir.path().join("new.pdf")),
        ];

        let m = OutputPathManager::new();
        let set = m.create_backups(&tasks).await.unwrap();
        assert_eq!(set.len(), 1);
        let backup = set.backup_for(&out).unwrap().to_path_buf();
        assert!(backup
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("doc_backup_"));

        fs::write(&out, "clobbered").unwrap();
        assert_eq!(m.restore_backups(&set).await, 1);
        assert_eq!(fs::read_to_string(&out).unwrap(), "original");
        assert!(!backup.exists());
    }

    #[tokio::test]
    async fn restore_continues_past_missing_backup() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.pdf");
        let b = dir.path().join("b.pdf");
        fs::write(&a, "a0").unwrap();
        fs::write(&b, "b0").unwrap();
        let m = OutputPathManager::new();
        let set = m
            .create_backups(&[task("a.md", &a), task("b.md", &b)])
            .await
            .unwrap();

        fs::remove_file(set.backup_for(&a).unwrap()).unwrap();
        fs::write(&b, "b1").unwrap();
        assert_eq!(m.restore_backups(&set).await, 1);
        assert_eq!(fs::read_to_string(&b).unwrap(), "b0");
    }

    #[tokio::test]
    async fn partition_and_discard() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.pdf");
        let b = dir.path().join("b.pdf");
        fs::write(&a, "a").unwrap();
        fs::write(&b, "b").unwrap();
        let m = OutputPathManager::new();
        let set = m
            .create_backups(&[task("a.md", &a), task("b.md", &b)])
            .await
            .unwrap();
        let backup_b = set.backup_for(&b).unwrap().to_path_buf();

        let failed: HashSet<PathBuf> = [a.clone()].into_iter().collect();
        let (restore, discard) = set.partition(&failed);
        assert_eq!(restore.len(), 1);
        assert!(restore.backup_for(&a).is_some());
        m.discard_backups(&discard).await;
        assert!(!backup_b.exists());
    }

    #[tokio::test]
    async fn cleanup_ignores_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("partial.pdf");
        fs::write(&present, "half").unwrap();
        let removed = OutputPathManager::new()
            .cleanup_failed_files(&[present.clone(), dir.path().join("never.pdf")])
            .await;
        assert_eq!(removed, 1);
        assert!(!present.exists());
    }

    #[test]
    fn report_lists_sorted_directories_and_conflicts() {
        let config = BatchRunConfig::builder().output_directory("out").build().unwrap();
        let tasks = vec![
            task("z/doc.md", Path::new("out/doc.pdf")),
            task("a/doc.md", Path::new("out/doc.pdf")),
            task("b.md", Path::new("out/sub/b.pdf")),
        ];
        let r = OutputPathManager::new().generate_report(&config, &tasks);
        assert_eq!(
            r.directories,
            vec![PathBuf::from("out"), PathBuf::from("out/sub")]
        );
        assert_eq!(r.conflicts.len(), 1);
        assert_eq!(r.conflicts[0].inputs.len(), 2);
        assert!(r.summary.starts_with("3 file(s) to 'out'"), "{}", r.summary);
    }
}
