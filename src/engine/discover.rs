//! Input discovery: expand glob patterns into source files.
//!
//! A pattern is split at its first segment containing a glob meta character.
//! The literal prefix becomes the walk root and the remainder is matched
//! against paths relative to that root:
//!
//! ```text
//! docs/guides/**/*.md   →  root "docs/guides", match "**/*.md"
//! *.md                  →  root ".",           match "*.md"
//! notes.md              →  that file only
//! docs                  →  root "docs",        match "**/*.md"
//! ```
//!
//! `*` never crosses a `/`; use `**` to descend. Exclude globs are matched
//! against the same relative path. Results are sorted by path so two runs
//! over the same tree plan identical batches.

use crate::error::Md2PdfError;
use crate::output::SourceFile;
use chrono::{DateTime, Utc};
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Pattern used when a bare directory is given.
pub const DIRECTORY_DEFAULT_GLOB: &str = "**/*.md";

/// Expand one pattern into sorted source files.
///
/// A pattern whose literal root does not exist yields an empty list; the
/// caller decides whether that is an error.
pub async fn discover_sources(
    pattern: &str,
    excludes: &[String],
) -> Result<Vec<SourceFile>, Md2PdfError> {
    let pattern = pattern.trim().to_string();
    if pattern.is_empty() {
        return Err(Md2PdfError::Validation {
            field: "input_pattern",
            reason: "must not be empty".into(),
        });
    }
    let excludes = excludes.to_vec();

    tokio::task::spawn_blocking(move || discover_blocking(&pattern, &excludes))
        .await
        .map_err(|e| Md2PdfError::Internal(format!("Discovery task panicked: {}", e)))?
}

/// Expand several patterns, dropping duplicates. Order is by path.
pub async fn discover_all(
    patterns: &[String],
    excludes: &[String],
) -> Result<Vec<SourceFile>, Md2PdfError> {
    let mut by_path = BTreeMap::new();
    for pattern in patterns {
        for source in discover_sources(pattern, excludes).await? {
            by_path.entry(source.input_path.clone()).or_insert(source);
        }
    }
    Ok(by_path.into_values().collect())
}

fn discover_blocking(pattern: &str, excludes: &[String]) -> Result<Vec<SourceFile>, Md2PdfError> {
    let (root, remainder) = split_pattern(pattern);
    let exclude_set = build_globset(excludes)?;

    let remainder = if remainder.is_empty() {
        if root.is_file() {
            let rel = root.file_name().map(PathBuf::from).unwrap_or_else(|| root.clone());
            if exclude_set.as_ref().is_some_and(|set| set.is_match(&rel)) {
                return Ok(Vec::new());
            }
            return Ok(vec![source_from_metadata(&root, rel)]);
        }
        if !root.is_dir() {
            debug!(path = %root.display(), "literal input does not exist");
            return Ok(Vec::new());
        }
        DIRECTORY_DEFAULT_GLOB.to_string()
    } else {
        remainder
    };

    let include = build_globset(std::slice::from_ref(&remainder))?
        .ok_or_else(|| Md2PdfError::Internal("include glob set is empty".into()))?;

    if !root.is_dir() {
        debug!(root = %root.display(), "pattern root does not exist");
        return Ok(Vec::new());
    }

    let mut found = Vec::new();
    for entry in WalkDir::new(&root).follow_links(true).sort_by_file_name() {
        let entry = match entry {
            Ok(e) => e,
            Err(source) if source.depth() == 0 => {
                return Err(Md2PdfError::Discovery {
                    path: root.clone(),
                    source,
                })
            }
            Err(e) => {
                warn!("Skipping unreadable entry under '{}': {}", root.display(), e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(&root) else {
            continue;
        };
        if !include.is_match(rel) {
            continue;
        }
        if exclude_set.as_ref().is_some_and(|set| set.is_match(rel)) {
            debug!(path = %rel.display(), "excluded");
            continue;
        }
        found.push(source_from_metadata(entry.path(), rel.to_path_buf()));
    }

    found.sort_by(|a, b| a.input_path.cmp(&b.input_path));
    debug!(pattern, count = found.len(), "discovery complete");
    Ok(found)
}

fn source_from_metadata(path: &Path, relative_input_path: PathBuf) -> SourceFile {
    let (size, last_modified) = match std::fs::metadata(path) {
        Ok(meta) => (
            meta.len(),
            meta.modified().ok().map(DateTime::<Utc>::from),
        ),
        Err(_) => (0, None),
    };
    SourceFile {
        input_path: path.to_path_buf(),
        relative_input_path,
        size,
        last_modified,
    }
}

/// Split a pattern into its literal root and glob remainder.
fn split_pattern(pattern: &str) -> (PathBuf, String) {
    let mut root = PathBuf::new();
    if pattern.starts_with('/') {
        root.push("/");
    }
    let segments: Vec<&str> = pattern.split('/').filter(|s| !s.is_empty()).collect();
    let first_glob = segments
        .iter()
        .position(|s| has_glob_meta(s))
        .unwrap_or(segments.len());

    for segment in &segments[..first_glob] {
        root.push(segment);
    }
    if root.as_os_str().is_empty() {
        root.push(".");
    }
    (root, segments[first_glob..].join("/"))
}

fn has_glob_meta(segment: &str) -> bool {
    segment.contains(['*', '?', '[', '{'])
}

fn build_globset(patterns: &[String]) -> Result<Option<GlobSet>, Md2PdfError> {
    if patterns.is_empty() {
        return Ok(None);
    }

    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = GlobBuilder::new(pattern)
            .literal_separator(true)
            .build()
            .map_err(|source| Md2PdfError::InvalidPattern {
                pattern: pattern.clone(),
                source,
            })?;
        builder.add(glob);
    }
    Ok(Some(builder.build().map_err(|source| {
        Md2PdfError::InvalidPattern {
            pattern: patterns.join(", "),
            source,
        }
    })?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("guide/drafts")).unwrap();
        fs::write(root.join("readme.md"), "# r").unwrap();
        fs::write(root.join("notes.txt"), "n").unwrap();
        fs::write(root.join("guide/intro.md"), "# i").unwrap();
        fs::write(root.join("guide/setup.md"), "# s").unwrap();
        fs::write(root.join("guide/drafts/wip.md"), "# w").unwrap();
        dir
    }

    fn pattern(dir: &Path, glob: &str) -> String {
        format!("{}/{}", dir.display(), glob)
    }

    #[test]
    fn split_pattern_finds_literal_root() {
        assert_eq!(
            split_pattern("docs/guides/**/*.md"),
            (PathBuf::from("docs/guides"), "**/*.md".to_string())
        );
        assert_eq!(split_pattern("*.md"), (PathBuf::from("."), "*.md".to_string()));
        assert_eq!(
            split_pattern("/abs/x.md"),
            (PathBuf::from("/abs/x.md"), String::new())
        );
    }

    #[tokio::test]
    async fn single_star_stays_at_top_level() {
        let dir = tree();
        let found = discover_sources(&pattern(dir.path(), "*.md"), &[]).await.unwrap();
        let names: Vec<_> = found.iter().map(|s| s.relative_input_path.clone()).collect();
        assert_eq!(names, vec![PathBuf::from("readme.md")]);
    }

    #[tokio::test]
    async fn double_star_descends_and_sorts() {
        let dir = tree();
        let found = discover_sources(&pattern(dir.path(), "**/*.md"), &[])
            .await
            .unwrap();
        let names: Vec<_> = found.iter().map(|s| s.relative_input_path.clone()).collect();
        assert_eq!(
            names,
            vec![
                PathBuf::from("guide/drafts/wip.md"),
                PathBuf::from("guide/intro.md"),
                PathBuf::from("guide/setup.md"),
                PathBuf::from("readme.md"),
            ]
        );
        assert!(found.iter().all(|s| s.size > 0 && s.last_modified.is_some()));
    }

    #[tokio::test]
    async fn excludes_are_relative_to_root() {
        let dir = tree();
        let found = discover_sources(
            &pattern(dir.path(), "**/*.md"),
            &["**/drafts/**".to_string()],
        )
        .await
        .unwrap();
        assert_eq!(found.len(), 3);
        assert!(found
            .iter()
            .all(|s| !s.relative_input_path.starts_with("guide/drafts")));
    }

    #[tokio::test]
    async fn bare_directory_means_all_markdown_below_it() {
        let dir = tree();
        let found = discover_sources(&dir.path().join("guide").display().to_string(), &[])
            .await
            .unwrap();
        assert_eq!(found.len(), 3);
    }

    #[tokio::test]
    async fn literal_file_and_missing_paths() {
        let dir = tree();
        let file = dir.path().join("readme.md");
        let found = discover_sources(&file.display().to_string(), &[]).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].input_path, file);

        let missing = discover_sources(&pattern(dir.path(), "nope/**/*.md"), &[])
            .await
            .unwrap();
        assert!(missing.is_empty());
    }

    #[tokio::test]
    async fn invalid_glob_is_reported() {
        let err = discover_sources("docs/[.md", &[]).await.unwrap_err();
        assert!(matches!(err, Md2PdfError::InvalidPattern { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn discover_all_dedupes_overlapping_patterns() {
        let dir = tree();
        let found = discover_all(
            &[pattern(dir.path(), "*.md"), pattern(dir.path(), "**/*.md")],
            &[],
        )
        .await
        .unwrap();
        assert_eq!(found.len(), 4);
    }
}
