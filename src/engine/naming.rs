//! Output naming policy.
//!
//! Pure functions: the clock is passed in so a whole batch shares one
//! timestamp and tests are deterministic.

use crate::config::{BatchRunConfig, FilenameFormat};
use crate::output::{FileTask, SourceFile};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::path::{Component, Path, PathBuf};

/// ISO-8601 with `:` and `.` replaced so the result is a valid filename.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H-%M-%S-%3fZ";
pub const DATE_FORMAT: &str = "%Y-%m-%d";

const PDF_EXTENSION: &str = "pdf";

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{(name|date|timestamp)\}").unwrap());

/// Filename (no directory) for the PDF produced from `input`.
pub fn output_file_name(input: &Path, format: &FilenameFormat, now: DateTime<Utc>) -> String {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "document".to_string());

    match format {
        FilenameFormat::Original => format!("{stem}.{PDF_EXTENSION}"),
        FilenameFormat::WithTimestamp => {
            format!("{stem}_{}.{PDF_EXTENSION}", now.format(TIMESTAMP_FORMAT))
        }
        FilenameFormat::WithDate => format!("{stem}_{}.{PDF_EXTENSION}", now.format(DATE_FORMAT)),
        FilenameFormat::Custom(pattern) => {
            // Substituted text is never rescanned for placeholders.
            let name = PLACEHOLDER
                .replace_all(pattern, |caps: &Captures<'_>| match &caps[1] {
                    "name" => stem.clone(),
                    "date" => now.format(DATE_FORMAT).to_string(),
                    _ => now.format(TIMESTAMP_FORMAT).to_string(),
                })
                .replace(['/', '\\'], "_");
            if name.to_ascii_lowercase().ends_with(".pdf") {
                name
            } else {
                format!("{name}.{PDF_EXTENSION}")
            }
        }
    }
}

/// Full output path for one source under `config`.
pub fn output_path_for(source: &SourceFile, config: &BatchRunConfig, now: DateTime<Utc>) -> PathBuf {
    let file_name = output_file_name(&source.input_path, &config.filename_format, now);

    match &config.output_directory {
        Some(dir) if config.preserve_directory_structure => {
            dir.join(safe_relative_parent(&source.relative_input_path))
                .join(file_name)
        }
        Some(dir) => dir.join(file_name),
        None => source
            .input_path
            .parent()
            .map(|p| p.join(&file_name))
            .unwrap_or_else(|| PathBuf::from(&file_name)),
    }
}

/// Turn sources into tasks sharing one clock reading.
pub fn plan_tasks(sources: Vec<SourceFile>, config: &BatchRunConfig, now: DateTime<Utc>) -> Vec<FileTask> {
    sources
        .into_iter()
        .map(|source| {
            let output = output_path_for(&source, config, now);
            FileTask::from_source(source, output)
        })
        .collect()
}

/// Parent of a relative path with `..`, roots and prefixes removed, so a
/// mirrored tree can never land outside the output directory.
fn safe_relative_parent(relative: &Path) -> PathBuf {
    relative
        .parent()
        .map(|p| {
            p.components()
                .filter_map(|c| match c {
                    Component::Normal(part) => Some(part),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default()
}
