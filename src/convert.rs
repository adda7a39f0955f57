//! The single-file conversion collaborator.
//!
//! The batch engine never parses Markdown or renders PDFs itself. It hands
//! each task to a [`DocumentConverter`] and only cares about the contract:
//! write `output`, report its size, or fail with a [`ConversionError`] whose
//! kind and `retryable` hint drive recovery.
//!
//! [`CommandConverter`] is the stock implementation: it runs an external
//! engine from a command template such as
//! `pandoc {input} -o {output} --pdf-engine=weasyprint`.

use crate::error::{ConversionError, ErrorKind, Md2PdfError};
use crate::output::ConvertedFile;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Per-file options forwarded untouched to the converter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversionOptions {
    /// Upper bound on a single conversion. Default: 120.
    pub timeout_secs: u64,
    /// Extra arguments appended after the template's own.
    pub extra_args: Vec<String>,
    /// Extra environment for the engine process.
    pub env: BTreeMap<String, String>,
}

impl Default for ConversionOptions {
    fn default() -> Self {
        Self {
            timeout_secs: 120,
            extra_args: Vec::new(),
            env: BTreeMap::new(),
        }
    }
}

impl ConversionOptions {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

/// Converts one Markdown file to one PDF.
///
/// Implementations must be `Send + Sync`: the scheduler calls `convert`
/// concurrently for every file in a wave.
#[async_trait]
pub trait DocumentConverter: Send + Sync {
    /// Convert `input` and write the result to `output`.
    ///
    /// The parent directory of `output` already exists when this is called.
    async fn convert(
        &self,
        input: &Path,
        output: &Path,
        options: &ConversionOptions,
    ) -> Result<ConvertedFile, ConversionError>;

    /// Short name for logs.
    fn name(&self) -> &str {
        "converter"
    }
}

// ── External command ─────────────────────────────────────────────────────

/// Placeholder replaced by the input path.
pub const INPUT_PLACEHOLDER: &str = "{input}";
/// Placeholder replaced by the output path.
pub const OUTPUT_PLACEHOLDER: &str = "{output}";

/// Characters of engine stderr kept in error messages.
const STDERR_TAIL_CHARS: usize = 400;

/// Runs an external engine per file.
///
/// The template is split on whitespace; each token may contain `{input}`
/// and `{output}`. Quoting is not interpreted, so paths with spaces are safe
/// (they are substituted after splitting) but template arguments with spaces
/// must go into [`ConversionOptions::extra_args`].
#[derive(Debug, Clone)]
pub struct CommandConverter {
    program: String,
    args: Vec<String>,
}

impl CommandConverter {
    pub fn from_template(template: &str) -> Result<Self, Md2PdfError> {
        let mut tokens = template.split_whitespace().map(str::to_string);
        let program = tokens.next().ok_or_else(|| Md2PdfError::Validation {
            field: "engine",
            reason: "command template is empty".into(),
        })?;
        let args: Vec<String> = tokens.collect();

        for placeholder in [INPUT_PLACEHOLDER, OUTPUT_PLACEHOLDER] {
            if !args.iter().any(|a| a.contains(placeholder)) {
                return Err(Md2PdfError::Validation {
                    field: "engine",
                    reason: format!("command template must contain {placeholder}"),
                });
            }
        }

        Ok(Self { program, args })
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    fn render_args(&self, input: &Path, output: &Path, options: &ConversionOptions) -> Vec<String> {
        let input = input.to_string_lossy();
        let output = output.to_string_lossy();
        self.args
            .iter()
            .map(|a| {
                a.replace(INPUT_PLACEHOLDER, &input)
                    .replace(OUTPUT_PLACEHOLDER, &output)
            })
            .chain(options.extra_args.iter().cloned())
            .collect()
    }
}

#[async_trait]
impl DocumentConverter for CommandConverter {
    async fn convert(
        &self,
        input: &Path,
        output: &Path,
        options: &ConversionOptions,
    ) -> Result<ConvertedFile, ConversionError> {
        let start = Instant::now();

        let meta = tokio::fs::metadata(input).await?;
        if !meta.is_file() {
            return Err(ConversionError::new(
                ErrorKind::Validation,
                format!("'{}' is not a regular file", input.display()),
            ));
        }

        let args = self.render_args(input, output, options);
        debug!(program = %self.program, ?args, "spawning engine");

        let mut command = tokio::process::Command::new(&self.program);
        command
            .args(&args)
            .envs(&options.env)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let result = match tokio::time::timeout(options.timeout(), command.output()).await {
            Err(_) => {
                return Err(ConversionError::new(
                    ErrorKind::SystemError,
                    format!(
                        "engine '{}' timed out after {}s",
                        self.program, options.timeout_secs
                    ),
                ))
            }
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ConversionError::new(
                    ErrorKind::Validation,
                    format!("engine '{}' not found on PATH", self.program),
                ))
            }
            Ok(Err(e)) => return Err(e.into()),
            Ok(Ok(out)) => out,
        };

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            let tail = stderr_tail(&stderr);
            warn!(input = %input.display(), status = %result.status, "engine failed");
            return Err(ConversionError::new(
                ErrorKind::RenderError,
                format!("engine '{}' exited with {}: {}", self.program, result.status, tail),
            ));
        }

        let size = match tokio::fs::metadata(output).await {
            Ok(m) => m.len(),
            Err(_) => {
                return Err(ConversionError::new(
                    ErrorKind::RenderError,
                    format!(
                        "engine '{}' succeeded but wrote no file at '{}'",
                        self.program,
                        output.display()
                    ),
                ))
            }
        };

        Ok(ConvertedFile {
            output_path: output.to_path_buf(),
            size,
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }

    fn name(&self) -> &str {
        &self.program
    }
}

fn stderr_tail(stderr: &str) -> String {
    let trimmed = stderr.trim();
    let count = trimmed.chars().count();
    if count <= STDERR_TAIL_CHARS {
        trimmed.to_string()
    } else {
        let tail: String = trimmed.chars().skip(count - STDERR_TAIL_CHARS).collect();
        format!("\u{2026}{tail}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn template_requires_both_placeholders() {
        assert!(CommandConverter::from_template("pandoc {input}").is_err());
        assert!(CommandConverter::from_template("").is_err());
        let c = CommandConverter::from_template("pandoc {input} -o {output}").unwrap();
        assert_eq!(c.program(), "pandoc");
    }

    #[test]
    fn render_args_substitutes_paths_after_splitting() {
        let c = CommandConverter::from_template("engine --in={input} {output}").unwrap();
        let opts = ConversionOptions {
            extra_args: vec!["--toc".into()],
            ..Default::default()
        };
        let args = c.render_args(
            &PathBuf::from("my notes.md"),
            &PathBuf::from("out/my notes.pdf"),
            &opts,
        );
        assert_eq!(args, vec!["--in=my notes.md", "out/my notes.pdf", "--toc"]);
    }

    #[test]
    fn stderr_tail_truncates_from_the_front() {
        let long = "x".repeat(1000) + "END";
        let tail = stderr_tail(&long);
        assert!(tail.ends_with("END"));
        assert!(tail.chars().count() <= STDERR_TAIL_CHARS + 1);
    }

    #[tokio::test]
    async fn missing_input_is_file_not_found() {
        let c = CommandConverter::from_template("true {input} {output}").unwrap();
        let err = c
            .convert(
                Path::new("/definitely/not/here.md"),
                Path::new("/tmp/out.pdf"),
                &ConversionOptions::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::FileNotFound);
        assert!(!err.retryable);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn missing_engine_is_not_retryable() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("a.md");
        std::fs::write(&input, "# hi").unwrap();
        let c = CommandConverter::from_template("md2pdf-no-such-engine {input} {output}").unwrap();
        let err = c
            .convert(&input, &dir.path().join("a.pdf"), &ConversionOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
        assert!(!err.retryable);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn copying_engine_produces_output() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("a.md");
        let output = dir.path().join("a.pdf");
        std::fs::write(&input, "# hi").unwrap();
        let c = CommandConverter::from_template("cp {input} {output}").unwrap();
        let file = c
            .convert(&input, &output, &ConversionOptions::default())
            .await
            .unwrap();
        assert_eq!(file.size, 4);
        assert_eq!(file.output_path, output);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_engine_is_render_error() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("a.md");
        std::fs::write(&input, "# hi").unwrap();
        let c = CommandConverter::from_template("false {input} {output}").unwrap();
        let err = c
            .convert(&input, &dir.path().join("a.pdf"), &ConversionOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::RenderError);
        assert!(err.retryable);
    }
}
