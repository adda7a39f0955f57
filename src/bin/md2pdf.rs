//! CLI binary for md2pdf-batch.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `BatchRunConfig`, runs the batch, retries what is worth retrying and
//! prints the outcome.

use anyhow::{bail, Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use md2pdf_batch::{
    discover_all, BatchProgressCallback, BatchRunConfig, BatchRunReport, BatchScheduler,
    CommandConverter, ConversionOptions, FilenameFormat, GovernorConfig, Md2PdfError,
    ProgressCallback, RecoveryPlan, RecoveryStrategy, RecoverySuggestions, RecoverySummary,
    ResourceGovernor,
};
use serde::Serialize;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

// ── CLI progress callback using indicatif ────────────────────────────────

/// Terminal progress: one bar for the batch, one log line per settled file.
/// Files within a wave settle out of order, so lines are printed as they
/// arrive.
struct CliProgressCallback {
    bar: ProgressBar,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>4}/{len} files  \
             ⏱ {elapsed_precise}  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);
        bar.set_style(style);
        bar.set_prefix("Converting");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self { bar })
    }
}

impl BatchProgressCallback for CliProgressCallback {
    fn on_batch_start(&self, total_files: usize) {
        self.bar.set_length(total_files as u64);
        self.bar.reset_eta();
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Converting {total_files} file(s)…"))
        ));
    }

    fn on_wave_start(&self, wave: usize, wave_size: usize) {
        self.bar.set_message(format!("wave {wave} ({wave_size} at once)"));
    }

    fn on_file_complete(&self, input_path: &str, output_path: &str, duration_ms: u64) {
        self.bar.println(format!(
            "  {} {}  {}  {}",
            green("✓"),
            input_path,
            dim(&format!("→ {output_path}")),
            dim(&format!("{:.1}s", duration_ms as f64 / 1000.0)),
        ));
    }

    fn on_file_error(&self, input_path: &str, error: &str) {
        let msg: String = if error.chars().count() > 100 {
            error.chars().take(99).chain(std::iter::once('\u{2026}')).collect()
        } else {
            error.to_string()
        };
        self.bar
            .println(format!("  {} {}  {}", red("✗"), input_path, red(&msg)));
    }

    fn on_progress(&self, _percent: f64, _current_file: &str) {
        self.bar.inc(1);
    }

    fn on_batch_complete(&self, _total_files: usize, _successful_files: usize) {
        self.bar.finish_and_clear();
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Every Markdown file under docs/, PDFs next to their sources
  md2pdf docs

  # Glob with excludes into one output directory, mirroring the tree
  md2pdf --pattern 'docs/**/*.md' --exclude '**/drafts/**' -o pdf --preserve-structure

  # Dated names, four at once, back off when the machine is busy
  md2pdf notes/*.md -o out --filename-format date -c 4 --adaptive

  # Custom names
  md2pdf report.md --filename-format custom --name-pattern '{date}-{name}'

  # Stop at the first failure, replace existing PDFs (originals are backed up)
  md2pdf docs -o pdf --fail-fast --overwrite

  # A different engine
  md2pdf docs --engine 'md-to-pdf {input} --output {output}'

ENGINE TEMPLATE:
  The engine is any command that converts one file. {input} and {output}
  are replaced by the source and destination paths. Default:
    pandoc {input} -o {output}

ENVIRONMENT VARIABLES:
  RUST_LOG               Override log filter (e.g. md2pdf_batch=debug)
  MD2PDF_ENGINE          Default engine template
  MD2PDF_OUTPUT_DIR      Default output directory
  MD2PDF_CONCURRENCY     Default concurrency
"#;

/// Convert batches of Markdown files to PDF.
#[derive(Parser, Debug)]
#[command(
    name = "md2pdf",
    version,
    about = "Convert batches of Markdown files to PDF",
    long_about = "Convert many Markdown files to PDF with bounded concurrency, load-aware \
throttling, collision-free output names, safe overwrite and automatic retry of transient \
failures. Rendering is delegated to an external engine such as pandoc.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Markdown files, directories or glob patterns.
    inputs: Vec<String>,

    /// Glob pattern of inputs, e.g. 'docs/**/*.md'.
    #[arg(long, env = "MD2PDF_PATTERN")]
    pattern: Option<String>,

    /// Glob of inputs to skip, relative to the pattern root. Repeatable.
    #[arg(long = "exclude", value_name = "GLOB")]
    exclude: Vec<String>,

    /// Write all PDFs into this directory instead of next to their sources.
    #[arg(short, long = "output-dir", env = "MD2PDF_OUTPUT_DIR")]
    output_dir: Option<PathBuf>,

    /// Files converted at once.
    #[arg(short, long, env = "MD2PDF_CONCURRENCY", default_value_t = 2)]
    concurrency: usize,

    /// Mirror the input directory tree under the output directory.
    #[arg(long, env = "MD2PDF_PRESERVE_STRUCTURE", requires = "output_dir")]
    preserve_structure: bool,

    /// How output names are derived.
    #[arg(long, env = "MD2PDF_FILENAME_FORMAT", value_enum, default_value = "original")]
    filename_format: FormatArg,

    /// Pattern for --filename-format custom; uses {name}, {date}, {timestamp}.
    #[arg(long, env = "MD2PDF_NAME_PATTERN")]
    name_pattern: Option<String>,

    /// Abort after the wave containing the first failure.
    #[arg(long, env = "MD2PDF_FAIL_FAST")]
    fail_fast: bool,

    /// Replace existing PDFs instead of writing `name_N.pdf`.
    #[arg(long, env = "MD2PDF_OVERWRITE")]
    overwrite: bool,

    /// Engine command template.
    #[arg(long, env = "MD2PDF_ENGINE", default_value = "pandoc {input} -o {output}")]
    engine: String,

    /// Per-file engine timeout in seconds.
    #[arg(long, env = "MD2PDF_TIMEOUT", default_value_t = 120)]
    timeout: u64,

    /// Retries per failed file after the batch (0 disables recovery).
    #[arg(long, env = "MD2PDF_RETRIES", default_value_t = 3)]
    retries: u32,

    /// Linear backoff unit between retries, in milliseconds.
    #[arg(long, env = "MD2PDF_RETRY_DELAY_MS", default_value_t = 1000)]
    retry_delay: u64,

    /// Let system load shrink each wave.
    #[arg(long, env = "MD2PDF_ADAPTIVE")]
    adaptive: bool,

    /// Sample system resources in the background and report them at the end.
    #[arg(long, env = "MD2PDF_MONITOR")]
    monitor: bool,

    /// Print the run report as JSON on stdout.
    #[arg(long, env = "MD2PDF_JSON")]
    json: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "MD2PDF_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "MD2PDF_QUIET")]
    quiet: bool,

    /// Disable progress bar.
    #[arg(long, env = "MD2PDF_NO_PROGRESS")]
    no_progress: bool,
}

#[derive(clap::ValueEnum, Clone, Debug)]
enum FormatArg {
    Original,
    Timestamp,
    Date,
    Custom,
}

/// Everything `--json` prints.
#[derive(Serialize)]
struct JsonOutput<'a> {
    report: &'a BatchRunReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    recovery: Option<&'a RecoverySummary>,
    plan: &'a RecoveryPlan,
    suggestions: &'a RecoverySuggestions,
    #[serde(skip_serializing_if = "Option::is_none")]
    resources: Option<md2pdf_batch::ResourceReport>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar carries the per-file feedback; keep library INFO
    // lines out of its way unless asked for.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    // ── Configuration ────────────────────────────────────────────────────
    let config = build_config(&cli)?;
    let options = ConversionOptions {
        timeout_secs: cli.timeout,
        ..Default::default()
    };
    let strategy = RecoveryStrategy {
        max_retries: cli.retries,
        retry_delay_ms: cli.retry_delay,
        ..Default::default()
    };

    let converter =
        CommandConverter::from_template(&cli.engine).context("Invalid --engine template")?;
    let mut scheduler =
        BatchScheduler::new(Arc::new(converter)).with_recovery_strategy(strategy);

    let governor = if cli.adaptive || cli.monitor {
        let governor_config = GovernorConfig {
            disk_check_path: cli.output_dir.clone().unwrap_or_else(|| PathBuf::from(".")),
            ..Default::default()
        };
        let governor = Arc::new(
            ResourceGovernor::for_host(governor_config)
                .context("Cannot read system resources for --adaptive/--monitor")?,
        );
        if cli.monitor {
            governor.start_monitoring();
        }
        scheduler = scheduler.with_governor(Arc::clone(&governor));
        Some(governor)
    } else {
        None
    };

    if show_progress {
        let cb: ProgressCallback = CliProgressCallback::new();
        scheduler = scheduler.with_progress(cb);
    }

    // ── Discovery ────────────────────────────────────────────────────────
    let mut patterns = cli.inputs.clone();
    patterns.extend(cli.pattern.clone());
    if patterns.is_empty() {
        bail!("No inputs given: pass files, directories or --pattern");
    }
    let files = discover_all(&patterns, &config.exclude_patterns)
        .await
        .context("Failed to discover input files")?;
    if files.is_empty() {
        warn!("No input files match {}", patterns.join(", "));
        if !cli.quiet {
            eprintln!("{} No Markdown files matched {}", cyan("⚠"), patterns.join(", "));
        }
        return Ok(());
    }

    // ── Run ──────────────────────────────────────────────────────────────
    let (mut report, aborted) = match scheduler.run(files, &options, &config).await {
        Ok(report) => (report, None),
        Err(Md2PdfError::Aborted { error, report }) => (*report, Some(error)),
        Err(e) => return Err(e).context("Batch run failed"),
    };

    // ── Recover ──────────────────────────────────────────────────────────
    let coordinator = scheduler.recovery_coordinator();
    let plan = coordinator.plan(&report.errors, &config);
    let recovery = if cli.retries > 0 && aborted.is_none() && !plan.retryable_files.is_empty() {
        if !cli.quiet && !cli.json {
            eprintln!(
                "{} Retrying {} file(s) (up to {} attempts each)…",
                cyan("◆"),
                plan.retryable_files.len(),
                cli.retries
            );
        }
        Some(scheduler.recover(&mut report, &options).await)
    } else {
        None
    };
    let suggestions = coordinator.suggest(&report.errors);

    let resources = governor.as_ref().map(|g| {
        g.stop_monitoring();
        g.resource_report()
    });

    // ── Output ───────────────────────────────────────────────────────────
    if cli.json {
        let out = JsonOutput {
            report: &report,
            recovery: recovery.as_ref(),
            plan: &plan,
            suggestions: &suggestions,
            resources,
        };
        println!(
            "{}",
            serde_json::to_string_pretty(&out).context("Failed to serialise report")?
        );
    } else if !cli.quiet {
        print_summary(&report, recovery.as_ref(), &plan, &suggestions);
        if cli.monitor {
            if let Some(r) = &resources {
                eprintln!(
                    "{}",
                    dim(&format!(
                        "resources: {} samples, memory avg {:.1}% / peak {:.1}%, load avg {:.1}%, {} warning(s)",
                        r.samples,
                        r.average_memory_pct,
                        r.peak_memory_pct,
                        r.average_cpu_pct,
                        r.recent_warnings.len()
                    ))
                );
            }
        }
    }

    if let Some(error) = aborted {
        eprintln!("{} Aborted: {}", red("✘"), error);
        std::process::exit(1);
    }
    if report.has_failures() {
        std::process::exit(1);
    }
    Ok(())
}

fn build_config(cli: &Cli) -> Result<BatchRunConfig> {
    let filename_format = match cli.filename_format {
        FormatArg::Original => FilenameFormat::Original,
        FormatArg::Timestamp => FilenameFormat::WithTimestamp,
        FormatArg::Date => FilenameFormat::WithDate,
        FormatArg::Custom => {
            let pattern = cli
                .name_pattern
                .clone()
                .context("--filename-format custom requires --name-pattern")?;
            FilenameFormat::Custom(pattern)
        }
    };

    let mut builder = BatchRunConfig::builder()
        .max_concurrency(cli.concurrency)
        .continue_on_error(!cli.fail_fast)
        .preserve_directory_structure(cli.preserve_structure)
        .filename_format(filename_format)
        .overwrite_existing(cli.overwrite)
        .adaptive_concurrency(cli.adaptive);
    if let Some(dir) = &cli.output_dir {
        builder = builder.output_directory(dir);
    }
    if let Some(pattern) = &cli.pattern {
        builder = builder.input_pattern(pattern);
    }
    for glob in &cli.exclude {
        builder = builder.exclude_pattern(glob);
    }
    builder.build().context("Invalid configuration")
}

fn print_summary(
    report: &BatchRunReport,
    recovery: Option<&RecoverySummary>,
    plan: &RecoveryPlan,
    suggestions: &RecoverySuggestions,
) {
    let secs = report.processing_time_ms as f64 / 1000.0;
    if report.failed_files == 0 {
        eprintln!(
            "{} {} file(s) converted in {:.1}s",
            green("✔"),
            bold(&report.successful_files.to_string()),
            secs
        );
    } else {
        eprintln!(
            "{} {}/{} file(s) converted  ({} failed) in {:.1}s",
            if report.successful_files == 0 {
                red("✘")
            } else {
                cyan("⚠")
            },
            bold(&report.successful_files.to_string()),
            report.total_files,
            red(&report.failed_files.to_string()),
            secs
        );
        for e in &report.errors {
            eprintln!("  {} {}", red("✗"), e);
        }
    }

    if let Some(r) = recovery {
        if !r.recovered.is_empty() {
            eprintln!("{} {} file(s) recovered on retry", green("↻"), r.recovered.len());
        }
        if let Some(health) = &r.halted {
            eprintln!(
                "{} Recovery stopped, system unhealthy: {}",
                red("✘"),
                health.issues.join("; ")
            );
        }
    }

    if report.failed_files == 0 {
        return;
    }
    if let Some(n) = plan.config_suggestions.max_concurrency {
        eprintln!("{} Try --concurrency {}", cyan("→"), n);
    }
    if plan.config_suggestions.continue_on_error == Some(true) {
        eprintln!("{} Try running without --fail-fast", cyan("→"));
    }
    for (label, items) in [
        ("Now", &suggestions.immediate),
        ("Later", &suggestions.long_term),
        ("System", &suggestions.system_level),
    ] {
        for item in items {
            eprintln!("  {} {}", dim(&format!("{label:>6}:")), item);
        }
    }
}
