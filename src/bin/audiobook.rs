//! CLI binary for edgequake-audiobook.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `PipelineConfig` and `Services` and prints results.

use anyhow::{Context, Result};
use clap::Parser;
use edgequake_audiobook::services::{CommandCapture, CommandSynthesizer, FfmpegEncoder, LlmRewriter};
use edgequake_audiobook::{
    cache_stats, clean_expired, discard_checkpoint, inspect, narrate, ChapterSelection, PipelineConfig,
    PipelineProgressCallback, ProgressCallback, RunReport, Services, Stage, Workspace,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

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

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress callback: one bar reused for every stage, with a log
/// line per finished stage and per failed segment. Segments may complete
/// out of order, so the bar only counts.
struct CliProgressCallback {
    bar: ProgressBar,
    errors: AtomicUsize,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(TICKS),
        );
        bar.set_prefix("Preparing");
        bar.set_message("Opening book…");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self {
            bar,
            errors: AtomicUsize::new(0),
        })
    }

    fn counting_style() -> ProgressStyle {
        ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>4}/{len} segments  \
             ⏱ {elapsed_precise}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS)
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl PipelineProgressCallback for CliProgressCallback {
    fn on_stage_start(&self, stage: Stage) {
        self.bar.set_prefix(stage.to_string());
        self.bar.set_position(0);
        self.bar.set_length(0);
        self.bar.set_message("working…");
        self.bar.reset_elapsed();
    }

    fn on_stage_complete(&self, stage: Stage, elapsed_ms: u64) {
        self.bar.println(format!(
            "  {} {:<13} {}",
            green("✓"),
            stage.to_string(),
            dim(&format!("{:.1}s", elapsed_ms as f64 / 1000.0)),
        ));
    }

    fn on_stage_skipped(&self, stage: Stage) {
        self.bar.println(format!(
            "  {} {:<13} {}",
            dim("↷"),
            stage.to_string(),
            dim("from checkpoint")
        ));
    }

    fn on_segment_complete(&self, _stage: Stage, _index: usize, total: usize) {
        if self.bar.length() != Some(total as u64) {
            self.bar.set_length(total as u64);
            self.bar.set_style(Self::counting_style());
            self.bar.reset_eta();
        }
        self.bar.inc(1);
    }

    fn on_segment_error(&self, stage: Stage, index: usize, total: usize, error: &str) {
        self.errors.fetch_add(1, Ordering::SeqCst);
        // Keep log lines on one terminal row.
        let msg: String = if error.chars().count() > 80 {
            let mut s: String = error.chars().take(79).collect();
            s.push('…');
            s
        } else {
            error.to_string()
        };
        self.bar.println(format!(
            "    {} {} {:>4}/{:<4}  {}",
            red("✗"),
            stage,
            index + 1,
            total,
            red(&msg)
        ));
        self.on_segment_complete(stage, index, total);
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Full run (resumes automatically if interrupted)
  audiobook book.epub \
    --tts-command "edge-tts -f {input} --write-media {output}" \
    --capture-command "record-page {page} {audio} {duration} {output}"

  # Show the table of contents (no services needed)
  audiobook --list-chapters book.epub

  # Only two chapters, no LLM rewriting
  audiobook --chapters np3,np4 --skip-rewrite book.epub --tts-command "..."

  # Stop after rewriting to review the narration text
  audiobook --stop-after rewriting book.epub

  # Start over, ignoring the previous checkpoint
  audiobook --fresh book.epub ...

  # Cache maintenance
  audiobook --cache-stats
  audiobook --clean-expired 14

COMMAND TEMPLATES:
  --tts-command      {input} text file, {output} audio file,
                     {timings} optional JSON sidecar with word timings
  --capture-command  {page} HTML file, {audio} narration (may be empty),
                     {duration} seconds, {output} video file,
                     {width} {height} {fps}

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          OpenAI API key
  ANTHROPIC_API_KEY       Anthropic API key
  GEMINI_API_KEY          Google Gemini API key
  EDGEQUAKE_LLM_PROVIDER  Override provider (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL         Override model ID
"#;

/// Turn EPUB books into narrated videos.
#[derive(Parser, Debug)]
#[command(
    name = "audiobook",
    version,
    about = "Turn EPUB books into narrated audiobook videos",
    long_about = "Turn EPUB books (local files or URLs) into narrated videos: each paragraph is \
rewritten for narration by an LLM, synthesised by a TTS program, rendered as a page with word \
highlighting, recorded, and joined into chapter videos with ffmpeg. Runs resume from the last \
completed stage and reuse every cached result.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Local EPUB file path or HTTP/HTTPS URL.
    #[arg(required_unless_present_any = ["clean_expired", "cache_stats"])]
    input: Option<String>,

    /// Print the table of contents and exit.
    #[arg(long)]
    list_chapters: bool,

    /// Narrate only these chapter ids (see --list-chapters).
    #[arg(long, env = "AUDIOBOOK_CHAPTERS")]
    chapters: Option<String>,

    /// Maximum characters per segment.
    #[arg(long, env = "AUDIOBOOK_MAX_CHARS", default_value_t = 500)]
    max_chars: usize,

    /// Number of concurrent rewrite / speech calls.
    #[arg(short, long, env = "AUDIOBOOK_CONCURRENCY", default_value_t = 10)]
    concurrency: usize,

    /// Background music mixed under the whole-book video.
    #[arg(long, env = "AUDIOBOOK_BGM")]
    bgm: Option<PathBuf>,

    /// Ignore and do not fill the cache.
    #[arg(long, env = "AUDIOBOOK_NO_CACHE")]
    no_cache: bool,

    /// Discard the book's checkpoint and start from the first stage.
    #[arg(long)]
    fresh: bool,

    /// Narrate the original text without LLM rewriting.
    #[arg(long, env = "AUDIOBOOK_SKIP_REWRITE")]
    skip_rewrite: bool,

    /// Stop after this stage (navigation, extraction, segmentation, rewriting,
    /// speech, rendering, capture, encoding).
    #[arg(long, value_parser = parse_stage)]
    stop_after: Option<Stage>,

    /// Root of caches, checkpoints and intermediate files.
    #[arg(long, env = "AUDIOBOOK_DATA_DIR", default_value = "data")]
    data_dir: PathBuf,

    /// Where final videos are written. Default: <data-dir>/outputs.
    #[arg(long, env = "AUDIOBOOK_OUTPUT_DIR")]
    output_dir: Option<PathBuf>,

    /// LLM provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// LLM model ID (e.g. gpt-4.1-nano, gpt-4.1-mini).
    #[arg(long, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// Speech synthesis command template.
    #[arg(long, env = "AUDIOBOOK_TTS_COMMAND")]
    tts_command: Option<String>,

    /// Page capture command template.
    #[arg(long, env = "AUDIOBOOK_CAPTURE_COMMAND")]
    capture_command: Option<String>,

    /// Remove scopes not used for DAYS days (default 30) and exit.
    #[arg(long, value_name = "DAYS", num_args = 0..=1)]
    clean_expired: Option<Option<u32>>,

    /// Print cache statistics and exit.
    #[arg(long)]
    cache_stats: bool,

    /// Output structured JSON instead of text.
    #[arg(long, env = "AUDIOBOOK_JSON")]
    json: bool,

    /// Disable progress bar.
    #[arg(long, env = "AUDIOBOOK_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "AUDIOBOOK_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "AUDIOBOOK_QUIET")]
    quiet: bool,
}

fn parse_stage(s: &str) -> Result<Stage, String> {
    s.parse()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // Suppress INFO-level library logs when the progress bar is active;
    // the bar provides all the feedback that matters to the user.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json && !cli.list_chapters;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_writer(io::stderr)
        .init();

    let workspace = Workspace::new(cli.data_dir.clone(), cli.output_dir.clone());

    // ── Maintenance modes ────────────────────────────────────────────────
    if let Some(days) = cli.clean_expired {
        let days = days.unwrap_or(PipelineConfig::default().cache_max_age_days);
        let removed = clean_expired(&workspace, days).context("Failed to clean expired scopes")?;
        if cli.json {
            println!("{}", serde_json::json!({ "removed_scopes": removed }));
        } else if !cli.quiet {
            eprintln!("{} Removed {} scopes unused for {} days", green("✔"), removed, days);
        }
        return Ok(());
    }
    if cli.cache_stats {
        let stats = cache_stats(&workspace).await.context("Failed to read cache")?;
        if cli.json {
            println!("{}", serde_json::to_string_pretty(&stats).context("Failed to serialise stats")?);
        } else {
            println!("Books:        {}", stats.books);
            for ns in &stats.namespaces {
                println!("{:<13} {:>6} entries  {:>10} bytes", format!("{}:", ns.namespace), ns.entries, ns.bytes);
            }
        }
        return Ok(());
    }

    let input = cli.input.clone().context("An input book is required")?;

    // ── Table of contents ────────────────────────────────────────────────
    if cli.list_chapters {
        let overview = inspect(&input).await.context("Failed to inspect book")?;
        if cli.json {
            println!("{}", serde_json::to_string_pretty(&overview).context("Failed to serialise overview")?);
        } else {
            println!("File:    {}", input);
            if let Some(ref t) = overview.title {
                println!("Title:   {}", t);
            }
            if let Some(ref a) = overview.author {
                println!("Author:  {}", a);
            }
            println!("Source:  {:?}\n", overview.navigation.source);
            for entry in &overview.entries {
                let target = match &entry.fragment_id {
                    Some(f) => format!("{}#{}", entry.source_file, f),
                    None => entry.source_file.clone(),
                };
                println!(
                    "{}{:<14} {}  {}",
                    "  ".repeat(entry.level),
                    entry.id,
                    entry.title,
                    dim(&target)
                );
            }
        }
        return Ok(());
    }

    // ── Build config and services ────────────────────────────────────────
    let progress = show_progress.then(CliProgressCallback::new);
    let config = build_config(&cli, progress.clone().map(|p| p as ProgressCallback))?;

    if cli.fresh && discard_checkpoint(&input, &config).context("Failed to discard checkpoint")? && !cli.quiet {
        eprintln!("{} Previous checkpoint discarded", cyan("◆"));
    }
    let services = build_services(&cli)?;

    // ── Run ──────────────────────────────────────────────────────────────
    let result = narrate(&input, &config, &services).await;
    if let Some(ref p) = progress {
        p.finish();
    }
    let report = result.context("Narration failed")?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report).context("Failed to serialise report")?);
    } else if !cli.quiet {
        print_summary(&report);
    }
    Ok(())
}

fn print_summary(report: &RunReport) {
    if let Some(stage) = report.resumed_from {
        eprintln!("{} Resumed scope {} after {}", cyan("◆"), report.scope_id, stage);
    }
    for (stage, failed) in report.failures.iter().filter(|(_, n)| **n > 0) {
        eprintln!("  {} {}: {} segments fell back to defaults", cyan("⚠"), stage, failed);
    }
    match &report.output {
        Some(path) => eprintln!(
            "{}  {} chapters  {}ms  →  {}",
            if report.failure_count() == 0 { green("✔") } else { cyan("⚠") },
            report.chapter_videos.len(),
            report.duration_ms,
            bold(&path.display().to_string()),
        ),
        None => eprintln!(
            "{}  stopped after {}  (scope {}, {}ms)",
            green("✔"),
            report
                .completed
                .last()
                .or(report.resumed_from.as_ref())
                .map(|s| s.to_string())
                .unwrap_or_else(|| "nothing".into()),
            report.scope_id,
            report.duration_ms
        ),
    }
}

/// Map CLI args to `PipelineConfig`.
fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<PipelineConfig> {
    let mut builder = PipelineConfig::builder()
        .data_dir(cli.data_dir.clone())
        .max_segment_chars(cli.max_chars)
        .concurrency(cli.concurrency)
        .cache_enabled(!cli.no_cache)
        .skip_rewriting(cli.skip_rewrite);

    if let Some(ref dir) = cli.output_dir {
        builder = builder.output_dir(dir.clone());
    }
    if let Some(ref list) = cli.chapters {
        builder = builder.selection(ChapterSelection::parse_list(list));
    }
    if let Some(stage) = cli.stop_after {
        builder = builder.stop_after(stage);
    }
    if let Some(ref bgm) = cli.bgm {
        builder = builder.background_audio(bgm.clone());
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }
    builder.build().context("Invalid configuration")
}

/// Collaborators from CLI args. A rewriter that cannot be created is left
/// out; the rewriting stage then reports what is missing.
fn build_services(cli: &Cli) -> Result<Services> {
    let mut services = Services::new().encoder(Arc::new(FfmpegEncoder::new()));

    if !cli.skip_rewrite {
        match LlmRewriter::from_env(cli.provider.as_deref(), cli.model.as_deref()) {
            Ok(rewriter) => services = services.rewriter(Arc::new(rewriter)),
            Err(e) => {
                if !cli.quiet {
                    eprintln!("{} {}", red("✗"), e);
                }
            }
        }
    }
    if let Some(ref template) = cli.tts_command {
        let tts = CommandSynthesizer::new(template).context("Invalid --tts-command")?;
        services = services.synthesizer(Arc::new(tts));
    }
    if let Some(ref template) = cli.capture_command {
        let capture = CommandCapture::new(template).context("Invalid --capture-command")?;
        services = services.capture(Arc::new(capture));
    }
    Ok(services)
}
