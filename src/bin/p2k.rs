//! CLI binary for pocket2kindle.
//!
//! A thin shim over the library crate that maps CLI flags and environment
//! variables to `RunConfig` plus the concrete collaborators, runs the
//! pipeline, and prints the result.

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use pocket2kindle::config::MAX_ARTICLE_COUNT;
use pocket2kindle::pipeline::convert::{lookup_binary, ExternalConverter};
use pocket2kindle::pipeline::embed::HttpAssetFetcher;
use pocket2kindle::pipeline::extract::ReadabilityExtractor;
use pocket2kindle::{
    Pipeline, PocketClient, ProgressCallback, RunConfig, RunProgressCallback, SmtpMailer,
    SmtpSettings, Stage,
};
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
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

/// Terminal progress callback: a bar counting delivered articles plus one
/// log line per article. Articles finish out of order, so start times are
/// keyed by title.
struct CliProgressCallback {
    bar: ProgressBar,
    start_times: Mutex<HashMap<String, Instant>>,
    failures: AtomicUsize,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(TICKS);
        bar.set_style(style);
        bar.set_prefix("Preparing");
        bar.set_message("Contacting Pocket…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            start_times: Mutex::new(HashMap::new()),
            failures: AtomicUsize::new(0),
        })
    }

    fn elapsed(&self, title: &str) -> String {
        let ms = self
            .start_times
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(title)
            .map(|t| t.elapsed().as_millis())
            .unwrap_or(0);
        dim(&format!("{:.1}s", ms as f64 / 1000.0))
    }
}

fn shorten(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        let head: String = s.chars().take(max - 1).collect();
        format!("{head}\u{2026}")
    } else {
        s.to_string()
    }
}

impl RunProgressCallback for CliProgressCallback {
    fn on_run_start(&self, quota: usize) {
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} articles  \
             ⏱ {elapsed_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);
        self.bar.set_length(quota as u64);
        self.bar.set_style(style);
        self.bar.set_prefix("Extracting");
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Collecting {quota} articles…"))
        ));
    }

    fn on_item_start(&self, title: &str) {
        self.start_times
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(title.to_string(), Instant::now());
        self.bar.set_message(shorten(title, 40));
    }

    fn on_document_ready(&self, title: &str, delivered: usize, _quota: usize) {
        self.bar.println(format!(
            "  {} {:>3}  {}  {}",
            green("✓"),
            delivered,
            shorten(title, 60),
            self.elapsed(title),
        ));
        // Overshoot can push past the bar length.
        if delivered as u64 > self.bar.length().unwrap_or(0) {
            self.bar.set_length(delivered as u64);
        }
        self.bar.set_position(delivered as u64);
    }

    fn on_item_failed(&self, title: &str, error: &str) {
        self.failures.fetch_add(1, Ordering::SeqCst);
        self.bar.println(format!(
            "  {}      {}  {}  {}",
            red("✗"),
            shorten(title, 40),
            red(&shorten(error, 80)),
            self.elapsed(title),
        ));
    }

    fn on_stage(&self, stage: Stage) {
        self.bar.set_prefix("Finishing");
        self.bar.set_message(stage.as_str());
    }

    fn on_run_complete(&self, documents: usize, assets: usize) {
        self.bar.finish_and_clear();
        let skipped = self.failures.load(Ordering::SeqCst);
        eprintln!(
            "{} {} articles, {} images{}",
            green("✔"),
            bold(&documents.to_string()),
            assets,
            if skipped > 0 {
                format!("  ({} skipped)", red(&skipped.to_string()))
            } else {
                String::new()
            }
        );
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Bundle the 10 newest unread articles into a MOBI in the current directory
  p2k

  # 20 articles, one minute budget, send to a Kindle and archive them
  p2k -c 20 -t 60 -k me@kindle.com -a

  # Plain EPUB, no calibre needed
  p2k --format epub -o ~/books

  # Keep the intermediate EPUB and the emailed file
  p2k -k me@kindle.com -d

ENVIRONMENT VARIABLES:
  POCKET_CONSUMER_KEY    Pocket application consumer key (required)
  POCKET_REQUEST_TOKEN   Pocket user access token (required)
  SMTP_SERVER            SMTP relay, host or host:port (required with --email)
  SMTP_USER              SMTP user, also the sender address (required with --email)
  SMTP_PASSWD            SMTP password (required with --email)
  RUST_LOG               Override log filter (e.g. pocket2kindle=debug)

SETUP:
  1. Register an app at https://getpocket.com/developer/ and authorise it.
  2. export POCKET_CONSUMER_KEY=... POCKET_REQUEST_TOKEN=...
  3. Install calibre for `ebook-convert` (not needed with --format epub).
"#;

/// Bundle your Pocket reading list into an offline e-book.
#[derive(Parser, Debug)]
#[command(
    name = "p2k",
    version,
    about = "Bundle your Pocket reading list into an offline e-book",
    long_about = "Fetch unread articles from Pocket, extract their readable content, embed \
their images and assemble an e-book, optionally converted with calibre, emailed to a Kindle \
and archived on Pocket afterwards.",
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Number of articles to bundle.
    #[arg(short = 'c', long = "count", env = "P2K_COUNT", default_value_t = 10,
          value_parser = clap::value_parser!(u64).range(1..=MAX_ARTICLE_COUNT as u64))]
    count: u64,

    /// Time budget for fetching articles and images, in seconds.
    #[arg(short, long, env = "P2K_TIMEOUT", default_value_t = 30,
          value_parser = clap::value_parser!(u64).range(1..))]
    timeout: u64,

    /// Keep the intermediate EPUB and the emailed file.
    #[arg(short = 'd', long)]
    retain_intermediates: bool,

    /// Email the book to this address (e.g. your Kindle inbox).
    #[arg(short = 'k', long, env = "P2K_EMAIL")]
    email: Option<String>,

    /// Archive the bundled articles on Pocket afterwards.
    #[arg(short, long)]
    archive: bool,

    /// Articles extracted concurrently (at most 64).
    #[arg(long, env = "P2K_CONCURRENCY", default_value_t = 4)]
    concurrency: usize,

    /// Directory for the generated files.
    #[arg(short, long, env = "P2K_OUTPUT_DIR", default_value = ".")]
    output_dir: PathBuf,

    /// Output format passed to the converter (mobi, azw3, …); `epub` skips conversion.
    #[arg(long, env = "P2K_FORMAT", default_value = "mobi")]
    format: String,

    /// Converter binary.
    #[arg(long, env = "P2K_CONVERTER", default_value = "ebook-convert")]
    converter: String,

    /// Book title (default: "Pocket articles DD/MM/YYYY HH:MM").
    #[arg(long)]
    title: Option<String>,

    /// Pocket consumer key.
    #[arg(long, env = "POCKET_CONSUMER_KEY", hide_env_values = true)]
    consumer_key: String,

    /// Pocket access token.
    #[arg(long, env = "POCKET_REQUEST_TOKEN", hide_env_values = true)]
    access_token: String,

    /// SMTP relay, `host` or `host:port`.
    #[arg(long, env = "SMTP_SERVER")]
    smtp_server: Option<String>,

    /// SMTP user.
    #[arg(long, env = "SMTP_USER")]
    smtp_user: Option<String>,

    /// SMTP password.
    #[arg(long, env = "SMTP_PASSWD", hide_env_values = true)]
    smtp_password: Option<String>,

    /// Disable progress bar.
    #[arg(long, env = "P2K_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "P2K_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "P2K_QUIET")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar replaces INFO-level logs when it is active.
    let show_progress = !cli.quiet && !cli.no_progress;
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

    // ── Build config ─────────────────────────────────────────────────────
    let progress_cb: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new() as Arc<dyn RunProgressCallback>)
    } else {
        None
    };
    let config = build_config(&cli, progress_cb)?;

    // ── Check external requirements before any network traffic ──────────
    if config.needs_conversion() {
        let path = lookup_binary(&config.converter_program)
            .context("Install calibre or pass --format epub")?;
        tracing::debug!("Using converter at {}", path.display());
    }

    let pocket = Arc::new(
        PocketClient::new(&cli.consumer_key, &cli.access_token)
            .context("Failed to create Pocket client")?,
    );
    let mut pipeline = Pipeline::new(
        config,
        pocket.clone(),
        Arc::new(
            ReadabilityExtractor::new(Duration::from_secs(cli.timeout.min(30)))
                .context("Failed to create HTTP client")?,
        ),
        Arc::new(
            HttpAssetFetcher::new(Duration::from_secs(10))
                .context("Failed to create HTTP client")?,
        ),
        Arc::new(ExternalConverter::new(&cli.converter)),
    );
    if cli.email.is_some() {
        let settings = smtp_settings(&cli)?;
        pipeline = pipeline.with_mailer(Arc::new(SmtpMailer::new(settings)));
    }
    if cli.archive {
        pipeline = pipeline.with_archiver(pocket);
    }

    // ── Ctrl-C cancels the whole run ─────────────────────────────────────
    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("{} interrupted, stopping…", red("✘"));
                shutdown.cancel();
            }
        });
    }

    // ── Run ──────────────────────────────────────────────────────────────
    let report = pipeline.run(&shutdown).await.context("Run failed")?;

    if !cli.quiet {
        if !show_progress {
            eprintln!(
                "Bundled {} articles ({} images) in {}ms",
                report.documents, report.assets, report.total_duration_ms
            );
        }
        if let Some(ref path) = report.output_path {
            eprintln!("   {}  {}", cyan("→"), bold(&path.display().to_string()));
        }
        if report.emailed {
            eprintln!(
                "   {}  sent to {}",
                green("✉"),
                cli.email.as_deref().unwrap_or_default()
            );
        }
        if report.archived > 0 {
            eprintln!("   {}", dim(&format!("{} items archived", report.archived)));
        }
    }

    Ok(())
}

/// Map CLI args to `RunConfig`.
fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<RunConfig> {
    let mut builder = RunConfig::builder()
        .article_count(cli.count as usize)
        .timeout_secs(cli.timeout)
        .concurrency(cli.concurrency)
        .retain_intermediates(cli.retain_intermediates)
        .archive_on_completion(cli.archive)
        .output_dir(cli.output_dir.clone())
        .output_format(cli.format.clone())
        .converter_program(cli.converter.clone());

    if let Some(ref email) = cli.email {
        builder = builder.destination_email(email.clone());
    }
    if let Some(ref title) = cli.title {
        builder = builder.book_title(title.clone());
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}

fn smtp_settings(cli: &Cli) -> Result<SmtpSettings> {
    let (Some(server), Some(user), Some(password)) =
        (&cli.smtp_server, &cli.smtp_user, &cli.smtp_password)
    else {
        anyhow::bail!("--email needs SMTP_SERVER, SMTP_USER and SMTP_PASSWD to be set");
    };
    SmtpSettings::new(server, user.clone(), password.clone()).context("Invalid SMTP settings")
}
