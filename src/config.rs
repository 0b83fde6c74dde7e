//! Configuration types for a reading-list-to-e-book run.
//!
//! Every knob lives in [`RunConfig`], built via [`RunConfigBuilder`].
//! Credentials are deliberately *not* part of it: they belong to the
//! collaborators that use them ([`crate::pocket::PocketClient`],
//! [`crate::mail::SmtpSettings`]), so a config can be logged or cloned freely.

use crate::error::P2kError;
use crate::progress::ProgressCallback;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Largest accepted quota.
pub const MAX_ARTICLE_COUNT: usize = 500;

/// Largest number of extraction workers.
pub const MAX_CONCURRENCY: usize = 64;

/// Configuration for one run of the pipeline.
///
/// Built via [`RunConfig::builder()`] or using [`RunConfig::default()`].
///
/// # Example
/// ```rust
/// use pocket2kindle::RunConfig;
///
/// let config = RunConfig::builder()
///     .article_count(5)
///     .concurrency(3)
///     .timeout_secs(60)
///     .build()
///     .unwrap();
/// assert_eq!(config.article_count, 5);
/// ```
#[derive(Clone)]
pub struct RunConfig {
    /// Quota: number of articles to extract. Range: 1–500. Default: 10.
    ///
    /// The pool may deliver up to `concurrency - 1` more when workers already
    /// in flight finish after the quota is crossed.
    pub article_count: usize,

    /// Number of extraction workers kept active. Range: 1–64. Default: 4.
    pub concurrency: usize,

    /// Deadline for retrieval and extraction, in seconds. Default: 30.
    ///
    /// Image embedding is bounded per document by `image_timeout_secs` instead.
    pub timeout_secs: u64,

    /// Items requested per listing page. Default: 10.
    pub page_size: usize,

    /// Capacity of the retriever's item channel. Default: 3.
    ///
    /// Small on purpose: the listing is unbounded, so read-ahead is limited to
    /// what the workers are about to consume.
    pub read_ahead: usize,

    /// Wait between attempts at a failed listing page, in ms. Default: 5000.
    ///
    /// Failed pages are retried forever; only the run deadline stops them.
    pub retry_backoff_ms: u64,

    /// Per-article extraction timeout in seconds. Range: 10–30. Default: 20.
    pub extract_timeout_secs: u64,

    /// Heartbeat used by the image embedder to detect an idle discovery, in ms. Default: 1000.
    pub image_heartbeat_ms: u64,

    /// Consecutive idle heartbeats after which discovery is considered done. Default: 5.
    pub image_idle_heartbeats: u32,

    /// Hard per-document timeout for image embedding, in seconds. Default: 10.
    pub image_timeout_secs: u64,

    /// Keep the intermediate EPUB (and the emailed file) on disk. Default: false.
    pub retain_intermediates: bool,

    /// Send the converted book to this address (e.g. a Kindle inbox).
    pub destination_email: Option<String>,

    /// Archive every bundled item on the remote service after success. Default: false.
    pub archive_on_completion: bool,

    /// Directory receiving the EPUB and the converted file. Default: ".".
    pub output_dir: PathBuf,

    /// Target format passed to the converter as the output extension. Default: "mobi".
    ///
    /// `"epub"` skips conversion entirely and delivers the assembled EPUB.
    pub output_format: String,

    /// Converter binary. Default: "ebook-convert" (calibre).
    pub converter_program: String,

    /// Book title. If None, `Pocket articles DD/MM/YYYY HH:MM`.
    pub book_title: Option<String>,

    /// Book author. Default: "Some machine, somewhere".
    pub book_author: String,

    /// Custom section template. If None, uses [`crate::template::DEFAULT_SECTION_TEMPLATE`].
    pub section_template: Option<String>,

    /// Optional per-item progress events.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            article_count: 10,
            concurrency: 4,
            timeout_secs: 30,
            page_size: 10,
            read_ahead: 3,
            retry_backoff_ms: 5000,
            extract_timeout_secs: 20,
            image_heartbeat_ms: 1000,
            image_idle_heartbeats: 5,
            image_timeout_secs: 10,
            retain_intermediates: false,
            destination_email: None,
            archive_on_completion: false,
            output_dir: PathBuf::from("."),
            output_format: "mobi".to_string(),
            converter_program: "ebook-convert".to_string(),
            book_title: None,
            book_author: "Some machine, somewhere".to_string(),
            section_template: None,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for RunConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunConfig")
            .field("article_count", &self.article_count)
            .field("concurrency", &self.concurrency)
            .field("timeout_secs", &self.timeout_secs)
            .field("page_size", &self.page_size)
            .field("read_ahead", &self.read_ahead)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .field("extract_timeout_secs", &self.extract_timeout_secs)
            .field("image_heartbeat_ms", &self.image_heartbeat_ms)
            .field("image_idle_heartbeats", &self.image_idle_heartbeats)
            .field("image_timeout_secs", &self.image_timeout_secs)
            .field("retain_intermediates", &self.retain_intermediates)
            .field("destination_email", &self.destination_email)
            .field("archive_on_completion", &self.archive_on_completion)
            .field("output_dir", &self.output_dir)
            .field("output_format", &self.output_format)
            .field("converter_program", &self.converter_program)
            .field("book_title", &self.book_title)
            .field("book_author", &self.book_author)
            .field("section_template", &self.section_template)
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<dyn RunProgressCallback>"),
            )
            .finish()
    }
}

impl RunConfig {
    /// Create a new builder for `RunConfig`.
    pub fn builder() -> RunConfigBuilder {
        RunConfigBuilder {
            config: Self::default(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn extract_timeout(&self) -> Duration {
        Duration::from_secs(self.extract_timeout_secs)
    }

    pub fn image_heartbeat(&self) -> Duration {
        Duration::from_millis(self.image_heartbeat_ms)
    }

    pub fn image_timeout(&self) -> Duration {
        Duration::from_secs(self.image_timeout_secs)
    }

    /// Whether the assembled EPUB is handed to the external converter.
    pub fn needs_conversion(&self) -> bool {
        !self.output_format.eq_ignore_ascii_case("epub")
    }
}

/// Builder for [`RunConfig`].
#[derive(Debug)]
pub struct RunConfigBuilder {
    config: RunConfig,
}

impl RunConfigBuilder {
    pub fn article_count(mut self, n: usize) -> Self {
        self.config.article_count = n;
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.clamp(1, MAX_CONCURRENCY);
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.config.timeout_secs = secs;
        self
    }

    pub fn page_size(mut self, n: usize) -> Self {
        self.config.page_size = n.max(1);
        self
    }

    pub fn read_ahead(mut self, n: usize) -> Self {
        self.config.read_ahead = n.max(1);
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn extract_timeout_secs(mut self, secs: u64) -> Self {
        self.config.extract_timeout_secs = secs.clamp(10, 30);
        self
    }

    pub fn image_heartbeat_ms(mut self, ms: u64) -> Self {
        self.config.image_heartbeat_ms = ms.max(1);
        self
    }

    pub fn image_idle_heartbeats(mut self, n: u32) -> Self {
        self.config.image_idle_heartbeats = n.max(1);
        self
    }

    pub fn image_timeout_secs(mut self, secs: u64) -> Self {
        self.config.image_timeout_secs = secs;
        self
    }

    pub fn retain_intermediates(mut self, v: bool) -> Self {
        self.config.retain_intermediates = v;
        self
    }

    pub fn destination_email(mut self, address: impl Into<String>) -> Self {
        self.config.destination_email = Some(address.into());
        self
    }

    pub fn archive_on_completion(mut self, v: bool) -> Self {
        self.config.archive_on_completion = v;
        self
    }

    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.output_dir = dir.into();
        self
    }

    pub fn output_format(mut self, format: impl Into<String>) -> Self {
        self.config.output_format = format.into().trim_start_matches('.').to_lowercase();
        self
    }

    pub fn converter_program(mut self, program: impl Into<String>) -> Self {
        self.config.converter_program = program.into();
        self
    }

    pub fn book_title(mut self, title: impl Into<String>) -> Self {
        self.config.book_title = Some(title.into());
        self
    }

    pub fn book_author(mut self, author: impl Into<String>) -> Self {
        self.config.book_author = author.into();
        self
    }

    pub fn section_template(mut self, template: impl Into<String>) -> Self {
        self.config.section_template = Some(template.into());
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<RunConfig, P2kError> {
        let c = &self.config;
        if c.article_count == 0 || c.article_count > MAX_ARTICLE_COUNT {
            return Err(P2kError::InvalidConfig(format!(
                "Article count must be between 1 and {MAX_ARTICLE_COUNT}, got {}",
                c.article_count
            )));
        }
        if c.timeout_secs == 0 {
            return Err(P2kError::InvalidConfig("Timeout must be ≥ 1s".into()));
        }
        if c.output_format.is_empty() || c.output_format.contains(['/', '\\']) {
            return Err(P2kError::InvalidConfig(format!(
                "Invalid output format '{}'",
                c.output_format
            )));
        }
        if let Some(ref addr) = c.destination_email {
            if !addr.contains('@') {
                return Err(P2kError::InvalidConfig(format!(
                    "Invalid destination email '{addr}'"
                )));
            }
        }
        Ok(self.config)
    }
}
