//! Run orchestration: reading list → extracted articles → e-book → delivery.
//!
//! ## Stages
//!
//! ```text
//!  shutdown (Ctrl-C)
//!   ├─ deadline (timeout_secs)
//!   │    └─ Retriever ──▶ ExtractionPool      collect ≥ quota documents
//!   └─ embedding
//!        └─ ImageEmbedder (per document)      relocate images, render section
//!  Book ──▶ EPUB ──▶ converter ──▶ mail ──▶ archive
//! ```
//!
//! The deadline only bounds collection. Whatever was collected when it
//! fires is still assembled; nothing at all is an error. Each document then
//! gets its own image budget (`image_timeout_secs`).
//!
//! The stages after assembly run in order and stop at the first failure.
//! Side effects already performed (a written file, a sent email) are not
//! undone. Intermediate files are removed when [`Pipeline::run`] returns,
//! whatever the outcome, unless `retain_intermediates` is set.

use crate::config::RunConfig;
use crate::error::P2kError;
use crate::mail::Mailer;
use crate::model::{ExtractedDocument, ItemId, RunReport};
use crate::pipeline::assemble::{Book, SharedBook};
use crate::pipeline::convert::BookConverter;
use crate::pipeline::embed::{AssetFetcher, ImageEmbedder};
use crate::pipeline::extract::Extractor;
use crate::pipeline::pool::ExtractionPool;
use crate::pipeline::retrieve::{CollectionSource, RetrieveOptions, Retriever};
use crate::progress::Stage;
use crate::template::{render_section, DEFAULT_SECTION_TEMPLATE};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Marks delivered items as read on the remote service.
#[async_trait]
pub trait Archiver: Send + Sync {
    async fn archive(&self, ids: &[ItemId]) -> Result<(), P2kError>;
}

/// One configured run with all of its collaborators.
///
/// # Example
/// ```rust,no_run
/// use pocket2kindle::pipeline::{
///     convert::ExternalConverter, embed::HttpAssetFetcher, extract::ReadabilityExtractor,
/// };
/// use pocket2kindle::{Pipeline, PocketClient, RunConfig};
/// use std::sync::Arc;
/// use std::time::Duration;
/// use tokio_util::sync::CancellationToken;
///
/// # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
/// let config = RunConfig::builder().article_count(5).output_format("epub").build()?;
/// let pocket = Arc::new(PocketClient::from_env()?);
/// let pipeline = Pipeline::new(
///     config,
///     pocket.clone(),
///     Arc::new(ReadabilityExtractor::new(Duration::from_secs(20))?),
///     Arc::new(HttpAssetFetcher::new(Duration::from_secs(10))?),
///     Arc::new(ExternalConverter::new("ebook-convert")),
/// )
/// .with_archiver(pocket);
///
/// let report = pipeline.run(&CancellationToken::new()).await?;
/// println!("{} articles", report.documents);
/// # Ok(())
/// # }
/// ```
pub struct Pipeline {
    config: RunConfig,
    source: Arc<dyn CollectionSource>,
    extractor: Arc<dyn Extractor>,
    fetcher: Arc<dyn AssetFetcher>,
    converter: Arc<dyn BookConverter>,
    mailer: Option<Arc<dyn Mailer>>,
    archiver: Option<Arc<dyn Archiver>>,
}

impl Pipeline {
    pub fn new(
        config: RunConfig,
        source: Arc<dyn CollectionSource>,
        extractor: Arc<dyn Extractor>,
        fetcher: Arc<dyn AssetFetcher>,
        converter: Arc<dyn BookConverter>,
    ) -> Self {
        Self {
            config,
            source,
            extractor,
            fetcher,
            converter,
            mailer: None,
            archiver: None,
        }
    }

    /// Required when `destination_email` is set.
    pub fn with_mailer(mut self, mailer: Arc<dyn Mailer>) -> Self {
        self.mailer = Some(mailer);
        self
    }

    /// Required when `archive_on_completion` is set.
    pub fn with_archiver(mut self, archiver: Arc<dyn Archiver>) -> Self {
        self.archiver = Some(archiver);
        self
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Execute the run. Cancelling `shutdown` aborts it at the next stage
    /// boundary (and kills a running converter).
    pub async fn run(&self, shutdown: &CancellationToken) -> Result<RunReport, P2kError> {
        let total_start = Instant::now();
        let config = &self.config;
        let progress = config.progress_callback.clone();
        self.check_collaborators()?;

        info!(
            "Starting run: {} articles, {} workers, {}s deadline",
            config.article_count, config.concurrency, config.timeout_secs
        );
        if let Some(ref cb) = progress {
            cb.on_run_start(config.article_count);
        }

        // ── Step 1: Deadline scope ───────────────────────────────────────
        let deadline = shutdown.child_token();
        let timer_stop = CancellationToken::new();
        let timer_guard = timer_stop.clone().drop_guard();
        {
            let deadline = deadline.clone();
            let limit = config.timeout();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(limit) => {
                        info!("Run deadline of {}s reached", limit.as_secs());
                        deadline.cancel();
                    }
                    _ = timer_stop.cancelled() => {}
                    _ = deadline.cancelled() => {}
                }
            });
        }

        // ── Step 2: Retrieve + extract ───────────────────────────────────
        let retriever = Arc::new(Retriever::spawn(
            Arc::clone(&self.source),
            RetrieveOptions {
                page_size: config.page_size,
                read_ahead: config.read_ahead,
                backoff: config.retry_backoff(),
            },
            &deadline,
        ));
        let pool = ExtractionPool::new(
            Arc::clone(&self.extractor),
            config.article_count,
            config.concurrency,
            config.extract_timeout(),
        )
        .with_progress(progress.clone());
        let collected = pool.run(Arc::clone(&retriever), &deadline).await;
        retriever.shutdown().await;
        drop(timer_guard);

        if shutdown.is_cancelled() {
            return Err(P2kError::Cancelled { stage: "extraction" });
        }
        if collected.documents.is_empty() {
            return Err(P2kError::NoDocuments {
                secs: config.timeout_secs,
            });
        }
        info!("Collected {} documents", collected.documents.len());

        // ── Step 3: Embed images + render sections ───────────────────────
        if let Some(ref cb) = progress {
            cb.on_stage(Stage::Embedding);
        }
        let book = Book::new(self.book_title(), config.book_author.clone()).shared();
        let embedder = ImageEmbedder::new(
            Arc::clone(&self.fetcher),
            config.image_heartbeat(),
            config.image_idle_heartbeats,
            config.image_timeout(),
        );
        let embedding = shutdown.child_token();
        let template = config
            .section_template
            .as_deref()
            .unwrap_or(DEFAULT_SECTION_TEMPLATE);

        // Ordered: sections follow the collection order.
        let sections: Vec<(String, String)> = stream::iter(&collected.documents)
            .map(|doc| self.render_document(doc, &embedder, &book, template, &embedding))
            .buffered(config.concurrency)
            .collect()
            .await;

        if shutdown.is_cancelled() {
            return Err(P2kError::Cancelled { stage: "embedding" });
        }
        let mut book = Arc::try_unwrap(book)
            .map_err(|_| P2kError::Internal("book still shared after embedding".into()))?
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);
        for (title, body) in sections {
            book.add_section(title, body);
        }
        let documents = book.sections().len();
        let assets = book.assets().len();

        // ── Step 4: Assemble EPUB ────────────────────────────────────────
        if let Some(ref cb) = progress {
            cb.on_stage(Stage::Assembling);
        }
        let mut cleanup = Intermediates::new(config.retain_intermediates);
        tokio::fs::create_dir_all(&config.output_dir)
            .await
            .map_err(|source| P2kError::OutputWriteFailed {
                path: config.output_dir.clone(),
                source,
            })?;
        let epub_path = config
            .output_dir
            .join(format!("{}.epub", output_stem(&chrono::Local::now())));
        {
            let path = epub_path.clone();
            tokio::task::spawn_blocking(move || book.write_epub(&path))
                .await
                .map_err(|e| P2kError::Internal(format!("EPUB writer task: {e}")))??;
        }

        // ── Step 5: Convert ──────────────────────────────────────────────
        let output_path = if config.needs_conversion() {
            if let Some(ref cb) = progress {
                cb.on_stage(Stage::Converting);
            }
            cleanup.add(&epub_path);
            let output = epub_path.with_extension(&config.output_format);
            self.converter.convert(&epub_path, &output, shutdown).await?;
            output
        } else {
            epub_path.clone()
        };

        // ── Step 6: Deliver ──────────────────────────────────────────────
        let mut emailed = false;
        if let (Some(to), Some(mailer)) = (&config.destination_email, &self.mailer) {
            if let Some(ref cb) = progress {
                cb.on_stage(Stage::Sending);
            }
            // Removed afterwards even if sending fails.
            cleanup.add(&output_path);
            mailer.send(&output_path, to).await?;
            emailed = true;
            info!("Sent {} to {}", output_path.display(), to);
        }

        // ── Step 7: Archive ──────────────────────────────────────────────
        let mut archived = 0;
        if config.archive_on_completion {
            if let Some(ref archiver) = self.archiver {
                if let Some(ref cb) = progress {
                    cb.on_stage(Stage::Archiving);
                }
                archiver.archive(&collected.processed_ids).await?;
                archived = collected.processed_ids.len();
            }
        }

        let report = RunReport {
            documents,
            assets,
            output_path: cleanup.kept(&output_path),
            epub_path: cleanup.kept(&epub_path),
            emailed,
            archived,
            total_duration_ms: total_start.elapsed().as_millis() as u64,
        };
        info!(
            "Run complete: {} articles, {} images, {}ms",
            report.documents, report.assets, report.total_duration_ms
        );
        if let Some(ref cb) = progress {
            cb.on_run_complete(documents, assets);
        }
        Ok(report)
    }

    fn check_collaborators(&self) -> Result<(), P2kError> {
        if self.config.destination_email.is_some() && self.mailer.is_none() {
            return Err(P2kError::InvalidConfig(
                "A destination email is set but no mailer is configured".into(),
            ));
        }
        if self.config.archive_on_completion && self.archiver.is_none() {
            return Err(P2kError::InvalidConfig(
                "Archiving is enabled but no archiver is configured".into(),
            ));
        }
        Ok(())
    }

    fn book_title(&self) -> String {
        self.config
            .book_title
            .clone()
            .unwrap_or_else(|| default_title(&chrono::Local::now()))
    }

    async fn render_document(
        &self,
        doc: &ExtractedDocument,
        embedder: &ImageEmbedder,
        book: &SharedBook,
        template: &str,
        cancel: &CancellationToken,
    ) -> (String, String) {
        let outcome = embedder
            .embed(doc.content.clone(), Some(&doc.source_url), book, cancel)
            .await;
        debug!(
            item_id = %doc.item_id,
            "Embedded {} images ({} rejected{})",
            outcome.embedded,
            outcome.rejected,
            if outcome.interrupted { ", interrupted" } else { "" }
        );

        let mut actions = vec![("Source".to_string(), doc.source_url.to_string())];
        actions.extend(self.source.item_actions(&doc.item_id));
        let body = render_section(template, &doc.title, &actions, &outcome.content);
        (doc.title.clone(), body)
    }
}

/// `Pocket articles DD/MM/YYYY HH:MM`
pub fn default_title<Tz: chrono::TimeZone>(now: &chrono::DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    format!("Pocket articles {}", now.format("%d/%m/%Y %H:%M"))
}

fn output_stem<Tz: chrono::TimeZone>(now: &chrono::DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    format!("pocket-{}", now.format("%Y%m%d-%H%M%S"))
}

/// Files deleted when the run ends, unless retained.
struct Intermediates {
    retain: bool,
    paths: Vec<PathBuf>,
}

impl Intermediates {
    fn new(retain: bool) -> Self {
        Self {
            retain,
            paths: Vec::new(),
        }
    }

    fn add(&mut self, path: &Path) {
        if !self.paths.iter().any(|p| p == path) {
            self.paths.push(path.to_path_buf());
        }
    }

    /// `Some(path)` if `path` will still exist after the run.
    fn kept(&self, path: &Path) -> Option<PathBuf> {
        (self.retain || !self.paths.iter().any(|p| p == path)).then(|| path.to_path_buf())
    }
}

impl Drop for Intermediates {
    fn drop(&mut self) {
        if self.retain {
            return;
        }
        for path in &self.paths {
            match std::fs::remove_file(path) {
                Ok(()) => debug!("Removed {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Could not remove {}: {}", path.display(), e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn title_and_file_stem_formats() {
        let t = chrono::Utc.with_ymd_and_hms(2024, 3, 7, 9, 5, 30).unwrap();
        assert_eq!(default_title(&t), "Pocket articles 07/03/2024 09:05");
        assert_eq!(output_stem(&t), "pocket-20240307-090530");
    }

    #[test]
    fn intermediates_are_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let epub = dir.path().join("a.epub");
        let mobi = dir.path().join("a.mobi");
        std::fs::write(&epub, b"x").unwrap();
        std::fs::write(&mobi, b"y").unwrap();
        {
            let mut c = Intermediates::new(false);
            c.add(&epub);
            c.add(&epub);
            assert_eq!(c.kept(&epub), None);
            assert_eq!(c.kept(&mobi), Some(mobi.clone()));
        }
        assert!(!epub.exists());
        assert!(mobi.exists());
    }

    #[test]
    fn retained_intermediates_survive() {
        let dir = tempfile::tempdir().unwrap();
        let epub = dir.path().join("a.epub");
        std::fs::write(&epub, b"x").unwrap();
        {
            let mut c = Intermediates::new(true);
            c.add(&epub);
            assert_eq!(c.kept(&epub), Some(epub.clone()));
        }
        assert!(epub.exists());
    }
}
