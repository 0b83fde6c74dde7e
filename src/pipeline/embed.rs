//! Image embedder: relocate a document's remote images into the book.
//!
//! Discovery and download overlap. A blocking task walks the parsed HTML
//! and feeds `src` values into a small channel; the embedder consumes the
//! channel, validates each reference, and keeps the downloads in flight
//! concurrently.
//!
//! ```text
//!  spawn_blocking(walk <img>) ──[16]──▶ resolve ─▶ dedup ─▶ fetch ─▶ book.add_asset
//!                                                                  └─▶ content.replace(raw, local)
//! ```
//!
//! ## When is a document done?
//!
//! Normally when discovery closes its channel and the last download lands.
//! Two backstops remain:
//!
//! - **Idle heartbeat**: on every heartbeat where nothing arrived and no
//!   download is in flight, an idle counter goes up. After
//!   `idle_threshold` consecutive idle beats discovery is treated as
//!   finished, i.e. `heartbeat × idle_threshold` after the last reference.
//! - **Per-document timeout**: whatever has been embedded by then stays;
//!   other references keep pointing at their remote location.
//!
//! Cancellation of the run token returns immediately, with the same
//! partial-result semantics as the timeout.

use crate::error::AssetError;
use crate::model::ImageReference;
use crate::pipeline::assemble::SharedBook;
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{FuturesUnordered, StreamExt};
use scraper::{Html, Selector};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

/// Extensions accepted as embeddable images.
pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "svg"];

/// Longer "extensions" are usually not extensions at all (`/v1.2/a.b3f9e2c1`).
const MAX_EXTENSION_LEN: usize = 5;

const DISCOVERY_BUFFER: usize = 16;

/// Outcome of one checked download: the absolute URL plus payload and extension.
type FetchResult = (Url, Result<(Vec<u8>, String), AssetError>);

/// Raw response of an image download.
#[derive(Debug, Clone)]
pub struct FetchedAsset {
    pub status: u16,
    pub bytes: Vec<u8>,
}

/// Downloads image payloads.
#[async_trait]
pub trait AssetFetcher: Send + Sync {
    async fn fetch(&self, url: &Url) -> Result<FetchedAsset, AssetError>;
}

/// `reqwest`-backed fetcher.
#[derive(Debug, Clone)]
pub struct HttpAssetFetcher {
    client: reqwest::Client,
}

impl HttpAssetFetcher {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("pocket2kindle/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl AssetFetcher for HttpAssetFetcher {
    async fn fetch(&self, url: &Url) -> Result<FetchedAsset, AssetError> {
        let failed = |e: reqwest::Error| AssetError::Fetch {
            url: url.to_string(),
            detail: e.to_string(),
        };
        let response = self.client.get(url.clone()).send().await.map_err(failed)?;
        let status = response.status().as_u16();
        let bytes = response.bytes().await.map_err(failed)?;
        Ok(FetchedAsset {
            status,
            bytes: bytes.to_vec(),
        })
    }
}

/// Lower-cased extension of the last path segment, ignoring the query.
///
/// `None` when the segment has no dot or the suffix is longer than five
/// characters.
pub fn infer_extension(url: &Url) -> Option<String> {
    let segment = url.path_segments()?.next_back()?;
    let (_, ext) = segment.rsplit_once('.')?;
    if ext.is_empty() || ext.len() > MAX_EXTENSION_LEN {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

pub fn is_image_extension(ext: &str) -> bool {
    IMAGE_EXTENSIONS.iter().any(|e| e.eq_ignore_ascii_case(ext))
}

/// Walk `content` in document order and stream the first `src` of every
/// `<img>`. The channel closes when the walk is done.
pub fn discover_images(content: String) -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(DISCOVERY_BUFFER);
    tokio::task::spawn_blocking(move || {
        let Ok(selector) = Selector::parse("img") else {
            return;
        };
        let fragment = Html::parse_fragment(&content);
        for element in fragment.select(&selector) {
            let Some(src) = element.value().attr("src") else {
                continue;
            };
            if src.trim().is_empty() {
                continue;
            }
            if tx.blocking_send(src.to_string()).is_err() {
                // Embedder gave up on this document.
                return;
            }
        }
    });
    rx
}

/// Result of embedding one document.
#[derive(Debug, Clone)]
pub struct EmbedOutcome {
    /// Content with every embedded reference rewritten to its local name.
    pub content: String,
    pub embedded: usize,
    pub rejected: usize,
    /// Cancelled or timed out before all references were settled.
    pub interrupted: bool,
}

/// Embeds the images of one document at a time into a shared [`SharedBook`].
pub struct ImageEmbedder {
    fetcher: Arc<dyn AssetFetcher>,
    heartbeat: Duration,
    idle_threshold: u32,
    document_timeout: Duration,
}

impl ImageEmbedder {
    pub fn new(
        fetcher: Arc<dyn AssetFetcher>,
        heartbeat: Duration,
        idle_threshold: u32,
        document_timeout: Duration,
    ) -> Self {
        Self {
            fetcher,
            heartbeat,
            idle_threshold: idle_threshold.max(1),
            document_timeout,
        }
    }

    /// Discover, download and embed the images of `content`.
    pub async fn embed(
        &self,
        content: String,
        base: Option<&Url>,
        book: &SharedBook,
        cancel: &CancellationToken,
    ) -> EmbedOutcome {
        let discovered = discover_images(content.clone());
        self.embed_from(content, base, discovered, book, cancel).await
    }

    /// Like [`embed`](Self::embed), with references supplied by the caller.
    pub async fn embed_from(
        &self,
        mut content: String,
        base: Option<&Url>,
        mut discovered: mpsc::Receiver<String>,
        book: &SharedBook,
        cancel: &CancellationToken,
    ) -> EmbedOutcome {
        let timeout = sleep_until(Instant::now() + self.document_timeout);
        tokio::pin!(timeout);
        let mut ticker = interval_at(Instant::now() + self.heartbeat, self.heartbeat);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut refs = References::default();
        let mut in_flight: FuturesUnordered<BoxFuture<'_, FetchResult>> = FuturesUnordered::new();
        let mut discovering = true;
        let mut idle = 0u32;
        let mut embedded = 0usize;
        let mut rejected = 0usize;
        let mut interrupted = false;

        while discovering || !in_flight.is_empty() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("Image embedding cancelled");
                    interrupted = true;
                    break;
                }
                _ = &mut timeout => {
                    warn!(
                        "Image embedding timed out after {}s; {} downloads abandoned",
                        self.document_timeout.as_secs(),
                        in_flight.len()
                    );
                    interrupted = true;
                    break;
                }
                Some((absolute, result)) = in_flight.next(), if !in_flight.is_empty() => {
                    match result {
                        Ok((payload, extension)) => {
                            let local = book
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .add_asset(absolute.as_str(), payload, &extension);
                            for raw in refs.embedded(&absolute, &local) {
                                replace_reference(&mut content, &raw, &local);
                            }
                            debug!(url = %absolute, local = %local, "Embedded image");
                            embedded += 1;
                        }
                        Err(e) => {
                            warn!("Skipping image: {}", e);
                            refs.rejected(&absolute);
                            rejected += 1;
                        }
                    }
                }
                raw = discovered.recv(), if discovering => {
                    let Some(raw) = raw else {
                        discovering = false;
                        continue;
                    };
                    idle = 0;
                    ticker.reset();
                    let reference = match ImageReference::resolve(&raw, base) {
                        Ok(r) => r,
                        Err(e) => {
                            let e = AssetError::InvalidReference {
                                reference: raw,
                                detail: e.to_string(),
                            };
                            warn!("Skipping image: {}", e);
                            rejected += 1;
                            continue;
                        }
                    };
                    match refs.observe(&reference) {
                        Observed::New => {
                            in_flight.push(self.fetch_checked(reference.absolute).boxed())
                        }
                        Observed::AlreadyEmbedded(local) => {
                            replace_reference(&mut content, &reference.raw, &local);
                        }
                        Observed::Settled => {}
                    }
                }
                _ = ticker.tick(), if discovering => {
                    if in_flight.is_empty() {
                        idle += 1;
                        if idle >= self.idle_threshold {
                            debug!("Image discovery idle for {} heartbeats", idle);
                            discovering = false;
                        }
                    } else {
                        idle = 0;
                    }
                }
            }
        }

        EmbedOutcome {
            content,
            embedded,
            rejected,
            interrupted,
        }
    }

    /// Validate the extension, download, then validate the status.
    async fn fetch_checked(&self, url: Url) -> FetchResult {
        let result = async {
            let extension = infer_extension(&url).ok_or_else(|| AssetError::NoExtension {
                url: url.to_string(),
            })?;
            if !is_image_extension(&extension) {
                return Err(AssetError::UnsupportedType {
                    url: url.to_string(),
                    extension,
                });
            }
            let fetched = self.fetcher.fetch(&url).await?;
            if !(200..400).contains(&fetched.status) {
                return Err(AssetError::Status {
                    url: url.to_string(),
                    status: fetched.status,
                });
            }
            Ok((fetched.bytes, extension))
        }
        .await;
        (url, result)
    }
}

/// Replace every literal occurrence of `raw`, including its `&amp;`-escaped
/// form as serialised inside attributes.
fn replace_reference(content: &mut String, raw: &str, local: &str) {
    *content = content.replace(raw, local);
    if raw.contains('&') {
        let escaped = raw.replace('&', "&amp;");
        *content = content.replace(&escaped, local);
    }
}

// ── Per-document reference bookkeeping ───────────────────────────────────

enum RefState {
    Pending(Vec<String>),
    Embedded {
        local: String,
        aliases: HashSet<String>,
    },
    Rejected,
}

enum Observed {
    New,
    AlreadyEmbedded(String),
    Settled,
}

/// Tracks each absolute URL and the raw spellings that point at it.
#[derive(Default)]
struct References {
    by_url: HashMap<Url, RefState>,
}

impl References {
    fn observe(&mut self, reference: &ImageReference) -> Observed {
        let raw = &reference.raw;
        match self.by_url.get_mut(&reference.absolute) {
            None => {
                self.by_url.insert(
                    reference.absolute.clone(),
                    RefState::Pending(vec![raw.clone()]),
                );
                Observed::New
            }
            Some(RefState::Pending(aliases)) => {
                if !aliases.contains(raw) {
                    aliases.push(raw.clone());
                }
                Observed::Settled
            }
            Some(RefState::Embedded { local, aliases }) => {
                if aliases.insert(raw.clone()) {
                    Observed::AlreadyEmbedded(local.clone())
                } else {
                    Observed::Settled
                }
            }
            Some(RefState::Rejected) => Observed::Settled,
        }
    }

    /// Mark `url` embedded; returns the raw spellings to rewrite.
    fn embedded(&mut self, url: &Url, local: &str) -> Vec<String> {
        let aliases = match self.by_url.remove(url) {
            Some(RefState::Pending(aliases)) => aliases,
            _ => Vec::new(),
        };
        self.by_url.insert(
            url.clone(),
            RefState::Embedded {
                local: local.to_string(),
                aliases: aliases.iter().cloned().collect(),
            },
        );
        aliases
    }

    fn rejected(&mut self, url: &Url) {
        self.by_url.insert(url.clone(), RefState::Rejected);
    }
}
