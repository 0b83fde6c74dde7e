//! Remote collection retriever: a lazy, paginated item stream.
//!
//! A single producer task walks the remote listing page by page and pushes
//! items one at a time into a small bounded channel. Consumers call
//! [`Retriever::next`], which races the channel against their cancellation
//! token.
//!
//! ```text
//!   source.fetch_page(offset, n) ──▶ producer ──[read_ahead]──▶ next()
//!        ▲          │ Err
//!        └─ backoff ┘   (same offset, forever)
//! ```
//!
//! The listing is treated as unbounded. The stream ends only when the
//! retriever is closed, its token is cancelled, every consumer is gone, or
//! the source explicitly reports exhaustion.

use crate::error::P2kError;
use crate::model::{ItemId, RemoteItem};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A paginated remote listing.
#[async_trait]
pub trait CollectionSource: Send + Sync {
    /// Fetch `count` items starting at `offset`.
    ///
    /// `Ok(None)` means the source knows there is nothing left.
    async fn fetch_page(
        &self,
        offset: usize,
        count: usize,
    ) -> Result<Option<Vec<RemoteItem>>, P2kError>;

    /// Extra `(label, href)` links rendered around the item's section.
    fn item_actions(&self, id: &ItemId) -> Vec<(String, String)> {
        let _ = id;
        Vec::new()
    }
}

/// Pagination and buffering settings.
#[derive(Debug, Clone, Copy)]
pub struct RetrieveOptions {
    pub page_size: usize,
    pub read_ahead: usize,
    pub backoff: Duration,
}

impl Default for RetrieveOptions {
    fn default() -> Self {
        Self {
            page_size: 10,
            read_ahead: 3,
            backoff: Duration::from_secs(5),
        }
    }
}

/// Lazily yields [`RemoteItem`]s from a [`CollectionSource`].
pub struct Retriever {
    rx: AsyncMutex<mpsc::Receiver<RemoteItem>>,
    stop: Arc<AtomicBool>,
    cancel: CancellationToken,
    producer: Mutex<Option<JoinHandle<()>>>,
}

impl Retriever {
    /// Start the producer task. It stops when `parent` is cancelled.
    pub fn spawn(
        source: Arc<dyn CollectionSource>,
        options: RetrieveOptions,
        parent: &CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel(options.read_ahead.max(1));
        let stop = Arc::new(AtomicBool::new(false));
        let cancel = parent.child_token();

        let producer = tokio::spawn(produce(
            source,
            options,
            tx,
            Arc::clone(&stop),
            cancel.clone(),
        ));

        Self {
            rx: AsyncMutex::new(rx),
            stop,
            cancel,
            producer: Mutex::new(Some(producer)),
        }
    }

    /// Next item, or `None` once `cancel` fires or the stream has ended.
    pub async fn next(&self, cancel: &CancellationToken) -> Option<RemoteItem> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            item = async { self.rx.lock().await.recv().await } => item,
        }
    }

    /// Ask the producer to stop. Items already buffered can still be read.
    pub fn close(&self) {
        self.stop.store(true, Ordering::Release);
        self.cancel.cancel();
    }

    /// Close and wait for the producer task to exit.
    pub async fn shutdown(&self) {
        self.close();
        let handle = self
            .producer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Retriever producer ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for Retriever {
    fn drop(&mut self) {
        self.close();
    }
}

/// Producer loop. Owns the only sender; the channel closes when it returns.
async fn produce(
    source: Arc<dyn CollectionSource>,
    options: RetrieveOptions,
    tx: mpsc::Sender<RemoteItem>,
    stop: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    let mut offset = 0usize;
    let mut seen: HashSet<ItemId> = HashSet::new();

    loop {
        let Some(page) = fetch_with_retry(source.as_ref(), offset, &options, &cancel).await else {
            debug!("Retriever cancelled at offset {}", offset);
            return;
        };
        let Some(items) = page else {
            info!("Remote collection exhausted after {} items", seen.len());
            return;
        };
        offset += options.page_size;

        if items.is_empty() {
            debug!("Empty page; next request at offset {}", offset);
            if !sleep_or_cancel(options.backoff, &cancel).await {
                return;
            }
            continue;
        }

        for item in items {
            if stop.load(Ordering::Acquire) {
                return;
            }
            if !seen.insert(item.id.clone()) {
                debug!(item_id = %item.id, "Skipping item already yielded");
                continue;
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                sent = tx.send(item) => {
                    if sent.is_err() {
                        // Every consumer is gone.
                        return;
                    }
                }
            }
        }
    }
}

/// Fetch one page, retrying the same offset after `backoff` until it
/// succeeds. `None` when cancelled.
async fn fetch_with_retry(
    source: &dyn CollectionSource,
    offset: usize,
    options: &RetrieveOptions,
    cancel: &CancellationToken,
) -> Option<Option<Vec<RemoteItem>>> {
    let mut attempt = 0u64;
    loop {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            r = source.fetch_page(offset, options.page_size) => r,
        };
        match result {
            Ok(page) => return Some(page),
            Err(e) => {
                attempt += 1;
                warn!(
                    "Failed to fetch page at offset {} (attempt {}). Trying again in {}ms: {}",
                    offset,
                    attempt,
                    options.backoff.as_millis(),
                    e
                );
                if !sleep_or_cancel(options.backoff, cancel).await {
                    return None;
                }
            }
        }
    }
}

/// Sleep for `d`; `false` if cancelled first.
async fn sleep_or_cancel(d: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(d) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ReadState;
    use std::sync::atomic::AtomicUsize;

    fn item(id: &str) -> RemoteItem {
        RemoteItem {
            id: ItemId::from(id),
            url: format!("https://example.com/{id}"),
            title: format!("Article {id}"),
            favorite: false,
            state: ReadState::Unread,
        }
    }

    /// Serves `items` in pages, then reports exhaustion.
    struct VecSource {
        items: Vec<RemoteItem>,
        failures_left: AtomicUsize,
        calls: Mutex<Vec<usize>>,
    }

    impl VecSource {
        fn new(items: Vec<RemoteItem>) -> Self {
            Self {
                items,
                failures_left: AtomicUsize::new(0),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl CollectionSource for VecSource {
        async fn fetch_page(
            &self,
            offset: usize,
            count: usize,
        ) -> Result<Option<Vec<RemoteItem>>, P2kError> {
            self.calls.lock().unwrap().push(offset);
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(P2kError::RemoteRequest {
                    endpoint: "get".into(),
                    reason: "503".into(),
                });
            }
            if offset >= self.items.len() {
                return Ok(None);
            }
            let end = (offset + count).min(self.items.len());
            Ok(Some(self.items[offset..end].to_vec()))
        }
    }

    /// Never ends: every page is full of fresh ids.
    struct EndlessSource;

    #[async_trait]
    impl CollectionSource for EndlessSource {
        async fn fetch_page(
            &self,
            offset: usize,
            count: usize,
        ) -> Result<Option<Vec<RemoteItem>>, P2kError> {
            Ok(Some(
                (offset..offset + count).map(|i| item(&i.to_string())).collect(),
            ))
        }
    }

    fn options(page_size: usize) -> RetrieveOptions {
        RetrieveOptions {
            page_size,
            read_ahead: 3,
            backoff: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn yields_every_item_across_pages_then_ends() {
        let items: Vec<_> = (0..7).map(|i| item(&i.to_string())).collect();
        let token = CancellationToken::new();
        let r = Retriever::spawn(Arc::new(VecSource::new(items)), options(3), &token);

        let mut got = Vec::new();
        while let Some(i) = r.next(&token).await {
            got.push(i.id.0);
        }
        assert_eq!(got, vec!["0", "1", "2", "3", "4", "5", "6"]);
        r.shutdown().await;
    }

    #[tokio::test]
    async fn duplicate_ids_are_yielded_once() {
        let items = vec![item("a"), item("b"), item("a"), item("c"), item("b")];
        let token = CancellationToken::new();
        let r = Retriever::spawn(Arc::new(VecSource::new(items)), options(2), &token);

        let mut got = Vec::new();
        while let Some(i) = r.next(&token).await {
            got.push(i.id.0);
        }
        assert_eq!(got, vec!["a", "b", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_page_is_retried_at_same_offset_after_backoff() {
        let source = Arc::new(VecSource::new(vec![item("x"), item("y")]));
        source.failures_left.store(2, Ordering::SeqCst);
        let token = CancellationToken::new();
        let started = tokio::time::Instant::now();
        let r = Retriever::spawn(source.clone(), options(10), &token);

        let first = r.next(&token).await.unwrap();
        assert_eq!(first.id.0, "x");
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert_eq!(&source.calls.lock().unwrap()[..3], &[0, 0, 0]);
    }

    #[tokio::test]
    async fn cancel_makes_next_return_none_and_producer_exit() {
        let token = CancellationToken::new();
        let r = Retriever::spawn(Arc::new(EndlessSource), options(5), &token);
        assert!(r.next(&token).await.is_some());

        token.cancel();
        assert!(r.next(&token).await.is_none());
        tokio::time::timeout(Duration::from_secs(1), r.shutdown())
            .await
            .expect("producer should exit promptly");
    }

    #[tokio::test]
    async fn close_stops_an_unbounded_listing() {
        let token = CancellationToken::new();
        let r = Retriever::spawn(Arc::new(EndlessSource), options(5), &token);
        for _ in 0..4 {
            assert!(r.next(&token).await.is_some());
        }
        r.close();
        // Drain whatever was buffered; the stream must then end.
        let mut drained = 0;
        while r.next(&token).await.is_some() {
            drained += 1;
            assert!(drained <= 3, "read-ahead exceeded channel capacity");
        }
        r.shutdown().await;
    }
}
