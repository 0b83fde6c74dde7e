//! Bounded extraction pool: K workers pulling from the retriever until the
//! quota is met.
//!
//! ## Why persistent workers?
//!
//! Each worker is a loop: check the shared success counter, pull one item,
//! extract it, publish the document, repeat. A worker that finishes (or
//! fails) goes straight back to the retriever, which is exactly the
//! "replace yourself" behaviour of a self-replenishing pool without paying
//! for a task spawn per item. K tasks stay active until the quota is met,
//! the retriever runs dry, or the run is cancelled.
//!
//! ## Overshoot
//!
//! The counter is only checked *before* a pull. A worker that is already
//! mid-extraction when the counter reaches `quota` still publishes, so the
//! pool delivers between `quota` and `quota + K - 1` documents when enough
//! items are available. Workers parked on an empty retriever are woken by
//! the quota token instead, since a listing may never report its end.
//!
//! ```text
//!            ┌─ worker 0 ─┐
//! retriever ─┼─ worker 1 ─┼──[quota + K]──▶ collector ──▶ PoolOutput
//!            └─ worker K ─┘        ▲
//!                 delivered: AtomicUsize
//! ```

use crate::error::ItemError;
use crate::model::{ExtractedDocument, ItemId, RemoteItem};
use crate::pipeline::extract::Extractor;
use crate::pipeline::retrieve::Retriever;
use crate::progress::ProgressCallback;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

/// Upper bound on the result channel; the collector drains it concurrently.
const MAX_RESULT_BUFFER: usize = 1024;

/// What the pool collected before it stopped.
#[derive(Debug, Default)]
pub struct PoolOutput {
    /// Documents in the order they were published.
    pub documents: Vec<ExtractedDocument>,
    /// Ids of every successfully extracted item, for bulk archiving.
    pub processed_ids: Vec<ItemId>,
}

/// Runs extraction with fixed parallelism up to a quota.
pub struct ExtractionPool {
    extractor: Arc<dyn Extractor>,
    quota: usize,
    concurrency: usize,
    extract_timeout: Duration,
    progress: Option<ProgressCallback>,
}

impl ExtractionPool {
    pub fn new(
        extractor: Arc<dyn Extractor>,
        quota: usize,
        concurrency: usize,
        extract_timeout: Duration,
    ) -> Self {
        Self {
            extractor,
            quota,
            concurrency: concurrency.max(1),
            extract_timeout,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: Option<ProgressCallback>) -> Self {
        self.progress = progress;
        self
    }

    /// Drive the workers until quota, exhaustion, or cancellation.
    ///
    /// Always returns what was collected; cancellation is not an error here.
    /// The retriever is closed before returning.
    pub async fn run(&self, retriever: Arc<Retriever>, cancel: &CancellationToken) -> PoolOutput {
        let capacity = self
            .quota
            .saturating_add(self.concurrency)
            .clamp(1, MAX_RESULT_BUFFER);
        let (tx, mut rx) = mpsc::channel(capacity);
        let delivered = Arc::new(AtomicUsize::new(0));
        // Stops pulls once the quota is met; in-flight work still finishes.
        let quota_reached = cancel.child_token();
        let processed = Arc::new(Mutex::new(Vec::new()));

        info!(
            "Extracting {} articles with {} workers",
            self.quota, self.concurrency
        );

        let mut workers = JoinSet::new();
        for id in 0..self.concurrency {
            let worker = Worker {
                id,
                extractor: Arc::clone(&self.extractor),
                retriever: Arc::clone(&retriever),
                tx: tx.clone(),
                delivered: Arc::clone(&delivered),
                processed: Arc::clone(&processed),
                quota: self.quota,
                extract_timeout: self.extract_timeout,
                progress: self.progress.clone(),
                cancel: cancel.clone(),
                quota_reached: quota_reached.clone(),
            };
            workers.spawn(worker.run());
        }
        // Only the workers hold senders now; the channel closes when they exit.
        drop(tx);

        let mut documents = Vec::new();
        while let Some(doc) = rx.recv().await {
            documents.push(doc);
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                warn!("Extraction worker ended abnormally: {}", e);
            }
        }
        retriever.close();

        let processed_ids = std::mem::take(
            &mut *processed.lock().unwrap_or_else(PoisonError::into_inner),
        );
        if cancel.is_cancelled() {
            info!(
                "Extraction stopped by cancellation with {}/{} documents",
                documents.len(),
                self.quota
            );
        } else {
            info!("Extraction finished with {} documents", documents.len());
        }

        PoolOutput {
            documents,
            processed_ids,
        }
    }
}

struct Worker {
    id: usize,
    extractor: Arc<dyn Extractor>,
    retriever: Arc<Retriever>,
    tx: mpsc::Sender<ExtractedDocument>,
    delivered: Arc<AtomicUsize>,
    processed: Arc<Mutex<Vec<ItemId>>>,
    quota: usize,
    extract_timeout: Duration,
    progress: Option<ProgressCallback>,
    cancel: CancellationToken,
    quota_reached: CancellationToken,
}

impl Worker {
    async fn run(self) {
        loop {
            if self.delivered.load(Ordering::Acquire) >= self.quota {
                debug!(worker = self.id, "Quota reached");
                return;
            }
            let Some(item) = self.retriever.next(&self.quota_reached).await else {
                debug!(worker = self.id, "No more items");
                return;
            };

            let outcome = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                r = self.extract(&item) => r,
            };
            let doc = match outcome {
                Ok(doc) => doc,
                Err(e) => {
                    warn!(item_id = %item.id, "Skipping item: {}", e);
                    if let Some(ref cb) = self.progress {
                        cb.on_item_failed(&item.title, &e.to_string());
                    }
                    continue;
                }
            };

            let title = doc.title.clone();
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                sent = self.tx.send(doc) => {
                    if sent.is_err() {
                        return;
                    }
                }
            }

            self.processed
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(item.id.clone());
            let delivered = self.delivered.fetch_add(1, Ordering::AcqRel) + 1;
            debug!(worker = self.id, item_id = %item.id, "Extracted ({}/{})", delivered, self.quota);
            if delivered >= self.quota {
                self.quota_reached.cancel();
            }
            if let Some(ref cb) = self.progress {
                cb.on_document_ready(&title, delivered, self.quota);
            }
        }
    }

    async fn extract(&self, item: &RemoteItem) -> Result<ExtractedDocument, ItemError> {
        let url = Url::parse(&item.url).map_err(|e| ItemError::InvalidUrl {
            url: item.url.clone(),
            detail: e.to_string(),
        })?;
        if let Some(ref cb) = self.progress {
            cb.on_item_start(&item.title);
        }

        let article = tokio::time::timeout(self.extract_timeout, self.extractor.extract(&url))
            .await
            .map_err(|_| ItemError::Timeout {
                url: item.url.clone(),
                secs: self.extract_timeout.as_secs(),
            })??;

        let title = match item.title.trim() {
            "" => article
                .title
                .filter(|t| !t.trim().is_empty())
                .unwrap_or_else(|| url.to_string()),
            given => given.to_string(),
        };

        Ok(ExtractedDocument {
            item_id: item.id.clone(),
            title,
            content: article.content,
            source_url: url,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::P2kError;
    use crate::model::ReadState;
    use crate::pipeline::extract::Article;
    use crate::pipeline::retrieve::{CollectionSource, RetrieveOptions};
    use async_trait::async_trait;
    use std::collections::HashSet;

    struct ListSource(Vec<RemoteItem>);

    #[async_trait]
    impl CollectionSource for ListSource {
        async fn fetch_page(
            &self,
            offset: usize,
            count: usize,
        ) -> Result<Option<Vec<RemoteItem>>, P2kError> {
            if offset >= self.0.len() {
                return Ok(None);
            }
            let end = (offset + count).min(self.0.len());
            Ok(Some(self.0[offset..end].to_vec()))
        }
    }

    /// Serves its items once, then empty pages forever, like Pocket.
    struct EndlessSource(Vec<RemoteItem>);

    #[async_trait]
    impl CollectionSource for EndlessSource {
        async fn fetch_page(
            &self,
            offset: usize,
            count: usize,
        ) -> Result<Option<Vec<RemoteItem>>, P2kError> {
            let start = offset.min(self.0.len());
            let end = (offset + count).min(self.0.len());
            Ok(Some(self.0[start..end].to_vec()))
        }
    }

    fn items(urls: &[&str]) -> Vec<RemoteItem> {
        urls.iter()
            .enumerate()
            .map(|(i, url)| RemoteItem {
                id: ItemId(i.to_string()),
                url: url.to_string(),
                title: format!("Item {i}"),
                favorite: false,
                state: ReadState::Unread,
            })
            .collect()
    }

    fn numbered(n: usize) -> Vec<RemoteItem> {
        let urls: Vec<String> = (0..n).map(|i| format!("https://example.com/{i}")).collect();
        let refs: Vec<&str> = urls.iter().map(String::as_str).collect();
        items(&refs)
    }

    /// Succeeds unless the URL contains "bad"; URLs with "slow" never finish.
    struct FakeExtractor {
        delay: Duration,
    }

    #[async_trait]
    impl Extractor for FakeExtractor {
        async fn extract(&self, url: &Url) -> Result<Article, ItemError> {
            if url.as_str().contains("slow") {
                std::future::pending::<()>().await;
            }
            tokio::time::sleep(self.delay).await;
            if url.as_str().contains("bad") {
                return Err(ItemError::Extraction {
                    url: url.to_string(),
                    detail: "boom".into(),
                });
            }
            Ok(Article {
                title: Some("Extracted".into()),
                content: format!("<p>{url}</p>"),
            })
        }
    }

    fn retriever(items: Vec<RemoteItem>, token: &CancellationToken) -> Arc<Retriever> {
        let options = RetrieveOptions {
            page_size: 4,
            read_ahead: 3,
            backoff: Duration::from_millis(10),
        };
        Arc::new(Retriever::spawn(Arc::new(ListSource(items)), options, token))
    }

    fn pool(quota: usize, k: usize) -> ExtractionPool {
        let extractor = Arc::new(FakeExtractor {
            delay: Duration::from_millis(5),
        });
        ExtractionPool::new(extractor, quota, k, Duration::from_secs(10))
    }

    #[tokio::test]
    async fn delivers_between_quota_and_quota_plus_k_minus_one() {
        for k in 1..=4 {
            let token = CancellationToken::new();
            let out = pool(3, k).run(retriever(numbered(30), &token), &token).await;
            let n = out.documents.len();
            assert!((3..=3 + k - 1).contains(&n), "k={k}: got {n} documents");
            assert_eq!(out.processed_ids.len(), n);
        }
    }

    #[tokio::test]
    async fn quota_wakes_workers_parked_on_an_endless_listing() {
        let token = CancellationToken::new();
        let options = RetrieveOptions {
            page_size: 4,
            read_ahead: 3,
            backoff: Duration::from_millis(10),
        };
        let r = Arc::new(Retriever::spawn(
            Arc::new(EndlessSource(numbered(3))),
            options,
            &token,
        ));

        let started = std::time::Instant::now();
        let out = tokio::time::timeout(Duration::from_secs(2), pool(3, 2).run(r, &token))
            .await
            .expect("pool should stop once the quota is met");
        assert_eq!(out.documents.len(), 3);
        assert!(!token.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn failed_items_are_dropped_not_retried() {
        let token = CancellationToken::new();
        let list = items(&[
            "https://example.com/bad-1",
            "https://example.com/ok-1",
            "not a url",
            "https://example.com/bad-2",
            "https://example.com/ok-2",
        ]);
        let out = pool(10, 2).run(retriever(list, &token), &token).await;

        let ids: HashSet<_> = out.processed_ids.iter().map(|i| i.0.as_str()).collect();
        assert_eq!(ids, HashSet::from(["1", "4"]));
        assert!(out.documents.iter().all(|d| !d.source_url.as_str().contains("bad")));
    }

    #[tokio::test]
    async fn exhausted_source_drains_pool() {
        let token = CancellationToken::new();
        let out = pool(10, 3).run(retriever(numbered(2), &token), &token).await;
        assert_eq!(out.documents.len(), 2);
    }

    #[tokio::test]
    async fn item_title_wins_over_extracted_title() {
        let token = CancellationToken::new();
        let mut list = numbered(2);
        list[1].title = "  ".into();
        let out = pool(2, 1).run(retriever(list, &token), &token).await;

        let mut titles: Vec<_> = out.documents.iter().map(|d| d.title.as_str()).collect();
        titles.sort();
        assert_eq!(titles, vec!["Extracted", "Item 0"]);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_extraction_times_out() {
        let token = CancellationToken::new();
        let list = items(&["https://example.com/slow", "https://example.com/ok"]);
        let out = pool(5, 1).run(retriever(list, &token), &token).await;
        assert_eq!(out.documents.len(), 1);
        assert_eq!(out.processed_ids, vec![ItemId::from("1")]);
    }

    #[tokio::test]
    async fn cancel_before_quota_returns_promptly() {
        let token = CancellationToken::new();
        let list = items(&["https://example.com/slow-a", "https://example.com/slow-b"]);
        let r = retriever(list, &token);
        let p = pool(5, 2);

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let out = tokio::time::timeout(Duration::from_secs(2), p.run(r, &token))
            .await
            .expect("pool should stop on cancel");
        assert!(out.documents.is_empty());
    }
}
