//! Progress-callback trait for per-item run events.
//!
//! Inject an [`Arc<dyn RunProgressCallback>`] via
//! [`crate::config::RunConfigBuilder::progress_callback`] to receive events
//! as the pipeline retrieves, extracts, and bundles articles. The CLI uses it
//! to drive an `indicatif` progress bar; library users can forward events
//! anywhere else.
//!
//! Extraction workers run concurrently, so `on_item_start`,
//! `on_document_ready` and `on_item_failed` may be called from several tasks
//! at once. Implementations must protect shared mutable state themselves.

use std::sync::Arc;

/// Coarse pipeline stage, reported once each stage begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Embedding,
    Assembling,
    Converting,
    Sending,
    Archiving,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Embedding => "embedding images",
            Stage::Assembling => "assembling e-book",
            Stage::Converting => "converting",
            Stage::Sending => "sending email",
            Stage::Archiving => "archiving items",
        }
    }
}

/// Called by the pipeline as it processes items.
///
/// All methods have default no-op implementations so callers only override
/// what they care about.
pub trait RunProgressCallback: Send + Sync {
    /// Called once before any item is retrieved.
    fn on_run_start(&self, quota: usize) {
        let _ = quota;
    }

    /// Called when a worker picks up an item for extraction.
    fn on_item_start(&self, title: &str) {
        let _ = title;
    }

    /// Called when a document is published to the output channel.
    ///
    /// `delivered` is the success counter after this document.
    fn on_document_ready(&self, title: &str, delivered: usize, quota: usize) {
        let _ = (title, delivered, quota);
    }

    /// Called when an item is dropped.
    fn on_item_failed(&self, title: &str, error: &str) {
        let _ = (title, error);
    }

    /// Called when a post-collection stage begins.
    fn on_stage(&self, stage: Stage) {
        let _ = stage;
    }

    /// Called once after the last stage succeeded.
    fn on_run_complete(&self, documents: usize, assets: usize) {
        let _ = (documents, assets);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl RunProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::RunConfig`].
pub type ProgressCallback = Arc<dyn RunProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        ready: AtomicUsize,
        failed: AtomicUsize,
        stages: AtomicUsize,
    }

    impl RunProgressCallback for Counting {
        fn on_document_ready(&self, _title: &str, _delivered: usize, _quota: usize) {
            self.ready.fetch_add(1, Ordering::SeqCst);
        }

        fn on_item_failed(&self, _title: &str, _error: &str) {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }

        fn on_stage(&self, _stage: Stage) {
            self.stages.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb = NoopProgressCallback;
        cb.on_run_start(10);
        cb.on_item_start("a");
        cb.on_document_ready("a", 1, 10);
        cb.on_item_failed("b", "timeout");
        cb.on_stage(Stage::Assembling);
        cb.on_run_complete(1, 0);
    }

    #[test]
    fn arc_dyn_callback_receives_events() {
        let counting = Arc::new(Counting::default());
        let cb: ProgressCallback = counting.clone();
        cb.on_document_ready("a", 1, 2);
        cb.on_document_ready("b", 2, 2);
        cb.on_item_failed("c", "boom");
        cb.on_stage(Stage::Converting);

        assert_eq!(counting.ready.load(Ordering::SeqCst), 2);
        assert_eq!(counting.failed.load(Ordering::SeqCst), 1);
        assert_eq!(counting.stages.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stage_labels() {
        assert_eq!(Stage::Sending.as_str(), "sending email");
    }
}
