//! # pocket2kindle
//!
//! Turn a Pocket reading list into an offline e-book.
//!
//! ## Why this crate?
//!
//! Reading saved articles on an e-reader means fetching each page, stripping
//! it down to its readable part, pulling in its images (the reader is
//! offline) and packaging everything as a book. Doing that one article at a
//! time is slow and fragile; this crate runs it as a concurrent pipeline with
//! a single time budget, so a run finishes on time even when some sites hang.
//!
//! ## Pipeline Overview
//!
//! ```text
//! Pocket /v3/get
//!  │
//!  ├─ 1. Retrieve  paginated, read-ahead limited, retried on failure
//!  ├─ 2. Extract   K workers until the quota is met (readable HTML)
//!  ├─ 3. Embed     download images into the book, rewrite references
//!  ├─ 4. Assemble  EPUB (epub-builder)
//!  ├─ 5. Convert   ebook-convert → MOBI/AZW3 (skipped for EPUB)
//!  ├─ 6. Deliver   optional SMTP attachment (Kindle inbox)
//!  └─ 7. Archive   optional bulk archive on Pocket
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pocket2kindle::pipeline::{
//!     convert::ExternalConverter, embed::HttpAssetFetcher, extract::ReadabilityExtractor,
//! };
//! use pocket2kindle::{Pipeline, PocketClient, RunConfig};
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Credentials from POCKET_CONSUMER_KEY / POCKET_REQUEST_TOKEN
//!     let pocket = Arc::new(PocketClient::from_env()?);
//!     let config = RunConfig::builder().article_count(5).output_format("epub").build()?;
//!     let pipeline = Pipeline::new(
//!         config,
//!         pocket,
//!         Arc::new(ReadabilityExtractor::new(Duration::from_secs(20))?),
//!         Arc::new(HttpAssetFetcher::new(Duration::from_secs(10))?),
//!         Arc::new(ExternalConverter::new("ebook-convert")),
//!     );
//!     let report = pipeline.run(&CancellationToken::new()).await?;
//!     eprintln!("{} articles, {} images", report.documents, report.assets);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `p2k` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! pocket2kindle = { version = "0.3", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod mail;
pub mod model;
pub mod pipeline;
pub mod pocket;
pub mod progress;
pub mod run;
pub mod template;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{RunConfig, RunConfigBuilder};
pub use error::{AssetError, ItemError, P2kError};
pub use mail::{Mailer, SmtpMailer, SmtpSettings};
pub use model::{ExtractedDocument, ImageReference, ItemId, RemoteItem, RunReport};
pub use pocket::PocketClient;
pub use progress::{NoopProgressCallback, ProgressCallback, RunProgressCallback, Stage};
pub use run::{Archiver, Pipeline};
