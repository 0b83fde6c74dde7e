//! Data types flowing through the pipeline.
//!
//! ```text
//! RemoteItem ──pool──▶ ExtractedDocument ──embedder──▶ section in Book
//!                                          └─ ImageReference ──▶ EmbeddedAsset
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use url::Url;

/// Stable identifier of a reading-list entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub String);

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ItemId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Read state of a reading-list entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReadState {
    #[default]
    Unread,
    Archived,
    Deleted,
}

/// A bookmarked entry as returned by the remote listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteItem {
    pub id: ItemId,
    /// Source URL of the article (resolved URL when the service knows it).
    pub url: String,
    pub title: String,
    pub favorite: bool,
    pub state: ReadState,
}

/// Readable content extracted from one [`RemoteItem`].
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedDocument {
    pub item_id: ItemId,
    pub title: String,
    /// Simplified HTML produced by the extractor.
    pub content: String,
    /// Base URL used to resolve relative image references.
    pub source_url: Url,
}

/// An image source discovered in a document, with its absolute form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Literal attribute value as it appears in the content.
    pub raw: String,
    pub absolute: Url,
}

impl ImageReference {
    /// Resolve `raw` against `base` when given; otherwise `raw` must be absolute.
    pub fn resolve(raw: &str, base: Option<&Url>) -> Result<Self, url::ParseError> {
        let absolute = match base {
            Some(base) => base.join(raw)?,
            None => Url::parse(raw)?,
        };
        Ok(Self {
            raw: raw.to_string(),
            absolute,
        })
    }
}

/// An image relocated into the output container.
#[derive(Debug, Clone)]
pub struct EmbeddedAsset {
    /// Absolute URL the payload was downloaded from.
    pub source: String,
    /// Path of the asset inside the container, used in rewritten content.
    pub local_name: String,
    pub payload: Vec<u8>,
    /// Lower-cased extension (png, jpg, jpeg, svg).
    pub extension: String,
}

impl EmbeddedAsset {
    pub fn media_type(&self) -> &'static str {
        match self.extension.as_str() {
            "png" => "image/png",
            "jpg" | "jpeg" => "image/jpeg",
            "svg" => "image/svg+xml",
            _ => "application/octet-stream",
        }
    }
}

/// Summary of one completed run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    /// Documents assembled into the book.
    pub documents: usize,
    /// Images embedded across all documents.
    pub assets: usize,
    /// Final e-book, if it was kept on disk.
    pub output_path: Option<PathBuf>,
    /// Intermediate EPUB, if retained.
    pub epub_path: Option<PathBuf>,
    pub emailed: bool,
    /// Items archived on the remote service.
    pub archived: usize,
    pub total_duration_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_relative_reference() {
        let base = Url::parse("https://blog.example.com/posts/1/index.html").unwrap();
        let r = ImageReference::resolve("img/a.png", Some(&base)).unwrap();
        assert_eq!(r.raw, "img/a.png");
        assert_eq!(
            r.absolute.as_str(),
            "https://blog.example.com/posts/1/img/a.png"
        );
    }

    #[test]
    fn resolve_without_base_needs_absolute() {
        assert!(ImageReference::resolve("a.png", None).is_err());
        assert!(ImageReference::resolve("https://x.org/a.png", None).is_ok());
    }

    #[test]
    fn media_types() {
        let asset = |ext: &str| EmbeddedAsset {
            source: String::new(),
            local_name: String::new(),
            payload: vec![],
            extension: ext.to_string(),
        };
        assert_eq!(asset("jpeg").media_type(), "image/jpeg");
        assert_eq!(asset("svg").media_type(), "image/svg+xml");
    }
}
