//! Output container: sections + image assets, written out as EPUB.
//!
//! A [`Book`] is filled concurrently by the image embedders (assets) and
//! then sequentially by the orchestrator (sections). It is shared as
//! [`SharedBook`]; every mutation goes through the mutex.

use crate::error::P2kError;
use crate::model::EmbeddedAsset;
use epub_builder::{EpubBuilder, EpubContent, ReferenceType, ZipLibrary};
use once_cell::sync::Lazy;
use regex::Regex;
use std::io::Cursor;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Directory inside the container that holds embedded images.
pub const ASSET_DIR: &str = "images";

/// Shared handle to the book under construction.
pub type SharedBook = Arc<Mutex<Book>>;

/// One rendered article.
#[derive(Debug, Clone)]
pub struct Section {
    pub title: String,
    /// HTML body fragment.
    pub body: String,
}

/// The e-book being assembled.
#[derive(Debug, Default)]
pub struct Book {
    title: String,
    author: String,
    sections: Vec<Section>,
    assets: Vec<EmbeddedAsset>,
}

impl Book {
    pub fn new(title: impl Into<String>, author: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            author: author.into(),
            ..Self::default()
        }
    }

    pub fn shared(self) -> SharedBook {
        Arc::new(Mutex::new(self))
    }

    /// Store an image payload under a fresh unique name and return that name.
    pub fn add_asset(&mut self, source: &str, payload: Vec<u8>, extension: &str) -> String {
        let extension = extension.to_ascii_lowercase();
        let local_name = format!("{ASSET_DIR}/{}.{extension}", uuid::Uuid::new_v4());
        self.assets.push(EmbeddedAsset {
            source: source.to_string(),
            local_name: local_name.clone(),
            payload,
            extension,
        });
        local_name
    }

    pub fn add_section(&mut self, title: impl Into<String>, body: impl Into<String>) {
        self.sections.push(Section {
            title: title.into(),
            body: body.into(),
        });
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub fn assets(&self) -> &[EmbeddedAsset] {
        &self.assets
    }

    /// Write the book as an EPUB file at `path`.
    pub fn write_epub(&self, path: &Path) -> Result<(), P2kError> {
        info!(
            "Writing EPUB with {} sections and {} images to {}",
            self.sections.len(),
            self.assets.len(),
            path.display()
        );
        let zip = ZipLibrary::new().map_err(assembly)?;
        let mut builder = EpubBuilder::new(zip).map_err(assembly)?;
        builder
            .metadata("title", self.title.as_str())
            .map_err(assembly)?;
        builder
            .metadata("author", self.author.as_str())
            .map_err(assembly)?;
        builder.metadata("lang", "en").map_err(assembly)?;

        for asset in &self.assets {
            builder
                .add_resource(
                    &asset.local_name,
                    Cursor::new(asset.payload.as_slice()),
                    asset.media_type(),
                )
                .map_err(assembly)?;
        }

        builder.inline_toc();
        for (i, section) in self.sections.iter().enumerate() {
            let href = format!("section_{:03}.xhtml", i + 1);
            let page = xhtml_page(&section.title, &section.body);
            debug!("Adding {} ({})", href, section.title);
            builder
                .add_content(
                    EpubContent::new(href, page.as_bytes())
                        .title(section.title.as_str())
                        .reftype(ReferenceType::Text),
                )
                .map_err(assembly)?;
        }

        // Generated beside the target, then renamed into place.
        let write_failed = |source: std::io::Error| P2kError::OutputWriteFailed {
            path: path.to_path_buf(),
            source,
        };
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let mut tmp = tempfile::Builder::new()
            .prefix(".p2k-")
            .suffix(".epub.part")
            .tempfile_in(dir)
            .map_err(write_failed)?;
        builder.generate(tmp.as_file_mut()).map_err(assembly)?;
        tmp.persist(path).map_err(|e| write_failed(e.error))?;
        Ok(())
    }
}

fn assembly(e: impl std::fmt::Display) -> P2kError {
    P2kError::AssemblyFailed(e.to_string())
}

static RE_VOID_TAGS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)<(img|br|hr|col|wbr|source|area)\b([^>]*?)\s*/?>").unwrap()
});

/// Wrap an HTML fragment in a minimal XHTML document.
fn xhtml_page(title: &str, body: &str) -> String {
    let body = RE_VOID_TAGS.replace_all(body, "<$1$2 />");
    let body = body.replace("&nbsp;", "&#160;");
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<html xmlns="http://www.w3.org/1999/xhtml" xmlns:epub="http://www.idpf.org/2007/ops">
<head><meta charset="UTF-8" /><title>{}</title></head>
<body>
{}
</body>
</html>
"#,
        crate::template::escape_html(title),
        body
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Read;

    #[test]
    fn assets_get_unique_local_names() {
        let mut book = Book::new("t", "a");
        let a = book.add_asset("https://x.org/a.PNG", vec![1], "PNG");
        let b = book.add_asset("https://x.org/a.PNG", vec![1], "png");
        assert_ne!(a, b);
        assert!(a.starts_with("images/") && a.ends_with(".png"));
        assert_eq!(book.assets()[0].extension, "png");
    }

    #[test]
    fn void_tags_are_closed() {
        let page = xhtml_page("A & B", r#"<p>x<br>y</p><img src="images/a.png" alt="">"#);
        assert!(page.contains("<br />"));
        assert!(page.contains(r#"<img src="images/a.png" alt="" />"#));
        assert!(page.contains("<title>A &amp; B</title>"));
    }

    #[test]
    fn writes_a_zip_container() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("book.epub");

        let mut book = Book::new("Pocket articles", "Some machine, somewhere");
        let local = book.add_asset("https://x.org/a.png", vec![0x89, b'P', b'N', b'G'], "png");
        book.add_section("First", format!(r#"<p>Hello</p><img src="{local}">"#));
        book.add_section("Second", "<p>World</p>");
        book.write_epub(&path).unwrap();

        let mut magic = [0u8; 2];
        File::open(&path).unwrap().read_exact(&mut magic).unwrap();
        assert_eq!(&magic, b"PK");
    }

    #[test]
    fn unwritable_path_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("book.epub");
        let err = Book::new("t", "a").write_epub(&path).unwrap_err();
        assert!(matches!(err, P2kError::OutputWriteFailed { .. }));
    }
}
