//! Readable-content extraction: web page → title + simplified HTML.
//!
//! [`Extractor`] is the seam the extraction pool calls through. The bundled
//! [`ReadabilityExtractor`] downloads the page with `reqwest` and picks the
//! main content area with `scraper`: the first of a list of well-known
//! content containers (`article`, `main`, `.post-content`, …), falling back
//! to `<body>` stripped of navigation chrome. The result is then sanitised
//! with a few deterministic regex passes so the e-book reader never sees
//! scripts, inline handlers, or embedded frames.

use crate::error::ItemError;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Result of extracting one page.
#[derive(Debug, Clone, PartialEq)]
pub struct Article {
    pub title: Option<String>,
    /// Sanitised HTML fragment.
    pub content: String,
}

/// Turns a page URL into readable content.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, url: &Url) -> Result<Article, ItemError>;
}

/// Main-content selectors, most specific first.
const CONTENT_SELECTORS: &[&str] = &[
    "article",
    "main",
    "[role='main']",
    ".post-content",
    ".entry-content",
    ".article-body",
    "#content",
    ".content",
];

/// Elements removed from the `<body>` fallback.
const BOILERPLATE_SELECTORS: &[&str] = &[
    "nav", "header", "footer", "aside", ".sidebar", ".menu", ".ads", ".advertisement", "#nav",
    "#header", "#footer", "#sidebar",
];

/// Pages shorter than this (in visible characters) count as empty.
const MIN_TEXT_LEN: usize = 40;

/// HTTP extractor using `reqwest` + `scraper`.
#[derive(Debug, Clone)]
pub struct ReadabilityExtractor {
    client: reqwest::Client,
}

impl ReadabilityExtractor {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("pocket2kindle/", env!("CARGO_PKG_VERSION")))
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()?;
        Ok(Self { client })
    }

    async fn fetch_html(&self, url: &Url) -> Result<String, ItemError> {
        let failed = |detail: String| ItemError::Extraction {
            url: url.to_string(),
            detail,
        };
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| failed(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(failed(format!("HTTP {status}")));
        }
        response.text().await.map_err(|e| failed(e.to_string()))
    }
}

#[async_trait]
impl Extractor for ReadabilityExtractor {
    async fn extract(&self, url: &Url) -> Result<Article, ItemError> {
        debug!(url = %url, "Parsing page");
        let html = self.fetch_html(url).await?;
        extract_readable(&html).ok_or_else(|| ItemError::Extraction {
            url: url.to_string(),
            detail: "no readable content".into(),
        })
    }
}

/// Pick the readable part of a full HTML page. `None` if it is empty.
pub fn extract_readable(html: &str) -> Option<Article> {
    let document = Html::parse_document(html);
    let title = extract_title(&document);

    let main = CONTENT_SELECTORS.iter().find_map(|sel| {
        let selector = Selector::parse(sel).ok()?;
        document
            .select(&selector)
            .find(|el| visible_len(&el.text().collect::<String>()) >= MIN_TEXT_LEN)
            .map(|el| el.inner_html())
    });

    let content = match main {
        Some(html) => html,
        None => {
            let body = Selector::parse("body").ok()?;
            let body_html = document.select(&body).next()?.inner_html();
            remove_boilerplate(&body_html)
        }
    };

    let content = sanitize(&content);
    let text: String = Html::parse_fragment(&content)
        .root_element()
        .text()
        .collect();
    if visible_len(&text) < MIN_TEXT_LEN {
        return None;
    }
    Some(Article { title, content })
}

fn extract_title(document: &Html) -> Option<String> {
    ["meta[property='og:title']", "title", "h1"]
        .iter()
        .find_map(|sel| {
            let selector = Selector::parse(sel).ok()?;
            let el = document.select(&selector).next()?;
            let text = match el.value().attr("content") {
                Some(c) => c.to_string(),
                None => el.text().collect::<String>(),
            };
            let text = collapse_ws(&text);
            (!text.is_empty()).then_some(text)
        })
}

fn remove_boilerplate(html: &str) -> String {
    let fragment = Html::parse_fragment(html);
    let mut result = html.to_string();
    for sel in BOILERPLATE_SELECTORS {
        if let Ok(selector) = Selector::parse(sel) {
            for element in fragment.select(&selector) {
                result = result.replace(&element.html(), "");
            }
        }
    }
    result
}

// ── Sanitising passes ────────────────────────────────────────────────────

static RE_DANGEROUS_BLOCKS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<(script|style|noscript|iframe|object|embed|form|template)\b[^>]*>.*?</\s*(script|style|noscript|iframe|object|embed|form|template)\s*>")
        .unwrap()
});

static RE_SELF_CLOSING_EMBEDS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)<(iframe|embed|input|link|meta)\b[^>]*/?>").unwrap());

static RE_COMMENTS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<!--.*?-->").unwrap());

static RE_EVENT_HANDLERS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)\s+on[a-z]+\s*=\s*("[^"]*"|'[^']*'|[^\s>]+)"#).unwrap());

static RE_JS_URLS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)(href|src)\s*=\s*("|')\s*javascript:[^"']*("|')"#).unwrap());

static RE_WS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Strip active content from an HTML fragment.
pub fn sanitize(html: &str) -> String {
    let s = RE_COMMENTS.replace_all(html, "");
    let s = RE_DANGEROUS_BLOCKS.replace_all(&s, "");
    let s = RE_SELF_CLOSING_EMBEDS.replace_all(&s, "");
    let s = RE_EVENT_HANDLERS.replace_all(&s, "");
    let s = RE_JS_URLS.replace_all(&s, "$1=\"#\"");
    s.trim().to_string()
}

fn collapse_ws(s: &str) -> String {
    RE_WS.replace_all(s.trim(), " ").to_string()
}

fn visible_len(s: &str) -> usize {
    s.split_whitespace().map(str::len).sum()
}
