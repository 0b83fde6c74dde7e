//! Error types for the pocket2kindle library.
//!
//! Three error types reflect three failure scopes:
//!
//! * [`P2kError`] — **Fatal**: a whole stage failed (missing credentials,
//!   converter crashed, the book could not be written). Returned as
//!   `Err(P2kError)` from [`crate::run::Pipeline::run`] and terminates the run.
//!
//! * [`ItemError`] — **Per item**: one reading-list entry could not be
//!   extracted. The item is logged and dropped; the pool keeps going.
//!
//! * [`AssetError`] — **Per image**: one image reference failed validation
//!   or download. The reference stays in the content untouched.
//!
//! Only `P2kError` ever reaches the caller. The other two are reported
//! through `tracing` and [`crate::progress::RunProgressCallback`].

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the pocket2kindle library.
#[derive(Debug, Error)]
pub enum P2kError {
    // ── Configuration errors ──────────────────────────────────────────────
    /// A required environment variable is missing or empty.
    #[error("environment variable not found: {var}")]
    MissingEnv { var: String },

    /// The external converter binary is not on `PATH`.
    #[error("command not found: '{program}'\nInstall calibre or pass --format epub to skip conversion.")]
    BinaryNotFound { program: String },

    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Remote service errors ─────────────────────────────────────────────
    /// The HTTP request to the reading-list service failed outright.
    #[error("Request to '{endpoint}' failed: {reason}")]
    RemoteRequest { endpoint: String, reason: String },

    /// The service answered, but rejected the request.
    #[error("'{endpoint}' rejected the request: {reason}")]
    RemoteRejected { endpoint: String, reason: String },

    // ── Assembly errors ───────────────────────────────────────────────────
    /// No document was extracted before the deadline.
    #[error("No articles were extracted within {secs}s; nothing to assemble")]
    NoDocuments { secs: u64 },

    /// The e-book container could not be built.
    #[error("Failed to assemble e-book: {0}")]
    AssemblyFailed(String),

    /// Could not create or write an output file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Converter errors ──────────────────────────────────────────────────
    /// The converter process could not be started.
    #[error("Failed to start '{program}': {source}")]
    ConverterSpawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The converter exited unsuccessfully. `stderr` holds its last lines.
    #[error("'{program}' exited with {}{}", describe_exit(.code), stderr_suffix(.stderr))]
    ConverterFailed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    // ── Delivery errors ───────────────────────────────────────────────────
    /// Sending the converted book by email failed.
    #[error("Failed to send '{path}' by email: {reason}")]
    MailFailed { path: PathBuf, reason: String },

    // ── Cancellation ──────────────────────────────────────────────────────
    /// The run was cancelled while a stage was still in progress.
    #[error("Cancelled during {stage}")]
    Cancelled { stage: &'static str },

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(c) => format!("code {c}"),
        None => "a signal".to_string(),
    }
}

fn stderr_suffix(stderr: &str) -> String {
    match stderr.trim() {
        "" => String::new(),
        tail => format!(": {tail}"),
    }
}

/// A non-fatal error for a single reading-list item.
#[derive(Debug, Clone, Error, serde::Serialize, serde::Deserialize)]
pub enum ItemError {
    /// The item URL could not be parsed.
    #[error("Invalid URL '{url}': {detail}")]
    InvalidUrl { url: String, detail: String },

    /// Fetching or parsing the page failed.
    #[error("Extraction of '{url}' failed: {detail}")]
    Extraction { url: String, detail: String },

    /// The extractor did not answer in time.
    #[error("Extraction of '{url}' timed out after {secs}s")]
    Timeout { url: String, secs: u64 },
}

/// A non-fatal error for a single image reference.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AssetError {
    /// The reference could not be resolved to an absolute URL.
    #[error("cannot resolve '{reference}': {detail}")]
    InvalidReference { reference: String, detail: String },

    /// The request itself failed.
    #[error("download of '{url}' failed: {detail}")]
    Fetch { url: String, detail: String },

    /// The server answered outside [200, 400).
    #[error("'{url}' answered with status {status}")]
    Status { url: String, status: u16 },

    /// No usable extension in the last path segment.
    #[error("'{url}' ignored: no extension")]
    NoExtension { url: String },

    /// The extension is not a known image type.
    #[error("extension '{extension}' of '{url}' is not a known image type")]
    UnsupportedType { url: String, extension: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converter_failed_display_with_code() {
        let e = P2kError::ConverterFailed {
            program: "ebook-convert".into(),
            code: Some(2),
            stderr: String::new(),
        };
        let msg = e.to_string();
        assert!(msg.contains("ebook-convert"), "got: {msg}");
        assert!(msg.ends_with("code 2"), "got: {msg}");
    }

    #[test]
    fn converter_failed_display_with_stderr() {
        let e = P2kError::ConverterFailed {
            program: "ebook-convert".into(),
            code: Some(1),
            stderr: "Unsupported input\n".into(),
        };
        assert!(e.to_string().ends_with("code 1: Unsupported input"));
    }

    #[test]
    fn converter_failed_display_killed() {
        let e = P2kError::ConverterFailed {
            program: "ebook-convert".into(),
            code: None,
            stderr: String::new(),
        };
        assert!(e.to_string().contains("signal"));
    }

    #[test]
    fn missing_env_display() {
        let e = P2kError::MissingEnv {
            var: "POCKET_CONSUMER_KEY".into(),
        };
        assert!(e.to_string().contains("POCKET_CONSUMER_KEY"));
    }

    #[test]
    fn item_timeout_display() {
        let e = ItemError::Timeout {
            url: "https://example.com/a".into(),
            secs: 20,
        };
        assert!(e.to_string().contains("20s"));
        assert!(e.to_string().contains("example.com"));
    }

    #[test]
    fn asset_status_display() {
        let e = AssetError::Status {
            url: "https://example.com/a.png".into(),
            status: 404,
        };
        assert!(e.to_string().contains("404"));
    }
}
