//! Pipeline stages for reading-list-to-e-book conversion.
//!
//! Each submodule implements one step and exposes the collaborator trait it
//! depends on, so stages can be tested with in-memory fakes.
//!
//! ## Data Flow
//!
//! ```text
//! retrieve ──▶ pool ──▶ embed ──▶ assemble ──▶ convert
//! (pages)    (extract)  (images)   (EPUB)    (subprocess)
//! ```
//!
//! 1. [`retrieve`] — lazy paginated item stream with bounded read-ahead
//! 2. [`extract`]  — page → readable HTML; the only stage parsing whole pages
//! 3. [`pool`]     — K persistent workers running [`extract`] up to a quota
//! 4. [`embed`]    — overlapping image discovery and download per document
//! 5. [`assemble`] — shared output container and EPUB writer
//! 6. [`convert`]  — external converter with a cancel watcher

pub mod assemble;
pub mod convert;
pub mod embed;
pub mod extract;
pub mod pool;
pub mod retrieve;
