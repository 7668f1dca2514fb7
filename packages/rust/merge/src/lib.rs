//! Merge/versioning engine for the cumulative worldbook.
//!
//! This crate provides:
//! - [`normalize`] — canonical-schema normalization of parsed model output
//!   and the chapter-suffix pre-merge pass
//! - [`diff`] — entry-level diff between worldbook snapshots
//! - [`engine`] — [`MergeEngine`]: full/incremental merges, append-only
//!   history, rollback, and confirmed-duplicate folding

pub mod diff;
pub mod engine;
pub mod normalize;

pub use diff::diff_worldbooks;
pub use engine::{MergeEngine, MergeMode, MergeOptions};
pub use normalize::{apply_chapter_suffix, normalize_book, normalize_entry};
