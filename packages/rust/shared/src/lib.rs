//! Shared types, error model, and configuration for Loresmith.
//!
//! This crate is the foundation depended on by all other Loresmith crates.
//! It provides:
//! - [`LoresmithError`] — the unified error type
//! - Domain types ([`Chunk`], [`Entry`], [`Worldbook`], [`HistoryRecord`], [`RollRecord`])
//! - Configuration ([`AppConfig`], [`SchedulerConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, CanonicalStrategy, MAX_CONCURRENCY, MergeSettings, OpenRouterConfig,
    ParserSettings, ResolverSettings, SchedulerConfig, SchedulerMode, SchedulerSettings,
    config_dir, config_file_path, init_config, load_config, load_config_from, validate_api_key,
};
pub use error::{LoresmithError, Result};
pub use types::{
    Category, ChangeKind, ChangedEntry, ChatMessage, Chunk, DuplicateGroup, Entry, HistoryRecord,
    Role, RollRecord, Worldbook, entry_count,
};
