//! Application configuration for Loresmith.
//!
//! User config lives at `~/.loresmith/loresmith.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{LoresmithError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "loresmith.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".loresmith";

// ---------------------------------------------------------------------------
// Config structs (matching loresmith.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Task scheduler settings.
    #[serde(default)]
    pub scheduler: SchedulerSettings,

    /// OpenRouter settings.
    #[serde(default)]
    pub openrouter: OpenRouterConfig,

    /// Merge engine settings.
    #[serde(default)]
    pub merge: MergeSettings,

    /// Response parsing settings.
    #[serde(default)]
    pub parser: ParserSettings,

    /// Duplicate resolver settings.
    #[serde(default)]
    pub resolver: ResolverSettings,
}

/// Scheduler execution strategy. Serial is an automatic fallback (input of
/// one, or `enabled = false`), not a configurable mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerMode {
    Independent,
    Batch,
}

/// `[scheduler]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    /// Whether concurrent execution is enabled at all.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Maximum concurrent model calls (clamped to 1..=10 at runtime).
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,

    /// Execution strategy for multi-chunk runs.
    #[serde(default = "default_mode")]
    pub mode: SchedulerMode,

    /// Total attempts per task (at least 1).
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,

    /// Base retry delay in milliseconds; attempt `n` waits `n × delay`.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            concurrency: default_concurrency(),
            mode: default_mode(),
            retry_count: default_retry_count(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_concurrency() -> u32 {
    3
}
fn default_mode() -> SchedulerMode {
    SchedulerMode::Independent
}
fn default_retry_count() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    2_000
}

/// `[openrouter]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenRouterConfig {
    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Default model to use for extraction and duplicate verification.
    #[serde(default = "default_model")]
    pub default_model: String,
}

impl Default for OpenRouterConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_api_key_env(),
            default_model: default_model(),
        }
    }
}

fn default_api_key_env() -> String {
    "OPENROUTER_API_KEY".into()
}
fn default_model() -> String {
    "moonshotai/kimi-k2.5".into()
}

/// `[merge]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeSettings {
    /// Accumulate into existing entries instead of overwriting them.
    #[serde(default = "default_true")]
    pub incremental: bool,

    /// Divider inserted between accumulated content blocks.
    #[serde(default = "default_divider")]
    pub content_divider: String,

    /// How many leading characters of incoming content to probe for the
    /// near-duplicate guard.
    #[serde(default = "default_dedup_probe")]
    pub dedup_probe_chars: usize,

    /// Categories whose entry names get the chunk index suffixed (plot
    /// outlines and similar sequential-event categories).
    #[serde(default)]
    pub chapter_suffix_categories: Vec<String>,
}

impl Default for MergeSettings {
    fn default() -> Self {
        Self {
            incremental: true,
            content_divider: default_divider(),
            dedup_probe_chars: default_dedup_probe(),
            chapter_suffix_categories: Vec::new(),
        }
    }
}

fn default_divider() -> String {
    "\n---\n".into()
}
fn default_dedup_probe() -> usize {
    50
}

/// `[parser]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParserSettings {
    /// Tag pairs removed from responses together with their content
    /// (reasoning blocks and similar).
    #[serde(default = "default_enclosed_tags")]
    pub strip_enclosed: Vec<(String, String)>,

    /// Closing tags up to (and including) which leading commentary is
    /// removed.
    #[serde(default)]
    pub strip_preamble: Vec<String>,
}

impl Default for ParserSettings {
    fn default() -> Self {
        Self {
            strip_enclosed: default_enclosed_tags(),
            strip_preamble: Vec::new(),
        }
    }
}

fn default_enclosed_tags() -> Vec<(String, String)> {
    vec![("<think>".into(), "</think>".into())]
}

/// How the resolver picks the canonical name for a duplicate group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CanonicalStrategy {
    /// Use the model's nomination; fall back to longest content when the
    /// nominations are missing or conflicting.
    PreferNominated,
    /// Always keep the member with the longest existing content.
    LongestContent,
}

/// `[resolver]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverSettings {
    /// Above this many candidate pairs, verification is split into batches
    /// run through the task scheduler.
    #[serde(default = "default_pair_threshold")]
    pub pair_batch_threshold: usize,

    /// Pairs per batched verification request.
    #[serde(default = "default_pair_batch_size")]
    pub pair_batch_size: usize,

    /// Canonical-name selection strategy.
    #[serde(default = "default_canonical_strategy")]
    pub canonical_strategy: CanonicalStrategy,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            pair_batch_threshold: default_pair_threshold(),
            pair_batch_size: default_pair_batch_size(),
            canonical_strategy: default_canonical_strategy(),
        }
    }
}

fn default_pair_threshold() -> usize {
    16
}
fn default_pair_batch_size() -> usize {
    8
}
fn default_canonical_strategy() -> CanonicalStrategy {
    CanonicalStrategy::PreferNominated
}

// ---------------------------------------------------------------------------
// Scheduler config (runtime, merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Hard cap on concurrent model calls, regardless of configuration.
pub const MAX_CONCURRENCY: u32 = 10;

/// Runtime scheduler configuration — validated/clamped from settings.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Whether concurrent execution is enabled.
    pub enabled: bool,
    /// Concurrent task cap, clamped to `1..=MAX_CONCURRENCY`.
    pub concurrency: u32,
    /// Execution strategy.
    pub mode: SchedulerMode,
    /// Total attempts per task, at least 1.
    pub retry_count: u32,
    /// Base retry delay.
    pub retry_delay: std::time::Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from(&SchedulerSettings::default())
    }
}

impl From<&SchedulerSettings> for SchedulerConfig {
    fn from(settings: &SchedulerSettings) -> Self {
        Self {
            enabled: settings.enabled,
            concurrency: settings.concurrency.clamp(1, MAX_CONCURRENCY),
            mode: settings.mode,
            retry_count: settings.retry_count.max(1),
            retry_delay: std::time::Duration::from_millis(settings.retry_delay_ms),
        }
    }
}

impl From<&AppConfig> for SchedulerConfig {
    fn from(config: &AppConfig) -> Self {
        Self::from(&config.scheduler)
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.loresmith/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| LoresmithError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.loresmith/loresmith.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| LoresmithError::io(path, e))?;

    toml::from_str(&content).map_err(|e| {
        LoresmithError::config(format!("failed to parse {}: {e}", path.display()))
    })
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| LoresmithError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| LoresmithError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| LoresmithError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Check that the OpenRouter API key env var is set and non-empty.
pub fn validate_api_key(config: &AppConfig) -> Result<()> {
    let var_name = &config.openrouter.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(()),
        _ => Err(LoresmithError::config(format!(
            "OpenRouter API key not found. Set the {var_name} environment variable.\n\
             Get a key at https://openrouter.ai/keys"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("concurrency"));
        assert!(toml_str.contains("OPENROUTER_API_KEY"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.scheduler.concurrency, 3);
        assert_eq!(parsed.scheduler.mode, SchedulerMode::Independent);
        assert_eq!(parsed.merge.dedup_probe_chars, 50);
        assert_eq!(parsed.openrouter.api_key_env, "OPENROUTER_API_KEY");
    }

    #[test]
    fn partial_config_fills_defaults() {
        let toml_str = r#"
[scheduler]
concurrency = 5
mode = "batch"

[merge]
chapter_suffix_categories = ["剧情大纲"]
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.scheduler.concurrency, 5);
        assert_eq!(config.scheduler.mode, SchedulerMode::Batch);
        assert!(config.scheduler.enabled);
        assert_eq!(config.merge.chapter_suffix_categories.len(), 1);
        assert_eq!(
            config.resolver.canonical_strategy,
            CanonicalStrategy::PreferNominated
        );
    }

    #[test]
    fn scheduler_config_clamps_concurrency() {
        let settings = SchedulerSettings {
            concurrency: 64,
            retry_count: 0,
            ..Default::default()
        };
        let runtime = SchedulerConfig::from(&settings);
        assert_eq!(runtime.concurrency, MAX_CONCURRENCY);
        assert_eq!(runtime.retry_count, 1);

        let settings = SchedulerSettings {
            concurrency: 0,
            ..Default::default()
        };
        assert_eq!(SchedulerConfig::from(&settings).concurrency, 1);
    }

    #[test]
    fn api_key_validation() {
        let mut config = AppConfig::default();
        // Use a unique env var name to avoid interfering with other tests
        config.openrouter.api_key_env = "LS_TEST_NONEXISTENT_KEY_12345".into();
        let result = validate_api_key(&config);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("API key not found"));
    }
}
