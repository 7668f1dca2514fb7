//! CLI command definitions, routing, and tracing setup.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use loresmith_core::{ExtractionPipeline, ExtractionReport, PipelineConfig, ProgressReporter};
use loresmith_provider::OpenRouterClient;
use loresmith_shared::{
    AppConfig, Chunk, config_dir, config_file_path, entry_count, init_config, load_config,
    validate_api_key,
};
use loresmith_storage::Storage;

/// Default OpenRouter API base.
const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1/";

/// Default database file name under `~/.loresmith/`.
const DB_FILE_NAME: &str = "loresmith.db";

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// Loresmith — turn chunked long-form text into a structured worldbook.
#[derive(Parser)]
#[command(
    name = "loresmith",
    version,
    about = "Extract structured worldbook entries from chunked text via an LLM backend.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Database path (defaults to ~/.loresmith/loresmith.db).
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Extract entries from a chunk list into a worldbook.
    Extract {
        /// JSON file holding an array of {index, title, content} chunks.
        chunks: PathBuf,

        /// Worldbook to accumulate into.
        #[arg(short, long)]
        book: String,

        /// Model ID override (defaults to the configured model).
        #[arg(long)]
        model: Option<String>,

        /// Overwrite existing entries instead of accumulating into them.
        #[arg(long)]
        full: bool,
    },

    /// Detect and merge duplicate entries in a worldbook.
    Dedupe {
        /// Worldbook to resolve.
        #[arg(short, long)]
        book: String,

        /// Model ID override.
        #[arg(long)]
        model: Option<String>,
    },

    /// List merge history records, newest first.
    History {
        /// Worldbook to inspect.
        #[arg(short, long)]
        book: String,

        /// Only records for this chunk index.
        #[arg(long)]
        index: Option<usize>,
    },

    /// Restore the worldbook state captured before a history record.
    Rollback {
        /// Worldbook to roll back.
        #[arg(short, long)]
        book: String,

        /// Record position in the newest-first history listing.
        #[arg(long)]
        record: usize,
    },

    /// List re-generation attempts for one chunk, newest first.
    Rolls {
        /// Worldbook to inspect.
        #[arg(short, long)]
        book: String,

        /// Chunk index.
        #[arg(long)]
        chunk: usize,
    },

    /// Print a worldbook as JSON.
    Show {
        /// Worldbook to print.
        #[arg(short, long)]
        book: String,
    },

    /// List all stored worldbooks.
    List,

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "loresmith=info",
        1 => "loresmith=debug",
        _ => "loresmith=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt().with_env_filter(env_filter).init();
        }
        LogFormat::Json => {
            fmt().json().with_env_filter(env_filter).init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command routing
// ---------------------------------------------------------------------------

/// Execute the parsed CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config = load_config()?;

    match cli.command {
        Command::Extract {
            chunks,
            book,
            model,
            full,
        } => {
            let storage = open_storage(&cli.db).await?;
            extract(&config, &storage, &chunks, &book, model, full).await
        }
        Command::Dedupe { book, model } => {
            let storage = open_storage(&cli.db).await?;
            dedupe(&config, &storage, &book, model).await
        }
        Command::History { book, index } => {
            let storage = open_storage(&cli.db).await?;
            history(&storage, &book, index).await
        }
        Command::Rollback { book, record } => {
            let storage = open_storage(&cli.db).await?;
            rollback(&storage, &book, record).await
        }
        Command::Rolls { book, chunk } => {
            let storage = open_storage(&cli.db).await?;
            rolls(&storage, &book, chunk).await
        }
        Command::Show { book } => {
            let storage = open_storage(&cli.db).await?;
            show(&storage, &book).await
        }
        Command::List => {
            let storage = open_storage(&cli.db).await?;
            list(&storage).await
        }
        Command::Config { action } => config_command(action, &config),
    }
}

async fn open_storage(db: &Option<PathBuf>) -> Result<Storage> {
    let path = match db {
        Some(path) => path.clone(),
        None => config_dir()?.join(DB_FILE_NAME),
    };
    Ok(Storage::open(&path).await?)
}

fn build_client(config: &AppConfig, model: Option<String>) -> Result<OpenRouterClient> {
    validate_api_key(config)?;
    let api_key = std::env::var(&config.openrouter.api_key_env).unwrap_or_default();
    let model = model.unwrap_or_else(|| config.openrouter.default_model.clone());
    Ok(OpenRouterClient::new(OPENROUTER_BASE_URL, api_key, model)?)
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

async fn extract(
    config: &AppConfig,
    storage: &Storage,
    chunks_path: &PathBuf,
    book: &str,
    model: Option<String>,
    full: bool,
) -> Result<()> {
    let raw = std::fs::read_to_string(chunks_path)
        .map_err(|e| eyre!("failed to read {}: {e}", chunks_path.display()))?;
    let chunks: Vec<Chunk> =
        serde_json::from_str(&raw).map_err(|e| eyre!("invalid chunk list: {e}"))?;
    if chunks.is_empty() {
        return Err(eyre!("chunk list is empty"));
    }

    let client = build_client(config, model)?;
    info!(book, chunks = chunks.len(), model = client.model(), "starting extraction");

    let mut pipeline_config = PipelineConfig::from_app_config(book, book, config);
    if full {
        pipeline_config.merge.incremental = false;
    }

    let mut pipeline =
        ExtractionPipeline::open(Arc::new(client), pipeline_config, storage).await?;
    let progress = Arc::new(CliProgress::new(chunks.len() as u64));
    let report = pipeline.run_chunks(chunks, storage, progress).await?;

    println!(
        "Merged {} chunk(s) into '{book}' ({} entries).",
        report.processed, report.entry_count
    );
    if !report.errors.is_empty() {
        println!("{} chunk(s) failed:", report.errors.len());
        for (index, error) in &report.errors {
            println!("  chunk {index}: {error}");
        }
    }
    Ok(())
}

async fn dedupe(
    config: &AppConfig,
    storage: &Storage,
    book: &str,
    model: Option<String>,
) -> Result<()> {
    let client = build_client(config, model)?;
    let pipeline_config = PipelineConfig::from_app_config(book, book, config);
    let mut pipeline =
        ExtractionPipeline::open(Arc::new(client), pipeline_config, storage).await?;

    if pipeline.worldbook().is_empty() {
        return Err(eyre!("worldbook '{book}' is empty or unknown"));
    }

    let progress = Arc::new(CliProgress::new(0));
    let confirmed = pipeline.dedupe(storage, progress).await?;

    if confirmed.is_empty() {
        println!("No duplicates found in '{book}'.");
        return Ok(());
    }
    for (category, groups) in confirmed {
        for group in groups {
            println!(
                "{category}: {} -> \"{}\"",
                group
                    .names
                    .iter()
                    .map(|n| format!("\"{n}\""))
                    .collect::<Vec<_>>()
                    .join(", "),
                group.main_name
            );
        }
    }
    Ok(())
}

async fn history(storage: &Storage, book: &str, index: Option<usize>) -> Result<()> {
    let records = match index {
        Some(index) => storage.list_history_by_index(book, index).await?,
        None => storage.list_history(book).await?,
    };

    if records.is_empty() {
        println!("No history for '{book}'.");
        return Ok(());
    }
    for (position, record) in records.iter().enumerate() {
        println!(
            "[{position}] {} chunk {} \"{}\" — {} change(s)",
            record.created_at.to_rfc3339(),
            record.memory_index,
            record.memory_title,
            record.changed.len()
        );
    }
    Ok(())
}

async fn rollback(storage: &Storage, book: &str, record: usize) -> Result<()> {
    let records = storage.list_history(book).await?;
    let chosen = records
        .get(record)
        .ok_or_else(|| eyre!("record {record} out of range ({} records)", records.len()))?;

    let name = storage
        .load_worldbook(book)
        .await?
        .map(|(name, _)| name)
        .unwrap_or_else(|| book.to_string());

    storage.save_worldbook(book, &name, &chosen.previous).await?;
    println!(
        "Restored '{book}' to the state before chunk {} (\"{}\", {} entries).",
        chosen.memory_index,
        chosen.memory_title,
        entry_count(&chosen.previous)
    );
    Ok(())
}

async fn rolls(storage: &Storage, book: &str, chunk: usize) -> Result<()> {
    let records = storage.list_rolls_by_chunk(book, chunk).await?;
    if records.is_empty() {
        println!("No rolls for chunk {chunk} of '{book}'.");
        return Ok(());
    }
    for (position, record) in records.iter().enumerate() {
        let excerpt: String = record.response.chars().take(80).collect();
        println!(
            "[{position}] {} {} entries, response: {excerpt}…",
            record.created_at.to_rfc3339(),
            entry_count(&record.result)
        );
    }
    Ok(())
}

async fn show(storage: &Storage, book: &str) -> Result<()> {
    let (_, worldbook) = storage
        .load_worldbook(book)
        .await?
        .ok_or_else(|| eyre!("unknown worldbook '{book}'"))?;
    println!("{}", serde_json::to_string_pretty(&worldbook)?);
    Ok(())
}

async fn list(storage: &Storage) -> Result<()> {
    let books = storage.list_worldbooks().await?;
    if books.is_empty() {
        println!("No worldbooks yet. Run `loresmith extract` first.");
        return Ok(());
    }
    for (id, name, updated_at) in books {
        println!("{id}  {name}  (updated {updated_at})");
    }
    Ok(())
}

fn config_command(action: ConfigAction, config: &AppConfig) -> Result<()> {
    match action {
        ConfigAction::Init => {
            let path = init_config()?;
            println!("Wrote default config to {}", path.display());
        }
        ConfigAction::Show => {
            println!("# {}", config_file_path()?.display());
            println!("{}", toml::to_string_pretty(config)?);
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Progress bar adapter
// ---------------------------------------------------------------------------

/// Adapts the pipeline's progress callbacks to an indicatif bar.
struct CliProgress {
    bar: ProgressBar,
}

impl CliProgress {
    fn new(total: u64) -> Self {
        let bar = ProgressBar::new(total);
        bar.set_style(
            ProgressStyle::with_template("{spinner} [{bar:30}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        Self { bar }
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.bar.set_message(name.to_string());
    }

    fn chunk_done(&self, current: usize, _total: usize, detail: &str) {
        self.bar.set_position(current as u64);
        self.bar.set_message(detail.to_string());
    }

    fn done(&self, report: &ExtractionReport) {
        self.bar.finish_with_message(format!(
            "done: {} merged, {} failed",
            report.processed,
            report.errors.len()
        ));
    }
}
