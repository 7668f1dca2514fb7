//! End-to-end extraction pipeline: chunks → model → repair → merge → store.
//!
//! The scheduler runs a per-chunk worker (prompt → invoke → tag-strip →
//! repair-parse → normalize) under the configured strategy; completions are
//! then folded into the merge engine strictly in index order, so merges
//! never overlap. Every successful merge mirrors its history record into
//! durable storage and saves the updated worldbook, making an interrupted
//! batch resumable from accumulated state.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use sha2::{Digest, Sha256};
use tracing::{info, instrument, warn};

use loresmith_merge::{MergeEngine, MergeMode, MergeOptions, apply_chapter_suffix, normalize_book};
use loresmith_parser::{TagRule, classify_provider_error, parse, strip_tags};
use loresmith_provider::ModelClient;
use loresmith_resolver::{DuplicateResolver, ResolverOptions};
use loresmith_scheduler::{SchedulerObserver, TaskScheduler, TaskStatus};
use loresmith_shared::{
    AppConfig, ChangedEntry, Chunk, DuplicateGroup, LoresmithError, MergeSettings, ParserSettings,
    ResolverSettings, Result, RollRecord, SchedulerConfig, Worldbook, entry_count,
};
use loresmith_storage::Storage;

use crate::prompts::{extraction_messages, extraction_user_prompt};

// ---------------------------------------------------------------------------
// Config & report
// ---------------------------------------------------------------------------

/// Configuration for one pipeline instance, bound to a single worldbook.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Identifier of the worldbook accumulated into.
    pub book_id: String,
    /// Human-readable book name.
    pub book_name: String,
    /// Scheduler strategy and retry policy.
    pub scheduler: SchedulerConfig,
    /// Merge behavior.
    pub merge: MergeSettings,
    /// Response tag filtering.
    pub parser: ParserSettings,
    /// Duplicate resolution behavior.
    pub resolver: ResolverSettings,
}

impl PipelineConfig {
    /// Build a pipeline config for `book_id` from the application config.
    pub fn from_app_config(
        book_id: impl Into<String>,
        book_name: impl Into<String>,
        config: &AppConfig,
    ) -> Self {
        Self {
            book_id: book_id.into(),
            book_name: book_name.into(),
            scheduler: SchedulerConfig::from(&config.scheduler),
            merge: config.merge.clone(),
            parser: config.parser.clone(),
            resolver: config.resolver.clone(),
        }
    }
}

/// Result of one extraction batch.
#[derive(Debug)]
pub struct ExtractionReport {
    /// Chunks whose extraction succeeded and merged.
    pub processed: usize,
    /// Chunks that failed after retries; `(chunk index, error)`.
    pub errors: Vec<(usize, LoresmithError)>,
    /// Total entries in the worldbook after the batch.
    pub entry_count: usize,
    /// Total elapsed time.
    pub elapsed: Duration,
}

/// Progress callback for reporting pipeline status.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, name: &str);
    /// Called as chunks reach a terminal status.
    fn chunk_done(&self, current: usize, total: usize, detail: &str);
    /// Called when the batch completes.
    fn done(&self, report: &ExtractionReport);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn chunk_done(&self, _current: usize, _total: usize, _detail: &str) {}
    fn done(&self, _report: &ExtractionReport) {}
}

/// Adapts a [`ProgressReporter`] to the scheduler's observer interface.
struct SchedulerProgress {
    inner: Arc<dyn ProgressReporter>,
    total: usize,
    completed: AtomicUsize,
}

impl SchedulerObserver for SchedulerProgress {
    fn task_settled(&self, index: usize, status: TaskStatus, error: Option<&LoresmithError>) {
        let current = self.completed.fetch_add(1, Ordering::SeqCst) + 1;
        let detail = match (status, error) {
            (TaskStatus::Completed, _) => format!("chunk {index} extracted"),
            (_, Some(err)) => format!("chunk {index} failed: {err}"),
            (_, None) => format!("chunk {index} failed"),
        };
        self.inner.chunk_done(current, self.total, &detail);
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// One chunk's extraction output, before merging.
struct Extracted {
    book: Worldbook,
    prompt: String,
    response: String,
}

/// Drives extraction for one worldbook.
pub struct ExtractionPipeline<M: ModelClient> {
    client: Arc<M>,
    scheduler: TaskScheduler,
    resolver: DuplicateResolver,
    engine: MergeEngine,
    config: PipelineConfig,
    tag_rules: Vec<TagRule>,
}

impl<M: ModelClient> ExtractionPipeline<M> {
    /// Open a pipeline, resuming from the book's stored state if present.
    pub async fn open(client: Arc<M>, config: PipelineConfig, storage: &Storage) -> Result<Self> {
        let book = storage
            .load_worldbook(&config.book_id)
            .await?
            .map(|(_, book)| book)
            .unwrap_or_default();

        if !book.is_empty() {
            info!(
                book_id = %config.book_id,
                entries = entry_count(&book),
                "resuming from stored worldbook"
            );
        }

        let engine = MergeEngine::with_worldbook(book, MergeOptions::from(&config.merge));
        let scheduler = TaskScheduler::new(config.scheduler.clone());
        let resolver = DuplicateResolver::new(ResolverOptions::from(&config.resolver));
        let tag_rules = tag_rules_from(&config.parser);

        Ok(Self {
            client,
            scheduler,
            resolver,
            engine,
            config,
            tag_rules,
        })
    }

    /// The live worldbook.
    pub fn worldbook(&self) -> &Worldbook {
        self.engine.worldbook()
    }

    /// Request cooperative cancellation of the running batch.
    pub fn abort(&self) {
        self.scheduler.abort();
    }

    /// Extract every chunk and fold the results into the worldbook.
    ///
    /// Failures are recorded per chunk; the batch itself only fails on
    /// storage errors. Merges run strictly in chunk-index order after each
    /// result settles, so the worldbook accumulates deterministically no
    /// matter the completion order.
    #[instrument(skip_all, fields(book_id = %self.config.book_id, chunks = chunks.len()))]
    pub async fn run_chunks(
        &mut self,
        chunks: Vec<Chunk>,
        storage: &Storage,
        progress: Arc<dyn ProgressReporter>,
    ) -> Result<ExtractionReport> {
        let start = Instant::now();
        let total = chunks.len();

        progress.phase("Extracting entries");
        let observer = Arc::new(SchedulerProgress {
            inner: progress.clone(),
            total,
            completed: AtomicUsize::new(0),
        });

        let client = self.client.clone();
        let tag_rules = self.tag_rules.clone();
        let worker = move |_index: usize, chunk: Chunk| {
            let client = client.clone();
            let tag_rules = tag_rules.clone();
            async move { extract_chunk(client.as_ref(), &tag_rules, &chunk).await }
        };

        let outcome = self.scheduler.run(chunks.clone(), worker, observer).await;

        progress.phase("Merging results");
        let mode = self.merge_mode();
        let mut processed = 0;
        let mut errors = Vec::new();

        let mut results = outcome.results;
        let mut outcome_errors = outcome.errors;
        for (slot, chunk) in chunks.iter().enumerate() {
            if let Some(extracted) = results[slot].take() {
                self.merge_extracted(chunk, extracted, mode, storage).await?;
                processed += 1;
            } else if let Some(err) = outcome_errors[slot].take() {
                warn!(chunk = chunk.index, error = %err, "chunk failed");
                errors.push((chunk.index, err));
            }
        }

        // Partial failure is an outcome, not a batch failure; an explicit
        // abort is. Results settled before the abort are already persisted.
        if self.scheduler.is_aborted() {
            return Err(LoresmithError::Aborted);
        }

        let report = ExtractionReport {
            processed,
            errors,
            entry_count: entry_count(self.engine.worldbook()),
            elapsed: start.elapsed(),
        };

        info!(
            processed = report.processed,
            failed = report.errors.len(),
            entries = report.entry_count,
            elapsed_ms = report.elapsed.as_millis(),
            "extraction batch complete"
        );
        progress.done(&report);

        Ok(report)
    }

    /// Re-generate one chunk and retain the attempt as a roll record.
    /// Does not merge: selection between rolls is the caller's choice.
    pub async fn reroll(&self, chunk: &Chunk, storage: &Storage) -> Result<RollRecord> {
        let extracted = extract_chunk(self.client.as_ref(), &self.tag_rules, chunk).await?;
        let record = roll_record(chunk.index, &extracted);
        storage.append_roll(&self.config.book_id, &record).await?;
        info!(chunk = chunk.index, "roll recorded");
        Ok(record)
    }

    /// Merge a previously recorded roll into the worldbook.
    pub async fn apply_roll(
        &mut self,
        chunk: &Chunk,
        roll: &RollRecord,
        storage: &Storage,
    ) -> Result<Vec<ChangedEntry>> {
        let mut book = roll.result.clone();
        apply_chapter_suffix(
            &mut book,
            &self.config.merge.chapter_suffix_categories,
            chunk.index + 1,
        );
        let changed = self
            .engine
            .merge_chunk(chunk.index, &chunk.title, &book, self.merge_mode());
        self.persist_merge(storage, &changed).await?;
        Ok(changed)
    }

    /// Detect and collapse aliased entries across all categories.
    /// Returns the confirmed groups per category.
    #[instrument(skip_all, fields(book_id = %self.config.book_id))]
    pub async fn dedupe(
        &mut self,
        storage: &Storage,
        progress: Arc<dyn ProgressReporter>,
    ) -> Result<Vec<(String, Vec<DuplicateGroup>)>> {
        let category_names: Vec<String> = self.engine.worldbook().keys().cloned().collect();
        let mut confirmed = Vec::new();

        for name in category_names {
            progress.phase(&format!("Resolving duplicates: {name}"));
            let Some(category) = self.engine.worldbook().get(&name).cloned() else {
                continue;
            };

            let groups = self
                .resolver
                .resolve_category(self.client.clone(), &self.scheduler, &name, &category)
                .await?;
            if groups.is_empty() {
                continue;
            }

            let marker = self
                .engine
                .history()
                .iter()
                .map(|r| r.memory_index)
                .max()
                .unwrap_or(0);
            let changed = self.engine.merge_confirmed_duplicates(
                marker,
                &format!("duplicate merge: {name}"),
                &name,
                &groups,
            );
            self.persist_merge(storage, &changed).await?;
            confirmed.push((name, groups));
        }

        Ok(confirmed)
    }

    fn merge_mode(&self) -> MergeMode {
        if self.config.merge.incremental {
            MergeMode::Incremental
        } else {
            MergeMode::Full
        }
    }

    /// Fold one extraction into the worldbook and persist the outcome.
    async fn merge_extracted(
        &mut self,
        chunk: &Chunk,
        extracted: Extracted,
        mode: MergeMode,
        storage: &Storage,
    ) -> Result<()> {
        let Extracted {
            mut book,
            prompt,
            response,
        } = extracted;

        apply_chapter_suffix(
            &mut book,
            &self.config.merge.chapter_suffix_categories,
            chunk.index + 1,
        );

        let changed = self
            .engine
            .merge_chunk(chunk.index, &chunk.title, &book, mode);
        self.persist_merge(storage, &changed).await?;

        let record = RollRecord {
            chunk_index: chunk.index,
            prompt_hash: prompt_hash(&prompt),
            prompt,
            response,
            result: book,
            created_at: Utc::now(),
        };
        storage.append_roll(&self.config.book_id, &record).await?;

        Ok(())
    }

    /// Mirror the newest history record and save the worldbook.
    async fn persist_merge(&self, storage: &Storage, changed: &[ChangedEntry]) -> Result<()> {
        if !changed.is_empty() {
            if let Some(record) = self.engine.history().last() {
                storage
                    .append_history(&self.config.book_id, record)
                    .await?;
            }
        }
        storage
            .save_worldbook(
                &self.config.book_id,
                &self.config.book_name,
                self.engine.worldbook(),
            )
            .await
    }
}

// ---------------------------------------------------------------------------
// Per-chunk extraction
// ---------------------------------------------------------------------------

/// One extraction call: prompt → invoke → tag-strip → repair-parse →
/// normalize. Provider errors are classified so token-limit failures
/// surface as `TokenLimit` instead of being retried unchanged.
async fn extract_chunk<M: ModelClient>(
    client: &M,
    tag_rules: &[TagRule],
    chunk: &Chunk,
) -> Result<Extracted> {
    let prompt = extraction_user_prompt(chunk);
    let response = client
        .invoke(extraction_messages(chunk))
        .await
        .map_err(classify_provider_error)?;

    let filtered = strip_tags(&response, tag_rules);
    let value = parse(&filtered)?;
    let book = normalize_book(&value);

    Ok(Extracted {
        book,
        prompt,
        response,
    })
}

/// Build tag rules from the parser settings.
fn tag_rules_from(settings: &ParserSettings) -> Vec<TagRule> {
    let mut rules: Vec<TagRule> = settings
        .strip_enclosed
        .iter()
        .map(|(open, close)| TagRule::enclosed(open, close))
        .collect();
    rules.extend(
        settings
            .strip_preamble
            .iter()
            .map(|close| TagRule::preamble(close)),
    );
    rules
}

/// SHA-256 of the prompt, for grouping identical re-runs.
fn prompt_hash(prompt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn roll_record(chunk_index: usize, extracted: &Extracted) -> RollRecord {
    RollRecord {
        chunk_index,
        prompt_hash: prompt_hash(&extracted.prompt),
        prompt: extracted.prompt.clone(),
        response: extracted.response.clone(),
        result: extracted.book.clone(),
        created_at: Utc::now(),
    }
}
