//! Duplicate resolution: AI verification and union-find grouping.
//!
//! Candidate pairs are verified by the model — in one request, or batched
//! through the task scheduler when the pair count exceeds the threshold so a
//! single prompt stays within context budget. Confirmed pairs are unioned;
//! the connected components become the final duplicate groups.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use loresmith_parser::parse;
use loresmith_provider::ModelClient;
use loresmith_scheduler::{SilentObserver, TaskScheduler};
use loresmith_shared::{
    CanonicalStrategy, Category, ChatMessage, DuplicateGroup, LoresmithError, ResolverSettings,
    Result,
};

use crate::candidates::{CandidatePair, candidate_pairs};
use crate::union_find::UnionFind;

/// How much entry content each pair listing quotes for the model.
const EXCERPT_CHARS: usize = 160;

const VERDICT_SYSTEM_PROMPT: &str = "You judge whether two named worldbook entries refer to the \
same real-world thing under different names. Answer ONLY with JSON of the form \
{\"verdicts\":[{\"a\":\"name\",\"b\":\"name\",\"same\":true,\"keep\":\"name\"}]}. \
Set \"same\" to false when the entries are distinct. When \"same\" is true, set \"keep\" to \
whichever of the two names should remain as the canonical entry name.";

// ---------------------------------------------------------------------------
// Options & verdicts
// ---------------------------------------------------------------------------

/// Runtime resolver options.
#[derive(Debug, Clone)]
pub struct ResolverOptions {
    /// Above this many pairs, verification is batched through the scheduler.
    pub pair_batch_threshold: usize,
    /// Pairs per batched request.
    pub pair_batch_size: usize,
    /// Canonical-name selection strategy.
    pub canonical_strategy: CanonicalStrategy,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self::from(&ResolverSettings::default())
    }
}

impl From<&ResolverSettings> for ResolverOptions {
    fn from(settings: &ResolverSettings) -> Self {
        Self {
            pair_batch_threshold: settings.pair_batch_threshold,
            pair_batch_size: settings.pair_batch_size.max(1),
            canonical_strategy: settings.canonical_strategy,
        }
    }
}

/// One same-identity judgement from the model.
#[derive(Debug, Clone, Deserialize)]
pub struct PairVerdict {
    pub a: String,
    pub b: String,
    pub same: bool,
    #[serde(default)]
    pub keep: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VerdictPayload {
    verdicts: Vec<PairVerdict>,
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// Finds aliased entries within a category and produces merge instructions.
pub struct DuplicateResolver {
    options: ResolverOptions,
}

impl DuplicateResolver {
    pub fn new(options: ResolverOptions) -> Self {
        Self { options }
    }

    /// Detect, verify, and group duplicates in one category.
    #[instrument(skip_all, fields(category = %category_name, entries = category.len()))]
    pub async fn resolve_category<M: ModelClient>(
        &self,
        client: Arc<M>,
        scheduler: &TaskScheduler,
        category_name: &str,
        category: &Category,
    ) -> Result<Vec<DuplicateGroup>> {
        let pairs = candidate_pairs(category);
        if pairs.is_empty() {
            debug!("no candidate pairs");
            return Ok(Vec::new());
        }
        info!(pairs = pairs.len(), "verifying candidate pairs");

        let verdicts = if pairs.len() > self.options.pair_batch_threshold {
            self.verify_batched(client, scheduler, category_name, category, &pairs)
                .await
        } else {
            let prompt = render_verdict_prompt(category_name, category, &pairs);
            let text = client.invoke(verdict_messages(prompt)).await?;
            parse_verdicts(&text)?
        };

        Ok(self.group_verdicts(category, &pairs, &verdicts))
    }

    /// Verify pairs in scheduler-bounded batches. A failed batch drops its
    /// pairs (they stay unmerged) rather than failing the whole resolution.
    async fn verify_batched<M: ModelClient>(
        &self,
        client: Arc<M>,
        scheduler: &TaskScheduler,
        category_name: &str,
        category: &Category,
        pairs: &[CandidatePair],
    ) -> Vec<PairVerdict> {
        let prompts: Vec<String> = pairs
            .chunks(self.options.pair_batch_size)
            .map(|batch| render_verdict_prompt(category_name, category, batch))
            .collect();
        let batches = prompts.len();

        let worker = move |_index: usize, prompt: String| {
            let client = client.clone();
            async move {
                let text = client.invoke(verdict_messages(prompt)).await?;
                parse_verdicts(&text)
            }
        };

        let outcome = scheduler
            .run(prompts, worker, Arc::new(SilentObserver))
            .await;

        if outcome.error_count() > 0 {
            warn!(
                failed = outcome.error_count(),
                batches, "some verification batches failed; their pairs stay unmerged"
            );
        }

        outcome.results.into_iter().flatten().flatten().collect()
    }

    /// Union confirmed pairs and pick a canonical name per component.
    fn group_verdicts(
        &self,
        category: &Category,
        pairs: &[CandidatePair],
        verdicts: &[PairVerdict],
    ) -> Vec<DuplicateGroup> {
        let mut uf = UnionFind::new();
        for pair in pairs {
            uf.intern(&pair.a);
            uf.intern(&pair.b);
        }

        let mut nominations: Vec<String> = Vec::new();
        for verdict in verdicts {
            if !verdict.same {
                continue;
            }
            uf.union(&verdict.a, &verdict.b);
            // Only a nomination naming one of the judged pair counts.
            if let Some(keep) = &verdict.keep {
                if keep == &verdict.a || keep == &verdict.b {
                    nominations.push(keep.clone());
                }
            }
        }

        let groups: Vec<DuplicateGroup> = uf
            .groups()
            .into_iter()
            .map(|names| {
                let main_name = self.pick_canonical(&names, &nominations, category);
                DuplicateGroup { names, main_name }
            })
            .collect();

        info!(groups = groups.len(), "duplicate groups resolved");
        groups
    }

    /// Prefer the model's nomination when exactly one member was nominated;
    /// otherwise (missing or conflicting) fall back to the member with the
    /// longest existing content, a proxy for the most complete entry.
    fn pick_canonical(
        &self,
        members: &[String],
        nominations: &[String],
        category: &Category,
    ) -> String {
        if self.options.canonical_strategy == CanonicalStrategy::PreferNominated {
            let nominated: BTreeSet<&String> = nominations
                .iter()
                .filter(|n| members.contains(n))
                .collect();
            if nominated.len() == 1 {
                if let Some(name) = nominated.first() {
                    return (*name).clone();
                }
            }
        }

        members
            .iter()
            .max_by_key(|name| {
                category
                    .get(*name)
                    .map(|e| e.content.chars().count())
                    .unwrap_or(0)
            })
            .cloned()
            .unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Prompt & verdict parsing
// ---------------------------------------------------------------------------

fn verdict_messages(prompt: String) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(VERDICT_SYSTEM_PROMPT),
        ChatMessage::user(prompt),
    ]
}

/// Render one verification request listing every pair with keyword and
/// content context.
fn render_verdict_prompt(
    category_name: &str,
    category: &Category,
    pairs: &[CandidatePair],
) -> String {
    let mut out = format!(
        "Category: {category_name}\nJudge each candidate pair below.\n\n"
    );
    for (i, pair) in pairs.iter().enumerate() {
        out.push_str(&format!("Pair {}:\n", i + 1));
        out.push_str(&describe_entry(category, &pair.a));
        out.push_str(&describe_entry(category, &pair.b));
        out.push('\n');
    }
    out
}

fn describe_entry(category: &Category, name: &str) -> String {
    match category.get(name) {
        Some(entry) => {
            let excerpt: String = entry.content.chars().take(EXCERPT_CHARS).collect();
            format!(
                "- \"{name}\" (keywords: {}) {excerpt}\n",
                entry.keywords.join(", ")
            )
        }
        None => format!("- \"{name}\"\n"),
    }
}

/// Parse a verdict response: either `{"verdicts": […]}` or a bare array.
fn parse_verdicts(text: &str) -> Result<Vec<PairVerdict>> {
    let value = parse(text)?;

    if value.is_array() {
        return serde_json::from_value(value)
            .map_err(|e| LoresmithError::parse(format!("verdict list malformed: {e}")));
    }

    serde_json::from_value::<VerdictPayload>(value)
        .map(|p| p.verdicts)
        .map_err(|e| LoresmithError::parse(format!("verdict payload malformed: {e}")))
}
