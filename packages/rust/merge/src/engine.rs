//! The merge/versioning engine.
//!
//! Folds one chunk's normalized result into the cumulative worldbook, in
//! full-overwrite or incremental mode, producing an auditable diff and an
//! append-only history of deep `previous` snapshots for rollback.
//!
//! The engine is the only legal mutator of its worldbook, and its merge
//! methods must be invoked sequentially per instance — the pipeline runs
//! them in its single completion loop, never concurrently.

use chrono::Utc;
use tracing::{debug, info};

use loresmith_shared::{
    ChangedEntry, DuplicateGroup, HistoryRecord, LoresmithError, MergeSettings, Result, Worldbook,
};

use crate::diff::diff_worldbooks;

// ---------------------------------------------------------------------------
// Options & mode
// ---------------------------------------------------------------------------

/// Runtime merge options.
#[derive(Debug, Clone)]
pub struct MergeOptions {
    /// Divider inserted between accumulated content blocks.
    pub content_divider: String,
    /// Leading characters of incoming content probed for the near-duplicate
    /// guard; 0 disables the guard.
    pub dedup_probe_chars: usize,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self::from(&MergeSettings::default())
    }
}

impl From<&MergeSettings> for MergeOptions {
    fn from(settings: &MergeSettings) -> Self {
        Self {
            content_divider: settings.content_divider.clone(),
            dedup_probe_chars: settings.dedup_probe_chars,
        }
    }
}

/// How a chunk result is folded into the worldbook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeMode {
    /// Deep-overwrite target data with source data — later chunks win on
    /// conflict, field by field.
    Full,
    /// Accumulate into existing entries: union keywords, append content.
    Incremental,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Owns the live worldbook and its merge history.
pub struct MergeEngine {
    worldbook: Worldbook,
    history: Vec<HistoryRecord>,
    options: MergeOptions,
}

impl MergeEngine {
    /// Create an engine with an empty worldbook.
    pub fn new(options: MergeOptions) -> Self {
        Self::with_worldbook(Worldbook::new(), options)
    }

    /// Create an engine resuming from previously accumulated state.
    pub fn with_worldbook(worldbook: Worldbook, options: MergeOptions) -> Self {
        Self {
            worldbook,
            history: Vec::new(),
            options,
        }
    }

    /// The live worldbook.
    pub fn worldbook(&self) -> &Worldbook {
        &self.worldbook
    }

    /// Merge records accumulated this session, oldest first.
    pub fn history(&self) -> &[HistoryRecord] {
        &self.history
    }

    /// Consume the engine, returning the live worldbook.
    pub fn into_worldbook(self) -> Worldbook {
        self.worldbook
    }

    /// Fold one chunk's result into the worldbook and record history.
    ///
    /// The pre-merge snapshot is deep-copied before mutation, so it stays
    /// valid after later chunks further mutate state. A merge that changes
    /// nothing writes no history record.
    pub fn merge_chunk(
        &mut self,
        memory_index: usize,
        memory_title: &str,
        source: &Worldbook,
        mode: MergeMode,
    ) -> Vec<ChangedEntry> {
        let previous = self.worldbook.clone();

        match mode {
            MergeMode::Full => self.merge_full(source),
            MergeMode::Incremental => self.merge_incremental(source),
        }

        let changed = diff_worldbooks(&previous, &self.worldbook);
        debug!(
            memory_index,
            changes = changed.len(),
            ?mode,
            "merged chunk result"
        );

        if !changed.is_empty() {
            self.history.push(HistoryRecord {
                memory_index,
                memory_title: memory_title.to_string(),
                previous,
                changed: changed.clone(),
                created_at: Utc::now(),
            });
        }

        changed
    }

    /// Later chunks win on conflict, field by field: a non-empty source
    /// field replaces the target field, an empty one leaves it alone.
    fn merge_full(&mut self, source: &Worldbook) {
        for (category_name, entries) in source {
            let category = self.worldbook.entry(category_name.clone()).or_default();
            for (name, incoming) in entries {
                match category.get_mut(name) {
                    Some(existing) => {
                        if !incoming.content.is_empty() {
                            existing.content = incoming.content.clone();
                        }
                        if !incoming.keywords.is_empty() {
                            existing.keywords = incoming.keywords.clone();
                        }
                    }
                    None => {
                        category.insert(name.clone(), incoming.clone());
                    }
                }
            }
        }
    }

    /// Union keywords and append content behind the near-duplicate guard.
    fn merge_incremental(&mut self, source: &Worldbook) {
        for (category_name, entries) in source {
            let category = self.worldbook.entry(category_name.clone()).or_default();
            for (name, incoming) in entries {
                match category.get_mut(name) {
                    Some(existing) => {
                        union_keywords(&mut existing.keywords, &incoming.keywords);
                        append_content(&self.options, &mut existing.content, &incoming.content);
                    }
                    None => {
                        category.insert(name.clone(), incoming.clone());
                    }
                }
            }
        }
    }

    /// Restore the `previous` snapshot of the history record at `index` as
    /// the live worldbook. History is a log, not a branchable tree: later
    /// records are not deleted.
    pub fn rollback(&mut self, index: usize) -> Result<()> {
        let record = self.history.get(index).ok_or_else(|| {
            LoresmithError::validation(format!(
                "history index {index} out of range ({} records)",
                self.history.len()
            ))
        })?;
        self.worldbook = record.previous.clone();
        info!(index, memory_index = record.memory_index, "rolled back");
        Ok(())
    }

    /// Restore a snapshot loaded from the durable store.
    pub fn rollback_to(&mut self, record: &HistoryRecord) {
        self.worldbook = record.previous.clone();
        info!(memory_index = record.memory_index, "rolled back");
    }

    /// Fold confirmed duplicate groups: union keywords and concatenate
    /// content from every non-main member into `main_name`, then delete the
    /// non-main names. Records one history entry when anything changed.
    pub fn merge_confirmed_duplicates(
        &mut self,
        memory_index: usize,
        memory_title: &str,
        category_name: &str,
        groups: &[DuplicateGroup],
    ) -> Vec<ChangedEntry> {
        let previous = self.worldbook.clone();

        if let Some(category) = self.worldbook.get_mut(category_name) {
            for group in groups {
                let mut main = category.remove(&group.main_name).unwrap_or_default();

                for name in &group.names {
                    if name == &group.main_name {
                        continue;
                    }
                    let Some(victim) = category.remove(name) else {
                        continue;
                    };
                    union_keywords(&mut main.keywords, &victim.keywords);
                    if !victim.content.is_empty() {
                        if !main.content.is_empty() {
                            main.content.push_str(&self.options.content_divider);
                        }
                        main.content.push_str(&victim.content);
                    }
                }

                category.insert(group.main_name.clone(), main);
            }
        }

        let changed = diff_worldbooks(&previous, &self.worldbook);
        if !changed.is_empty() {
            info!(
                category = %category_name,
                groups = groups.len(),
                changes = changed.len(),
                "merged confirmed duplicates"
            );
            self.history.push(HistoryRecord {
                memory_index,
                memory_title: memory_title.to_string(),
                previous,
                changed: changed.clone(),
                created_at: Utc::now(),
            });
        }

        changed
    }
}

/// Union `incoming` into `target`, preserving order and dropping repeats.
fn union_keywords(target: &mut Vec<String>, incoming: &[String]) {
    for keyword in incoming {
        if !target.iter().any(|k| k == keyword) {
            target.push(keyword.clone());
        }
    }
}

/// Append `incoming` behind a divider unless its leading probe already
/// appears verbatim in `existing` — a cheap guard against runaway
/// duplication when the model re-emits unchanged descriptions.
fn append_content(options: &MergeOptions, existing: &mut String, incoming: &str) {
    if incoming.is_empty() {
        return;
    }
    if existing.is_empty() {
        existing.push_str(incoming);
        return;
    }
    if options.dedup_probe_chars > 0 {
        let probe: String = incoming.chars().take(options.dedup_probe_chars).collect();
        if existing.contains(&probe) {
            return;
        }
    }
    existing.push_str(&options.content_divider);
    existing.push_str(incoming);
}

#[cfg(test)]
mod tests {
    use super::*;
    use loresmith_shared::{Category, ChangeKind, Entry};

    fn result_with(category: &str, name: &str, keywords: &[&str], content: &str) -> Worldbook {
        let mut book = Worldbook::new();
        let mut cat = Category::new();
        cat.insert(
            name.into(),
            Entry {
                keywords: keywords.iter().map(|s| s.to_string()).collect(),
                content: content.into(),
            },
        );
        book.insert(category.into(), cat);
        book
    }

    fn engine() -> MergeEngine {
        MergeEngine::new(MergeOptions::default())
    }

    #[test]
    fn first_merge_adds_entries_and_history() {
        let mut engine = engine();
        let source = result_with("角色", "A", &["a"], "a hero");

        let changed = engine.merge_chunk(0, "Chapter 1", &source, MergeMode::Incremental);
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].kind, ChangeKind::Add);
        assert_eq!(engine.history().len(), 1);
        assert_eq!(engine.worldbook()["角色"]["A"].content, "a hero");
    }

    #[test]
    fn noop_merge_writes_no_history() {
        let mut engine = engine();
        let source = result_with("角色", "A", &["a"], "stable text");

        engine.merge_chunk(0, "c0", &source, MergeMode::Full);
        let changed = engine.merge_chunk(1, "c1", &source, MergeMode::Full);

        assert!(changed.is_empty());
        assert_eq!(engine.history().len(), 1);
    }

    #[test]
    fn incremental_merge_is_idempotent_on_exact_repeats() {
        let mut engine = engine();
        let source = result_with("角色", "A", &["a"], &"长".repeat(60));

        engine.merge_chunk(0, "c0", &source, MergeMode::Incremental);
        let len_after_first = engine.worldbook()["角色"]["A"].content.len();

        engine.merge_chunk(1, "c1", &source, MergeMode::Incremental);
        let len_after_second = engine.worldbook()["角色"]["A"].content.len();

        assert_eq!(len_after_first, len_after_second);
    }

    #[test]
    fn incremental_merge_accumulates_disjoint_content() {
        let mut engine = engine();
        engine.merge_chunk(
            0,
            "c0",
            &result_with("角色", "A", &["a"], "first description block"),
            MergeMode::Incremental,
        );
        let before = engine.worldbook()["角色"]["A"].content.len();

        engine.merge_chunk(
            1,
            "c1",
            &result_with("角色", "A", &["b"], "entirely different second block"),
            MergeMode::Incremental,
        );
        let entry = &engine.worldbook()["角色"]["A"];

        assert!(entry.content.len() > before);
        assert!(entry.content.contains("---"));
        assert_eq!(entry.keywords, vec!["a", "b"]);
    }

    #[test]
    fn disabled_probe_always_appends() {
        let mut engine = MergeEngine::new(MergeOptions {
            dedup_probe_chars: 0,
            ..MergeOptions::default()
        });
        let source = result_with("角色", "A", &[], "repeat me");

        engine.merge_chunk(0, "c0", &source, MergeMode::Incremental);
        engine.merge_chunk(1, "c1", &source, MergeMode::Incremental);

        let content = &engine.worldbook()["角色"]["A"].content;
        assert_eq!(content.matches("repeat me").count(), 2);
    }

    #[test]
    fn full_merge_overwrites_fields() {
        let mut engine = engine();
        engine.merge_chunk(
            0,
            "c0",
            &result_with("角色", "A", &["old"], "v1"),
            MergeMode::Full,
        );
        engine.merge_chunk(
            1,
            "c1",
            &result_with("角色", "A", &["new"], "v2"),
            MergeMode::Full,
        );

        let entry = &engine.worldbook()["角色"]["A"];
        assert_eq!(entry.content, "v2");
        assert_eq!(entry.keywords, vec!["new"]);
    }

    #[test]
    fn full_merge_keeps_fields_missing_from_source() {
        let mut engine = engine();
        engine.merge_chunk(
            0,
            "c0",
            &result_with("角色", "A", &["kept"], "kept body"),
            MergeMode::Full,
        );
        engine.merge_chunk(
            1,
            "c1",
            &result_with("角色", "A", &[], "new body"),
            MergeMode::Full,
        );

        let entry = &engine.worldbook()["角色"]["A"];
        assert_eq!(entry.content, "new body");
        assert_eq!(entry.keywords, vec!["kept"]);
    }

    #[test]
    fn history_snapshot_survives_later_mutation() {
        let mut engine = engine();
        engine.merge_chunk(
            0,
            "c0",
            &result_with("角色", "A", &[], "v1"),
            MergeMode::Full,
        );
        engine.merge_chunk(
            1,
            "c1",
            &result_with("角色", "A", &[], "v2"),
            MergeMode::Full,
        );

        // The second record's snapshot still holds the pre-v2 state.
        let record = &engine.history()[1];
        assert_eq!(record.previous["角色"]["A"].content, "v1");
    }

    #[test]
    fn rollback_restores_previous_without_truncating_history() {
        let mut engine = engine();
        engine.merge_chunk(
            0,
            "c0",
            &result_with("角色", "A", &[], "v1"),
            MergeMode::Full,
        );
        engine.merge_chunk(
            1,
            "c1",
            &result_with("角色", "A", &[], "v2"),
            MergeMode::Full,
        );

        engine.rollback(1).expect("rollback");
        assert_eq!(engine.worldbook()["角色"]["A"].content, "v1");
        assert_eq!(engine.history().len(), 2);

        assert!(engine.rollback(9).is_err());
    }

    #[test]
    fn confirmed_duplicates_fold_into_main() {
        let mut engine = engine();
        let mut source = result_with("角色", "Aria", &["aria"], "full name entry");
        source.get_mut("角色").unwrap().insert(
            "小雅".into(),
            Entry {
                keywords: vec!["ya".into()],
                content: "nickname entry".into(),
            },
        );
        engine.merge_chunk(0, "c0", &source, MergeMode::Full);

        let groups = [DuplicateGroup {
            names: vec!["Aria".into(), "小雅".into()],
            main_name: "Aria".into(),
        }];
        let changed = engine.merge_confirmed_duplicates(0, "duplicate merge", "角色", &groups);

        let category = &engine.worldbook()["角色"];
        assert!(!category.contains_key("小雅"));
        let main = &category["Aria"];
        assert!(main.content.contains("full name entry"));
        assert!(main.content.contains("nickname entry"));
        assert_eq!(main.keywords, vec!["aria", "ya"]);

        assert!(changed.iter().any(|c| c.kind == ChangeKind::Delete));
        assert!(changed.iter().any(|c| c.kind == ChangeKind::Modify));
        assert_eq!(engine.history().len(), 2);
    }
}
