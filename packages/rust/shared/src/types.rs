//! Core domain types for Loresmith worldbooks.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Chunk
// ---------------------------------------------------------------------------

/// One unit of input text (e.g., one chapter) submitted for extraction.
/// Immutable once created; referenced by `index` throughout the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    /// Position of this chunk in the source document.
    pub index: usize,
    /// Display title (e.g., the chapter heading).
    pub title: String,
    /// Raw chunk text.
    pub content: String,
}

// ---------------------------------------------------------------------------
// Worldbook
// ---------------------------------------------------------------------------

/// A named structured fact with keywords and free-text content.
/// Identity is the `(category, name)` pair; the name is the map key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Trigger keywords. Unique; order is irrelevant.
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Free-text body of the entry.
    #[serde(default)]
    pub content: String,
}

/// Entries within one category, keyed by entry name.
pub type Category = BTreeMap<String, Entry>;

/// The cumulative output structure: category name → entry name → entry.
/// `BTreeMap` keeps iteration (and therefore diff output) deterministic.
pub type Worldbook = BTreeMap<String, Category>;

/// Total number of entries across all categories.
pub fn entry_count(book: &Worldbook) -> usize {
    book.values().map(|c| c.len()).sum()
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

/// The kind of change a merge applied to one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Add,
    Modify,
    Delete,
}

/// One entry-level change produced by a merge, the unit of history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangedEntry {
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    pub category: String,
    pub entry_name: String,
}

/// Append-only audit record written once per non-empty merge.
///
/// `previous` is a deep snapshot taken before mutation, never shared by
/// reference with the live worldbook, so it stays valid for rollback after
/// later chunks further mutate state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    /// Index of the chunk whose merge produced this record.
    pub memory_index: usize,
    /// Title of that chunk.
    pub memory_title: String,
    /// Deep snapshot of the worldbook before the merge.
    pub previous: Worldbook,
    /// Entry-level changes the merge applied.
    pub changed: Vec<ChangedEntry>,
    /// When the merge happened.
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Rolls
// ---------------------------------------------------------------------------

/// One re-generation attempt for a given chunk, retained append-only for
/// later comparison/selection. Never overwritten; superseded by newer
/// records with the same chunk index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollRecord {
    /// Index of the chunk this roll re-generated.
    pub chunk_index: usize,
    /// SHA-256 of the prompt, for grouping identical re-runs.
    pub prompt_hash: String,
    /// Full prompt text sent to the model.
    pub prompt: String,
    /// Raw model response text.
    pub response: String,
    /// Normalized extraction result parsed from the response.
    pub result: Worldbook,
    /// When the attempt ran.
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Duplicates
// ---------------------------------------------------------------------------

/// A group of entry names judged to refer to the same real-world thing.
/// Consumed by the merge engine, which folds every non-main member into
/// `main_name` and deletes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateGroup {
    /// All member names, including `main_name`.
    pub names: Vec<String>,
    /// The canonical name to keep.
    pub main_name: String,
}

// ---------------------------------------------------------------------------
// Chat messages
// ---------------------------------------------------------------------------

/// Message role in a model conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One message handed to the model-call collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_book() -> Worldbook {
        let mut book = Worldbook::new();
        let mut category = Category::new();
        category.insert(
            "Aria".into(),
            Entry {
                keywords: vec!["aria".into(), "captain".into()],
                content: "Captain of the northern fleet.".into(),
            },
        );
        book.insert("角色".into(), category);
        book
    }

    #[test]
    fn worldbook_roundtrip() {
        let book = sample_book();
        let json = serde_json::to_string(&book).expect("serialize");
        let parsed: Worldbook = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed, book);
        assert_eq!(entry_count(&parsed), 1);
    }

    #[test]
    fn entry_defaults_tolerate_missing_fields() {
        let parsed: Entry = serde_json::from_str(r#"{"content":"just text"}"#).expect("entry");
        assert!(parsed.keywords.is_empty());
        assert_eq!(parsed.content, "just text");
    }

    #[test]
    fn changed_entry_serializes_with_type_field() {
        let change = ChangedEntry {
            kind: ChangeKind::Add,
            category: "角色".into(),
            entry_name: "Aria".into(),
        };
        let json = serde_json::to_string(&change).expect("serialize");
        assert!(json.contains(r#""type":"add""#));
    }

    #[test]
    fn chat_message_roles_serialize_lowercase() {
        let msg = ChatMessage::system("extract entries");
        let json = serde_json::to_string(&msg).expect("serialize");
        assert!(json.contains(r#""role":"system""#));
    }

    #[test]
    fn history_record_roundtrip() {
        let record = HistoryRecord {
            memory_index: 3,
            memory_title: "Chapter 3".into(),
            previous: sample_book(),
            changed: vec![ChangedEntry {
                kind: ChangeKind::Modify,
                category: "角色".into(),
                entry_name: "Aria".into(),
            }],
            created_at: Utc::now(),
        };
        let json = serde_json::to_string(&record).expect("serialize");
        let parsed: HistoryRecord = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed.memory_index, 3);
        assert_eq!(parsed.changed.len(), 1);
        assert_eq!(entry_count(&parsed.previous), 1);
    }
}
