//! Normalization of parsed model output into canonical worldbook shape.
//!
//! Models are inconsistent about field names: the same logical field arrives
//! as `content` or `description`, keywords as `keywords` or `keys`.
//! Normalization produces one canonical schema immediately on ingest so
//! downstream code never branches on field presence. Malformed entries are
//! tolerated and coerced, not rejected.

use serde_json::Value;
use tracing::warn;

use loresmith_shared::{Category, Entry, Worldbook};

/// Alias pairs for the content field, canonical name first.
const CONTENT_FIELDS: [&str; 2] = ["content", "description"];

/// Alias pairs for the keywords field, canonical name first.
const KEYWORD_FIELDS: [&str; 2] = ["keywords", "keys"];

/// Convert a parsed JSON object into a canonical [`Worldbook`].
///
/// The expected shape is `{category: {entry_name: entry}}`. Non-object
/// category values are skipped; non-object entry values are coerced into
/// content-only entries.
pub fn normalize_book(value: &Value) -> Worldbook {
    let mut book = Worldbook::new();

    let Some(categories) = value.as_object() else {
        warn!("model output is not a JSON object, producing empty book");
        return book;
    };

    for (category_name, entries) in categories {
        let Some(entries) = entries.as_object() else {
            warn!(category = %category_name, "category value is not an object, skipping");
            continue;
        };

        let mut category = Category::new();
        for (entry_name, raw) in entries {
            category.insert(entry_name.clone(), normalize_entry(raw));
        }
        if !category.is_empty() {
            book.insert(category_name.clone(), category);
        }
    }

    book
}

/// Coerce one raw entry value into a canonical [`Entry`].
pub fn normalize_entry(raw: &Value) -> Entry {
    match raw {
        Value::Object(fields) => {
            // When both aliases are present the longer value wins: more
            // detail is assumed more complete.
            let content = CONTENT_FIELDS
                .iter()
                .filter_map(|f| fields.get(*f).and_then(Value::as_str))
                .max_by_key(|s| s.chars().count())
                .unwrap_or_default()
                .to_string();

            let mut keywords = Vec::new();
            for field in KEYWORD_FIELDS {
                match fields.get(field) {
                    Some(Value::Array(items)) => {
                        for item in items {
                            if let Some(s) = item.as_str() {
                                push_unique(&mut keywords, s);
                            }
                        }
                    }
                    Some(Value::String(s)) => push_unique(&mut keywords, s),
                    _ => {}
                }
            }

            Entry { keywords, content }
        }
        Value::String(s) => Entry {
            keywords: Vec::new(),
            content: s.clone(),
        },
        other => Entry {
            keywords: Vec::new(),
            content: other.to_string(),
        },
    }
}

fn push_unique(keywords: &mut Vec<String>, candidate: &str) {
    let candidate = candidate.trim();
    if candidate.is_empty() {
        return;
    }
    if !keywords.iter().any(|k| k == candidate) {
        keywords.push(candidate.to_string());
    }
}

// ---------------------------------------------------------------------------
// Chapter-suffix pass
// ---------------------------------------------------------------------------

/// Rewrite or append the chapter number into entry names of designated
/// categories — a de-duplication aid for plot-outline-like categories where
/// consecutive chunks describe sequential events under the same name.
///
/// A pure string-rewrite pass applied before merge, not a merge rule.
pub fn apply_chapter_suffix(book: &mut Worldbook, categories: &[String], chapter: usize) {
    for category_name in categories {
        let Some(entries) = book.get_mut(category_name) else {
            continue;
        };

        let renamed: Vec<(String, String)> = entries
            .keys()
            .filter_map(|name| {
                let suffixed = suffix_name(name, chapter);
                (suffixed != *name).then(|| (name.clone(), suffixed))
            })
            .collect();

        for (old, new) in renamed {
            if let Some(entry) = entries.remove(&old) {
                entries.entry(new).or_insert(entry);
            }
        }
    }
}

/// Rewrite a trailing `(n)` suffix to the given chapter, or append one.
fn suffix_name(name: &str, chapter: usize) -> String {
    let trimmed = name.trim_end();
    if let Some(stripped) = trimmed.strip_suffix(')') {
        if let Some(open) = stripped.rfind('(') {
            let digits = &stripped[open + 1..];
            if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
                return format!("{}({chapter})", &stripped[..open]);
            }
        }
    }
    format!("{trimmed}({chapter})")
}
