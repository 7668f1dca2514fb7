//! Response-repair JSON parser.
//!
//! Model output is expected to contain a JSON object, but is frequently
//! wrapped in commentary, code fences, or contains unescaped quotes. The
//! cascade below applies repair strategies in order, cheapest/most-correct
//! first and most-permissive last, each attempted only if the previous
//! failed:
//!
//! 1. Parse the trimmed text directly.
//! 2. Strip Markdown code-fence markers, then parse.
//! 3. Slice from the first `{` to the last `}`, then parse.
//! 4. Repair unescaped quotes inside strings, then parse.
//! 5. Extract the longest balanced `{…}` substring found anywhere, then parse.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use loresmith_shared::{LoresmithError, Result};

/// How much of the offending text a `ParseError` carries for diagnostics.
const ERROR_CONTEXT_CHARS: usize = 300;

static FENCE_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```[a-zA-Z]*\s*(.*?)```").expect("fence regex")
});

/// Parse degraded model output into a JSON value, repairing as needed.
pub fn parse(raw: &str) -> Result<Value> {
    let trimmed = raw.trim();

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Ok(value);
    }

    if let Some(unfenced) = strip_code_fences(trimmed) {
        if let Ok(value) = serde_json::from_str::<Value>(unfenced.trim()) {
            tracing::debug!("parsed after stripping code fences");
            return Ok(value);
        }
    }

    if let Some(sliced) = outer_object_slice(trimmed) {
        if let Ok(value) = serde_json::from_str::<Value>(sliced) {
            tracing::debug!("parsed outer object slice");
            return Ok(value);
        }

        let repaired = repair_quotes(sliced);
        if let Ok(value) = serde_json::from_str::<Value>(&repaired) {
            tracing::debug!("parsed after quote repair");
            return Ok(value);
        }
    }

    if let Some(candidate) = longest_balanced_object(trimmed) {
        if let Ok(value) = serde_json::from_str::<Value>(candidate) {
            tracing::debug!(len = candidate.len(), "parsed longest balanced object");
            return Ok(value);
        }
    }

    Err(LoresmithError::parse(format!(
        "no repair strategy produced valid JSON from: {}",
        truncate_chars(trimmed, ERROR_CONTEXT_CHARS)
    )))
}

/// Extract the body of the first fenced block, or drop fence marker lines if
/// the block is unterminated.
fn strip_code_fences(text: &str) -> Option<String> {
    if !text.contains("```") {
        return None;
    }
    if let Some(caps) = FENCE_BLOCK.captures(text) {
        return Some(caps[1].to_string());
    }
    // Unterminated fence: drop the marker lines themselves.
    let kept: Vec<&str> = text
        .lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect();
    Some(kept.join("\n"))
}

/// Slice from the first `{` to the last `}`, inclusive.
fn outer_object_slice(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end > start { Some(&text[start..=end]) } else { None }
}

/// Escape unescaped quotes inside JSON strings.
///
/// Scans character by character tracking an "inside string" flag. A quote
/// inside a string closes it only when the next non-whitespace character is
/// a structural one (`:`, `,`, `}`, `]`) or the end of input; any other
/// quote is a literal embedded in generated prose and gets escaped in place.
pub fn repair_quotes(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len() + 8);
    let mut in_string = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if in_string && c == '\\' {
            out.push(c);
            if i + 1 < chars.len() {
                out.push(chars[i + 1]);
                i += 2;
                continue;
            }
            i += 1;
            continue;
        }

        if c == '"' {
            if !in_string {
                in_string = true;
                out.push(c);
            } else {
                let next = chars[i + 1..].iter().copied().find(|ch| !ch.is_whitespace());
                match next {
                    Some(':') | Some(',') | Some('}') | Some(']') | None => {
                        in_string = false;
                        out.push(c);
                    }
                    _ => {
                        out.push('\\');
                        out.push('"');
                    }
                }
            }
        } else {
            out.push(c);
        }
        i += 1;
    }

    out
}

/// Find the longest balanced `{…}` substring anywhere in the text, honoring
/// strings and escapes so braces inside content don't break the count.
fn longest_balanced_object(text: &str) -> Option<&str> {
    let mut best: Option<(usize, usize)> = None;

    let mut depth = 0usize;
    let mut start = None;
    let mut in_string = false;
    let mut escaped = false;

    for (pos, c) in text.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => {
                if depth == 0 {
                    start = Some(pos);
                }
                depth += 1;
            }
            '}' => {
                if depth > 0 {
                    depth -= 1;
                    if depth == 0 {
                        let begin = start.take().unwrap_or(pos);
                        let end = pos + c.len_utf8();
                        if best.is_none_or(|(b, e)| end - begin > e - b) {
                            best = Some((begin, end));
                        }
                    }
                }
            }
            _ => {}
        }
    }

    best.map(|(begin, end)| &text[begin..end])
}

/// Truncate to at most `max` characters on a char boundary.
fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((pos, _)) => &text[..pos],
        None => text,
    }
}
