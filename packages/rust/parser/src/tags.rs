//! Inline delimiter-tag filtering for model output.
//!
//! Models wrap answers in reasoning blocks or lead with commentary before
//! the real payload. Each rule either removes a tag pair with its content,
//! or removes everything up to and including a closing tag.

/// One tag-filtering rule.
#[derive(Debug, Clone)]
pub enum TagRule {
    /// Remove every `open`…`close` span including its content
    /// (e.g. `<think>…</think>` reasoning blocks).
    Enclosed { open: String, close: String },
    /// Remove everything from the start of the text up to and including the
    /// first `close` (leading commentary such as a reasoning preamble).
    Preamble { close: String },
}

impl TagRule {
    pub fn enclosed(open: impl Into<String>, close: impl Into<String>) -> Self {
        Self::Enclosed {
            open: open.into(),
            close: close.into(),
        }
    }

    pub fn preamble(close: impl Into<String>) -> Self {
        Self::Preamble {
            close: close.into(),
        }
    }
}

/// Apply every rule in order and return the filtered text.
pub fn strip_tags(text: &str, rules: &[TagRule]) -> String {
    let mut out = text.to_string();
    for rule in rules {
        out = match rule {
            TagRule::Enclosed { open, close } => strip_enclosed(&out, open, close),
            TagRule::Preamble { close } => strip_preamble(&out, close),
        };
    }
    out
}

/// Remove every `open`…`close` span. An unclosed trailing `open` is left
/// untouched.
fn strip_enclosed(text: &str, open: &str, close: &str) -> String {
    if open.is_empty() || close.is_empty() {
        return text.to_string();
    }
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    loop {
        match rest.find(open) {
            Some(start) => {
                let after_open = start + open.len();
                match rest[after_open..].find(close) {
                    Some(close_rel) => {
                        out.push_str(&rest[..start]);
                        rest = &rest[after_open + close_rel + close.len()..];
                    }
                    None => {
                        out.push_str(rest);
                        break;
                    }
                }
            }
            None => {
                out.push_str(rest);
                break;
            }
        }
    }
    out
}

/// Remove everything up to and including the first `close`. Text without
/// the tag passes through unchanged.
fn strip_preamble(text: &str, close: &str) -> String {
    if close.is_empty() {
        return text.to_string();
    }
    match text.find(close) {
        Some(pos) => text[pos + close.len()..].to_string(),
        None => text.to_string(),
    }
}
