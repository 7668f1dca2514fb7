//! Token-limit error classification.
//!
//! Providers signal context-length overflow with wildly different phrasings.
//! Callers use this classification to decide whether to split a chunk and
//! retry rather than retrying unchanged.

use loresmith_shared::LoresmithError;

/// Provider-specific phrases that indicate a context-length overflow.
const TOKEN_LIMIT_PATTERNS: &[&str] = &[
    "context length",
    "context_length_exceeded",
    "maximum context",
    "context window",
    "token limit",
    "tokens exceed",
    "too many tokens",
    "max_tokens",
    "prompt is too long",
    "input is too long",
    "input token count",
    "reduce the length of the messages",
];

/// Whether an error message indicates a context-length overflow.
pub fn is_token_limit_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    TOKEN_LIMIT_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Reclassify a provider error as `TokenLimit` when its message matches.
/// Other errors pass through unchanged.
pub fn classify_provider_error(err: LoresmithError) -> LoresmithError {
    match err {
        LoresmithError::Provider { message } if is_token_limit_message(&message) => {
            LoresmithError::TokenLimit { message }
        }
        other => other,
    }
}
