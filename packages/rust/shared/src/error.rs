//! Error types for Loresmith.
//!
//! Library crates use [`LoresmithError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all Loresmith operations.
#[derive(Debug, thiserror::Error)]
pub enum LoresmithError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Cooperative cancellation. Never retried; always propagates.
    #[error("aborted")]
    Aborted,

    /// Model output could not be coerced into structured data after all
    /// repair strategies.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Provider failure classified as a context-length overflow. Callers
    /// should split the chunk rather than retry unchanged.
    #[error("token limit exceeded: {message}")]
    TokenLimit { message: String },

    /// Model backend returned an error response.
    #[error("provider error: {message}")]
    Provider { message: String },

    /// Network/transport error reaching the model backend.
    #[error("network error: {0}")]
    Network(String),

    /// The model call timed out.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Data validation error (schema mismatch, invalid input, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, LoresmithError>;

impl LoresmithError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a provider error from any displayable message.
    pub fn provider(msg: impl Into<String>) -> Self {
        Self::Provider {
            message: msg.into(),
        }
    }

    /// Create a token-limit error from any displayable message.
    pub fn token_limit(msg: impl Into<String>) -> Self {
        Self::TokenLimit {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this error is a cooperative cancellation.
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted)
    }

    /// Whether this error is eligible for retry (transient provider-side
    /// failures). `Aborted` and `TokenLimit` are not: the former must
    /// propagate immediately, the latter requires the caller to split the
    /// chunk instead.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Provider { .. } | Self::Network(_) | Self::Timeout(_) | Self::Parse { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = LoresmithError::config("missing API key");
        assert_eq!(err.to_string(), "config error: missing API key");

        let err = LoresmithError::token_limit("prompt is too long");
        assert!(err.to_string().contains("token limit"));
    }

    #[test]
    fn aborted_is_not_retryable() {
        assert!(!LoresmithError::Aborted.is_retryable());
        assert!(LoresmithError::Aborted.is_aborted());
    }

    #[test]
    fn transient_errors_are_retryable() {
        assert!(LoresmithError::Network("connection reset".into()).is_retryable());
        assert!(LoresmithError::Timeout("120s elapsed".into()).is_retryable());
        assert!(LoresmithError::provider("rate limited").is_retryable());
        assert!(!LoresmithError::token_limit("context length").is_retryable());
    }
}
