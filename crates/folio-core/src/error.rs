//! Error types for folio-core

use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

/// Result type alias using folio-core Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by producers, summarizers, and stores
#[derive(Error, Debug)]
pub enum Error {
    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Filesystem access failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The response producer failed
    #[error("Producer error: {0}")]
    Producer(String),

    /// Rate limit exceeded
    #[error("Rate limited: retry after {retry_after:?} seconds")]
    RateLimited { retry_after: Option<u64> },

    /// The producer was cancelled
    #[error("Request aborted")]
    Aborted,

    /// Context overflow / too many tokens
    #[error("Context overflow: {0}")]
    ContextOverflow(String),

    /// The summarizer failed
    #[error("Summarizer error: {0}")]
    Summarizer(String),

    /// The durable store failed
    #[error("Store error: {0}")]
    Store(String),
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::RateLimited { .. } => true,
            Error::Producer(message) => is_transient(message),
            _ => false,
        }
    }

    /// Check if this error indicates a context overflow / too many tokens
    pub fn is_context_overflow(&self) -> bool {
        match self {
            Error::ContextOverflow(_) => true,
            Error::Producer(message) => is_context_overflow(message),
            _ => false,
        }
    }
}

/// Check if an error string describes a transient failure
fn is_transient(error: &str) -> bool {
    let lower = error.to_lowercase();
    lower.contains("429")
        || lower.contains("rate limit")
        || lower.contains("timeout")
        || lower.contains("connection")
        || lower.contains("overloaded")
        || ["500", "502", "503", "504"]
            .iter()
            .any(|code| lower.contains(code))
}

/// Compiled regex patterns for detecting context overflow errors across providers.
static OVERFLOW_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)context.?length.?exceed",
        r"(?i)maximum.?context.?length",
        r"(?i)context.?window.?(exceed|full|limit)",
        r"(?i)too.?many.?tokens",
        r"(?i)prompt.?is.?too.?long",
        r"(?i)input.?too.?long",
        r"(?i)token.?limit.?(exceed|reach)",
        r"(?i)request.?too.?large",
        r"(?i)reduce.?the.?length",
        r"(?i)context_length_exceeded",
        r"(?i)exceeds?.+token.?limit",
        r"(?i)context.?overflow",
        r"\b413\b",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

/// Check if an error string indicates a context overflow / too many tokens
pub fn is_context_overflow(error: &str) -> bool {
    OVERFLOW_PATTERNS.iter().any(|re| re.is_match(error))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_variants() {
        assert!(Error::RateLimited { retry_after: Some(5) }.is_retryable());
        assert!(Error::Producer("503 Service Unavailable".into()).is_retryable());
        assert!(Error::Producer("API is overloaded right now".into()).is_retryable());
    }

    #[test]
    fn test_not_retryable() {
        assert!(!Error::Aborted.is_retryable());
        assert!(!Error::ContextOverflow("too big".into()).is_retryable());
        assert!(!Error::Producer("invalid API key".into()).is_retryable());
    }

    #[test]
    fn test_overflow_typed_variant() {
        assert!(Error::ContextOverflow("too big".into()).is_context_overflow());
    }

    #[test]
    fn test_overflow_from_producer_message() {
        assert!(Error::Producer("prompt is too long".into()).is_context_overflow());
        assert!(
            Error::Producer(
                "This model's maximum context length is 128000 tokens".into()
            )
            .is_context_overflow()
        );
        assert!(is_context_overflow("HTTP 413 Payload Too Large"));
    }

    #[test]
    fn test_no_overflow_normal_errors() {
        assert!(!is_context_overflow("401 Unauthorized"));
        assert!(!is_context_overflow("rate limit exceeded"));
        assert!(!is_context_overflow("connected to port 14001"));
    }
}
