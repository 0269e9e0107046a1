//! Error types for folio-session

use thiserror::Error;

/// Result type alias using folio-session Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the session engine
#[derive(Error, Debug)]
pub enum Error {
    /// An error from the core layer (producer, summarizer, store I/O)
    #[error(transparent)]
    Core(#[from] folio_core::Error),

    /// The conversation no longer accepts turns
    #[error("Conversation {0} is closed")]
    ConversationClosed(String),

    /// The conversation's actor stopped before replying
    #[error("Session actor for conversation {0} is unavailable")]
    ActorUnavailable(String),

    /// An error during compaction (string-based for flexibility)
    #[error("Compaction error: {0}")]
    Compaction(String),

    /// A generic session error
    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Core(folio_core::Error::Json(e))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Core(folio_core::Error::Io(e))
    }
}

impl Error {
    /// Check if this error indicates a context overflow
    pub fn is_context_overflow(&self) -> bool {
        match self {
            Error::Core(e) => e.is_context_overflow(),
            _ => false,
        }
    }

    /// Check if this error is worth retrying
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Core(e) => e.is_retryable(),
            _ => false,
        }
    }
}
