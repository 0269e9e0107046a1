//! folio-session: resumable streaming session engine
//!
//! This crate manages long-running, incrementally produced assistant turns:
//! buffering them per conversation, persisting them so a reconnecting client
//! can resume mid-turn, resolving exactly one terminal outcome per turn, and
//! keeping the durable conversation history those turns are appended to.

pub mod compaction;
pub mod config;
pub mod driver;
pub mod error;
pub mod events;
pub mod handle;
pub mod history;
pub mod producer;
pub mod repair;
pub mod store;
pub mod stream;
pub mod summarizer;
pub mod tokens;
pub mod turn;

#[cfg(test)]
mod testing;

pub use compaction::CompactionReason;
pub use config::{HistoryConfig, PruneOptions, SessionConfig, StreamConfig};
pub use driver::SessionDriver;
pub use error::{Error, Result};
pub use events::{ChatMessage, ChunkKind, ClientMessage, ControlMessage, ErrorContent, StreamChunk};
pub use handle::TurnHandle;
pub use history::{ContextOptions, HistoryManager};
pub use producer::{Producer, RetryConfig, RetryingProducer, RunConfig};
pub use store::{FileStore, HistoryStore, MemoryStore};
pub use stream::{CompletionReason, Resumed, StreamSessionManager, spawn_orphan_sweeper};
pub use summarizer::{ProducerSummarizer, Summarizer};
pub use turn::TurnRunner;
