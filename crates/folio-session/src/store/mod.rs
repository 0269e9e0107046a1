//! Durable storage for conversations, messages, and in-flight stream state
//!
//! The engine only needs upsert, point-read, ordered range-scan, and delete, so
//! backends stay small. Sequence numbers are assigned by the store on append,
//! which keeps each conversation's log contiguous without coordination in the
//! callers.

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use folio_core::{ConversationRecord, NewMessage, StoredMessage, StreamStateRecord};

use crate::error::Result;

/// Durable row store behind the history manager and the stream sessions
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Point-read a conversation row
    async fn conversation(&self, id: &str) -> Result<Option<ConversationRecord>>;

    /// Insert or replace a conversation row
    async fn upsert_conversation(&self, conversation: ConversationRecord) -> Result<()>;

    /// Append messages in order, assigning the next sequence numbers.
    /// Returns the stored rows.
    async fn append_messages(
        &self,
        conversation_id: &str,
        messages: Vec<NewMessage>,
    ) -> Result<Vec<StoredMessage>>;

    /// All messages of a conversation in increasing sequence order
    async fn messages(&self, conversation_id: &str) -> Result<Vec<StoredMessage>>;

    /// Point-read a conversation's stream state
    async fn stream_state(&self, conversation_id: &str) -> Result<Option<StreamStateRecord>>;

    /// Insert or replace a stream state row
    async fn upsert_stream_state(&self, state: StreamStateRecord) -> Result<()>;

    /// Delete a stream state row; deleting a missing row is not an error
    async fn delete_stream_state(&self, conversation_id: &str) -> Result<()>;

    /// Every stream state row
    async fn stream_states(&self) -> Result<Vec<StreamStateRecord>>;
}
