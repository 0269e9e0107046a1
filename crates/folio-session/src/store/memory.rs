//! In-memory store, for tests and single-process deployments

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use folio_core::{ConversationRecord, NewMessage, StoredMessage, StreamStateRecord};
use parking_lot::Mutex;

use super::HistoryStore;
use crate::error::Result;

#[derive(Default)]
struct Tables {
    conversations: HashMap<String, ConversationRecord>,
    messages: HashMap<String, BTreeMap<u64, StoredMessage>>,
    streams: HashMap<String, StreamStateRecord>,
}

/// A [`HistoryStore`] backed by maps behind a single lock
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryStore for MemoryStore {
    async fn conversation(&self, id: &str) -> Result<Option<ConversationRecord>> {
        Ok(self.tables.lock().conversations.get(id).cloned())
    }

    async fn upsert_conversation(&self, conversation: ConversationRecord) -> Result<()> {
        self.tables
            .lock()
            .conversations
            .insert(conversation.id.clone(), conversation);
        Ok(())
    }

    async fn append_messages(
        &self,
        conversation_id: &str,
        messages: Vec<NewMessage>,
    ) -> Result<Vec<StoredMessage>> {
        let mut tables = self.tables.lock();
        let log = tables
            .messages
            .entry(conversation_id.to_string())
            .or_default();

        let mut next = log.keys().next_back().copied().unwrap_or(0) + 1;
        let mut stored = Vec::with_capacity(messages.len());
        for message in messages {
            let row = StoredMessage::from_new(conversation_id, next, message);
            log.insert(next, row.clone());
            stored.push(row);
            next += 1;
        }
        Ok(stored)
    }

    async fn messages(&self, conversation_id: &str) -> Result<Vec<StoredMessage>> {
        Ok(self
            .tables
            .lock()
            .messages
            .get(conversation_id)
            .map(|log| log.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn stream_state(&self, conversation_id: &str) -> Result<Option<StreamStateRecord>> {
        Ok(self.tables.lock().streams.get(conversation_id).cloned())
    }

    async fn upsert_stream_state(&self, state: StreamStateRecord) -> Result<()> {
        self.tables
            .lock()
            .streams
            .insert(state.conversation_id.clone(), state);
        Ok(())
    }

    async fn delete_stream_state(&self, conversation_id: &str) -> Result<()> {
        self.tables.lock().streams.remove(conversation_id);
        Ok(())
    }

    async fn stream_states(&self) -> Result<Vec<StreamStateRecord>> {
        Ok(self.tables.lock().streams.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_core::Role;

    #[tokio::test]
    async fn test_append_assigns_contiguous_sequences() {
        let store = MemoryStore::new();
        let first = store
            .append_messages("c1", vec![NewMessage::new(Role::User, "hi")])
            .await
            .unwrap();
        let second = store
            .append_messages(
                "c1",
                vec![
                    NewMessage::new(Role::Assistant, "hello"),
                    NewMessage::new(Role::User, "again"),
                ],
            )
            .await
            .unwrap();

        assert_eq!(first[0].sequence, 1);
        assert_eq!(
            second.iter().map(|m| m.sequence).collect::<Vec<_>>(),
            vec![2, 3]
        );

        let other = store
            .append_messages("c2", vec![NewMessage::new(Role::User, "x")])
            .await
            .unwrap();
        assert_eq!(other[0].sequence, 1);
    }

    #[tokio::test]
    async fn test_stream_state_delete_is_idempotent() {
        let store = MemoryStore::new();
        store.delete_stream_state("missing").await.unwrap();
        assert!(store.stream_state("missing").await.unwrap().is_none());
    }
}
