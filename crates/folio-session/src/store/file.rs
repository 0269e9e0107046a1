//! File-backed store
//!
//! Layout under the root directory:
//!
//! ```text
//! conversations/<id>.json   one conversation row
//! messages/<id>.jsonl       append-only message log, one row per line
//! streams/<id>.json         in-flight stream state
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use folio_core::{ConversationRecord, NewMessage, StoredMessage, StreamStateRecord};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::HistoryStore;
use crate::error::{Error, Result};

/// A [`HistoryStore`] that keeps every table in plain files
pub struct FileStore {
    root: PathBuf,
    /// Last assigned sequence per conversation; the lock also serializes appends
    sequences: Mutex<HashMap<String, u64>>,
}

impl FileStore {
    /// Open (and create if needed) a store rooted at `root`
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for dir in ["conversations", "messages", "streams"] {
            fs::create_dir_all(root.join(dir)).await?;
        }
        Ok(Self {
            root,
            sequences: Mutex::new(HashMap::new()),
        })
    }

    /// Root directory of this store
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn conversation_path(&self, id: &str) -> Result<PathBuf> {
        Ok(self
            .root
            .join("conversations")
            .join(format!("{}.json", checked_id(id)?)))
    }

    fn messages_path(&self, id: &str) -> Result<PathBuf> {
        Ok(self
            .root
            .join("messages")
            .join(format!("{}.jsonl", checked_id(id)?)))
    }

    fn stream_path(&self, id: &str) -> Result<PathBuf> {
        Ok(self
            .root
            .join("streams")
            .join(format!("{}.json", checked_id(id)?)))
    }

    async fn read_log(&self, path: &Path) -> Result<Vec<StoredMessage>> {
        let content = match fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e.into()),
        };

        let mut messages = Vec::new();
        for line in content.lines() {
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<StoredMessage>(line) {
                Ok(message) => messages.push(message),
                Err(e) => {
                    tracing::warn!(path = %path.display(), "Skipping unreadable message row: {}", e);
                }
            }
        }
        messages.sort_by_key(|m| m.sequence);
        Ok(messages)
    }

    /// Last sequence in the log, and whether the log ends mid-line
    async fn log_tail(&self, path: &Path) -> Result<(u64, bool)> {
        let last = self
            .read_log(path)
            .await?
            .last()
            .map(|m| m.sequence)
            .unwrap_or(0);
        let torn = match fs::read(path).await {
            Ok(bytes) => bytes.last().is_some_and(|b| *b != b'\n'),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };
        Ok((last, torn))
    }
}

async fn append_bytes(path: &Path, buf: &[u8]) -> Result<()> {
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(buf).await?;
    file.flush().await?;
    Ok(())
}

/// Conversation ids become file names, so only a safe alphabet is accepted
fn checked_id(id: &str) -> Result<&str> {
    let valid = !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(id)
    } else {
        Err(Error::Other(format!("Invalid conversation id: {:?}", id)))
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Write through a temporary file so readers never see a torn row
async fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_vec(value)?).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

#[async_trait]
impl HistoryStore for FileStore {
    async fn conversation(&self, id: &str) -> Result<Option<ConversationRecord>> {
        read_json(&self.conversation_path(id)?).await
    }

    async fn upsert_conversation(&self, conversation: ConversationRecord) -> Result<()> {
        write_json(&self.conversation_path(&conversation.id)?, &conversation).await
    }

    async fn append_messages(
        &self,
        conversation_id: &str,
        messages: Vec<NewMessage>,
    ) -> Result<Vec<StoredMessage>> {
        let path = self.messages_path(conversation_id)?;
        let mut sequences = self.sequences.lock().await;

        let (last, torn_tail) = match sequences.get(conversation_id) {
            Some(last) => (*last, false),
            None => self.log_tail(&path).await?,
        };

        let stored: Vec<StoredMessage> = messages
            .into_iter()
            .enumerate()
            .map(|(i, m)| StoredMessage::from_new(conversation_id, last + 1 + i as u64, m))
            .collect();

        let mut buf = Vec::new();
        if torn_tail {
            buf.push(b'\n');
        }
        for row in &stored {
            serde_json::to_writer(&mut buf, row)?;
            buf.push(b'\n');
        }

        if let Err(e) = append_bytes(&path, &buf).await {
            // Part of the batch may be on disk; the next append re-reads the log.
            sequences.remove(conversation_id);
            return Err(e);
        }

        sequences.insert(conversation_id.to_string(), last + stored.len() as u64);
        Ok(stored)
    }

    async fn messages(&self, conversation_id: &str) -> Result<Vec<StoredMessage>> {
        self.read_log(&self.messages_path(conversation_id)?).await
    }

    async fn stream_state(&self, conversation_id: &str) -> Result<Option<StreamStateRecord>> {
        read_json(&self.stream_path(conversation_id)?).await
    }

    async fn upsert_stream_state(&self, state: StreamStateRecord) -> Result<()> {
        write_json(&self.stream_path(&state.conversation_id)?, &state).await
    }

    async fn delete_stream_state(&self, conversation_id: &str) -> Result<()> {
        match fs::remove_file(self.stream_path(conversation_id)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn stream_states(&self) -> Result<Vec<StreamStateRecord>> {
        let mut states = Vec::new();
        let mut entries = fs::read_dir(self.root.join("streams")).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            match read_json::<StreamStateRecord>(&path).await {
                Ok(Some(state)) => states.push(state),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), "Skipping unreadable stream state: {}", e);
                }
            }
        }
        Ok(states)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_core::{ContentPart, Role};

    fn temp_root(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("folio-store-{}-{}", name, uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn test_messages_survive_reopen() {
        let root = temp_root("reopen");
        {
            let store = FileStore::open(&root).await.unwrap();
            store
                .append_messages(
                    "conv-1",
                    vec![
                        NewMessage::new(Role::User, "question"),
                        NewMessage::new(Role::Assistant, vec![ContentPart::text("answer")]),
                    ],
                )
                .await
                .unwrap();
        }

        let store = FileStore::open(&root).await.unwrap();
        let appended = store
            .append_messages("conv-1", vec![NewMessage::new(Role::User, "follow-up")])
            .await
            .unwrap();
        assert_eq!(appended[0].sequence, 3);

        let messages = store.messages("conv-1").await.unwrap();
        assert_eq!(
            messages.iter().map(|m| m.sequence).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(messages[1].content.text(), "answer");

        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn test_failed_append_rereads_sequence() {
        let root = temp_root("failed-append");
        let store = FileStore::open(&root).await.unwrap();
        store
            .append_messages("conv-3", vec![NewMessage::new(Role::User, "one")])
            .await
            .unwrap();

        // Make the log unwritable, then let rows land behind the store's back.
        let log = root.join("messages").join("conv-3.jsonl");
        std::fs::remove_file(&log).unwrap();
        std::fs::create_dir(&log).unwrap();
        assert!(
            store
                .append_messages("conv-3", vec![NewMessage::new(Role::User, "lost")])
                .await
                .is_err()
        );
        std::fs::remove_dir(&log).unwrap();
        let mut content = String::new();
        for sequence in 1..=4 {
            let row = StoredMessage::from_new("conv-3", sequence, NewMessage::new(Role::User, "x"));
            content.push_str(&serde_json::to_string(&row).unwrap());
            content.push('\n');
        }
        content.push_str(r#"{"conversationId":"conv-3","seq"#);
        std::fs::write(&log, content).unwrap();

        let appended = store
            .append_messages("conv-3", vec![NewMessage::new(Role::User, "five")])
            .await
            .unwrap();
        assert_eq!(appended[0].sequence, 5);

        let messages = store.messages("conv-3").await.unwrap();
        assert_eq!(messages.len(), 5);
        assert_eq!(messages[4].content.text(), "five");

        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn test_stream_state_round_trip_and_delete() {
        let root = temp_root("stream");
        let store = FileStore::open(&root).await.unwrap();
        let state = StreamStateRecord {
            conversation_id: "conv-2".into(),
            chunk_index: 3,
            content_parts: vec![ContentPart::text("partial")],
            pending_tool_call: None,
            user_message_content: Some("hi".into()),
            is_active: true,
            started_at: 1,
            last_chunk_at: 2,
        };
        store.upsert_stream_state(state.clone()).await.unwrap();
        assert_eq!(store.stream_state("conv-2").await.unwrap(), Some(state));
        assert_eq!(store.stream_states().await.unwrap().len(), 1);

        store.delete_stream_state("conv-2").await.unwrap();
        store.delete_stream_state("conv-2").await.unwrap();
        assert!(store.stream_state("conv-2").await.unwrap().is_none());

        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn test_rejects_path_like_ids() {
        let root = temp_root("ids");
        let store = FileStore::open(&root).await.unwrap();
        assert!(store.conversation("../etc/passwd").await.is_err());
        let _ = std::fs::remove_dir_all(root);
    }
}
