//! Test doubles shared by the unit tests

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_stream::stream;
use async_trait::async_trait;
use folio_core::{
    ConversationRecord, Error, FinishReason, Message, NewMessage, ProducerEvent,
    ProducerEventStream, Result, StoredMessage, StreamStateRecord, Usage,
};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::history::HistoryManager;
use crate::producer::{Producer, RunConfig};
use crate::store::{HistoryStore, MemoryStore};
use crate::summarizer::Summarizer;

/// A text delta followed by a normal finish
pub fn text_script(text: &str) -> Vec<ProducerEvent> {
    vec![
        ProducerEvent::TextDelta {
            id: "0".into(),
            text: text.into(),
        },
        finish_event(),
    ]
}

pub fn finish_event() -> ProducerEvent {
    ProducerEvent::Finish {
        finish_reason: FinishReason::Stop,
        total_usage: Usage {
            input_tokens: 10,
            output_tokens: 5,
            total_tokens: 15,
        },
    }
}

/// A producer that replays canned event scripts, one per run
pub struct ScriptedProducer {
    scripts: Mutex<VecDeque<Vec<ProducerEvent>>>,
    failures: Mutex<VecDeque<Error>>,
    delay: Duration,
    hold_open: bool,
    runs: AtomicUsize,
    seen: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedProducer {
    pub fn new(scripts: Vec<Vec<ProducerEvent>>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            failures: Mutex::new(VecDeque::new()),
            delay: Duration::ZERO,
            hold_open: false,
            runs: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// A single run that streams `text` and finishes
    pub fn text(text: &str) -> Self {
        Self::new(vec![text_script(text)])
    }

    /// Fail the first runs with these errors before replaying scripts
    pub fn fail_first(self, errors: Vec<Error>) -> Self {
        *self.failures.lock() = errors.into();
        self
    }

    /// Sleep between events
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// After the script runs out, keep the stream open until cancelled
    pub fn hold_open(mut self) -> Self {
        self.hold_open = true;
        self
    }

    pub fn run_count(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    /// Context passed to each run, in order
    pub fn seen_messages(&self) -> Vec<Vec<Message>> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl Producer for ScriptedProducer {
    async fn run(
        &self,
        messages: Vec<Message>,
        _config: &RunConfig,
        cancel: CancellationToken,
    ) -> Result<ProducerEventStream> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().push(messages);

        if let Some(error) = self.failures.lock().pop_front() {
            return Err(error);
        }

        let events = self
            .scripts
            .lock()
            .pop_front()
            .unwrap_or_else(|| text_script("done"));
        let delay = self.delay;
        let hold_open = self.hold_open;

        Ok(Box::pin(stream! {
            for event in events {
                if !delay.is_zero() {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                if cancel.is_cancelled() {
                    return;
                }
                yield event;
            }
            if hold_open {
                cancel.cancelled().await;
            }
        }))
    }
}

/// A summarizer returning a fixed recap and recording what it was given
pub struct RecordingSummarizer {
    summary: Option<String>,
    transcripts: Mutex<Vec<String>>,
}

impl RecordingSummarizer {
    pub fn new(summary: &str) -> Self {
        Self {
            summary: Some(summary.to_string()),
            transcripts: Mutex::new(Vec::new()),
        }
    }

    /// A summarizer whose every call fails
    pub fn failing() -> Self {
        Self {
            summary: None,
            transcripts: Mutex::new(Vec::new()),
        }
    }

    pub fn transcripts(&self) -> Vec<String> {
        self.transcripts.lock().clone()
    }
}

#[async_trait]
impl Summarizer for RecordingSummarizer {
    async fn summarize(
        &self,
        _instruction: &str,
        transcript: &str,
        _max_tokens: u32,
    ) -> Result<String> {
        self.transcripts.lock().push(transcript.to_string());
        self.summary
            .clone()
            .ok_or_else(|| Error::Summarizer("summarizer unavailable".into()))
    }
}

/// A history manager over a fresh memory store
pub fn memory_history(summary: &str) -> (Arc<MemoryStore>, Arc<HistoryManager>) {
    let store = Arc::new(MemoryStore::new());
    let history = Arc::new(HistoryManager::new(
        store.clone() as Arc<dyn HistoryStore>,
        Arc::new(RecordingSummarizer::new(summary)),
        Default::default(),
    ));
    (store, history)
}

/// A memory store that counts stream-state writes
#[derive(Default)]
pub struct CountingStore {
    inner: MemoryStore,
    stream_upserts: AtomicUsize,
}

impl CountingStore {
    pub fn stream_upserts(&self) -> usize {
        self.stream_upserts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HistoryStore for CountingStore {
    async fn conversation(&self, id: &str) -> crate::Result<Option<ConversationRecord>> {
        self.inner.conversation(id).await
    }

    async fn upsert_conversation(&self, conversation: ConversationRecord) -> crate::Result<()> {
        self.inner.upsert_conversation(conversation).await
    }

    async fn append_messages(
        &self,
        conversation_id: &str,
        messages: Vec<NewMessage>,
    ) -> crate::Result<Vec<StoredMessage>> {
        self.inner.append_messages(conversation_id, messages).await
    }

    async fn messages(&self, conversation_id: &str) -> crate::Result<Vec<StoredMessage>> {
        self.inner.messages(conversation_id).await
    }

    async fn stream_state(
        &self,
        conversation_id: &str,
    ) -> crate::Result<Option<StreamStateRecord>> {
        self.inner.stream_state(conversation_id).await
    }

    async fn upsert_stream_state(&self, state: StreamStateRecord) -> crate::Result<()> {
        self.stream_upserts.fetch_add(1, Ordering::SeqCst);
        self.inner.upsert_stream_state(state).await
    }

    async fn delete_stream_state(&self, conversation_id: &str) -> crate::Result<()> {
        self.inner.delete_stream_state(conversation_id).await
    }

    async fn stream_states(&self) -> crate::Result<Vec<StreamStateRecord>> {
        self.inner.stream_states().await
    }
}

/// A memory store whose message appends panic, taking the calling task down
#[derive(Default)]
pub struct PanickingAppendStore {
    inner: MemoryStore,
}

#[async_trait]
impl HistoryStore for PanickingAppendStore {
    async fn conversation(&self, id: &str) -> crate::Result<Option<ConversationRecord>> {
        self.inner.conversation(id).await
    }

    async fn upsert_conversation(&self, conversation: ConversationRecord) -> crate::Result<()> {
        self.inner.upsert_conversation(conversation).await
    }

    async fn append_messages(
        &self,
        _conversation_id: &str,
        _messages: Vec<NewMessage>,
    ) -> crate::Result<Vec<StoredMessage>> {
        panic!("message log unavailable");
    }

    async fn messages(&self, conversation_id: &str) -> crate::Result<Vec<StoredMessage>> {
        self.inner.messages(conversation_id).await
    }

    async fn stream_state(
        &self,
        conversation_id: &str,
    ) -> crate::Result<Option<StreamStateRecord>> {
        self.inner.stream_state(conversation_id).await
    }

    async fn upsert_stream_state(&self, state: StreamStateRecord) -> crate::Result<()> {
        self.inner.upsert_stream_state(state).await
    }

    async fn delete_stream_state(&self, conversation_id: &str) -> crate::Result<()> {
        self.inner.delete_stream_state(conversation_id).await
    }

    async fn stream_states(&self) -> crate::Result<Vec<StreamStateRecord>> {
        self.inner.stream_states().await
    }
}
