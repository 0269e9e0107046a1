//! Stream session manager
//!
//! Buffers each in-flight turn in memory, persists it on a coalesced timer so
//! a reconnecting client can pick it up, and resolves exactly one terminal
//! outcome per turn. Every conversation gets its own actor task, started on
//! first use and retired after an idle period; all mutation of a
//! conversation's stream state happens on that actor.

mod actor;
mod state;

pub use state::{ERROR_NOTE, STOPPED_BY_USER_NOTE, TIMED_OUT_NOTE, stop_note};

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use folio_core::{
    ContentPart, FinishReason, MessageContent, PendingToolCall, StopReason, Usage, now_millis,
};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::StreamConfig;
use crate::error::{Error, Result};
use crate::events::{ChunkKind, StreamChunk};
use crate::handle::TurnHandle;
use crate::history::HistoryManager;
use actor::{Command, ConversationActor};

/// Attempts to reach a conversation's actor before giving up
const MAX_SEND_ATTEMPTS: usize = 3;

/// How a turn ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionReason {
    Finished,
    Stopped,
    Error,
}

/// A resume snapshot plus a subscription to everything after it
#[derive(Debug)]
pub struct Resumed {
    /// The `stream-resume` chunk
    pub payload: StreamChunk,
    /// Chunks broadcast after the snapshot was taken
    pub receiver: broadcast::Receiver<StreamChunk>,
}

/// Per-conversation registry entry
struct Slot {
    tx: Option<(u64, mpsc::Sender<Command>)>,
    hub: broadcast::Sender<StreamChunk>,
}

impl Slot {
    fn new(capacity: usize) -> Self {
        let (hub, _) = broadcast::channel(capacity.max(1));
        Self { tx: None, hub }
    }

    fn actor_id(&self) -> Option<u64> {
        self.tx.as_ref().map(|(id, _)| *id)
    }
}

struct Inner {
    history: Arc<HistoryManager>,
    config: StreamConfig,
    registry: Mutex<HashMap<String, Slot>>,
    next_turn: AtomicU64,
    next_actor: AtomicU64,
}

/// Entry point for every stream-state operation. Cheap to clone.
#[derive(Clone)]
pub struct StreamSessionManager {
    inner: Arc<Inner>,
}

impl StreamSessionManager {
    pub fn new(history: Arc<HistoryManager>, config: StreamConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                history,
                config,
                registry: Mutex::new(HashMap::new()),
                next_turn: AtomicU64::new(1),
                next_actor: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.inner.config
    }

    pub fn history(&self) -> &Arc<HistoryManager> {
        &self.inner.history
    }

    pub(crate) fn next_turn_id(&self) -> u64 {
        self.inner.next_turn.fetch_add(1, Ordering::Relaxed)
    }

    /// Number of conversations with a live actor
    pub fn active_conversations(&self) -> usize {
        self.inner
            .registry
            .lock()
            .values()
            .filter(|slot| slot.tx.is_some())
            .count()
    }

    /// Receive every chunk broadcast for a conversation from now on
    pub fn subscribe(&self, conversation_id: &str) -> broadcast::Receiver<StreamChunk> {
        let mut registry = self.inner.registry.lock();
        registry
            .entry(conversation_id.to_string())
            .or_insert_with(|| Slot::new(self.inner.config.broadcast_capacity))
            .hub
            .subscribe()
    }

    /// Sender for the conversation's actor, starting one if needed
    fn sender(&self, conversation_id: &str) -> (u64, mpsc::Sender<Command>) {
        let mut registry = self.inner.registry.lock();
        let slot = registry
            .entry(conversation_id.to_string())
            .or_insert_with(|| Slot::new(self.inner.config.broadcast_capacity));

        if let Some((actor_id, tx)) = &slot.tx {
            if !tx.is_closed() {
                return (*actor_id, tx.clone());
            }
        }

        let actor_id = self.inner.next_actor.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.inner.config.command_buffer.max(1));
        let actor = ConversationActor::new(
            conversation_id.to_string(),
            actor_id,
            self.clone(),
            slot.hub.clone(),
            rx,
            tx.downgrade(),
        );
        tokio::spawn(actor.run());
        slot.tx = Some((actor_id, tx.clone()));
        (actor_id, tx)
    }

    /// Forget a sender whose actor has shut down
    fn retire_sender(&self, conversation_id: &str, actor_id: u64) {
        let mut registry = self.inner.registry.lock();
        if let Some(slot) = registry.get_mut(conversation_id) {
            if slot.actor_id() == Some(actor_id) {
                slot.tx = None;
            }
        }
    }

    pub(crate) async fn send(&self, conversation_id: &str, command: Command) -> Result<()> {
        let mut command = command;
        for _ in 0..MAX_SEND_ATTEMPTS {
            let (actor_id, tx) = self.sender(conversation_id);
            match tx.send(command).await {
                Ok(()) => return Ok(()),
                Err(mpsc::error::SendError(returned)) => {
                    debug!(conversation_id, actor_id, "Actor gone, restarting");
                    command = returned;
                    self.retire_sender(conversation_id, actor_id);
                }
            }
        }
        Err(Error::ActorUnavailable(conversation_id.to_string()))
    }

    async fn request<T>(
        &self,
        conversation_id: &str,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.send(conversation_id, command(reply)).await?;
        response
            .await
            .map_err(|_| Error::ActorUnavailable(conversation_id.to_string()))
    }

    /// Start a new turn: reset the buffer, write a fresh durable row, and
    /// allocate the turn's handle. An unfinished previous turn is stopped
    /// first: its partial output is saved and `stopped` is broadcast.
    pub async fn init(
        &self,
        conversation_id: &str,
        user_content: MessageContent,
    ) -> Result<TurnHandle> {
        self.request(conversation_id, |reply| Command::Init {
            user_content,
            reply,
        })
        .await
    }

    /// Append a text delta to the turn's buffer and broadcast it
    pub async fn update_text(
        &self,
        turn: &TurnHandle,
        id: impl Into<String>,
        delta: impl Into<String>,
    ) -> Result<()> {
        self.send(
            &turn.conversation_id,
            Command::UpdateText {
                turn: turn.turn,
                id: id.into(),
                delta: delta.into(),
            },
        )
        .await
    }

    /// Record a tool call whose input is still streaming in
    pub async fn update_pending_tool(
        &self,
        turn: &TurnHandle,
        pending: PendingToolCall,
    ) -> Result<()> {
        self.send(
            &turn.conversation_id,
            Command::UpdatePendingTool {
                turn: turn.turn,
                pending,
            },
        )
        .await
    }

    pub async fn update_tool_call(
        &self,
        turn: &TurnHandle,
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        input: serde_json::Value,
    ) -> Result<()> {
        let part = ContentPart::tool_call(tool_call_id, tool_name, input);
        self.send(
            &turn.conversation_id,
            Command::UpdateToolPart {
                turn: turn.turn,
                part,
            },
        )
        .await
    }

    pub async fn update_tool_result(
        &self,
        turn: &TurnHandle,
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        input: serde_json::Value,
        output: serde_json::Value,
    ) -> Result<()> {
        let part = ContentPart::tool_result(tool_call_id, tool_name, input, output);
        self.send(
            &turn.conversation_id,
            Command::UpdateToolPart {
                turn: turn.turn,
                part,
            },
        )
        .await
    }

    /// Write the in-memory buffer to the durable row now
    pub async fn flush(&self, conversation_id: &str) -> Result<()> {
        self.request(conversation_id, |reply| Command::Flush { reply })
            .await
    }

    /// End a turn with `payload`. Returns false if another trigger already
    /// ended it, in which case nothing happens. With `skip_race`, the caller
    /// has already won and the marker is not checked.
    pub async fn complete(
        &self,
        turn: &TurnHandle,
        reason: CompletionReason,
        payload: ChunkKind,
        skip_race: bool,
    ) -> Result<bool> {
        self.request(&turn.conversation_id, |reply| Command::Complete {
            turn: turn.turn,
            reason,
            payload,
            skip_race,
            reply,
        })
        .await
    }

    /// Normal end of a turn: save the full response, then complete
    pub async fn finish(
        &self,
        turn: &TurnHandle,
        finish_reason: FinishReason,
        total_usage: Usage,
    ) -> Result<bool> {
        self.request(&turn.conversation_id, |reply| Command::Finish {
            turn: turn.turn,
            finish_reason,
            total_usage,
            reply,
        })
        .await
    }

    /// Producer failure: save what was buffered with an error note, then
    /// complete with an error chunk
    pub async fn fail(&self, turn: &TurnHandle, message: impl Into<String>) -> Result<bool> {
        let message = message.into();
        self.request(&turn.conversation_id, |reply| Command::Fail {
            turn: turn.turn,
            message,
            reply,
        })
        .await
    }

    /// Stop the conversation's current turn: cancel the producer, save the
    /// partial response, then complete with a `stopped` chunk.
    pub async fn handle_stop(&self, conversation_id: &str, reason: StopReason) -> Result<bool> {
        self.request(conversation_id, |reply| Command::Stop {
            turn: None,
            reason,
            reply,
        })
        .await
    }

    /// Like [`handle_stop`](Self::handle_stop), but only if `turn` is still
    /// the current one
    pub async fn stop_turn(&self, turn: &TurnHandle, reason: StopReason) -> Result<bool> {
        self.request(&turn.conversation_id, |reply| Command::Stop {
            turn: Some(turn.turn),
            reason,
            reply,
        })
        .await
    }

    /// Snapshot of the in-flight turn for a reconnecting client, with prior
    /// messages, plus a subscription to every later chunk. `None` when there
    /// is nothing to resume or the state is stale.
    pub async fn handle_resume(&self, conversation_id: &str) -> Result<Option<Resumed>> {
        self.request(conversation_id, |reply| Command::Resume { reply })
            .await?
    }

    /// Discard every stream state past the staleness window. Returns how many
    /// were discarded.
    pub async fn cleanup_orphaned(&self) -> Result<usize> {
        let window = i64::try_from(self.inner.config.staleness_window_ms).unwrap_or(i64::MAX);
        let now = now_millis();
        let candidates: Vec<String> = self
            .inner
            .history
            .store()
            .stream_states()
            .await?
            .into_iter()
            .filter(|state| state.is_stale_at(now, window))
            .map(|state| state.conversation_id)
            .collect();

        let mut discarded = 0;
        for conversation_id in candidates {
            match self
                .request(&conversation_id, |reply| Command::DiscardIfStale { reply })
                .await
            {
                Ok(true) => discarded += 1,
                Ok(false) => {}
                Err(e) => warn!(conversation_id = %conversation_id, error = %e, "Orphan cleanup failed"),
            }
        }
        if discarded > 0 {
            info!(discarded, "Discarded orphaned stream states");
        }
        Ok(discarded)
    }
}

/// Run [`StreamSessionManager::cleanup_orphaned`] every `interval`
pub fn spawn_orphan_sweeper(manager: StreamSessionManager, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match manager.cleanup_orphaned().await {
                Ok(count) => debug!(count, "Orphan sweep finished"),
                Err(e) => warn!(error = %e, "Orphan sweep failed"),
            }
        }
    })
}
