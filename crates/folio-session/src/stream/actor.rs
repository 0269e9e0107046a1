//! One task per conversation, owning the in-flight turn

use folio_core::{
    ContentPart, FinishReason, MessageContent, PendingToolCall, StopReason, StreamStateRecord,
    Usage, now_millis,
};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::state::{ERROR_NOTE, StreamBuffer, reconstruct_response, stop_note};
use super::{CompletionReason, Resumed, StreamSessionManager};
use crate::error::Result;
use crate::events::{ChunkKind, StreamChunk};
use crate::handle::TurnHandle;

/// Requests handled by a conversation actor, in arrival order
pub(crate) enum Command {
    Init {
        user_content: MessageContent,
        reply: oneshot::Sender<TurnHandle>,
    },
    UpdateText {
        turn: u64,
        id: String,
        delta: String,
    },
    UpdatePendingTool {
        turn: u64,
        pending: PendingToolCall,
    },
    UpdateToolPart {
        turn: u64,
        part: ContentPart,
    },
    Flush {
        reply: oneshot::Sender<()>,
    },
    Complete {
        turn: u64,
        reason: CompletionReason,
        payload: ChunkKind,
        skip_race: bool,
        reply: oneshot::Sender<bool>,
    },
    Finish {
        turn: u64,
        finish_reason: FinishReason,
        total_usage: Usage,
        reply: oneshot::Sender<bool>,
    },
    Fail {
        turn: u64,
        message: String,
        reply: oneshot::Sender<bool>,
    },
    /// Stop the given turn, or the current one when `turn` is `None`
    Stop {
        turn: Option<u64>,
        reason: StopReason,
        reply: oneshot::Sender<bool>,
    },
    Resume {
        reply: oneshot::Sender<Result<Option<Resumed>>>,
    },
    DiscardIfStale {
        reply: oneshot::Sender<bool>,
    },
    FlushTick,
    ExpireMarker {
        turn: u64,
    },
}

struct ActiveTurn {
    handle: TurnHandle,
    buffer: StreamBuffer,
}

pub(crate) struct ConversationActor {
    conversation_id: String,
    actor_id: u64,
    manager: StreamSessionManager,
    hub: broadcast::Sender<StreamChunk>,
    rx: mpsc::Receiver<Command>,
    tx: mpsc::WeakSender<Command>,
    turn: Option<ActiveTurn>,
    /// Turn that won the completion race, until the grace window expires
    completed: Option<u64>,
    flush_scheduled: bool,
}

impl ConversationActor {
    pub(crate) fn new(
        conversation_id: String,
        actor_id: u64,
        manager: StreamSessionManager,
        hub: broadcast::Sender<StreamChunk>,
        rx: mpsc::Receiver<Command>,
        tx: mpsc::WeakSender<Command>,
    ) -> Self {
        Self {
            conversation_id,
            actor_id,
            manager,
            hub,
            rx,
            tx,
            turn: None,
            completed: None,
            flush_scheduled: false,
        }
    }

    pub(crate) async fn run(mut self) {
        debug!(conversation_id = %self.conversation_id, actor = self.actor_id, "Conversation actor started");
        let idle_timeout = self.manager.inner.config.idle_timeout();

        loop {
            let command = if self.is_idle() {
                match tokio::time::timeout(idle_timeout, self.rx.recv()).await {
                    Ok(Some(command)) => command,
                    Ok(None) => break,
                    Err(_) => {
                        if self.retire() {
                            break;
                        }
                        continue;
                    }
                }
            } else {
                match self.rx.recv().await {
                    Some(command) => command,
                    None => break,
                }
            };
            self.handle(command).await;
        }

        debug!(conversation_id = %self.conversation_id, actor = self.actor_id, "Conversation actor stopped");
    }

    fn is_idle(&self) -> bool {
        self.turn.is_none() && self.completed.is_none() && !self.flush_scheduled
    }

    /// Leave the registry after an idle period. Returns false if a command
    /// arrived in the meantime.
    fn retire(&mut self) -> bool {
        let leftovers = {
            let mut registry = self.manager.inner.registry.lock();
            if !self.rx.is_empty() {
                return false;
            }
            let ours = registry
                .get(&self.conversation_id)
                .is_some_and(|slot| slot.actor_id() == Some(self.actor_id));
            if ours {
                let unobserved = registry
                    .get_mut(&self.conversation_id)
                    .map(|slot| {
                        slot.tx = None;
                        slot.hub.receiver_count() == 0
                    })
                    .unwrap_or(false);
                if unobserved {
                    registry.remove(&self.conversation_id);
                }
            }
            self.rx.close();

            // Callers that cloned the sender before it was retired
            let mut leftovers = Vec::new();
            while let Ok(command) = self.rx.try_recv() {
                leftovers.push(command);
            }
            leftovers
        };

        if !leftovers.is_empty() {
            debug!(
                conversation_id = %self.conversation_id,
                count = leftovers.len(),
                "Handing late commands to a fresh actor"
            );
            let manager = self.manager.clone();
            let conversation_id = self.conversation_id.clone();
            tokio::spawn(async move {
                for command in leftovers {
                    if let Err(e) = manager.send(&conversation_id, command).await {
                        warn!(conversation_id = %conversation_id, error = %e, "Dropped command for retired actor");
                    }
                }
            });
        }
        true
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Init {
                user_content,
                reply,
            } => {
                let handle = self.init(user_content).await;
                let _ = reply.send(handle);
            }
            Command::UpdateText { turn, id, delta } => {
                let Some(active) = self.active_mut(turn) else {
                    return;
                };
                active.buffer.push_text(&delta);
                self.broadcast(ChunkKind::TextDelta { id, text: delta });
                self.schedule_flush();
            }
            Command::UpdatePendingTool { turn, pending } => {
                let Some(active) = self.active_mut(turn) else {
                    return;
                };
                active.buffer.set_pending_tool(pending.clone());
                self.broadcast(ChunkKind::ToolInputStart {
                    id: pending.id,
                    tool_name: pending.tool_name,
                });
                self.schedule_flush();
            }
            Command::UpdateToolPart { turn, part } => {
                let Some(active) = self.active_mut(turn) else {
                    return;
                };
                active.buffer.push_tool_part(part.clone());
                if let Some(chunk) = ChunkKind::from_tool_part(part) {
                    self.broadcast(chunk);
                }
                self.schedule_flush();
            }
            Command::Flush { reply } => {
                self.flush().await;
                let _ = reply.send(());
            }
            Command::Complete {
                turn,
                reason,
                payload,
                skip_race,
                reply,
            } => {
                let won = self.complete(turn, reason, payload, skip_race).await;
                let _ = reply.send(won);
            }
            Command::Finish {
                turn,
                finish_reason,
                total_usage,
                reply,
            } => {
                let won = self.finish(turn, finish_reason, total_usage).await;
                let _ = reply.send(won);
            }
            Command::Fail {
                turn,
                message,
                reply,
            } => {
                let won = self.fail(turn, message).await;
                let _ = reply.send(won);
            }
            Command::Stop {
                turn,
                reason,
                reply,
            } => {
                let won = self.handle_stop(turn, reason).await;
                let _ = reply.send(won);
            }
            Command::Resume { reply } => {
                let resumed = self.handle_resume().await;
                let _ = reply.send(resumed);
            }
            Command::DiscardIfStale { reply } => {
                let discarded = self.discard_if_stale().await;
                let _ = reply.send(discarded);
            }
            Command::FlushTick => {
                self.flush_scheduled = false;
                self.flush().await;
            }
            Command::ExpireMarker { turn } => {
                if self.completed == Some(turn) {
                    self.completed = None;
                }
            }
        }
    }

    async fn init(&mut self, user_content: MessageContent) -> TurnHandle {
        // An unfinished turn ends as stopped, with its partial output saved,
        // before the new one starts.
        if let Some(previous) = self.current_turn_id() {
            info!(
                conversation_id = %self.conversation_id,
                turn = previous,
                "New turn requested while one is in flight"
            );
            self.handle_stop(Some(previous), StopReason::UserCancelled).await;
        }
        if let Some(previous) = self.turn.take() {
            warn!(
                conversation_id = %self.conversation_id,
                turn = previous.handle.turn,
                "Superseding unfinished turn"
            );
            previous.handle.cancel.cancel();
        }

        let handle = TurnHandle::new(&self.conversation_id, self.manager.next_turn_id());
        self.turn = Some(ActiveTurn {
            handle: handle.clone(),
            buffer: StreamBuffer::new(user_content),
        });
        self.flush().await;

        info!(conversation_id = %self.conversation_id, turn = handle.turn, "Turn started");
        handle
    }

    fn current_turn_id(&self) -> Option<u64> {
        self.turn.as_ref().map(|active| active.handle.turn)
    }

    /// The active turn, if `turn` is it
    fn active_mut(&mut self, turn: u64) -> Option<&mut ActiveTurn> {
        match self.turn.as_mut() {
            Some(active) if active.handle.turn == turn => Some(active),
            _ => {
                debug!(conversation_id = %self.conversation_id, turn, "Ignoring update for inactive turn");
                None
            }
        }
    }

    fn broadcast(&self, kind: ChunkKind) {
        if self
            .hub
            .send(StreamChunk::new(&self.conversation_id, kind))
            .is_err()
        {
            debug!(conversation_id = %self.conversation_id, "No observers for chunk");
        }
    }

    fn schedule_flush(&mut self) {
        if self.flush_scheduled {
            return;
        }
        self.flush_scheduled = true;
        let tx = self.tx.clone();
        let delay = self.manager.inner.config.flush_interval();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(Command::FlushTick).await;
            }
        });
    }

    /// Copy the buffer into the durable row. A no-op with no buffer or no
    /// change since the last flush.
    async fn flush(&mut self) {
        let Some(active) = self.turn.as_mut() else {
            return;
        };
        if !active.buffer.dirty {
            return;
        }

        let record = active.buffer.to_record(&self.conversation_id);
        let chunk_index = record.chunk_index;
        match self
            .manager
            .inner
            .history
            .store()
            .upsert_stream_state(record)
            .await
        {
            Ok(()) => {
                active.buffer.dirty = false;
                debug!(conversation_id = %self.conversation_id, chunk_index, "Flushed stream state");
            }
            Err(e) => {
                warn!(
                    conversation_id = %self.conversation_id,
                    error = %e,
                    "Failed to flush stream state, will retry"
                );
                self.schedule_flush();
            }
        }
    }

    /// Check-then-set the completion marker for `turn`
    fn try_claim(&mut self, turn: u64) -> bool {
        if self.completed == Some(turn) {
            debug!(conversation_id = %self.conversation_id, turn, "Turn already completed");
            return false;
        }
        if self.current_turn_id() != Some(turn) {
            debug!(conversation_id = %self.conversation_id, turn, "Terminal trigger for inactive turn");
            return false;
        }
        self.completed = Some(turn);
        true
    }

    async fn complete(
        &mut self,
        turn: u64,
        reason: CompletionReason,
        payload: ChunkKind,
        skip_race: bool,
    ) -> bool {
        if skip_race {
            if self.current_turn_id() != Some(turn) {
                return false;
            }
            self.completed = Some(turn);
        } else if !self.try_claim(turn) {
            return false;
        }

        self.broadcast(payload);
        self.flush().await;
        if let Err(e) = self
            .manager
            .inner
            .history
            .store()
            .delete_stream_state(&self.conversation_id)
            .await
        {
            warn!(
                conversation_id = %self.conversation_id,
                error = %e,
                "Failed to delete stream state"
            );
        }
        if let Some(active) = self.turn.take() {
            active.handle.cancel.cancel();
        }
        self.schedule_marker_expiry(turn);

        info!(conversation_id = %self.conversation_id, turn, ?reason, "Turn completed");
        true
    }

    fn schedule_marker_expiry(&self, turn: u64) {
        let tx = self.tx.clone();
        let grace = self.manager.inner.config.completion_grace();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(Command::ExpireMarker { turn }).await;
            }
        });
    }

    async fn finish(&mut self, turn: u64, finish_reason: FinishReason, total_usage: Usage) -> bool {
        if !self.try_claim(turn) {
            return false;
        }
        self.save_response(None).await;
        let payload = ChunkKind::Finish {
            finish_reason,
            total_usage,
        };
        self.complete(turn, CompletionReason::Finished, payload, true)
            .await
    }

    async fn fail(&mut self, turn: u64, message: String) -> bool {
        if !self.try_claim(turn) {
            return false;
        }
        warn!(conversation_id = %self.conversation_id, turn, error = %message, "Turn failed");
        self.cancel_current();
        self.save_partial_response(ERROR_NOTE).await;
        self.complete(turn, CompletionReason::Error, ChunkKind::error(message), true)
            .await
    }

    async fn handle_stop(&mut self, turn: Option<u64>, reason: StopReason) -> bool {
        let Some(turn) = turn.or_else(|| self.current_turn_id()) else {
            debug!(conversation_id = %self.conversation_id, "No turn to stop");
            return false;
        };
        if !self.try_claim(turn) {
            return false;
        }
        info!(conversation_id = %self.conversation_id, turn, ?reason, "Stopping turn");
        self.cancel_current();
        self.save_partial_response(stop_note(reason)).await;
        self.complete(turn, CompletionReason::Stopped, ChunkKind::Stopped { reason }, true)
            .await
    }

    fn cancel_current(&self) {
        if let Some(active) = &self.turn {
            active.handle.cancel.cancel();
        }
    }

    /// Save whatever was buffered, marked with `note`
    async fn save_partial_response(&mut self, note: &str) {
        self.save_response(Some(note)).await;
    }

    async fn save_response(&mut self, note: Option<&str>) {
        let Some(active) = self.turn.as_ref() else {
            return;
        };
        let responses =
            reconstruct_response(&self.conversation_id, &active.buffer.content_parts, note);
        let user_content = active.buffer.user_message_content.clone();

        match self
            .manager
            .inner
            .history
            .save_messages(&self.conversation_id, user_content, responses)
            .await
        {
            Ok(saved) => {
                debug!(conversation_id = %self.conversation_id, saved = saved.len(), "Saved turn")
            }
            Err(e) => {
                error!(conversation_id = %self.conversation_id, error = %e, "Failed to save turn")
            }
        }
    }

    async fn handle_resume(&mut self) -> Result<Option<Resumed>> {
        self.flush().await;

        let Some(record) = self.snapshot().await? else {
            debug!(conversation_id = %self.conversation_id, "Nothing to resume");
            return Ok(None);
        };
        if self.is_stale(&record) {
            info!(conversation_id = %self.conversation_id, "Discarding stale stream state");
            self.discard().await;
            return Ok(None);
        }

        let previous_messages = self
            .manager
            .inner
            .history
            .get_messages(&self.conversation_id)
            .await?;
        let receiver = self.hub.subscribe();
        let payload = StreamChunk::new(
            &self.conversation_id,
            ChunkKind::StreamResume {
                content_parts: record.content_parts,
                pending_tool_call: record.pending_tool_call,
                chunk_index: record.chunk_index,
                previous_messages,
                user_message_content: record.user_message_content,
            },
        );

        info!(conversation_id = %self.conversation_id, chunk_index = record.chunk_index, "Resuming stream");
        Ok(Some(Resumed { payload, receiver }))
    }

    /// Current state: the in-memory buffer, or the durable row when this
    /// process has no turn in flight
    async fn snapshot(&self) -> Result<Option<StreamStateRecord>> {
        match &self.turn {
            Some(active) => Ok(Some(active.buffer.to_record(&self.conversation_id))),
            None => {
                self.manager
                    .inner
                    .history
                    .store()
                    .stream_state(&self.conversation_id)
                    .await
            }
        }
    }

    fn is_stale(&self, record: &StreamStateRecord) -> bool {
        let window = self.manager.inner.config.staleness_window_ms;
        record.is_stale_at(now_millis(), i64::try_from(window).unwrap_or(i64::MAX))
    }

    async fn discard_if_stale(&mut self) -> bool {
        let snapshot = self.snapshot().await;
        match snapshot {
            Ok(Some(record)) if self.is_stale(&record) => self.discard().await,
            Ok(_) => false,
            Err(e) => {
                warn!(conversation_id = %self.conversation_id, error = %e, "Failed to read stream state");
                false
            }
        }
    }

    /// Drop the turn and its durable row without saving anything
    async fn discard(&mut self) -> bool {
        if let Some(active) = self.turn.take() {
            active.handle.cancel.cancel();
        }
        match self
            .manager
            .inner
            .history
            .store()
            .delete_stream_state(&self.conversation_id)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    conversation_id = %self.conversation_id,
                    error = %e,
                    "Failed to delete stale stream state"
                );
                false
            }
        }
    }
}
