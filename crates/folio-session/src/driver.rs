//! Per-connection session driver
//!
//! Feeds inbound client messages (new turn, stop, resume) into the turn
//! runner and the stream session manager, and relays every chunk for the
//! conversations this connection follows to its outbound channel. Dropping the
//! driver stops the relays but never cancels a turn.

use std::collections::HashMap;

use folio_core::{Role, StopReason};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::events::{ChatMessage, ChunkKind, ClientMessage, ControlMessage, StreamChunk};
use crate::stream::StreamSessionManager;
use crate::turn::TurnRunner;

pub struct SessionDriver {
    runner: TurnRunner,
    outbound: mpsc::Sender<StreamChunk>,
    relays: HashMap<String, JoinHandle<()>>,
}

impl SessionDriver {
    pub fn new(runner: TurnRunner, outbound: mpsc::Sender<StreamChunk>) -> Self {
        Self {
            runner,
            outbound,
            relays: HashMap::new(),
        }
    }

    fn manager(&self) -> &StreamSessionManager {
        self.runner.manager()
    }

    /// Handle one inbound message. Failures tied to a conversation are
    /// reported to the client as an `error` chunk rather than returned.
    pub async fn handle(&mut self, message: ClientMessage) -> Result<()> {
        match message {
            ClientMessage::Chat(chat) => {
                let conversation_id = chat
                    .conversation_id
                    .clone()
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
                if let Err(e) = self.send_message(&conversation_id, chat).await {
                    warn!(conversation_id = %conversation_id, error = %e, "Failed to start turn");
                    self.report(&conversation_id, e).await;
                }
            }
            ClientMessage::Control(ControlMessage::StopStream { conversation_id }) => {
                match self
                    .manager()
                    .handle_stop(&conversation_id, StopReason::UserCancelled)
                    .await
                {
                    Ok(stopped) => {
                        debug!(conversation_id = %conversation_id, stopped, "Stop requested")
                    }
                    Err(e) => {
                        warn!(conversation_id = %conversation_id, error = %e, "Failed to stop stream");
                        self.report(&conversation_id, e).await;
                    }
                }
            }
            ClientMessage::Control(ControlMessage::ResumeStream { conversation_id }) => {
                if let Err(e) = self.resume(&conversation_id).await {
                    warn!(conversation_id = %conversation_id, error = %e, "Failed to resume stream");
                    self.report(&conversation_id, e).await;
                }
            }
        }
        Ok(())
    }

    /// Start a turn in `conversation_id` and follow its output
    pub async fn send_message(&mut self, conversation_id: &str, chat: ChatMessage) -> Result<()> {
        if chat.role != Role::User {
            return Err(Error::Other(format!(
                "Only user messages start a turn, got role {}",
                chat.role.as_str()
            )));
        }
        if chat.content.is_empty() {
            return Err(Error::Other("Message content is empty".into()));
        }

        if !self.is_following(conversation_id) {
            let receiver = self.manager().subscribe(conversation_id);
            self.follow(conversation_id, receiver);
        }
        let turn = self.runner.start(conversation_id, chat.content).await?;
        info!(conversation_id, turn = turn.turn_id(), "Turn accepted");
        Ok(())
    }

    /// Send the resume snapshot for `conversation_id`, then follow everything
    /// after it. Returns false when there was nothing to resume.
    pub async fn resume(&mut self, conversation_id: &str) -> Result<bool> {
        let Some(resumed) = self.manager().handle_resume(conversation_id).await? else {
            return Ok(false);
        };
        // The new subscription starts exactly at the snapshot; an older relay
        // would deliver duplicates.
        if let Some(relay) = self.relays.remove(conversation_id) {
            relay.abort();
        }
        if self.outbound.send(resumed.payload).await.is_err() {
            debug!(conversation_id, "Connection closed before resume payload");
            return Ok(false);
        }
        self.follow(conversation_id, resumed.receiver);
        Ok(true)
    }

    fn is_following(&self, conversation_id: &str) -> bool {
        self.relays
            .get(conversation_id)
            .is_some_and(|relay| !relay.is_finished())
    }

    fn follow(&mut self, conversation_id: &str, mut receiver: broadcast::Receiver<StreamChunk>) {
        let outbound = self.outbound.clone();
        let id = conversation_id.to_string();
        let relay = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(chunk) => {
                        if outbound.send(chunk).await.is_err() {
                            debug!(conversation_id = %id, "Connection gone, relay stopped");
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(conversation_id = %id, skipped, "Client lagging, chunks dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        if let Some(previous) = self.relays.insert(conversation_id.to_string(), relay) {
            previous.abort();
        }
    }

    async fn report(&self, conversation_id: &str, error: Error) {
        let chunk = StreamChunk::new(conversation_id, ChunkKind::error(error.to_string()));
        if self.outbound.send(chunk).await.is_err() {
            debug!(conversation_id, "Connection closed before error could be reported");
        }
    }
}

impl Drop for SessionDriver {
    fn drop(&mut self) {
        for relay in self.relays.values() {
            relay.abort();
        }
    }
}
