//! Turn runner
//!
//! Drives one turn from user message to terminal outcome: builds the context,
//! runs the producer, and relays every event into the stream session manager.
//! A context overflow before any output triggers one forced compaction and a
//! retry.

use std::sync::Arc;

use folio_core::{Message, MessageContent, PendingToolCall, ProducerEvent, ProducerEventStream, StopReason};
use futures::StreamExt;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::handle::TurnHandle;
use crate::history::ContextOptions;
use crate::producer::{Producer, RunConfig};
use crate::stream::StreamSessionManager;

enum Relay {
    /// The turn reached a terminal outcome (or was cancelled)
    Ended,
    /// The producer rejected the context as too long before any output
    Overflowed(String),
}

/// Starts turns and runs them to completion in the background. Cheap to clone.
#[derive(Clone)]
pub struct TurnRunner {
    manager: StreamSessionManager,
    producer: Arc<dyn Producer>,
    run_config: Arc<RunConfig>,
}

impl TurnRunner {
    pub fn new(
        manager: StreamSessionManager,
        producer: Arc<dyn Producer>,
        run_config: RunConfig,
    ) -> Self {
        Self {
            manager,
            producer,
            run_config: Arc::new(run_config),
        }
    }

    pub fn manager(&self) -> &StreamSessionManager {
        &self.manager
    }

    /// Start a turn for `user_content`. Returns once the turn is initialized;
    /// its output arrives on the conversation's broadcast.
    pub async fn start(
        &self,
        conversation_id: &str,
        user_content: MessageContent,
    ) -> Result<TurnHandle> {
        let record = self
            .manager
            .history()
            .ensure_conversation(conversation_id)
            .await?;
        if record.is_closed() {
            return Err(Error::ConversationClosed(conversation_id.to_string()));
        }

        let turn = self.manager.init(conversation_id, user_content.clone()).await?;

        if let Some(limit) = self.manager.config().turn_timeout() {
            let manager = self.manager.clone();
            let watched = turn.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = watched.cancelled() => {}
                    _ = tokio::time::sleep(limit) => {
                        info!(conversation_id = %watched.conversation_id(), "Turn timed out");
                        if let Err(e) = manager.stop_turn(&watched, StopReason::Timeout).await {
                            warn!(conversation_id = %watched.conversation_id(), error = %e, "Failed to stop timed out turn");
                        }
                    }
                }
            });
        }

        let runner = self.clone();
        let driven = turn.clone();
        tokio::spawn(async move { runner.drive(driven, user_content).await });
        Ok(turn)
    }

    async fn drive(&self, turn: TurnHandle, user_content: MessageContent) {
        if let Err(e) = self.produce(&turn, user_content).await {
            if turn.is_cancelled() {
                debug!(conversation_id = %turn.conversation_id(), error = %e, "Cancelled turn ended with error");
                return;
            }
            if let Err(e) = self.manager.fail(&turn, e.to_string()).await {
                error!(conversation_id = %turn.conversation_id(), error = %e, "Failed to end turn");
            }
        }
    }

    async fn produce(&self, turn: &TurnHandle, user_content: MessageContent) -> Result<()> {
        let conversation_id = turn.conversation_id();
        let mut force_compaction = false;

        loop {
            let options = ContextOptions {
                force_compaction,
                ..Default::default()
            };
            let context = self
                .manager
                .history()
                .get_context(conversation_id, Message::user(user_content.clone()), options)
                .await?;

            let events = match self
                .producer
                .run(context, &self.run_config, turn.cancel_token())
                .await
            {
                Ok(events) => events,
                Err(e) if e.is_context_overflow() && !force_compaction => {
                    info!(conversation_id, error = %e, "Context overflow, compacting and retrying");
                    force_compaction = true;
                    continue;
                }
                Err(_) if turn.is_cancelled() => return Ok(()),
                Err(e) => return Err(e.into()),
            };

            match self.relay(turn, events, !force_compaction).await? {
                Relay::Ended => return Ok(()),
                Relay::Overflowed(message) => {
                    info!(conversation_id, error = %message, "Context overflow, compacting and retrying");
                    force_compaction = true;
                }
            }
        }
    }

    async fn relay(
        &self,
        turn: &TurnHandle,
        mut events: ProducerEventStream,
        may_retry: bool,
    ) -> Result<Relay> {
        let mut emitted = false;

        loop {
            let event = tokio::select! {
                biased;
                _ = turn.cancelled() => {
                    debug!(conversation_id = %turn.conversation_id(), "Turn cancelled, dropping producer stream");
                    return Ok(Relay::Ended);
                }
                event = events.next() => event,
            };

            let Some(event) = event else {
                if !turn.is_cancelled() {
                    self.manager
                        .fail(turn, "Response stream ended without a terminal event")
                        .await?;
                }
                return Ok(Relay::Ended);
            };

            match event {
                ProducerEvent::TextDelta { id, text } => {
                    emitted = true;
                    self.manager.update_text(turn, id, text).await?;
                }
                ProducerEvent::ToolInputStart { id, tool_name } => {
                    emitted = true;
                    self.manager
                        .update_pending_tool(turn, PendingToolCall { tool_name, id })
                        .await?;
                }
                ProducerEvent::ToolCall {
                    tool_call_id,
                    tool_name,
                    input,
                } => {
                    emitted = true;
                    self.manager
                        .update_tool_call(turn, tool_call_id, tool_name, input)
                        .await?;
                }
                ProducerEvent::ToolResult {
                    tool_call_id,
                    tool_name,
                    input,
                    output,
                } => {
                    emitted = true;
                    self.manager
                        .update_tool_result(turn, tool_call_id, tool_name, input, output)
                        .await?;
                }
                ProducerEvent::Finish {
                    finish_reason,
                    total_usage,
                } => {
                    debug!(
                        conversation_id = %turn.conversation_id(),
                        ?finish_reason,
                        output_tokens = total_usage.output_tokens,
                        "Producer finished"
                    );
                    self.manager.finish(turn, finish_reason, total_usage).await?;
                    return Ok(Relay::Ended);
                }
                ProducerEvent::Error { message } => {
                    if may_retry && !emitted && folio_core::is_context_overflow(&message) {
                        return Ok(Relay::Overflowed(message));
                    }
                    self.manager.fail(turn, message).await?;
                    return Ok(Relay::Ended);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::config::StreamConfig;
    use crate::events::{ChunkKind, StreamChunk};
    use crate::store::HistoryStore;
    use crate::stream::{ERROR_NOTE, TIMED_OUT_NOTE};
    use crate::testing::{ScriptedProducer, memory_history, text_script};
    use folio_core::{FinishReason, Role};
    use tokio::sync::broadcast;

    fn runner_with(
        producer: Arc<ScriptedProducer>,
        config: StreamConfig,
    ) -> (Arc<crate::store::MemoryStore>, TurnRunner) {
        let (store, history) = memory_history("We covered the basics.");
        let manager = StreamSessionManager::new(history, config);
        (store, TurnRunner::new(manager, producer, RunConfig::default()))
    }

    async fn until_terminal(rx: &mut broadcast::Receiver<StreamChunk>) -> Vec<ChunkKind> {
        let mut kinds = Vec::new();
        loop {
            let chunk = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("timed out waiting for chunk")
                .expect("hub closed");
            let terminal = chunk.is_terminal();
            kinds.push(chunk.kind);
            if terminal {
                return kinds;
            }
        }
    }

    #[tokio::test]
    async fn test_turn_streams_and_saves() {
        let producer = Arc::new(ScriptedProducer::text("Hello there"));
        let (store, runner) = runner_with(producer.clone(), StreamConfig::default());
        let mut rx = runner.manager().subscribe("c1");

        runner.start("c1", "hi".into()).await.unwrap();
        let kinds = until_terminal(&mut rx).await;

        assert!(matches!(&kinds[0], ChunkKind::TextDelta { text, .. } if text == "Hello there"));
        assert!(matches!(
            kinds.last(),
            Some(ChunkKind::Finish {
                finish_reason: FinishReason::Stop,
                ..
            })
        ));

        let rows = store.messages("c1").await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].role, Role::User);
        assert_eq!(rows[1].to_message().text(), "Hello there");
        assert!(store.stream_state("c1").await.unwrap().is_none());

        // The producer saw just the new user message.
        assert_eq!(producer.seen_messages()[0], vec![Message::user("hi")]);
    }

    #[tokio::test]
    async fn test_second_turn_replays_history() {
        let producer = Arc::new(ScriptedProducer::new(vec![
            text_script("first answer"),
            text_script("second answer"),
        ]));
        let (_store, runner) = runner_with(producer.clone(), StreamConfig::default());
        let mut rx = runner.manager().subscribe("c1");

        runner.start("c1", "one".into()).await.unwrap();
        until_terminal(&mut rx).await;
        runner.start("c1", "two".into()).await.unwrap();
        until_terminal(&mut rx).await;

        let seen = producer.seen_messages();
        assert_eq!(seen[1].len(), 3);
        assert_eq!(seen[1][0].text(), "one");
        assert_eq!(seen[1][1].text(), "first answer");
        assert_eq!(seen[1][2], Message::user("two"));
    }

    #[tokio::test]
    async fn test_overflow_compacts_and_retries_once() {
        let producer = Arc::new(
            ScriptedProducer::new(vec![text_script("recovered")])
                .fail_first(vec![folio_core::Error::Producer(
                    "prompt is too long: 250000 tokens > 200000 maximum".into(),
                )]),
        );
        let (store, runner) = runner_with(producer.clone(), StreamConfig::default());
        runner
            .manager()
            .history()
            .save_messages("c1", "old question".into(), vec![Message::assistant("old answer")])
            .await
            .unwrap();

        let mut rx = runner.manager().subscribe("c1");
        runner.start("c1", "new question".into()).await.unwrap();
        let kinds = until_terminal(&mut rx).await;
        assert!(matches!(kinds.last(), Some(ChunkKind::Finish { .. })));

        assert_eq!(producer.run_count(), 2);
        let retried = &producer.seen_messages()[1];
        assert_eq!(retried.len(), 1);
        assert!(retried[0].text().starts_with("<context_compaction>"));
        assert!(retried[0].text().ends_with("new question"));

        let record = store.conversation("c1").await.unwrap().unwrap();
        assert_eq!(record.compaction_count, 1);
    }

    #[tokio::test]
    async fn test_overflow_event_before_output_compacts_and_retries() {
        let producer = Arc::new(ScriptedProducer::new(vec![
            vec![ProducerEvent::Error {
                message: "This model's maximum context length is 128000 tokens".into(),
            }],
            text_script("recovered"),
        ]));
        let (store, runner) = runner_with(producer.clone(), StreamConfig::default());
        runner
            .manager()
            .history()
            .save_messages("c1", "old question".into(), vec![Message::assistant("old answer")])
            .await
            .unwrap();

        let mut rx = runner.manager().subscribe("c1");
        runner.start("c1", "new question".into()).await.unwrap();
        let kinds = until_terminal(&mut rx).await;
        assert_eq!(kinds.len(), 2);
        assert!(matches!(kinds.last(), Some(ChunkKind::Finish { .. })));

        assert_eq!(producer.run_count(), 2);
        assert!(producer.seen_messages()[1][0].text().starts_with("<context_compaction>"));
        let record = store.conversation("c1").await.unwrap().unwrap();
        assert_eq!(record.compaction_count, 1);
    }

    #[tokio::test]
    async fn test_producer_error_saves_partial() {
        let producer = Arc::new(ScriptedProducer::new(vec![vec![
            ProducerEvent::TextDelta {
                id: "0".into(),
                text: "Half an answer".into(),
            },
            ProducerEvent::Error {
                message: "connection reset".into(),
            },
        ]]));
        let (store, runner) = runner_with(producer, StreamConfig::default());
        let mut rx = runner.manager().subscribe("c1");

        runner.start("c1", "q".into()).await.unwrap();
        let kinds = until_terminal(&mut rx).await;
        assert_eq!(kinds.last(), Some(&ChunkKind::error("connection reset")));

        let rows = store.messages("c1").await.unwrap();
        assert_eq!(
            rows[1].to_message().text(),
            format!("Half an answer\n\n{}", ERROR_NOTE)
        );
    }

    #[tokio::test]
    async fn test_timeout_stops_turn() {
        let producer = Arc::new(
            ScriptedProducer::new(vec![vec![ProducerEvent::TextDelta {
                id: "0".into(),
                text: "Thinking".into(),
            }]])
            .hold_open(),
        );
        let config = StreamConfig {
            turn_timeout_ms: Some(50),
            ..Default::default()
        };
        let (store, runner) = runner_with(producer, config);
        let mut rx = runner.manager().subscribe("c1");

        let turn = runner.start("c1", "q".into()).await.unwrap();
        let kinds = until_terminal(&mut rx).await;
        assert_eq!(
            kinds.last(),
            Some(&ChunkKind::Stopped {
                reason: StopReason::Timeout
            })
        );
        assert!(turn.is_cancelled());

        let rows = store.messages("c1").await.unwrap();
        assert_eq!(
            rows[1].to_message().text(),
            format!("Thinking\n\n{}", TIMED_OUT_NOTE)
        );
    }

    #[tokio::test]
    async fn test_user_stop_cancels_producer() {
        let producer = Arc::new(
            ScriptedProducer::new(vec![vec![ProducerEvent::TextDelta {
                id: "0".into(),
                text: "Working".into(),
            }]])
            .hold_open(),
        );
        let (store, runner) = runner_with(producer, StreamConfig::default());
        let mut rx = runner.manager().subscribe("c1");

        let turn = runner.start("c1", "q".into()).await.unwrap();
        let first = rx.recv().await.unwrap();
        assert!(matches!(first.kind, ChunkKind::TextDelta { .. }));

        assert!(
            runner
                .manager()
                .handle_stop("c1", StopReason::UserCancelled)
                .await
                .unwrap()
        );
        assert!(turn.is_cancelled());
        assert_eq!(store.messages("c1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_closed_conversation_rejects_turns() {
        let producer = Arc::new(ScriptedProducer::text("never"));
        let (_store, runner) = runner_with(producer.clone(), StreamConfig::default());
        runner
            .manager()
            .history()
            .close_conversation("c1")
            .await
            .unwrap();

        let err = runner.start("c1", "q".into()).await.unwrap_err();
        assert!(matches!(err, Error::ConversationClosed(_)));
        assert_eq!(producer.run_count(), 0);
    }
}
