//! Conversation history manager
//!
//! Produces the exact message sequence handed to the response producer and
//! persists completed turns. Reads go through pruning, tool-call repair and,
//! past the token threshold, compaction.

use std::collections::HashSet;
use std::sync::Arc;

use folio_core::{
    ContentPart, ConversationRecord, Message, MessageContent, NewMessage, Role, StoredMessage,
    now_millis,
};
use tracing::{debug, info, warn};

use crate::compaction::{
    CompactionReason, SUMMARIZATION_INSTRUCTION, serialize_messages_for_summary,
    summarization_request, trim_to_budget, with_summary_prefix,
};
use crate::config::{HistoryConfig, PruneOptions};
use crate::error::{Error, Result};
use crate::repair::repair_tool_calls;
use crate::store::HistoryStore;
use crate::summarizer::Summarizer;
use crate::tokens::{estimate_content_tokens, estimate_message_tokens, estimate_total_tokens};

/// Options for building a producer context
#[derive(Debug, Clone, Copy)]
pub struct ContextOptions {
    /// Apply the configured pruning to the replay window
    pub prune: bool,
    /// Compact even when under the token threshold
    pub force_compaction: bool,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            prune: true,
            force_compaction: false,
        }
    }
}

/// Reads and writes the durable conversation log
pub struct HistoryManager {
    store: Arc<dyn HistoryStore>,
    summarizer: Arc<dyn Summarizer>,
    config: HistoryConfig,
}

impl HistoryManager {
    pub fn new(
        store: Arc<dyn HistoryStore>,
        summarizer: Arc<dyn Summarizer>,
        config: HistoryConfig,
    ) -> Self {
        Self {
            store,
            summarizer,
            config,
        }
    }

    /// The row store behind this manager
    pub fn store(&self) -> &Arc<dyn HistoryStore> {
        &self.store
    }

    pub fn config(&self) -> &HistoryConfig {
        &self.config
    }

    /// Load a conversation, creating it on first use
    pub async fn ensure_conversation(&self, conversation_id: &str) -> Result<ConversationRecord> {
        if let Some(record) = self.store.conversation(conversation_id).await? {
            return Ok(record);
        }
        let record = ConversationRecord::new(conversation_id);
        self.store.upsert_conversation(record.clone()).await?;
        info!(conversation_id, "Created conversation");
        Ok(record)
    }

    /// Stop accepting turns for a conversation
    pub async fn close_conversation(&self, conversation_id: &str) -> Result<()> {
        let mut record = self.ensure_conversation(conversation_id).await?;
        if record.is_closed() {
            return Ok(());
        }
        let now = now_millis();
        record.active = false;
        record.closed_at = Some(now);
        record.updated_at = now;
        self.store.upsert_conversation(record).await?;
        info!(conversation_id, "Closed conversation");
        Ok(())
    }

    /// Full replay in sequence order, without `system` rows
    pub async fn get_messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
        Ok(self
            .store
            .messages(conversation_id)
            .await?
            .iter()
            .filter(|row| row.role != Role::System)
            .map(StoredMessage::to_message)
            .collect())
    }

    /// Build the context for a new turn: the replay window after the latest
    /// compaction, pruned and repaired, followed by `new_user`. Compacts when
    /// the estimate reaches the threshold or when forced.
    pub async fn get_context(
        &self,
        conversation_id: &str,
        new_user: Message,
        options: ContextOptions,
    ) -> Result<Vec<Message>> {
        let rows = self.store.messages(conversation_id).await?;

        let floor = rows.iter().rposition(|row| row.role == Role::Compaction);
        let summary = floor.map(|index| rows[index].content.text());
        let window_start = floor.map_or(0, |index| index + 1);

        let mut messages: Vec<Message> = rows[window_start..]
            .iter()
            .filter(|row| row.role != Role::System && row.role != Role::Compaction)
            .map(|row| Message::new(row.role, normalize_content(row.content.clone())))
            .collect();

        let mut new_user = new_user;
        if let Some(summary) = summary.filter(|s| !s.trim().is_empty()) {
            match messages.iter_mut().find(|m| m.role == Role::User) {
                Some(first_user) => {
                    let content = std::mem::take(&mut first_user.content);
                    first_user.content = with_summary_prefix(&summary, content);
                }
                None => {
                    new_user.content = with_summary_prefix(&summary, new_user.content);
                }
            }
        }

        if options.prune {
            messages = prune_messages(messages, &self.config.prune);
        }
        let messages = repair_tool_calls(messages);

        debug!(
            conversation_id,
            replayed = messages.len(),
            floor = ?floor.map(|i| rows[i].sequence),
            "Built replay window"
        );

        self.compact_messages(conversation_id, messages, new_user, options.force_compaction)
            .await
    }

    /// Append `new_user` to `messages`, or, at or above the threshold (or when
    /// `force` is set), summarize the window and return only `new_user`
    /// prefixed with the recap.
    pub async fn compact_messages(
        &self,
        conversation_id: &str,
        mut messages: Vec<Message>,
        new_user: Message,
        force: bool,
    ) -> Result<Vec<Message>> {
        let total = estimate_total_tokens(&messages) + estimate_message_tokens(&new_user);
        if !force && total < self.config.compaction_threshold {
            messages.push(new_user);
            return Ok(messages);
        }
        if messages.is_empty() {
            debug!(conversation_id, "Nothing to compact");
            return Ok(vec![new_user]);
        }

        let reason = if force {
            CompactionReason::Overflow
        } else {
            CompactionReason::Threshold
        };
        info!(
            conversation_id,
            estimated_tokens = total,
            messages = messages.len(),
            ?reason,
            "Compacting conversation"
        );

        let transcript = serialize_messages_for_summary(&messages);
        let summary = self
            .summarizer
            .summarize(
                SUMMARIZATION_INSTRUCTION,
                &summarization_request(&transcript),
                self.config.summary_max_tokens,
            )
            .await
            .map_err(Error::from)
            .and_then(|summary| {
                let summary = summary.trim().to_string();
                if summary.is_empty() {
                    Err(Error::Compaction("summarizer returned no text".into()))
                } else {
                    Ok(summary)
                }
            });

        let summary = match summary {
            Ok(summary) => summary,
            Err(e) => {
                warn!(
                    conversation_id,
                    error = %e,
                    "Summarization failed, dropping oldest messages instead"
                );
                let kept = trim_to_budget(messages, new_user, self.config.compaction_threshold);
                return Ok(kept);
            }
        };

        let mut record = self.ensure_conversation(conversation_id).await?;
        record.summary = Some(summary.clone());
        record.compaction_count += 1;
        record.updated_at = now_millis();
        let compaction_count = record.compaction_count;
        self.store.upsert_conversation(record).await?;

        let mut marker = NewMessage::new(Role::Compaction, summary.clone());
        marker.metadata = Some(serde_json::json!({
            "reason": reason,
            "summarizedMessages": messages.len(),
            "estimatedTokens": total,
        }));
        self.store
            .append_messages(conversation_id, vec![marker])
            .await?;

        info!(
            conversation_id,
            compaction_count,
            summary_chars = summary.len(),
            "Compaction complete"
        );

        let content = with_summary_prefix(&summary, new_user.content);
        Ok(vec![Message::new(Role::User, content)])
    }

    /// Append a completed turn: the user message, then each response in order.
    pub async fn save_messages(
        &self,
        conversation_id: &str,
        user_content: MessageContent,
        responses: Vec<Message>,
    ) -> Result<Vec<StoredMessage>> {
        let record = self.ensure_conversation(conversation_id).await?;
        if record.is_closed() {
            return Err(Error::ConversationClosed(conversation_id.to_string()));
        }

        let mut rows = Vec::with_capacity(responses.len() + 1);
        rows.push(annotated(Role::User, user_content));
        rows.extend(
            responses
                .into_iter()
                .map(|message| annotated(message.role, message.content)),
        );

        let stored = self.store.append_messages(conversation_id, rows).await?;

        let mut record = record;
        record.updated_at = now_millis();
        self.store.upsert_conversation(record).await?;

        debug!(
            conversation_id,
            saved = stored.len(),
            last_sequence = stored.last().map(|m| m.sequence),
            "Saved turn"
        );
        Ok(stored)
    }
}

fn annotated(role: Role, content: MessageContent) -> NewMessage {
    let tokens = estimate_content_tokens(&content);
    let mut message = NewMessage::new(role, content);
    let (input, output) = match role {
        Role::User => (tokens, 0),
        Role::Assistant => (0, tokens),
        _ => (0, 0),
    };
    message.input_tokens = Some(input);
    message.output_tokens = Some(output);
    message
}

/// Canonical content shape: adjacent text parts merged, blank text dropped,
/// and a lone text part collapsed to plain text.
pub(crate) fn normalize_content(content: MessageContent) -> MessageContent {
    let parts = match content {
        MessageContent::Text(text) => return MessageContent::Text(text),
        MessageContent::Parts(parts) => parts,
    };

    let mut merged: Vec<ContentPart> = Vec::with_capacity(parts.len());
    for part in parts {
        match part {
            ContentPart::Text { text } if text.trim().is_empty() => {}
            ContentPart::Text { text } => match merged.last_mut() {
                Some(ContentPart::Text { text: last }) => last.push_str(&text),
                _ => merged.push(ContentPart::Text { text }),
            },
            other => merged.push(other),
        }
    }

    match merged.as_slice() {
        [ContentPart::Text { text }] => MessageContent::Text(text.clone()),
        _ => MessageContent::Parts(merged),
    }
}

/// Strip replay noise from older messages
pub(crate) fn prune_messages(messages: Vec<Message>, options: &PruneOptions) -> Vec<Message> {
    let last = messages.len().saturating_sub(1);

    // Tool results seen at or after each index, walking backwards.
    let mut answered_later: Vec<HashSet<String>> = vec![HashSet::new(); messages.len()];
    let mut seen = HashSet::new();
    for (i, message) in messages.iter().enumerate().rev() {
        answered_later[i] = seen.clone();
        seen.extend(message.tool_result_ids().into_iter().map(str::to_string));
    }

    let pruned = messages
        .into_iter()
        .enumerate()
        .map(|(i, message)| {
            if i == last {
                return message;
            }
            let strip_reasoning = options.reasoning_on_final_only;
            let strip_dangling =
                options.drop_dangling_tool_calls && message.role == Role::Assistant;
            if !strip_reasoning && !strip_dangling {
                return message;
            }
            let parts = match message.content {
                MessageContent::Parts(parts) => parts,
                content => return Message::new(message.role, content),
            };
            let parts = parts
                .into_iter()
                .filter(|part| match part {
                    ContentPart::Reasoning { .. } => !strip_reasoning,
                    ContentPart::ToolCall { tool_call_id, .. } if strip_dangling => {
                        answered_later[i].contains(tool_call_id)
                    }
                    _ => true,
                })
                .collect();
            Message::new(message.role, MessageContent::Parts(parts))
        });

    if options.drop_empty_messages {
        pruned
            .filter(|m| m.content.to_parts().iter().any(|p| !p.is_blank()))
            .collect()
    } else {
        pruned.collect()
    }
}
