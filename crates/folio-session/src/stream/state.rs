//! In-memory mirror of an in-flight turn, and the turn it saves as

use std::collections::HashSet;

use folio_core::{
    ContentPart, Message, MessageContent, PendingToolCall, StopReason, StreamStateRecord,
    now_millis,
};

use crate::repair::append_note;

pub const STOPPED_BY_USER_NOTE: &str = "[Response stopped by user]";
pub const TIMED_OUT_NOTE: &str = "[Response timed out]";
pub const ERROR_NOTE: &str = "[Response interrupted due to an error]";

/// Marker appended to a turn that ended early
pub fn stop_note(reason: StopReason) -> &'static str {
    match reason {
        StopReason::UserCancelled => STOPPED_BY_USER_NOTE,
        StopReason::Timeout => TIMED_OUT_NOTE,
    }
}

/// Buffered output of the current turn
#[derive(Debug, Clone)]
pub(crate) struct StreamBuffer {
    pub chunk_index: u64,
    pub content_parts: Vec<ContentPart>,
    pub pending_tool_call: Option<PendingToolCall>,
    pub user_message_content: MessageContent,
    pub started_at: i64,
    pub last_chunk_at: i64,
    /// Changed since the last successful flush
    pub dirty: bool,
}

impl StreamBuffer {
    pub fn new(user_message_content: MessageContent) -> Self {
        let now = now_millis();
        Self {
            chunk_index: 0,
            content_parts: Vec::new(),
            pending_tool_call: None,
            user_message_content,
            started_at: now,
            last_chunk_at: now,
            dirty: true,
        }
    }

    /// Append a text delta, merging into a trailing text part
    pub fn push_text(&mut self, delta: &str) {
        match self.content_parts.last_mut() {
            Some(ContentPart::Text { text }) => text.push_str(delta),
            _ => self.content_parts.push(ContentPart::text(delta)),
        }
        self.bump();
    }

    pub fn set_pending_tool(&mut self, pending: PendingToolCall) {
        self.pending_tool_call = Some(pending);
        self.touch();
    }

    /// Append a tool call or tool result part
    pub fn push_tool_part(&mut self, part: ContentPart) {
        self.pending_tool_call = None;
        self.content_parts.push(part);
        self.bump();
    }

    fn bump(&mut self) {
        self.chunk_index += 1;
        self.touch();
    }

    fn touch(&mut self) {
        self.last_chunk_at = now_millis();
        self.dirty = true;
    }

    pub fn to_record(&self, conversation_id: &str) -> StreamStateRecord {
        StreamStateRecord {
            conversation_id: conversation_id.to_string(),
            chunk_index: self.chunk_index,
            content_parts: self.content_parts.clone(),
            pending_tool_call: self.pending_tool_call.clone(),
            user_message_content: Some(self.user_message_content.clone()),
            is_active: true,
            started_at: self.started_at,
            last_chunk_at: self.last_chunk_at,
        }
    }
}

/// Rebuild the messages a turn is saved as from its buffered parts.
///
/// Consecutive text is merged, tool calls without a result are dropped, and
/// `note` is appended to the trailing text. Tool results go into a separate
/// tool message after the assistant message.
pub(crate) fn reconstruct_response(
    conversation_id: &str,
    parts: &[ContentPart],
    note: Option<&str>,
) -> Vec<Message> {
    let answered: HashSet<&str> = parts
        .iter()
        .filter(|p| p.is_tool_result())
        .filter_map(ContentPart::tool_call_id)
        .collect();

    let mut assistant: Vec<ContentPart> = Vec::new();
    let mut results: Vec<ContentPart> = Vec::new();

    for part in parts {
        match part {
            ContentPart::Text { text } => match assistant.last_mut() {
                Some(ContentPart::Text { text: last }) => last.push_str(text),
                _ => assistant.push(part.clone()),
            },
            ContentPart::ToolCall {
                tool_call_id,
                tool_name,
                ..
            } if !answered.contains(tool_call_id.as_str()) => {
                tracing::warn!(
                    conversation_id,
                    tool_call_id = %tool_call_id,
                    tool_name = %tool_name,
                    "Dropping tool call with no result"
                );
            }
            ContentPart::ToolResult { .. } => results.push(part.clone()),
            _ => assistant.push(part.clone()),
        }
    }

    if let Some(note) = note {
        append_note(&mut assistant, note);
    }

    let mut messages = Vec::with_capacity(2);
    if !assistant.is_empty() {
        messages.push(Message::assistant(assistant));
    }
    if !results.is_empty() {
        messages.push(Message::tool(results));
    }
    messages
}
