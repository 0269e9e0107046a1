//! Tool-call repair passes
//!
//! Most producers require every tool call to be answered by a tool result in
//! the message that immediately follows it. Interrupted turns and out-of-order
//! saves break that contract, so every message list goes through these two
//! passes before it is handed to a producer:
//!
//! 1. [`reorder_tool_messages`] moves a misplaced tool message directly after
//!    the assistant message whose calls it answers.
//! 2. [`sanitize_orphaned_tool_calls`] drops calls that never got a result and
//!    leaves a note in the assistant's text instead.

use std::collections::HashSet;

use folio_core::{ContentPart, Message, MessageContent, Role};

/// Note left in an assistant message whose tool call never returned
pub const INTERRUPTED_TOOL_NOTE: &str =
    "[A previous tool call was interrupted before it returned a result.]";

/// Apply both passes in order
pub fn repair_tool_calls(messages: Vec<Message>) -> Vec<Message> {
    sanitize_orphaned_tool_calls(reorder_tool_messages(messages))
}

/// Move each tool message carrying results for an assistant's calls so that it
/// immediately follows that assistant message. Messages in between keep their
/// relative order and end up after the moved tool message.
pub fn reorder_tool_messages(mut messages: Vec<Message>) -> Vec<Message> {
    let mut i = 0;
    while i < messages.len() {
        if messages[i].has_tool_calls() {
            let call_ids: HashSet<String> = messages[i]
                .tool_call_ids()
                .into_iter()
                .map(str::to_string)
                .collect();

            let answers = |m: &Message| {
                m.role == Role::Tool
                    && m.tool_result_ids().iter().any(|id| call_ids.contains(*id))
            };

            let next_answers = messages.get(i + 1).is_some_and(answers);
            if !next_answers {
                if let Some(offset) = messages[i + 1..].iter().position(answers) {
                    let found = i + 1 + offset;
                    tracing::debug!(
                        from = found,
                        to = i + 1,
                        "Moving tool message next to its tool calls"
                    );
                    let tool_message = messages.remove(found);
                    messages.insert(i + 1, tool_message);
                }
            }
        }
        i += 1;
    }
    messages
}

/// Drop tool calls with no result in the immediately following tool message,
/// and tool results with no matching call in the immediately preceding
/// assistant message. Idempotent.
pub fn sanitize_orphaned_tool_calls(messages: Vec<Message>) -> Vec<Message> {
    let mut out: Vec<Message> = Vec::with_capacity(messages.len());
    let mut iter = messages.into_iter().peekable();

    while let Some(mut message) = iter.next() {
        match message.role {
            Role::Assistant if message.has_tool_calls() => {
                let answered: HashSet<String> = match iter.peek() {
                    Some(next) if next.role == Role::Tool => next
                        .tool_result_ids()
                        .into_iter()
                        .map(str::to_string)
                        .collect(),
                    _ => HashSet::new(),
                };

                let orphaned: HashSet<String> = message
                    .tool_call_ids()
                    .into_iter()
                    .filter(|id| !answered.contains(*id))
                    .map(str::to_string)
                    .collect();

                if !orphaned.is_empty() {
                    tracing::debug!(?orphaned, "Dropping tool calls with no result");
                    message.content = strip_calls(message.content, &orphaned);
                }
                out.push(message);
            }
            Role::Tool => {
                let called: HashSet<String> = match out.last() {
                    Some(prev) if prev.role == Role::Assistant => prev
                        .tool_call_ids()
                        .into_iter()
                        .map(str::to_string)
                        .collect(),
                    _ => HashSet::new(),
                };

                let parts: Vec<ContentPart> = message
                    .content
                    .into_parts()
                    .into_iter()
                    .filter(|p| match p {
                        ContentPart::ToolResult { tool_call_id, .. } => {
                            called.contains(tool_call_id)
                        }
                        _ => true,
                    })
                    .collect();

                if parts.iter().any(ContentPart::is_tool_result) {
                    message.content = MessageContent::Parts(parts);
                    out.push(message);
                } else {
                    tracing::debug!("Dropping tool message with no matching tool calls");
                }
            }
            _ => out.push(message),
        }
    }

    out
}

/// Remove the given calls and leave the interruption note behind
fn strip_calls(content: MessageContent, orphaned: &HashSet<String>) -> MessageContent {
    let mut parts: Vec<ContentPart> = content
        .into_parts()
        .into_iter()
        .filter(|p| match p {
            ContentPart::ToolCall { tool_call_id, .. } => !orphaned.contains(tool_call_id),
            _ => true,
        })
        .collect();

    if parts.iter().all(ContentPart::is_blank) {
        return MessageContent::Parts(vec![ContentPart::text(INTERRUPTED_TOOL_NOTE)]);
    }

    append_note(&mut parts, INTERRUPTED_TOOL_NOTE);
    MessageContent::Parts(parts)
}

/// Append `note` to the trailing text part, or as a new text part if the last
/// part is not text.
pub(crate) fn append_note(parts: &mut Vec<ContentPart>, note: &str) {
    match parts.last_mut() {
        Some(ContentPart::Text { text }) => {
            if !text.is_empty() {
                text.push_str("\n\n");
            }
            text.push_str(note);
        }
        _ => parts.push(ContentPart::text(note)),
    }
}
