//! Approximate token counting
//!
//! Cheap enough to call per message, never exact. Used only to decide when a
//! conversation needs compaction and to annotate saved messages.

use folio_core::{ContentPart, Message, MessageContent};

/// Characters per token in the approximation
pub const CHARS_PER_TOKEN: usize = 3;

/// Normalized inputs shorter than this are counted by words instead
const SMALL_INPUT_CHARS: usize = 20;

/// Estimate token count for a piece of text
pub fn estimate_text_tokens(text: &str) -> u64 {
    let normalized = normalize_whitespace(text);
    let chars = normalized.chars().count();
    if chars == 0 {
        return 0;
    }
    if chars < SMALL_INPUT_CHARS {
        return normalized.split(' ').count() as u64;
    }
    chars.div_ceil(CHARS_PER_TOKEN) as u64
}

/// Estimate token count for message content of either shape
pub fn estimate_content_tokens(content: &MessageContent) -> u64 {
    match content {
        MessageContent::Text(text) => estimate_text_tokens(text),
        MessageContent::Parts(parts) => estimate_text_tokens(&parts_to_text(parts)),
    }
}

/// Estimate token count for a single message
pub fn estimate_message_tokens(message: &Message) -> u64 {
    estimate_content_tokens(&message.content)
}

/// Estimate total tokens for a slice of messages
pub fn estimate_total_tokens(messages: &[Message]) -> u64 {
    messages.iter().map(estimate_message_tokens).sum()
}

/// Collapse every whitespace run to one space and trim the ends
fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn parts_to_text(parts: &[ContentPart]) -> String {
    parts
        .iter()
        .map(|part| match part {
            ContentPart::Text { text } | ContentPart::Reasoning { text } => text.clone(),
            ContentPart::ToolCall {
                tool_name, input, ..
            } => format!("{} {}", tool_name, input),
            ContentPart::ToolResult {
                tool_name, output, ..
            } => format!("{} {}", tool_name, output),
        })
        .collect::<Vec<_>>()
        .join(" ")
}
