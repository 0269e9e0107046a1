//! Context compaction for long conversations
//!
//! When the replay window grows past the token threshold, the whole window is
//! serialized to a flat transcript and summarized. The next context is then
//! just the new user message, prefixed with the recap. Full history stays in
//! the durable message log.

use folio_core::{ContentPart, Message, MessageContent, Role};

use crate::repair::repair_tool_calls;
use crate::tokens::{estimate_message_tokens, estimate_total_tokens};

/// Reason for compaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompactionReason {
    /// Replay window reached the token threshold
    Threshold,
    /// The producer rejected the context as too long
    Overflow,
}

pub(crate) const SUMMARIZATION_INSTRUCTION: &str = "\
You are a specialized summarization model. You are given the transcript of a \
conversation between a researcher and an assistant working in a shared research \
notebook. Write a concise recap that will replace the transcript in the assistant's \
context, so it must keep everything needed to continue the work:

1. **Goal**: What is the researcher trying to find out or build?
2. **Progress**: What has been established, computed, or written so far?
3. **Key Decisions**: Which methods, data, or assumptions were settled on and why?
4. **Open Threads**: What was the researcher about to ask or do next?
5. **Critical Context**: Constraints, preferences, names, and numbers that must not be lost.

Use the headers above. Be thorough but brief. Do not continue the conversation.";

/// Tool outputs longer than this are cut in the transcript
const MAX_TOOL_OUTPUT_CHARS: usize = 2_000;
/// Tool arguments longer than this are cut in the transcript
const MAX_TOOL_ARG_CHARS: usize = 100;

/// Serialize messages to plain text for the summarization prompt.
/// Uses a human-readable format to keep the summarizer from "continuing" the conversation.
pub fn serialize_messages_for_summary(messages: &[Message]) -> String {
    let mut out = String::new();

    for msg in messages {
        match msg.role {
            Role::System => {}
            Role::Compaction => {
                push_line(&mut out, "[Earlier summary]: ", &msg.text());
            }
            Role::User => {
                push_line(&mut out, "[User]: ", &msg.text());
            }
            Role::Assistant => {
                let mut reasoning = Vec::new();
                let mut text = Vec::new();
                let mut tool_calls = Vec::new();

                for part in msg.content.to_parts() {
                    match part {
                        ContentPart::Reasoning { text: r } => reasoning.push(r),
                        ContentPart::Text { text: t } => text.push(t),
                        ContentPart::ToolCall {
                            tool_name, input, ..
                        } => tool_calls.push(format!("{}({})", tool_name, format_tool_args(&input))),
                        ContentPart::ToolResult { .. } => {}
                    }
                }

                push_line(&mut out, "[Assistant reasoning]: ", &reasoning.join(" "));
                push_line(&mut out, "[Assistant]: ", &text.join(""));
                push_line(&mut out, "[Assistant tool calls]: ", &tool_calls.join("; "));
            }
            Role::Tool => {
                for part in msg.content.to_parts() {
                    if let ContentPart::ToolResult {
                        tool_name, output, ..
                    } = part
                    {
                        let text = match output {
                            serde_json::Value::String(s) => s,
                            other => other.to_string(),
                        };
                        let label = format!("[Tool result ({})]: ", tool_name);
                        push_line(&mut out, &label, &truncate_chars(&text, MAX_TOOL_OUTPUT_CHARS));
                    }
                }
            }
        }
    }

    out
}

fn push_line(out: &mut String, label: &str, text: &str) {
    if text.trim().is_empty() {
        return;
    }
    out.push_str(label);
    out.push_str(text);
    out.push('\n');
}

/// Cut `text` to at most `max` characters, marking the cut
fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((byte_index, _)) => format!("{}...(truncated)", &text[..byte_index]),
        None => text.to_string(),
    }
}

fn format_tool_args(args: &serde_json::Value) -> String {
    match args {
        serde_json::Value::Object(map) => map
            .iter()
            .map(|(k, v)| {
                let val = match v {
                    serde_json::Value::String(s) => {
                        format!("\"{}\"", truncate_chars(s, MAX_TOOL_ARG_CHARS))
                    }
                    other => truncate_chars(&other.to_string(), MAX_TOOL_ARG_CHARS),
                };
                format!("{}={}", k, val)
            })
            .collect::<Vec<_>>()
            .join(", "),
        serde_json::Value::Null => String::new(),
        _ => truncate_chars(&args.to_string(), MAX_TOOL_ARG_CHARS),
    }
}

/// Wrap the transcript for the summarizer
pub(crate) fn summarization_request(transcript: &str) -> String {
    format!("<conversation>\n{}</conversation>", transcript)
}

/// Prefix `content` with a `<context_compaction>` block carrying `summary`
pub fn with_summary_prefix(summary: &str, content: MessageContent) -> MessageContent {
    let prefix = format!("<context_compaction>\n{}\n</context_compaction>\n\n", summary);
    match content {
        MessageContent::Text(text) => MessageContent::Text(prefix + &text),
        MessageContent::Parts(mut parts) => {
            match parts.first_mut() {
                Some(ContentPart::Text { text }) => text.insert_str(0, &prefix),
                _ => parts.insert(0, ContentPart::text(prefix)),
            }
            MessageContent::Parts(parts)
        }
    }
}

/// Fallback when no summary can be produced: drop the oldest messages until
/// the window plus `new_user` fits under `threshold`, cutting only where a
/// user message starts.
pub(crate) fn trim_to_budget(
    messages: Vec<Message>,
    new_user: Message,
    threshold: u64,
) -> Vec<Message> {
    let budget = threshold.saturating_sub(estimate_message_tokens(&new_user));

    let mut remaining = estimate_total_tokens(&messages);
    let mut start = 0;
    while start < messages.len() && remaining >= budget {
        remaining -= estimate_message_tokens(&messages[start]);
        start += 1;
    }
    while start < messages.len() && messages[start].role != Role::User {
        start += 1;
    }

    let mut kept = repair_tool_calls(messages.into_iter().skip(start).collect());
    kept.push(new_user);
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_serialize_messages() {
        let messages = vec![
            Message::system("ignored"),
            Message::user("Hello"),
            Message::assistant("Hi there!"),
        ];
        let text = serialize_messages_for_summary(&messages);
        assert!(text.contains("[User]: Hello"));
        assert!(text.contains("[Assistant]: Hi there!"));
        assert!(!text.contains("ignored"));
    }

    #[test]
    fn test_serialize_tool_calls_and_results() {
        let messages = vec![
            Message::assistant(vec![
                ContentPart::text("Let me run that"),
                ContentPart::tool_call("t1", "run_cell", json!({"cell": "c-42"})),
            ]),
            Message::tool(vec![ContentPart::tool_result(
                "t1",
                "run_cell",
                json!({"cell": "c-42"}),
                json!("x".repeat(3_000)),
            )]),
        ];
        let text = serialize_messages_for_summary(&messages);
        assert!(text.contains("[Assistant tool calls]: run_cell(cell=\"c-42\")"));
        assert!(text.contains("[Tool result (run_cell)]: "));
        assert!(text.contains("...(truncated)"));
    }

    #[test]
    fn test_truncate_is_char_safe() {
        let text = "é".repeat(10);
        assert_eq!(truncate_chars(&text, 3), "ééé...(truncated)");
        assert_eq!(truncate_chars("short", 10), "short");
    }

    #[test]
    fn test_summary_prefix_on_text() {
        let content = with_summary_prefix("We tested H1.", MessageContent::Text("next?".into()));
        let text = content.text();
        assert!(text.starts_with("<context_compaction>\nWe tested H1.\n</context_compaction>"));
        assert!(text.ends_with("next?"));
    }

    #[test]
    fn test_summary_prefix_on_parts_without_text() {
        let content = with_summary_prefix(
            "recap",
            MessageContent::Parts(vec![ContentPart::reasoning("hmm")]),
        );
        let parts = content.to_parts();
        assert_eq!(parts.len(), 2);
        assert!(parts[0].as_text().unwrap().starts_with("<context_compaction>"));
    }

    #[test]
    fn test_trim_to_budget_cuts_at_user_boundary() {
        let messages = vec![
            Message::user("a".repeat(300)),
            Message::assistant("b".repeat(300)),
            Message::user("c".repeat(300)),
            Message::assistant("d".repeat(300)),
        ];
        // Each message is 100 tokens; budget leaves room for two of them.
        let kept = trim_to_budget(messages, Message::user("now"), 250);
        assert_eq!(kept.len(), 3);
        assert!(kept[0].text().starts_with('c'));
        assert_eq!(kept[2].text(), "now");
    }

    #[test]
    fn test_trim_to_budget_can_drop_everything() {
        let messages = vec![Message::assistant("b".repeat(3_000))];
        let kept = trim_to_budget(messages, Message::user("now"), 10);
        assert_eq!(kept, vec![Message::user("now")]);
    }
}
