//! Events emitted by a response producer

use crate::types::{ContentPart, FinishReason, Usage};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use tokio_stream::Stream;

/// Ordered events emitted while a response is being produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ProducerEvent {
    /// Text delta for the text part `id`
    TextDelta { id: String, text: String },
    /// A tool call started; its input is still streaming in
    ToolInputStart { id: String, tool_name: String },
    /// Tool call completed
    ToolCall {
        tool_call_id: String,
        tool_name: String,
        input: serde_json::Value,
    },
    /// Tool executed
    ToolResult {
        tool_call_id: String,
        tool_name: String,
        input: serde_json::Value,
        output: serde_json::Value,
    },
    /// Response completed successfully
    Finish {
        finish_reason: FinishReason,
        total_usage: Usage,
    },
    /// Error occurred
    Error { message: String },
}

impl ProducerEvent {
    /// Check if this is a terminal event (Finish or Error)
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProducerEvent::Finish { .. } | ProducerEvent::Error { .. })
    }

    /// The content part this event contributes to a turn, if any
    pub fn to_content_part(&self) -> Option<ContentPart> {
        match self {
            ProducerEvent::TextDelta { text, .. } => Some(ContentPart::text(text.clone())),
            ProducerEvent::ToolCall {
                tool_call_id,
                tool_name,
                input,
            } => Some(ContentPart::tool_call(
                tool_call_id.clone(),
                tool_name.clone(),
                input.clone(),
            )),
            ProducerEvent::ToolResult {
                tool_call_id,
                tool_name,
                input,
                output,
            } => Some(ContentPart::tool_result(
                tool_call_id.clone(),
                tool_name.clone(),
                input.clone(),
                output.clone(),
            )),
            _ => None,
        }
    }
}

/// A stream of producer events
pub type ProducerEventStream = Pin<Box<dyn Stream<Item = ProducerEvent> + Send>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_events() {
        assert!(
            ProducerEvent::Finish {
                finish_reason: FinishReason::Stop,
                total_usage: Usage::default(),
            }
            .is_terminal()
        );
        assert!(ProducerEvent::Error { message: "x".into() }.is_terminal());
        assert!(
            !ProducerEvent::TextDelta {
                id: "0".into(),
                text: "hi".into()
            }
            .is_terminal()
        );
    }

    #[test]
    fn test_tool_result_becomes_part() {
        let event = ProducerEvent::ToolResult {
            tool_call_id: "t1".into(),
            tool_name: "search".into(),
            input: serde_json::json!({"q": "rust"}),
            output: serde_json::json!(["a"]),
        };
        let part = event.to_content_part().unwrap();
        assert!(part.is_tool_result());
        assert_eq!(part.tool_call_id(), Some("t1"));
    }

    #[test]
    fn test_event_wire_shape() {
        let event = ProducerEvent::ToolInputStart {
            id: "t1".into(),
            tool_name: "search".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "tool-input-start");
        assert_eq!(json["toolName"], "search");
    }
}
