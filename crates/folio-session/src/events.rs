//! Wire protocol between the session engine and connected clients

use folio_core::{
    ContentPart, FinishReason, Message, MessageContent, PendingToolCall, Role,
    StopReason, Usage,
};
use serde::{Deserialize, Serialize};

/// An outbound chunk, always tagged with the conversation it belongs to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamChunk {
    pub conversation_id: String,
    #[serde(flatten)]
    pub kind: ChunkKind,
}

impl StreamChunk {
    pub fn new(conversation_id: impl Into<String>, kind: ChunkKind) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            kind,
        }
    }

    /// Whether this chunk ends a turn
    pub fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }
}

/// Outbound chunk payloads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ChunkKind {
    TextDelta {
        id: String,
        text: String,
    },
    ToolInputStart {
        id: String,
        tool_name: String,
    },
    ToolCall {
        tool_call_id: String,
        tool_name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_call_id: String,
        tool_name: String,
        input: serde_json::Value,
        output: serde_json::Value,
    },
    /// Normal terminal
    Finish {
        finish_reason: FinishReason,
        total_usage: Usage,
    },
    /// Error terminal
    Error { content: ErrorContent },
    /// Stop terminal
    Stopped { reason: StopReason },
    /// Snapshot sent to a client reconnecting mid-turn
    StreamResume {
        content_parts: Vec<ContentPart>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pending_tool_call: Option<PendingToolCall>,
        chunk_index: u64,
        previous_messages: Vec<Message>,
        user_message_content: Option<MessageContent>,
    },
}

impl ChunkKind {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ChunkKind::Finish { .. } | ChunkKind::Error { .. } | ChunkKind::Stopped { .. }
        )
    }

    /// Error terminal with a message
    pub fn error(message: impl Into<String>) -> Self {
        ChunkKind::Error {
            content: ErrorContent::Message(message.into()),
        }
    }

    /// The chunk announcing a completed tool call or result
    pub fn from_tool_part(part: ContentPart) -> Option<Self> {
        match part {
            ContentPart::ToolCall {
                tool_call_id,
                tool_name,
                input,
            } => Some(ChunkKind::ToolCall {
                tool_call_id,
                tool_name,
                input,
            }),
            ContentPart::ToolResult {
                tool_call_id,
                tool_name,
                input,
                output,
            } => Some(ChunkKind::ToolResult {
                tool_call_id,
                tool_name,
                input,
                output,
            }),
            _ => None,
        }
    }
}

/// Body of an `error` chunk: a message, or just the time of failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ErrorContent {
    Message(String),
    #[serde(rename_all = "camelCase")]
    At { error_at: i64 },
}

/// Inbound client messages
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ClientMessage {
    Control(ControlMessage),
    Chat(ChatMessage),
}

/// Typed control requests
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ControlMessage {
    /// Cancel the conversation's in-flight turn
    StopStream { conversation_id: String },
    /// Ask for the resume snapshot of an in-flight turn
    ResumeStream { conversation_id: String },
}

/// A user message starting a turn; a missing id starts a new conversation
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub role: Role,
    pub content: MessageContent,
    #[serde(default)]
    pub conversation_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_text_delta_wire_shape() {
        let chunk = StreamChunk::new(
            "c1",
            ChunkKind::TextDelta {
                id: "0".into(),
                text: "Hi".into(),
            },
        );
        assert_eq!(
            serde_json::to_value(&chunk).unwrap(),
            json!({"conversationId": "c1", "type": "text-delta", "id": "0", "text": "Hi"})
        );
    }

    #[test]
    fn test_terminal_chunks() {
        let stopped = StreamChunk::new(
            "c1",
            ChunkKind::Stopped {
                reason: StopReason::UserCancelled,
            },
        );
        assert!(stopped.is_terminal());
        assert_eq!(
            serde_json::to_value(&stopped).unwrap(),
            json!({"conversationId": "c1", "type": "stopped", "reason": "user-cancelled"})
        );

        let error = ChunkKind::Error {
            content: ErrorContent::At { error_at: 42 },
        };
        assert_eq!(
            serde_json::to_value(&error).unwrap(),
            json!({"type": "error", "content": {"errorAt": 42}})
        );
        assert_eq!(
            serde_json::to_value(ChunkKind::error("boom")).unwrap(),
            json!({"type": "error", "content": "boom"})
        );
    }

    #[test]
    fn test_tool_part_chunks() {
        let call = ChunkKind::from_tool_part(ContentPart::tool_call(
            "t1",
            "search",
            json!({"q": "rust"}),
        ))
        .unwrap();
        assert_eq!(
            serde_json::to_value(&call).unwrap(),
            json!({"type": "tool-call", "toolCallId": "t1", "toolName": "search", "input": {"q": "rust"}})
        );

        let result = ChunkKind::from_tool_part(ContentPart::tool_result(
            "t1",
            "search",
            json!({"q": "rust"}),
            json!(["doc"]),
        ))
        .unwrap();
        assert!(matches!(result, ChunkKind::ToolResult { ref output, .. } if output == &json!(["doc"])));

        assert!(ChunkKind::from_tool_part(ContentPart::text("plain")).is_none());
    }

    #[test]
    fn test_resume_wire_shape() {
        let chunk = StreamChunk::new(
            "c1",
            ChunkKind::StreamResume {
                content_parts: vec![ContentPart::text("partial")],
                pending_tool_call: None,
                chunk_index: 1,
                previous_messages: vec![],
                user_message_content: Some("q".into()),
            },
        );
        let value = serde_json::to_value(&chunk).unwrap();
        assert_eq!(value["type"], "stream-resume");
        assert_eq!(value["chunkIndex"], 1);
        assert_eq!(value["contentParts"], json!([{"type": "text", "text": "partial"}]));
        assert_eq!(value["userMessageContent"], "q");
        assert!(value.get("pendingToolCall").is_none());
    }

    #[test]
    fn test_parse_client_messages() {
        let stop: ClientMessage =
            serde_json::from_str(r#"{"type":"stop-stream","conversationId":"c1"}"#).unwrap();
        assert_eq!(
            stop,
            ClientMessage::Control(ControlMessage::StopStream {
                conversation_id: "c1".into()
            })
        );

        let chat: ClientMessage =
            serde_json::from_str(r#"{"role":"user","content":"hello"}"#).unwrap();
        let ClientMessage::Chat(chat) = chat else {
            panic!("expected chat message");
        };
        assert_eq!(chat.role, Role::User);
        assert!(chat.conversation_id.is_none());

        let resume: ClientMessage =
            serde_json::from_str(r#"{"type":"resume-stream","conversationId":"c2"}"#).unwrap();
        assert!(matches!(
            resume,
            ClientMessage::Control(ControlMessage::ResumeStream { .. })
        ));
    }
}
