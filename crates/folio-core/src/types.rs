//! Core types for conversations, messages, and in-flight stream state

use serde::{Deserialize, Serialize};

/// Milliseconds since the Unix epoch, the timestamp unit used by every record.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Message roles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
    /// Summary of every message with a lower sequence number
    Compaction,
}

impl Role {
    /// Get the role as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
            Role::Compaction => "compaction",
        }
    }
}

/// One ordered unit of message content or streamed output.
///
/// Tool calls and tool results carry the tool-call id so they can be
/// correlated across an ordered list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ContentPart {
    /// Text run
    Text { text: String },
    /// Model reasoning
    Reasoning { text: String },
    /// Tool call request
    ToolCall {
        tool_call_id: String,
        tool_name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    /// Tool call result
    ToolResult {
        tool_call_id: String,
        tool_name: String,
        #[serde(default)]
        input: serde_json::Value,
        #[serde(default)]
        output: serde_json::Value,
    },
}

impl ContentPart {
    /// Create text content
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Create reasoning content
    pub fn reasoning(text: impl Into<String>) -> Self {
        Self::Reasoning { text: text.into() }
    }

    /// Create a tool call
    pub fn tool_call(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        input: serde_json::Value,
    ) -> Self {
        Self::ToolCall {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            input,
        }
    }

    /// Create a tool result
    pub fn tool_result(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        input: serde_json::Value,
        output: serde_json::Value,
    ) -> Self {
        Self::ToolResult {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            input,
            output,
        }
    }

    /// Get text if this is text content
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            _ => None,
        }
    }

    /// Tool-call id of a tool call or tool result
    pub fn tool_call_id(&self) -> Option<&str> {
        match self {
            Self::ToolCall { tool_call_id, .. } | Self::ToolResult { tool_call_id, .. } => {
                Some(tool_call_id)
            }
            _ => None,
        }
    }

    /// Check if this is a tool call
    pub fn is_tool_call(&self) -> bool {
        matches!(self, Self::ToolCall { .. })
    }

    /// Check if this is a tool result
    pub fn is_tool_result(&self) -> bool {
        matches!(self, Self::ToolResult { .. })
    }

    /// Whether this part carries nothing worth replaying
    pub fn is_blank(&self) -> bool {
        match self {
            Self::Text { text } | Self::Reasoning { text } => text.trim().is_empty(),
            Self::ToolCall { tool_name, .. } | Self::ToolResult { tool_name, .. } => {
                tool_name.is_empty()
            }
        }
    }
}

/// Message content: either plain text or an ordered list of parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl Default for MessageContent {
    fn default() -> Self {
        Self::Parts(Vec::new())
    }
}

impl From<&str> for MessageContent {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for MessageContent {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<Vec<ContentPart>> for MessageContent {
    fn from(parts: Vec<ContentPart>) -> Self {
        Self::Parts(parts)
    }
}

impl MessageContent {
    /// Content as an owned list of parts. Plain text becomes a single text
    /// part; empty text becomes an empty list.
    pub fn to_parts(&self) -> Vec<ContentPart> {
        match self {
            Self::Text(text) if text.is_empty() => Vec::new(),
            Self::Text(text) => vec![ContentPart::text(text.clone())],
            Self::Parts(parts) => parts.clone(),
        }
    }

    /// Convert into the list-of-parts shape
    pub fn into_parts(self) -> Vec<ContentPart> {
        match self {
            Self::Text(text) if text.is_empty() => Vec::new(),
            Self::Text(text) => vec![ContentPart::text(text)],
            Self::Parts(parts) => parts,
        }
    }

    /// Concatenated text of all text parts
    pub fn text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Parts(parts) => parts
                .iter()
                .filter_map(|p| p.as_text())
                .collect::<Vec<_>>()
                .join(""),
        }
    }

    /// Whether there is nothing at all in this content
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(text) => text.is_empty(),
            Self::Parts(parts) => parts.is_empty(),
        }
    }
}

/// A role-tagged message as handed to the response producer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
}

impl Message {
    /// Create a message with the given role
    pub fn new(role: Role, content: impl Into<MessageContent>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    /// Create a system message
    pub fn system(content: impl Into<MessageContent>) -> Self {
        Self::new(Role::System, content)
    }

    /// Create a user message
    pub fn user(content: impl Into<MessageContent>) -> Self {
        Self::new(Role::User, content)
    }

    /// Create an assistant message
    pub fn assistant(content: impl Into<MessageContent>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Create a tool message
    pub fn tool(results: Vec<ContentPart>) -> Self {
        Self::new(Role::Tool, MessageContent::Parts(results))
    }

    /// Get combined text content
    pub fn text(&self) -> String {
        self.content.text()
    }

    /// Ids of the tool calls in this message, in order
    pub fn tool_call_ids(&self) -> Vec<&str> {
        match &self.content {
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::ToolCall { tool_call_id, .. } => Some(tool_call_id.as_str()),
                    _ => None,
                })
                .collect(),
            MessageContent::Text(_) => vec![],
        }
    }

    /// Ids of the tool results in this message, in order
    pub fn tool_result_ids(&self) -> Vec<&str> {
        match &self.content {
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::ToolResult { tool_call_id, .. } => Some(tool_call_id.as_str()),
                    _ => None,
                })
                .collect(),
            MessageContent::Text(_) => vec![],
        }
    }

    /// Whether this is an assistant message with at least one tool call
    pub fn has_tool_calls(&self) -> bool {
        self.role == Role::Assistant && !self.tool_call_ids().is_empty()
    }
}

/// A tool call whose input is still streaming in
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingToolCall {
    pub tool_name: String,
    pub id: String,
}

/// Token usage reported by the producer for a turn
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

/// Reason the producer reported for finishing a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FinishReason {
    /// Natural end of response
    Stop,
    /// Maximum tokens reached
    Length,
    /// Turn ended on tool calls
    ToolCalls,
    /// Output was filtered
    ContentFilter,
    /// Error occurred
    Error,
    Other,
}

/// Why a turn was stopped before it finished
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StopReason {
    UserCancelled,
    Timeout,
}

/// Conversation row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRecord {
    pub id: String,
    pub active: bool,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub compaction_count: u32,
    #[serde(default)]
    pub summary: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default)]
    pub closed_at: Option<i64>,
}

impl ConversationRecord {
    /// A fresh, active conversation
    pub fn new(id: impl Into<String>) -> Self {
        let now = now_millis();
        Self {
            id: id.into(),
            active: true,
            context: None,
            compaction_count: 0,
            summary: None,
            created_at: now,
            updated_at: now,
            closed_at: None,
        }
    }

    /// Whether further turns may be appended
    pub fn is_closed(&self) -> bool {
        self.closed_at.is_some()
    }
}

/// A message about to be appended; the store assigns its sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessage {
    pub role: Role,
    pub content: MessageContent,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub input_tokens: Option<u64>,
    #[serde(default)]
    pub output_tokens: Option<u64>,
    pub sent_at: i64,
}

impl NewMessage {
    /// A message with no metadata or token counts, sent now
    pub fn new(role: Role, content: impl Into<MessageContent>) -> Self {
        Self {
            role,
            content: content.into(),
            metadata: None,
            input_tokens: None,
            output_tokens: None,
            sent_at: now_millis(),
        }
    }
}

/// Message row, keyed by `(conversation_id, sequence)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    pub conversation_id: String,
    /// Per-conversation sequence, contiguous and starting at 1
    pub sequence: u64,
    pub role: Role,
    pub content: MessageContent,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub input_tokens: Option<u64>,
    #[serde(default)]
    pub output_tokens: Option<u64>,
    pub sent_at: i64,
}

impl StoredMessage {
    /// Stamp a new message with its position in the log
    pub fn from_new(conversation_id: &str, sequence: u64, message: NewMessage) -> Self {
        Self {
            conversation_id: conversation_id.to_string(),
            sequence,
            role: message.role,
            content: message.content,
            metadata: message.metadata,
            input_tokens: message.input_tokens,
            output_tokens: message.output_tokens,
            sent_at: message.sent_at,
        }
    }

    /// Role-tagged view of this row
    pub fn to_message(&self) -> Message {
        Message::new(self.role, self.content.clone())
    }
}

/// Durable snapshot of an in-flight turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStateRecord {
    pub conversation_id: String,
    pub chunk_index: u64,
    pub content_parts: Vec<ContentPart>,
    #[serde(default)]
    pub pending_tool_call: Option<PendingToolCall>,
    #[serde(default)]
    pub user_message_content: Option<MessageContent>,
    pub is_active: bool,
    pub started_at: i64,
    pub last_chunk_at: i64,
}

impl StreamStateRecord {
    /// Whether the last update is older than `window_ms` at time `now`
    pub fn is_stale_at(&self, now: i64, window_ms: i64) -> bool {
        now - self.last_chunk_at > window_ms
    }
}
