//! The durable message assembled from a response's event stream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    InProgress,
    Completed,
    Error,
    Interrupted,
}

impl MessageStatus {
    /// Parse a status string carried by `ResponseEnd`/`Status` events.
    pub fn parse(status: &str) -> Option<Self> {
        match status {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "completed" | "complete" => Some(Self::Completed),
            "error" => Some(Self::Error),
            "interrupted" => Some(Self::Interrupted),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Interrupted)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TextPart {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_block_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_sequence: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCallPart {
    pub tool_name: String,
    pub tool_args: Value,
    pub tool_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_block_index: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolReturnPart {
    pub tool_name: String,
    pub tool_id: String,
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_block_index: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentPart {
    pub document_id: String,
    pub title: String,
    pub pointer: String,
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub word_count: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CitationPart {
    pub document_id: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub citation_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReasoningPart {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redacted_content: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_block_index: Option<usize>,
}

/// One ordered piece of an assembled message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "part_kind", rename_all = "snake_case")]
pub enum MessagePart {
    Text(TextPart),
    ToolCall(ToolCallPart),
    ToolReturn(ToolReturnPart),
    Document(DocumentPart),
    Citation(CitationPart),
    Reasoning(ReasoningPart),
}

/// The aggregate assembled for one response. `message_id` equals the
/// response id; only the aggregator for that response mutates it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub message_id: String,
    pub chat_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub model_id: String,
    pub status: MessageStatus,
    pub parts: Vec<MessagePart>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(
        message_id: impl Into<String>,
        chat_id: impl Into<String>,
        parent_id: Option<String>,
        model_id: impl Into<String>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            chat_id: chat_id.into(),
            parent_id,
            model_id: model_id.into(),
            status: MessageStatus::Pending,
            parts: Vec::new(),
            metadata: Map::new(),
            created_at: Utc::now(),
        }
    }

    /// All text content, in part order.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for part in &self.parts {
            if let MessagePart::Text(text) = part {
                out.push_str(&text.content);
            }
        }
        out
    }

    /// Correlate a tool invocation by id, regardless of position.
    pub fn find_tool_call(&self, tool_id: &str) -> Option<&ToolCallPart> {
        self.parts.iter().find_map(|part| match part {
            MessagePart::ToolCall(call) if call.tool_id == tool_id => Some(call),
            _ => None,
        })
    }

    pub fn find_tool_return(&self, tool_id: &str) -> Option<&ToolReturnPart> {
        self.parts.iter().find_map(|part| match part {
            MessagePart::ToolReturn(ret) if ret.tool_id == tool_id => Some(ret),
            _ => None,
        })
    }

    /// Usage counters merged from `ResponseEnd`, if any arrived.
    pub fn usage(&self) -> Map<String, Value> {
        self.metadata
            .get("usage")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default()
    }

    /// The synchronous invoke payload, composed from the aggregated
    /// message rather than from individual events.
    pub fn sync_response(&self) -> Value {
        json!({
            "message_id": self.message_id,
            "chat_id": self.chat_id,
            "parts": serde_json::to_value(&self.parts).unwrap_or(Value::Array(Vec::new())),
            "usage": Value::Object(self.usage()),
            "metadata": Value::Object(self.metadata.clone()),
        })
    }
}
