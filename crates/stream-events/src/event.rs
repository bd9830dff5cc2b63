use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

fn default_true() -> bool {
    true
}

/// Metadata shared by every streaming event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventMeta {
    /// The response this event belongs to (equals the message id).
    pub response_id: String,

    /// Producer-assigned ordering number. Never re-derived here.
    #[serde(default)]
    pub sequence: u64,

    /// Whether the event is fanned out to external consumers.
    #[serde(default = "default_true")]
    pub emit: bool,

    /// Whether the external storage layer should record this event's effect.
    #[serde(default = "default_true")]
    pub persist: bool,

    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,

    /// Logical content block (0..n) for interleaved multi-block streams.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_block_index: Option<usize>,

    /// Ordering within the content block.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_sequence: Option<u64>,
}

impl EventMeta {
    pub fn new(response_id: impl Into<String>) -> Self {
        Self {
            response_id: response_id.into(),
            sequence: 0,
            emit: true,
            persist: true,
            timestamp: Utc::now(),
            content_block_index: None,
            block_sequence: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponseStart {
    pub request_id: String,
    pub chat_id: String,
    pub task: String,
    pub model_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponseEnd {
    #[serde(default)]
    pub usage: Map<String, Value>,
    /// `completed`, `error` or `interrupted`.
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
}

/// Complete content for one occurrence; aggregation happens at the
/// part level, not by splicing fragments inside one event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Content {
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub tool_name: String,
    /// Normally a JSON object; upstream runtimes occasionally deliver a
    /// raw string fragment instead, which the aggregator buffers.
    #[serde(default)]
    pub tool_args: Value,
    pub tool_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolReturn {
    pub tool_name: String,
    pub tool_id: String,
    #[serde(default)]
    pub result: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Metadata {
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Document {
    pub document_id: String,
    pub title: String,
    /// `s3://<bucket>/<key>` or `file://<path>`.
    pub pointer: String,
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub word_count: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Citation {
    pub document_id: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub citation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_number: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_pointer: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Status {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorDetail {
    pub error_type: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Reasoning {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redacted_content: Option<Vec<u8>>,
}

/// Event payload, tagged on the wire with `__event_type__` so any
/// subscriber can reconstruct the exact variant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "__event_type__")]
pub enum EventPayload {
    #[serde(rename = "ResponseStartEvent")]
    ResponseStart(ResponseStart),
    #[serde(rename = "ResponseEndEvent")]
    ResponseEnd(ResponseEnd),
    #[serde(rename = "ContentEvent")]
    Content(Content),
    #[serde(rename = "ToolCallEvent")]
    ToolCall(ToolCall),
    #[serde(rename = "ToolReturnEvent")]
    ToolReturn(ToolReturn),
    #[serde(rename = "MetadataEvent")]
    Metadata(Metadata),
    #[serde(rename = "DocumentEvent")]
    Document(Document),
    #[serde(rename = "CitationEvent")]
    Citation(Citation),
    #[serde(rename = "StatusEvent")]
    Status(Status),
    #[serde(rename = "ErrorEvent")]
    Error(ErrorDetail),
    #[serde(rename = "ReasoningEvent")]
    Reasoning(Reasoning),
}

impl EventPayload {
    /// Stable snake_case type name used by the protocol formatters.
    pub fn type_name(&self) -> &'static str {
        match self {
            EventPayload::ResponseStart(_) => "response_start",
            EventPayload::ResponseEnd(_) => "response_end",
            EventPayload::Content(_) => "content",
            EventPayload::ToolCall(_) => "tool_call",
            EventPayload::ToolReturn(_) => "tool_return",
            EventPayload::Metadata(_) => "metadata",
            EventPayload::Document(_) => "document",
            EventPayload::Citation(_) => "citation",
            EventPayload::Status(_) => "status",
            EventPayload::Error(_) => "error",
            EventPayload::Reasoning(_) => "reasoning",
        }
    }

    /// Wire discriminant, mirrored by the `__event_type__` serde tag.
    pub fn wire_name(&self) -> &'static str {
        match self {
            EventPayload::ResponseStart(_) => "ResponseStartEvent",
            EventPayload::ResponseEnd(_) => "ResponseEndEvent",
            EventPayload::Content(_) => "ContentEvent",
            EventPayload::ToolCall(_) => "ToolCallEvent",
            EventPayload::ToolReturn(_) => "ToolReturnEvent",
            EventPayload::Metadata(_) => "MetadataEvent",
            EventPayload::Document(_) => "DocumentEvent",
            EventPayload::Citation(_) => "CitationEvent",
            EventPayload::Status(_) => "StatusEvent",
            EventPayload::Error(_) => "ErrorEvent",
            EventPayload::Reasoning(_) => "ReasoningEvent",
        }
    }
}

/// One streaming event: shared metadata plus a typed payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamEvent {
    #[serde(flatten)]
    pub meta: EventMeta,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl StreamEvent {
    pub fn new(response_id: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            meta: EventMeta::new(response_id),
            payload,
        }
    }

    pub fn response_id(&self) -> &str {
        &self.meta.response_id
    }

    pub fn type_name(&self) -> &'static str {
        self.payload.type_name()
    }

    /// Key for idempotent redelivery handling:
    /// `{response_id}:{sequence}:{type}`.
    pub fn dedup_key(&self) -> String {
        format!(
            "{}:{}:{}",
            self.meta.response_id,
            self.meta.sequence,
            self.type_name()
        )
    }

    /// True when this event finishes the response: a `ResponseEnd`, or a
    /// `Status` carrying a completed value.
    pub fn is_terminal(&self) -> bool {
        match &self.payload {
            EventPayload::ResponseEnd(_) => true,
            EventPayload::Status(status) => {
                matches!(status.status.as_str(), "completed" | "complete")
            }
            _ => false,
        }
    }

    pub fn is_error(&self) -> bool {
        match &self.payload {
            EventPayload::Error(_) => true,
            EventPayload::Status(status) => status.status == "error",
            _ => false,
        }
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.meta.sequence = sequence;
        self
    }

    pub fn with_block(mut self, content_block_index: usize) -> Self {
        self.meta.content_block_index = Some(content_block_index);
        self
    }

    pub fn with_emit(mut self, emit: bool) -> Self {
        self.meta.emit = emit;
        self
    }

    pub fn content(response_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(
            response_id,
            EventPayload::Content(Content {
                content: content.into(),
            }),
        )
    }

    pub fn status(
        response_id: impl Into<String>,
        status: impl Into<String>,
        message: Option<String>,
    ) -> Self {
        Self::new(
            response_id,
            EventPayload::Status(Status {
                status: status.into(),
                message,
            }),
        )
    }

    pub fn error(
        response_id: impl Into<String>,
        error_type: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(
            response_id,
            EventPayload::Error(ErrorDetail {
                error_type: error_type.into(),
                message: message.into(),
                details: None,
                chat_id: None,
            }),
        )
    }

    pub fn response_start(
        response_id: impl Into<String>,
        request_id: impl Into<String>,
        chat_id: impl Into<String>,
        task: impl Into<String>,
        model_id: impl Into<String>,
    ) -> Self {
        Self::new(
            response_id,
            EventPayload::ResponseStart(ResponseStart {
                request_id: request_id.into(),
                chat_id: chat_id.into(),
                task: task.into(),
                model_id: model_id.into(),
                parent_id: None,
            }),
        )
    }

    pub fn response_end(
        response_id: impl Into<String>,
        status: impl Into<String>,
        usage: Map<String, Value>,
    ) -> Self {
        Self::new(
            response_id,
            EventPayload::ResponseEnd(ResponseEnd {
                usage,
                status: status.into(),
                chat_id: None,
            }),
        )
    }

    pub fn tool_call(
        response_id: impl Into<String>,
        tool_name: impl Into<String>,
        tool_id: impl Into<String>,
        tool_args: Value,
    ) -> Self {
        Self::new(
            response_id,
            EventPayload::ToolCall(ToolCall {
                tool_name: tool_name.into(),
                tool_args,
                tool_id: tool_id.into(),
            }),
        )
    }

    pub fn tool_return(
        response_id: impl Into<String>,
        tool_name: impl Into<String>,
        tool_id: impl Into<String>,
        result: Value,
    ) -> Self {
        Self::new(
            response_id,
            EventPayload::ToolReturn(ToolReturn {
                tool_name: tool_name.into(),
                tool_id: tool_id.into(),
                result,
            }),
        )
    }

    pub fn metadata(response_id: impl Into<String>, metadata: Map<String, Value>) -> Self {
        Self::new(response_id, EventPayload::Metadata(Metadata { metadata }))
    }
}
