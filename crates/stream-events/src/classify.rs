//! Structural classification of loosely-typed upstream events.
//!
//! External agent runtimes deliver events as bare JSON records with no
//! discriminant. This module is the single boundary that turns such a
//! record into exactly one typed [`StreamEvent`], using a
//! priority-ordered field heuristic. Order matters: payloads are
//! ambiguous (a record with both `status` and `usage` is a response
//! end, not a status update).

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::event::{
    Citation, Content, Document, ErrorDetail, EventMeta, EventPayload, Metadata, Reasoning,
    ResponseEnd, ResponseStart, Status, StreamEvent, ToolCall, ToolReturn,
};

/// The outcome of classifying a raw record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    ResponseStart,
    ResponseEnd,
    Content,
    ToolCall,
    ToolReturn,
    Metadata,
    Document,
    Citation,
    Status,
    Error,
    Reasoning,
    /// Unrecognized shape; callers log and drop these (non-fatal).
    Unclassified,
}

impl EventKind {
    /// Parse an explicit discriminant, accepting both the wire names
    /// (`ContentEvent`) and the snake_case names (`content`).
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "ResponseStartEvent" | "response_start" => Some(Self::ResponseStart),
            "ResponseEndEvent" | "response_end" => Some(Self::ResponseEnd),
            "ContentEvent" | "content" => Some(Self::Content),
            "ToolCallEvent" | "tool_call" => Some(Self::ToolCall),
            "ToolReturnEvent" | "tool_return" => Some(Self::ToolReturn),
            "MetadataEvent" | "metadata" => Some(Self::Metadata),
            "DocumentEvent" | "document" => Some(Self::Document),
            "CitationEvent" | "citation" => Some(Self::Citation),
            "StatusEvent" | "status" => Some(Self::Status),
            "ErrorEvent" | "error" => Some(Self::Error),
            "ReasoningEvent" | "reasoning" => Some(Self::Reasoning),
            _ => None,
        }
    }
}

/// Fields that carry protocol bookkeeping rather than payload.
const INTERNAL_FIELDS: &[&str] = &[
    "response_id",
    "sequence",
    "emit",
    "persist",
    "timestamp",
    "content_block_index",
    "block_sequence",
];

fn has(raw: &Value, key: &str) -> bool {
    raw.get(key).is_some()
}

fn str_field<'a>(raw: &'a Value, key: &str) -> Option<&'a str> {
    raw.get(key).and_then(Value::as_str)
}

/// Classify a raw record into exactly one event kind.
///
/// First match wins; the rule order is load-bearing.
pub fn classify(raw: &Value) -> EventKind {
    // 1. Explicit discriminant wins outright.
    if let Some(name) = str_field(raw, "event_type").or_else(|| str_field(raw, "__event_type__")) {
        return EventKind::from_name(name).unwrap_or(EventKind::Unclassified);
    }

    // 2. The response-start field combination is unique.
    if has(raw, "request_id") && has(raw, "chat_id") && has(raw, "task") && has(raw, "model_id") {
        return EventKind::ResponseStart;
    }

    // 3. Both status and usage: terminal, never a bare status update.
    if has(raw, "status") && has(raw, "usage") {
        return EventKind::ResponseEnd;
    }

    // 4.
    if has(raw, "status") {
        return EventKind::Status;
    }

    // 5.
    if has(raw, "error_type") || has(raw, "error") {
        return EventKind::Error;
    }

    // 6.
    if has(raw, "tool_name") && has(raw, "tool_id") {
        if has(raw, "result") {
            return EventKind::ToolReturn;
        }
        // With or without tool_args this is a tool call; a bare
        // name/id pair is a partial call.
        return EventKind::ToolCall;
    }

    // 7.
    if has(raw, "tool_name") || has(raw, "tool_id") {
        return EventKind::ToolCall;
    }

    // 8.
    if has(raw, "document_id") && (has(raw, "title") || has(raw, "pointer")) {
        return EventKind::Document;
    }

    // 9.
    if has(raw, "metadata") {
        return EventKind::Metadata;
    }

    // 10. A usage-only record is metadata, not a terminal event.
    if has(raw, "usage") && only_internal_fields_besides(raw, "usage") {
        return EventKind::Metadata;
    }

    // 11.
    if has(raw, "text") && (has(raw, "signature") || has(raw, "redacted_content")) {
        return EventKind::Reasoning;
    }

    // 12.
    if str_field(raw, "content").is_some() {
        return EventKind::Content;
    }

    // 13. Nested upstream-protocol envelope.
    if let Some(nested) = raw.get("event").and_then(Value::as_object) {
        if nested.contains_key("contentBlockDelta") {
            return EventKind::Content;
        }
        if nested.contains_key("messageStart") {
            return EventKind::ResponseStart;
        }
        if nested.contains_key("messageStop") {
            return EventKind::ResponseEnd;
        }
    }

    // 14.
    if str_field(raw, "data").is_some() {
        return EventKind::Content;
    }

    // 15.
    EventKind::Unclassified
}

fn only_internal_fields_besides(raw: &Value, key: &str) -> bool {
    match raw.as_object() {
        Some(map) => map
            .keys()
            .all(|k| k == key || INTERNAL_FIELDS.contains(&k.as_str())),
        None => false,
    }
}

/// Build a typed event from a raw record.
///
/// Returns `None` for unclassifiable records, records without a
/// `response_id`, and upstream bootstrap markers (`init_event_loop`) —
/// all of which are dropped without failing the stream.
pub fn normalize(raw: &Value) -> Option<StreamEvent> {
    if has(raw, "init_event_loop") {
        log::debug!("Dropping init_event_loop bootstrap record");
        return None;
    }

    let response_id = match str_field(raw, "response_id") {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => {
            log::warn!("Raw event missing response_id, cannot normalize");
            return None;
        }
    };

    let kind = classify(raw);
    let payload = match kind {
        EventKind::ResponseStart => EventPayload::ResponseStart(ResponseStart {
            request_id: owned_str(raw, "request_id"),
            chat_id: owned_str(raw, "chat_id"),
            task: owned_str(raw, "task"),
            model_id: owned_str(raw, "model_id"),
            parent_id: str_field(raw, "parent_id").map(str::to_string),
        }),
        EventKind::ResponseEnd => EventPayload::ResponseEnd(ResponseEnd {
            usage: object_field(raw, "usage"),
            status: str_field(raw, "status").unwrap_or("completed").to_string(),
            chat_id: str_field(raw, "chat_id").map(str::to_string),
        }),
        EventKind::Status => EventPayload::Status(Status {
            status: str_field(raw, "status").unwrap_or("unknown").to_string(),
            message: str_field(raw, "message").map(str::to_string),
        }),
        EventKind::Error => EventPayload::Error(ErrorDetail {
            error_type: str_field(raw, "error_type")
                .map(str::to_string)
                .or_else(|| raw.get("error").map(value_to_display))
                .unwrap_or_else(|| "UnknownError".to_string()),
            message: str_field(raw, "message")
                .unwrap_or("An error occurred")
                .to_string(),
            details: raw.get("details").cloned(),
            chat_id: str_field(raw, "chat_id").map(str::to_string),
        }),
        EventKind::ToolCall => EventPayload::ToolCall(ToolCall {
            tool_name: owned_str(raw, "tool_name"),
            tool_args: raw
                .get("tool_args")
                .cloned()
                .unwrap_or(Value::Object(Map::new())),
            tool_id: owned_str(raw, "tool_id"),
        }),
        EventKind::ToolReturn => EventPayload::ToolReturn(ToolReturn {
            tool_name: owned_str(raw, "tool_name"),
            tool_id: owned_str(raw, "tool_id"),
            result: raw.get("result").cloned().unwrap_or(Value::Null),
        }),
        EventKind::Document => EventPayload::Document(Document {
            document_id: owned_str(raw, "document_id"),
            title: owned_str(raw, "title"),
            pointer: owned_str(raw, "pointer"),
            mime_type: owned_str(raw, "mime_type"),
            page_count: u32_field(raw, "page_count"),
            word_count: u32_field(raw, "word_count"),
        }),
        EventKind::Citation => EventPayload::Citation(Citation {
            document_id: owned_str(raw, "document_id"),
            text: owned_str(raw, "text"),
            page: u32_field(raw, "page"),
            section: str_field(raw, "section").map(str::to_string),
            citation_id: str_field(raw, "citation_id").map(str::to_string),
            reference_number: u32_field(raw, "reference_number"),
            document_title: str_field(raw, "document_title").map(str::to_string),
            document_pointer: str_field(raw, "document_pointer").map(str::to_string),
        }),
        EventKind::Metadata => EventPayload::Metadata(Metadata {
            metadata: if has(raw, "metadata") {
                object_field(raw, "metadata")
            } else {
                // Usage-only record: wrap the usage map as metadata.
                let mut map = Map::new();
                map.insert(
                    "usage".to_string(),
                    raw.get("usage").cloned().unwrap_or(Value::Null),
                );
                map
            },
        }),
        EventKind::Reasoning => EventPayload::Reasoning(Reasoning {
            text: str_field(raw, "text").map(str::to_string),
            signature: str_field(raw, "signature").map(str::to_string),
            redacted_content: raw
                .get("redacted_content")
                .and_then(|v| serde_json::from_value(v.clone()).ok()),
        }),
        EventKind::Content => EventPayload::Content(Content {
            content: extract_content(raw),
        }),
        EventKind::Unclassified => return None,
    };

    let mut meta = EventMeta::new(response_id);
    meta.sequence = raw.get("sequence").and_then(Value::as_u64).unwrap_or(0);
    meta.emit = raw.get("emit").and_then(Value::as_bool).unwrap_or(true);
    meta.persist = raw.get("persist").and_then(Value::as_bool).unwrap_or(true);
    if let Some(ts) = str_field(raw, "timestamp")
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
    {
        meta.timestamp = ts;
    }
    let (block_index, block_sequence) = extract_block_tracking(raw);
    meta.content_block_index = block_index;
    meta.block_sequence = block_sequence;

    Some(StreamEvent { meta, payload })
}

fn owned_str(raw: &Value, key: &str) -> String {
    str_field(raw, key).unwrap_or_default().to_string()
}

fn u32_field(raw: &Value, key: &str) -> Option<u32> {
    raw.get(key).and_then(Value::as_u64).map(|n| n as u32)
}

fn object_field(raw: &Value, key: &str) -> Map<String, Value> {
    raw.get(key)
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default()
}

fn value_to_display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Pull content text from any of the accepted carriers.
fn extract_content(raw: &Value) -> String {
    if let Some(content) = str_field(raw, "content") {
        return content.to_string();
    }
    if let Some(text) = raw
        .pointer("/event/contentBlockDelta/delta/text")
        .and_then(Value::as_str)
    {
        return text.to_string();
    }
    str_field(raw, "data").unwrap_or_default().to_string()
}

/// Block index/sequence from flat fields or from the nested
/// `contentBlockDelta` envelope.
fn extract_block_tracking(raw: &Value) -> (Option<usize>, Option<u64>) {
    let mut index = raw
        .get("content_block_index")
        .and_then(Value::as_u64)
        .map(|n| n as usize);
    let mut sequence = raw.get("block_sequence").and_then(Value::as_u64);

    if let Some(delta) = raw.pointer("/event/contentBlockDelta") {
        if index.is_none() {
            index = delta
                .get("contentBlockIndex")
                .and_then(Value::as_u64)
                .map(|n| n as usize);
        }
        if sequence.is_none() {
            sequence = delta.get("contentBlockPart").and_then(Value::as_u64);
        }
    }

    (index, sequence)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn explicit_discriminant_wins() {
        let raw = json!({"event_type": "StatusEvent", "status": "x", "usage": {}});
        assert_eq!(classify(&raw), EventKind::Status);
    }

    #[test]
    fn status_with_usage_is_response_end_never_status() {
        let raw = json!({"status": "completed", "usage": {"total_tokens": 42}});
        assert_eq!(classify(&raw), EventKind::ResponseEnd);
    }

    #[test]
    fn status_alone_is_status() {
        assert_eq!(classify(&json!({"status": "processing"})), EventKind::Status);
    }

    #[test]
    fn tool_fields_disambiguate_call_and_return() {
        let call = json!({"tool_name": "search", "tool_id": "t1", "tool_args": {}});
        let partial = json!({"tool_name": "search", "tool_id": "t1"});
        let ret = json!({"tool_name": "search", "tool_id": "t1", "result": "ok"});
        assert_eq!(classify(&call), EventKind::ToolCall);
        assert_eq!(classify(&partial), EventKind::ToolCall);
        assert_eq!(classify(&ret), EventKind::ToolReturn);
    }

    #[test]
    fn lone_tool_field_is_tool_call() {
        assert_eq!(classify(&json!({"tool_id": "t1"})), EventKind::ToolCall);
    }

    #[test]
    fn response_start_requires_the_full_field_set() {
        let raw = json!({
            "request_id": "r", "chat_id": "c", "task": "chat", "model_id": "m"
        });
        assert_eq!(classify(&raw), EventKind::ResponseStart);
        assert_eq!(
            classify(&json!({"request_id": "r", "chat_id": "c"})),
            EventKind::Unclassified
        );
    }

    #[test]
    fn usage_only_record_is_metadata() {
        let raw = json!({"response_id": "resp", "sequence": 3, "usage": {"total_tokens": 5}});
        assert_eq!(classify(&raw), EventKind::Metadata);

        let event = normalize(&raw).unwrap();
        match event.payload {
            EventPayload::Metadata(meta) => {
                assert_eq!(meta.metadata["usage"]["total_tokens"], json!(5));
            }
            other => panic!("expected metadata, got {other:?}"),
        }
    }

    #[test]
    fn usage_with_payload_fields_is_not_metadata() {
        // No status, so this is not a response end; the extra payload
        // key disqualifies the usage-only rule and content wins.
        let raw = json!({"usage": {}, "content": "hi"});
        assert_eq!(classify(&raw), EventKind::Content);
    }

    #[test]
    fn reasoning_needs_signature_or_redaction() {
        let raw = json!({"text": "thinking", "signature": "sig"});
        assert_eq!(classify(&raw), EventKind::Reasoning);
        assert_eq!(classify(&json!({"text": "thinking"})), EventKind::Unclassified);
    }

    #[test]
    fn nested_envelope_maps_to_core_kinds() {
        let delta = json!({"event": {"contentBlockDelta": {
            "delta": {"text": "chunk"}, "contentBlockIndex": 2
        }}});
        assert_eq!(classify(&delta), EventKind::Content);
        assert_eq!(
            classify(&json!({"event": {"messageStart": {}}})),
            EventKind::ResponseStart
        );
        assert_eq!(
            classify(&json!({"event": {"messageStop": {}}})),
            EventKind::ResponseEnd
        );
    }

    #[test]
    fn data_string_is_content_fallback() {
        assert_eq!(classify(&json!({"data": "chunk"})), EventKind::Content);
    }

    #[test]
    fn unknown_shape_is_unclassified() {
        assert_eq!(classify(&json!({"mystery": true})), EventKind::Unclassified);
        assert!(normalize(&json!({"response_id": "r", "mystery": true})).is_none());
    }

    #[test]
    fn normalize_extracts_nested_delta_content_and_block() {
        let raw = json!({
            "response_id": "resp-1",
            "event": {"contentBlockDelta": {
                "delta": {"text": "chunk"},
                "contentBlockIndex": 1,
                "contentBlockPart": 4
            }}
        });
        let event = normalize(&raw).unwrap();
        assert_eq!(event.meta.content_block_index, Some(1));
        assert_eq!(event.meta.block_sequence, Some(4));
        match event.payload {
            EventPayload::Content(content) => assert_eq!(content.content, "chunk"),
            other => panic!("expected content, got {other:?}"),
        }
    }

    #[test]
    fn normalize_requires_response_id() {
        assert!(normalize(&json!({"content": "hi"})).is_none());
    }

    #[test]
    fn normalize_drops_init_event_loop_marker() {
        let raw = json!({"response_id": "resp-1", "init_event_loop": true});
        assert!(normalize(&raw).is_none());
    }

    #[test]
    fn error_falls_back_to_error_field() {
        let raw = json!({"response_id": "resp-1", "error": "boom"});
        let event = normalize(&raw).unwrap();
        match event.payload {
            EventPayload::Error(err) => {
                assert_eq!(err.error_type, "boom");
                assert_eq!(err.message, "An error occurred");
            }
            other => panic!("expected error, got {other:?}"),
        }
    }
}
