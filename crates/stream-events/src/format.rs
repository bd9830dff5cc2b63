//! Protocol renderers.
//!
//! The same typed event is rendered three ways: as a plain field map
//! for the synchronous invoke path, as an SSE text frame, and as a
//! WebSocket JSON envelope. All three strip the protocol-internal
//! fields (`emit`, `persist`, `sequence`) and the wire discriminant.

use chrono::Utc;
use serde_json::{json, Map, Value};

use crate::event::StreamEvent;
use crate::wire::WireError;

const INTERNAL_FIELDS: &[&str] = &["emit", "persist", "sequence", "__event_type__"];

/// Event fields without the protocol-internal bookkeeping.
pub fn public_fields(event: &StreamEvent) -> Result<Map<String, Value>, WireError> {
    let value = serde_json::to_value(event).map_err(WireError::Serialize)?;
    let mut map = match value {
        Value::Object(map) => map,
        // Events always serialize to objects; anything else is a bug.
        other => {
            use serde::ser::Error;
            return Err(WireError::Serialize(serde_json::Error::custom(format!(
                "event serialized to non-object value: {other}"
            ))));
        }
    };
    for field in INTERNAL_FIELDS {
        map.remove(*field);
    }
    Ok(map)
}

/// Two-line SSE text frame: `event: <type>\ndata: <json>\n\n`.
pub fn sse_frame(event: &StreamEvent) -> Result<String, WireError> {
    let data = Value::Object(public_fields(event)?);
    Ok(format!(
        "event: {}\ndata: {}\n\n",
        event.type_name(),
        serde_json::to_string(&data).map_err(WireError::Serialize)?
    ))
}

/// WebSocket envelope: `{"type":"event","data":{...},"timestamp":...}`.
/// The data object carries its own `type` field with the event name.
pub fn websocket_frame(event: &StreamEvent) -> Result<String, WireError> {
    let mut data = public_fields(event)?;
    data.insert("type".to_string(), json!(event.type_name()));

    let envelope = json!({
        "type": "event",
        "data": Value::Object(data),
        "timestamp": Utc::now().to_rfc3339(),
    });
    serde_json::to_string(&envelope).map_err(WireError::Serialize)
}

/// Plain field map for the synchronous invoke path.
pub fn sync_value(event: &StreamEvent) -> Result<Value, WireError> {
    Ok(Value::Object(public_fields(event)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_frame_has_event_line_and_no_internal_fields() {
        let event = StreamEvent::content("resp-1", "hello").with_sequence(3);
        let frame = sse_frame(&event).unwrap();

        assert!(frame.starts_with("event: content\ndata: "));
        assert!(frame.ends_with("\n\n"));
        assert!(!frame.contains("\"sequence\""));
        assert!(!frame.contains("\"emit\""));
        assert!(!frame.contains("__event_type__"));
        assert!(frame.contains("\"content\":\"hello\""));
        assert!(frame.contains("\"response_id\":\"resp-1\""));
    }

    #[test]
    fn websocket_frame_wraps_data_with_type_and_timestamp() {
        let event = StreamEvent::status("resp-1", "processing", None);
        let frame = websocket_frame(&event).unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();

        assert_eq!(value["type"], "event");
        assert_eq!(value["data"]["type"], "status");
        assert_eq!(value["data"]["status"], "processing");
        assert!(value["timestamp"].is_string());
        assert!(value["data"].get("persist").is_none());
    }

    #[test]
    fn sync_value_is_the_filtered_field_map() {
        let event = StreamEvent::content("resp-1", "hi");
        let value = sync_value(&event).unwrap();

        assert_eq!(value["response_id"], "resp-1");
        assert_eq!(value["content"], "hi");
        assert!(value.get("emit").is_none());
    }
}
