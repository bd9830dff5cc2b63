//! Broker-boundary serialization.
//!
//! Events cross the broker as JSON carrying an explicit
//! `__event_type__` discriminant, so any subscriber (including one in
//! another process) can reconstruct the exact variant without sharing
//! in-process type information.

use thiserror::Error;

use crate::event::StreamEvent;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("failed to serialize event: {0}")]
    Serialize(#[source] serde_json::Error),

    /// A corrupt wire payload cannot be safely guessed at, so this is
    /// the one place the engine fails loudly.
    #[error("failed to deserialize event: {0}")]
    Deserialize(#[source] serde_json::Error),
}

pub fn serialize_event(event: &StreamEvent) -> Result<String, WireError> {
    serde_json::to_string(event).map_err(WireError::Serialize)
}

pub fn deserialize_event(json: &str) -> Result<StreamEvent, WireError> {
    serde_json::from_str(json).map_err(WireError::Deserialize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventPayload, StreamEvent};
    use serde_json::json;

    #[test]
    fn round_trips_the_exact_variant() {
        let event = StreamEvent::tool_call("resp-1", "search", "t1", json!({"q": "rust"}))
            .with_sequence(5)
            .with_block(1);

        let wire = serialize_event(&event).unwrap();
        assert!(wire.contains("\"__event_type__\":\"ToolCallEvent\""));

        let back = deserialize_event(&wire).unwrap();
        assert_eq!(back, event);
        assert!(matches!(back.payload, EventPayload::ToolCall(_)));
    }

    #[test]
    fn missing_discriminant_fails_loudly() {
        let err = deserialize_event(r#"{"response_id":"r","content":"hi"}"#);
        assert!(matches!(err, Err(WireError::Deserialize(_))));
    }

    #[test]
    fn unknown_discriminant_fails_loudly() {
        let err =
            deserialize_event(r#"{"__event_type__":"MysteryEvent","response_id":"r"}"#);
        assert!(matches!(err, Err(WireError::Deserialize(_))));
    }
}
