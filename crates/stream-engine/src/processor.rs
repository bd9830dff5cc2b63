//! The stateful aggregator turning an ordered event stream into a
//! structured [`Message`].
//!
//! One logical writer per response drives events through
//! [`EventProcessor::process`]; access is serialized with a
//! per-response mutex so an out-of-band interrupt can never interleave
//! with the generation task inside a single mutation. Nothing in here
//! returns an error for data-shape reasons: malformed payloads degrade
//! to placeholder text parts and the pipeline keeps going.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;

use stream_events::{EventPayload, StreamEvent};

use crate::block::{BlockKind, ContentBlockContext};
use crate::message::{
    CitationPart, DocumentPart, Message, MessagePart, MessageStatus, ReasoningPart, TextPart,
    ToolCallPart, ToolReturnPart,
};

struct ResponseState {
    message: Message,
    blocks: HashMap<usize, ContentBlockContext>,
    terminal: bool,
    seen: HashSet<String>,
}

impl ResponseState {
    fn new(response_id: &str) -> Self {
        Self {
            message: Message::new(response_id, "", None, ""),
            blocks: HashMap::new(),
            terminal: false,
            seen: HashSet::new(),
        }
    }

    fn block_mut(&mut self, index: usize) -> &mut ContentBlockContext {
        self.blocks.entry(index).or_default()
    }
}

/// Registry of in-flight responses and the transition rules applied to
/// each. Cheap to clone via the service wrapper; entries are created on
/// first sight of a response id and removed by cleanup or timeout.
pub struct EventProcessor {
    responses: DashMap<String, Arc<Mutex<ResponseState>>>,
}

impl EventProcessor {
    pub fn new() -> Self {
        Self {
            responses: DashMap::new(),
        }
    }

    fn entry(&self, response_id: &str) -> Arc<Mutex<ResponseState>> {
        self.responses
            .entry(response_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(ResponseState::new(response_id))))
            .clone()
    }

    /// Register a response before any events arrive, seeding the
    /// identifiers the lifecycle manager already knows.
    pub async fn ensure_response(
        &self,
        response_id: &str,
        chat_id: &str,
        parent_id: Option<String>,
        model_id: &str,
    ) {
        let entry = self.entry(response_id);
        let mut state = entry.lock().await;
        state.message.chat_id = chat_id.to_string();
        state.message.parent_id = parent_id;
        state.message.model_id = model_id.to_string();
    }

    /// Apply one event to its response. Infallible by design: bad data
    /// is logged and degraded, never raised.
    pub async fn process(&self, event: &StreamEvent) {
        let response_id = event.response_id().to_string();
        if response_id.is_empty() {
            log::warn!("Event missing response_id, cannot process");
            return;
        }

        let entry = self.entry(&response_id);
        let mut state = entry.lock().await;

        // Content/reasoning deltas may legitimately share a sequence
        // number (producers guarantee non-decreasing, not unique), so
        // redelivery dedup only covers the discrete event types.
        if !matches!(
            event.payload,
            EventPayload::Content(_) | EventPayload::Reasoning(_)
        ) {
            let dedup_key = event.dedup_key();
            if !state.seen.insert(dedup_key.clone()) {
                log::warn!("[{}] Duplicate event skipped: {}", response_id, dedup_key);
                return;
            }
        }

        if state.terminal {
            log::warn!(
                "[{}] Event after terminal ignored: {}",
                response_id,
                event.type_name()
            );
            return;
        }

        log::debug!(
            "[{}] Processing event [type={}, sequence={}]",
            response_id,
            event.type_name(),
            event.meta.sequence
        );

        apply(&mut state, event);
    }

    pub async fn get_message(&self, response_id: &str) -> Option<Message> {
        let entry = self.responses.get(response_id)?.clone();
        let state = entry.lock().await;
        Some(state.message.clone())
    }

    /// Remove all state for a response. Safe to call repeatedly.
    pub fn cleanup(&self, response_id: &str) {
        if self.responses.remove(response_id).is_some() {
            log::debug!("[{}] Cleaned up aggregator state", response_id);
        }
    }

    pub fn len(&self) -> usize {
        self.responses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.responses.is_empty()
    }
}

impl Default for EventProcessor {
    fn default() -> Self {
        Self::new()
    }
}

fn apply(state: &mut ResponseState, event: &StreamEvent) {
    match &event.payload {
        EventPayload::ResponseStart(start) => {
            state.message.status = MessageStatus::InProgress;
            if state.message.chat_id.is_empty() {
                state.message.chat_id = start.chat_id.clone();
            }
            if state.message.model_id.is_empty() {
                state.message.model_id = start.model_id.clone();
            }
            if state.message.parent_id.is_none() {
                state.message.parent_id = start
                    .parent_id
                    .clone()
                    .or_else(|| Some(start.request_id.clone()));
            }
        }

        EventPayload::Content(content) => {
            if content.content.trim().is_empty() {
                log::debug!(
                    "[{}] Skipping empty content event",
                    state.message.message_id
                );
                return;
            }

            let index = event.meta.content_block_index.unwrap_or(0);
            let block = state.block_mut(index);
            block.mark(BlockKind::Text);
            let block_sequence = event
                .meta
                .block_sequence
                .unwrap_or_else(|| block.next_block_sequence());

            // Extend the open text part for this block; anything else
            // in between starts a new one.
            if let Some(MessagePart::Text(text)) = state.message.parts.last_mut() {
                if text.content_block_index.unwrap_or(0) == index {
                    text.content.push_str(&content.content);
                    text.block_sequence = Some(block_sequence);
                    return;
                }
            }

            state.message.parts.push(MessagePart::Text(TextPart {
                content: content.content.clone(),
                content_block_index: event.meta.content_block_index,
                block_sequence: Some(block_sequence),
            }));
        }

        EventPayload::ToolCall(call) => {
            let index = event.meta.content_block_index.unwrap_or(0);
            match &call.tool_args {
                // Self-contained call: append atomically.
                Value::Object(_) | Value::Null => {
                    let block = state.block_mut(index);
                    block.mark(BlockKind::ToolCall);
                    block.tool_name = Some(call.tool_name.clone());
                    block.tool_id = Some(call.tool_id.clone());

                    let args = match &call.tool_args {
                        Value::Null => Value::Object(Map::new()),
                        other => other.clone(),
                    };
                    state.message.parts.push(MessagePart::ToolCall(ToolCallPart {
                        tool_name: call.tool_name.clone(),
                        tool_args: args,
                        tool_id: call.tool_id.clone(),
                        content_block_index: event.meta.content_block_index,
                    }));
                }
                // String fragment: buffer until the block's input parses.
                Value::String(fragment) => {
                    let block = state.block_mut(index);
                    if let Some(args) =
                        block.push_tool_fragment(&call.tool_name, &call.tool_id, fragment)
                    {
                        let tool_name = block
                            .tool_name
                            .clone()
                            .unwrap_or_else(|| call.tool_name.clone());
                        let tool_id = block
                            .tool_id
                            .clone()
                            .unwrap_or_else(|| call.tool_id.clone());
                        state.message.parts.push(MessagePart::ToolCall(ToolCallPart {
                            tool_name,
                            tool_args: args,
                            tool_id,
                            content_block_index: event.meta.content_block_index,
                        }));
                    }
                }
                other => {
                    log::warn!(
                        "[{}] Unparsable tool_args for {}, degrading to text",
                        state.message.message_id,
                        call.tool_name
                    );
                    push_placeholder(
                        &mut state.message,
                        format!(
                            "[unparsable tool arguments for {}: {}]",
                            call.tool_name, other
                        ),
                    );
                }
            }
        }

        EventPayload::ToolReturn(ret) => {
            state
                .message
                .parts
                .push(MessagePart::ToolReturn(ToolReturnPart {
                    tool_name: ret.tool_name.clone(),
                    tool_id: ret.tool_id.clone(),
                    result: ret.result.clone(),
                    content_block_index: event.meta.content_block_index,
                }));
        }

        EventPayload::Document(doc) => {
            state.message.parts.push(MessagePart::Document(DocumentPart {
                document_id: doc.document_id.clone(),
                title: doc.title.clone(),
                pointer: doc.pointer.clone(),
                mime_type: doc.mime_type.clone(),
                page_count: doc.page_count,
                word_count: doc.word_count,
            }));
        }

        EventPayload::Citation(citation) => {
            state.message.parts.push(MessagePart::Citation(CitationPart {
                document_id: citation.document_id.clone(),
                text: citation.text.clone(),
                page: citation.page,
                section: citation.section.clone(),
                citation_id: citation.citation_id.clone(),
            }));
        }

        EventPayload::Reasoning(reasoning) => {
            let text = reasoning.text.clone().unwrap_or_default();
            if text.trim().is_empty() && reasoning.redacted_content.is_none() {
                log::debug!(
                    "[{}] Skipping empty reasoning event",
                    state.message.message_id
                );
                return;
            }
            if let Some(block_index) = event.meta.content_block_index {
                state.block_mut(block_index).mark(BlockKind::Reasoning);
            }
            state.message.parts.push(MessagePart::Reasoning(ReasoningPart {
                content: text,
                signature: reasoning.signature.clone(),
                redacted_content: reasoning.redacted_content.clone(),
                content_block_index: event.meta.content_block_index,
            }));
        }

        EventPayload::Metadata(meta) => {
            // Shallow merge; later keys overwrite earlier ones.
            for (key, value) in &meta.metadata {
                state.message.metadata.insert(key.clone(), value.clone());
            }
        }

        EventPayload::Status(status) => {
            if status.status == "interrupted" {
                state.message.status = MessageStatus::Interrupted;
            }
            if let Some(message) = &status.message {
                state
                    .message
                    .metadata
                    .insert("status_message".to_string(), json!(message));
            }
        }

        EventPayload::Error(error) => {
            // Recorded, never terminal: a partially-completed message is
            // still worth delivering.
            let record = json!({
                "error_type": error.error_type,
                "message": error.message,
                "details": error.details,
                "timestamp": Utc::now().to_rfc3339(),
            });
            match state
                .message
                .metadata
                .entry("errors".to_string())
                .or_insert_with(|| Value::Array(Vec::new()))
            {
                Value::Array(errors) => errors.push(record),
                other => *other = Value::Array(vec![record]),
            }
            log::warn!(
                "[{}] Producer error recorded: {} ({})",
                state.message.message_id,
                error.message,
                error.error_type
            );
        }

        EventPayload::ResponseEnd(end) => {
            flush_pending_tool_input(state);

            state.message.status = MessageStatus::parse(&end.status).unwrap_or_else(|| {
                log::warn!(
                    "[{}] Unknown terminal status '{}', treating as completed",
                    state.message.message_id,
                    end.status
                );
                MessageStatus::Completed
            });

            if !end.usage.is_empty() {
                let usage = state
                    .message
                    .metadata
                    .entry("usage".to_string())
                    .or_insert_with(|| Value::Object(Map::new()));
                match usage {
                    Value::Object(map) => {
                        for (key, value) in &end.usage {
                            map.insert(key.clone(), value.clone());
                        }
                    }
                    other => *other = Value::Object(end.usage.clone()),
                }
            }

            state.terminal = true;
            log::info!(
                "[{}] Response terminal with status {:?} ({} parts)",
                state.message.message_id,
                state.message.status,
                state.message.parts.len()
            );
        }
    }
}

/// Argument buffers that never parsed become visible placeholders at
/// the end of the response instead of vanishing.
fn flush_pending_tool_input(state: &mut ResponseState) {
    let mut indices: Vec<usize> = state.blocks.keys().copied().collect();
    indices.sort_unstable();

    for index in indices {
        let pending = state
            .blocks
            .get_mut(&index)
            .and_then(ContentBlockContext::take_pending_tool_input);
        if let Some((tool_name, input)) = pending {
            log::warn!(
                "[{}] Flushing incomplete tool input for '{}' as placeholder",
                state.message.message_id,
                tool_name
            );
            push_placeholder(
                &mut state.message,
                format!("[incomplete tool arguments for {tool_name}: {input}]"),
            );
        }
    }
}

fn push_placeholder(message: &mut Message, text: String) {
    message.parts.push(MessagePart::Text(TextPart {
        content: text,
        content_block_index: None,
        block_sequence: None,
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn processor() -> EventProcessor {
        EventProcessor::new()
    }

    #[tokio::test]
    async fn content_events_merge_into_one_text_part_per_block() {
        let p = processor();
        for (seq, chunk) in ["Hello", " there", ", how are you?"].iter().enumerate() {
            p.process(&StreamEvent::content("r1", *chunk).with_sequence(seq as u64))
                .await;
        }

        let message = p.get_message("r1").await.unwrap();
        assert_eq!(message.parts.len(), 1);
        assert_eq!(message.text(), "Hello there, how are you?");
    }

    #[tokio::test]
    async fn distinct_blocks_produce_distinct_text_parts() {
        let p = processor();
        p.process(&StreamEvent::content("r1", "block zero").with_block(0))
            .await;
        p.process(
            &StreamEvent::content("r1", "block one")
                .with_block(1)
                .with_sequence(1),
        )
        .await;
        p.process(
            &StreamEvent::content("r1", " continues")
                .with_block(1)
                .with_sequence(2),
        )
        .await;

        let message = p.get_message("r1").await.unwrap();
        assert_eq!(message.parts.len(), 2);
        match &message.parts[1] {
            MessagePart::Text(text) => assert_eq!(text.content, "block one continues"),
            other => panic!("expected text part, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn tool_call_then_return_are_separate_correlatable_parts() {
        let p = processor();
        p.process(&StreamEvent::tool_call("r1", "search", "t1", json!({"q": "x"})))
            .await;
        p.process(&StreamEvent::content("r1", "thinking").with_sequence(1))
            .await;
        p.process(
            &StreamEvent::tool_return("r1", "search", "t1", json!("answer")).with_sequence(2),
        )
        .await;

        let message = p.get_message("r1").await.unwrap();
        assert_eq!(message.parts.len(), 3);
        assert!(message.find_tool_call("t1").is_some());
        assert_eq!(message.find_tool_return("t1").unwrap().result, json!("answer"));
    }

    #[tokio::test]
    async fn string_fragments_buffer_until_parseable() {
        let p = processor();
        p.process(
            &StreamEvent::tool_call("r1", "search", "t1", json!("{\"q\":"))
                .with_block(2)
                .with_sequence(0),
        )
        .await;
        assert!(p.get_message("r1").await.unwrap().parts.is_empty());

        p.process(
            &StreamEvent::tool_call("r1", "", "", json!("\"rust\"}"))
                .with_block(2)
                .with_sequence(1),
        )
        .await;

        let message = p.get_message("r1").await.unwrap();
        let call = message.find_tool_call("t1").unwrap();
        assert_eq!(call.tool_args, json!({"q": "rust"}));
    }

    #[tokio::test]
    async fn unfinished_tool_input_flushes_as_placeholder_at_end() {
        let p = processor();
        p.process(&StreamEvent::tool_call("r1", "search", "t1", json!("{\"half")).with_block(0))
            .await;
        p.process(
            &StreamEvent::response_end("r1", "completed", Map::new()).with_sequence(1),
        )
        .await;

        let message = p.get_message("r1").await.unwrap();
        assert_eq!(message.parts.len(), 1);
        match &message.parts[0] {
            MessagePart::Text(text) => {
                assert!(text.content.contains("incomplete tool arguments"));
                assert!(text.content.contains("{\"half"));
            }
            other => panic!("expected placeholder text, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn scalar_tool_args_degrade_to_placeholder() {
        let p = processor();
        p.process(&StreamEvent::tool_call("r1", "search", "t1", json!(42)))
            .await;

        let message = p.get_message("r1").await.unwrap();
        assert_eq!(message.parts.len(), 1);
        match &message.parts[0] {
            MessagePart::Text(text) => {
                assert!(text.content.contains("unparsable tool arguments"))
            }
            other => panic!("expected placeholder text, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn errors_are_recorded_without_stopping_content() {
        let p = processor();
        p.process(&StreamEvent::content("r1", "Processing...")).await;
        p.process(&StreamEvent::error("r1", "ThrottledError", "slow down").with_sequence(1))
            .await;
        p.process(&StreamEvent::content("r1", " recovered").with_sequence(2))
            .await;

        let message = p.get_message("r1").await.unwrap();
        assert_eq!(message.text(), "Processing... recovered");
        let errors = message.metadata["errors"].as_array().unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0]["error_type"], "ThrottledError");
        assert!(!message.status.is_terminal());
    }

    #[tokio::test]
    async fn response_end_sets_status_and_merges_usage() {
        let p = processor();
        let mut usage = Map::new();
        usage.insert("total_tokens".to_string(), json!(42));
        p.process(&StreamEvent::response_end("r1", "completed", usage))
            .await;

        let message = p.get_message("r1").await.unwrap();
        assert_eq!(message.status, MessageStatus::Completed);
        assert_eq!(message.metadata["usage"]["total_tokens"], json!(42));
    }

    #[tokio::test]
    async fn events_after_terminal_are_ignored() {
        let p = processor();
        p.process(&StreamEvent::response_end("r1", "interrupted", Map::new()))
            .await;
        p.process(&StreamEvent::content("r1", "late").with_sequence(5))
            .await;
        p.process(
            &StreamEvent::response_end("r1", "completed", Map::new()).with_sequence(6),
        )
        .await;

        let message = p.get_message("r1").await.unwrap();
        assert_eq!(message.status, MessageStatus::Interrupted);
        assert!(message.parts.is_empty());
    }

    #[tokio::test]
    async fn redelivered_tool_calls_are_skipped() {
        let p = processor();
        let event = StreamEvent::tool_call("r1", "search", "t1", json!({"q": "x"}))
            .with_sequence(3);
        p.process(&event).await;
        p.process(&event).await;

        assert_eq!(p.get_message("r1").await.unwrap().parts.len(), 1);
    }

    #[tokio::test]
    async fn content_chunks_sharing_a_sequence_are_all_kept() {
        let p = processor();
        p.process(&StreamEvent::content("r1", "a")).await;
        p.process(&StreamEvent::content("r1", "b")).await;

        assert_eq!(p.get_message("r1").await.unwrap().text(), "ab");
    }

    #[tokio::test]
    async fn metadata_merges_shallowly_with_later_keys_winning() {
        let p = processor();
        let mut first = Map::new();
        first.insert("a".to_string(), json!(1));
        first.insert("b".to_string(), json!(1));
        let mut second = Map::new();
        second.insert("b".to_string(), json!(2));
        p.process(&StreamEvent::metadata("r1", first)).await;
        p.process(&StreamEvent::metadata("r1", second).with_sequence(1))
            .await;

        let message = p.get_message("r1").await.unwrap();
        assert_eq!(message.metadata["a"], json!(1));
        assert_eq!(message.metadata["b"], json!(2));
    }

    #[tokio::test]
    async fn cleanup_removes_state_and_is_idempotent() {
        let p = processor();
        p.process(&StreamEvent::content("r1", "hi")).await;
        p.cleanup("r1");
        assert!(p.get_message("r1").await.is_none());
        p.cleanup("r1");
    }

    #[tokio::test]
    async fn empty_content_creates_no_part() {
        let p = processor();
        p.process(&StreamEvent::content("r1", "   ")).await;
        assert!(p.get_message("r1").await.unwrap().parts.is_empty());
    }
}
