//! Per-block ephemeral state for interleaved multi-block streams.

use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Text,
    ToolCall,
    Reasoning,
}

/// Tracking state for one open content block, created lazily on the
/// first event that references its index and dropped when the response
/// is cleaned up.
#[derive(Debug, Default, Clone)]
pub struct ContentBlockContext {
    pub kind: Option<BlockKind>,
    pub tool_name: Option<String>,
    pub tool_id: Option<String>,
    /// Raw tool-argument fragments delivered as strings, buffered until
    /// they parse as JSON.
    pub accumulated_tool_input: String,
    pub block_sequence_counter: u64,
    pub metadata: Map<String, Value>,
}

impl ContentBlockContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next position within this block, used when the producer did not
    /// assign one.
    pub fn next_block_sequence(&mut self) -> u64 {
        let seq = self.block_sequence_counter;
        self.block_sequence_counter += 1;
        seq
    }

    pub fn mark(&mut self, kind: BlockKind) {
        self.kind = Some(kind);
    }

    /// Buffer a string fragment of tool arguments. Returns the parsed
    /// arguments once the accumulated buffer forms valid JSON.
    pub fn push_tool_fragment(
        &mut self,
        tool_name: &str,
        tool_id: &str,
        fragment: &str,
    ) -> Option<Value> {
        self.kind = Some(BlockKind::ToolCall);
        if !tool_name.is_empty() {
            self.tool_name = Some(tool_name.to_string());
        }
        if !tool_id.is_empty() {
            self.tool_id = Some(tool_id.to_string());
        }
        self.accumulated_tool_input.push_str(fragment);

        match serde_json::from_str(&self.accumulated_tool_input) {
            Ok(args) => {
                self.accumulated_tool_input.clear();
                Some(args)
            }
            Err(_) => None,
        }
    }

    /// Drain an unparsed argument buffer, if any, so it can be flushed
    /// as a placeholder part instead of being silently lost.
    pub fn take_pending_tool_input(&mut self) -> Option<(String, String)> {
        if self.accumulated_tool_input.is_empty() {
            return None;
        }
        let input = std::mem::take(&mut self.accumulated_tool_input);
        let name = self.tool_name.clone().unwrap_or_default();
        Some((name, input))
    }
}
