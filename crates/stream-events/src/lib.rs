//! Typed streaming events, their structural classifier, and the
//! protocol renderers used to deliver them.
//!
//! This crate is the boundary between loosely-typed upstream event
//! records and the rest of the engine: everything past
//! [`classify::normalize`] works with one closed set of typed
//! variants.

pub mod classify;
pub mod event;
pub mod format;
pub mod wire;

pub use classify::{classify, normalize, EventKind};
pub use event::{
    Citation, Content, Document, ErrorDetail, EventMeta, EventPayload, Metadata, Reasoning,
    ResponseEnd, ResponseStart, Status, StreamEvent, ToolCall, ToolReturn,
};
pub use wire::{deserialize_event, serialize_event, WireError};
