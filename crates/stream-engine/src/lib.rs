//! Aggregation and lifecycle management for streamed response events.
//!
//! [`EventProcessor`] folds a response's event stream into a
//! [`Message`]; [`StreamingService`] wraps it with response
//! registration, timeouts, interrupts and broker fan-out.

pub mod block;
pub mod broker;
pub mod message;
pub mod processor;
pub mod service;

pub use block::{BlockKind, ContentBlockContext};
pub use broker::{
    response_channel, BrokerError, EventBroker, EventSubscription, InMemoryBroker,
    SubscriptionPoll,
};
pub use message::{
    CitationPart, DocumentPart, Message, MessagePart, MessageStatus, ReasoningPart, TextPart,
    ToolCallPart, ToolReturnPart,
};
pub use processor::EventProcessor;
pub use service::{StreamingConfig, StreamingService};
