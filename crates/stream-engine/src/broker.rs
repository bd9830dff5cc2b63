//! Best-effort fan-out of emit-eligible events.
//!
//! Every emit-eligible event is published on a channel keyed
//! `response:{response_id}`; any number of subscribers may attach for
//! the life of the response. A slow or unavailable broker degrades
//! fan-out only — it never blocks or fails local aggregation.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::Stream;
use thiserror::Error;
use tokio::sync::broadcast;

use stream_events::{deserialize_event, StreamEvent, WireError};

pub fn response_channel(response_id: &str) -> String {
    format!("response:{response_id}")
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker channel unavailable: {0}")]
    Unavailable(String),
}

/// Publish/subscribe seam. The in-memory implementation below covers a
/// single process; an out-of-process broker plugs in behind the same
/// trait and carries the identical wire JSON.
#[async_trait]
pub trait EventBroker: Send + Sync {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), BrokerError>;

    async fn subscribe(&self, channel: &str) -> EventSubscription;

    /// Tear down a channel once its response is cleaned up.
    async fn close(&self, channel: &str);
}

/// What a subscriber poll observed.
#[derive(Debug)]
pub enum SubscriptionPoll {
    Event(StreamEvent),
    /// Nothing arrived within the poll window; the caller should check
    /// whether the producer task is still alive and poll again.
    Idle,
    /// The channel is gone; no further events will arrive.
    Closed,
}

/// A live attachment to one response channel.
pub struct EventSubscription {
    receiver: broadcast::Receiver<String>,
}

impl EventSubscription {
    /// Wait for the next event. Returns `None` once the channel closes.
    /// Corrupt wire payloads fail loudly; lagged gaps are logged and
    /// skipped.
    pub async fn next_event(&mut self) -> Result<Option<StreamEvent>, WireError> {
        loop {
            match self.receiver.recv().await {
                Ok(payload) => return deserialize_event(&payload).map(Some),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    log::warn!("Subscriber lagged, {missed} events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(None),
            }
        }
    }

    /// Poll with a short timeout so consumer loops can interleave
    /// liveness checks on the producer task.
    pub async fn poll(&mut self, timeout: Duration) -> Result<SubscriptionPoll, WireError> {
        match tokio::time::timeout(timeout, self.next_event()).await {
            Ok(Ok(Some(event))) => Ok(SubscriptionPoll::Event(event)),
            Ok(Ok(None)) => Ok(SubscriptionPoll::Closed),
            Ok(Err(err)) => Err(err),
            Err(_) => Ok(SubscriptionPoll::Idle),
        }
    }

    /// Adapt the subscription into a stream, ending when the channel
    /// closes. Useful for SSE/WebSocket sender loops built on stream
    /// combinators.
    pub fn into_stream(self) -> impl Stream<Item = Result<StreamEvent, WireError>> {
        futures::stream::unfold(self, |mut sub| async move {
            match sub.next_event().await {
                Ok(Some(event)) => Some((Ok(event), sub)),
                Ok(None) => None,
                Err(err) => Some((Err(err), sub)),
            }
        })
    }
}

/// In-process broker backed by one broadcast channel per response.
pub struct InMemoryBroker {
    channels: DashMap<String, broadcast::Sender<String>>,
    capacity: usize,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity,
        }
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .get(channel)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBroker for InMemoryBroker {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), BrokerError> {
        if let Some(sender) = self.channels.get(channel) {
            // A send error only means nobody is listening right now.
            let delivered = sender.send(payload).unwrap_or(0);
            log::debug!("Published to {channel} ({delivered} subscribers)");
        } else {
            log::debug!("No subscribers on {channel}, event not fanned out");
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> EventSubscription {
        let receiver = self
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();
        log::debug!(
            "New subscriber on {channel} ({} total)",
            self.subscriber_count(channel)
        );
        EventSubscription { receiver }
    }

    async fn close(&self, channel: &str) {
        if self.channels.remove(channel).is_some() {
            log::debug!("Closed channel {channel}");
        }
    }
}
