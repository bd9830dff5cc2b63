//! Response-scoped orchestration around the aggregator: registry
//! entries, per-response timeouts, fan-out, interrupts and cleanup.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use stream_events::{normalize, serialize_event, StreamEvent};

use crate::broker::{response_channel, EventBroker, EventSubscription};
use crate::message::Message;
use crate::processor::EventProcessor;

#[derive(Debug, Clone)]
pub struct StreamingConfig {
    /// Backstop against leaked state from abandoned or disconnected
    /// generations. Canceled on normal cleanup.
    pub response_timeout: Duration,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(3600),
        }
    }
}

struct ServiceInner {
    processor: EventProcessor,
    broker: Arc<dyn EventBroker>,
    timeouts: DashMap<String, CancellationToken>,
    config: StreamingConfig,
}

impl ServiceInner {
    async fn cleanup_response(&self, response_id: &str) {
        if let Some((_, token)) = self.timeouts.remove(response_id) {
            token.cancel();
        }
        self.processor.cleanup(response_id);
        self.broker.close(&response_channel(response_id)).await;
        log::debug!("[{}] Cleaned up response resources", response_id);
    }
}

/// Lifecycle manager for in-flight responses.
///
/// Clones share state; every protocol entry point is expected to call
/// [`StreamingService::cleanup_response`] from its deferred/teardown
/// path regardless of success or failure.
#[derive(Clone)]
pub struct StreamingService {
    inner: Arc<ServiceInner>,
}

impl StreamingService {
    pub fn new(broker: Arc<dyn EventBroker>) -> Self {
        Self::with_config(broker, StreamingConfig::default())
    }

    pub fn with_config(broker: Arc<dyn EventBroker>, config: StreamingConfig) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                processor: EventProcessor::new(),
                broker,
                timeouts: DashMap::new(),
                config,
            }),
        }
    }

    /// Register a new response and arm its timeout. Allocates an id
    /// when the caller does not supply one.
    pub async fn init_response(
        &self,
        chat_id: &str,
        parent_id: Option<String>,
        model_id: &str,
        response_id: Option<String>,
    ) -> String {
        let response_id = response_id.unwrap_or_else(|| Uuid::new_v4().to_string());

        self.inner
            .processor
            .ensure_response(&response_id, chat_id, parent_id, model_id)
            .await;
        self.arm_timeout(&response_id);

        log::info!("[{}] Initialized response for chat {}", response_id, chat_id);
        response_id
    }

    fn arm_timeout(&self, response_id: &str) {
        // Exactly one timeout task per response.
        if let Some((_, previous)) = self.inner.timeouts.remove(response_id) {
            previous.cancel();
        }

        let token = CancellationToken::new();
        let inner = Arc::clone(&self.inner);
        let id = response_id.to_string();
        let timeout = self.inner.config.response_timeout;
        let task_token = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = task_token.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    log::warn!("[{}] Response timed out, reclaiming state", id);
                    inner.cleanup_response(&id).await;
                }
            }
        });
        self.inner.timeouts.insert(response_id.to_string(), token);
    }

    /// Aggregate one event, then fan it out when emit-eligible.
    ///
    /// State mutation happens under the response's lock; publishing
    /// happens afterwards and is best-effort, so a degraded broker can
    /// never corrupt or fail aggregation.
    pub async fn process_event(&self, event: StreamEvent) {
        self.inner.processor.process(&event).await;

        if !event.meta.emit {
            log::debug!(
                "[{}] Skipping fan-out for emit=false event [type={}]",
                event.response_id(),
                event.type_name()
            );
            return;
        }

        let channel = response_channel(event.response_id());
        match serialize_event(&event) {
            Ok(payload) => {
                if let Err(error) = self.inner.broker.publish(&channel, payload).await {
                    log::error!(
                        "[{}] Failed to publish event [type={}]: {}",
                        event.response_id(),
                        event.type_name(),
                        error
                    );
                }
            }
            Err(error) => {
                log::error!(
                    "[{}] Failed to serialize event for fan-out: {}",
                    event.response_id(),
                    error
                );
            }
        }
    }

    /// Entry point for loosely-typed upstream records: classify,
    /// normalize, process. Unrecognized shapes are logged and dropped.
    pub async fn process_raw(&self, raw: &Value) {
        match normalize(raw) {
            Some(event) => self.process_event(event).await,
            None => log::warn!("Dropped unclassifiable event record"),
        }
    }

    /// User-cancel path: finishes the response with synthetic events
    /// routed through the same serialized processing path as the
    /// generation task, so the interrupt can never corrupt part order.
    pub async fn interrupt(&self, response_id: &str) {
        log::info!("[{}] Interrupt requested", response_id);
        self.process_event(
            StreamEvent::status(
                response_id,
                "interrupted",
                Some("Generation interrupted by user".to_string()),
            )
            .with_sequence(998),
        )
        .await;
        self.process_event(
            StreamEvent::response_end(response_id, "interrupted", Map::new()).with_sequence(999),
        )
        .await;
    }

    pub async fn get_message(&self, response_id: &str) -> Option<Message> {
        self.inner.processor.get_message(response_id).await
    }

    /// The non-streaming invoke payload, composed from the final
    /// aggregated message rather than from individual events.
    pub async fn final_response(&self, response_id: &str) -> Option<Value> {
        self.get_message(response_id)
            .await
            .map(|message| message.sync_response())
    }

    /// Attach a consumer to this response's event channel.
    pub async fn subscribe(&self, response_id: &str) -> EventSubscription {
        self.inner
            .broker
            .subscribe(&response_channel(response_id))
            .await
    }

    /// Cancel the timeout and drop all aggregator state. Idempotent;
    /// called from every protocol entry point's teardown.
    pub async fn cleanup_response(&self, response_id: &str) {
        self.inner.cleanup_response(response_id).await;
    }

    /// Cancel every outstanding timeout task at process teardown.
    pub async fn shutdown(&self) {
        for entry in self.inner.timeouts.iter() {
            entry.value().cancel();
        }
        self.inner.timeouts.clear();
        log::info!("Streaming service shut down");
    }

    /// Number of responses currently tracked.
    pub fn active_responses(&self) -> usize {
        self.inner.processor.len()
    }
}
