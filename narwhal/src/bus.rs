use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::trace;

use crate::run::RunId;

/// Maximum serialized size of a single result envelope. Workers split
/// chunks that would exceed this before publishing.
pub const MAX_ENVELOPE_BYTES: usize = 1024 * 1024;

/// Name of the result channel for a run.
pub fn result_channel(id: RunId) -> String {
    format!("run_results:{id}")
}

/// Name of the log channel for a run.
pub fn log_channel(id: RunId) -> String {
    format!("run_logs:{id}")
}

/// Coarse channel family, used as a metrics label.
pub fn channel_kind(channel: &str) -> &'static str {
    if channel.starts_with("run_logs:") {
        "logs"
    } else {
        "results"
    }
}

/// Structured event carried on `run_results:{id}` channels.
///
/// Wire shape: `{"kind":"chunk","payload":...}` for output chunks and
/// exactly one closing `{"kind":"end"}` or `{"kind":"end","error":"..."}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ResultEnvelope {
    /// One output chunk from the runnable.
    Chunk {
        /// Opaque JSON payload.
        payload: Value,
    },
    /// Terminal sentinel; closes every result stream for the run.
    End {
        /// Failure reason when the run did not complete successfully.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl ResultEnvelope {
    /// Build a chunk envelope.
    pub fn chunk(payload: Value) -> Self {
        ResultEnvelope::Chunk { payload }
    }

    /// Build the successful terminal sentinel.
    pub fn end() -> Self {
        ResultEnvelope::End { error: None }
    }

    /// Build the failing terminal sentinel.
    pub fn end_error(error: impl Into<String>) -> Self {
        ResultEnvelope::End {
            error: Some(error.into()),
        }
    }

    /// Whether this envelope is the terminal sentinel.
    pub fn is_end(&self) -> bool {
        matches!(self, ResultEnvelope::End { .. })
    }

    /// Serialize to the canonical JSON wire bytes.
    pub fn to_bytes(&self) -> Bytes {
        // Envelope serialization cannot fail: payload is already a Value.
        Bytes::from(serde_json::to_vec(self).expect("envelope serialization"))
    }

    /// Parse from wire bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Errors surfaced by message bus backends.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// The bus is unreachable; retryable at the caller's discretion.
    #[error("message bus unavailable: {0}")]
    Unavailable(#[source] anyhow::Error),
}

/// One message delivered to a subscriber.
#[derive(Clone, Debug)]
pub struct BusMessage {
    /// Raw payload bytes as published.
    pub payload: Bytes,
}

/// Per-subscriber handle to a channel.
///
/// Releasing a subscription disconnects only that subscriber. Every
/// subscription is released on drop, so holding it in the connection
/// handler guarantees release on all exit paths including panics.
#[async_trait]
pub trait Subscription: Send {
    /// Await the next message.
    ///
    /// Returns `None` once the subscription is released or the channel is
    /// closed. A subscriber that falls behind the bounded buffer loses the
    /// oldest messages; the loss is counted, not surfaced as an error.
    async fn recv(&mut self) -> Option<BusMessage>;

    /// Number of messages dropped for this subscriber due to overflow.
    fn dropped(&self) -> u64;

    /// Release bus-side resources. Idempotent; also invoked on drop.
    fn release(&mut self);
}

/// Topic-based publish/subscribe fabric keyed by run identifier.
///
/// Delivery is best-effort and at-most-once per subscriber, FIFO per
/// `(channel, subscriber)`. Fan-out across subscribers is independent: one
/// slow subscriber never stalls another. Channels hold no history; late
/// subscribers see only messages published after subscription.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Fire-and-forget delivery to currently-subscribed subscribers.
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), BusError>;

    /// Subscribe to a channel.
    async fn subscribe(&self, channel: &str) -> Result<Box<dyn Subscription>, BusError>;
}

type ChannelMap = Arc<Mutex<HashMap<String, broadcast::Sender<Bytes>>>>;

/// In-process message bus over per-channel tokio broadcast senders.
///
/// Each subscriber owns an independent bounded buffer of `capacity`
/// messages; on overflow the oldest messages for that subscriber are
/// dropped and counted. For cross-process deployments, implement
/// [`MessageBus`] over an external broker and swap it in at wiring time.
pub struct InProcMessageBus {
    capacity: usize,
    channels: ChannelMap,
}

impl std::fmt::Debug for InProcMessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcMessageBus")
            .field("capacity", &self.capacity)
            .field("channels", &self.channels.lock().len())
            .finish()
    }
}

impl InProcMessageBus {
    /// Create a bus with the given per-subscriber buffer capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            channels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of live channels (channels with at least one subscriber).
    pub fn channel_count(&self) -> usize {
        self.channels.lock().len()
    }
}

#[async_trait]
impl MessageBus for InProcMessageBus {
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), BusError> {
        let sender = self.channels.lock().get(channel).cloned();
        match sender {
            Some(tx) => {
                // Err means zero receivers raced away since the lookup.
                let _ = tx.send(payload);
            }
            None => {
                trace!(channel, "publish with no subscribers; message dropped");
            }
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Box<dyn Subscription>, BusError> {
        let mut channels = self.channels.lock();
        let tx = channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0);
        let rx = tx.subscribe();
        Ok(Box::new(InProcSubscription {
            channel: channel.to_string(),
            rx: Some(rx),
            dropped: 0,
            channels: Arc::clone(&self.channels),
        }))
    }
}

struct InProcSubscription {
    channel: String,
    rx: Option<broadcast::Receiver<Bytes>>,
    dropped: u64,
    channels: ChannelMap,
}

#[async_trait]
impl Subscription for InProcSubscription {
    async fn recv(&mut self) -> Option<BusMessage> {
        let rx = self.rx.as_mut()?;
        loop {
            match rx.recv().await {
                Ok(payload) => return Some(BusMessage { payload }),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    self.dropped += skipped;
                    crate::telemetry::record_bus_dropped(
                        channel_kind(&self.channel),
                        skipped,
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    fn dropped(&self) -> u64 {
        self.dropped
    }

    fn release(&mut self) {
        if self.rx.take().is_none() {
            return;
        }
        let mut channels = self.channels.lock();
        if let Some(tx) = channels.get(&self.channel) {
            if tx.receiver_count() == 0 {
                channels.remove(&self.channel);
            }
        }
    }
}

impl Drop for InProcSubscription {
    fn drop(&mut self) {
        self.release();
    }
}
