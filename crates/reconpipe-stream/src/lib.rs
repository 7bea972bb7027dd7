pub mod memory;
pub mod redis_bus;

use async_trait::async_trait;
use reconpipe_common::StreamMessage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("stream backend error: {0}")]
    Backend(String),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// A single delivered message, with the broker id needed to ack it.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub id: String,
    pub message: StreamMessage,
}

/// Uniform access to an append-only log with consumer-group semantics
/// (spec.md §4.2). Delivery is at-least-once; implementations never
/// hide redelivery from the caller.
#[async_trait]
pub trait StreamBus: Send + Sync {
    /// Create `topic` and `group` starting at the origin if absent.
    /// "Group already exists" is a benign outcome, not an error.
    async fn ensure_group(&self, topic: &str, group: &str) -> Result<(), StreamError>;

    /// Read up to `count` undelivered records for `consumer` in
    /// `group`, blocking up to `block_ms` when none are available.
    /// An empty result after the block elapses is not an error.
    async fn read(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<Delivery>, StreamError>;

    /// Acknowledge a message. Un-acked messages may be redelivered on
    /// reconnect.
    async fn ack(&self, topic: &str, group: &str, id: &str) -> Result<(), StreamError>;

    /// Append a message, with an optional soft cap that approximately
    /// trims older entries.
    async fn append(
        &self,
        topic: &str,
        message: &StreamMessage,
        maxlen: Option<usize>,
        approx: bool,
    ) -> Result<String, StreamError>;
}
