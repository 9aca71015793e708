//! Event Buffer: durable, bounded, append-only log with consumer groups.
//!
//! §4.1. Generalizes the teacher's single-aggregate `EventStore` to named,
//! multi-stream, multi-consumer-group semantics backed by NATS JetStream.

pub mod nats;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::PipelineResult;
use crate::events::Event;
use crate::subjects::StreamName;

pub use self::nats::NatsEventBuffer;

/// Opaque handle to a buffered message, stable across consume/ack/claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An entry delivered by [`EventBuffer::consume`] or [`EventBuffer::claim_pending`].
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message_id: MessageId,
    pub event: Event,
    /// How many times this entry has been delivered, including this one.
    pub delivery_count: u64,
}

/// Per-stream counters surfaced to the scheduler's backpressure policy (§5).
#[derive(Debug, Default)]
pub struct BufferMetrics {
    /// Entries the publisher refused or discarded due to `maxlen`.
    pub dropped: AtomicU64,
    /// `stream.length - group.last_delivered_position`, per consumer group.
    pub lag: AtomicU64,
}

impl BufferMetrics {
    pub fn record_drop(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_lag(&self, lag: u64) {
        self.lag.store(lag, Ordering::Relaxed);
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn lag(&self) -> u64 {
        self.lag.load(Ordering::Relaxed)
    }
}

/// The durable, consumer-group-partitioned log described in §4.1.
#[async_trait]
pub trait EventBuffer: Send + Sync {
    /// Appends atomically; trims the oldest entries past `maxlen`
    /// (approximate trimming is acceptable) per the stream's backpressure
    /// policy. Returns `Err(PipelineError::Backpressure(_))` under
    /// `reject_new` once the stream is full.
    async fn publish(&self, stream: StreamName, event: Event) -> PipelineResult<MessageId>;

    /// All-or-nothing batch append; no partial failure is surfaced with a
    /// partial write.
    async fn publish_batch(
        &self,
        stream: StreamName,
        events: Vec<Event>,
    ) -> PipelineResult<Vec<MessageId>>;

    /// Blocks up to `block_ms` for new entries assigned to `consumer_name`
    /// within `group`. The read cursor is group-scoped and persists across
    /// restarts.
    async fn consume(
        &self,
        stream: StreamName,
        group: &str,
        consumer_name: &str,
        max_count: usize,
        block_ms: u64,
    ) -> PipelineResult<Vec<Delivery>>;

    /// Removes the given entries from the group's pending set.
    async fn ack(&self, stream: StreamName, group: &str, message_ids: &[MessageId]) -> PipelineResult<()>;

    /// Re-delivers entries idle for at least `min_idle_ms` to `consumer_name`
    /// (crash recovery). JetStream has no per-consumer-name pending-entries
    /// list the way Redis Streams does (see DESIGN.md); this is realized as
    /// a bounded re-fetch from the same durable consumer, which JetStream
    /// auto-redelivers once `ack_wait` has elapsed without an ack.
    async fn claim_pending(
        &self,
        stream: StreamName,
        group: &str,
        consumer_name: &str,
        min_idle_ms: u64,
        max_count: usize,
    ) -> PipelineResult<Vec<Delivery>>;

    /// Moves an entry to the `dlq` stream and acks the original; called
    /// when a consumer's per-message retry budget is exhausted.
    async fn dead_letter(
        &self,
        stream: StreamName,
        group: &str,
        message_id: MessageId,
        event: Event,
        error: &str,
    ) -> PipelineResult<()>;

    /// Metrics for a given stream, shared across consumer groups.
    fn metrics(&self, stream: StreamName) -> Arc<BufferMetrics>;
}

/// Payload written onto the `dlq` stream: original event plus the error that
/// killed it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub origin_stream: String,
    pub origin_group: String,
    pub event: Event,
    pub error: String,
}
