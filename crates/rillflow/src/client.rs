//! Low-level client seam.
//!
//! The engines drive a narrow, synchronous surface mirroring what a
//! low-level Kafka client library offers: buffered produce, batched poll,
//! commit, metadata queries, and a polled stream of [`ClientEvent`]s
//! (throttle, log, stats, error, rebalance, offset-commit). All calls are
//! blocking and are executed on the IO pool by the engines.
//!
//! The `kafka` cargo feature ships rdkafka-backed implementations; the
//! [`testing`](crate::testing) module ships deterministic mocks.

use std::time::Duration;

use bytes::Bytes;

use crate::config::LogLevel;
use crate::error::Error;
use crate::message::{Headers, Message, Opaque, TopicPartition, TopicPartitionOffset};

/// A serialized record handed to the producer client.
#[derive(Debug, Clone)]
pub struct ProducerRecord {
    /// Destination topic.
    pub topic: String,
    /// Explicit partition, or `None` for client-side selection.
    pub partition: Option<i32>,
    /// Serialized key bytes.
    pub key: Option<Bytes>,
    /// Serialized payload bytes.
    pub payload: Option<Bytes>,
    /// Serialized headers.
    pub headers: Headers,
    /// Application handle echoed in the matching [`DeliveryAck`].
    pub opaque: Opaque,
    /// Engine correlation tag echoed in the matching [`DeliveryAck`].
    pub delivery_tag: u64,
}

/// A completed delivery event from the producer client.
#[derive(Debug, Clone)]
pub struct DeliveryAck {
    /// Partition the record landed on (or was destined for, on failure).
    pub topic_partition: TopicPartition,
    /// Assigned offset, `-1` on failure.
    pub offset: i64,
    /// Delivery error, if any.
    pub error: Option<Error>,
    /// Application handle from the record, bit-identical.
    pub opaque: Opaque,
    /// Engine correlation tag from the record.
    pub delivery_tag: u64,
}

/// A broker-advertised quota pause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThrottleEvent {
    /// Name of the throttling broker.
    pub broker: String,
    /// Id of the throttling broker.
    pub broker_id: i32,
    /// Advertised pause duration.
    pub duration: Duration,
}

/// A normalized notification polled from the client.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// A broker advertised a quota pause.
    Throttle(ThrottleEvent),
    /// The client reported an error outside any call.
    Error(Error),
    /// A client log line.
    Log {
        /// Severity of the line.
        level: LogLevel,
        /// Client-reported facility.
        facility: String,
        /// Log message.
        message: String,
    },
    /// A statistics payload, verbatim JSON.
    Stats(String),
    /// The group coordinator assigned partitions to this consumer.
    PartitionsAssigned(Vec<TopicPartition>),
    /// The group coordinator revoked partitions from this consumer.
    PartitionsRevoked(Vec<TopicPartition>),
    /// A rebalance failed.
    RebalanceError(Error),
    /// An offset commit completed.
    OffsetsCommitted {
        /// Per-partition outcome.
        results: Vec<(TopicPartitionOffset, Option<Error>)>,
        /// Handle from the originating commit call.
        opaque: Opaque,
    },
}

/// Whether a commit call blocks until the broker acknowledges it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitMode {
    /// Block until acknowledged.
    Sync,
    /// Return immediately; completion arrives as
    /// [`ClientEvent::OffsetsCommitted`].
    Async,
}

/// The result of one consumer poll: raw messages plus pending events.
#[derive(Debug, Default)]
pub struct PollOutcome {
    /// Messages in broker delivery order.
    pub messages: Vec<Message>,
    /// Events observed since the previous poll.
    pub events: Vec<ClientEvent>,
}

/// Synchronous surface of a low-level buffered producer.
///
/// One instance is exclusively owned by its [`ProducerEngine`]
/// (`crate::producer::ProducerEngine`); no other thread may call into it.
pub trait ProducerClient: Send + Sync {
    /// Hands a record to the client's outbound buffer.
    ///
    /// # Errors
    ///
    /// Returns the record back with a `QueueFull` error when the client
    /// buffer is saturated, or a permanent error for unknown topics.
    fn enqueue(&self, record: ProducerRecord) -> Result<(), (Error, ProducerRecord)>;

    /// Collects completed delivery events, waiting up to `timeout`.
    fn poll_acks(&self, timeout: Duration) -> Vec<DeliveryAck>;

    /// Pushes out buffered records, waiting up to `timeout`.
    ///
    /// # Errors
    ///
    /// Returns a `Timeout` or transport error when the flush fails.
    fn flush(&self, timeout: Duration) -> Result<(), Error>;

    /// Returns the client's outbound queue length.
    fn queue_len(&self) -> usize;

    /// Drains events observed since the previous call.
    fn take_events(&self) -> Vec<ClientEvent>;

    /// Returns the number of partitions of `topic`.
    ///
    /// # Errors
    ///
    /// Returns a transport or broker error when metadata cannot be fetched.
    fn partition_count(&self, topic: &str) -> Result<i32, Error>;

    /// Returns `(low, high)` watermarks for a partition.
    ///
    /// # Errors
    ///
    /// Returns a transport or broker error when the query fails.
    fn watermarks(&self, tp: &TopicPartition) -> Result<(i64, i64), Error>;
}

/// Synchronous surface of a low-level consumer.
///
/// One instance is exclusively owned by its [`ConsumerEngine`]
/// (`crate::consumer::ConsumerEngine`); no other thread may call into it.
pub trait ConsumerClient: Send + Sync {
    /// Subscribes to the given topics with group-managed assignment.
    ///
    /// # Errors
    ///
    /// Returns a transport or configuration error.
    fn subscribe(&self, topics: &[String]) -> Result<(), Error>;

    /// Installs an explicit partition/offset assignment.
    ///
    /// # Errors
    ///
    /// Returns a transport or configuration error.
    fn assign(&self, partitions: &[TopicPartitionOffset]) -> Result<(), Error>;

    /// Drops the current subscription or assignment.
    fn unsubscribe(&self);

    /// Fetches up to `max_messages` raw messages, waiting up to `timeout`,
    /// and drains pending events.
    ///
    /// # Errors
    ///
    /// Returns a transport error; per-message broker errors arrive as the
    /// message's error marker instead.
    fn poll(&self, max_messages: usize, timeout: Duration) -> Result<PollOutcome, Error>;

    /// Pauses fetching for the given partitions.
    ///
    /// # Errors
    ///
    /// Returns a transport error.
    fn pause(&self, partitions: &[TopicPartition]) -> Result<(), Error>;

    /// Resumes fetching for the given partitions.
    ///
    /// # Errors
    ///
    /// Returns a transport error.
    fn resume(&self, partitions: &[TopicPartition]) -> Result<(), Error>;

    /// Commits offsets to the broker.
    ///
    /// `opaque` is echoed in the resulting
    /// [`ClientEvent::OffsetsCommitted`].
    ///
    /// # Errors
    ///
    /// Returns a broker or transport error for synchronous commits that
    /// fail at submission.
    fn commit(
        &self,
        offsets: &[TopicPartitionOffset],
        mode: CommitMode,
        opaque: Opaque,
    ) -> Result<(), Error>;

    /// Writes offsets to the client's local store for its auto-commit
    /// thread to persist.
    ///
    /// # Errors
    ///
    /// Returns an error when a partition is not assigned.
    fn store_offsets(&self, offsets: &[TopicPartitionOffset]) -> Result<(), Error>;

    /// Returns the currently assigned partitions.
    fn assignment(&self) -> Vec<TopicPartition>;

    /// Returns the number of partitions of `topic`.
    ///
    /// # Errors
    ///
    /// Returns a transport or broker error when metadata cannot be fetched.
    fn partition_count(&self, topic: &str) -> Result<i32, Error>;

    /// Returns `(low, high)` watermarks for a partition.
    ///
    /// # Errors
    ///
    /// Returns a transport or broker error when the query fails.
    fn watermarks(&self, tp: &TopicPartition) -> Result<(i64, i64), Error>;

    /// Returns, per partition, the earliest offset whose timestamp is at
    /// or after `timestamp_ms`.
    ///
    /// # Errors
    ///
    /// Returns a transport or broker error when the query fails.
    fn offsets_for_timestamp(
        &self,
        topic: &str,
        timestamp_ms: i64,
    ) -> Result<Vec<TopicPartitionOffset>, Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_outcome_default_empty() {
        let outcome = PollOutcome::default();
        assert!(outcome.messages.is_empty());
        assert!(outcome.events.is_empty());
    }

    #[test]
    fn test_throttle_event_equality() {
        let a = ThrottleEvent {
            broker: "broker-1".into(),
            broker_id: 1,
            duration: Duration::from_millis(500),
        };
        assert_eq!(a, a.clone());
    }
}
