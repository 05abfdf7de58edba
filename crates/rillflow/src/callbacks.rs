//! User callback capability bundles.
//!
//! Every callback is a single-method capability represented as a function
//! value, grouped per topic into [`ProducerCallbacks`] or
//! [`ConsumerCallbacks`]. Callbacks must be `Send + Sync`; the engine
//! serializes invocations within one topic but not across topics.

use std::sync::Arc;

use crate::client::ThrottleEvent;
use crate::config::LogLevel;
use crate::error::Error;
use crate::message::{DeliveryReport, DeserializedMessage, Message, Opaque, TopicPartition,
    TopicPartitionOffset};

/// Invoked once per produced record with its delivery outcome.
pub type DeliveryReportCallback = Arc<dyn Fn(&DeliveryReport) + Send + Sync>;

/// Maps serialized key bytes and a partition count to a partition.
pub type PartitionerCallback = Arc<dyn Fn(&[u8], i32) -> i32 + Send + Sync>;

/// Invoked when the bounded send queue rejects or delays a record.
pub type QueueFullCallback = Arc<dyn Fn(&QueueFullEvent) + Send + Sync>;

/// Invoked for errors with no owning future or callback.
pub type ErrorCallback = Arc<dyn Fn(&Error) + Send + Sync>;

/// Invoked for client log lines that pass the topic's level clamp.
pub type LogCallback = Arc<dyn Fn(LogLevel, &str, &str) + Send + Sync>;

/// Invoked with the client's statistics JSON, verbatim.
pub type StatsCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Invoked when a broker advertises a quota pause.
pub type ThrottleCallback = Arc<dyn Fn(&ThrottleEvent) + Send + Sync>;

/// Invoked with the per-partition outcome of an offset commit.
pub type OffsetCommitCallback = Arc<dyn Fn(&CommitReport) + Send + Sync>;

/// Decides whether a failed commit is retried (`true`) or committing is
/// suspended until the next assignment (`false`).
pub type OffsetCommitErrorCallback = Arc<dyn Fn(&Error) -> bool + Send + Sync>;

/// Sees each raw message before deserialization; returns keep or drop.
pub type PreprocessorCallback = Arc<dyn Fn(&Message) -> PreprocessorAction + Send + Sync>;

/// Invoked after a partition assignment is installed.
pub type AssignmentCallback = Arc<dyn Fn(&[TopicPartition]) + Send + Sync>;

/// Invoked after revoked partitions have drained and committed.
pub type RevocationCallback = Arc<dyn Fn(&[TopicPartition]) + Send + Sync>;

/// Invoked when the client reports a rebalance failure.
pub type RebalanceErrorCallback = Arc<dyn Fn(&Error) + Send + Sync>;

/// Delivers one deserialized message.
pub type ReceiverCallback<K, V> = Arc<dyn Fn(DeserializedMessage<K, V>) + Send + Sync>;

/// Delivers a batch of deserialized messages from one dispatch queue.
pub type BatchReceiverCallback<K, V> =
    Arc<dyn Fn(Vec<DeserializedMessage<K, V>>) + Send + Sync>;

/// Verdict of a [`PreprocessorCallback`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreprocessorAction {
    /// Deserialize and deliver the message.
    Keep,
    /// Skip the message; its offset is still counted for commit.
    Drop,
}

/// Details of a queue-full notification.
#[derive(Debug, Clone)]
pub struct QueueFullEvent {
    /// Topic whose send queue is full.
    pub topic: String,
    /// Queue length at notification time.
    pub queue_length: usize,
    /// Queue capacity (`max.queue.length`).
    pub capacity: usize,
    /// `false` on the way into back-pressure, `true` on the recovery edge.
    pub recovered: bool,
}

/// Per-partition outcome of an offset commit.
#[derive(Debug, Clone)]
pub struct CommitReport {
    /// Committed offsets with their individual outcomes.
    pub results: Vec<(TopicPartitionOffset, Option<Error>)>,
    /// Opaque handle from the `commit` call, bit-identical.
    pub opaque: Opaque,
}

impl CommitReport {
    /// Returns the first error in the breakdown, if any partition failed.
    #[must_use]
    pub fn first_error(&self) -> Option<&Error> {
        self.results.iter().find_map(|(_, e)| e.as_ref())
    }

    /// Returns `true` if every partition committed successfully.
    #[must_use]
    pub fn success(&self) -> bool {
        self.first_error().is_none()
    }
}

/// Producer-side callback bundle for one topic.
#[derive(Clone, Default)]
pub struct ProducerCallbacks {
    /// Delivery outcome per record.
    pub delivery_report: Option<DeliveryReportCallback>,
    /// Custom partition selection from serialized key bytes.
    pub partitioner: Option<PartitionerCallback>,
    /// Back-pressure notification.
    pub queue_full: Option<QueueFullCallback>,
    /// Unowned errors.
    pub error: Option<ErrorCallback>,
    /// Clamped client log lines.
    pub log: Option<LogCallback>,
    /// Statistics JSON.
    pub stats: Option<StatsCallback>,
    /// Broker quota pauses.
    pub throttle: Option<ThrottleCallback>,
}

impl std::fmt::Debug for ProducerCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProducerCallbacks")
            .field("delivery_report", &self.delivery_report.is_some())
            .field("partitioner", &self.partitioner.is_some())
            .field("queue_full", &self.queue_full.is_some())
            .field("error", &self.error.is_some())
            .field("log", &self.log.is_some())
            .field("stats", &self.stats.is_some())
            .field("throttle", &self.throttle.is_some())
            .finish()
    }
}

/// Consumer-side callback bundle for one topic.
pub struct ConsumerCallbacks<K, V> {
    /// Single-message receiver. Mutually exclusive with `batch_receiver`.
    pub receiver: Option<ReceiverCallback<K, V>>,
    /// Batch receiver. Mutually exclusive with `receiver`.
    pub batch_receiver: Option<BatchReceiverCallback<K, V>>,
    /// Raw-message filter before deserialization.
    pub preprocessor: Option<PreprocessorCallback>,
    /// Offset commit outcomes.
    pub offset_commit: Option<OffsetCommitCallback>,
    /// Failed-commit policy.
    pub offset_commit_error: Option<OffsetCommitErrorCallback>,
    /// Partition assignment notification.
    pub assignment: Option<AssignmentCallback>,
    /// Partition revocation notification.
    pub revocation: Option<RevocationCallback>,
    /// Rebalance failures.
    pub rebalance_error: Option<RebalanceErrorCallback>,
    /// Unowned errors.
    pub error: Option<ErrorCallback>,
    /// Clamped client log lines.
    pub log: Option<LogCallback>,
    /// Statistics JSON.
    pub stats: Option<StatsCallback>,
    /// Broker quota pauses.
    pub throttle: Option<ThrottleCallback>,
}

impl<K, V> Clone for ConsumerCallbacks<K, V> {
    fn clone(&self) -> Self {
        Self {
            receiver: self.receiver.clone(),
            batch_receiver: self.batch_receiver.clone(),
            preprocessor: self.preprocessor.clone(),
            offset_commit: self.offset_commit.clone(),
            offset_commit_error: self.offset_commit_error.clone(),
            assignment: self.assignment.clone(),
            revocation: self.revocation.clone(),
            rebalance_error: self.rebalance_error.clone(),
            error: self.error.clone(),
            log: self.log.clone(),
            stats: self.stats.clone(),
            throttle: self.throttle.clone(),
        }
    }
}

impl<K, V> Default for ConsumerCallbacks<K, V> {
    fn default() -> Self {
        Self {
            receiver: None,
            batch_receiver: None,
            preprocessor: None,
            offset_commit: None,
            offset_commit_error: None,
            assignment: None,
            revocation: None,
            rebalance_error: None,
            error: None,
            log: None,
            stats: None,
            throttle: None,
        }
    }
}

impl<K, V> std::fmt::Debug for ConsumerCallbacks<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerCallbacks")
            .field("receiver", &self.receiver.is_some())
            .field("batch_receiver", &self.batch_receiver.is_some())
            .field("preprocessor", &self.preprocessor.is_some())
            .field("offset_commit", &self.offset_commit.is_some())
            .field("assignment", &self.assignment.is_some())
            .field("revocation", &self.revocation.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_report_breakdown() {
        let ok = TopicPartitionOffset::new("events", 0, 10);
        let bad = TopicPartitionOffset::new("events", 1, 20);
        let report = CommitReport {
            results: vec![
                (ok, None),
                (bad, Some(Error::broker(27, "REBALANCE_IN_PROGRESS"))),
            ],
            opaque: Opaque::new(3),
        };
        assert!(!report.success());
        assert_eq!(report.first_error().unwrap().code(), 27);
        assert_eq!(report.opaque, Opaque::new(3));
    }

    #[test]
    fn test_default_bundles_empty() {
        let p = ProducerCallbacks::default();
        assert!(p.delivery_report.is_none());
        assert!(format!("{p:?}").contains("delivery_report: false"));

        let c: ConsumerCallbacks<String, String> = ConsumerCallbacks::default();
        assert!(c.receiver.is_none());
        assert!(c.batch_receiver.is_none());
    }
}
