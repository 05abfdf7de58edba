//! Read-only metadata facades.
//!
//! Point-in-time views of a topic's partition list, offset watermarks,
//! queue lengths, and engine metrics. Watermark and partition queries go
//! to the low-level client on demand; nothing here invalidates or
//! refreshes.

use std::sync::Arc;

use crate::client::{ConsumerClient, ProducerClient};
use crate::consumer::entry::ConsumerState;
use crate::error::Error;
use crate::message::{TopicPartition, TopicPartitionOffset};
use crate::metrics::{ConsumerMetricsSnapshot, ProducerMetricsSnapshot};

/// Read-only view of one producer topic.
pub struct ProducerMetadata {
    topic: String,
    client: Arc<dyn ProducerClient>,
    buffer_len: usize,
    metrics: ProducerMetricsSnapshot,
}

impl ProducerMetadata {
    pub(crate) fn new(
        topic: String,
        client: Arc<dyn ProducerClient>,
        buffer_len: usize,
        metrics: ProducerMetricsSnapshot,
    ) -> Self {
        Self {
            topic,
            client,
            buffer_len,
            metrics,
        }
    }

    /// Returns the topic name.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Returns the engine's internal send-buffer length at snapshot time.
    #[must_use]
    pub fn buffer_len(&self) -> usize {
        self.buffer_len
    }

    /// Returns the client's outbound queue length.
    #[must_use]
    pub fn outbound_queue_len(&self) -> usize {
        self.client.queue_len()
    }

    /// Returns engine metrics at snapshot time.
    #[must_use]
    pub fn metrics(&self) -> ProducerMetricsSnapshot {
        self.metrics
    }

    /// Queries the topic's partition list.
    ///
    /// # Errors
    ///
    /// Returns a transport or broker error when metadata is unavailable.
    pub fn partitions(&self) -> Result<Vec<TopicPartition>, Error> {
        let count = self.client.partition_count(&self.topic)?;
        Ok((0..count)
            .map(|p| TopicPartition::new(self.topic.clone(), p))
            .collect())
    }

    /// Queries `(low, high)` watermarks for one partition.
    ///
    /// # Errors
    ///
    /// Returns a transport or broker error when the query fails.
    pub fn watermarks(&self, partition: i32) -> Result<(i64, i64), Error> {
        self.client
            .watermarks(&TopicPartition::new(self.topic.clone(), partition))
    }
}

impl std::fmt::Debug for ProducerMetadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProducerMetadata")
            .field("topic", &self.topic)
            .field("buffer_len", &self.buffer_len)
            .finish_non_exhaustive()
    }
}

/// Read-only view of one consumer topic.
pub struct ConsumerMetadata {
    topic: String,
    client: Arc<dyn ConsumerClient>,
    assignment: Vec<TopicPartition>,
    state: ConsumerState,
    metrics: ConsumerMetricsSnapshot,
}

impl ConsumerMetadata {
    pub(crate) fn new(
        topic: String,
        client: Arc<dyn ConsumerClient>,
        assignment: Vec<TopicPartition>,
        state: ConsumerState,
        metrics: ConsumerMetricsSnapshot,
    ) -> Self {
        Self {
            topic,
            client,
            assignment,
            state,
            metrics,
        }
    }

    /// Returns the topic name.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Returns the partitions assigned at snapshot time.
    #[must_use]
    pub fn assignment(&self) -> &[TopicPartition] {
        &self.assignment
    }

    /// Returns the entry state at snapshot time.
    #[must_use]
    pub fn state(&self) -> ConsumerState {
        self.state
    }

    /// Returns engine metrics at snapshot time.
    #[must_use]
    pub fn metrics(&self) -> ConsumerMetricsSnapshot {
        self.metrics
    }

    /// Queries the topic's partition list.
    ///
    /// # Errors
    ///
    /// Returns a transport or broker error when metadata is unavailable.
    pub fn partitions(&self) -> Result<Vec<TopicPartition>, Error> {
        let count = self.client.partition_count(&self.topic)?;
        Ok((0..count)
            .map(|p| TopicPartition::new(self.topic.clone(), p))
            .collect())
    }

    /// Queries `(low, high)` watermarks for one partition.
    ///
    /// # Errors
    ///
    /// Returns a transport or broker error when the query fails.
    pub fn watermarks(&self, partition: i32) -> Result<(i64, i64), Error> {
        self.client
            .watermarks(&TopicPartition::new(self.topic.clone(), partition))
    }

    /// Queries, per partition, the earliest offset at or after the given
    /// timestamp.
    ///
    /// # Errors
    ///
    /// Returns a transport or broker error when the query fails.
    pub fn offsets_for_timestamp(
        &self,
        timestamp_ms: i64,
    ) -> Result<Vec<TopicPartitionOffset>, Error> {
        self.client.offsets_for_timestamp(&self.topic, timestamp_ms)
    }
}

impl std::fmt::Debug for ConsumerMetadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerMetadata")
            .field("topic", &self.topic)
            .field("assignment", &self.assignment.len())
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}
