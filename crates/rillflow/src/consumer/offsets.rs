//! Per-partition consumption progress.
//!
//! [`OffsetTracker`] records the last offset a receiver completed for
//! each partition. Commits are built from it using the Kafka convention
//! of committing the next offset to fetch (`last + 1`), and it backs the
//! `allow.non.stored.offsets` validation.

use fxhash::FxHashMap;

use crate::message::TopicPartitionOffset;

/// Tracks the last delivered offset per `(topic, partition)`.
#[derive(Debug, Clone, Default)]
pub struct OffsetTracker {
    offsets: FxHashMap<(String, i32), i64>,
}

impl OffsetTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a delivered offset for a partition.
    pub fn update(&mut self, topic: &str, partition: i32, offset: i64) {
        self.offsets.insert((topic.to_string(), partition), offset);
    }

    /// Returns the last delivered offset for a partition.
    #[must_use]
    pub fn get(&self, topic: &str, partition: i32) -> Option<i64> {
        self.offsets.get(&(topic.to_string(), partition)).copied()
    }

    /// Returns the number of tracked partitions.
    #[must_use]
    pub fn partition_count(&self) -> usize {
        self.offsets.len()
    }

    /// Returns `true` if committing `tpo` refers to progress this
    /// consumer actually made: the partition is tracked and the offset is
    /// no further than one past the last delivered offset.
    #[must_use]
    pub fn is_stored(&self, tpo: &TopicPartitionOffset) -> bool {
        match self.get(&tpo.topic, tpo.partition) {
            Some(last) => tpo.offset <= last + 1,
            None => false,
        }
    }

    /// Builds the commit list: per partition, the next offset to fetch.
    #[must_use]
    pub fn to_commit_list(&self) -> Vec<TopicPartitionOffset> {
        let mut list: Vec<TopicPartitionOffset> = self
            .offsets
            .iter()
            .map(|((topic, partition), offset)| {
                TopicPartitionOffset::new(topic.clone(), *partition, offset + 1)
            })
            .collect();
        list.sort();
        list
    }

    /// Builds the commit list restricted to the given partitions.
    #[must_use]
    pub fn commit_list_for(&self, partitions: &[(String, i32)]) -> Vec<TopicPartitionOffset> {
        let mut list: Vec<TopicPartitionOffset> = partitions
            .iter()
            .filter_map(|(topic, partition)| {
                self.get(topic, *partition).map(|offset| {
                    TopicPartitionOffset::new(topic.clone(), *partition, offset + 1)
                })
            })
            .collect();
        list.sort();
        list
    }

    /// Forgets a partition, e.g. after revocation.
    pub fn remove(&mut self, topic: &str, partition: i32) {
        self.offsets.remove(&(topic.to_string(), partition));
    }

    /// Forgets all progress.
    pub fn clear(&mut self) {
        self.offsets.clear();
    }
}
