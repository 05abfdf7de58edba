//! Lock-free engine metrics.
//!
//! Atomic counters updated on the hot paths, exposed as plain snapshot
//! structs through the metadata facades.

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters for one producer topic entry.
#[derive(Debug, Default)]
pub struct ProducerMetrics {
    /// Records handed to the low-level client.
    pub records_sent: AtomicU64,
    /// Bytes handed to the low-level client.
    pub bytes_sent: AtomicU64,
    /// Records acknowledged by the broker.
    pub records_acked: AtomicU64,
    /// Records whose delivery failed.
    pub records_failed: AtomicU64,
    /// Queue-full notifications raised.
    pub queue_full_events: AtomicU64,
    /// Broker throttle notifications observed.
    pub throttle_events: AtomicU64,
}

impl ProducerMetrics {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a handoff of one record of `bytes` bytes.
    pub fn record_send(&self, bytes: u64) {
        self.records_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Records a successful delivery.
    pub fn record_ack(&self) {
        self.records_acked.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a failed delivery.
    pub fn record_failure(&self) {
        self.records_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a queue-full notification.
    pub fn record_queue_full(&self) {
        self.queue_full_events.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a broker throttle notification.
    pub fn record_throttle(&self) {
        self.throttle_events.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a point-in-time snapshot.
    #[must_use]
    pub fn snapshot(&self) -> ProducerMetricsSnapshot {
        ProducerMetricsSnapshot {
            records_sent: self.records_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            records_acked: self.records_acked.load(Ordering::Relaxed),
            records_failed: self.records_failed.load(Ordering::Relaxed),
            queue_full_events: self.queue_full_events.load(Ordering::Relaxed),
            throttle_events: self.throttle_events.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`ProducerMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProducerMetricsSnapshot {
    /// Records handed to the low-level client.
    pub records_sent: u64,
    /// Bytes handed to the low-level client.
    pub bytes_sent: u64,
    /// Records acknowledged by the broker.
    pub records_acked: u64,
    /// Records whose delivery failed.
    pub records_failed: u64,
    /// Queue-full notifications raised.
    pub queue_full_events: u64,
    /// Broker throttle notifications observed.
    pub throttle_events: u64,
}

/// Atomic counters for one consumer topic entry.
#[derive(Debug, Default)]
pub struct ConsumerMetrics {
    /// Raw messages polled from the client.
    pub records_polled: AtomicU64,
    /// Bytes polled from the client.
    pub bytes_polled: AtomicU64,
    /// Messages delivered to a receiver.
    pub records_dispatched: AtomicU64,
    /// Messages dropped by the preprocessor.
    pub records_dropped: AtomicU64,
    /// Key, value, or header deserialization failures.
    pub deserialize_failures: AtomicU64,
    /// Offset persist operations issued.
    pub commits: AtomicU64,
    /// Rebalance events observed.
    pub rebalances: AtomicU64,
}

impl ConsumerMetrics {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a poll of `records` messages totaling `bytes`.
    pub fn record_poll(&self, records: u64, bytes: u64) {
        self.records_polled.fetch_add(records, Ordering::Relaxed);
        self.bytes_polled.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Records a delivery to a receiver.
    pub fn record_dispatch(&self) {
        self.records_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a preprocessor drop.
    pub fn record_drop(&self) {
        self.records_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a deserialization failure.
    pub fn record_deserialize_failure(&self) {
        self.deserialize_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Records an offset persist operation.
    pub fn record_commit(&self) {
        self.commits.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a rebalance event.
    pub fn record_rebalance(&self) {
        self.rebalances.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a point-in-time snapshot.
    #[must_use]
    pub fn snapshot(&self) -> ConsumerMetricsSnapshot {
        ConsumerMetricsSnapshot {
            records_polled: self.records_polled.load(Ordering::Relaxed),
            bytes_polled: self.bytes_polled.load(Ordering::Relaxed),
            records_dispatched: self.records_dispatched.load(Ordering::Relaxed),
            records_dropped: self.records_dropped.load(Ordering::Relaxed),
            deserialize_failures: self.deserialize_failures.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            rebalances: self.rebalances.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`ConsumerMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerMetricsSnapshot {
    /// Raw messages polled from the client.
    pub records_polled: u64,
    /// Bytes polled from the client.
    pub bytes_polled: u64,
    /// Messages delivered to a receiver.
    pub records_dispatched: u64,
    /// Messages dropped by the preprocessor.
    pub records_dropped: u64,
    /// Key, value, or header deserialization failures.
    pub deserialize_failures: u64,
    /// Offset persist operations issued.
    pub commits: u64,
    /// Rebalance events observed.
    pub rebalances: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_producer_counters_accumulate() {
        let m = ProducerMetrics::new();
        m.record_send(100);
        m.record_send(50);
        m.record_ack();
        m.record_failure();
        m.record_queue_full();

        let snap = m.snapshot();
        assert_eq!(snap.records_sent, 2);
        assert_eq!(snap.bytes_sent, 150);
        assert_eq!(snap.records_acked, 1);
        assert_eq!(snap.records_failed, 1);
        assert_eq!(snap.queue_full_events, 1);
    }

    #[test]
    fn test_consumer_counters_accumulate() {
        let m = ConsumerMetrics::new();
        m.record_poll(10, 1024);
        m.record_dispatch();
        m.record_drop();
        m.record_deserialize_failure();
        m.record_commit();
        m.record_rebalance();

        let snap = m.snapshot();
        assert_eq!(snap.records_polled, 10);
        assert_eq!(snap.bytes_polled, 1024);
        assert_eq!(snap.records_dispatched, 1);
        assert_eq!(snap.records_dropped, 1);
        assert_eq!(snap.deserialize_failures, 1);
        assert_eq!(snap.commits, 1);
        assert_eq!(snap.rebalances, 1);
    }
}
