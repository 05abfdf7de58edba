//! Per-topic producer state container.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::callbacks::ProducerCallbacks;
use crate::config::{ConnectorConfig, ProducerTuning};
use crate::metrics::ProducerMetrics;
use crate::throttle::ThrottleControl;

/// Mutable per-topic producer state shared by the send path, the drain
/// task, and the callback bridge.
pub(crate) struct ProducerTopicEntry {
    /// Topic name.
    pub topic: String,
    /// Connector-wide settings.
    pub connector: ConnectorConfig,
    /// Parsed engine tuning.
    pub tuning: ProducerTuning,
    /// Per-topic callback bundle.
    pub callbacks: ProducerCallbacks,
    /// Throttle window state machine.
    pub throttle: ThrottleControl,
    /// Edge state for `queue.full.notification = edge-triggered`.
    pub queue_full_trigger: AtomicBool,
    /// Engine counters.
    pub metrics: ProducerMetrics,
    /// Set when shutdown begins; rejects new sends.
    pub closing: AtomicBool,
}

impl ProducerTopicEntry {
    pub(crate) fn new(
        topic: String,
        connector: ConnectorConfig,
        tuning: ProducerTuning,
        callbacks: ProducerCallbacks,
    ) -> Self {
        let throttle = ThrottleControl::new(tuning.auto_throttle, tuning.throttle_multiplier);
        Self {
            topic,
            connector,
            tuning,
            callbacks,
            throttle,
            queue_full_trigger: AtomicBool::new(false),
            metrics: ProducerMetrics::new(),
            closing: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    pub(crate) fn begin_close(&self) -> bool {
        !self.closing.swap(true, Ordering::SeqCst)
    }
}

impl std::fmt::Debug for ProducerTopicEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProducerTopicEntry")
            .field("topic", &self.topic)
            .field("tuning", &self.tuning)
            .field("closing", &self.is_closing())
            .finish_non_exhaustive()
    }
}
