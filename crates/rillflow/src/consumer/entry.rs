//! Per-topic consumer state container.

use std::sync::atomic::{AtomicBool, Ordering};

use fxhash::{FxHashMap, FxHashSet};
use parking_lot::Mutex;

use crate::config::{ConnectorConfig, ConsumerTuning};
use crate::consumer::offsets::OffsetTracker;
use crate::metrics::ConsumerMetrics;
use crate::message::TopicPartition;
use crate::runtime::IoTracker;
use crate::throttle::ThrottleControl;

/// Lifecycle state of a consumer entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    /// No subscription installed.
    Unsubscribed,
    /// Subscribed and delivering.
    Subscribed,
    /// Subscribed but fetching is paused.
    Paused,
    /// Shut down; no further callbacks.
    Terminated,
}

impl std::fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConsumerState::Unsubscribed => write!(f, "Unsubscribed"),
            ConsumerState::Subscribed => write!(f, "Subscribed"),
            ConsumerState::Paused => write!(f, "Paused"),
            ConsumerState::Terminated => write!(f, "Terminated"),
        }
    }
}

/// Mutable per-topic consumer state shared by the poll task, the dispatch
/// workers, and the commit path.
pub(crate) struct ConsumerTopicEntry {
    /// Topic name.
    pub topic: String,
    /// Connector-wide settings.
    pub connector: ConnectorConfig,
    /// Parsed engine tuning.
    pub tuning: ConsumerTuning,
    /// Lifecycle state.
    pub state: Mutex<ConsumerState>,
    /// Preprocessor toggle, flippable at runtime.
    pub preprocess: AtomicBool,
    /// Throttle window state machine.
    pub throttle: ThrottleControl,
    /// Set once a failed commit suspended committing; cleared on the next
    /// assignment.
    pub commits_suspended: AtomicBool,
    /// Outstanding dispatch work, for drain on revocation and shutdown.
    pub io_tracker: IoTracker,
    /// Last delivered offsets, feeding commits.
    pub offsets: Mutex<OffsetTracker>,
    /// Currently assigned partitions.
    pub assigned: Mutex<Vec<TopicPartition>>,
    /// Partitions revoked but possibly still queued; workers skip them.
    pub revoked: Mutex<FxHashSet<i32>>,
    /// Partition → dispatch queue index; rebuilt between poll batches.
    pub queue_map: Mutex<FxHashMap<i32, usize>>,
    /// Engine counters.
    pub metrics: ConsumerMetrics,
    /// Set when shutdown begins; gates receiver invocations.
    pub terminated: AtomicBool,
}

impl ConsumerTopicEntry {
    pub(crate) fn new(topic: String, connector: ConnectorConfig, tuning: ConsumerTuning) -> Self {
        let preprocess = tuning.preprocess_messages;
        let throttle = ThrottleControl::new(tuning.auto_throttle, tuning.throttle_multiplier);
        Self {
            topic,
            connector,
            tuning,
            state: Mutex::new(ConsumerState::Unsubscribed),
            preprocess: AtomicBool::new(preprocess),
            throttle,
            commits_suspended: AtomicBool::new(false),
            io_tracker: IoTracker::new(),
            offsets: Mutex::new(OffsetTracker::new()),
            assigned: Mutex::new(Vec::new()),
            revoked: Mutex::new(FxHashSet::default()),
            queue_map: Mutex::new(FxHashMap::default()),
            metrics: ConsumerMetrics::new(),
            terminated: AtomicBool::new(false),
        }
    }

    pub(crate) fn state(&self) -> ConsumerState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: ConsumerState) {
        *self.state.lock() = state;
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    pub(crate) fn is_revoked(&self, partition: i32) -> bool {
        self.revoked.lock().contains(&partition)
    }
}

impl std::fmt::Debug for ConsumerTopicEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerTopicEntry")
            .field("topic", &self.topic)
            .field("state", &self.state())
            .field("assigned", &self.assigned.lock().len())
            .field("in_flight", &self.io_tracker.in_flight())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConsumerTuning;

    #[test]
    fn test_initial_state() {
        let entry = ConsumerTopicEntry::new(
            "events".into(),
            ConnectorConfig::default(),
            ConsumerTuning::default(),
        );
        assert_eq!(entry.state(), ConsumerState::Unsubscribed);
        assert!(!entry.is_terminated());
        assert!(!entry.is_revoked(0));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ConsumerState::Paused.to_string(), "Paused");
        assert_eq!(ConsumerState::Terminated.to_string(), "Terminated");
    }
}
