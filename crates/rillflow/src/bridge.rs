//! Translation of low-level client events into engine state and user
//! callbacks.
//!
//! [`CallbackBridge`] is a set of associated functions over borrowed
//! entry state — it owns nothing, which is what breaks the cycle between
//! the client (whose events need the engine) and the engine (which owns
//! the client). Log events are clamped to the topic's configured level;
//! stats JSON is routed verbatim; throttle events feed the entry's
//! window state machine; commit outcomes drive the retry/suspend policy.

use std::sync::atomic::Ordering;

use tracing::{debug, error, info, warn};

use crate::callbacks::{CommitReport, ConsumerCallbacks, LogCallback};
use crate::client::ClientEvent;
use crate::config::LogLevel;
use crate::consumer::entry::ConsumerTopicEntry;
use crate::error::Error;
use crate::message::{Opaque, TopicPartitionOffset};
use crate::producer::entry::ProducerTopicEntry;

/// What the engine should do after a commit outcome was dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CommitFollowUp {
    /// Nothing further.
    None,
    /// The user asked for one retry of the failed commit.
    Retry,
}

pub(crate) struct CallbackBridge;

impl CallbackBridge {
    /// Routes a producer-side client event.
    pub(crate) fn on_producer_event(entry: &ProducerTopicEntry, event: &ClientEvent) {
        match event {
            ClientEvent::Throttle(throttle) => {
                entry.metrics.record_throttle();
                entry.throttle.on_throttle(throttle.duration);
                debug!(
                    topic = %entry.topic,
                    broker = %throttle.broker,
                    duration_ms = throttle.duration.as_millis() as u64,
                    "broker throttle"
                );
                if let Some(cb) = &entry.callbacks.throttle {
                    cb(throttle);
                }
            }
            ClientEvent::Error(e) => Self::report_producer_error(entry, e),
            ClientEvent::Log {
                level,
                facility,
                message,
            } => Self::emit_log(
                &entry.topic,
                entry.tuning.log_level,
                entry.callbacks.log.as_ref(),
                *level,
                facility,
                message,
            ),
            ClientEvent::Stats(json) => {
                if let Some(cb) = &entry.callbacks.stats {
                    cb(json);
                }
            }
            // Consumer-only events carry no meaning for a producer entry.
            ClientEvent::PartitionsAssigned(_)
            | ClientEvent::PartitionsRevoked(_)
            | ClientEvent::RebalanceError(_)
            | ClientEvent::OffsetsCommitted { .. } => {}
        }
    }

    /// Reports a producer error to the user callback, or logs it.
    pub(crate) fn report_producer_error(entry: &ProducerTopicEntry, e: &Error) {
        if let Some(cb) = &entry.callbacks.error {
            cb(e);
        } else {
            error!(topic = %entry.topic, error = %e, "producer error");
        }
    }

    /// Routes a consumer-side client event that is not a rebalance.
    ///
    /// Rebalance events need the poll task's queue state and are handled
    /// by the engine directly.
    pub(crate) fn on_consumer_event<K, V>(
        entry: &ConsumerTopicEntry,
        callbacks: &ConsumerCallbacks<K, V>,
        event: &ClientEvent,
    ) -> CommitFollowUp {
        match event {
            ClientEvent::Throttle(throttle) => {
                entry.throttle.on_throttle(throttle.duration);
                if let Some(cb) = &callbacks.throttle {
                    cb(throttle);
                }
                CommitFollowUp::None
            }
            ClientEvent::Error(e) => {
                Self::report_consumer_error(entry, callbacks, e);
                CommitFollowUp::None
            }
            ClientEvent::Log {
                level,
                facility,
                message,
            } => {
                Self::emit_log(
                    &entry.topic,
                    entry.tuning.log_level,
                    callbacks.log.as_ref(),
                    *level,
                    facility,
                    message,
                );
                CommitFollowUp::None
            }
            ClientEvent::Stats(json) => {
                if let Some(cb) = &callbacks.stats {
                    cb(json);
                }
                CommitFollowUp::None
            }
            ClientEvent::OffsetsCommitted { results, opaque } => {
                Self::on_offsets_committed(entry, callbacks, results, *opaque)
            }
            ClientEvent::PartitionsAssigned(_)
            | ClientEvent::PartitionsRevoked(_)
            | ClientEvent::RebalanceError(_) => CommitFollowUp::None,
        }
    }

    /// Dispatches a commit outcome and applies the retry/suspend policy.
    pub(crate) fn on_offsets_committed<K, V>(
        entry: &ConsumerTopicEntry,
        callbacks: &ConsumerCallbacks<K, V>,
        results: &[(TopicPartitionOffset, Option<Error>)],
        opaque: Opaque,
    ) -> CommitFollowUp {
        let report = CommitReport {
            results: results.to_vec(),
            opaque,
        };
        if let Some(cb) = &callbacks.offset_commit {
            cb(&report);
        }

        let Some(first_error) = report.first_error() else {
            return CommitFollowUp::None;
        };
        match &callbacks.offset_commit_error {
            Some(cb) if cb(first_error) => CommitFollowUp::Retry,
            Some(_) => {
                warn!(
                    topic = %entry.topic,
                    error = %first_error,
                    "commit failed; suspending commits until next assignment"
                );
                entry.commits_suspended.store(true, Ordering::SeqCst);
                CommitFollowUp::None
            }
            None => {
                Self::report_consumer_error(entry, callbacks, first_error);
                CommitFollowUp::None
            }
        }
    }

    /// Reports a consumer error to the user callback, or logs it.
    pub(crate) fn report_consumer_error<K, V>(
        entry: &ConsumerTopicEntry,
        callbacks: &ConsumerCallbacks<K, V>,
        e: &Error,
    ) {
        if let Some(cb) = &callbacks.error {
            cb(e);
        } else {
            error!(topic = %entry.topic, error = %e, "consumer error");
        }
    }

    /// Forwards a client log line if it passes the topic's level clamp.
    fn emit_log(
        topic: &str,
        clamp: LogLevel,
        cb: Option<&LogCallback>,
        level: LogLevel,
        facility: &str,
        message: &str,
    ) {
        if !clamp.allows(level) {
            return;
        }
        if let Some(cb) = cb {
            cb(level, facility, message);
            return;
        }
        match level {
            LogLevel::Error => error!(topic, facility, "{message}"),
            LogLevel::Warning => warn!(topic, facility, "{message}"),
            LogLevel::Info => info!(topic, facility, "{message}"),
            LogLevel::Debug => debug!(topic, facility, "{message}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::ProducerCallbacks;
    use crate::client::ThrottleEvent;
    use crate::config::{ConnectorConfig, ConsumerTuning, ProducerTuning};
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;

    fn producer_entry() -> ProducerTopicEntry {
        let mut tuning = ProducerTuning::default();
        tuning.auto_throttle = true;
        tuning.throttle_multiplier = 2;
        ProducerTopicEntry::new(
            "events".into(),
            ConnectorConfig::default(),
            tuning,
            ProducerCallbacks::default(),
        )
    }

    fn consumer_entry() -> ConsumerTopicEntry {
        ConsumerTopicEntry::new(
            "events".into(),
            ConnectorConfig::default(),
            ConsumerTuning::default(),
        )
    }

    #[test]
    fn test_throttle_event_updates_window() {
        let entry = producer_entry();
        let event = ClientEvent::Throttle(ThrottleEvent {
            broker: "broker-1".into(),
            broker_id: 1,
            duration: Duration::from_millis(500),
        });
        CallbackBridge::on_producer_event(&entry, &event);

        assert_eq!(entry.throttle.throttle_duration(), Duration::from_millis(1000));
        assert_eq!(entry.metrics.snapshot().throttle_events, 1);
    }

    #[test]
    fn test_log_clamped_to_topic_level() {
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);

        let mut entry = producer_entry();
        entry.tuning.log_level = LogLevel::Warning;
        entry.callbacks.log = Some(Arc::new(move |_level, _fac, message: &str| {
            sink.lock().push(message.to_string());
        }));

        let debug_line = ClientEvent::Log {
            level: LogLevel::Debug,
            facility: "FETCH".into(),
            message: "noisy".into(),
        };
        let warn_line = ClientEvent::Log {
            level: LogLevel::Warning,
            facility: "BROKER".into(),
            message: "important".into(),
        };
        CallbackBridge::on_producer_event(&entry, &debug_line);
        CallbackBridge::on_producer_event(&entry, &warn_line);

        assert_eq!(seen.lock().clone(), vec!["important".to_string()]);
    }

    #[test]
    fn test_commit_error_suspends_when_callback_refuses() {
        let entry = consumer_entry();
        let mut callbacks: ConsumerCallbacks<String, String> = ConsumerCallbacks::default();
        callbacks.offset_commit_error = Some(Arc::new(|_e: &Error| false));

        let results = vec![(
            TopicPartitionOffset::new("events", 0, 10),
            Some(Error::broker(27, "REBALANCE_IN_PROGRESS")),
        )];
        let follow_up =
            CallbackBridge::on_offsets_committed(&entry, &callbacks, &results, Opaque::NONE);

        assert_eq!(follow_up, CommitFollowUp::None);
        assert!(entry.commits_suspended.load(Ordering::SeqCst));
    }

    #[test]
    fn test_commit_error_retry_requested() {
        let entry = consumer_entry();
        let mut callbacks: ConsumerCallbacks<String, String> = ConsumerCallbacks::default();
        callbacks.offset_commit_error = Some(Arc::new(|_e: &Error| true));

        let results = vec![(
            TopicPartitionOffset::new("events", 0, 10),
            Some(Error::broker(27, "REBALANCE_IN_PROGRESS")),
        )];
        let follow_up =
            CallbackBridge::on_offsets_committed(&entry, &callbacks, &results, Opaque::NONE);

        assert_eq!(follow_up, CommitFollowUp::Retry);
        assert!(!entry.commits_suspended.load(Ordering::SeqCst));
    }

    #[test]
    fn test_successful_commit_reported() {
        let entry = consumer_entry();
        let seen: Arc<Mutex<Vec<Opaque>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);

        let mut callbacks: ConsumerCallbacks<String, String> = ConsumerCallbacks::default();
        callbacks.offset_commit = Some(Arc::new(move |report: &CommitReport| {
            assert!(report.success());
            sink.lock().push(report.opaque);
        }));

        let results = vec![(TopicPartitionOffset::new("events", 0, 10), None)];
        CallbackBridge::on_offsets_committed(&entry, &callbacks, &results, Opaque::new(99));

        assert_eq!(seen.lock().clone(), vec![Opaque::new(99)]);
    }
}
