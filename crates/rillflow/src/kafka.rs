//! rdkafka-backed low-level clients.
//!
//! [`KafkaProducerClient`] wraps a `ThreadedProducer` whose context
//! collects delivery acks; [`KafkaConsumerClient`] wraps a
//! `BaseConsumer`. Client callbacks (log, stats, error, commit) are
//! captured into an event store the engines drain through the
//! [`ClientEvent`] seam.
//!
//! Two librdkafka gaps are papered over at this seam:
//!
//! - there is no dedicated throttle callback, so throttle windows are
//!   derived from the broker `throttle` section of the statistics
//!   payload (enable `statistics.interval.ms` to receive them);
//! - rebalance notifications are synthesized by diffing the consumer's
//!   assignment between poll batches, which is exactly the granularity
//!   at which the engine rebuilds its partition→queue map.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use rdkafka::client::ClientContext;
use rdkafka::config::{ClientConfig, RDKafkaLogLevel};
use rdkafka::consumer::{BaseConsumer, CommitMode as RdCommitMode, Consumer, ConsumerContext};
use rdkafka::error::{KafkaError, KafkaResult};
use rdkafka::message::{
    BorrowedMessage, Header as RdHeader, Headers as RdHeaders, Message as RdMessage, OwnedHeaders,
};
use rdkafka::producer::{BaseRecord, DeliveryResult, Producer, ProducerContext, ThreadedProducer};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::{Offset, TopicPartitionList};

use crate::client::{
    ClientEvent, CommitMode, ConsumerClient, DeliveryAck, PollOutcome, ProducerClient,
    ProducerRecord, ThrottleEvent,
};
use crate::config::{LogLevel, TopicOptions};
use crate::error::Error;
use crate::message::{Headers, Message, Opaque, TopicPartition, TopicPartitionOffset};

/// Deadline for metadata and watermark queries.
const METADATA_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct EventStore {
    events: Mutex<Vec<ClientEvent>>,
    acks: Mutex<Vec<DeliveryAck>>,
    commit_opaques: Mutex<Vec<Opaque>>,
}

impl EventStore {
    fn push_event(&self, event: ClientEvent) {
        self.events.lock().push(event);
    }

    fn drain_events(&self) -> Vec<ClientEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    fn push_ack(&self, ack: DeliveryAck) {
        self.acks.lock().push(ack);
    }

    fn drain_acks(&self) -> Vec<DeliveryAck> {
        std::mem::take(&mut *self.acks.lock())
    }

    fn push_commit_opaque(&self, opaque: Opaque) {
        self.commit_opaques.lock().push(opaque);
    }

    fn pop_commit_opaque(&self) -> Opaque {
        let mut pending = self.commit_opaques.lock();
        if pending.is_empty() {
            Opaque::NONE
        } else {
            pending.remove(0)
        }
    }
}

/// Engine correlation data threaded through librdkafka's per-message
/// opaque.
struct DeliveryTag {
    tag: u64,
    opaque: Opaque,
}

struct EngineContext {
    store: Arc<EventStore>,
}

impl ClientContext for EngineContext {
    fn log(&self, level: RDKafkaLogLevel, fac: &str, log_message: &str) {
        let level = match level {
            RDKafkaLogLevel::Emerg
            | RDKafkaLogLevel::Alert
            | RDKafkaLogLevel::Critical
            | RDKafkaLogLevel::Error => LogLevel::Error,
            RDKafkaLogLevel::Warning => LogLevel::Warning,
            RDKafkaLogLevel::Notice | RDKafkaLogLevel::Info => LogLevel::Info,
            RDKafkaLogLevel::Debug => LogLevel::Debug,
        };
        self.store.push_event(ClientEvent::Log {
            level,
            facility: fac.to_string(),
            message: log_message.to_string(),
        });
    }

    fn stats_raw(&self, statistics: &[u8]) {
        let json = String::from_utf8_lossy(statistics).into_owned();
        if let Some((broker, broker_id, millis)) = max_broker_throttle(&json) {
            if millis > 0 {
                self.store.push_event(ClientEvent::Throttle(ThrottleEvent {
                    broker,
                    broker_id,
                    duration: Duration::from_millis(millis.unsigned_abs()),
                }));
            }
        }
        self.store.push_event(ClientEvent::Stats(json));
    }

    fn error(&self, error: KafkaError, reason: &str) {
        self.store
            .push_event(ClientEvent::Error(map_kafka_error(&error, reason)));
    }
}

impl ProducerContext for EngineContext {
    type DeliveryOpaque = Box<DeliveryTag>;

    fn delivery(&self, delivery_result: &DeliveryResult<'_>, delivery_opaque: Self::DeliveryOpaque) {
        let ack = match delivery_result {
            Ok(message) => DeliveryAck {
                topic_partition: TopicPartition::new(message.topic(), message.partition()),
                offset: message.offset(),
                error: None,
                opaque: delivery_opaque.opaque,
                delivery_tag: delivery_opaque.tag,
            },
            Err((error, message)) => DeliveryAck {
                topic_partition: TopicPartition::new(message.topic(), message.partition()),
                offset: -1,
                error: Some(map_kafka_error(error, "delivery failed")),
                opaque: delivery_opaque.opaque,
                delivery_tag: delivery_opaque.tag,
            },
        };
        self.store.push_ack(ack);
    }
}

impl ConsumerContext for EngineContext {
    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        let opaque = self.store.pop_commit_opaque();
        let error = result
            .err()
            .map(|e| map_kafka_error(&e, "offset commit failed"));
        let results: Vec<(TopicPartitionOffset, Option<Error>)> = tpl_offsets(offsets)
            .into_iter()
            .map(|tpo| (tpo, error.clone()))
            .collect();
        self.store
            .push_event(ClientEvent::OffsetsCommitted { results, opaque });
    }
}

/// [`ProducerClient`] over an rdkafka `ThreadedProducer`.
pub struct KafkaProducerClient {
    producer: ThreadedProducer<EngineContext>,
    store: Arc<EventStore>,
}

impl KafkaProducerClient {
    /// Builds a producer from the option map's pass-through kafka
    /// properties.
    ///
    /// # Errors
    ///
    /// Returns a `Network` error when librdkafka rejects the
    /// configuration.
    pub fn from_options(options: &TopicOptions) -> Result<Self, Error> {
        let mut config = ClientConfig::new();
        for (key, value) in options.kafka_properties() {
            config.set(key, value);
        }
        // Engine-level retry and deadline options translate to their
        // librdkafka equivalents.
        if let Some(retries) = options.get("internal.producer.retries") {
            config.set("message.send.max.retries", retries);
        }
        if let Some(timeout) = options.get("internal.producer.timeout.ms") {
            config.set("message.timeout.ms", timeout);
        }
        let store = Arc::new(EventStore::default());
        let producer: ThreadedProducer<EngineContext> = config
            .create_with_context(EngineContext {
                store: Arc::clone(&store),
            })
            .map_err(|e| Error::network(format!("failed to create producer: {e}")))?;
        Ok(Self { producer, store })
    }
}

impl ProducerClient for KafkaProducerClient {
    fn enqueue(&self, record: ProducerRecord) -> Result<(), (Error, ProducerRecord)> {
        let tag = Box::new(DeliveryTag {
            tag: record.delivery_tag,
            opaque: record.opaque,
        });
        let mut base: BaseRecord<'_, [u8], [u8], Box<DeliveryTag>> =
            BaseRecord::with_opaque_to(&record.topic, tag);
        base.partition = record.partition;
        base.payload = record.payload.as_deref();
        base.key = record.key.as_deref();
        if !record.headers.is_empty() {
            let mut headers = OwnedHeaders::new_with_capacity(record.headers.len());
            for (name, value) in record.headers.iter() {
                headers = headers.insert(RdHeader {
                    key: name,
                    value: Some(value.as_ref()),
                });
            }
            base.headers = Some(headers);
        }

        match self.producer.send(base) {
            Ok(()) => Ok(()),
            Err((error, returned)) => {
                let mapped = map_kafka_error(&error, "enqueue failed");
                drop(returned);
                Err((mapped, record))
            }
        }
    }

    fn poll_acks(&self, timeout: Duration) -> Vec<DeliveryAck> {
        let acks = self.store.drain_acks();
        if !acks.is_empty() || timeout.is_zero() {
            return acks;
        }
        // The poller thread delivers acks in the background; give it one
        // short beat.
        std::thread::sleep(timeout.min(Duration::from_millis(10)));
        self.store.drain_acks()
    }

    fn flush(&self, timeout: Duration) -> Result<(), Error> {
        self.producer
            .flush(timeout)
            .map_err(|e| map_kafka_error(&e, "flush failed"))
    }

    fn queue_len(&self) -> usize {
        self.producer.in_flight_count().max(0) as usize
    }

    fn take_events(&self) -> Vec<ClientEvent> {
        self.store.drain_events()
    }

    fn partition_count(&self, topic: &str) -> Result<i32, Error> {
        let metadata = self
            .producer
            .client()
            .fetch_metadata(Some(topic), METADATA_TIMEOUT)
            .map_err(|e| map_kafka_error(&e, "metadata fetch failed"))?;
        metadata
            .topics()
            .first()
            .map(|t| t.partitions().len() as i32)
            .ok_or_else(|| Error::broker(-1, format!("unknown topic '{topic}'")))
    }

    fn watermarks(&self, tp: &TopicPartition) -> Result<(i64, i64), Error> {
        self.producer
            .client()
            .fetch_watermarks(&tp.topic, tp.partition, METADATA_TIMEOUT)
            .map_err(|e| map_kafka_error(&e, "watermark fetch failed"))
    }
}

impl std::fmt::Debug for KafkaProducerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaProducerClient")
            .field("in_flight", &self.queue_len())
            .finish_non_exhaustive()
    }
}

/// [`ConsumerClient`] over an rdkafka `BaseConsumer`.
pub struct KafkaConsumerClient {
    consumer: BaseConsumer<EngineContext>,
    store: Arc<EventStore>,
    last_assignment: Mutex<Vec<TopicPartition>>,
}

impl KafkaConsumerClient {
    /// Builds a consumer from the option map's pass-through kafka
    /// properties.
    ///
    /// When using the `store` offset persist strategy, also set
    /// `enable.auto.offset.store=false` so the engine controls which
    /// offsets the auto-commit thread persists.
    ///
    /// # Errors
    ///
    /// Returns a `Network` error when librdkafka rejects the
    /// configuration.
    pub fn from_options(options: &TopicOptions) -> Result<Self, Error> {
        let mut config = ClientConfig::new();
        for (key, value) in options.kafka_properties() {
            config.set(key, value);
        }
        let store = Arc::new(EventStore::default());
        let consumer: BaseConsumer<EngineContext> = config
            .create_with_context(EngineContext {
                store: Arc::clone(&store),
            })
            .map_err(|e| Error::network(format!("failed to create consumer: {e}")))?;
        Ok(Self {
            consumer,
            store,
            last_assignment: Mutex::new(Vec::new()),
        })
    }

    fn diff_assignment(&self) {
        let Ok(tpl) = self.consumer.assignment() else {
            return;
        };
        let current = tpl_partitions(&tpl);
        let mut last = self.last_assignment.lock();
        if *last == current {
            return;
        }
        let removed: Vec<TopicPartition> = last
            .iter()
            .filter(|tp| !current.contains(tp))
            .cloned()
            .collect();
        if !removed.is_empty() {
            self.store
                .push_event(ClientEvent::PartitionsRevoked(removed));
        }
        if current.iter().any(|tp| !last.contains(tp)) {
            self.store
                .push_event(ClientEvent::PartitionsAssigned(current.clone()));
        }
        *last = current;
    }
}

impl ConsumerClient for KafkaConsumerClient {
    fn subscribe(&self, topics: &[String]) -> Result<(), Error> {
        let refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer
            .subscribe(&refs)
            .map_err(|e| map_kafka_error(&e, "subscribe failed"))
    }

    fn assign(&self, partitions: &[TopicPartitionOffset]) -> Result<(), Error> {
        let mut tpl = TopicPartitionList::new();
        for tpo in partitions {
            let offset = if tpo.offset >= 0 {
                Offset::Offset(tpo.offset)
            } else {
                Offset::Stored
            };
            tpl.add_partition_offset(&tpo.topic, tpo.partition, offset)
                .map_err(|e| map_kafka_error(&e, "assign failed"))?;
        }
        self.consumer
            .assign(&tpl)
            .map_err(|e| map_kafka_error(&e, "assign failed"))
    }

    fn unsubscribe(&self) {
        self.consumer.unsubscribe();
    }

    fn poll(&self, max_messages: usize, timeout: Duration) -> Result<PollOutcome, Error> {
        let deadline = Instant::now() + timeout;
        let mut messages = Vec::new();
        while messages.len() < max_messages {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.consumer.poll(remaining) {
                Some(Ok(message)) => messages.push(convert_message(&message)),
                Some(Err(e)) => {
                    self.store
                        .push_event(ClientEvent::Error(map_kafka_error(&e, "poll error")));
                    break;
                }
                None => break,
            }
            if Instant::now() >= deadline {
                break;
            }
        }
        self.diff_assignment();
        Ok(PollOutcome {
            messages,
            events: self.store.drain_events(),
        })
    }

    fn pause(&self, partitions: &[TopicPartition]) -> Result<(), Error> {
        let tpl = partitions_tpl(partitions);
        self.consumer
            .pause(&tpl)
            .map_err(|e| map_kafka_error(&e, "pause failed"))
    }

    fn resume(&self, partitions: &[TopicPartition]) -> Result<(), Error> {
        let tpl = partitions_tpl(partitions);
        self.consumer
            .resume(&tpl)
            .map_err(|e| map_kafka_error(&e, "resume failed"))
    }

    fn commit(
        &self,
        offsets: &[TopicPartitionOffset],
        mode: CommitMode,
        opaque: Opaque,
    ) -> Result<(), Error> {
        let mut tpl = TopicPartitionList::new();
        for tpo in offsets {
            tpl.add_partition_offset(&tpo.topic, tpo.partition, Offset::Offset(tpo.offset))
                .map_err(|e| map_kafka_error(&e, "commit failed"))?;
        }
        self.store.push_commit_opaque(opaque);
        let mode = match mode {
            CommitMode::Sync => RdCommitMode::Sync,
            CommitMode::Async => RdCommitMode::Async,
        };
        self.consumer.commit(&tpl, mode).map_err(|e| {
            // The callback will not fire for a rejected submission.
            let _ = self.store.pop_commit_opaque();
            map_kafka_error(&e, "commit failed")
        })
    }

    fn store_offsets(&self, offsets: &[TopicPartitionOffset]) -> Result<(), Error> {
        for tpo in offsets {
            self.consumer
                .store_offset(&tpo.topic, tpo.partition, tpo.offset)
                .map_err(|e| {
                    map_kafka_error(&e, "offset store failed")
                        .with_partition(tpo.topic_partition())
                })?;
        }
        Ok(())
    }

    fn assignment(&self) -> Vec<TopicPartition> {
        self.consumer
            .assignment()
            .map(|tpl| tpl_partitions(&tpl))
            .unwrap_or_default()
    }

    fn partition_count(&self, topic: &str) -> Result<i32, Error> {
        let metadata = self
            .consumer
            .fetch_metadata(Some(topic), METADATA_TIMEOUT)
            .map_err(|e| map_kafka_error(&e, "metadata fetch failed"))?;
        metadata
            .topics()
            .first()
            .map(|t| t.partitions().len() as i32)
            .ok_or_else(|| Error::broker(-1, format!("unknown topic '{topic}'")))
    }

    fn watermarks(&self, tp: &TopicPartition) -> Result<(i64, i64), Error> {
        self.consumer
            .fetch_watermarks(&tp.topic, tp.partition, METADATA_TIMEOUT)
            .map_err(|e| map_kafka_error(&e, "watermark fetch failed"))
    }

    fn offsets_for_timestamp(
        &self,
        topic: &str,
        timestamp_ms: i64,
    ) -> Result<Vec<TopicPartitionOffset>, Error> {
        let count = self.partition_count(topic)?;
        let mut tpl = TopicPartitionList::new();
        for partition in 0..count {
            tpl.add_partition_offset(topic, partition, Offset::Offset(timestamp_ms))
                .map_err(|e| map_kafka_error(&e, "timestamp lookup failed"))?;
        }
        let resolved = self
            .consumer
            .offsets_for_times(tpl, METADATA_TIMEOUT)
            .map_err(|e| map_kafka_error(&e, "timestamp lookup failed"))?;
        Ok(tpl_offsets(&resolved))
    }
}

impl std::fmt::Debug for KafkaConsumerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaConsumerClient")
            .field("assignment", &self.last_assignment.lock().len())
            .finish_non_exhaustive()
    }
}

fn convert_message(message: &BorrowedMessage<'_>) -> Message {
    let mut headers = Headers::new();
    if let Some(raw) = message.headers() {
        for header in raw.iter() {
            headers.insert(
                header.key,
                header.value.map(Bytes::copy_from_slice).unwrap_or_default(),
            );
        }
    }
    Message {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        timestamp_ms: message.timestamp().to_millis(),
        key: message.key().map(Bytes::copy_from_slice),
        payload: message.payload().map(Bytes::copy_from_slice),
        headers,
        error: None,
    }
}

fn partitions_tpl(partitions: &[TopicPartition]) -> TopicPartitionList {
    let mut tpl = TopicPartitionList::new();
    for tp in partitions {
        let _ = tpl.add_partition_offset(&tp.topic, tp.partition, Offset::Invalid);
    }
    tpl
}

fn tpl_partitions(tpl: &TopicPartitionList) -> Vec<TopicPartition> {
    let mut partitions: Vec<TopicPartition> = tpl
        .elements()
        .iter()
        .map(|elem| TopicPartition::new(elem.topic(), elem.partition()))
        .collect();
    partitions.sort();
    partitions
}

fn tpl_offsets(tpl: &TopicPartitionList) -> Vec<TopicPartitionOffset> {
    tpl.elements()
        .iter()
        .filter_map(|elem| match elem.offset() {
            Offset::Offset(offset) => Some(TopicPartitionOffset::new(
                elem.topic(),
                elem.partition(),
                offset,
            )),
            _ => None,
        })
        .collect()
}

fn map_kafka_error(error: &KafkaError, context: &str) -> Error {
    let reason = format!("{context}: {error}");
    match error.rdkafka_error_code() {
        Some(RDKafkaErrorCode::QueueFull) => Error::queue_full(reason),
        Some(code) => Error::broker(code as i32, reason),
        None => Error::network(reason),
    }
}

/// Extracts the largest broker throttle window from a statistics
/// payload, in milliseconds.
fn max_broker_throttle(json: &str) -> Option<(String, i32, i64)> {
    let value: serde_json::Value = serde_json::from_str(json).ok()?;
    let brokers = value.get("brokers")?.as_object()?;
    let mut best: Option<(String, i32, i64)> = None;
    for (name, broker) in brokers {
        let Some(throttle) = broker.get("throttle") else {
            continue;
        };
        let millis = throttle.get("max").and_then(serde_json::Value::as_i64)?;
        let broker_id = broker
            .get("nodeid")
            .and_then(serde_json::Value::as_i64)
            .unwrap_or(-1) as i32;
        if best.as_ref().map_or(true, |(_, _, m)| millis > *m) {
            best = Some((name.clone(), broker_id, millis));
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_broker_throttle_picks_largest() {
        let json = r#"{
            "brokers": {
                "broker-1:9092/1": {"nodeid": 1, "throttle": {"min": 0, "max": 120, "avg": 40}},
                "broker-2:9092/2": {"nodeid": 2, "throttle": {"min": 0, "max": 500, "avg": 90}}
            }
        }"#;
        let (name, broker_id, millis) = max_broker_throttle(json).unwrap();
        assert!(name.starts_with("broker-2"));
        assert_eq!(broker_id, 2);
        assert_eq!(millis, 500);
    }

    #[test]
    fn test_max_broker_throttle_absent() {
        assert!(max_broker_throttle(r#"{"brokers": {}}"#).is_none());
        assert!(max_broker_throttle("not json").is_none());
    }

    #[test]
    fn test_event_store_commit_opaque_fifo() {
        let store = EventStore::default();
        store.push_commit_opaque(Opaque::new(1));
        store.push_commit_opaque(Opaque::new(2));
        assert_eq!(store.pop_commit_opaque(), Opaque::new(1));
        assert_eq!(store.pop_commit_opaque(), Opaque::new(2));
        assert_eq!(store.pop_commit_opaque(), Opaque::NONE);
    }
}
