//! Deterministic mock clients and test helpers.
//!
//! [`MockProducerClient`] and [`MockConsumerClient`] implement the
//! low-level seams with scripted messages, events, and acks, so engine
//! behavior (ordering, throttling, rebalance, commit policy) is testable
//! without a broker.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::Bytes;
use fxhash::{FxHashMap, FxHashSet};
use parking_lot::Mutex;

use crate::client::{
    ClientEvent, CommitMode, ConsumerClient, DeliveryAck, PollOutcome, ProducerClient,
    ProducerRecord, ThrottleEvent,
};
use crate::error::Error;
use crate::message::{Headers, Message, Opaque, TopicPartition, TopicPartitionOffset};
use crate::producer::partitioner::partition_for_key;

/// Builds a raw message for tests.
#[must_use]
pub fn raw_message(
    topic: &str,
    partition: i32,
    offset: i64,
    key: Option<&[u8]>,
    payload: &[u8],
) -> Message {
    Message {
        topic: topic.to_string(),
        partition,
        offset,
        timestamp_ms: Some(1_700_000_000_000 + offset),
        key: key.map(Bytes::copy_from_slice),
        payload: Some(Bytes::copy_from_slice(payload)),
        headers: Headers::new(),
        error: None,
    }
}

#[derive(Default)]
struct MockProducerState {
    pending: VecDeque<ProducerRecord>,
    sent: Vec<ProducerRecord>,
    enqueue_instants: Vec<Instant>,
    next_offsets: FxHashMap<i32, i64>,
    manual_acks: VecDeque<DeliveryAck>,
    events: VecDeque<ClientEvent>,
    blocked: bool,
    fail_enqueue: Option<Error>,
}

/// Scripted in-memory producer client.
///
/// Accepted records are acked in per-partition FIFO order with
/// monotonically increasing offsets whenever acks are polled or the
/// client is flushed.
pub struct MockProducerClient {
    partition_count: i32,
    state: Mutex<MockProducerState>,
}

impl MockProducerClient {
    /// Creates a mock producing into `partition_count` partitions.
    #[must_use]
    pub fn new(partition_count: i32) -> Self {
        Self {
            partition_count,
            state: Mutex::new(MockProducerState::default()),
        }
    }

    /// Makes `enqueue` report a full client buffer until unblocked.
    pub fn block_enqueue(&self, blocked: bool) {
        self.state.lock().blocked = blocked;
    }

    /// Makes the next `enqueue` fail with the given error.
    pub fn fail_next_enqueue(&self, error: Error) {
        self.state.lock().fail_enqueue = Some(error);
    }

    /// Queues a client event for the next `take_events`.
    pub fn push_event(&self, event: ClientEvent) {
        self.state.lock().events.push_back(event);
    }

    /// Queues a broker throttle notification.
    pub fn push_throttle(&self, broker: &str, broker_id: i32, duration: Duration) {
        self.push_event(ClientEvent::Throttle(ThrottleEvent {
            broker: broker.to_string(),
            broker_id,
            duration,
        }));
    }

    /// Queues a manual delivery ack.
    pub fn push_ack(&self, ack: DeliveryAck) {
        self.state.lock().manual_acks.push_back(ack);
    }

    /// Returns every record accepted so far.
    #[must_use]
    pub fn sent_records(&self) -> Vec<ProducerRecord> {
        self.state.lock().sent.clone()
    }

    /// Returns the instant each record was accepted.
    #[must_use]
    pub fn enqueue_instants(&self) -> Vec<Instant> {
        self.state.lock().enqueue_instants.clone()
    }

    fn resolve_partition(&self, record: &ProducerRecord) -> i32 {
        record.partition.unwrap_or_else(|| {
            record
                .key
                .as_deref()
                .map_or(0, |k| partition_for_key(k, self.partition_count))
        })
    }

    fn drain_pending_into_acks(&self, state: &mut MockProducerState) -> Vec<DeliveryAck> {
        let mut acks: Vec<DeliveryAck> = state.manual_acks.drain(..).collect();
        while let Some(record) = state.pending.pop_front() {
            let partition = self.resolve_partition(&record);
            let offset = state.next_offsets.entry(partition).or_insert(0);
            let ack = DeliveryAck {
                topic_partition: TopicPartition::new(record.topic.clone(), partition),
                offset: *offset,
                error: None,
                opaque: record.opaque,
                delivery_tag: record.delivery_tag,
            };
            *offset += 1;
            acks.push(ack);
        }
        acks
    }
}

impl ProducerClient for MockProducerClient {
    fn enqueue(&self, record: ProducerRecord) -> Result<(), (Error, ProducerRecord)> {
        let mut state = self.state.lock();
        if let Some(error) = state.fail_enqueue.take() {
            return Err((error, record));
        }
        if state.blocked {
            return Err((Error::queue_full("client buffer full"), record));
        }
        state.enqueue_instants.push(Instant::now());
        state.sent.push(record.clone());
        state.pending.push_back(record);
        Ok(())
    }

    fn poll_acks(&self, _timeout: Duration) -> Vec<DeliveryAck> {
        let mut state = self.state.lock();
        self.drain_pending_into_acks(&mut state)
    }

    fn flush(&self, _timeout: Duration) -> Result<(), Error> {
        let mut state = self.state.lock();
        let acks = self.drain_pending_into_acks(&mut state);
        state.manual_acks.extend(acks);
        Ok(())
    }

    fn queue_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    fn take_events(&self) -> Vec<ClientEvent> {
        self.state.lock().events.drain(..).collect()
    }

    fn partition_count(&self, _topic: &str) -> Result<i32, Error> {
        Ok(self.partition_count)
    }

    fn watermarks(&self, tp: &TopicPartition) -> Result<(i64, i64), Error> {
        let state = self.state.lock();
        let high = state.next_offsets.get(&tp.partition).copied().unwrap_or(0);
        Ok((0, high))
    }
}

impl std::fmt::Debug for MockProducerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockProducerClient")
            .field("partition_count", &self.partition_count)
            .field("queue_len", &self.queue_len())
            .finish()
    }
}

/// A commit captured by [`MockConsumerClient`].
#[derive(Debug, Clone)]
pub struct CommitRecord {
    /// Offsets handed to the client.
    pub offsets: Vec<TopicPartitionOffset>,
    /// Sync or async submission.
    pub mode: CommitMode,
    /// Handle from the commit call.
    pub opaque: Opaque,
}

#[derive(Default)]
struct MockConsumerState {
    incoming: VecDeque<Message>,
    events: VecDeque<ClientEvent>,
    subscribed: Vec<String>,
    assigned: Vec<TopicPartition>,
    assign_on_subscribe: Option<Vec<TopicPartition>>,
    paused: FxHashSet<(String, i32)>,
    commits: Vec<CommitRecord>,
    stored: Vec<Vec<TopicPartitionOffset>>,
    commit_error: Option<Error>,
    store_error: Option<Error>,
    watermarks: FxHashMap<i32, (i64, i64)>,
}

/// Scripted in-memory consumer client.
pub struct MockConsumerClient {
    partition_count: i32,
    state: Mutex<MockConsumerState>,
}

impl MockConsumerClient {
    /// Creates a mock consuming from `partition_count` partitions.
    #[must_use]
    pub fn new(partition_count: i32) -> Self {
        Self {
            partition_count,
            state: Mutex::new(MockConsumerState::default()),
        }
    }

    /// Queues one raw message for the next poll.
    pub fn push_message(&self, message: Message) {
        self.state.lock().incoming.push_back(message);
    }

    /// Queues several raw messages for the next polls.
    pub fn push_messages(&self, messages: impl IntoIterator<Item = Message>) {
        self.state.lock().incoming.extend(messages);
    }

    /// Queues a client event for the next poll.
    pub fn push_event(&self, event: ClientEvent) {
        self.state.lock().events.push_back(event);
    }

    /// Scripts the assignment emitted when `subscribe` is called.
    pub fn script_assignment(&self, partitions: Vec<TopicPartition>) {
        self.state.lock().assign_on_subscribe = Some(partitions);
    }

    /// Makes the next commit report the given error per partition.
    pub fn set_commit_error(&self, error: Error) {
        self.state.lock().commit_error = Some(error);
    }

    /// Makes the next `store_offsets` call fail with the given error.
    pub fn set_store_error(&self, error: Error) {
        self.state.lock().store_error = Some(error);
    }

    /// Sets the watermarks returned for one partition.
    pub fn set_watermarks(&self, partition: i32, low: i64, high: i64) {
        self.state.lock().watermarks.insert(partition, (low, high));
    }

    /// Returns every commit captured so far.
    #[must_use]
    pub fn commits(&self) -> Vec<CommitRecord> {
        self.state.lock().commits.clone()
    }

    /// Returns every `store_offsets` call captured so far.
    #[must_use]
    pub fn stored(&self) -> Vec<Vec<TopicPartitionOffset>> {
        self.state.lock().stored.clone()
    }

    /// Returns the topics passed to `subscribe`.
    #[must_use]
    pub fn subscribed_topics(&self) -> Vec<String> {
        self.state.lock().subscribed.clone()
    }

    /// Returns the partitions currently paused.
    #[must_use]
    pub fn paused_partitions(&self) -> Vec<(String, i32)> {
        let mut paused: Vec<(String, i32)> =
            self.state.lock().paused.iter().cloned().collect();
        paused.sort();
        paused
    }

    /// Returns the number of queued, not-yet-polled messages.
    #[must_use]
    pub fn undelivered(&self) -> usize {
        self.state.lock().incoming.len()
    }
}

impl ConsumerClient for MockConsumerClient {
    fn subscribe(&self, topics: &[String]) -> Result<(), Error> {
        let mut state = self.state.lock();
        state.subscribed = topics.to_vec();
        if let Some(partitions) = state.assign_on_subscribe.clone() {
            state.assigned.clone_from(&partitions);
            state
                .events
                .push_back(ClientEvent::PartitionsAssigned(partitions));
        }
        Ok(())
    }

    fn assign(&self, partitions: &[TopicPartitionOffset]) -> Result<(), Error> {
        let mut state = self.state.lock();
        let assigned: Vec<TopicPartition> =
            partitions.iter().map(TopicPartitionOffset::topic_partition).collect();
        state.assigned.clone_from(&assigned);
        state
            .events
            .push_back(ClientEvent::PartitionsAssigned(assigned));
        Ok(())
    }

    fn unsubscribe(&self) {
        let mut state = self.state.lock();
        let revoked = std::mem::take(&mut state.assigned);
        if !revoked.is_empty() {
            state.events.push_back(ClientEvent::PartitionsRevoked(revoked));
        }
        state.subscribed.clear();
    }

    fn poll(&self, max_messages: usize, timeout: Duration) -> Result<PollOutcome, Error> {
        let mut outcome = PollOutcome::default();
        {
            let mut state = self.state.lock();
            outcome.events = state.events.drain(..).collect();
            let take = max_messages.min(state.incoming.len());
            outcome.messages = state.incoming.drain(..take).collect();
        }
        if outcome.messages.is_empty() && outcome.events.is_empty() && !timeout.is_zero() {
            std::thread::sleep(timeout.min(Duration::from_millis(10)));
        }
        Ok(outcome)
    }

    fn pause(&self, partitions: &[TopicPartition]) -> Result<(), Error> {
        let mut state = self.state.lock();
        for tp in partitions {
            state.paused.insert((tp.topic.clone(), tp.partition));
        }
        Ok(())
    }

    fn resume(&self, partitions: &[TopicPartition]) -> Result<(), Error> {
        let mut state = self.state.lock();
        for tp in partitions {
            state.paused.remove(&(tp.topic.clone(), tp.partition));
        }
        Ok(())
    }

    fn commit(
        &self,
        offsets: &[TopicPartitionOffset],
        mode: CommitMode,
        opaque: Opaque,
    ) -> Result<(), Error> {
        let mut state = self.state.lock();
        state.commits.push(CommitRecord {
            offsets: offsets.to_vec(),
            mode,
            opaque,
        });
        let error = state.commit_error.take();
        let results: Vec<(TopicPartitionOffset, Option<Error>)> = offsets
            .iter()
            .map(|tpo| (tpo.clone(), error.clone()))
            .collect();
        state
            .events
            .push_back(ClientEvent::OffsetsCommitted { results, opaque });
        Ok(())
    }

    fn store_offsets(&self, offsets: &[TopicPartitionOffset]) -> Result<(), Error> {
        let mut state = self.state.lock();
        if let Some(error) = state.store_error.take() {
            return Err(error);
        }
        state.stored.push(offsets.to_vec());
        Ok(())
    }

    fn assignment(&self) -> Vec<TopicPartition> {
        self.state.lock().assigned.clone()
    }

    fn partition_count(&self, _topic: &str) -> Result<i32, Error> {
        Ok(self.partition_count)
    }

    fn watermarks(&self, tp: &TopicPartition) -> Result<(i64, i64), Error> {
        Ok(self
            .state
            .lock()
            .watermarks
            .get(&tp.partition)
            .copied()
            .unwrap_or((0, 0)))
    }

    fn offsets_for_timestamp(
        &self,
        topic: &str,
        _timestamp_ms: i64,
    ) -> Result<Vec<TopicPartitionOffset>, Error> {
        Ok((0..self.partition_count)
            .map(|p| TopicPartitionOffset::new(topic.to_string(), p, 0))
            .collect())
    }
}

impl std::fmt::Debug for MockConsumerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockConsumerClient")
            .field("partition_count", &self.partition_count)
            .field("undelivered", &self.undelivered())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_producer_acks_fifo_per_partition() {
        let client = MockProducerClient::new(2);
        for i in 0..4u64 {
            let record = ProducerRecord {
                topic: "events".into(),
                partition: Some((i % 2) as i32),
                key: None,
                payload: Some(Bytes::from_static(b"x")),
                headers: Headers::new(),
                opaque: Opaque::new(i),
                delivery_tag: i,
            };
            client.enqueue(record).unwrap();
        }

        let acks = client.poll_acks(Duration::ZERO);
        assert_eq!(acks.len(), 4);
        let p0: Vec<i64> = acks
            .iter()
            .filter(|a| a.topic_partition.partition == 0)
            .map(|a| a.offset)
            .collect();
        assert_eq!(p0, vec![0, 1]);
    }

    #[test]
    fn test_mock_producer_blocked() {
        let client = MockProducerClient::new(1);
        client.block_enqueue(true);
        let record = ProducerRecord {
            topic: "events".into(),
            partition: None,
            key: None,
            payload: None,
            headers: Headers::new(),
            opaque: Opaque::NONE,
            delivery_tag: 1,
        };
        let (error, _returned) = client.enqueue(record).unwrap_err();
        assert_eq!(error.kind(), crate::error::ErrorKind::QueueFull);
    }

    #[test]
    fn test_mock_consumer_poll_drains_events_and_messages() {
        let client = MockConsumerClient::new(2);
        client.push_message(raw_message("events", 0, 0, None, b"a"));
        client.push_message(raw_message("events", 1, 0, None, b"b"));
        client.push_event(ClientEvent::Stats("{}".into()));

        let outcome = client.poll(10, Duration::ZERO).unwrap();
        assert_eq!(outcome.messages.len(), 2);
        assert_eq!(outcome.events.len(), 1);

        let outcome = client.poll(10, Duration::ZERO).unwrap();
        assert!(outcome.messages.is_empty());
    }

    #[test]
    fn test_mock_consumer_commit_emits_event() {
        let client = MockConsumerClient::new(1);
        let offsets = vec![TopicPartitionOffset::new("events", 0, 5)];
        client
            .commit(&offsets, CommitMode::Sync, Opaque::new(1))
            .unwrap();

        assert_eq!(client.commits().len(), 1);
        let outcome = client.poll(10, Duration::ZERO).unwrap();
        assert!(matches!(
            outcome.events.as_slice(),
            [ClientEvent::OffsetsCommitted { .. }]
        ));
    }

    #[test]
    fn test_mock_consumer_scripted_assignment() {
        let client = MockConsumerClient::new(2);
        client.script_assignment(vec![
            TopicPartition::new("events", 0),
            TopicPartition::new("events", 1),
        ]);
        client.subscribe(&["events".to_string()]).unwrap();

        assert_eq!(client.assignment().len(), 2);
        let outcome = client.poll(10, Duration::ZERO).unwrap();
        assert!(matches!(
            outcome.events.as_slice(),
            [ClientEvent::PartitionsAssigned(p)] if p.len() == 2
        ));
    }
}
