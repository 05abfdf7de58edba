//! Polled, partition-ordered consumer pipeline for one topic.
//!
//! A long-lived poll task fetches raw message batches and fans them out
//! onto dispatch queues (`partition mod N`); per-queue workers run the
//! preprocessor, deserialize, invoke the receiver, and advance the
//! offset tracker. The poll task never calls user code directly, and no
//! two messages of one partition are ever in a receiver concurrently.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use fxhash::{FxHashMap, FxHashSet};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::bridge::{CallbackBridge, CommitFollowUp};
use crate::callbacks::{ConsumerCallbacks, PreprocessorAction};
use crate::client::{ClientEvent, CommitMode, ConsumerClient};
use crate::config::{
    ConnectorConfig, ConsumerConfig, OffsetPersistStrategy, PersistExec, PersistMode,
};
use crate::consumer::dispatch::map_partition_to_queue;
use crate::consumer::entry::{ConsumerState, ConsumerTopicEntry};
use crate::error::Error;
use crate::message::{
    DeserializedMessage, HeaderBag, Message, Opaque, TopicPartition, TopicPartitionOffset,
};
use crate::metadata::ConsumerMetadata;
use crate::metrics::ConsumerMetricsSnapshot;
use crate::runtime::{Dispatcher, IoGuard};
use crate::serde::{Deserializer, HeaderSerdeMap};

/// Dispatch channel depth per logical queue.
const QUEUE_DEPTH: usize = 64;
/// Grace period for worker tasks to finish after their channel closes.
const WORKER_JOIN_GRACE: Duration = Duration::from_millis(250);

struct DispatchBatch {
    messages: Vec<Message>,
    _guard: IoGuard,
}

/// Shared state every dispatch worker and the poll task hold.
struct WorkerCtx<K, V> {
    entry: Arc<ConsumerTopicEntry>,
    client: Arc<dyn ConsumerClient>,
    key_deserializer: Arc<dyn Deserializer<K>>,
    value_deserializer: Arc<dyn Deserializer<V>>,
    header_serde: Arc<HeaderSerdeMap>,
    callbacks: ConsumerCallbacks<K, V>,
    dispatcher: Dispatcher,
}

/// Per-topic consumer pipeline.
///
/// Created through [`ConsumerManager`](crate::consumer::ConsumerManager);
/// user code holds it via [`ConsumerHandle`](crate::consumer::ConsumerHandle).
pub struct ConsumerEngine<K, V> {
    entry: Arc<ConsumerTopicEntry>,
    client: Arc<dyn ConsumerClient>,
    ctx: Arc<WorkerCtx<K, V>>,
    dispatcher: Dispatcher,
    poll_handle: Mutex<Option<JoinHandle<()>>>,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
    queue_senders: Mutex<Option<Vec<mpsc::Sender<DispatchBatch>>>>,
}

impl<K: Send + 'static, V: Send + 'static> ConsumerEngine<K, V> {
    pub(crate) fn new(
        config: ConsumerConfig<K, V>,
        connector: ConnectorConfig,
        client: Arc<dyn ConsumerClient>,
        dispatcher: Dispatcher,
    ) -> Self {
        let (topic, _options, tuning, key_deserializer, value_deserializer, header_serde, callbacks) =
            config.into_parts();
        let entry = Arc::new(ConsumerTopicEntry::new(topic, connector, tuning));
        let ctx = Arc::new(WorkerCtx {
            entry: Arc::clone(&entry),
            client: Arc::clone(&client),
            key_deserializer,
            value_deserializer,
            header_serde: Arc::new(header_serde),
            callbacks,
            dispatcher: dispatcher.clone(),
        });
        Self {
            entry,
            client,
            ctx,
            dispatcher,
            poll_handle: Mutex::new(None),
            worker_handles: Mutex::new(Vec::new()),
            queue_senders: Mutex::new(None),
        }
    }

    /// Returns the topic this engine consumes.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.entry.topic
    }

    /// Returns the entry's lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConsumerState {
        self.entry.state()
    }

    fn ensure_started(&self) {
        let mut poll = self.poll_handle.lock();
        if poll.is_some() {
            return;
        }
        let queues = match self.entry.tuning.dispatch_policy {
            crate::config::DispatchPolicy::Serial => 1,
            crate::config::DispatchPolicy::RoundRobin => self.entry.tuning.dispatch_queues,
        };
        let mut senders = Vec::with_capacity(queues);
        let mut handles = self.worker_handles.lock();
        for _ in 0..queues {
            let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
            senders.push(tx);
            handles.push(
                self.dispatcher
                    .spawn_compute(worker_loop(rx, Arc::clone(&self.ctx))),
            );
        }
        *self.queue_senders.lock() = Some(senders.clone());
        *poll = Some(self.dispatcher.spawn_compute(poll_loop(PollCtx {
            worker: Arc::clone(&self.ctx),
            senders,
        })));
    }

    /// Subscribes to the topic with group-managed assignment and starts
    /// the poll task.
    ///
    /// With `pause.on.start` set, the entry comes up paused.
    ///
    /// # Errors
    ///
    /// Returns `Shutdown` after shutdown, or the client's subscription
    /// error.
    pub async fn subscribe(&self) -> Result<(), Error> {
        match self.entry.state() {
            ConsumerState::Terminated => {
                return Err(Error::shutdown(format!(
                    "consumer for '{}' is terminated",
                    self.entry.topic
                )));
            }
            ConsumerState::Subscribed | ConsumerState::Paused => return Ok(()),
            ConsumerState::Unsubscribed => {}
        }
        let client = Arc::clone(&self.client);
        let topics = vec![self.entry.topic.clone()];
        self.dispatcher
            .run_io(move || client.subscribe(&topics))
            .await??;
        self.entry.set_state(ConsumerState::Subscribed);
        self.ensure_started();
        if self.entry.tuning.pause_on_start {
            self.pause().await?;
        }
        debug!(topic = %self.entry.topic, "subscribed");
        Ok(())
    }

    /// Installs an explicit partition/offset assignment and starts the
    /// poll task.
    ///
    /// # Errors
    ///
    /// Returns `Shutdown` after shutdown, or the client's assign error.
    pub async fn assign(&self, partitions: Vec<TopicPartitionOffset>) -> Result<(), Error> {
        if self.entry.state() == ConsumerState::Terminated {
            return Err(Error::shutdown(format!(
                "consumer for '{}' is terminated",
                self.entry.topic
            )));
        }
        let client = Arc::clone(&self.client);
        self.dispatcher
            .run_io(move || client.assign(&partitions))
            .await??;
        self.entry.set_state(ConsumerState::Subscribed);
        self.ensure_started();
        if self.entry.tuning.pause_on_start {
            self.pause().await?;
        }
        Ok(())
    }

    /// Drops the subscription; the poll task idles until the next
    /// subscribe.
    pub async fn unsubscribe(&self) {
        if matches!(
            self.entry.state(),
            ConsumerState::Subscribed | ConsumerState::Paused
        ) {
            let client = Arc::clone(&self.client);
            let _ = self.dispatcher.run_io(move || client.unsubscribe()).await;
            self.entry.set_state(ConsumerState::Unsubscribed);
        }
    }

    /// Pauses fetching for every assigned partition.
    ///
    /// # Errors
    ///
    /// Returns a state error when the entry is not subscribed.
    pub async fn pause(&self) -> Result<(), Error> {
        if self.entry.state() != ConsumerState::Subscribed {
            return Err(Error::configuration(format!(
                "consumer for '{}' is not subscribed",
                self.entry.topic
            )));
        }
        let assignment = self.entry.assigned.lock().clone();
        let client = Arc::clone(&self.client);
        self.dispatcher
            .run_io(move || client.pause(&assignment))
            .await??;
        self.entry.set_state(ConsumerState::Paused);
        Ok(())
    }

    /// Resumes fetching after a pause.
    ///
    /// # Errors
    ///
    /// Returns a state error when the entry is not paused.
    pub async fn resume(&self) -> Result<(), Error> {
        if self.entry.state() != ConsumerState::Paused {
            return Err(Error::configuration(format!(
                "consumer for '{}' is not paused",
                self.entry.topic
            )));
        }
        let assignment = self.entry.assigned.lock().clone();
        let client = Arc::clone(&self.client);
        self.dispatcher
            .run_io(move || client.resume(&assignment))
            .await??;
        self.entry.set_state(ConsumerState::Subscribed);
        Ok(())
    }

    /// Toggles the preprocessor without touching the rest of the
    /// pipeline.
    pub fn set_preprocessing(&self, enable: bool) {
        self.entry.preprocess.store(enable, Ordering::SeqCst);
    }

    /// Commits the given offsets per the entry's persist settings.
    ///
    /// `opaque` is echoed in the commit report.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOffset` when `allow.non.stored.offsets` is off and
    /// an offset was never delivered by this consumer, `Cancelled` while
    /// commits are suspended, `Shutdown` after shutdown, or the client's
    /// submission error.
    pub async fn commit(
        &self,
        offsets: &[TopicPartitionOffset],
        opaque: Opaque,
    ) -> Result<(), Error> {
        if self.entry.is_terminated() {
            return Err(Error::shutdown(format!(
                "consumer for '{}' is terminated",
                self.entry.topic
            )));
        }
        if self.entry.commits_suspended.load(Ordering::SeqCst) {
            return Err(Error::cancelled(
                "offset commits suspended until next assignment",
            ));
        }
        if !self.entry.tuning.offset_persist.allow_non_stored_offsets {
            let tracker = self.entry.offsets.lock();
            for tpo in offsets {
                if !tracker.is_stored(tpo) {
                    return Err(Error::invalid_offset(format!(
                        "offset {} was never delivered by this consumer",
                        tpo
                    ))
                    .with_partition(tpo.topic_partition()));
                }
            }
        }

        match self.entry.tuning.offset_persist.exec {
            PersistExec::Local => {
                persist_offsets(
                    &self.entry,
                    &self.client,
                    &self.dispatcher,
                    &self.ctx.callbacks,
                    offsets.to_vec(),
                    opaque,
                )
                .await
            }
            PersistExec::Coroutine => {
                let entry = Arc::clone(&self.entry);
                let client = Arc::clone(&self.client);
                let dispatcher = self.dispatcher.clone();
                let callbacks = self.ctx.callbacks.clone();
                let offsets = offsets.to_vec();
                self.dispatcher.spawn_compute(async move {
                    if let Err(e) =
                        persist_offsets(&entry, &client, &dispatcher, &callbacks, offsets, opaque)
                            .await
                    {
                        CallbackBridge::report_consumer_error(&entry, &callbacks, &e);
                    }
                });
                Ok(())
            }
        }
    }

    /// Commits a single partition's offset.
    ///
    /// # Errors
    ///
    /// As for [`commit`](Self::commit).
    pub async fn commit_partition(
        &self,
        tpo: TopicPartitionOffset,
        opaque: Opaque,
    ) -> Result<(), Error> {
        self.commit(std::slice::from_ref(&tpo), opaque).await
    }

    /// Returns a point-in-time metadata facade for this topic.
    #[must_use]
    pub fn metadata(&self) -> ConsumerMetadata {
        ConsumerMetadata::new(
            self.entry.topic.clone(),
            Arc::clone(&self.client),
            self.entry.assigned.lock().clone(),
            self.entry.state(),
            self.entry.metrics.snapshot(),
        )
    }

    /// Returns a metrics snapshot.
    #[must_use]
    pub fn metrics(&self) -> ConsumerMetricsSnapshot {
        self.entry.metrics.snapshot()
    }

    /// Drains in-flight work and terminates the entry.
    ///
    /// Waits up to the connector's `shutdown_io_wait_timeout` for
    /// receivers to finish, then cancels them. After this returns, no
    /// user callback is invoked for this topic.
    ///
    /// # Errors
    ///
    /// Currently infallible; the signature leaves room for drain errors.
    pub async fn shutdown(&self) -> Result<(), Error> {
        if self.entry.state() == ConsumerState::Terminated {
            return Ok(());
        }
        self.entry.terminated.store(true, Ordering::SeqCst);

        // Stop the poll task; it re-checks the flag at least once per
        // poll timeout.
        let poll = self.poll_handle.lock().take();
        if let Some(mut handle) = poll {
            let grace = self.entry.tuning.poll_timeout
                + self.entry.connector.poll_interval
                + Duration::from_millis(250);
            if tokio::time::timeout(grace, &mut handle).await.is_err() {
                handle.abort();
            }
        }

        // Close the dispatch channels and drain in-flight work.
        drop(self.queue_senders.lock().take());
        let io_wait = self.entry.connector.shutdown_io_wait_timeout;
        let drained = self.entry.io_tracker.wait_idle(io_wait).await;
        if !drained {
            warn!(topic = %self.entry.topic, "in-flight receivers exceeded the drain timeout");
        }

        // Persist final progress, best effort.
        if self.entry.tuning.auto_offset_persist {
            let commit_list = self.entry.offsets.lock().to_commit_list();
            if !commit_list.is_empty() {
                if let Err(e) = persist_offsets(
                    &self.entry,
                    &self.client,
                    &self.dispatcher,
                    &self.ctx.callbacks,
                    commit_list,
                    Opaque::NONE,
                )
                .await
                {
                    warn!(topic = %self.entry.topic, error = %e, "final offset persist failed");
                }
            }
        }

        let workers = std::mem::take(&mut *self.worker_handles.lock());
        for mut handle in workers {
            if !drained {
                handle.abort();
                continue;
            }
            if tokio::time::timeout(WORKER_JOIN_GRACE, &mut handle)
                .await
                .is_err()
            {
                handle.abort();
            }
        }

        let client = Arc::clone(&self.client);
        let _ = self.dispatcher.run_io(move || client.unsubscribe()).await;
        self.entry.set_state(ConsumerState::Terminated);
        debug!(topic = %self.entry.topic, "consumer engine shut down");
        Ok(())
    }
}

impl<K, V> std::fmt::Debug for ConsumerEngine<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerEngine")
            .field("topic", &self.entry.topic)
            .field("state", &self.entry.state())
            .field("in_flight", &self.entry.io_tracker.in_flight())
            .finish_non_exhaustive()
    }
}

pub(crate) fn build_engine<K: Send + 'static, V: Send + 'static>(
    config: ConsumerConfig<K, V>,
    connector: ConnectorConfig,
    client: Arc<dyn ConsumerClient>,
    dispatcher: Dispatcher,
) -> Result<ConsumerEngine<K, V>, Error> {
    config.validate()?;
    Ok(ConsumerEngine::new(config, connector, client, dispatcher))
}

/// Issues one offset persist per the entry's settings.
///
/// The broker `Commit` strategy reports completion through the client's
/// commit events; the local `Store` strategy has no broker completion
/// event, so its commit report is synthesized here. Either way the
/// `OffsetCommitCallback` fires for both strategies.
async fn persist_offsets<K, V>(
    entry: &Arc<ConsumerTopicEntry>,
    client: &Arc<dyn ConsumerClient>,
    dispatcher: &Dispatcher,
    callbacks: &ConsumerCallbacks<K, V>,
    offsets: Vec<TopicPartitionOffset>,
    opaque: Opaque,
) -> Result<(), Error> {
    if offsets.is_empty() {
        return Ok(());
    }
    if entry.commits_suspended.load(Ordering::SeqCst) {
        return Err(Error::cancelled(
            "offset commits suspended until next assignment",
        ));
    }
    entry.metrics.record_commit();
    let settings = entry.tuning.offset_persist;
    match settings.strategy {
        OffsetPersistStrategy::Commit => {
            let mode = match settings.mode {
                PersistMode::Sync => CommitMode::Sync,
                PersistMode::Async => CommitMode::Async,
            };
            let client = Arc::clone(client);
            dispatcher
                .run_io(move || client.commit(&offsets, mode, opaque))
                .await?
        }
        OffsetPersistStrategy::Store => {
            let store_client = Arc::clone(client);
            let to_store = offsets.clone();
            let mut stored = dispatcher
                .run_io(move || store_client.store_offsets(&to_store))
                .await?;

            let results = store_results(&offsets, stored.as_ref().err());
            if CallbackBridge::on_offsets_committed(entry, callbacks, &results, opaque)
                == CommitFollowUp::Retry
            {
                let store_client = Arc::clone(client);
                let to_store = offsets.clone();
                stored = dispatcher
                    .run_io(move || store_client.store_offsets(&to_store))
                    .await?;
                let results = store_results(&offsets, stored.as_ref().err());
                let _ = CallbackBridge::on_offsets_committed(entry, callbacks, &results, opaque);
            }
            stored
        }
    }
}

fn store_results(
    offsets: &[TopicPartitionOffset],
    error: Option<&Error>,
) -> Vec<(TopicPartitionOffset, Option<Error>)> {
    offsets
        .iter()
        .map(|tpo| (tpo.clone(), error.cloned()))
        .collect()
}

struct PollCtx<K, V> {
    worker: Arc<WorkerCtx<K, V>>,
    senders: Vec<mpsc::Sender<DispatchBatch>>,
}

async fn poll_loop<K: Send + 'static, V: Send + 'static>(ctx: PollCtx<K, V>) {
    let entry = Arc::clone(&ctx.worker.entry);
    let idle = entry.connector.poll_interval;
    debug!(topic = %entry.topic, "poll task started");

    loop {
        if entry.is_terminated() || ctx.worker.dispatcher.is_interrupted() {
            break;
        }
        let state = entry.state();
        if !matches!(state, ConsumerState::Subscribed) {
            tokio::time::sleep(idle).await;
            continue;
        }
        if entry.throttle.is_auto() {
            if let Some(remaining) = entry.throttle.pause_remaining(Instant::now()) {
                tokio::time::sleep(remaining.min(idle)).await;
                continue;
            }
        }

        let client = Arc::clone(&ctx.worker.client);
        let read_size = entry.tuning.read_size;
        let poll_timeout = entry.tuning.poll_timeout;
        let outcome = match ctx
            .worker
            .dispatcher
            .run_io(move || client.poll(read_size, poll_timeout))
            .await
        {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                CallbackBridge::report_consumer_error(&entry, &ctx.worker.callbacks, &e);
                tokio::time::sleep(idle).await;
                continue;
            }
            Err(_) => break,
        };

        for event in &outcome.events {
            handle_event(&ctx, event).await;
        }
        if outcome.messages.is_empty() {
            continue;
        }

        // Fan out by queue; the partition→queue map only changes here,
        // between poll batches.
        let mut grouped: FxHashMap<usize, Vec<Message>> = FxHashMap::default();
        let mut bytes: u64 = 0;
        let count = outcome.messages.len() as u64;
        {
            let mut queue_map = entry.queue_map.lock();
            for message in outcome.messages {
                bytes += message.payload_len() as u64;
                let queue = *queue_map.entry(message.partition).or_insert_with(|| {
                    map_partition_to_queue(
                        message.partition,
                        entry.tuning.dispatch_policy,
                        ctx.senders.len(),
                    )
                });
                grouped.entry(queue).or_default().push(message);
            }
        }
        entry.metrics.record_poll(count, bytes);

        let mut queues: Vec<usize> = grouped.keys().copied().collect();
        queues.sort_unstable();
        for queue in queues {
            let Some(messages) = grouped.remove(&queue) else {
                continue;
            };
            let batch = DispatchBatch {
                messages,
                _guard: entry.io_tracker.guard(),
            };
            if ctx.senders[queue].send(batch).await.is_err() {
                return;
            }
        }
    }
    debug!(topic = %entry.topic, "poll task stopped");
}

async fn handle_event<K: Send + 'static, V: Send + 'static>(
    ctx: &PollCtx<K, V>,
    event: &ClientEvent,
) {
    let entry = &ctx.worker.entry;
    match event {
        ClientEvent::PartitionsAssigned(partitions) => {
            entry.assigned.lock().clone_from(partitions);
            {
                let mut queue_map = entry.queue_map.lock();
                queue_map.clear();
                for tp in partitions {
                    queue_map.insert(
                        tp.partition,
                        map_partition_to_queue(
                            tp.partition,
                            entry.tuning.dispatch_policy,
                            ctx.senders.len(),
                        ),
                    );
                }
            }
            {
                let mut revoked = entry.revoked.lock();
                for tp in partitions {
                    revoked.remove(&tp.partition);
                }
            }
            entry.commits_suspended.store(false, Ordering::SeqCst);
            entry.metrics.record_rebalance();
            if !entry.is_terminated() {
                if let Some(cb) = &ctx.worker.callbacks.assignment {
                    cb(partitions);
                }
            }
        }
        ClientEvent::PartitionsRevoked(partitions) => {
            revoke_partitions(ctx, partitions).await;
        }
        ClientEvent::RebalanceError(e) => {
            entry.metrics.record_rebalance();
            if let Some(cb) = &ctx.worker.callbacks.rebalance_error {
                cb(e);
            } else {
                CallbackBridge::report_consumer_error(entry, &ctx.worker.callbacks, e);
            }
        }
        other => {
            let follow_up =
                CallbackBridge::on_consumer_event(entry, &ctx.worker.callbacks, other);
            if follow_up == CommitFollowUp::Retry {
                if let ClientEvent::OffsetsCommitted { results, opaque } = other {
                    let offsets: Vec<TopicPartitionOffset> =
                        results.iter().map(|(tpo, _)| tpo.clone()).collect();
                    if let Err(e) = persist_offsets(
                        entry,
                        &ctx.worker.client,
                        &ctx.worker.dispatcher,
                        &ctx.worker.callbacks,
                        offsets,
                        *opaque,
                    )
                    .await
                    {
                        CallbackBridge::report_consumer_error(
                            entry,
                            &ctx.worker.callbacks,
                            &e,
                        );
                    }
                }
            }
        }
    }
}

/// Revocation: stop new dispatch for the partitions, drain in-flight
/// work, commit completed progress, then notify the user.
async fn revoke_partitions<K: Send + 'static, V: Send + 'static>(
    ctx: &PollCtx<K, V>,
    partitions: &[TopicPartition],
) {
    let entry = &ctx.worker.entry;
    {
        let mut revoked = entry.revoked.lock();
        for tp in partitions {
            revoked.insert(tp.partition);
        }
    }

    let io_wait = entry.connector.shutdown_io_wait_timeout;
    if !entry.io_tracker.wait_idle(io_wait).await {
        warn!(
            topic = %entry.topic,
            "in-flight receivers exceeded the revocation drain timeout"
        );
    }

    let pairs: Vec<(String, i32)> = partitions
        .iter()
        .map(|tp| (tp.topic.clone(), tp.partition))
        .collect();
    let commit_list = entry.offsets.lock().commit_list_for(&pairs);
    if !commit_list.is_empty() {
        if let Err(e) = persist_offsets(
            entry,
            &ctx.worker.client,
            &ctx.worker.dispatcher,
            &ctx.worker.callbacks,
            commit_list,
            Opaque::NONE,
        )
        .await
        {
            CallbackBridge::report_consumer_error(entry, &ctx.worker.callbacks, &e);
        }
    }
    {
        let mut tracker = entry.offsets.lock();
        for (topic, partition) in &pairs {
            tracker.remove(topic, *partition);
        }
    }
    entry
        .assigned
        .lock()
        .retain(|tp| !partitions.contains(tp));
    entry.metrics.record_rebalance();

    if !entry.is_terminated() {
        if let Some(cb) = &ctx.worker.callbacks.revocation {
            cb(partitions);
        }
    }
}

async fn worker_loop<K: Send + 'static, V: Send + 'static>(
    mut rx: mpsc::Receiver<DispatchBatch>,
    ctx: Arc<WorkerCtx<K, V>>,
) {
    while let Some(batch) = rx.recv().await {
        process_batch(&ctx, batch).await;
    }
}

async fn process_batch<K: Send + 'static, V: Send + 'static>(
    ctx: &Arc<WorkerCtx<K, V>>,
    batch: DispatchBatch,
) {
    let entry = &ctx.entry;
    let batch_mode = ctx.callbacks.batch_receiver.is_some();
    let chunk = if entry.tuning.batch_size == 0 {
        usize::MAX
    } else {
        entry.tuning.batch_size
    };

    let mut pending_batch: Vec<DeserializedMessage<K, V>> = Vec::new();
    let mut advanced: FxHashSet<(String, i32)> = FxHashSet::default();

    for message in batch.messages {
        if entry.is_terminated() || ctx.dispatcher.is_interrupted() {
            pending_batch.clear();
            break;
        }
        if entry.is_revoked(message.partition) {
            // Undispatched message of a revoked partition: no receiver,
            // no offset progress.
            continue;
        }

        if entry.preprocess.load(Ordering::SeqCst) {
            if let Some(preprocessor) = &ctx.callbacks.preprocessor {
                if preprocessor(&message) == PreprocessorAction::Drop {
                    entry.metrics.record_drop();
                    advanced.insert((message.topic.clone(), message.partition));
                    entry
                        .offsets
                        .lock()
                        .update(&message.topic, message.partition, message.offset);
                    continue;
                }
            }
        }

        let deserialized = deserialize_message(ctx, message);
        if deserialized.error.is_some() {
            entry.metrics.record_deserialize_failure();
        }

        if batch_mode {
            pending_batch.push(deserialized);
            if pending_batch.len() >= chunk {
                deliver_batch(ctx, &mut pending_batch, &mut advanced);
            }
        } else if let Some(receiver) = &ctx.callbacks.receiver {
            let tpo = deserialized.topic_partition_offset();
            receiver(deserialized);
            entry.metrics.record_dispatch();
            advanced.insert((tpo.topic.clone(), tpo.partition));
            entry
                .offsets
                .lock()
                .update(&tpo.topic, tpo.partition, tpo.offset);
        }
    }
    if batch_mode && !pending_batch.is_empty() && !entry.is_terminated() {
        deliver_batch(ctx, &mut pending_batch, &mut advanced);
    }

    if entry.tuning.auto_offset_persist && !advanced.is_empty() && !entry.is_terminated() {
        let pairs: Vec<(String, i32)> = advanced.into_iter().collect();
        let commit_list = entry.offsets.lock().commit_list_for(&pairs);
        if let Err(e) = persist_offsets(
            entry,
            &ctx.client,
            &ctx.dispatcher,
            &ctx.callbacks,
            commit_list,
            Opaque::NONE,
        )
        .await
        {
            CallbackBridge::report_consumer_error(entry, &ctx.callbacks, &e);
        }
    }
}

fn deliver_batch<K, V>(
    ctx: &Arc<WorkerCtx<K, V>>,
    pending: &mut Vec<DeserializedMessage<K, V>>,
    advanced: &mut FxHashSet<(String, i32)>,
) {
    let Some(receiver) = &ctx.callbacks.batch_receiver else {
        return;
    };
    let batch = std::mem::take(pending);
    let offsets: Vec<TopicPartitionOffset> = batch
        .iter()
        .map(DeserializedMessage::topic_partition_offset)
        .collect();
    let delivered = batch.len() as u64;
    receiver(batch);
    ctx.entry
        .metrics
        .records_dispatched
        .fetch_add(delivered, Ordering::Relaxed);

    let mut tracker = ctx.entry.offsets.lock();
    for tpo in offsets {
        advanced.insert((tpo.topic.clone(), tpo.partition));
        tracker.update(&tpo.topic, tpo.partition, tpo.offset);
    }
}

/// Applies the deserialization failure policy: a failed key or value
/// still delivers the message with `error` set; headers follow
/// `skip.unknown.headers`.
fn deserialize_message<K, V>(ctx: &Arc<WorkerCtx<K, V>>, message: Message) -> DeserializedMessage<K, V> {
    let mut error = message.error.clone();
    let mut key = None;
    let mut value = None;
    let mut headers = HeaderBag::new();

    if error.is_none() {
        if let Some(raw_key) = &message.key {
            match ctx.key_deserializer.deserialize(raw_key) {
                Ok(k) => key = Some(k),
                Err(e) => error = Some(e),
            }
        }
        if let Some(raw_value) = &message.payload {
            match ctx.value_deserializer.deserialize(raw_value) {
                Ok(v) => value = Some(v),
                Err(e) => {
                    if error.is_none() {
                        error = Some(e);
                    }
                }
            }
        }
        let skip_unknown = ctx.entry.tuning.skip_unknown_headers;
        for (name, raw) in message.headers.iter() {
            match ctx.header_serde.deserializer(name) {
                Some(deserializer) => match deserializer.deserialize(raw) {
                    Ok(v) => headers.insert_boxed(name, v),
                    Err(e) if skip_unknown => {
                        debug!(
                            topic = %message.topic,
                            header = name,
                            error = %e,
                            "skipping undecodable header"
                        );
                    }
                    Err(e) => {
                        if error.is_none() {
                            error = Some(e);
                        }
                    }
                },
                None if skip_unknown => {}
                None => {
                    if error.is_none() {
                        error = Some(Error::deserialization(format!(
                            "no deserializer registered for header '{name}'"
                        )));
                    }
                }
            }
        }
    }

    DeserializedMessage {
        topic: message.topic,
        partition: message.partition,
        offset: message.offset,
        timestamp_ms: message.timestamp_ms,
        key,
        value,
        headers,
        error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConsumerConfig, TopicOptions};
    use crate::serde::{BytesSerde, StringSerde};
    use crate::testing::{raw_message, MockConsumerClient};
    use bytes::Bytes;
    use parking_lot::Mutex as PlMutex;

    type Seen = Arc<PlMutex<Vec<(i32, i64)>>>;

    fn connector() -> ConnectorConfig {
        ConnectorConfig {
            shutdown_io_wait_timeout: Duration::from_millis(2000),
            poll_interval: Duration::from_millis(5),
        }
    }

    fn options(pairs: &[(&str, &str)]) -> TopicOptions {
        let mut options = TopicOptions::new();
        options.set("internal.consumer.poll.timeout.ms", "10");
        for (k, v) in pairs {
            options.set(*k, *v);
        }
        options
    }

    fn string_config(
        options: TopicOptions,
        configure: impl FnOnce(&mut ConsumerConfig<String, String>),
    ) -> ConsumerConfig<String, String> {
        let mut config = ConsumerConfig::new("events")
            .with_options(options)
            .unwrap()
            .key_deserializer(Arc::new(StringSerde::new()))
            .value_deserializer(Arc::new(StringSerde::new()));
        configure(&mut config);
        config
    }

    fn engine_with(
        options: TopicOptions,
        client: Arc<MockConsumerClient>,
        configure: impl FnOnce(&mut ConsumerConfig<String, String>),
    ) -> ConsumerEngine<String, String> {
        build_engine(
            string_config(options, configure),
            connector(),
            client as Arc<dyn ConsumerClient>,
            Dispatcher::new(),
        )
        .unwrap()
    }

    fn recording_receiver(seen: &Seen) -> crate::callbacks::ReceiverCallback<String, String> {
        let sink = Arc::clone(seen);
        Arc::new(move |message: DeserializedMessage<String, String>| {
            sink.lock().push((message.partition, message.offset));
        })
    }

    async fn wait_for<F: Fn() -> bool>(cond: F, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cond()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_serial_dispatch_preserves_arrival_order() {
        let client = Arc::new(MockConsumerClient::new(2));
        let seen: Seen = Arc::new(PlMutex::new(Vec::new()));
        let engine = engine_with(options(&[]), Arc::clone(&client), |config| {
            config.callbacks_mut().receiver = Some(recording_receiver(&seen));
        });

        for offset in 0..5 {
            client.push_message(raw_message("events", 0, offset, None, b"a"));
            client.push_message(raw_message("events", 1, offset, None, b"b"));
        }
        engine.subscribe().await.unwrap();

        assert!(wait_for(|| seen.lock().len() == 10, Duration::from_secs(3)).await);
        let seen = seen.lock().clone();
        for partition in [0, 1] {
            let offsets: Vec<i64> = seen
                .iter()
                .filter(|(p, _)| *p == partition)
                .map(|(_, o)| *o)
                .collect();
            assert_eq!(offsets, vec![0, 1, 2, 3, 4]);
        }
        engine.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_round_robin_keeps_per_partition_offsets_monotonic() {
        let client = Arc::new(MockConsumerClient::new(8));
        let seen: Seen = Arc::new(PlMutex::new(Vec::new()));
        let opts = options(&[
            ("internal.consumer.dispatch.policy", "round-robin"),
            ("internal.consumer.dispatch.queues", "4"),
        ]);
        let engine = engine_with(opts, Arc::clone(&client), |config| {
            let sink = Arc::clone(&seen);
            config.callbacks_mut().receiver = Some(Arc::new(
                move |message: DeserializedMessage<String, String>| {
                    // Skewed processing time to shake out ordering bugs.
                    std::thread::sleep(Duration::from_millis(
                        (message.offset % 7) as u64,
                    ));
                    sink.lock().push((message.partition, message.offset));
                },
            ));
        });

        let total = 8 * 6;
        for offset in 0..6 {
            for partition in 0..8 {
                client.push_message(raw_message("events", partition, offset, None, b"x"));
            }
        }
        engine.subscribe().await.unwrap();

        assert!(wait_for(|| seen.lock().len() == total, Duration::from_secs(5)).await);
        let seen = seen.lock().clone();
        for partition in 0..8 {
            let offsets: Vec<i64> = seen
                .iter()
                .filter(|(p, _)| *p == partition)
                .map(|(_, o)| *o)
                .collect();
            assert!(
                offsets.windows(2).all(|w| w[0] < w[1]),
                "partition {partition} offsets out of order: {offsets:?}"
            );
        }
        engine.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_preprocessor_drops_still_counted_for_commit() {
        let client = Arc::new(MockConsumerClient::new(1));
        let seen: Seen = Arc::new(PlMutex::new(Vec::new()));
        let opts = options(&[("internal.consumer.preprocess.messages", "true")]);
        let engine = engine_with(opts, Arc::clone(&client), |config| {
            config.callbacks_mut().receiver = Some(recording_receiver(&seen));
            config.callbacks_mut().preprocessor = Some(Arc::new(|message: &Message| {
                if message.offset % 2 == 1 {
                    PreprocessorAction::Drop
                } else {
                    PreprocessorAction::Keep
                }
            }));
        });

        for offset in 0..4 {
            client.push_message(raw_message("events", 0, offset, None, b"x"));
        }
        engine.subscribe().await.unwrap();

        assert!(wait_for(|| seen.lock().len() == 2, Duration::from_secs(3)).await);
        // Dropped offsets still advance the commit position.
        assert!(
            wait_for(
                || {
                    client
                        .commits()
                        .iter()
                        .flat_map(|c| c.offsets.clone())
                        .any(|tpo| tpo.partition == 0 && tpo.offset == 4)
                },
                Duration::from_secs(3)
            )
            .await,
            "expected a commit at offset 4, got {:?}",
            client.commits()
        );
        let delivered: Vec<i64> = seen.lock().iter().map(|(_, o)| *o).collect();
        assert_eq!(delivered, vec![0, 2]);
        engine.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_value_deserialization_failure_still_delivers() {
        let client = Arc::new(MockConsumerClient::new(1));
        let errors: Arc<PlMutex<Vec<bool>>> = Arc::new(PlMutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        let engine = engine_with(options(&[]), Arc::clone(&client), |config| {
            config.callbacks_mut().receiver = Some(Arc::new(
                move |message: DeserializedMessage<String, String>| {
                    sink.lock().push(message.has_error());
                },
            ));
        });

        client.push_message(raw_message("events", 0, 0, None, &[0xff, 0xfe]));
        client.push_message(raw_message("events", 0, 1, None, b"fine"));
        engine.subscribe().await.unwrap();

        assert!(wait_for(|| errors.lock().len() == 2, Duration::from_secs(3)).await);
        assert_eq!(errors.lock().clone(), vec![true, false]);
        assert_eq!(engine.metrics().deserialize_failures, 1);
        engine.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_commit_rejects_non_stored_offset() {
        let client = Arc::new(MockConsumerClient::new(1));
        let seen: Seen = Arc::new(PlMutex::new(Vec::new()));
        let opts = options(&[("internal.consumer.auto.offset.persist", "false")]);
        let engine = engine_with(opts, Arc::clone(&client), |config| {
            config.callbacks_mut().receiver = Some(recording_receiver(&seen));
        });

        client.push_message(raw_message("events", 0, 0, None, b"x"));
        engine.subscribe().await.unwrap();
        assert!(wait_for(|| seen.lock().len() == 1, Duration::from_secs(3)).await);

        let err = engine
            .commit(
                &[TopicPartitionOffset::new("events", 0, 50)],
                Opaque::NONE,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidOffset);
        assert!(err.partition().is_some());

        // The delivered offset commits fine, twice.
        let tpo = TopicPartitionOffset::new("events", 0, 1);
        engine.commit(&[tpo.clone()], Opaque::new(1)).await.unwrap();
        engine.commit(&[tpo], Opaque::new(2)).await.unwrap();
        assert_eq!(client.commits().len(), 2);
        engine.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_commit_callback_gets_opaque() {
        let client = Arc::new(MockConsumerClient::new(1));
        let seen: Seen = Arc::new(PlMutex::new(Vec::new()));
        let reported: Arc<PlMutex<Vec<u64>>> = Arc::new(PlMutex::new(Vec::new()));
        let sink = Arc::clone(&reported);
        let engine = engine_with(
            options(&[("internal.consumer.auto.offset.persist", "false")]),
            Arc::clone(&client),
            |config| {
                config.callbacks_mut().receiver = Some(recording_receiver(&seen));
                config.callbacks_mut().offset_commit =
                    Some(Arc::new(move |report: &crate::callbacks::CommitReport| {
                        sink.lock().push(report.opaque.value());
                    }));
            },
        );

        client.push_message(raw_message("events", 0, 0, None, b"x"));
        engine.subscribe().await.unwrap();
        assert!(wait_for(|| seen.lock().len() == 1, Duration::from_secs(3)).await);

        engine
            .commit(
                &[TopicPartitionOffset::new("events", 0, 1)],
                Opaque::new(0xabad_cafe),
            )
            .await
            .unwrap();

        assert!(
            wait_for(
                || reported.lock().contains(&0xabad_cafe),
                Duration::from_secs(3)
            )
            .await,
            "commit report with the caller's opaque never arrived"
        );
        engine.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_failed_commit_suspends_until_next_assignment() {
        let client = Arc::new(MockConsumerClient::new(1));
        let seen: Seen = Arc::new(PlMutex::new(Vec::new()));
        let opts = options(&[
            ("internal.consumer.auto.offset.persist", "false"),
            ("internal.consumer.allow.non.stored.offsets", "true"),
        ]);
        let engine = engine_with(opts, Arc::clone(&client), |config| {
            config.callbacks_mut().receiver = Some(recording_receiver(&seen));
            config.callbacks_mut().offset_commit_error = Some(Arc::new(|_e: &Error| false));
        });

        engine.subscribe().await.unwrap();
        client.set_commit_error(Error::broker(27, "REBALANCE_IN_PROGRESS"));
        engine
            .commit(&[TopicPartitionOffset::new("events", 0, 1)], Opaque::NONE)
            .await
            .unwrap();

        // The failure event reaches the poll task, which suspends
        // committing.
        assert!(
            wait_for(
                || {
                    futures_commit_suspended(&engine)
                },
                Duration::from_secs(3)
            )
            .await
        );
        let err = engine
            .commit(&[TopicPartitionOffset::new("events", 0, 1)], Opaque::NONE)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Cancelled);

        // A fresh assignment clears the suspension.
        client.push_event(ClientEvent::PartitionsAssigned(vec![TopicPartition::new(
            "events", 0,
        )]));
        assert!(
            wait_for(|| !futures_commit_suspended(&engine), Duration::from_secs(3)).await
        );
        engine.shutdown().await.unwrap();
    }

    fn futures_commit_suspended(engine: &ConsumerEngine<String, String>) -> bool {
        engine.entry.commits_suspended.load(Ordering::SeqCst)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_store_strategy_reports_through_commit_callback() {
        let client = Arc::new(MockConsumerClient::new(1));
        let seen: Seen = Arc::new(PlMutex::new(Vec::new()));
        let reported: Arc<PlMutex<Vec<u64>>> = Arc::new(PlMutex::new(Vec::new()));
        let sink = Arc::clone(&reported);
        let opts = options(&[
            ("internal.consumer.offset.persist.strategy", "store"),
            ("internal.consumer.auto.offset.persist", "false"),
        ]);
        let engine = engine_with(opts, Arc::clone(&client), |config| {
            config.callbacks_mut().receiver = Some(recording_receiver(&seen));
            config.callbacks_mut().offset_commit =
                Some(Arc::new(move |report: &crate::callbacks::CommitReport| {
                    assert!(report.success());
                    sink.lock().push(report.opaque.value());
                }));
        });

        client.push_message(raw_message("events", 0, 0, None, b"x"));
        engine.subscribe().await.unwrap();
        assert!(wait_for(|| seen.lock().len() == 1, Duration::from_secs(3)).await);

        engine
            .commit(
                &[TopicPartitionOffset::new("events", 0, 1)],
                Opaque::new(0x51ed),
            )
            .await
            .unwrap();

        // The local store has no broker completion event; the engine
        // synthesizes the report, so the callback has already fired.
        assert_eq!(reported.lock().clone(), vec![0x51ed]);
        assert_eq!(client.stored().len(), 1);
        assert!(client.commits().is_empty());
        engine.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_failed_store_suspends_commits() {
        let client = Arc::new(MockConsumerClient::new(1));
        let seen: Seen = Arc::new(PlMutex::new(Vec::new()));
        let opts = options(&[
            ("internal.consumer.offset.persist.strategy", "store"),
            ("internal.consumer.auto.offset.persist", "false"),
            ("internal.consumer.allow.non.stored.offsets", "true"),
        ]);
        let engine = engine_with(opts, Arc::clone(&client), |config| {
            config.callbacks_mut().receiver = Some(recording_receiver(&seen));
            config.callbacks_mut().offset_commit_error = Some(Arc::new(|_e: &Error| false));
        });

        engine.subscribe().await.unwrap();
        client.set_store_error(Error::broker(-1, "offset store rejected"));
        let result = engine
            .commit(&[TopicPartitionOffset::new("events", 0, 1)], Opaque::NONE)
            .await;
        assert!(result.is_err());
        assert!(futures_commit_suspended(&engine));

        let err = engine
            .commit(&[TopicPartitionOffset::new("events", 0, 1)], Opaque::NONE)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Cancelled);
        engine.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_revocation_skips_undispatched_and_commits_completed() {
        let client = Arc::new(MockConsumerClient::new(2));
        let seen: Seen = Arc::new(PlMutex::new(Vec::new()));
        let engine = engine_with(options(&[]), Arc::clone(&client), |config| {
            config.callbacks_mut().receiver = Some(recording_receiver(&seen));
        });

        // First poll cycle: deliver a few records on both partitions.
        client.push_message(raw_message("events", 0, 0, None, b"x"));
        client.push_message(raw_message("events", 1, 0, None, b"x"));
        client.push_message(raw_message("events", 1, 1, None, b"x"));
        engine.subscribe().await.unwrap();
        assert!(wait_for(|| seen.lock().len() == 3, Duration::from_secs(3)).await);

        // Second cycle: revoke partition 1 with 50 undispatched messages
        // behind the event.
        client.push_event(ClientEvent::PartitionsRevoked(vec![TopicPartition::new(
            "events", 1,
        )]));
        for offset in 2..52 {
            client.push_message(raw_message("events", 1, offset, None, b"x"));
        }
        client.push_message(raw_message("events", 0, 1, None, b"x"));

        assert!(
            wait_for(
                || seen.lock().iter().any(|(p, o)| *p == 0 && *o == 1),
                Duration::from_secs(3)
            )
            .await
        );
        tokio::time::sleep(Duration::from_millis(100)).await;

        // No receiver invocation for revoked, undispatched messages.
        let partition1: Vec<i64> = seen
            .lock()
            .iter()
            .filter(|(p, _)| *p == 1)
            .map(|(_, o)| *o)
            .collect();
        assert_eq!(partition1, vec![0, 1]);

        // The revocation commit covers exactly the completed receivers.
        let revocation_commits: Vec<TopicPartitionOffset> = client
            .commits()
            .iter()
            .flat_map(|c| c.offsets.clone())
            .filter(|tpo| tpo.partition == 1)
            .collect();
        assert!(
            revocation_commits
                .iter()
                .all(|tpo| tpo.offset <= 2),
            "commit beyond completed work: {revocation_commits:?}"
        );
        assert!(revocation_commits.iter().any(|tpo| tpo.offset == 2));
        engine.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_shutdown_bounds_wait_and_silences_callbacks() {
        let client = Arc::new(MockConsumerClient::new(1));
        let seen: Seen = Arc::new(PlMutex::new(Vec::new()));
        let config = string_config(options(&[]), |config| {
            let sink = Arc::clone(&seen);
            config.callbacks_mut().receiver = Some(Arc::new(
                move |message: DeserializedMessage<String, String>| {
                    sink.lock().push((message.partition, message.offset));
                    // Runs ~3× the drain timeout below.
                    std::thread::sleep(Duration::from_millis(600));
                },
            ));
        });
        let engine = build_engine(
            config,
            ConnectorConfig {
                shutdown_io_wait_timeout: Duration::from_millis(200),
                poll_interval: Duration::from_millis(5),
            },
            Arc::clone(&client) as Arc<dyn ConsumerClient>,
            Dispatcher::new(),
        )
        .unwrap();

        for offset in 0..3 {
            client.push_message(raw_message("events", 0, offset, None, b"x"));
        }
        engine.subscribe().await.unwrap();
        assert!(wait_for(|| !seen.lock().is_empty(), Duration::from_secs(3)).await);

        let start = Instant::now();
        engine.shutdown().await.unwrap();
        let elapsed = start.elapsed();
        assert!(
            elapsed < Duration::from_millis(1500),
            "shutdown took {elapsed:?}"
        );
        assert_eq!(engine.state(), ConsumerState::Terminated);

        // The in-flight receiver may still be sleeping, but no further
        // invocation happens.
        let count = seen.lock().len();
        tokio::time::sleep(Duration::from_millis(700)).await;
        assert_eq!(seen.lock().len(), count, "receiver invoked after shutdown");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_state_machine_transitions() {
        let client = Arc::new(MockConsumerClient::new(1));
        let seen: Seen = Arc::new(PlMutex::new(Vec::new()));
        let engine = engine_with(options(&[]), Arc::clone(&client), |config| {
            config.callbacks_mut().receiver = Some(recording_receiver(&seen));
        });

        assert_eq!(engine.state(), ConsumerState::Unsubscribed);
        engine.subscribe().await.unwrap();
        assert_eq!(engine.state(), ConsumerState::Subscribed);
        engine.pause().await.unwrap();
        assert_eq!(engine.state(), ConsumerState::Paused);
        assert!(engine.pause().await.is_err());
        engine.resume().await.unwrap();
        assert_eq!(engine.state(), ConsumerState::Subscribed);
        engine.unsubscribe().await;
        assert_eq!(engine.state(), ConsumerState::Unsubscribed);
        engine.shutdown().await.unwrap();
        assert_eq!(engine.state(), ConsumerState::Terminated);
        assert!(engine.subscribe().await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_paused_entry_does_not_deliver() {
        let client = Arc::new(MockConsumerClient::new(1));
        let seen: Seen = Arc::new(PlMutex::new(Vec::new()));
        let opts = options(&[("internal.consumer.pause.on.start", "true")]);
        let engine = engine_with(opts, Arc::clone(&client), |config| {
            config.callbacks_mut().receiver = Some(recording_receiver(&seen));
        });

        client.push_message(raw_message("events", 0, 0, None, b"x"));
        engine.subscribe().await.unwrap();
        assert_eq!(engine.state(), ConsumerState::Paused);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(seen.lock().is_empty());

        engine.resume().await.unwrap();
        assert!(wait_for(|| seen.lock().len() == 1, Duration::from_secs(3)).await);
        engine.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_batch_receiver_delivers_in_chunks() {
        let client = Arc::new(MockConsumerClient::new(1));
        let batches: Arc<PlMutex<Vec<usize>>> = Arc::new(PlMutex::new(Vec::new()));
        let flat: Seen = Arc::new(PlMutex::new(Vec::new()));
        let opts = options(&[("internal.consumer.batch.size", "4")]);

        let batches_sink = Arc::clone(&batches);
        let flat_sink = Arc::clone(&flat);
        let engine = engine_with(opts, Arc::clone(&client), |config| {
            config.callbacks_mut().batch_receiver = Some(Arc::new(
                move |messages: Vec<DeserializedMessage<String, String>>| {
                    batches_sink.lock().push(messages.len());
                    for message in messages {
                        flat_sink.lock().push((message.partition, message.offset));
                    }
                },
            ));
        });

        for offset in 0..10 {
            client.push_message(raw_message("events", 0, offset, None, b"x"));
        }
        engine.subscribe().await.unwrap();

        assert!(wait_for(|| flat.lock().len() == 10, Duration::from_secs(3)).await);
        assert!(batches.lock().iter().all(|len| *len <= 4));
        let offsets: Vec<i64> = flat.lock().iter().map(|(_, o)| *o).collect();
        assert_eq!(offsets, (0..10).collect::<Vec<i64>>());
        engine.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_produce_consume_roundtrip_with_identity_serde() {
        use crate::client::ProducerClient;
        use crate::config::ProducerConfig;
        use crate::producer::engine::{build_engine as build_producer, ProducerMessage};
        use crate::testing::MockProducerClient;

        // Produce through the producer engine.
        let producer_client = Arc::new(MockProducerClient::new(4));
        let producer = build_producer(
            ProducerConfig::<Bytes, Bytes>::new("events")
                .key_serializer(Arc::new(BytesSerde::new()))
                .value_serializer(Arc::new(BytesSerde::new())),
            ConnectorConfig::default(),
            Arc::clone(&producer_client) as Arc<dyn ProducerClient>,
            Dispatcher::new(),
        )
        .unwrap();

        let key = Bytes::from_static(b"\x01key");
        let value = Bytes::from_static(b"\x00value\xff");
        producer
            .send_sync(ProducerMessage::new(value.clone()).key(key.clone()))
            .await
            .unwrap();
        producer.shutdown().await.unwrap();

        // Feed the produced record into a consumer with identity serde.
        let sent = producer_client.sent_records();
        assert_eq!(sent.len(), 1);
        let record = &sent[0];

        let consumer_client = Arc::new(MockConsumerClient::new(4));
        consumer_client.push_message(Message {
            topic: record.topic.clone(),
            partition: record.partition.unwrap_or(0),
            offset: 0,
            timestamp_ms: None,
            key: record.key.clone(),
            payload: record.payload.clone(),
            headers: record.headers.clone(),
            error: None,
        });

        let observed: Arc<PlMutex<Vec<(Option<Bytes>, Option<Bytes>)>>> =
            Arc::new(PlMutex::new(Vec::new()));
        let sink = Arc::clone(&observed);
        let mut config = ConsumerConfig::<Bytes, Bytes>::new("events")
            .with_options(options(&[]))
            .unwrap()
            .key_deserializer(Arc::new(BytesSerde::new()))
            .value_deserializer(Arc::new(BytesSerde::new()));
        config.callbacks_mut().receiver = Some(Arc::new(
            move |message: DeserializedMessage<Bytes, Bytes>| {
                sink.lock().push((message.key.clone(), message.value.clone()));
            },
        ));
        let consumer = build_engine(
            config,
            connector(),
            consumer_client as Arc<dyn ConsumerClient>,
            Dispatcher::new(),
        )
        .unwrap();
        consumer.subscribe().await.unwrap();

        assert!(wait_for(|| observed.lock().len() == 1, Duration::from_secs(3)).await);
        let (seen_key, seen_value) = observed.lock()[0].clone();
        assert_eq!(seen_key, Some(key));
        assert_eq!(seen_value, Some(value));
        consumer.shutdown().await.unwrap();
    }
}
