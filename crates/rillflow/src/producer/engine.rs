//! Buffered, flow-controlled producer pipeline for one topic.
//!
//! Records accumulate in a bounded send queue; a background drain task
//! hands them to the low-level client in order, honors broker throttle
//! windows, collects delivery acks, and dispatches each
//! [`DeliveryReport`] at most once — to the user callback and to the
//! per-send [`DeliveryFuture`].

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use bytes::Bytes;
use fxhash::FxHashMap;
use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::bridge::CallbackBridge;
use crate::callbacks::QueueFullEvent;
use crate::client::{ProducerClient, ProducerRecord};
use crate::config::{ConnectorConfig, PayloadPolicy, ProducerConfig, QueueFullNotification};
use crate::error::{Error, TimeoutScope};
use crate::message::{DeliveryReport, HeaderValue, Headers, Opaque, TopicPartition};
use crate::metadata::ProducerMetadata;
use crate::metrics::ProducerMetricsSnapshot;
use crate::producer::entry::ProducerTopicEntry;
use crate::producer::partitioner::partition_for_key;
use crate::runtime::Dispatcher;
use crate::serde::{HeaderSerdeMap, Serializer};

/// Records popped from the send queue per drain cycle.
const DRAIN_BATCH: usize = 64;
/// Ack poll wait when the send queue is idle.
const IDLE_ACK_POLL: Duration = Duration::from_millis(10);
/// Bound for queue-drain waits when no explicit timeout is configured.
const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(30);
/// Back-off between retries when the client's own buffer is saturated.
const CLIENT_FULL_BACKOFF: Duration = Duration::from_millis(10);

/// A typed record to produce, built fluently and consumed by `send`.
pub struct ProducerMessage<K, V> {
    value: V,
    key: Option<K>,
    headers: Vec<(String, HeaderValue)>,
    partition: Option<i32>,
    opaque: Opaque,
}

impl<K, V> ProducerMessage<K, V> {
    /// Creates a message with the given value.
    #[must_use]
    pub fn new(value: V) -> Self {
        Self {
            value,
            key: None,
            headers: Vec::new(),
            partition: None,
            opaque: Opaque::NONE,
        }
    }

    /// Sets the record key.
    #[must_use]
    pub fn key(mut self, key: K) -> Self {
        self.key = Some(key);
        self
    }

    /// Appends a typed header.
    #[must_use]
    pub fn header<T: std::any::Any + Send + Sync>(
        mut self,
        name: impl Into<String>,
        value: T,
    ) -> Self {
        self.headers.push((name.into(), Box::new(value)));
        self
    }

    /// Pins the record to an explicit partition.
    #[must_use]
    pub fn partition(mut self, partition: i32) -> Self {
        self.partition = Some(partition);
        self
    }

    /// Attaches an opaque handle echoed in the delivery report.
    #[must_use]
    pub fn opaque(mut self, opaque: Opaque) -> Self {
        self.opaque = opaque;
        self
    }
}

/// Completion handle for one `send`; resolves to the [`DeliveryReport`].
pub struct DeliveryFuture {
    topic: String,
    opaque: Opaque,
    inner: FutureInner,
}

enum FutureInner {
    Ready(Option<DeliveryReport>),
    Pending(oneshot::Receiver<DeliveryReport>),
}

impl DeliveryFuture {
    fn ready(report: DeliveryReport) -> Self {
        Self {
            topic: report.topic_partition().topic.clone(),
            opaque: report.opaque(),
            inner: FutureInner::Ready(Some(report)),
        }
    }

    fn pending(topic: String, opaque: Opaque, rx: oneshot::Receiver<DeliveryReport>) -> Self {
        Self {
            topic,
            opaque,
            inner: FutureInner::Pending(rx),
        }
    }

    fn shutdown_report(&self) -> DeliveryReport {
        DeliveryReport::new(
            TopicPartition::new(self.topic.clone(), -1),
            -1,
            Some(Error::shutdown("producer shut down before delivery")),
            self.opaque,
        )
    }

    /// Returns `true` when the report is already available.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self.inner, FutureInner::Ready(_))
    }
}

impl Future for DeliveryFuture {
    type Output = DeliveryReport;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &mut this.inner {
            FutureInner::Ready(report) => match report.take() {
                Some(report) => Poll::Ready(report),
                None => Poll::Ready(this.shutdown_report()),
            },
            FutureInner::Pending(rx) => match Pin::new(rx).poll(cx) {
                Poll::Ready(Ok(report)) => Poll::Ready(report),
                Poll::Ready(Err(_)) => Poll::Ready(this.shutdown_report()),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

impl std::fmt::Debug for DeliveryFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryFuture")
            .field("topic", &self.topic)
            .field("ready", &self.is_ready())
            .finish()
    }
}

/// Bounded FIFO between callers and the drain task.
struct SendQueue {
    capacity: usize,
    inner: Mutex<VecDeque<ProducerRecord>>,
    space: Notify,
    work: Notify,
}

impl SendQueue {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            space: Notify::new(),
            work: Notify::new(),
        }
    }

    fn len(&self) -> usize {
        self.inner.lock().len()
    }

    fn try_push(&self, record: ProducerRecord) -> Result<(), ProducerRecord> {
        let mut inner = self.inner.lock();
        if inner.len() >= self.capacity {
            return Err(record);
        }
        inner.push_back(record);
        drop(inner);
        self.work.notify_one();
        Ok(())
    }

    async fn wait_space(&self) {
        let notified = self.space.notified();
        if self.len() < self.capacity {
            return;
        }
        notified.await;
    }

    async fn wait_work(&self) {
        let notified = self.work.notified();
        if self.len() > 0 {
            return;
        }
        notified.await;
    }

    /// Peeks the head of the queue without removing it. A record only
    /// leaves the queue once the client accepted it, so the buffer never
    /// looks empty while records are merely in flight to a saturated
    /// client.
    fn front(&self) -> Option<ProducerRecord> {
        self.inner.lock().front().cloned()
    }

    fn pop_front(&self) {
        let mut inner = self.inner.lock();
        inner.pop_front();
        drop(inner);
        self.space.notify_waiters();
    }

    fn wake_all(&self) {
        self.work.notify_waiters();
        self.space.notify_waiters();
    }
}

type PendingMap = Mutex<FxHashMap<u64, oneshot::Sender<DeliveryReport>>>;

/// Per-topic producer pipeline.
///
/// Created through [`ProducerManager`](crate::producer::ProducerManager);
/// user code holds it via [`ProducerHandle`](crate::producer::ProducerHandle).
pub struct ProducerEngine<K, V> {
    entry: Arc<ProducerTopicEntry>,
    client: Arc<dyn ProducerClient>,
    key_serializer: Arc<dyn Serializer<K>>,
    value_serializer: Arc<dyn Serializer<V>>,
    header_serde: Arc<HeaderSerdeMap>,
    queue: Arc<SendQueue>,
    pending: Arc<PendingMap>,
    next_tag: AtomicU64,
    partition_count: AtomicI32,
    dispatcher: Dispatcher,
    drain_handle: Mutex<Option<JoinHandle<()>>>,
}

impl<K, V> ProducerEngine<K, V> {
    pub(crate) fn new(
        config: ProducerConfig<K, V>,
        connector: ConnectorConfig,
        client: Arc<dyn ProducerClient>,
        dispatcher: Dispatcher,
    ) -> Self {
        let (topic, _options, tuning, key_serializer, value_serializer, header_serde, callbacks) =
            config.into_parts();
        let queue = Arc::new(SendQueue::new(tuning.max_queue_length));
        let entry = Arc::new(ProducerTopicEntry::new(topic, connector, tuning, callbacks));
        Self {
            entry,
            client,
            key_serializer,
            value_serializer,
            header_serde: Arc::new(header_serde),
            queue,
            pending: Arc::new(Mutex::new(FxHashMap::default())),
            next_tag: AtomicU64::new(1),
            partition_count: AtomicI32::new(0),
            dispatcher,
            drain_handle: Mutex::new(None),
        }
    }

    /// Returns the topic this engine produces to.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.entry.topic
    }

    /// Spawns the background drain task if it is not running yet.
    pub(crate) fn ensure_started(&self) {
        let mut handle = self.drain_handle.lock();
        if handle.is_some() {
            return;
        }
        let ctx = DrainCtx {
            entry: Arc::clone(&self.entry),
            client: Arc::clone(&self.client),
            queue: Arc::clone(&self.queue),
            pending: Arc::clone(&self.pending),
            dispatcher: self.dispatcher.clone(),
        };
        *handle = Some(self.dispatcher.spawn_compute(drain_loop(ctx)));
    }

    /// Sends a record, returning a future that resolves to its delivery
    /// report.
    ///
    /// With `wait.for.acks` set, the broker ack is awaited here and the
    /// returned future is already resolved.
    ///
    /// # Errors
    ///
    /// Fails immediately with `Serialization` for encode failures,
    /// `QueueFull` when the buffer is full and the payload policy is not
    /// `block`, `Timeout(Ack)` when an ack or buffer-space deadline
    /// expires, and `Shutdown` after shutdown began.
    pub async fn send(&self, message: ProducerMessage<K, V>) -> Result<DeliveryFuture, Error> {
        if self.entry.is_closing() || self.dispatcher.is_interrupted() {
            return Err(Error::shutdown(format!(
                "producer for '{}' is shutting down",
                self.entry.topic
            )));
        }
        self.ensure_started();

        let (key, payload, headers) = self.serialize_message(&message)?;
        let partition = self.select_partition(&message, key.as_deref()).await;
        let tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
        let record = ProducerRecord {
            topic: self.entry.topic.clone(),
            partition,
            key,
            payload: Some(payload),
            headers,
            opaque: message.opaque,
            delivery_tag: tag,
        };

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(tag, tx);

        if let Err(e) = self.enqueue_with_backpressure(record).await {
            self.pending.lock().remove(&tag);
            return Err(e);
        }

        if self.entry.tuning.wait_for_acks {
            let deadline = self.entry.tuning.wait_for_acks_timeout;
            let report = if deadline.is_zero() {
                rx.await.ok()
            } else {
                match tokio::time::timeout(deadline, rx).await {
                    Ok(done) => done.ok(),
                    Err(_) => {
                        self.pending.lock().remove(&tag);
                        return Err(Error::timeout(
                            TimeoutScope::Ack,
                            format!("no broker ack within {deadline:?}"),
                        ));
                    }
                }
            };
            let report = report.unwrap_or_else(|| {
                DeliveryReport::new(
                    TopicPartition::new(self.entry.topic.clone(), -1),
                    -1,
                    Some(Error::shutdown("producer shut down before delivery")),
                    message.opaque,
                )
            });
            return Ok(DeliveryFuture::ready(report));
        }

        Ok(DeliveryFuture::pending(
            self.entry.topic.clone(),
            message.opaque,
            rx,
        ))
    }

    /// Sends a record and waits for its delivery report.
    ///
    /// # Errors
    ///
    /// As for [`send`](Self::send); additionally `Timeout(Ack)` when the
    /// ack wait exceeds the configured deadline.
    pub async fn send_sync(&self, message: ProducerMessage<K, V>) -> Result<DeliveryReport, Error> {
        let deadline = if !self.entry.tuning.wait_for_acks_timeout.is_zero() {
            self.entry.tuning.wait_for_acks_timeout
        } else {
            self.entry.tuning.send_timeout
        };
        let future = self.send(message).await?;
        if deadline.is_zero() {
            return Ok(future.await);
        }
        tokio::time::timeout(deadline, future).await.map_err(|_| {
            Error::timeout(
                TimeoutScope::Ack,
                format!("no broker ack within {deadline:?}"),
            )
        })
    }

    /// Pushes all buffered records through the client.
    ///
    /// With `flush.wait.for.acks` set, also waits for every outstanding
    /// ack.
    ///
    /// # Errors
    ///
    /// Returns `Timeout(Flush)` when the drain does not complete within
    /// the configured deadline.
    pub async fn flush(&self) -> Result<(), Error> {
        self.ensure_started();
        let deadline = if self.entry.tuning.flush_wait_for_acks_timeout.is_zero() {
            DEFAULT_FLUSH_TIMEOUT
        } else {
            self.entry.tuning.flush_wait_for_acks_timeout
        };
        let start = Instant::now();

        while self.queue.len() > 0 {
            if start.elapsed() >= deadline {
                return Err(Error::timeout(
                    TimeoutScope::Flush,
                    "send queue did not drain in time",
                ));
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let client = Arc::clone(&self.client);
        let remaining = deadline.saturating_sub(start.elapsed());
        self.dispatcher
            .run_io(move || client.flush(remaining))
            .await??;

        if self.entry.tuning.flush_wait_for_acks {
            while !self.pending.lock().is_empty() {
                if start.elapsed() >= deadline {
                    return Err(Error::timeout(
                        TimeoutScope::Flush,
                        "outstanding acks did not complete in time",
                    ));
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
        Ok(())
    }

    /// Drains the pipeline and stops the background task.
    ///
    /// After this returns, no user callback is invoked for this topic.
    ///
    /// # Errors
    ///
    /// Currently infallible; the signature leaves room for drain errors.
    pub async fn shutdown(&self) -> Result<(), Error> {
        if !self.entry.begin_close() {
            return Ok(());
        }
        self.queue.wake_all();

        let handle = self.drain_handle.lock().take();
        if let Some(mut handle) = handle {
            let grace = self.entry.connector.shutdown_io_wait_timeout + Duration::from_millis(500);
            if tokio::time::timeout(grace, &mut handle).await.is_err() {
                warn!(topic = %self.entry.topic, "drain task did not stop in time; aborting");
                handle.abort();
            }
        }

        // Dropping the reply channels resolves any leftover futures with
        // a shutdown report carrying the caller's own opaque.
        self.pending.lock().clear();
        debug!(topic = %self.entry.topic, "producer engine shut down");
        Ok(())
    }

    /// Returns a point-in-time metadata facade for this topic.
    #[must_use]
    pub fn metadata(&self) -> ProducerMetadata {
        ProducerMetadata::new(
            self.entry.topic.clone(),
            Arc::clone(&self.client),
            self.queue.len(),
            self.entry.metrics.snapshot(),
        )
    }

    /// Returns a metrics snapshot.
    #[must_use]
    pub fn metrics(&self) -> ProducerMetricsSnapshot {
        self.entry.metrics.snapshot()
    }

    fn serialize_message(
        &self,
        message: &ProducerMessage<K, V>,
    ) -> Result<(Option<Bytes>, Bytes, Headers), Error> {
        let passthrough = self.entry.tuning.payload_policy == PayloadPolicy::Passthrough;
        let key = match &message.key {
            Some(k) => Some(encode_with(&self.key_serializer, k, passthrough)?),
            None => None,
        };
        let payload = encode_with(&self.value_serializer, &message.value, passthrough)?;

        let mut headers = Headers::new();
        for (name, value) in &message.headers {
            match self.header_serde.serializer(name) {
                Some(serializer) => {
                    headers.insert(name.clone(), Bytes::from(serializer.serialize(value.as_ref())?));
                }
                None if self.entry.tuning.skip_unknown_headers => {}
                None => {
                    return Err(Error::serialization(format!(
                        "no serializer registered for header '{name}'"
                    )));
                }
            }
        }
        Ok((key, payload, headers))
    }

    async fn select_partition(
        &self,
        message: &ProducerMessage<K, V>,
        key: Option<&[u8]>,
    ) -> Option<i32> {
        if let Some(p) = message.partition {
            return Some(p);
        }
        let key = key?;
        let count = self.cached_partition_count().await?;
        if let Some(partitioner) = &self.entry.callbacks.partitioner {
            return Some(partitioner(key, count));
        }
        Some(partition_for_key(key, count))
    }

    async fn cached_partition_count(&self) -> Option<i32> {
        let cached = self.partition_count.load(Ordering::Relaxed);
        if cached > 0 {
            return Some(cached);
        }
        let client = Arc::clone(&self.client);
        let topic = self.entry.topic.clone();
        match self
            .dispatcher
            .run_io(move || client.partition_count(&topic))
            .await
        {
            Ok(Ok(count)) if count > 0 => {
                self.partition_count.store(count, Ordering::Relaxed);
                Some(count)
            }
            Ok(Err(e)) => {
                warn!(topic = %self.entry.topic, error = %e, "partition metadata unavailable");
                None
            }
            _ => None,
        }
    }

    async fn enqueue_with_backpressure(&self, record: ProducerRecord) -> Result<(), Error> {
        let mut record = match self.queue.try_push(record) {
            Ok(()) => return Ok(()),
            Err(record) => record,
        };

        // The buffer is full: notify per the configured cadence, then
        // either block (payload policy `block`) or fail fast.
        self.entry.metrics.record_queue_full();
        let notification = self.entry.tuning.queue_full_notification;
        match notification {
            QueueFullNotification::OncePerMessage | QueueFullNotification::EachOccurrence => {
                self.notify_queue_full(false);
            }
            QueueFullNotification::EdgeTriggered => {
                if !self.entry.queue_full_trigger.swap(true, Ordering::SeqCst) {
                    self.notify_queue_full(false);
                }
            }
        }

        if self.entry.tuning.payload_policy != PayloadPolicy::Block {
            return Err(Error::queue_full(format!(
                "send queue for '{}' is at capacity {}",
                self.entry.topic, self.entry.tuning.max_queue_length
            )));
        }

        let deadline = self.entry.tuning.send_timeout;
        let start = Instant::now();
        loop {
            if self.entry.is_closing() || self.dispatcher.is_interrupted() {
                return Err(Error::shutdown(format!(
                    "producer for '{}' is shutting down",
                    self.entry.topic
                )));
            }
            if !deadline.is_zero() && start.elapsed() >= deadline {
                return Err(Error::timeout(
                    TimeoutScope::Ack,
                    "send deadline expired while waiting for buffer space",
                ));
            }
            if deadline.is_zero() {
                self.queue.wait_space().await;
            } else {
                let remaining = deadline.saturating_sub(start.elapsed());
                if tokio::time::timeout(remaining, self.queue.wait_space())
                    .await
                    .is_err()
                {
                    continue;
                }
            }
            record = match self.queue.try_push(record) {
                Ok(()) => return Ok(()),
                Err(record) => {
                    if notification == QueueFullNotification::EachOccurrence {
                        self.entry.metrics.record_queue_full();
                        self.notify_queue_full(false);
                    }
                    record
                }
            };
        }
    }

    fn notify_queue_full(&self, recovered: bool) {
        if let Some(cb) = &self.entry.callbacks.queue_full {
            cb(&QueueFullEvent {
                topic: self.entry.topic.clone(),
                queue_length: self.queue.len(),
                capacity: self.entry.tuning.max_queue_length,
                recovered,
            });
        }
    }
}

impl<K, V> std::fmt::Debug for ProducerEngine<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProducerEngine")
            .field("topic", &self.entry.topic)
            .field("queue_len", &self.queue.len())
            .field("pending_acks", &self.pending.lock().len())
            .field("closing", &self.entry.is_closing())
            .finish_non_exhaustive()
    }
}

/// Under the `passthrough` policy, values exposing their wire bytes are
/// buffered by reference count instead of deep copy.
fn encode_with<T: ?Sized>(
    serializer: &Arc<dyn Serializer<T>>,
    value: &T,
    passthrough: bool,
) -> Result<Bytes, Error> {
    if passthrough {
        if let Some(bytes) = serializer.as_bytes(value) {
            return Ok(bytes);
        }
    }
    Ok(Bytes::from(serializer.serialize(value)?))
}

/// Everything the drain task needs; deliberately byte-level and
/// non-generic.
struct DrainCtx {
    entry: Arc<ProducerTopicEntry>,
    client: Arc<dyn ProducerClient>,
    queue: Arc<SendQueue>,
    pending: Arc<PendingMap>,
    dispatcher: Dispatcher,
}

async fn drain_loop(ctx: DrainCtx) {
    debug!(topic = %ctx.entry.topic, "drain task started");
    let idle = ctx.entry.connector.poll_interval;

    loop {
        let closing = ctx.entry.is_closing() || ctx.dispatcher.is_interrupted();

        // Flow control: an active throttle window defers handoff but the
        // queue keeps accepting and acks keep draining.
        let gate = if ctx.entry.throttle.is_auto() && !closing {
            ctx.entry.throttle.pause_remaining(Instant::now())
        } else {
            None
        };

        let outcome = if gate.is_some() {
            HandOff::default()
        } else {
            hand_off(&ctx).await
        };
        if outcome.handed > 0 && ctx.entry.tuning.preserve_message_order {
            sync_flush(&ctx).await;
        }
        signal_recovery_edge(&ctx);

        let ack_wait = if outcome.handed > 0 {
            Duration::ZERO
        } else {
            IDLE_ACK_POLL
        };
        collect_acks(&ctx, ack_wait).await;
        process_events(&ctx).await;

        if closing {
            if ctx.queue.len() == 0 {
                finish_drain(&ctx).await;
                break;
            }
            if outcome.client_full {
                tokio::time::sleep(CLIENT_FULL_BACKOFF).await;
            }
            continue;
        }

        if let Some(remaining) = gate {
            tokio::time::sleep(remaining.min(idle)).await;
        } else if outcome.client_full {
            tokio::time::sleep(CLIENT_FULL_BACKOFF).await;
        } else if ctx.queue.len() == 0 {
            tokio::select! {
                () = ctx.queue.wait_work() => {}
                () = tokio::time::sleep(idle) => {}
            }
        }
    }
    debug!(topic = %ctx.entry.topic, "drain task stopped");
}

#[derive(Default)]
struct HandOff {
    handed: usize,
    client_full: bool,
}

/// Moves up to one batch of records into the client, FIFO. On a
/// saturated client the head record stays queued and the drain backs
/// off, so buffer-length semantics (and queue-full notifications) keep
/// reflecting reality.
async fn hand_off(ctx: &DrainCtx) -> HandOff {
    let mut outcome = HandOff::default();
    while outcome.handed < DRAIN_BATCH {
        let Some(record) = ctx.queue.front() else {
            break;
        };
        let bytes = record.payload.as_ref().map_or(0, Bytes::len) as u64;
        let client = Arc::clone(&ctx.client);
        match ctx.dispatcher.run_io(move || client.enqueue(record)).await {
            Ok(Ok(())) => {
                ctx.queue.pop_front();
                ctx.entry.metrics.record_send(bytes);
                outcome.handed += 1;
            }
            Ok(Err((error, returned))) => {
                if error.kind() == crate::error::ErrorKind::QueueFull
                    && !ctx.entry.is_closing()
                {
                    outcome.client_full = true;
                    break;
                }
                ctx.queue.pop_front();
                fail_record(ctx, &returned, error);
                outcome.handed += 1;
            }
            Err(_) => break, // IO pool is gone; shutdown is in progress.
        }
    }
    outcome
}

async fn sync_flush(ctx: &DrainCtx) {
    let timeout = if ctx.entry.tuning.flush_wait_for_acks_timeout.is_zero() {
        DEFAULT_FLUSH_TIMEOUT
    } else {
        ctx.entry.tuning.flush_wait_for_acks_timeout
    };
    let client = Arc::clone(&ctx.client);
    match ctx.dispatcher.run_io(move || client.flush(timeout)).await {
        Ok(Ok(())) | Err(_) => {}
        Ok(Err(e)) => {
            CallbackBridge::report_producer_error(&ctx.entry, &e);
        }
    }
}

async fn collect_acks(ctx: &DrainCtx, wait: Duration) {
    let client = Arc::clone(&ctx.client);
    let acks = ctx
        .dispatcher
        .run_io(move || client.poll_acks(wait))
        .await
        .unwrap_or_default();
    for ack in acks {
        let report = DeliveryReport::new(ack.topic_partition, ack.offset, ack.error, ack.opaque);
        if report.success() {
            ctx.entry.metrics.record_ack();
        } else {
            ctx.entry.metrics.record_failure();
        }
        dispatch_report(ctx, ack.delivery_tag, report);
    }
}

/// Routes one report to the user callback and the per-send future, at
/// most once per record.
fn dispatch_report(ctx: &DrainCtx, tag: u64, report: DeliveryReport) {
    let reply = ctx.pending.lock().remove(&tag);
    if let Some(cb) = &ctx.entry.callbacks.delivery_report {
        cb(&report);
    }
    if let Some(reply) = reply {
        let _ = reply.send(report);
    }
}

fn fail_record(ctx: &DrainCtx, record: &ProducerRecord, error: Error) {
    ctx.entry.metrics.record_failure();
    let partition = record.partition.unwrap_or(-1);
    let report = DeliveryReport::new(
        TopicPartition::new(record.topic.clone(), partition),
        -1,
        Some(error),
        record.opaque,
    );
    dispatch_report(ctx, record.delivery_tag, report);
}

async fn process_events(ctx: &DrainCtx) {
    let client = Arc::clone(&ctx.client);
    let events = ctx
        .dispatcher
        .run_io(move || client.take_events())
        .await
        .unwrap_or_default();
    for event in events {
        CallbackBridge::on_producer_event(&ctx.entry, &event);
    }
}

fn signal_recovery_edge(ctx: &DrainCtx) {
    if ctx.entry.queue_full_trigger.load(Ordering::SeqCst)
        && ctx.queue.len() < ctx.entry.tuning.max_queue_length
        && ctx.entry.queue_full_trigger.swap(false, Ordering::SeqCst)
        && ctx.entry.tuning.queue_full_notification == QueueFullNotification::EdgeTriggered
        && !ctx.entry.is_closing()
    {
        if let Some(cb) = &ctx.entry.callbacks.queue_full {
            cb(&QueueFullEvent {
                topic: ctx.entry.topic.clone(),
                queue_length: ctx.queue.len(),
                capacity: ctx.entry.tuning.max_queue_length,
                recovered: true,
            });
        }
    }
}

async fn finish_drain(ctx: &DrainCtx) {
    let timeout = ctx.entry.connector.shutdown_io_wait_timeout;
    let client = Arc::clone(&ctx.client);
    let _ = ctx.dispatcher.run_io(move || client.flush(timeout)).await;
    collect_acks(ctx, Duration::ZERO).await;

    // Whatever is still pending will never be acked. Dropping the reply
    // channels resolves the futures with shutdown reports carrying each
    // caller's own opaque; the user callback is not invoked for these.
    ctx.pending.lock().clear();
}

/// Convenience constructor used by tests and the manager.
pub(crate) fn build_engine<K, V>(
    config: ProducerConfig<K, V>,
    connector: ConnectorConfig,
    client: Arc<dyn ProducerClient>,
    dispatcher: Dispatcher,
) -> Result<ProducerEngine<K, V>, Error> {
    config.validate()?;
    Ok(ProducerEngine::new(config, connector, client, dispatcher))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProducerConfig, TopicOptions};
    use crate::serde::BytesSerde;
    use crate::testing::MockProducerClient;
    use parking_lot::Mutex as PlMutex;

    fn base_config(options: TopicOptions) -> ProducerConfig<Bytes, Bytes> {
        ProducerConfig::new("events")
            .with_options(options)
            .unwrap()
            .key_serializer(Arc::new(BytesSerde::new()))
            .value_serializer(Arc::new(BytesSerde::new()))
    }

    fn engine_with(
        options: TopicOptions,
        client: Arc<MockProducerClient>,
        configure: impl FnOnce(&mut ProducerConfig<Bytes, Bytes>),
    ) -> ProducerEngine<Bytes, Bytes> {
        let mut config = base_config(options);
        configure(&mut config);
        let connector = ConnectorConfig {
            poll_interval: Duration::from_millis(10),
            ..ConnectorConfig::default()
        };
        build_engine(config, connector, client, Dispatcher::new()).unwrap()
    }

    fn msg(value: &'static [u8]) -> ProducerMessage<Bytes, Bytes> {
        ProducerMessage::new(Bytes::from_static(value))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_send_resolves_with_opaque() {
        let client = Arc::new(MockProducerClient::new(4));
        let engine = engine_with(TopicOptions::new(), Arc::clone(&client), |_| {});

        let future = engine
            .send(
                msg(b"payload")
                    .key(Bytes::from_static(b"k1"))
                    .opaque(Opaque::new(0xfeed_face_dead_beef)),
            )
            .await
            .unwrap();
        let report = future.await;

        assert!(report.success(), "unexpected error: {:?}", report.error());
        assert_eq!(report.opaque(), Opaque::new(0xfeed_face_dead_beef));
        assert_eq!(report.topic_partition().topic, "events");
        engine.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_send_sync_returns_report() {
        let client = Arc::new(MockProducerClient::new(2));
        let engine = engine_with(TopicOptions::new(), Arc::clone(&client), |_| {});

        let report = engine.send_sync(msg(b"v")).await.unwrap();
        assert!(report.success());
        assert!(report.offset() >= 0);
        engine.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_serialization_failure_is_immediate() {
        struct FailingSerializer;
        impl Serializer<Bytes> for FailingSerializer {
            fn serialize(&self, _value: &Bytes) -> Result<Vec<u8>, Error> {
                Err(Error::serialization("broken encoder"))
            }
        }

        let client = Arc::new(MockProducerClient::new(2));
        let config = ProducerConfig::<Bytes, Bytes>::new("events")
            .key_serializer(Arc::new(BytesSerde::new()))
            .value_serializer(Arc::new(FailingSerializer));
        let engine = build_engine(
            config,
            ConnectorConfig::default(),
            Arc::clone(&client) as Arc<dyn ProducerClient>,
            Dispatcher::new(),
        )
        .unwrap();

        let err = engine.send(msg(b"v")).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Serialization);
        assert_eq!(client.sent_records().len(), 0);
        engine.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_per_key_report_order_preserved() {
        let mut options = TopicOptions::new();
        options.set("internal.producer.preserve.message.order", "true");

        let reports: Arc<PlMutex<Vec<u64>>> = Arc::new(PlMutex::new(Vec::new()));
        let sink = Arc::clone(&reports);

        let client = Arc::new(MockProducerClient::new(8));
        let engine = engine_with(options, Arc::clone(&client), |config| {
            config.callbacks_mut().delivery_report = Some(Arc::new(move |report| {
                sink.lock().push(report.opaque().value());
            }));
        });

        let total: u64 = 1000;
        for i in 0..total {
            let key = if i % 2 == 0 { "key-a" } else { "key-b" };
            engine
                .send(
                    ProducerMessage::new(Bytes::from(format!("v{i}")))
                        .key(Bytes::from(key.as_bytes().to_vec()))
                        .opaque(Opaque::new(i)),
                )
                .await
                .unwrap();
        }
        engine.flush().await.unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while (reports.lock().len() as u64) < total && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let seen = reports.lock().clone();
        assert_eq!(seen.len() as u64, total);

        // Per key, the delivery-report order must equal submission order.
        let evens: Vec<u64> = seen.iter().copied().filter(|i| i % 2 == 0).collect();
        let odds: Vec<u64> = seen.iter().copied().filter(|i| i % 2 == 1).collect();
        assert!(evens.windows(2).all(|w| w[0] < w[1]));
        assert!(odds.windows(2).all(|w| w[0] < w[1]));
        engine.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_passthrough_payload_shares_caller_bytes() {
        let mut options = TopicOptions::new();
        options.set("internal.producer.payload.policy", "passthrough");

        let client = Arc::new(MockProducerClient::new(2));
        let engine = engine_with(options, Arc::clone(&client), |_| {});

        let payload = Bytes::from(vec![7u8; 64]);
        engine
            .send_sync(ProducerMessage::new(payload.clone()))
            .await
            .unwrap();

        let sent = client.sent_records();
        assert_eq!(sent.len(), 1);
        let buffered = sent[0].payload.as_ref().unwrap();
        assert_eq!(buffered, &payload);
        assert_eq!(
            buffered.as_ptr(),
            payload.as_ptr(),
            "passthrough must buffer the caller's storage, not a copy"
        );
        engine.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_copy_policy_does_not_alias_caller_bytes() {
        let client = Arc::new(MockProducerClient::new(2));
        let engine = engine_with(TopicOptions::new(), Arc::clone(&client), |_| {});

        let payload = Bytes::from(vec![9u8; 64]);
        engine
            .send_sync(ProducerMessage::new(payload.clone()))
            .await
            .unwrap();

        let sent = client.sent_records();
        let buffered = sent[0].payload.as_ref().unwrap();
        assert_eq!(buffered, &payload);
        assert_ne!(buffered.as_ptr(), payload.as_ptr());
        engine.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_queue_full_fails_fast_without_block_policy() {
        let mut options = TopicOptions::new();
        options.set("internal.producer.max.queue.length", "2");

        let client = Arc::new(MockProducerClient::new(2));
        let engine = engine_with(options, Arc::clone(&client), |_| {});
        // Keep the drain task from emptying the queue.
        client.block_enqueue(true);

        engine.send(msg(b"a")).await.unwrap();
        engine.send(msg(b"b")).await.unwrap();
        // The client rejects handoff, so both records stay buffered and
        // the third send fails fast under the default copy policy.
        let err = engine.send(msg(b"c")).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::QueueFull);
        client.block_enqueue(false);
        engine.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_edge_triggered_notification_fires_once_and_recovers() {
        let mut options = TopicOptions::new();
        options.set("internal.producer.max.queue.length", "4");
        options.set("internal.producer.queue.full.notification", "edge-triggered");

        let events: Arc<PlMutex<Vec<bool>>> = Arc::new(PlMutex::new(Vec::new()));
        let sink = Arc::clone(&events);

        let client = Arc::new(MockProducerClient::new(2));
        let engine = engine_with(options, Arc::clone(&client), |config| {
            config.callbacks_mut().queue_full = Some(Arc::new(move |event: &QueueFullEvent| {
                sink.lock().push(event.recovered);
            }));
        });
        client.block_enqueue(true);

        // Fill the buffer before the drain task can move anything.
        for _ in 0..4 {
            engine.send(msg(b"x")).await.unwrap();
        }
        // Rejected sends: exactly one edge notification for all of them.
        for _ in 0..11 {
            let _ = engine.send(msg(b"y")).await;
        }
        {
            let seen = events.lock();
            assert_eq!(seen.len(), 1, "expected a single full-edge callback");
            assert!(!seen[0]);
        }

        // Unblock the client: the drain task empties the queue and fires
        // the recovery edge.
        client.block_enqueue(false);
        let deadline = Instant::now() + Duration::from_secs(2);
        while events.lock().len() < 2 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let seen = events.lock().clone();
        assert_eq!(seen.len(), 2);
        assert!(seen[1], "second callback must be the recovery edge");
        engine.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_auto_throttle_defers_handoff() {
        let mut options = TopicOptions::new();
        options.set("internal.producer.auto.throttle", "true");
        options.set("internal.producer.auto.throttle.multiplier", "2");

        let client = Arc::new(MockProducerClient::new(2));
        let engine = engine_with(options, Arc::clone(&client), |_| {});
        engine.ensure_started();

        // Let the drain task observe the throttle notification first.
        let notified_at = Instant::now();
        client.push_throttle("broker-1", 1, Duration::from_millis(200));
        tokio::time::sleep(Duration::from_millis(80)).await;

        engine.send(msg(b"deferred")).await.unwrap();

        let deadline = Instant::now() + Duration::from_secs(3);
        while client.sent_records().is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let instants = client.enqueue_instants();
        assert_eq!(instants.len(), 1, "record never reached the client");
        // 200 ms × multiplier 2, minus scheduling slack.
        assert!(
            instants[0].duration_since(notified_at) >= Duration::from_millis(350),
            "handoff happened {:?} after the notification",
            instants[0].duration_since(notified_at)
        );
        engine.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_no_delivery_callback_after_shutdown() {
        let calls: Arc<PlMutex<usize>> = Arc::new(PlMutex::new(0));
        let sink = Arc::clone(&calls);

        let client = Arc::new(MockProducerClient::new(2));
        let engine = engine_with(TopicOptions::new(), Arc::clone(&client), |config| {
            config.callbacks_mut().delivery_report = Some(Arc::new(move |_| {
                *sink.lock() += 1;
            }));
        });

        engine.send_sync(msg(b"v")).await.unwrap();
        engine.shutdown().await.unwrap();
        let after = *calls.lock();

        let err = engine.send(msg(b"late")).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Shutdown);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*calls.lock(), after, "callback fired after shutdown");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_wait_for_acks_returns_resolved_future() {
        let mut options = TopicOptions::new();
        options.set("internal.producer.wait.for.acks", "true");
        options.set("internal.producer.wait.for.acks.timeout.ms", "2000");

        let client = Arc::new(MockProducerClient::new(2));
        let engine = engine_with(options, Arc::clone(&client), |_| {});

        let future = engine.send(msg(b"v")).await.unwrap();
        assert!(future.is_ready());
        assert!(future.await.success());
        engine.shutdown().await.unwrap();
    }
}
