//! Topic and connector configuration.
//!
//! Each topic carries two option namespaces in a single [`TopicOptions`]
//! map: *kafka options* passed through verbatim to the low-level client,
//! and *internal options* (prefixed `internal.producer.` /
//! `internal.consumer.`) consumed by the engine. Unknown internal keys
//! fail validation.
//!
//! [`ProducerConfig`] and [`ConsumerConfig`] combine the parsed options
//! with serializers and the per-topic callback bundle.

use std::sync::Arc;
use std::time::Duration;

use fxhash::FxHashMap;

use crate::callbacks::{ConsumerCallbacks, ProducerCallbacks};
use crate::error::Error;
use crate::serde::{Deserializer, HeaderSerdeMap, Serializer};

/// Prefix shared by all engine-consumed option keys.
pub const INTERNAL_PREFIX: &str = "internal.";
/// Prefix of producer engine options.
pub const INTERNAL_PRODUCER_PREFIX: &str = "internal.producer.";
/// Prefix of consumer engine options.
pub const INTERNAL_CONSUMER_PREFIX: &str = "internal.consumer.";

/// Recognized producer option suffixes under [`INTERNAL_PRODUCER_PREFIX`].
const PRODUCER_OPTIONS: &[&str] = &[
    "max.queue.length",
    "payload.policy",
    "preserve.message.order",
    "retries",
    "timeout.ms",
    "wait.for.acks",
    "wait.for.acks.timeout.ms",
    "flush.wait.for.acks",
    "flush.wait.for.acks.timeout.ms",
    "log.level",
    "skip.unknown.headers",
    "auto.throttle",
    "auto.throttle.multiplier",
    "queue.full.notification",
];

/// Recognized consumer option suffixes under [`INTERNAL_CONSUMER_PREFIX`].
const CONSUMER_OPTIONS: &[&str] = &[
    "poll.timeout.ms",
    "read.size",
    "batch.size",
    "dispatch.policy",
    "dispatch.queues",
    "pause.on.start",
    "preprocess.messages",
    "offset.persist.strategy",
    "offset.persist.mode",
    "offset.persist.exec",
    "auto.offset.persist",
    "allow.non.stored.offsets",
    "log.level",
    "skip.unknown.headers",
    "auto.throttle",
    "auto.throttle.multiplier",
];

/// String key-value options for one topic.
///
/// Keys starting with `internal.` are engine options; everything else is
/// passed through to the low-level client untouched.
#[derive(Debug, Clone, Default)]
pub struct TopicOptions {
    properties: FxHashMap<String, String>,
}

impl TopicOptions {
    /// Creates an empty option map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an option map from existing properties.
    #[must_use]
    pub fn with_properties(properties: FxHashMap<String, String>) -> Self {
        Self { properties }
    }

    /// Sets an option.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.properties.insert(key.into(), value.into());
    }

    /// Gets an option.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Gets a required option.
    ///
    /// # Errors
    ///
    /// Returns a `Configuration` error when the key is not set.
    pub fn require(&self, key: &str) -> Result<&str, Error> {
        self.get(key)
            .ok_or_else(|| Error::configuration(format!("missing required option '{key}'")))
    }

    /// Gets an option parsed as `T`.
    ///
    /// # Errors
    ///
    /// Returns a `Configuration` error when the value cannot be parsed.
    pub fn get_parsed<T: std::str::FromStr>(&self, key: &str) -> Result<Option<T>, Error>
    where
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            Some(v) => v.parse::<T>().map(Some).map_err(|e| {
                Error::configuration(format!("invalid value for '{key}': {e}"))
            }),
            None => Ok(None),
        }
    }

    /// Returns all properties.
    #[must_use]
    pub fn properties(&self) -> &FxHashMap<String, String> {
        &self.properties
    }

    /// Iterates over the non-internal options passed to the low-level
    /// client.
    pub fn kafka_properties(&self) -> impl Iterator<Item = (&str, &str)> {
        self.properties
            .iter()
            .filter(|(k, _)| !k.starts_with(INTERNAL_PREFIX))
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Validates that every `internal.` key belongs to `prefix` and names
    /// a recognized option.
    ///
    /// # Errors
    ///
    /// Returns a `Configuration` error for foreign or unknown internal keys.
    pub fn validate_internal(&self, prefix: &str, known: &[&str]) -> Result<(), Error> {
        for key in self.properties.keys() {
            if !key.starts_with(INTERNAL_PREFIX) {
                continue;
            }
            let Some(suffix) = key.strip_prefix(prefix) else {
                return Err(Error::configuration(format!(
                    "option '{key}' does not belong to the '{prefix}' namespace"
                )));
            };
            if !known.contains(&suffix) {
                return Err(Error::configuration(format!(
                    "unknown internal option '{key}'"
                )));
            }
        }
        Ok(())
    }
}

/// Ownership policy for produced payload bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PayloadPolicy {
    /// Copy the payload into the send buffer; queue-full fails fast.
    #[default]
    Copy,
    /// Buffer the caller's bytes by reference count (no deep copy when
    /// the serializer exposes them as `Bytes`); queue-full fails fast.
    Passthrough,
    /// Block the caller until buffer space appears.
    Block,
}

impl PayloadPolicy {
    /// Returns the option value string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            PayloadPolicy::Copy => "copy",
            PayloadPolicy::Passthrough => "passthrough",
            PayloadPolicy::Block => "block",
        }
    }
}

impl std::str::FromStr for PayloadPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "copy" => Ok(PayloadPolicy::Copy),
            "passthrough" => Ok(PayloadPolicy::Passthrough),
            "block" => Ok(PayloadPolicy::Block),
            other => Err(Error::configuration(format!(
                "invalid payload.policy: '{other}' (expected copy/passthrough/block)"
            ))),
        }
    }
}

impl std::fmt::Display for PayloadPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// When to invoke the queue-full callback for a back-pressured producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueFullNotification {
    /// Once per pending record, before the caller blocks.
    #[default]
    OncePerMessage,
    /// On every back-pressured attempt.
    EachOccurrence,
    /// Only on the not-full→full transition, and again on recovery.
    EdgeTriggered,
}

impl QueueFullNotification {
    /// Returns the option value string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueFullNotification::OncePerMessage => "once-per-message",
            QueueFullNotification::EachOccurrence => "each-occurrence",
            QueueFullNotification::EdgeTriggered => "edge-triggered",
        }
    }
}

impl std::str::FromStr for QueueFullNotification {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "once-per-message" | "oncepermessage" => Ok(QueueFullNotification::OncePerMessage),
            "each-occurrence" | "eachoccurrence" => Ok(QueueFullNotification::EachOccurrence),
            "edge-triggered" | "edgetriggered" => Ok(QueueFullNotification::EdgeTriggered),
            other => Err(Error::configuration(format!(
                "invalid queue.full.notification: '{other}' \
                 (expected once-per-message/each-occurrence/edge-triggered)"
            ))),
        }
    }
}

/// Severity clamp for client log events routed to the user callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    /// Errors only.
    Error,
    /// Warnings and errors.
    Warning,
    /// Informational and above.
    #[default]
    Info,
    /// Everything, including debug chatter.
    Debug,
}

impl LogLevel {
    /// Returns the option value string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warning => "warning",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }

    fn verbosity(self) -> u8 {
        match self {
            LogLevel::Error => 0,
            LogLevel::Warning => 1,
            LogLevel::Info => 2,
            LogLevel::Debug => 3,
        }
    }

    /// Returns `true` if an event at `level` passes this clamp.
    #[must_use]
    pub fn allows(self, level: LogLevel) -> bool {
        level.verbosity() <= self.verbosity()
    }
}

impl std::str::FromStr for LogLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warning" | "warn" => Ok(LogLevel::Warning),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            other => Err(Error::configuration(format!(
                "invalid log.level: '{other}' (expected error/warning/info/debug)"
            ))),
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How received messages fan out onto dispatch queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchPolicy {
    /// One logical queue, strict arrival order.
    #[default]
    Serial,
    /// `partition mod N` queues: per-partition order, cross-partition
    /// parallelism.
    RoundRobin,
}

impl DispatchPolicy {
    /// Returns the option value string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchPolicy::Serial => "serial",
            DispatchPolicy::RoundRobin => "round-robin",
        }
    }
}

impl std::str::FromStr for DispatchPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "serial" => Ok(DispatchPolicy::Serial),
            "round-robin" | "roundrobin" => Ok(DispatchPolicy::RoundRobin),
            other => Err(Error::configuration(format!(
                "invalid dispatch.policy: '{other}' (expected serial/round-robin)"
            ))),
        }
    }
}

/// Where committed offsets are handed first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OffsetPersistStrategy {
    /// Hand offsets to the broker immediately.
    #[default]
    Commit,
    /// Write to the client's local offset store; its auto-commit thread
    /// persists them.
    Store,
}

impl std::str::FromStr for OffsetPersistStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "commit" => Ok(OffsetPersistStrategy::Commit),
            "store" => Ok(OffsetPersistStrategy::Store),
            other => Err(Error::configuration(format!(
                "invalid offset.persist.strategy: '{other}' (expected commit/store)"
            ))),
        }
    }
}

/// Whether the broker commit call blocks until acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PersistMode {
    /// Block until the broker acknowledges the commit.
    #[default]
    Sync,
    /// Fire and report completion through the commit callback.
    Async,
}

impl std::str::FromStr for PersistMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sync" => Ok(PersistMode::Sync),
            "async" => Ok(PersistMode::Async),
            other => Err(Error::configuration(format!(
                "invalid offset.persist.mode: '{other}' (expected sync/async)"
            ))),
        }
    }
}

/// Whether a commit call runs on the caller or on a scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PersistExec {
    /// The caller blocks for the duration of the commit.
    #[default]
    Local,
    /// The commit is scheduled on a task and the caller returns.
    Coroutine,
}

impl std::str::FromStr for PersistExec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" => Ok(PersistExec::Local),
            "coroutine" => Ok(PersistExec::Coroutine),
            other => Err(Error::configuration(format!(
                "invalid offset.persist.exec: '{other}' (expected local/coroutine)"
            ))),
        }
    }
}

/// Commit policy for a consumer entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OffsetPersistSettings {
    /// Broker commit vs local offset store.
    pub strategy: OffsetPersistStrategy,
    /// Blocking vs callback-reported commit.
    pub mode: PersistMode,
    /// Caller-blocking vs scheduled execution.
    pub exec: PersistExec,
    /// Whether offsets this consumer never delivered may be committed.
    pub allow_non_stored_offsets: bool,
}

/// Settings shared by every topic of one connector.
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    /// How long shutdown and revocation wait for in-flight I/O to drain.
    pub shutdown_io_wait_timeout: Duration,
    /// Idle delay between poll or drain cycles when there is no work.
    pub poll_interval: Duration,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            shutdown_io_wait_timeout: Duration::from_millis(2000),
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Parsed producer engine options for one topic.
#[derive(Debug, Clone)]
pub struct ProducerTuning {
    /// Send buffer capacity.
    pub max_queue_length: usize,
    /// Payload ownership and blocking policy.
    pub payload_policy: PayloadPolicy,
    /// Force FIFO handoff and synchronous flush.
    pub preserve_message_order: bool,
    /// Producer-level retry count, passed through to the client.
    pub retries: u32,
    /// Per-send deadline; zero means unbounded.
    pub send_timeout: Duration,
    /// Await the broker ack inside `send`.
    pub wait_for_acks: bool,
    /// Deadline for the in-`send` ack wait; zero means unbounded.
    pub wait_for_acks_timeout: Duration,
    /// Await outstanding acks inside `flush`.
    pub flush_wait_for_acks: bool,
    /// Deadline for the in-`flush` ack wait; zero means unbounded.
    pub flush_wait_for_acks_timeout: Duration,
    /// Log clamp for client events on this topic.
    pub log_level: LogLevel,
    /// Silently omit headers without a registered serde.
    pub skip_unknown_headers: bool,
    /// Honor broker throttle windows before handing records to the client.
    pub auto_throttle: bool,
    /// Multiplier applied to broker-advertised throttle durations.
    pub throttle_multiplier: u32,
    /// Queue-full callback cadence.
    pub queue_full_notification: QueueFullNotification,
}

impl Default for ProducerTuning {
    fn default() -> Self {
        Self {
            max_queue_length: 10_000,
            payload_policy: PayloadPolicy::default(),
            preserve_message_order: false,
            retries: 0,
            send_timeout: Duration::ZERO,
            wait_for_acks: false,
            wait_for_acks_timeout: Duration::ZERO,
            flush_wait_for_acks: false,
            flush_wait_for_acks_timeout: Duration::ZERO,
            log_level: LogLevel::default(),
            skip_unknown_headers: true,
            auto_throttle: false,
            throttle_multiplier: 1,
            queue_full_notification: QueueFullNotification::default(),
        }
    }
}

impl ProducerTuning {
    /// Parses tuning from the `internal.producer.` namespace.
    ///
    /// # Errors
    ///
    /// Returns a `Configuration` error for unknown keys or bad values.
    pub fn from_options(options: &TopicOptions) -> Result<Self, Error> {
        options.validate_internal(INTERNAL_PRODUCER_PREFIX, PRODUCER_OPTIONS)?;

        let key = |suffix: &str| format!("{INTERNAL_PRODUCER_PREFIX}{suffix}");
        let mut tuning = Self::default();

        if let Some(v) = options.get_parsed::<usize>(&key("max.queue.length"))? {
            if v == 0 {
                return Err(Error::configuration(
                    "internal.producer.max.queue.length must be at least 1",
                ));
            }
            tuning.max_queue_length = v;
        }
        if let Some(v) = options.get_parsed::<PayloadPolicy>(&key("payload.policy"))? {
            tuning.payload_policy = v;
        }
        if let Some(v) = options.get_parsed::<bool>(&key("preserve.message.order"))? {
            tuning.preserve_message_order = v;
        }
        if let Some(v) = options.get_parsed::<u32>(&key("retries"))? {
            tuning.retries = v;
        }
        if let Some(v) = options.get_parsed::<u64>(&key("timeout.ms"))? {
            tuning.send_timeout = Duration::from_millis(v);
        }
        if let Some(v) = options.get_parsed::<bool>(&key("wait.for.acks"))? {
            tuning.wait_for_acks = v;
        }
        if let Some(v) = options.get_parsed::<u64>(&key("wait.for.acks.timeout.ms"))? {
            tuning.wait_for_acks_timeout = Duration::from_millis(v);
        }
        if let Some(v) = options.get_parsed::<bool>(&key("flush.wait.for.acks"))? {
            tuning.flush_wait_for_acks = v;
        }
        if let Some(v) = options.get_parsed::<u64>(&key("flush.wait.for.acks.timeout.ms"))? {
            tuning.flush_wait_for_acks_timeout = Duration::from_millis(v);
        }
        if let Some(v) = options.get_parsed::<LogLevel>(&key("log.level"))? {
            tuning.log_level = v;
        }
        if let Some(v) = options.get_parsed::<bool>(&key("skip.unknown.headers"))? {
            tuning.skip_unknown_headers = v;
        }
        if let Some(v) = options.get_parsed::<bool>(&key("auto.throttle"))? {
            tuning.auto_throttle = v;
        }
        if let Some(v) = options.get_parsed::<u32>(&key("auto.throttle.multiplier"))? {
            if v == 0 {
                return Err(Error::configuration(
                    "internal.producer.auto.throttle.multiplier must be at least 1",
                ));
            }
            tuning.throttle_multiplier = v;
        }
        if let Some(v) =
            options.get_parsed::<QueueFullNotification>(&key("queue.full.notification"))?
        {
            tuning.queue_full_notification = v;
        }

        Ok(tuning)
    }
}

/// Parsed consumer engine options for one topic.
#[derive(Debug, Clone)]
pub struct ConsumerTuning {
    /// Deadline for each low-level poll call.
    pub poll_timeout: Duration,
    /// Maximum raw messages requested per poll.
    pub read_size: usize,
    /// Batch receiver chunk size; zero delivers whole per-queue groups.
    pub batch_size: usize,
    /// Serial or round-robin fan-out.
    pub dispatch_policy: DispatchPolicy,
    /// Number of logical dispatch queues.
    pub dispatch_queues: usize,
    /// Start the entry paused.
    pub pause_on_start: bool,
    /// Run the preprocessor callback before deserialization.
    pub preprocess_messages: bool,
    /// Commit policy.
    pub offset_persist: OffsetPersistSettings,
    /// Persist offsets automatically after receivers complete.
    pub auto_offset_persist: bool,
    /// Log clamp for client events on this topic.
    pub log_level: LogLevel,
    /// Silently omit headers without a registered serde.
    pub skip_unknown_headers: bool,
    /// Honor broker throttle windows before polling.
    pub auto_throttle: bool,
    /// Multiplier applied to broker-advertised throttle durations.
    pub throttle_multiplier: u32,
}

impl Default for ConsumerTuning {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(100),
            read_size: 100,
            batch_size: 0,
            dispatch_policy: DispatchPolicy::default(),
            dispatch_queues: 4,
            pause_on_start: false,
            preprocess_messages: false,
            offset_persist: OffsetPersistSettings::default(),
            auto_offset_persist: true,
            log_level: LogLevel::default(),
            skip_unknown_headers: true,
            auto_throttle: false,
            throttle_multiplier: 1,
        }
    }
}

impl ConsumerTuning {
    /// Parses tuning from the `internal.consumer.` namespace.
    ///
    /// # Errors
    ///
    /// Returns a `Configuration` error for unknown keys or bad values.
    pub fn from_options(options: &TopicOptions) -> Result<Self, Error> {
        options.validate_internal(INTERNAL_CONSUMER_PREFIX, CONSUMER_OPTIONS)?;

        let key = |suffix: &str| format!("{INTERNAL_CONSUMER_PREFIX}{suffix}");
        let mut tuning = Self::default();

        if let Some(v) = options.get_parsed::<u64>(&key("poll.timeout.ms"))? {
            tuning.poll_timeout = Duration::from_millis(v);
        }
        if let Some(v) = options.get_parsed::<usize>(&key("read.size"))? {
            if v == 0 {
                return Err(Error::configuration(
                    "internal.consumer.read.size must be at least 1",
                ));
            }
            tuning.read_size = v;
        }
        if let Some(v) = options.get_parsed::<usize>(&key("batch.size"))? {
            tuning.batch_size = v;
        }
        if let Some(v) = options.get_parsed::<DispatchPolicy>(&key("dispatch.policy"))? {
            tuning.dispatch_policy = v;
        }
        if let Some(v) = options.get_parsed::<usize>(&key("dispatch.queues"))? {
            if v == 0 {
                return Err(Error::configuration(
                    "internal.consumer.dispatch.queues must be at least 1",
                ));
            }
            tuning.dispatch_queues = v;
        }
        if let Some(v) = options.get_parsed::<bool>(&key("pause.on.start"))? {
            tuning.pause_on_start = v;
        }
        if let Some(v) = options.get_parsed::<bool>(&key("preprocess.messages"))? {
            tuning.preprocess_messages = v;
        }
        if let Some(v) =
            options.get_parsed::<OffsetPersistStrategy>(&key("offset.persist.strategy"))?
        {
            tuning.offset_persist.strategy = v;
        }
        if let Some(v) = options.get_parsed::<PersistMode>(&key("offset.persist.mode"))? {
            tuning.offset_persist.mode = v;
        }
        if let Some(v) = options.get_parsed::<PersistExec>(&key("offset.persist.exec"))? {
            tuning.offset_persist.exec = v;
        }
        if let Some(v) = options.get_parsed::<bool>(&key("auto.offset.persist"))? {
            tuning.auto_offset_persist = v;
        }
        if let Some(v) = options.get_parsed::<bool>(&key("allow.non.stored.offsets"))? {
            tuning.offset_persist.allow_non_stored_offsets = v;
        }
        if let Some(v) = options.get_parsed::<LogLevel>(&key("log.level"))? {
            tuning.log_level = v;
        }
        if let Some(v) = options.get_parsed::<bool>(&key("skip.unknown.headers"))? {
            tuning.skip_unknown_headers = v;
        }
        if let Some(v) = options.get_parsed::<bool>(&key("auto.throttle"))? {
            tuning.auto_throttle = v;
        }
        if let Some(v) = options.get_parsed::<u32>(&key("auto.throttle.multiplier"))? {
            if v == 0 {
                return Err(Error::configuration(
                    "internal.consumer.auto.throttle.multiplier must be at least 1",
                ));
            }
            tuning.throttle_multiplier = v;
        }

        Ok(tuning)
    }
}

/// Full producer configuration for one topic.
pub struct ProducerConfig<K, V> {
    topic: String,
    options: TopicOptions,
    /// Parsed engine tuning.
    pub tuning: ProducerTuning,
    key_serializer: Option<Arc<dyn Serializer<K>>>,
    value_serializer: Option<Arc<dyn Serializer<V>>>,
    header_serde: HeaderSerdeMap,
    callbacks: ProducerCallbacks,
}

impl<K, V> ProducerConfig<K, V> {
    /// Creates a configuration with default tuning and no serializers.
    #[must_use]
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            options: TopicOptions::new(),
            tuning: ProducerTuning::default(),
            key_serializer: None,
            value_serializer: None,
            header_serde: HeaderSerdeMap::new(),
            callbacks: ProducerCallbacks::default(),
        }
    }

    /// Applies an option map, parsing the internal producer namespace.
    ///
    /// # Errors
    ///
    /// Returns a `Configuration` error for unknown keys or bad values.
    pub fn with_options(mut self, options: TopicOptions) -> Result<Self, Error> {
        self.tuning = ProducerTuning::from_options(&options)?;
        self.options = options;
        Ok(self)
    }

    /// Sets the key serializer.
    #[must_use]
    pub fn key_serializer(mut self, serializer: Arc<dyn Serializer<K>>) -> Self {
        self.key_serializer = Some(serializer);
        self
    }

    /// Sets the value serializer.
    #[must_use]
    pub fn value_serializer(mut self, serializer: Arc<dyn Serializer<V>>) -> Self {
        self.value_serializer = Some(serializer);
        self
    }

    /// Returns a mutable handle to the header serde registry.
    pub fn header_serde_mut(&mut self) -> &mut HeaderSerdeMap {
        &mut self.header_serde
    }

    /// Returns a mutable handle to the callback bundle.
    pub fn callbacks_mut(&mut self) -> &mut ProducerCallbacks {
        &mut self.callbacks
    }

    /// Sets the whole callback bundle.
    #[must_use]
    pub fn callbacks(mut self, callbacks: ProducerCallbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    /// Returns the topic name.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Returns the raw option map.
    #[must_use]
    pub fn options(&self) -> &TopicOptions {
        &self.options
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns a `Configuration` error when a serializer is missing, or
    /// when `preserve.message.order` is combined with a custom partitioner
    /// (a partitioner that is not key-deterministic would silently void
    /// the ordering contract).
    pub fn validate(&self) -> Result<(), Error> {
        if self.key_serializer.is_none() {
            return Err(Error::configuration(format!(
                "topic '{}': key serializer not set",
                self.topic
            )));
        }
        if self.value_serializer.is_none() {
            return Err(Error::configuration(format!(
                "topic '{}': value serializer not set",
                self.topic
            )));
        }
        if self.tuning.preserve_message_order && self.callbacks.partitioner.is_some() {
            return Err(Error::configuration(format!(
                "topic '{}': preserve.message.order cannot be combined with a \
                 custom partitioner",
                self.topic
            )));
        }
        Ok(())
    }

    pub(crate) fn into_parts(
        self,
    ) -> (
        String,
        TopicOptions,
        ProducerTuning,
        Arc<dyn Serializer<K>>,
        Arc<dyn Serializer<V>>,
        HeaderSerdeMap,
        ProducerCallbacks,
    ) {
        let key_serializer = self
            .key_serializer
            .expect("validated configuration has a key serializer");
        let value_serializer = self
            .value_serializer
            .expect("validated configuration has a value serializer");
        (
            self.topic,
            self.options,
            self.tuning,
            key_serializer,
            value_serializer,
            self.header_serde,
            self.callbacks,
        )
    }
}

impl<K, V> std::fmt::Debug for ProducerConfig<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProducerConfig")
            .field("topic", &self.topic)
            .field("tuning", &self.tuning)
            .field("key_serializer", &self.key_serializer.is_some())
            .field("value_serializer", &self.value_serializer.is_some())
            .finish_non_exhaustive()
    }
}

/// Full consumer configuration for one topic.
pub struct ConsumerConfig<K, V> {
    topic: String,
    options: TopicOptions,
    /// Parsed engine tuning.
    pub tuning: ConsumerTuning,
    key_deserializer: Option<Arc<dyn Deserializer<K>>>,
    value_deserializer: Option<Arc<dyn Deserializer<V>>>,
    header_serde: HeaderSerdeMap,
    callbacks: ConsumerCallbacks<K, V>,
}

impl<K, V> ConsumerConfig<K, V> {
    /// Creates a configuration with default tuning and no deserializers.
    #[must_use]
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            options: TopicOptions::new(),
            tuning: ConsumerTuning::default(),
            key_deserializer: None,
            value_deserializer: None,
            header_serde: HeaderSerdeMap::new(),
            callbacks: ConsumerCallbacks::default(),
        }
    }

    /// Applies an option map, parsing the internal consumer namespace.
    ///
    /// # Errors
    ///
    /// Returns a `Configuration` error for unknown keys or bad values.
    pub fn with_options(mut self, options: TopicOptions) -> Result<Self, Error> {
        self.tuning = ConsumerTuning::from_options(&options)?;
        self.options = options;
        Ok(self)
    }

    /// Sets the key deserializer.
    #[must_use]
    pub fn key_deserializer(mut self, deserializer: Arc<dyn Deserializer<K>>) -> Self {
        self.key_deserializer = Some(deserializer);
        self
    }

    /// Sets the value deserializer.
    #[must_use]
    pub fn value_deserializer(mut self, deserializer: Arc<dyn Deserializer<V>>) -> Self {
        self.value_deserializer = Some(deserializer);
        self
    }

    /// Returns a mutable handle to the header serde registry.
    pub fn header_serde_mut(&mut self) -> &mut HeaderSerdeMap {
        &mut self.header_serde
    }

    /// Returns a mutable handle to the callback bundle.
    pub fn callbacks_mut(&mut self) -> &mut ConsumerCallbacks<K, V> {
        &mut self.callbacks
    }

    /// Sets the whole callback bundle.
    #[must_use]
    pub fn callbacks(mut self, callbacks: ConsumerCallbacks<K, V>) -> Self {
        self.callbacks = callbacks;
        self
    }

    /// Returns the topic name.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Returns the raw option map.
    #[must_use]
    pub fn options(&self) -> &TopicOptions {
        &self.options
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns a `Configuration` error when a deserializer or receiver is
    /// missing.
    pub fn validate(&self) -> Result<(), Error> {
        if self.key_deserializer.is_none() {
            return Err(Error::configuration(format!(
                "topic '{}': key deserializer not set",
                self.topic
            )));
        }
        if self.value_deserializer.is_none() {
            return Err(Error::configuration(format!(
                "topic '{}': value deserializer not set",
                self.topic
            )));
        }
        if self.callbacks.receiver.is_none() && self.callbacks.batch_receiver.is_none() {
            return Err(Error::configuration(format!(
                "topic '{}': no receiver callback set",
                self.topic
            )));
        }
        if self.callbacks.receiver.is_some() && self.callbacks.batch_receiver.is_some() {
            return Err(Error::configuration(format!(
                "topic '{}': set either the single or the batch receiver, not both",
                self.topic
            )));
        }
        Ok(())
    }

    pub(crate) fn into_parts(
        self,
    ) -> (
        String,
        TopicOptions,
        ConsumerTuning,
        Arc<dyn Deserializer<K>>,
        Arc<dyn Deserializer<V>>,
        HeaderSerdeMap,
        ConsumerCallbacks<K, V>,
    ) {
        let key_deserializer = self
            .key_deserializer
            .expect("validated configuration has a key deserializer");
        let value_deserializer = self
            .value_deserializer
            .expect("validated configuration has a value deserializer");
        (
            self.topic,
            self.options,
            self.tuning,
            key_deserializer,
            value_deserializer,
            self.header_serde,
            self.callbacks,
        )
    }
}

impl<K, V> std::fmt::Debug for ConsumerConfig<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerConfig")
            .field("topic", &self.topic)
            .field("tuning", &self.tuning)
            .field("key_deserializer", &self.key_deserializer.is_some())
            .field("value_deserializer", &self.value_deserializer.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serde::{BytesSerde, StringSerde};
    use bytes::Bytes;

    #[test]
    fn test_options_basic_operations() {
        let mut options = TopicOptions::new();
        options.set("bootstrap.servers", "localhost:9092");
        options.set("internal.producer.retries", "3");

        assert_eq!(options.get("bootstrap.servers"), Some("localhost:9092"));
        assert_eq!(options.get("missing"), None);
        assert!(options.require("missing").is_err());

        let retries: Option<u32> = options.get_parsed("internal.producer.retries").unwrap();
        assert_eq!(retries, Some(3));
    }

    #[test]
    fn test_kafka_properties_exclude_internal() {
        let mut options = TopicOptions::new();
        options.set("bootstrap.servers", "localhost:9092");
        options.set("linger.ms", "5");
        options.set("internal.producer.max.queue.length", "100");

        let kafka: Vec<&str> = options.kafka_properties().map(|(k, _)| k).collect();
        assert_eq!(kafka.len(), 2);
        assert!(!kafka.contains(&"internal.producer.max.queue.length"));
    }

    #[test]
    fn test_unknown_internal_option_rejected() {
        let mut options = TopicOptions::new();
        options.set("internal.producer.bogus", "1");
        let err = ProducerTuning::from_options(&options).unwrap_err();
        assert!(err.to_string().contains("unknown internal option"));
    }

    #[test]
    fn test_foreign_namespace_rejected() {
        let mut options = TopicOptions::new();
        options.set("internal.consumer.read.size", "10");
        assert!(ProducerTuning::from_options(&options).is_err());
        assert!(ConsumerTuning::from_options(&options).is_ok());
    }

    #[test]
    fn test_producer_tuning_parse() {
        let mut options = TopicOptions::new();
        options.set("internal.producer.max.queue.length", "500");
        options.set("internal.producer.payload.policy", "block");
        options.set("internal.producer.preserve.message.order", "true");
        options.set("internal.producer.wait.for.acks", "true");
        options.set("internal.producer.wait.for.acks.timeout.ms", "250");
        options.set("internal.producer.auto.throttle", "true");
        options.set("internal.producer.auto.throttle.multiplier", "2");
        options.set("internal.producer.queue.full.notification", "edge-triggered");

        let tuning = ProducerTuning::from_options(&options).unwrap();
        assert_eq!(tuning.max_queue_length, 500);
        assert_eq!(tuning.payload_policy, PayloadPolicy::Block);
        assert!(tuning.preserve_message_order);
        assert!(tuning.wait_for_acks);
        assert_eq!(tuning.wait_for_acks_timeout, Duration::from_millis(250));
        assert!(tuning.auto_throttle);
        assert_eq!(tuning.throttle_multiplier, 2);
        assert_eq!(
            tuning.queue_full_notification,
            QueueFullNotification::EdgeTriggered
        );
    }

    #[test]
    fn test_consumer_tuning_parse() {
        let mut options = TopicOptions::new();
        options.set("internal.consumer.poll.timeout.ms", "50");
        options.set("internal.consumer.read.size", "200");
        options.set("internal.consumer.dispatch.policy", "round-robin");
        options.set("internal.consumer.dispatch.queues", "8");
        options.set("internal.consumer.offset.persist.strategy", "store");
        options.set("internal.consumer.offset.persist.mode", "async");
        options.set("internal.consumer.offset.persist.exec", "coroutine");
        options.set("internal.consumer.allow.non.stored.offsets", "true");

        let tuning = ConsumerTuning::from_options(&options).unwrap();
        assert_eq!(tuning.poll_timeout, Duration::from_millis(50));
        assert_eq!(tuning.read_size, 200);
        assert_eq!(tuning.dispatch_policy, DispatchPolicy::RoundRobin);
        assert_eq!(tuning.dispatch_queues, 8);
        assert_eq!(
            tuning.offset_persist.strategy,
            OffsetPersistStrategy::Store
        );
        assert_eq!(tuning.offset_persist.mode, PersistMode::Async);
        assert_eq!(tuning.offset_persist.exec, PersistExec::Coroutine);
        assert!(tuning.offset_persist.allow_non_stored_offsets);
    }

    #[test]
    fn test_log_level_clamp() {
        assert!(LogLevel::Info.allows(LogLevel::Error));
        assert!(LogLevel::Info.allows(LogLevel::Info));
        assert!(!LogLevel::Info.allows(LogLevel::Debug));
        assert!(LogLevel::Debug.allows(LogLevel::Debug));
        assert!(!LogLevel::Error.allows(LogLevel::Warning));
    }

    #[test]
    fn test_producer_config_missing_serializer() {
        let config: ProducerConfig<Bytes, Bytes> = ProducerConfig::new("events");
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("key serializer"));
    }

    #[test]
    fn test_preserve_order_rejects_custom_partitioner() {
        let mut options = TopicOptions::new();
        options.set("internal.producer.preserve.message.order", "true");

        let mut config: ProducerConfig<Bytes, Bytes> = ProducerConfig::new("events")
            .with_options(options)
            .unwrap()
            .key_serializer(Arc::new(BytesSerde::new()))
            .value_serializer(Arc::new(BytesSerde::new()));
        config.callbacks_mut().partitioner = Some(Arc::new(|_key: &[u8], _n: i32| 0));

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("custom partitioner"));
    }

    #[test]
    fn test_consumer_config_requires_one_receiver() {
        let config: ConsumerConfig<String, String> = ConsumerConfig::new("events")
            .key_deserializer(Arc::new(StringSerde::new()))
            .value_deserializer(Arc::new(StringSerde::new()));
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("no receiver callback"));
    }
}
