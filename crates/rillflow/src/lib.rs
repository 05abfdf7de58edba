//! # Rillflow
//!
//! Task-driven Kafka client framework layered over a low-level protocol
//! client. Applications publish and consume records with typed
//! key/value/header serde, per-partition concurrency with optional
//! strict ordering, adaptive producer flow control, parallel batched
//! consumer pipelines, and structured delivery/commit reporting —
//! without managing poll loops, threadpools, or broker quota back-off.
//!
//! ## Architecture
//!
//! ```text
//! send()  ──► SendQueue ──► drain task ──► ProducerClient ──► broker
//!                │                │
//!                │                └──► DeliveryReport ──► future + callback
//!                └── throttle / queue-full flow control
//!
//! broker ──► ConsumerClient ──► poll task ──► dispatch queues (partition mod N)
//!                                   │              │
//!                           rebalance events   workers: preprocess →
//!                                              deserialize → receiver → commit
//! ```
//!
//! Each topic is one engine; managers index engines by topic name and
//! own shutdown. The low-level client is a narrow trait seam with an
//! rdkafka implementation behind the `kafka` feature and deterministic
//! mocks in [`testing`].
//!
//! ## Usage
//!
//! ```rust,ignore
//! use rillflow::{ProducerConfig, ProducerManager, ProducerMessage};
//!
//! let mut manager = ProducerManager::new(ConnectorConfig::default());
//! let handle = manager.register(config, client)?;
//! manager.start();
//!
//! let report = handle
//!     .send_sync(ProducerMessage::new(value).key(key).opaque(Opaque::new(7)))
//!     .await?;
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
// Common test patterns that are acceptable
#![cfg_attr(
    test,
    allow(
        clippy::field_reassign_with_default,
        clippy::float_cmp,
        clippy::cast_possible_truncation,
        clippy::cast_possible_wrap,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss,
        clippy::too_many_lines,
        unused_mut
    )
)]

/// Framework error types.
pub mod error;

/// Message and partition value types.
pub mod message;

/// Typed serialization capabilities.
pub mod serde;

/// Topic and connector configuration.
pub mod config;

/// User callback capability bundles.
pub mod callbacks;

/// Low-level client seam.
pub mod client;

/// Broker throttle window state machine.
pub mod throttle;

/// Task scheduling primitives.
pub mod runtime;

/// Lock-free engine metrics.
pub mod metrics;

/// Producer side: buffered send, flow control, delivery reporting.
pub mod producer;

/// Consumer side: poll loop, partition fan-out, typed delivery, commit.
pub mod consumer;

/// Read-only metadata facades.
pub mod metadata;

/// Deterministic mock clients and test helpers.
pub mod testing;

pub(crate) mod bridge;

/// rdkafka-backed low-level clients.
#[cfg(feature = "kafka")]
pub mod kafka;

pub use callbacks::{CommitReport, ConsumerCallbacks, PreprocessorAction, ProducerCallbacks,
    QueueFullEvent};
pub use client::{ClientEvent, CommitMode, ConsumerClient, ProducerClient, ThrottleEvent};
pub use config::{
    ConnectorConfig, ConsumerConfig, DispatchPolicy, LogLevel, OffsetPersistSettings,
    OffsetPersistStrategy, PayloadPolicy, PersistExec, PersistMode, ProducerConfig,
    QueueFullNotification, TopicOptions,
};
pub use consumer::{ConsumerEngine, ConsumerHandle, ConsumerManager, ConsumerState};
pub use error::{Error, ErrorKind, TimeoutScope};
pub use message::{
    DeliveryReport, DeserializedMessage, Headers, Message, Opaque, TopicPartition,
    TopicPartitionOffset,
};
pub use metadata::{ConsumerMetadata, ProducerMetadata};
pub use producer::{DeliveryFuture, ProducerEngine, ProducerHandle, ProducerManager,
    ProducerMessage};
pub use runtime::{Dispatcher, IoTracker};
pub use serde::{BytesSerde, Deserializer, HeaderSerdeMap, JsonSerde, Serializer, StringSerde};
pub use throttle::{ThrottleControl, ThrottleState};
