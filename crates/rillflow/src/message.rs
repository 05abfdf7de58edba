//! Message and partition value types.
//!
//! The raw [`Message`] is what the low-level client hands the engine:
//! byte key, byte payload, byte headers. A [`DeserializedMessage`] is the
//! typed form delivered to receivers. [`DeliveryReport`] is the per-record
//! produce outcome, carrying the caller's [`Opaque`] handle verbatim.

use std::any::Any;

use bytes::Bytes;

use crate::error::Error;

/// A `(topic, partition)` pair. Hashable, comparable, value-typed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    /// Topic name.
    pub topic: String,
    /// Partition index within the topic.
    pub partition: i32,
}

impl TopicPartition {
    /// Creates a new topic-partition pair.
    #[must_use]
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }

    /// Attaches an offset, producing a [`TopicPartitionOffset`].
    #[must_use]
    pub fn with_offset(self, offset: i64) -> TopicPartitionOffset {
        TopicPartitionOffset {
            topic: self.topic,
            partition: self.partition,
            offset,
        }
    }
}

impl std::fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}]", self.topic, self.partition)
    }
}

/// A `(topic, partition, offset)` triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartitionOffset {
    /// Topic name.
    pub topic: String,
    /// Partition index within the topic.
    pub partition: i32,
    /// Offset within the partition.
    pub offset: i64,
}

impl TopicPartitionOffset {
    /// Creates a new topic-partition-offset triple.
    #[must_use]
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
        }
    }

    /// Returns the topic-partition pair without the offset.
    #[must_use]
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }
}

impl std::fmt::Display for TopicPartitionOffset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}]@{}", self.topic, self.partition, self.offset)
    }
}

/// An application-supplied handle echoed back untouched in callbacks.
///
/// The engine treats this as an unowned bit-pattern: it is never
/// interpreted, never freed, and reaches the [`DeliveryReport`] or commit
/// report bit-identical to what the caller passed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Opaque(u64);

impl Opaque {
    /// The absent handle.
    pub const NONE: Opaque = Opaque(0);

    /// Wraps a caller-chosen bit-pattern.
    #[must_use]
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the wrapped bit-pattern.
    #[must_use]
    pub fn value(self) -> u64 {
        self.0
    }
}

impl From<u64> for Opaque {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Raw message headers: name → bytes, insertion-ordered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, Bytes)>,
}

impl Headers {
    /// Creates an empty header map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a header.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Bytes>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Returns the first header with the given name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Bytes> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Iterates over `(name, value)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Bytes)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v))
    }

    /// Returns the number of headers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if there are no headers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A deserialized header value; receivers downcast it to the registered
/// type for that header name.
pub type HeaderValue = Box<dyn Any + Send + Sync>;

/// Typed message headers: name → deserialized value, insertion-ordered.
#[derive(Default)]
pub struct HeaderBag {
    entries: Vec<(String, HeaderValue)>,
}

impl HeaderBag {
    /// Creates an empty bag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a typed header value.
    pub fn insert<T: Any + Send + Sync>(&mut self, name: impl Into<String>, value: T) {
        self.entries.push((name.into(), Box::new(value)));
    }

    /// Appends an already-boxed header value.
    pub fn insert_boxed(&mut self, name: impl Into<String>, value: HeaderValue) {
        self.entries.push((name.into(), value));
    }

    /// Returns the first header with the given name, downcast to `T`.
    #[must_use]
    pub fn get<T: Any>(&self, name: &str) -> Option<&T> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .and_then(|(_, v)| v.downcast_ref::<T>())
    }

    /// Iterates over header names in insertion order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    /// Returns the number of headers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if there are no headers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for HeaderBag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

/// An immutable record as returned by the low-level client.
///
/// Ownership is single and moves through the pipeline: poll task →
/// dispatch queue → worker → (deserialized) receiver.
#[derive(Debug, Clone)]
pub struct Message {
    /// Topic the record was read from.
    pub topic: String,
    /// Partition the record was read from.
    pub partition: i32,
    /// Offset within the partition.
    pub offset: i64,
    /// Broker or producer timestamp in milliseconds, if present.
    pub timestamp_ms: Option<i64>,
    /// Serialized key bytes.
    pub key: Option<Bytes>,
    /// Serialized payload bytes.
    pub payload: Option<Bytes>,
    /// Raw headers.
    pub headers: Headers,
    /// Error marker set by the low-level client, if any.
    pub error: Option<Error>,
}

impl Message {
    /// Returns the record's topic-partition pair.
    #[must_use]
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }

    /// Returns the record's topic-partition-offset triple.
    #[must_use]
    pub fn topic_partition_offset(&self) -> TopicPartitionOffset {
        TopicPartitionOffset::new(self.topic.clone(), self.partition, self.offset)
    }

    /// Returns the payload length in bytes, zero when absent.
    #[must_use]
    pub fn payload_len(&self) -> usize {
        self.payload.as_ref().map_or(0, Bytes::len)
    }
}

/// A raw message plus typed key, value, and headers.
///
/// When deserialization of the key or value fails, the message is still
/// delivered with `error` set and the failed component absent; the
/// receiver decides whether to treat it as poison.
#[derive(Debug)]
pub struct DeserializedMessage<K, V> {
    /// Topic the record was read from.
    pub topic: String,
    /// Partition the record was read from.
    pub partition: i32,
    /// Offset within the partition.
    pub offset: i64,
    /// Broker or producer timestamp in milliseconds, if present.
    pub timestamp_ms: Option<i64>,
    /// Deserialized key.
    pub key: Option<K>,
    /// Deserialized value.
    pub value: Option<V>,
    /// Deserialized headers.
    pub headers: HeaderBag,
    /// Deserialization or transport error, if any.
    pub error: Option<Error>,
}

impl<K, V> DeserializedMessage<K, V> {
    /// Returns the record's topic-partition pair.
    #[must_use]
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }

    /// Returns the record's topic-partition-offset triple.
    #[must_use]
    pub fn topic_partition_offset(&self) -> TopicPartitionOffset {
        TopicPartitionOffset::new(self.topic.clone(), self.partition, self.offset)
    }

    /// Returns `true` if any component failed to deserialize or the raw
    /// message carried an error marker.
    #[must_use]
    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }
}

/// The result of a successful or failed delivery of a produced record.
#[derive(Debug, Clone)]
pub struct DeliveryReport {
    topic_partition: TopicPartition,
    offset: i64,
    error: Option<Error>,
    opaque: Opaque,
}

impl DeliveryReport {
    /// Creates a delivery report.
    #[must_use]
    pub fn new(
        topic_partition: TopicPartition,
        offset: i64,
        error: Option<Error>,
        opaque: Opaque,
    ) -> Self {
        Self {
            topic_partition,
            offset,
            error,
            opaque,
        }
    }

    /// Returns the partition the record was sent to.
    #[must_use]
    pub fn topic_partition(&self) -> &TopicPartition {
        &self.topic_partition
    }

    /// Returns the assigned offset, or `-1` when delivery failed.
    #[must_use]
    pub fn offset(&self) -> i64 {
        self.offset
    }

    /// Returns the delivery error, if any.
    #[must_use]
    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    /// Returns `true` if the record was delivered.
    #[must_use]
    pub fn success(&self) -> bool {
        self.error.is_none()
    }

    /// Returns the opaque handle passed to `send`, bit-identical.
    #[must_use]
    pub fn opaque(&self) -> Opaque {
        self.opaque
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_partition_display() {
        let tp = TopicPartition::new("events", 2);
        assert_eq!(tp.to_string(), "events[2]");
        assert_eq!(tp.clone().with_offset(7).to_string(), "events[2]@7");
    }

    #[test]
    fn test_topic_partition_ordering() {
        let a = TopicPartition::new("events", 0);
        let b = TopicPartition::new("events", 1);
        let c = TopicPartition::new("orders", 0);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_opaque_roundtrip() {
        let op = Opaque::new(0xdead_beef_cafe_f00d);
        assert_eq!(op.value(), 0xdead_beef_cafe_f00d);
        assert_eq!(Opaque::default(), Opaque::NONE);
    }

    #[test]
    fn test_headers_lookup() {
        let mut headers = Headers::new();
        headers.insert("trace-id", Bytes::from_static(b"abc"));
        headers.insert("trace-id", Bytes::from_static(b"def"));
        headers.insert("tenant", Bytes::from_static(b"blue"));

        assert_eq!(headers.len(), 3);
        assert_eq!(headers.get("trace-id"), Some(&Bytes::from_static(b"abc")));
        assert_eq!(headers.get("missing"), None);
    }

    #[test]
    fn test_header_bag_downcast() {
        let mut bag = HeaderBag::new();
        bag.insert("count", 42u32);
        bag.insert("label", String::from("hot"));

        assert_eq!(bag.get::<u32>("count"), Some(&42));
        assert_eq!(bag.get::<String>("label"), Some(&String::from("hot")));
        assert_eq!(bag.get::<u64>("count"), None);
        assert_eq!(bag.names().collect::<Vec<_>>(), vec!["count", "label"]);
    }

    #[test]
    fn test_delivery_report_accessors() {
        let report = DeliveryReport::new(
            TopicPartition::new("events", 1),
            99,
            None,
            Opaque::new(7),
        );
        assert!(report.success());
        assert_eq!(report.offset(), 99);
        assert_eq!(report.opaque(), Opaque::new(7));
    }
}
