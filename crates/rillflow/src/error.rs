//! Framework error types.
//!
//! All fallible operations return [`Error`], a value type carrying an
//! [`ErrorKind`], a stable numeric code, a human-readable reason, and
//! optionally the offending partition. Errors travel by value through
//! delivery reports and deserialized messages, so the type is `Clone`.

use thiserror::Error as ThisError;

use crate::message::TopicPartition;

/// Which blocking operation exceeded its deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeoutScope {
    /// Waiting for a broker acknowledgement of a produced record.
    Ack,
    /// Waiting for an explicit producer flush to complete.
    Flush,
    /// Waiting for an offset commit to complete.
    Commit,
    /// Waiting for a consumer poll to return.
    Poll,
}

impl TimeoutScope {
    /// Returns the scope name as a string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeoutScope::Ack => "ack",
            TimeoutScope::Flush => "flush",
            TimeoutScope::Commit => "commit",
            TimeoutScope::Poll => "poll",
        }
    }
}

/// Classification of a framework error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Invalid option, missing serializer, or otherwise bad configuration.
    Configuration,
    /// Transport failure reported by the low-level client.
    Network,
    /// Protocol-level error reported by a broker.
    Broker,
    /// A bounded send queue rejected a record.
    QueueFull,
    /// A blocking operation exceeded its deadline.
    Timeout(TimeoutScope),
    /// A key, value, or header failed to serialize.
    Serialization,
    /// A key, value, or header failed to deserialize.
    Deserialization,
    /// An offset was committed that this consumer never delivered.
    InvalidOffset,
    /// The operation was cancelled before completion.
    Cancelled,
    /// The owning engine has shut down.
    Shutdown,
}

impl ErrorKind {
    /// Returns the stable numeric code for this kind.
    ///
    /// Broker errors carry the broker-reported code instead; see
    /// [`Error::broker`].
    #[must_use]
    pub fn code(&self) -> i32 {
        match self {
            ErrorKind::Configuration => 1,
            ErrorKind::Network => 2,
            ErrorKind::Broker => 3,
            ErrorKind::QueueFull => 4,
            ErrorKind::Timeout(TimeoutScope::Ack) => 10,
            ErrorKind::Timeout(TimeoutScope::Flush) => 11,
            ErrorKind::Timeout(TimeoutScope::Commit) => 12,
            ErrorKind::Timeout(TimeoutScope::Poll) => 13,
            ErrorKind::Serialization => 20,
            ErrorKind::Deserialization => 21,
            ErrorKind::InvalidOffset => 22,
            ErrorKind::Cancelled => 30,
            ErrorKind::Shutdown => 31,
        }
    }

    /// Returns the kind name as a string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::Network => "network",
            ErrorKind::Broker => "broker",
            ErrorKind::QueueFull => "queue full",
            ErrorKind::Timeout(TimeoutScope::Ack) => "ack timeout",
            ErrorKind::Timeout(TimeoutScope::Flush) => "flush timeout",
            ErrorKind::Timeout(TimeoutScope::Commit) => "commit timeout",
            ErrorKind::Timeout(TimeoutScope::Poll) => "poll timeout",
            ErrorKind::Serialization => "serialization",
            ErrorKind::Deserialization => "deserialization",
            ErrorKind::InvalidOffset => "invalid offset",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Shutdown => "shutdown",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A framework error: kind, stable code, reason, optional partition.
#[derive(Debug, Clone, ThisError)]
#[error("{kind} (code {code}): {reason}")]
pub struct Error {
    kind: ErrorKind,
    code: i32,
    reason: String,
    partition: Option<TopicPartition>,
}

impl Error {
    /// Creates an error of the given kind with its stable code.
    #[must_use]
    pub fn new(kind: ErrorKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            code: kind.code(),
            reason: reason.into(),
            partition: None,
        }
    }

    /// Creates a configuration error.
    #[must_use]
    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration, reason)
    }

    /// Creates a network error.
    #[must_use]
    pub fn network(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, reason)
    }

    /// Creates a broker error carrying the broker-reported code.
    #[must_use]
    pub fn broker(code: i32, reason: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Broker,
            code,
            reason: reason.into(),
            partition: None,
        }
    }

    /// Creates a queue-full error.
    #[must_use]
    pub fn queue_full(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::QueueFull, reason)
    }

    /// Creates a timeout error for the given scope.
    #[must_use]
    pub fn timeout(scope: TimeoutScope, reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout(scope), reason)
    }

    /// Creates a serialization error.
    #[must_use]
    pub fn serialization(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::Serialization, reason)
    }

    /// Creates a deserialization error.
    #[must_use]
    pub fn deserialization(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::Deserialization, reason)
    }

    /// Creates an invalid-offset error.
    #[must_use]
    pub fn invalid_offset(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidOffset, reason)
    }

    /// Creates a cancellation error.
    #[must_use]
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, reason)
    }

    /// Creates a shutdown error.
    #[must_use]
    pub fn shutdown(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::Shutdown, reason)
    }

    /// Attaches the offending partition.
    #[must_use]
    pub fn with_partition(mut self, partition: TopicPartition) -> Self {
        self.partition = Some(partition);
        self
    }

    /// Returns the error kind.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the stable numeric code.
    #[must_use]
    pub fn code(&self) -> i32 {
        self.code
    }

    /// Returns the human-readable reason.
    #[must_use]
    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Returns the offending partition, if known.
    #[must_use]
    pub fn partition(&self) -> Option<&TopicPartition> {
        self.partition.as_ref()
    }

    /// Returns `true` if this is a timeout of any scope.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self.kind, ErrorKind::Timeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::configuration("unknown option 'internal.producer.bogus'");
        assert_eq!(
            err.to_string(),
            "configuration (code 1): unknown option 'internal.producer.bogus'"
        );
    }

    #[test]
    fn test_broker_code_preserved() {
        let err = Error::broker(27, "REBALANCE_IN_PROGRESS");
        assert_eq!(err.kind(), ErrorKind::Broker);
        assert_eq!(err.code(), 27);
    }

    #[test]
    fn test_timeout_scopes_have_distinct_codes() {
        let scopes = [
            TimeoutScope::Ack,
            TimeoutScope::Flush,
            TimeoutScope::Commit,
            TimeoutScope::Poll,
        ];
        let codes: Vec<i32> = scopes
            .iter()
            .map(|s| ErrorKind::Timeout(*s).code())
            .collect();
        let mut deduped = codes.clone();
        deduped.dedup();
        assert_eq!(codes, deduped);
        assert!(Error::timeout(TimeoutScope::Ack, "no ack").is_timeout());
    }

    #[test]
    fn test_partition_attachment() {
        let tp = TopicPartition::new("events", 3);
        let err = Error::invalid_offset("offset 42 never delivered").with_partition(tp.clone());
        assert_eq!(err.partition(), Some(&tp));
    }
}
