// Replicated key-value / stream substrate
//
// Everything that is shared between server processes lives behind these
// traits. Stores never talk to a concrete client, only to `Substrate`.

// Public API - what other modules can use
pub use memory::InMemorySubstrate;

// Internal modules
mod memory;
pub mod naming;

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;

/// Errors raised by the substrate itself
///
/// Every variant here is a "transient bus error" from the point of view of
/// the stores: it is propagated, never swallowed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BusError {
    #[error("Bucket not found: {0}")]
    BucketNotFound(String),

    #[error("Key {key} already exists in bucket {bucket}")]
    KeyExists { bucket: String, key: String },

    #[error("Wrong last revision for {bucket}/{key}: expected {expected}, found {found}")]
    WrongRevision {
        bucket: String,
        key: String,
        expected: u64,
        found: u64,
    },

    #[error("Stream not found: {0}")]
    StreamNotFound(String),

    #[error("No stream captures subject {0}")]
    NoStreamForSubject(String),

    #[error("Consumer {consumer} not found on stream {stream}")]
    ConsumerNotFound { stream: String, consumer: String },

    #[error("Substrate unavailable: {0}")]
    Unavailable(String),
}

/// Configuration for a key-value bucket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketConfig {
    pub name: String,
    /// Maximum age of every entry; `None` keeps entries until deleted
    pub ttl: Option<Duration>,
    pub replicas: usize,
}

impl BucketConfig {
    pub fn new(name: impl Into<String>, replicas: usize) -> Self {
        Self {
            name: name.into(),
            ttl: None,
            replicas,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// A stored value with its bucket-wide revision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    pub key: String,
    pub value: Vec<u8>,
    pub revision: u64,
}

/// The kind of change a watch reports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvOperation {
    Put,
    Delete,
}

/// A single change notification delivered to watchers of a bucket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEvent {
    pub bucket: String,
    pub key: String,
    pub value: Vec<u8>,
    pub revision: u64,
    pub operation: KvOperation,
}

/// Live change feed for one bucket. Ends when the bucket is destroyed.
pub type KvWatch = BoxStream<'static, KvEvent>;

/// Retention policy of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionPolicy {
    /// Messages stay until the stream is deleted (per-room logs)
    Limits,
    /// A message is removed once any consumer acknowledges it
    WorkQueue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    pub name: String,
    /// Subject patterns captured by this stream (`*` and trailing `>` allowed)
    pub subjects: Vec<String>,
    pub retention: RetentionPolicy,
    pub replicas: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    pub durable_name: String,
    pub filter_subject: Option<String>,
    /// How long a fetched message may stay unacknowledged before redelivery
    pub ack_wait: Duration,
}

impl ConsumerConfig {
    pub fn new(durable_name: impl Into<String>, filter_subject: Option<String>) -> Self {
        Self {
            durable_name: durable_name.into(),
            filter_subject,
            ack_wait: Duration::from_secs(30),
        }
    }
}

/// A message delivered by a durable consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMessage {
    pub stream: String,
    pub subject: String,
    pub sequence: u64,
    pub payload: Vec<u8>,
    /// Number of times this message has been handed out, starting at 1
    pub delivered: u32,
}

/// A best-effort message with no persistence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FanoutMessage {
    pub subject: String,
    pub payload: Vec<u8>,
}

#[async_trait]
pub trait KvBackend: Send + Sync {
    /// Creates the bucket, or updates its configuration if it already exists
    async fn create_bucket(&self, config: BucketConfig) -> Result<(), BusError>;
    async fn delete_bucket(&self, bucket: &str) -> Result<(), BusError>;
    async fn bucket_exists(&self, bucket: &str) -> Result<bool, BusError>;
    async fn bucket_names(&self, prefix: &str) -> Result<Vec<String>, BusError>;

    async fn get(&self, bucket: &str, key: &str) -> Result<Option<KvEntry>, BusError>;
    async fn keys(&self, bucket: &str) -> Result<Vec<String>, BusError>;

    /// Unconditional write, returns the new revision
    async fn put(&self, bucket: &str, key: &str, value: Vec<u8>) -> Result<u64, BusError>;

    /// Writes only if the key is absent (or expired)
    async fn create(&self, bucket: &str, key: &str, value: Vec<u8>) -> Result<u64, BusError>;

    /// Writes only if the key's current revision equals `expected_revision`
    async fn update(
        &self,
        bucket: &str,
        key: &str,
        value: Vec<u8>,
        expected_revision: u64,
    ) -> Result<u64, BusError>;

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), BusError>;

    /// Deletes only if the key still carries `revision`. Returns whether it deleted.
    async fn delete_if_revision(
        &self,
        bucket: &str,
        key: &str,
        revision: u64,
    ) -> Result<bool, BusError>;

    async fn watch(&self, bucket: &str) -> Result<KvWatch, BusError>;
}

#[async_trait]
pub trait StreamBackend: Send + Sync {
    async fn create_stream(&self, config: StreamConfig) -> Result<(), BusError>;
    async fn delete_stream(&self, stream: &str) -> Result<(), BusError>;
    async fn stream_exists(&self, stream: &str) -> Result<bool, BusError>;

    /// Appends to whichever stream captures `subject`, returns the sequence
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<u64, BusError>;

    async fn create_or_update_consumer(
        &self,
        stream: &str,
        config: ConsumerConfig,
    ) -> Result<(), BusError>;
    async fn delete_consumer(&self, stream: &str, consumer: &str) -> Result<(), BusError>;
    async fn consumer_names(&self, stream: &str) -> Result<Vec<String>, BusError>;

    /// Pulls up to `max` messages, waiting at most `wait` when none are ready
    async fn fetch(
        &self,
        stream: &str,
        consumer: &str,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<StreamMessage>, BusError>;

    async fn ack(&self, stream: &str, consumer: &str, sequence: u64) -> Result<(), BusError>;
}

#[async_trait]
pub trait FanoutBackend: Send + Sync {
    async fn publish_fanout(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError>;
    async fn subscribe_fanout(
        &self,
        subject: &str,
    ) -> Result<broadcast::Receiver<FanoutMessage>, BusError>;
}

/// The full substrate: key-value, reliable streams and best-effort fanout
pub trait Substrate: KvBackend + StreamBackend + FanoutBackend {}

impl<T: KvBackend + StreamBackend + FanoutBackend> Substrate for T {}

/// Matches a NATS-style subject against a pattern.
///
/// `*` matches exactly one token, a trailing `>` matches one or more tokens.
/// Tokens are separated by `.`.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("r1:system.public", "r1:system.public", true)]
    #[case("r1:system.*", "r1:system.public", true)]
    #[case("r1:system.*", "r1:system.private.u1", false)]
    #[case("r1:system.>", "r1:system.private.u1", true)]
    #[case("r1:>", "r1:chat.public", false)]
    #[case("r1:system.>", "r1:system", false)]
    #[case("whiteboard.*", "whiteboard.r1", true)]
    #[case("whiteboard.r1", "whiteboard.r2", false)]
    fn test_subject_matching(#[case] pattern: &str, #[case] subject: &str, #[case] expected: bool) {
        assert_eq!(subject_matches(pattern, subject), expected);
    }
}
