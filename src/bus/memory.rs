use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, watch, RwLock};
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use super::{
    subject_matches, BucketConfig, BusError, ConsumerConfig, FanoutBackend, FanoutMessage,
    KvBackend, KvEntry, KvEvent, KvOperation, KvWatch, RetentionPolicy, StreamBackend,
    StreamConfig, StreamMessage,
};

const WATCH_CAPACITY: usize = 1024;
const FANOUT_CAPACITY: usize = 1024;

struct StoredValue {
    value: Vec<u8>,
    revision: u64,
    written_at: Instant,
}

struct Bucket {
    config: BucketConfig,
    entries: HashMap<String, StoredValue>,
    last_revision: u64,
    watchers: broadcast::Sender<KvEvent>,
}

impl Bucket {
    fn new(config: BucketConfig) -> Self {
        let (watchers, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            config,
            entries: HashMap::new(),
            last_revision: 0,
            watchers,
        }
    }

    /// Drops entries older than the bucket TTL. Expiry emits no watch event.
    fn purge_expired(&mut self) {
        if let Some(ttl) = self.config.ttl {
            let now = Instant::now();
            self.entries
                .retain(|_, stored| now.duration_since(stored.written_at) < ttl);
        }
    }

    fn write(&mut self, key: &str, value: Vec<u8>) -> u64 {
        self.last_revision += 1;
        let revision = self.last_revision;
        self.entries.insert(
            key.to_string(),
            StoredValue {
                value: value.clone(),
                revision,
                written_at: Instant::now(),
            },
        );

        // No receivers is fine
        let _ = self.watchers.send(KvEvent {
            bucket: self.config.name.clone(),
            key: key.to_string(),
            value,
            revision,
            operation: KvOperation::Put,
        });

        revision
    }

    fn remove(&mut self, key: &str) -> bool {
        if self.entries.remove(key).is_none() {
            return false;
        }

        self.last_revision += 1;
        let _ = self.watchers.send(KvEvent {
            bucket: self.config.name.clone(),
            key: key.to_string(),
            value: Vec::new(),
            revision: self.last_revision,
            operation: KvOperation::Delete,
        });
        true
    }
}

struct StoredMessage {
    subject: String,
    payload: Vec<u8>,
}

struct PendingDelivery {
    redeliver_at: Instant,
    delivered: u32,
}

struct ConsumerState {
    config: ConsumerConfig,
    /// Highest sequence already examined for first delivery
    cursor: u64,
    pending: BTreeMap<u64, PendingDelivery>,
}

impl ConsumerState {
    fn accepts(&self, subject: &str) -> bool {
        self.config
            .filter_subject
            .as_deref()
            .map_or(true, |filter| subject_matches(filter, subject))
    }
}

struct Stream {
    config: StreamConfig,
    messages: BTreeMap<u64, StoredMessage>,
    last_sequence: u64,
    consumers: HashMap<String, ConsumerState>,
    sequence_tx: watch::Sender<u64>,
}

impl Stream {
    fn new(config: StreamConfig) -> Self {
        let (sequence_tx, _) = watch::channel(0);
        Self {
            config,
            messages: BTreeMap::new(),
            last_sequence: 0,
            consumers: HashMap::new(),
            sequence_tx,
        }
    }

    fn captures(&self, subject: &str) -> bool {
        self.config
            .subjects
            .iter()
            .any(|pattern| subject_matches(pattern, subject))
    }

    /// Collects redeliveries first, then messages never handed out before
    fn take_batch(&mut self, consumer: &str, max: usize) -> Result<Vec<StreamMessage>, BusError> {
        let Stream {
            config,
            messages,
            consumers,
            ..
        } = self;

        let state = consumers
            .get_mut(consumer)
            .ok_or_else(|| BusError::ConsumerNotFound {
                stream: config.name.clone(),
                consumer: consumer.to_string(),
            })?;

        let now = Instant::now();
        let ack_wait = state.config.ack_wait;
        let mut batch = Vec::new();

        // Messages removed by a work-queue ack elsewhere are no longer pending
        state.pending.retain(|seq, _| messages.contains_key(seq));

        for (sequence, pending) in state.pending.iter_mut() {
            if batch.len() >= max {
                break;
            }
            if pending.redeliver_at > now {
                continue;
            }
            if let Some(message) = messages.get(sequence) {
                pending.delivered += 1;
                pending.redeliver_at = now + ack_wait;
                batch.push(StreamMessage {
                    stream: config.name.clone(),
                    subject: message.subject.clone(),
                    sequence: *sequence,
                    payload: message.payload.clone(),
                    delivered: pending.delivered,
                });
            }
        }

        let start = state.cursor + 1;
        for (sequence, message) in messages.range(start..) {
            if batch.len() >= max {
                break;
            }
            state.cursor = *sequence;
            if !state.accepts(&message.subject) {
                continue;
            }
            state.pending.insert(
                *sequence,
                PendingDelivery {
                    redeliver_at: now + ack_wait,
                    delivered: 1,
                },
            );
            batch.push(StreamMessage {
                stream: config.name.clone(),
                subject: message.subject.clone(),
                sequence: *sequence,
                payload: message.payload.clone(),
                delivered: 1,
            });
        }

        Ok(batch)
    }
}

/// In-process substrate with the semantics of a JetStream deployment
///
/// Used by the development binary and by every test. Several stores (and
/// several "processes" in tests) can share one instance through an `Arc`.
pub struct InMemorySubstrate {
    buckets: RwLock<HashMap<String, Bucket>>,
    streams: RwLock<HashMap<String, Stream>>,
    fanout: RwLock<HashMap<String, broadcast::Sender<FanoutMessage>>>,
    offline: AtomicBool,
}

impl Default for InMemorySubstrate {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemorySubstrate {
    pub fn new() -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
            streams: RwLock::new(HashMap::new()),
            fanout: RwLock::new(HashMap::new()),
            offline: AtomicBool::new(false),
        }
    }

    /// Simulates losing the connection: every call fails with `Unavailable`
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn ensure_online(&self) -> Result<(), BusError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(BusError::Unavailable("connection closed".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl KvBackend for InMemorySubstrate {
    #[instrument(skip(self, config), fields(bucket = %config.name))]
    async fn create_bucket(&self, config: BucketConfig) -> Result<(), BusError> {
        self.ensure_online()?;
        let mut buckets = self.buckets.write().await;

        match buckets.get_mut(&config.name) {
            Some(bucket) => {
                bucket.config = config;
            }
            None => {
                debug!(ttl = ?config.ttl, replicas = config.replicas, "Creating bucket");
                buckets.insert(config.name.clone(), Bucket::new(config));
            }
        }
        Ok(())
    }

    async fn delete_bucket(&self, bucket: &str) -> Result<(), BusError> {
        self.ensure_online()?;
        // Dropping the bucket drops its watch sender, which ends every watch
        if self.buckets.write().await.remove(bucket).is_some() {
            debug!(bucket = %bucket, "Bucket deleted");
        }
        Ok(())
    }

    async fn bucket_exists(&self, bucket: &str) -> Result<bool, BusError> {
        self.ensure_online()?;
        Ok(self.buckets.read().await.contains_key(bucket))
    }

    async fn bucket_names(&self, prefix: &str) -> Result<Vec<String>, BusError> {
        self.ensure_online()?;
        let buckets = self.buckets.read().await;
        let mut names: Vec<String> = buckets
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect();
        names.sort();
        Ok(names)
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Option<KvEntry>, BusError> {
        self.ensure_online()?;
        let mut buckets = self.buckets.write().await;
        let bucket_state = buckets
            .get_mut(bucket)
            .ok_or_else(|| BusError::BucketNotFound(bucket.to_string()))?;
        bucket_state.purge_expired();

        Ok(bucket_state.entries.get(key).map(|stored| KvEntry {
            key: key.to_string(),
            value: stored.value.clone(),
            revision: stored.revision,
        }))
    }

    async fn keys(&self, bucket: &str) -> Result<Vec<String>, BusError> {
        self.ensure_online()?;
        let mut buckets = self.buckets.write().await;
        let bucket_state = buckets
            .get_mut(bucket)
            .ok_or_else(|| BusError::BucketNotFound(bucket.to_string()))?;
        bucket_state.purge_expired();

        let mut keys: Vec<String> = bucket_state.entries.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    async fn put(&self, bucket: &str, key: &str, value: Vec<u8>) -> Result<u64, BusError> {
        self.ensure_online()?;
        let mut buckets = self.buckets.write().await;
        let bucket_state = buckets
            .get_mut(bucket)
            .ok_or_else(|| BusError::BucketNotFound(bucket.to_string()))?;
        Ok(bucket_state.write(key, value))
    }

    async fn create(&self, bucket: &str, key: &str, value: Vec<u8>) -> Result<u64, BusError> {
        self.ensure_online()?;
        let mut buckets = self.buckets.write().await;
        let bucket_state = buckets
            .get_mut(bucket)
            .ok_or_else(|| BusError::BucketNotFound(bucket.to_string()))?;
        bucket_state.purge_expired();

        if bucket_state.entries.contains_key(key) {
            return Err(BusError::KeyExists {
                bucket: bucket.to_string(),
                key: key.to_string(),
            });
        }
        Ok(bucket_state.write(key, value))
    }

    async fn update(
        &self,
        bucket: &str,
        key: &str,
        value: Vec<u8>,
        expected_revision: u64,
    ) -> Result<u64, BusError> {
        self.ensure_online()?;
        let mut buckets = self.buckets.write().await;
        let bucket_state = buckets
            .get_mut(bucket)
            .ok_or_else(|| BusError::BucketNotFound(bucket.to_string()))?;
        bucket_state.purge_expired();

        let found = bucket_state
            .entries
            .get(key)
            .map(|stored| stored.revision)
            .unwrap_or(0);
        if found != expected_revision {
            return Err(BusError::WrongRevision {
                bucket: bucket.to_string(),
                key: key.to_string(),
                expected: expected_revision,
                found,
            });
        }
        Ok(bucket_state.write(key, value))
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), BusError> {
        self.ensure_online()?;
        let mut buckets = self.buckets.write().await;
        let bucket_state = buckets
            .get_mut(bucket)
            .ok_or_else(|| BusError::BucketNotFound(bucket.to_string()))?;
        bucket_state.remove(key);
        Ok(())
    }

    async fn delete_if_revision(
        &self,
        bucket: &str,
        key: &str,
        revision: u64,
    ) -> Result<bool, BusError> {
        self.ensure_online()?;
        let mut buckets = self.buckets.write().await;
        let bucket_state = buckets
            .get_mut(bucket)
            .ok_or_else(|| BusError::BucketNotFound(bucket.to_string()))?;
        bucket_state.purge_expired();

        match bucket_state.entries.get(key) {
            Some(stored) if stored.revision == revision => Ok(bucket_state.remove(key)),
            _ => Ok(false),
        }
    }

    async fn watch(&self, bucket: &str) -> Result<KvWatch, BusError> {
        self.ensure_online()?;
        let buckets = self.buckets.read().await;
        let bucket_state = buckets
            .get(bucket)
            .ok_or_else(|| BusError::BucketNotFound(bucket.to_string()))?;
        let receiver = bucket_state.watchers.subscribe();
        let bucket_name = bucket.to_string();

        let events = futures::stream::unfold(receiver, move |mut receiver| {
            let bucket_name = bucket_name.clone();
            async move {
                match receiver.recv().await {
                    Ok(event) => Some((event, receiver)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // A lagging watcher has missed updates; ending it forces a re-read
                        warn!(bucket = %bucket_name, skipped, "KV watch lagged, closing");
                        None
                    }
                    Err(broadcast::error::RecvError::Closed) => None,
                }
            }
        });

        Ok(events.boxed())
    }
}

#[async_trait]
impl StreamBackend for InMemorySubstrate {
    #[instrument(skip(self, config), fields(stream = %config.name))]
    async fn create_stream(&self, config: StreamConfig) -> Result<(), BusError> {
        self.ensure_online()?;
        let mut streams = self.streams.write().await;

        match streams.get_mut(&config.name) {
            Some(stream) => {
                stream.config = config;
            }
            None => {
                debug!(subjects = ?config.subjects, retention = ?config.retention, "Creating stream");
                streams.insert(config.name.clone(), Stream::new(config));
            }
        }
        Ok(())
    }

    async fn delete_stream(&self, stream: &str) -> Result<(), BusError> {
        self.ensure_online()?;
        if self.streams.write().await.remove(stream).is_some() {
            debug!(stream = %stream, "Stream deleted");
        }
        Ok(())
    }

    async fn stream_exists(&self, stream: &str) -> Result<bool, BusError> {
        self.ensure_online()?;
        Ok(self.streams.read().await.contains_key(stream))
    }

    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<u64, BusError> {
        self.ensure_online()?;
        let mut streams = self.streams.write().await;
        let stream = streams
            .values_mut()
            .find(|stream| stream.captures(subject))
            .ok_or_else(|| BusError::NoStreamForSubject(subject.to_string()))?;

        stream.last_sequence += 1;
        let sequence = stream.last_sequence;
        stream.messages.insert(
            sequence,
            StoredMessage {
                subject: subject.to_string(),
                payload,
            },
        );
        stream.sequence_tx.send_replace(sequence);

        Ok(sequence)
    }

    async fn create_or_update_consumer(
        &self,
        stream: &str,
        config: ConsumerConfig,
    ) -> Result<(), BusError> {
        self.ensure_online()?;
        let mut streams = self.streams.write().await;
        let stream_state = streams
            .get_mut(stream)
            .ok_or_else(|| BusError::StreamNotFound(stream.to_string()))?;

        match stream_state.consumers.get_mut(&config.durable_name) {
            Some(existing) => existing.config = config,
            None => {
                stream_state.consumers.insert(
                    config.durable_name.clone(),
                    ConsumerState {
                        config,
                        cursor: 0,
                        pending: BTreeMap::new(),
                    },
                );
            }
        }
        Ok(())
    }

    async fn delete_consumer(&self, stream: &str, consumer: &str) -> Result<(), BusError> {
        self.ensure_online()?;
        let mut streams = self.streams.write().await;
        let stream_state = streams
            .get_mut(stream)
            .ok_or_else(|| BusError::StreamNotFound(stream.to_string()))?;
        stream_state.consumers.remove(consumer);
        Ok(())
    }

    async fn consumer_names(&self, stream: &str) -> Result<Vec<String>, BusError> {
        self.ensure_online()?;
        let streams = self.streams.read().await;
        let stream_state = streams
            .get(stream)
            .ok_or_else(|| BusError::StreamNotFound(stream.to_string()))?;
        let mut names: Vec<String> = stream_state.consumers.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn fetch(
        &self,
        stream: &str,
        consumer: &str,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<StreamMessage>, BusError> {
        let deadline = Instant::now() + wait;

        loop {
            self.ensure_online()?;
            let mut sequence_rx = {
                let mut streams = self.streams.write().await;
                let stream_state = streams
                    .get_mut(stream)
                    .ok_or_else(|| BusError::StreamNotFound(stream.to_string()))?;

                let batch = stream_state.take_batch(consumer, max)?;
                if !batch.is_empty() || Instant::now() >= deadline {
                    return Ok(batch);
                }
                // Subscribed under the lock so no publish can slip between
                stream_state.sequence_tx.subscribe()
            };

            match tokio::time::timeout_at(deadline, sequence_rx.changed()).await {
                Ok(Ok(())) => continue,
                // Stream deleted; the next pass reports it
                Ok(Err(_)) => continue,
                Err(_elapsed) => return Ok(Vec::new()),
            }
        }
    }

    async fn ack(&self, stream: &str, consumer: &str, sequence: u64) -> Result<(), BusError> {
        self.ensure_online()?;
        let mut streams = self.streams.write().await;
        let stream_state = streams
            .get_mut(stream)
            .ok_or_else(|| BusError::StreamNotFound(stream.to_string()))?;

        let state = stream_state
            .consumers
            .get_mut(consumer)
            .ok_or_else(|| BusError::ConsumerNotFound {
                stream: stream.to_string(),
                consumer: consumer.to_string(),
            })?;
        state.pending.remove(&sequence);

        if stream_state.config.retention == RetentionPolicy::WorkQueue {
            stream_state.messages.remove(&sequence);
            for other in stream_state.consumers.values_mut() {
                other.pending.remove(&sequence);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl FanoutBackend for InMemorySubstrate {
    async fn publish_fanout(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError> {
        self.ensure_online()?;
        let fanout = self.fanout.read().await;
        for (pattern, sender) in fanout.iter() {
            if subject_matches(pattern, subject) {
                let _ = sender.send(FanoutMessage {
                    subject: subject.to_string(),
                    payload: payload.clone(),
                });
            }
        }
        Ok(())
    }

    async fn subscribe_fanout(
        &self,
        subject: &str,
    ) -> Result<broadcast::Receiver<FanoutMessage>, BusError> {
        self.ensure_online()?;
        let mut fanout = self.fanout.write().await;
        let sender = fanout
            .entry(subject.to_string())
            .or_insert_with(|| broadcast::channel(FANOUT_CAPACITY).0);
        Ok(sender.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BucketConfig, ConsumerConfig, RetentionPolicy, StreamConfig};

    fn stream_config(name: &str, subjects: &[&str], retention: RetentionPolicy) -> StreamConfig {
        StreamConfig {
            name: name.to_string(),
            subjects: subjects.iter().map(|s| s.to_string()).collect(),
            retention,
            replicas: 1,
        }
    }

    #[tokio::test]
    async fn test_put_and_get_tracks_revisions() {
        let bus = InMemorySubstrate::new();
        bus.create_bucket(BucketConfig::new("b", 1)).await.unwrap();

        let first = bus.put("b", "k", b"one".to_vec()).await.unwrap();
        let second = bus.put("b", "k", b"two".to_vec()).await.unwrap();
        assert!(second > first);

        let entry = bus.get("b", "k").await.unwrap().unwrap();
        assert_eq!(entry.value, b"two".to_vec());
        assert_eq!(entry.revision, second);
    }

    #[tokio::test]
    async fn test_get_from_missing_bucket_fails() {
        let bus = InMemorySubstrate::new();
        let result = bus.get("missing", "k").await;
        assert!(matches!(result, Err(BusError::BucketNotFound(_))));
    }

    #[tokio::test]
    async fn test_create_rejects_existing_key() {
        let bus = InMemorySubstrate::new();
        bus.create_bucket(BucketConfig::new("b", 1)).await.unwrap();

        bus.create("b", "k", b"a".to_vec()).await.unwrap();
        let result = bus.create("b", "k", b"b".to_vec()).await;
        assert!(matches!(result, Err(BusError::KeyExists { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry_frees_key() {
        let bus = InMemorySubstrate::new();
        bus.create_bucket(BucketConfig::new("b", 1).with_ttl(Duration::from_secs(5)))
            .await
            .unwrap();

        bus.create("b", "k", b"a".to_vec()).await.unwrap();
        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(bus.get("b", "k").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(bus.get("b", "k").await.unwrap().is_none());
        assert!(bus.create("b", "k", b"b".to_vec()).await.is_ok());
    }

    #[tokio::test]
    async fn test_update_requires_matching_revision() {
        let bus = InMemorySubstrate::new();
        bus.create_bucket(BucketConfig::new("b", 1)).await.unwrap();
        let revision = bus.put("b", "k", b"a".to_vec()).await.unwrap();

        let stale = bus.update("b", "k", b"b".to_vec(), revision + 10).await;
        assert!(matches!(stale, Err(BusError::WrongRevision { .. })));

        assert!(bus.update("b", "k", b"c".to_vec(), revision).await.is_ok());
    }

    #[tokio::test]
    async fn test_delete_if_revision_ignores_stale_token() {
        let bus = InMemorySubstrate::new();
        bus.create_bucket(BucketConfig::new("b", 1)).await.unwrap();
        let revision = bus.put("b", "k", b"a".to_vec()).await.unwrap();

        assert!(!bus.delete_if_revision("b", "k", revision + 1).await.unwrap());
        assert!(bus.delete_if_revision("b", "k", revision).await.unwrap());
        assert!(bus.get("b", "k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_watch_delivers_changes_and_ends_on_bucket_delete() {
        let bus = InMemorySubstrate::new();
        bus.create_bucket(BucketConfig::new("b", 1)).await.unwrap();
        let mut watch = bus.watch("b").await.unwrap();

        bus.put("b", "status", b"active".to_vec()).await.unwrap();
        bus.delete("b", "status").await.unwrap();

        let put = watch.next().await.unwrap();
        assert_eq!(put.operation, KvOperation::Put);
        assert_eq!(put.value, b"active".to_vec());

        let delete = watch.next().await.unwrap();
        assert_eq!(delete.operation, KvOperation::Delete);

        bus.delete_bucket("b").await.unwrap();
        assert!(watch.next().await.is_none());
    }

    #[tokio::test]
    async fn test_publish_without_stream_fails() {
        let bus = InMemorySubstrate::new();
        let result = bus.publish("r1:system.public", b"x".to_vec()).await;
        assert!(matches!(result, Err(BusError::NoStreamForSubject(_))));
    }

    #[tokio::test]
    async fn test_consumer_filters_and_redelivers_unacked() {
        let bus = InMemorySubstrate::new();
        bus.create_stream(stream_config("r1", &["r1:system.>"], RetentionPolicy::Limits))
            .await
            .unwrap();
        let mut config = ConsumerConfig::new("public", Some("r1:system.public".to_string()));
        config.ack_wait = Duration::ZERO;
        bus.create_or_update_consumer("r1", config).await.unwrap();

        bus.publish("r1:system.public", b"a".to_vec()).await.unwrap();
        bus.publish("r1:system.private.u1", b"b".to_vec()).await.unwrap();

        let first = bus.fetch("r1", "public", 10, Duration::ZERO).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].payload, b"a".to_vec());

        // Not acked and ack_wait elapsed: delivered again
        let again = bus.fetch("r1", "public", 10, Duration::ZERO).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].delivered, 2);

        bus.ack("r1", "public", again[0].sequence).await.unwrap();
        let empty = bus.fetch("r1", "public", 10, Duration::ZERO).await.unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_wakes_on_publish() {
        let bus = std::sync::Arc::new(InMemorySubstrate::new());
        bus.create_stream(stream_config("s", &["s.>"], RetentionPolicy::Limits))
            .await
            .unwrap();
        bus.create_or_update_consumer("s", ConsumerConfig::new("c", None))
            .await
            .unwrap();

        let publisher = bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.publish("s.x", b"late".to_vec()).await.unwrap();
        });

        let batch = bus.fetch("s", "c", 1, Duration::from_secs(2)).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].payload, b"late".to_vec());
    }

    #[tokio::test]
    async fn test_work_queue_ack_removes_message() {
        let bus = InMemorySubstrate::new();
        bus.create_stream(stream_config("wq", &["wq.tasks"], RetentionPolicy::WorkQueue))
            .await
            .unwrap();
        bus.create_or_update_consumer("wq", ConsumerConfig::new("pool", None))
            .await
            .unwrap();

        let seq = bus.publish("wq.tasks", b"job".to_vec()).await.unwrap();
        let batch = bus.fetch("wq", "pool", 1, Duration::ZERO).await.unwrap();
        assert_eq!(batch[0].sequence, seq);
        bus.ack("wq", "pool", seq).await.unwrap();

        // Recreating the consumer from scratch would still find nothing
        bus.delete_consumer("wq", "pool").await.unwrap();
        bus.create_or_update_consumer("wq", ConsumerConfig::new("pool", None))
            .await
            .unwrap();
        assert!(bus.fetch("wq", "pool", 1, Duration::ZERO).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fanout_reaches_wildcard_subscribers() {
        let bus = InMemorySubstrate::new();
        let mut exact = bus.subscribe_fanout("whiteboard.r1").await.unwrap();
        let mut wildcard = bus.subscribe_fanout("whiteboard.*").await.unwrap();

        bus.publish_fanout("whiteboard.r1", b"stroke".to_vec())
            .await
            .unwrap();

        assert_eq!(exact.recv().await.unwrap().payload, b"stroke".to_vec());
        assert_eq!(wildcard.recv().await.unwrap().subject, "whiteboard.r1");
    }

    #[tokio::test]
    async fn test_offline_substrate_fails_every_call() {
        let bus = InMemorySubstrate::new();
        bus.create_bucket(BucketConfig::new("b", 1)).await.unwrap();
        bus.set_offline(true);

        assert!(matches!(
            bus.get("b", "k").await,
            Err(BusError::Unavailable(_))
        ));
        bus.set_offline(false);
        assert!(bus.get("b", "k").await.is_ok());
    }
}
