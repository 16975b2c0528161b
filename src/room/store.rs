use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::durable::RoomInfoRepository;
use super::models::{fields, RoomMetadata, RoomRecord, RoomStatus};
use super::types::CreateRoomRequest;
use crate::bus::naming;
use crate::bus::{BucketConfig, BusError, KvEntry, Substrate};
use crate::cache::record::{decode_json, decode_parsed, encode_display, encode_timestamp};
use crate::cache::{hydrate, FieldRecord, LocalCache};
use crate::event::{EventBus, RoomEvent};
use crate::lock::{Lease, LockManager};
use crate::shared::StoreError;

/// Knobs the room store needs from configuration
#[derive(Debug, Clone)]
pub struct RoomStoreSettings {
    pub replicas: usize,
    pub creation_lock_ttl: Duration,
    pub default_empty_timeout: Duration,
    pub default_max_participants: u32,
}

impl Default for RoomStoreSettings {
    fn default() -> Self {
        Self {
            replicas: 1,
            creation_lock_ttl: Duration::from_secs(30),
            default_empty_timeout: Duration::from_secs(120),
            default_max_participants: 100,
        }
    }
}

/// Registry of room lifetimes, mirrored on the bus
pub struct RoomStateStore {
    bus: Arc<dyn Substrate>,
    events: EventBus,
    cache: LocalCache,
    locks: Arc<LockManager>,
    durable: Arc<dyn RoomInfoRepository>,
    settings: RoomStoreSettings,
}

impl RoomStateStore {
    pub fn new(
        bus: Arc<dyn Substrate>,
        events: EventBus,
        cache: LocalCache,
        locks: Arc<LockManager>,
        durable: Arc<dyn RoomInfoRepository>,
        settings: RoomStoreSettings,
    ) -> Self {
        Self {
            bus,
            events,
            cache,
            locks,
            durable,
            settings,
        }
    }

    /// Starts a room lifetime, or returns the running one on a retried signal
    #[instrument(skip(self, request), fields(room_id = %request.room_id))]
    pub async fn create(&self, request: CreateRoomRequest) -> Result<RoomRecord, StoreError> {
        naming::validate_id("room", &request.room_id)?;
        let lease = self.lock_room(&request.room_id).await?;
        let result = self.create_locked(request).await;
        self.unlock(lease).await;
        result
    }

    async fn create_locked(&self, request: CreateRoomRequest) -> Result<RoomRecord, StoreError> {
        let room_id = request.room_id.as_str();
        let session = self.durable.active_session(room_id).await?;
        let existing = self.load(room_id).await?;

        match (&session, &existing) {
            (Some(session), Some(record))
                if !record.is_ended() && record.room_sid == session.room_sid =>
            {
                info!(room_id = %room_id, room_sid = %record.room_sid, "Room already running, returning it");
                return Ok(record.clone());
            }
            (_, Some(record)) if !record.is_ended() => {
                warn!(room_id = %room_id, room_sid = %record.room_sid, "Live room without matching durable session");
                return Err(StoreError::ConflictAlreadyActive {
                    room_id: room_id.to_string(),
                });
            }
            _ => {}
        }

        if let Some(stale) = &session {
            warn!(room_id = %room_id, room_sid = %stale.room_sid, "Closing durable session with no live room");
            self.durable.mark_ended(&stale.room_sid).await?;
        }
        if existing.is_some() {
            // Previous lifetime ended but was never torn down
            self.cleanup_locked(room_id).await?;
        }

        let mut metadata = request.metadata.unwrap_or_default();
        metadata.validate()?;
        metadata.metadata_id = Uuid::new_v4().to_string();

        let room_sid = Uuid::new_v4().to_string();
        let session = self.durable.insert_session(room_id, &room_sid).await?;

        let record = RoomRecord {
            db_table_id: session.id,
            room_id: room_id.to_string(),
            room_sid,
            status: RoomStatus::Created,
            empty_timeout: request
                .empty_timeout
                .unwrap_or(self.settings.default_empty_timeout.as_secs()),
            max_participants: request
                .max_participants
                .unwrap_or(self.settings.default_max_participants),
            created_at: Some(Utc::now()),
            ended_at: None,
            metadata,
        };

        let bucket = naming::room_bucket(room_id);
        self.bus
            .create_bucket(BucketConfig::new(bucket.clone(), self.settings.replicas))
            .await?;
        for (key, value) in record.to_fields()? {
            self.bus.put(&bucket, &key, value).await?;
        }
        self.bus
            .create_bucket(BucketConfig::new(
                naming::room_users_bucket(room_id),
                self.settings.replicas,
            ))
            .await?;

        self.events.provision_room_stream(room_id).await?;
        self.events.ensure_public_consumers(room_id).await?;

        info!(
            room_id = %room_id,
            room_sid = %record.room_sid,
            db_table_id = record.db_table_id,
            "Room created"
        );
        Ok(record)
    }

    /// Cache-first read. An ended room reads as absent.
    pub async fn read(&self, room_id: &str) -> Result<Option<RoomRecord>, StoreError> {
        let record = self.cache.read_room(room_id).await?;
        Ok(record.filter(|r| !r.is_ended()))
    }

    /// Every live room this process currently mirrors
    pub async fn list_cached(&self) -> Result<Vec<RoomRecord>, StoreError> {
        let mut rooms = Vec::new();
        for room_id in self.cache.cached_room_ids().await {
            if let Some(record) = self.read(&room_id).await? {
                rooms.push(record);
            }
        }
        Ok(rooms)
    }

    /// Ended rooms whose data is still on the bus, read directly from it
    pub async fn list_ended(&self) -> Result<Vec<RoomRecord>, StoreError> {
        let prefix = naming::room_bucket("");
        let mut ended = Vec::new();
        for bucket in self.bus.bucket_names(&prefix).await? {
            match hydrate::<RoomRecord>(self.bus.as_ref(), &bucket).await {
                // Roster buckets share the prefix but never name themselves
                Ok(Some(record))
                    if record.is_ended() && naming::room_bucket(&record.room_id) == bucket =>
                {
                    ended.push(record)
                }
                Ok(_) => {}
                Err(e) => warn!(bucket = %bucket, error = %e, "Skipping unreadable room bucket"),
            }
        }
        Ok(ended)
    }

    /// Replaces the metadata blob as a whole
    ///
    /// With `expected_metadata_id` set, the write is rejected unless it is
    /// based on the current version. Without it the last writer wins.
    #[instrument(skip(self, metadata))]
    pub async fn update_metadata(
        &self,
        room_id: &str,
        mut metadata: RoomMetadata,
        expected_metadata_id: Option<&str>,
    ) -> Result<RoomMetadata, StoreError> {
        metadata.validate()?;
        self.require_live(room_id).await?;

        let bucket = naming::room_bucket(room_id);
        let current = self.get_field(&bucket, fields::METADATA).await?;

        metadata.metadata_id = Uuid::new_v4().to_string();
        let bytes = serde_json::to_vec(&metadata)?;

        match (expected_metadata_id, current) {
            (Some(expected), Some(entry)) => {
                let current_metadata: RoomMetadata = decode_json(fields::METADATA, &entry.value)?;
                if current_metadata.metadata_id != expected {
                    return Err(StoreError::ConflictStaleWrite {
                        expected: expected.to_string(),
                        current: current_metadata.metadata_id,
                    });
                }
                match self
                    .bus
                    .update(&bucket, fields::METADATA, bytes, entry.revision)
                    .await
                {
                    Ok(_) => {}
                    Err(BusError::WrongRevision { .. }) => {
                        return Err(StoreError::ConflictStaleWrite {
                            expected: expected.to_string(),
                            current: "concurrent write".to_string(),
                        });
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            _ => {
                self.bus.put(&bucket, fields::METADATA, bytes).await?;
            }
        }

        self.events
            .publish(
                room_id,
                &RoomEvent::RoomMetadataUpdated {
                    metadata: metadata.clone(),
                },
                None,
            )
            .await?;

        info!(room_id = %room_id, metadata_id = %metadata.metadata_id, "Room metadata replaced");
        Ok(metadata)
    }

    /// Moves a room from `created` to `active` once its first participant connects
    #[instrument(skip(self))]
    pub async fn activate(&self, room_id: &str) -> Result<bool, StoreError> {
        let status = self.require_live(room_id).await?;
        if status != RoomStatus::Created {
            return Ok(false);
        }

        self.bus
            .put(
                &naming::room_bucket(room_id),
                fields::STATUS,
                encode_display(RoomStatus::Active),
            )
            .await?;
        debug!(room_id = %room_id, "Room activated");
        Ok(true)
    }

    /// Ends the current lifetime. Returns whether this call ended it.
    ///
    /// Data stays on the bus until `cleanup` runs.
    #[instrument(skip(self))]
    pub async fn end(&self, room_id: &str, reason: &str) -> Result<bool, StoreError> {
        let Some(record) = self.load(room_id).await? else {
            debug!(room_id = %room_id, "End on unknown room");
            return Ok(false);
        };
        if record.is_ended() {
            // An earlier end may have stopped before durable storage caught up
            self.durable.mark_ended(&record.room_sid).await?;
            return Ok(false);
        }

        let announcement = RoomEvent::SessionEnded {
            reason: reason.to_string(),
        };
        if let Err(e) = self.events.publish(room_id, &announcement, None).await {
            warn!(room_id = %room_id, error = %e, "Could not announce session end");
        }

        let bucket = naming::room_bucket(room_id);
        self.bus
            .put(&bucket, fields::ENDED_AT, encode_timestamp(&Some(Utc::now())))
            .await?;
        self.bus
            .put(&bucket, fields::STATUS, encode_display(RoomStatus::Ended))
            .await?;
        self.cache.evict_room(room_id).await;
        self.durable.mark_ended(&record.room_sid).await?;

        info!(room_id = %room_id, room_sid = %record.room_sid, reason = %reason, "Room ended");
        Ok(true)
    }

    /// Physically removes an ended room's log and buckets
    ///
    /// A room that is live again (recreated since it ended) is left untouched.
    #[instrument(skip(self))]
    pub async fn cleanup(&self, room_id: &str) -> Result<(), StoreError> {
        let lease = self.lock_room(room_id).await?;
        let result = match self.load(room_id).await {
            Ok(Some(record)) if !record.is_ended() => {
                info!(room_id = %room_id, "Room is live again, skipping cleanup");
                Ok(())
            }
            Ok(_) => self.cleanup_locked(room_id).await,
            Err(e) => Err(e),
        };
        self.unlock(lease).await;
        result
    }

    async fn cleanup_locked(&self, room_id: &str) -> Result<(), StoreError> {
        let roster_bucket = naming::room_users_bucket(room_id);
        let user_ids = match self.bus.keys(&roster_bucket).await {
            Ok(keys) => keys,
            Err(BusError::BucketNotFound(_)) => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        self.events.delete_room_stream(room_id).await?;
        for user_id in &user_ids {
            self.bus
                .delete_bucket(&naming::user_info_bucket(room_id, user_id))
                .await?;
        }
        self.bus.delete_bucket(&roster_bucket).await?;
        self.bus.delete_bucket(&naming::room_bucket(room_id)).await?;
        self.cache.evict_room(room_id).await;

        info!(room_id = %room_id, users = user_ids.len(), "Room data removed");
        Ok(())
    }

    /// Direct bus read, bypassing the cache
    async fn load(&self, room_id: &str) -> Result<Option<RoomRecord>, StoreError> {
        hydrate::<RoomRecord>(self.bus.as_ref(), &naming::room_bucket(room_id)).await
    }

    /// Current status, or `NotFound` when the room is absent or ended
    async fn require_live(&self, room_id: &str) -> Result<RoomStatus, StoreError> {
        let entry = self
            .get_field(&naming::room_bucket(room_id), fields::STATUS)
            .await?;
        let status = match entry {
            Some(entry) => decode_parsed::<RoomStatus>(fields::STATUS, &entry.value)?,
            None => return Err(StoreError::NotFound(format!("room {room_id}"))),
        };
        if status == RoomStatus::Ended {
            return Err(StoreError::NotFound(format!("room {room_id}")));
        }
        Ok(status)
    }

    async fn get_field(&self, bucket: &str, key: &str) -> Result<Option<KvEntry>, StoreError> {
        match self.bus.get(bucket, key).await {
            Ok(entry) => Ok(entry),
            Err(BusError::BucketNotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn lock_room(&self, room_id: &str) -> Result<Lease, StoreError> {
        self.locks
            .acquire_room_creation(room_id, self.settings.creation_lock_ttl)
            .await
    }

    async fn unlock(&self, lease: Lease) {
        if let Err(e) = self.locks.release(lease).await {
            // The TTL frees it anyway
            warn!(error = %e, "Failed to release room lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{InMemorySubstrate, KvBackend, StreamBackend};
    use crate::room::durable::{InMemoryRoomInfoRepository, RoomSession};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Durable storage whose next `mark_ended` fails
    struct FlakyEndRepository {
        inner: InMemoryRoomInfoRepository,
        fail_next_end: AtomicBool,
    }

    #[async_trait]
    impl RoomInfoRepository for FlakyEndRepository {
        async fn active_session(&self, room_id: &str) -> Result<Option<RoomSession>, StoreError> {
            self.inner.active_session(room_id).await
        }

        async fn insert_session(
            &self,
            room_id: &str,
            room_sid: &str,
        ) -> Result<RoomSession, StoreError> {
            self.inner.insert_session(room_id, room_sid).await
        }

        async fn mark_ended(&self, room_sid: &str) -> Result<(), StoreError> {
            if self.fail_next_end.swap(false, Ordering::SeqCst) {
                return Err(StoreError::Durable("connection reset".into()));
            }
            self.inner.mark_ended(room_sid).await
        }

        async fn active_sessions(&self) -> Result<Vec<RoomSession>, StoreError> {
            self.inner.active_sessions().await
        }

        async fn update_participants(&self, room_sid: &str, count: i32) -> Result<(), StoreError> {
            self.inner.update_participants(room_sid, count).await
        }
    }

    struct Fixture {
        bus: Arc<InMemorySubstrate>,
        durable: Arc<InMemoryRoomInfoRepository>,
        store: RoomStateStore,
    }

    fn store_over(
        bus: &Arc<InMemorySubstrate>,
        durable: Arc<dyn RoomInfoRepository>,
    ) -> RoomStateStore {
        RoomStateStore::new(
            bus.clone(),
            EventBus::new(bus.clone(), 1),
            LocalCache::new(bus.clone()),
            Arc::new(LockManager::new(bus.clone(), 1)),
            durable,
            RoomStoreSettings::default(),
        )
    }

    fn fixture() -> Fixture {
        let bus = Arc::new(InMemorySubstrate::new());
        let durable = Arc::new(InMemoryRoomInfoRepository::new());
        let store = store_over(&bus, durable.clone());
        Fixture {
            bus,
            durable,
            store,
        }
    }

    #[tokio::test]
    async fn test_create_provisions_bucket_and_stream() {
        let f = fixture();
        let record = f.store.create(CreateRoomRequest::new("r1")).await.unwrap();

        assert_eq!(record.status, RoomStatus::Created);
        assert_eq!(record.empty_timeout, 120);
        assert!(!record.metadata.metadata_id.is_empty());
        assert!(f.bus.stream_exists("r1").await.unwrap());
        assert!(f.bus.bucket_exists("pnm-room-users-r1").await.unwrap());

        let read = f.store.read("r1").await.unwrap().unwrap();
        assert_eq!(read.room_sid, record.room_sid);
    }

    #[tokio::test]
    async fn test_live_room_without_durable_session_conflicts() {
        let f = fixture();
        let record = f.store.create(CreateRoomRequest::new("r1")).await.unwrap();
        f.durable.mark_ended(&record.room_sid).await.unwrap();

        let result = f.store.create(CreateRoomRequest::new("r1")).await;
        assert!(matches!(
            result,
            Err(StoreError::ConflictAlreadyActive { .. })
        ));
    }

    #[tokio::test]
    async fn test_create_after_end_starts_new_lifetime() {
        let f = fixture();
        let first = f.store.create(CreateRoomRequest::new("r1")).await.unwrap();
        assert!(f.store.end("r1", "test").await.unwrap());

        let second = f.store.create(CreateRoomRequest::new("r1")).await.unwrap();
        assert_ne!(first.room_sid, second.room_sid);
        assert_eq!(f.durable.active_sessions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_ended_room_reads_as_absent_before_cleanup() {
        let f = fixture();
        f.store.create(CreateRoomRequest::new("r1")).await.unwrap();
        f.store.read("r1").await.unwrap();

        assert!(f.store.end("r1", "test").await.unwrap());
        assert!(f.store.read("r1").await.unwrap().is_none());
        assert!(f.bus.bucket_exists("pnm-room-r1").await.unwrap());

        f.store.cleanup("r1").await.unwrap();
        assert!(!f.bus.bucket_exists("pnm-room-r1").await.unwrap());
        assert!(!f.bus.stream_exists("r1").await.unwrap());
    }

    #[tokio::test]
    async fn test_cleanup_leaves_live_room_alone() {
        let f = fixture();
        f.store.create(CreateRoomRequest::new("r1")).await.unwrap();

        f.store.cleanup("r1").await.unwrap();
        assert!(f.store.read("r1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_stale_metadata_write_is_rejected() {
        let f = fixture();
        let record = f.store.create(CreateRoomRequest::new("r1")).await.unwrap();
        let base = record.metadata.metadata_id.clone();

        let first = RoomMetadata {
            room_title: "first".into(),
            ..RoomMetadata::default()
        };
        let updated = f
            .store
            .update_metadata("r1", first, Some(&base))
            .await
            .unwrap();
        assert_ne!(updated.metadata_id, base);

        let second = RoomMetadata {
            room_title: "second".into(),
            ..RoomMetadata::default()
        };
        let result = f.store.update_metadata("r1", second, Some(&base)).await;
        assert!(matches!(result, Err(StoreError::ConflictStaleWrite { .. })));
    }

    #[tokio::test]
    async fn test_update_metadata_on_missing_room() {
        let f = fixture();
        let result = f
            .store
            .update_metadata("nope", RoomMetadata::default(), None)
            .await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_activate_only_from_created() {
        let f = fixture();
        f.store.create(CreateRoomRequest::new("r1")).await.unwrap();

        assert!(f.store.activate("r1").await.unwrap());
        assert!(!f.store.activate("r1").await.unwrap());

        let status = f.bus.get("pnm-room-r1", fields::STATUS).await.unwrap().unwrap();
        assert_eq!(status.value, b"active".to_vec());
    }

    #[tokio::test]
    async fn test_list_cached_skips_ended_rooms() {
        let f = fixture();
        for room_id in ["r1", "r2"] {
            f.store.create(CreateRoomRequest::new(room_id)).await.unwrap();
            f.store.read(room_id).await.unwrap();
        }
        f.store.end("r2", "test").await.unwrap();

        let live: Vec<String> = f
            .store
            .list_cached()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.room_id)
            .collect();
        assert_eq!(live, vec!["r1".to_string()]);
    }

    #[tokio::test]
    async fn test_list_ended_finds_rooms_awaiting_cleanup() {
        let f = fixture();
        f.store.create(CreateRoomRequest::new("r1")).await.unwrap();
        f.store.create(CreateRoomRequest::new("r2")).await.unwrap();
        f.store.end("r1", "test").await.unwrap();

        let ended = f.store.list_ended().await.unwrap();
        assert_eq!(ended.len(), 1);
        assert_eq!(ended[0].room_id, "r1");
        assert!(ended[0].ended_at.is_some());

        f.store.cleanup("r1").await.unwrap();
        assert!(f.store.list_ended().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_end_retry_closes_durable_session() {
        let bus = Arc::new(InMemorySubstrate::new());
        let durable = Arc::new(FlakyEndRepository {
            inner: InMemoryRoomInfoRepository::new(),
            fail_next_end: AtomicBool::new(false),
        });
        let store = store_over(&bus, durable.clone());
        store.create(CreateRoomRequest::new("r1")).await.unwrap();

        durable.fail_next_end.store(true, Ordering::SeqCst);
        assert!(matches!(
            store.end("r1", "test").await,
            Err(StoreError::Durable(_))
        ));
        assert_eq!(durable.active_sessions().await.unwrap().len(), 1);

        assert!(!store.end("r1", "test").await.unwrap());
        assert!(durable.active_sessions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reserved_room_id_is_rejected() {
        let f = fixture();
        for room_id in ["r.1", "*", ""] {
            let result = f.store.create(CreateRoomRequest::new(room_id)).await;
            assert!(matches!(result, Err(StoreError::InvalidIdentifier(_))));
        }
        assert!(f.bus.bucket_names("pnm").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_room_churn_leaves_only_the_shared_lock_bucket() {
        let f = fixture();
        for i in 0..5 {
            let room_id = format!("r{i}");
            f.store.create(CreateRoomRequest::new(&room_id)).await.unwrap();
            f.store.end(&room_id, "test").await.unwrap();
            f.store.cleanup(&room_id).await.unwrap();
        }

        assert_eq!(
            f.bus.bucket_names("pnm").await.unwrap(),
            vec!["pnm-lock-room-creation".to_string()]
        );
    }
}
