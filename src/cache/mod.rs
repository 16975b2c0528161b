// Watch-invalidated local mirror of room, user and presence records
//
// One cache object is built per process and handed to every store. A miss
// reads the record field by field from the bus and installs a watch; after
// that, changes only ever arrive through the watch.

// Public API - what other modules can use
pub use record::{EntityKind, FieldRecord};

// Internal modules
mod entity;
pub(crate) mod record;

use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use self::entity::{CachedEntity, RoomUserEntries, UserKey};
use crate::bus::{BusError, KvEvent, KvOperation, KvWatch, Substrate};
use crate::presence::models::{PresenceRoster, UserRecord};
use crate::room::models::RoomRecord;
use crate::shared::StoreError;

/// A cached record plus the signal that stops its background watch
pub(crate) struct CacheEntry<T> {
    value: T,
    cancel: CancellationToken,
    generation: u64,
}

/// Number of live entries per store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub rooms: usize,
    pub rosters: usize,
    pub users: usize,
}

pub(crate) struct CacheInner {
    bus: Arc<dyn Substrate>,
    rooms: RwLock<HashMap<String, CacheEntry<RoomRecord>>>,
    user_info: RwLock<HashMap<String, RoomUserEntries>>,
    shutdown: CancellationToken,
    generation: AtomicU64,
}

enum WatchFlow {
    Continue,
    /// The record reached a terminal state; evict everything under its room
    Terminal,
    /// The entry this watch belonged to is gone or was replaced
    Stale,
}

/// Process-local read-through cache
#[derive(Clone)]
pub struct LocalCache {
    inner: Arc<CacheInner>,
}

impl LocalCache {
    pub fn new(bus: Arc<dyn Substrate>) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                bus,
                rooms: RwLock::new(HashMap::new()),
                user_info: RwLock::new(HashMap::new()),
                shutdown: CancellationToken::new(),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub async fn read_room(&self, room_id: &str) -> Result<Option<RoomRecord>, StoreError> {
        read_through::<RoomRecord>(&self.inner, room_id.to_string()).await
    }

    pub async fn read_user(
        &self,
        room_id: &str,
        user_id: &str,
    ) -> Result<Option<UserRecord>, StoreError> {
        read_through::<UserRecord>(
            &self.inner,
            UserKey {
                room_id: room_id.to_string(),
                user_id: user_id.to_string(),
            },
        )
        .await
    }

    pub async fn read_presence(&self, room_id: &str) -> Result<Option<PresenceRoster>, StoreError> {
        read_through::<PresenceRoster>(&self.inner, room_id.to_string()).await
    }

    /// Drops the room entry and every per-user entry nested under it
    pub async fn evict_room(&self, room_id: &str) {
        self.inner.evict_room(room_id).await;
    }

    /// Drops one user's detail entry and stops its watch
    pub async fn evict_user(&self, room_id: &str, user_id: &str) {
        let key = UserKey {
            room_id: room_id.to_string(),
            user_id: user_id.to_string(),
        };
        let mut user_info = self.inner.user_info.write().await;
        if let Some(entry) = UserRecord::take(&mut user_info, &key) {
            entry.cancel.cancel();
            debug!(room_id = %room_id, user_id = %user_id, "Evicted user entry");
        }
    }

    pub async fn cached_room_ids(&self) -> Vec<String> {
        let rooms = self.inner.rooms.read().await;
        let mut ids: Vec<String> = rooms.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn stats(&self) -> CacheStats {
        let rooms = self.inner.rooms.read().await.len();
        let user_info = self.inner.user_info.read().await;
        CacheStats {
            rooms,
            rosters: user_info.values().filter(|e| e.roster.is_some()).count(),
            users: user_info.values().map(|e| e.users.len()).sum(),
        }
    }

    /// Cancels every background watch and empties the cache
    pub async fn shutdown(&self) {
        info!("Shutting down local cache");
        self.inner.shutdown.cancel();
        self.inner.rooms.write().await.clear();
        self.inner.user_info.write().await.clear();
    }
}

impl CacheInner {
    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::Relaxed) + 1
    }

    async fn evict_room(&self, room_id: &str) {
        if let Some(entry) = self.rooms.write().await.remove(room_id) {
            entry.cancel.cancel();
        }

        if let Some(entries) = self.user_info.write().await.remove(room_id) {
            if let Some(roster) = entries.roster {
                roster.cancel.cancel();
            }
            for entry in entries.users.into_values() {
                entry.cancel.cancel();
            }
        }

        debug!(room_id = %room_id, "Evicted room and nested user entries");
    }

    async fn apply_event<T: CachedEntity>(
        &self,
        key: &T::Key,
        event: &KvEvent,
        generation: u64,
    ) -> Result<WatchFlow, StoreError> {
        let mut map = T::store(self).write().await;
        let Some(entry) = T::slot_mut(&mut map, key) else {
            return Ok(WatchFlow::Stale);
        };
        if entry.generation != generation {
            return Ok(WatchFlow::Stale);
        }

        match event.operation {
            KvOperation::Put => entry.value.apply_field(&event.key, &event.value)?,
            KvOperation::Delete => entry.value.clear_field(&event.key),
        }

        if entry.value.is_terminal() {
            return Ok(WatchFlow::Terminal);
        }
        Ok(WatchFlow::Continue)
    }

    /// Removes the entry only if it still belongs to the exiting watch
    async fn drop_entry<T: CachedEntity>(&self, key: &T::Key, generation: u64) {
        let mut map = T::store(self).write().await;
        let owned = T::slot(&map, key).is_some_and(|entry| entry.generation == generation);
        if owned {
            if let Some(entry) = T::take(&mut map, key) {
                entry.cancel.cancel();
            }
        }
    }
}

/// Hydrate-then-watch, shared by every entity kind
async fn read_through<T: CachedEntity>(
    inner: &Arc<CacheInner>,
    key: T::Key,
) -> Result<Option<T>, StoreError> {
    {
        let map = T::store(inner).read().await;
        if let Some(entry) = T::slot(&map, &key) {
            return Ok(Some(entry.value.clone()));
        }
    }

    let bucket = T::bucket(&key);
    debug!(kind = %T::KIND, bucket = %bucket, "Cache miss, reading from bus");

    // Watch first so nothing written during hydration is lost
    let watch = match inner.bus.watch(&bucket).await {
        Ok(watch) => watch,
        Err(BusError::BucketNotFound(_)) => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let Some(record) = hydrate::<T>(inner.bus.as_ref(), &bucket).await? else {
        return Ok(None);
    };

    // Nothing would keep the entry fresh after shutdown
    if record.is_terminal() || inner.shutdown.is_cancelled() {
        return Ok(Some(record));
    }

    let generation = inner.next_generation();
    let cancel = inner.shutdown.child_token();
    {
        let mut map = T::store(inner).write().await;
        let entry = CacheEntry {
            value: record.clone(),
            cancel: cancel.clone(),
            generation,
        };
        if let Some(replaced) = T::install(&mut map, &key, entry) {
            replaced.cancel.cancel();
        }
    }

    spawn_watch::<T>(Arc::clone(inner), key, watch, cancel, generation);
    Ok(Some(record))
}

/// Field-by-field read of one record straight from the bus, bypassing the cache
pub(crate) async fn hydrate<T: FieldRecord>(
    bus: &dyn Substrate,
    bucket: &str,
) -> Result<Option<T>, StoreError> {
    let keys = match bus.keys(bucket).await {
        Ok(keys) => keys,
        Err(BusError::BucketNotFound(_)) => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    if keys.is_empty() && !T::EMPTY_IS_PRESENT {
        return Ok(None);
    }

    let mut record = T::default();
    for key in keys {
        match bus.get(bucket, &key).await {
            Ok(Some(entry)) => record.apply_field(&key, &entry.value)?,
            Ok(None) => {}
            Err(BusError::BucketNotFound(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        }
    }

    Ok(Some(record))
}

fn spawn_watch<T: CachedEntity>(
    inner: Arc<CacheInner>,
    key: T::Key,
    mut watch: KvWatch,
    cancel: CancellationToken,
    generation: u64,
) {
    tokio::spawn(async move {
        debug!(kind = %T::KIND, key = ?key, "Watch started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(kind = %T::KIND, key = ?key, "Watch cancelled");
                    return;
                }
                event = watch.next() => {
                    let Some(event) = event else {
                        debug!(kind = %T::KIND, key = ?key, "Watch stream ended");
                        break;
                    };

                    match inner.apply_event::<T>(&key, &event, generation).await {
                        Ok(WatchFlow::Continue) => {}
                        Ok(WatchFlow::Terminal) => {
                            info!(kind = %T::KIND, key = ?key, "Record reached terminal state, evicting room");
                            inner.evict_room(T::room_id(&key)).await;
                            return;
                        }
                        Ok(WatchFlow::Stale) => return,
                        Err(e) => {
                            warn!(kind = %T::KIND, key = ?key, error = %e, "Watch update failed");
                            break;
                        }
                    }
                }
            }
        }

        // Losing the watch means the entry can no longer be trusted;
        // the next read falls back to the bus
        inner.drop_entry::<T>(&key, generation).await;
    });
}
