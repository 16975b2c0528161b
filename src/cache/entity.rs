use std::collections::HashMap;
use std::fmt::Debug;
use tokio::sync::RwLock;

use super::{CacheEntry, CacheInner, FieldRecord};
use crate::bus::naming;
use crate::presence::models::{PresenceRoster, UserRecord};
use crate::room::models::RoomRecord;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct UserKey {
    pub room_id: String,
    pub user_id: String,
}

/// Everything the unified user-info store holds for one room
#[derive(Default)]
pub(crate) struct RoomUserEntries {
    pub roster: Option<CacheEntry<PresenceRoster>>,
    pub users: HashMap<String, CacheEntry<UserRecord>>,
}

/// Where an entity kind lives inside the cache and which bucket mirrors it
pub(crate) trait CachedEntity: FieldRecord {
    type Key: Clone + Debug + Send + Sync + 'static;
    type Map: Send + Sync + 'static;

    fn bucket(key: &Self::Key) -> String;
    fn room_id(key: &Self::Key) -> &str;
    fn store(cache: &CacheInner) -> &RwLock<Self::Map>;
    fn slot<'a>(map: &'a Self::Map, key: &Self::Key) -> Option<&'a CacheEntry<Self>>;
    fn slot_mut<'a>(map: &'a mut Self::Map, key: &Self::Key) -> Option<&'a mut CacheEntry<Self>>;
    fn install(
        map: &mut Self::Map,
        key: &Self::Key,
        entry: CacheEntry<Self>,
    ) -> Option<CacheEntry<Self>>;
    fn take(map: &mut Self::Map, key: &Self::Key) -> Option<CacheEntry<Self>>;
}

impl CachedEntity for RoomRecord {
    type Key = String;
    type Map = HashMap<String, CacheEntry<RoomRecord>>;

    fn bucket(key: &String) -> String {
        naming::room_bucket(key)
    }

    fn room_id(key: &String) -> &str {
        key
    }

    fn store(cache: &CacheInner) -> &RwLock<Self::Map> {
        &cache.rooms
    }

    fn slot<'a>(map: &'a Self::Map, key: &String) -> Option<&'a CacheEntry<Self>> {
        map.get(key)
    }

    fn slot_mut<'a>(map: &'a mut Self::Map, key: &String) -> Option<&'a mut CacheEntry<Self>> {
        map.get_mut(key)
    }

    fn install(
        map: &mut Self::Map,
        key: &String,
        entry: CacheEntry<Self>,
    ) -> Option<CacheEntry<Self>> {
        map.insert(key.clone(), entry)
    }

    fn take(map: &mut Self::Map, key: &String) -> Option<CacheEntry<Self>> {
        map.remove(key)
    }
}

impl CachedEntity for PresenceRoster {
    type Key = String;
    type Map = HashMap<String, RoomUserEntries>;

    fn bucket(key: &String) -> String {
        naming::room_users_bucket(key)
    }

    fn room_id(key: &String) -> &str {
        key
    }

    fn store(cache: &CacheInner) -> &RwLock<Self::Map> {
        &cache.user_info
    }

    fn slot<'a>(map: &'a Self::Map, key: &String) -> Option<&'a CacheEntry<Self>> {
        map.get(key).and_then(|entries| entries.roster.as_ref())
    }

    fn slot_mut<'a>(map: &'a mut Self::Map, key: &String) -> Option<&'a mut CacheEntry<Self>> {
        map.get_mut(key).and_then(|entries| entries.roster.as_mut())
    }

    fn install(
        map: &mut Self::Map,
        key: &String,
        entry: CacheEntry<Self>,
    ) -> Option<CacheEntry<Self>> {
        map.entry(key.clone()).or_default().roster.replace(entry)
    }

    fn take(map: &mut Self::Map, key: &String) -> Option<CacheEntry<Self>> {
        map.get_mut(key).and_then(|entries| entries.roster.take())
    }
}

impl CachedEntity for UserRecord {
    type Key = UserKey;
    type Map = HashMap<String, RoomUserEntries>;

    fn bucket(key: &UserKey) -> String {
        naming::user_info_bucket(&key.room_id, &key.user_id)
    }

    fn room_id(key: &UserKey) -> &str {
        &key.room_id
    }

    fn store(cache: &CacheInner) -> &RwLock<Self::Map> {
        &cache.user_info
    }

    fn slot<'a>(map: &'a Self::Map, key: &UserKey) -> Option<&'a CacheEntry<Self>> {
        map.get(&key.room_id)
            .and_then(|entries| entries.users.get(&key.user_id))
    }

    fn slot_mut<'a>(map: &'a mut Self::Map, key: &UserKey) -> Option<&'a mut CacheEntry<Self>> {
        map.get_mut(&key.room_id)
            .and_then(|entries| entries.users.get_mut(&key.user_id))
    }

    fn install(
        map: &mut Self::Map,
        key: &UserKey,
        entry: CacheEntry<Self>,
    ) -> Option<CacheEntry<Self>> {
        map.entry(key.room_id.clone())
            .or_default()
            .users
            .insert(key.user_id.clone(), entry)
    }

    fn take(map: &mut Self::Map, key: &UserKey) -> Option<CacheEntry<Self>> {
        map.get_mut(&key.room_id)
            .and_then(|entries| entries.users.remove(&key.user_id))
    }
}
