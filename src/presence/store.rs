use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::models::{
    fields, JoinAttributes, PresenceRoster, PresenceStatus, RoomUser, UserRecord,
};
use crate::bus::naming;
use crate::bus::{BucketConfig, BusError, KvEntry, Substrate};
use crate::cache::record::{decode_parsed, encode_display, encode_timestamp};
use crate::cache::{hydrate, FieldRecord, LocalCache};
use crate::event::{EventBus, RoomEvent};
use crate::shared::StoreError;

/// Per-user records and the lightweight presence root of each room
pub struct PresenceStore {
    bus: Arc<dyn Substrate>,
    events: EventBus,
    cache: LocalCache,
    replicas: usize,
}

impl PresenceStore {
    pub fn new(bus: Arc<dyn Substrate>, events: EventBus, cache: LocalCache, replicas: usize) -> Self {
        Self {
            bus,
            events,
            cache,
            replicas,
        }
    }

    /// Registers a user at join-token issuance
    ///
    /// Writes `added` to the presence root first, then the detail record.
    /// A user already known to the room keeps status, sid and timestamps.
    #[instrument(skip(self, attrs))]
    pub async fn add_user(
        &self,
        room_id: &str,
        user_id: &str,
        attrs: JoinAttributes,
    ) -> Result<UserRecord, StoreError> {
        naming::validate_id("room", room_id)?;
        naming::validate_id("user", user_id)?;

        let roster_bucket = naming::room_users_bucket(room_id);
        if !self.bus.bucket_exists(&roster_bucket).await? {
            return Err(StoreError::NotFound(format!("room {room_id}")));
        }
        if self.get_entry(&roster_bucket, user_id).await?.is_none() {
            self.bus
                .put(&roster_bucket, user_id, encode_display(PresenceStatus::Added))
                .await?;
        }

        let user_bucket = naming::user_info_bucket(room_id, user_id);
        let previous = hydrate::<UserRecord>(self.bus.as_ref(), &user_bucket).await?;

        let mut record = previous.unwrap_or_else(|| UserRecord {
            user_sid: Uuid::new_v4().to_string(),
            ..UserRecord::default()
        });
        record.user_id = user_id.to_string();
        record.room_id = room_id.to_string();
        record.name = attrs.name;
        record.is_admin = attrs.is_admin;
        record.is_presenter = attrs.is_presenter;
        record.metadata = attrs.metadata;
        if record.metadata.metadata_id.is_empty() {
            record.metadata.metadata_id = Uuid::new_v4().to_string();
        }

        self.bus
            .create_bucket(BucketConfig::new(user_bucket.clone(), self.replicas))
            .await?;
        for (key, value) in record.to_fields()? {
            self.bus.put(&user_bucket, &key, value).await?;
        }

        // Warms the entry and installs its watch
        self.cache.read_user(room_id, user_id).await?;

        info!(room_id = %room_id, user_id = %user_id, user_sid = %record.user_sid, "User added");
        Ok(record)
    }

    /// Sets the presence field and stamps the matching timestamp
    ///
    /// Repeating the current status is a no-op.
    #[instrument(skip(self))]
    pub async fn update_status(
        &self,
        room_id: &str,
        user_id: &str,
        status: PresenceStatus,
    ) -> Result<(), StoreError> {
        let roster_bucket = naming::room_users_bucket(room_id);
        let previous = self
            .current_status(&roster_bucket, user_id)
            .await?
            .map(|(status, _)| status)
            .ok_or_else(|| StoreError::NotFound(format!("user {user_id} in room {room_id}")))?;

        if previous == status {
            debug!(room_id = %room_id, user_id = %user_id, status = %status, "Presence unchanged");
            return Ok(());
        }

        let record = self.require_user(room_id, user_id).await?;
        let reconnect = self.stamp_transition(&record, previous, status).await?;

        self.bus
            .put(&roster_bucket, user_id, encode_display(status))
            .await?;
        self.announce(&record, status, reconnect).await?;

        debug!(room_id = %room_id, user_id = %user_id, from = %previous, to = %status, "Presence updated");
        Ok(())
    }

    /// Compare-and-set transition; only the caller that wins announces it
    ///
    /// Returns `false` when the user is gone or no longer in `expected`.
    #[instrument(skip(self))]
    pub async fn transition_if(
        &self,
        room_id: &str,
        user_id: &str,
        expected: PresenceStatus,
        next: PresenceStatus,
    ) -> Result<bool, StoreError> {
        let roster_bucket = naming::room_users_bucket(room_id);
        let Some((current, revision)) = self.current_status(&roster_bucket, user_id).await? else {
            return Ok(false);
        };
        if current != expected {
            return Ok(false);
        }

        match self
            .bus
            .update(&roster_bucket, user_id, encode_display(next), revision)
            .await
        {
            Ok(_) => {}
            Err(BusError::WrongRevision { .. }) => {
                debug!(room_id = %room_id, user_id = %user_id, "Lost presence transition race");
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        }

        let record = match self.require_user(room_id, user_id).await {
            Ok(record) => record,
            // Removed between the swap and here
            Err(StoreError::NotFound(_)) => return Ok(true),
            Err(e) => return Err(e),
        };
        let reconnect = self.stamp_transition(&record, expected, next).await?;
        self.announce(&record, next, reconnect).await?;

        info!(room_id = %room_id, user_id = %user_id, from = %expected, to = %next, "Presence transitioned");
        Ok(true)
    }

    /// Heartbeat from the user's transport
    pub async fn record_ping(&self, room_id: &str, user_id: &str) -> Result<(), StoreError> {
        self.bus
            .put(
                &naming::user_info_bucket(room_id, user_id),
                fields::LAST_PING_AT,
                encode_timestamp(&Some(Utc::now())),
            )
            .await
            .map_err(|e| match e {
                BusError::BucketNotFound(_) => {
                    StoreError::NotFound(format!("user {user_id} in room {room_id}"))
                }
                other => other.into(),
            })?;
        Ok(())
    }

    /// Cache-first read of one detail record. Missing is not an error.
    pub async fn get_user(
        &self,
        room_id: &str,
        user_id: &str,
    ) -> Result<Option<UserRecord>, StoreError> {
        self.cache.read_user(room_id, user_id).await
    }

    pub async fn roster(&self, room_id: &str) -> Result<Option<PresenceRoster>, StoreError> {
        self.cache.read_presence(room_id).await
    }

    /// Every user of the room with their status; users whose detail record
    /// is not visible yet are skipped
    pub async fn get_room_users(&self, room_id: &str) -> Result<Vec<RoomUser>, StoreError> {
        let Some(roster) = self.roster(room_id).await? else {
            return Ok(Vec::new());
        };

        let mut users = Vec::with_capacity(roster.users.len());
        for (user_id, status) in roster.users {
            if let Some(user) = self.get_user(room_id, &user_id).await? {
                users.push(RoomUser { user, status });
            }
        }
        Ok(users)
    }

    /// Direct bus scan of every user in the room, bypassing the cache
    ///
    /// Used by reconciliation, which must act on the latest timestamps.
    pub async fn scan_room_users(&self, room_id: &str) -> Result<Vec<RoomUser>, StoreError> {
        let roster = hydrate::<PresenceRoster>(
            self.bus.as_ref(),
            &naming::room_users_bucket(room_id),
        )
        .await?
        .unwrap_or_default();

        let mut users = Vec::with_capacity(roster.users.len());
        for (user_id, status) in roster.users {
            let bucket = naming::user_info_bucket(room_id, &user_id);
            if let Some(user) = hydrate::<UserRecord>(self.bus.as_ref(), &bucket).await? {
                users.push(RoomUser { user, status });
            }
        }
        Ok(users)
    }

    pub async fn get_online_users(&self, room_id: &str) -> Result<Vec<UserRecord>, StoreError> {
        Ok(self
            .get_room_users(room_id)
            .await?
            .into_iter()
            .filter(|u| u.status == PresenceStatus::Online)
            .map(|u| u.user)
            .collect())
    }

    /// Sends a private notification to every online admin, e.g. a raised hand
    #[instrument(skip(self, message))]
    pub async fn notify_admins(
        &self,
        room_id: &str,
        from_user_id: &str,
        message: &str,
    ) -> Result<usize, StoreError> {
        let event = RoomEvent::UserNotification {
            from_user_id: from_user_id.to_string(),
            message: message.to_string(),
        };

        let mut notified = 0;
        for admin in self
            .get_online_users(room_id)
            .await?
            .into_iter()
            .filter(|u| u.is_admin && u.user_id != from_user_id)
        {
            self.events
                .publish(room_id, &event, Some(&admin.user_id))
                .await?;
            notified += 1;
        }
        Ok(notified)
    }

    /// Explicit logout. Coming back requires a fresh `add_user`.
    #[instrument(skip(self))]
    pub async fn remove_user(&self, room_id: &str, user_id: &str) -> Result<bool, StoreError> {
        naming::validate_id("user", user_id)?;
        let roster_bucket = naming::room_users_bucket(room_id);
        let known = self.get_entry(&roster_bucket, user_id).await?.is_some();

        self.bus
            .delete_bucket(&naming::user_info_bucket(room_id, user_id))
            .await?;
        if known {
            self.bus.delete(&roster_bucket, user_id).await?;
        }
        self.events.delete_user_consumers(room_id, user_id).await?;
        self.cache.evict_user(room_id, user_id).await;

        if known {
            let event = RoomEvent::UserLeft {
                user_id: user_id.to_string(),
            };
            match self.events.publish(room_id, &event, None).await {
                Ok(_) => {}
                Err(StoreError::Bus(BusError::NoStreamForSubject(_))) => {
                    debug!(room_id = %room_id, "Room log already gone, not announcing logout");
                }
                Err(e) => return Err(e),
            }
            info!(room_id = %room_id, user_id = %user_id, "User removed");
        }
        Ok(known)
    }

    /// Writes the timestamp belonging to a transition into `status`; returns
    /// whether an `online` transition is a reconnect
    async fn stamp_transition(
        &self,
        record: &UserRecord,
        previous: PresenceStatus,
        status: PresenceStatus,
    ) -> Result<bool, StoreError> {
        let bucket = naming::user_info_bucket(&record.room_id, &record.user_id);
        let now = encode_timestamp(&Some(Utc::now()));

        let reconnect = match status {
            PresenceStatus::Online if record.joined_at.is_none() => {
                self.bus.put(&bucket, fields::JOINED_AT, now.clone()).await?;
                false
            }
            PresenceStatus::Online if previous.is_away() => {
                self.bus
                    .put(&bucket, fields::RECONNECTED_AT, now.clone())
                    .await?;
                true
            }
            PresenceStatus::Online => false,
            PresenceStatus::Disconnected | PresenceStatus::Offline => {
                self.bus
                    .put(&bucket, fields::DISCONNECTED_AT, now.clone())
                    .await?;
                false
            }
            PresenceStatus::Added => false,
        };

        if status == PresenceStatus::Online {
            // A fresh connection counts as a heartbeat
            self.bus.put(&bucket, fields::LAST_PING_AT, now).await?;
        }
        Ok(reconnect)
    }

    async fn announce(
        &self,
        record: &UserRecord,
        status: PresenceStatus,
        reconnect: bool,
    ) -> Result<(), StoreError> {
        if let Some(event) =
            RoomEvent::for_presence(&record.user_id, &record.name, status, reconnect)
        {
            self.events.publish(&record.room_id, &event, None).await?;
        }
        Ok(())
    }

    /// Detail record straight from the bus; the cache may not have seen
    /// the latest timestamps yet
    async fn require_user(&self, room_id: &str, user_id: &str) -> Result<UserRecord, StoreError> {
        hydrate::<UserRecord>(
            self.bus.as_ref(),
            &naming::user_info_bucket(room_id, user_id),
        )
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("user {user_id} in room {room_id}")))
    }

    async fn current_status(
        &self,
        roster_bucket: &str,
        user_id: &str,
    ) -> Result<Option<(PresenceStatus, u64)>, StoreError> {
        let Some(entry) = self.get_entry(roster_bucket, user_id).await? else {
            return Ok(None);
        };
        let status = decode_parsed::<PresenceStatus>(user_id, &entry.value)?;
        Ok(Some((status, entry.revision)))
    }

    async fn get_entry(&self, bucket: &str, key: &str) -> Result<Option<KvEntry>, StoreError> {
        match self.bus.get(bucket, key).await {
            Ok(entry) => Ok(entry),
            Err(BusError::BucketNotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
