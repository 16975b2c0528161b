use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strum_macros::{Display, EnumString};

use crate::cache::record::{
    decode_json, decode_parsed, decode_string, decode_timestamp, encode_display,
    encode_timestamp,
};
use crate::cache::{EntityKind, FieldRecord};
use crate::room::models::LockSettings;
use crate::shared::StoreError;

/// Field keys of a user-info bucket
pub mod fields {
    pub const USER_ID: &str = "user_id";
    pub const USER_SID: &str = "user_sid";
    pub const NAME: &str = "name";
    pub const ROOM_ID: &str = "room_id";
    pub const METADATA: &str = "metadata";
    pub const IS_ADMIN: &str = "is_admin";
    pub const IS_PRESENTER: &str = "is_presenter";
    pub const JOINED_AT: &str = "joined_at";
    pub const RECONNECTED_AT: &str = "reconnected_at";
    pub const DISCONNECTED_AT: &str = "disconnected_at";
    pub const LAST_PING_AT: &str = "last_ping_at";
}

/// Transport connectivity of one user in one room
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    /// Join token issued, transport not connected yet
    Added,
    Online,
    /// Transport lost, identity and state kept
    Disconnected,
    /// Grace period elapsed without a reconnect
    Offline,
}

impl PresenceStatus {
    /// Offline-ish states from which `Online` counts as a reconnect
    pub fn is_away(&self) -> bool {
        matches!(self, PresenceStatus::Disconnected | PresenceStatus::Offline)
    }
}

/// Per-user capability and profile blob
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserMetadata {
    #[serde(default)]
    pub metadata_id: String,
    #[serde(default)]
    pub profile_pic: Option<String>,
    #[serde(default)]
    pub raised_hand: bool,
    #[serde(default)]
    pub lock_settings: LockSettings,
    #[serde(default)]
    pub ex_user_id: Option<String>,
}

/// Full per-user detail record, kept in its own bucket
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub user_id: String,
    pub user_sid: String,
    pub name: String,
    pub room_id: String,
    pub metadata: UserMetadata,
    pub is_admin: bool,
    pub is_presenter: bool,
    pub joined_at: Option<DateTime<Utc>>,
    pub reconnected_at: Option<DateTime<Utc>>,
    pub disconnected_at: Option<DateTime<Utc>>,
    pub last_ping_at: Option<DateTime<Utc>>,
}

impl FieldRecord for UserRecord {
    const KIND: EntityKind = EntityKind::User;

    fn apply_field(&mut self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        match key {
            fields::USER_ID => self.user_id = decode_string(key, value)?,
            fields::USER_SID => self.user_sid = decode_string(key, value)?,
            fields::NAME => self.name = decode_string(key, value)?,
            fields::ROOM_ID => self.room_id = decode_string(key, value)?,
            fields::METADATA => self.metadata = decode_json(key, value)?,
            fields::IS_ADMIN => self.is_admin = decode_parsed(key, value)?,
            fields::IS_PRESENTER => self.is_presenter = decode_parsed(key, value)?,
            fields::JOINED_AT => self.joined_at = decode_timestamp(key, value)?,
            fields::RECONNECTED_AT => self.reconnected_at = decode_timestamp(key, value)?,
            fields::DISCONNECTED_AT => self.disconnected_at = decode_timestamp(key, value)?,
            fields::LAST_PING_AT => self.last_ping_at = decode_timestamp(key, value)?,
            _ => {}
        }
        Ok(())
    }

    fn clear_field(&mut self, key: &str) {
        match key {
            fields::METADATA => self.metadata = UserMetadata::default(),
            fields::IS_ADMIN => self.is_admin = false,
            fields::IS_PRESENTER => self.is_presenter = false,
            fields::JOINED_AT => self.joined_at = None,
            fields::RECONNECTED_AT => self.reconnected_at = None,
            fields::DISCONNECTED_AT => self.disconnected_at = None,
            fields::LAST_PING_AT => self.last_ping_at = None,
            _ => {}
        }
    }

    fn to_fields(&self) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        Ok(vec![
            (fields::USER_ID.into(), self.user_id.clone().into_bytes()),
            (fields::USER_SID.into(), self.user_sid.clone().into_bytes()),
            (fields::NAME.into(), self.name.clone().into_bytes()),
            (fields::ROOM_ID.into(), self.room_id.clone().into_bytes()),
            (fields::METADATA.into(), serde_json::to_vec(&self.metadata)?),
            (fields::IS_ADMIN.into(), encode_display(self.is_admin)),
            (fields::IS_PRESENTER.into(), encode_display(self.is_presenter)),
            (fields::JOINED_AT.into(), encode_timestamp(&self.joined_at)),
            (
                fields::RECONNECTED_AT.into(),
                encode_timestamp(&self.reconnected_at),
            ),
            (
                fields::DISCONNECTED_AT.into(),
                encode_timestamp(&self.disconnected_at),
            ),
            (
                fields::LAST_PING_AT.into(),
                encode_timestamp(&self.last_ping_at),
            ),
        ])
    }
}

/// The small "who is in this room" root: user id -> status
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceRoster {
    pub users: BTreeMap<String, PresenceStatus>,
}

impl PresenceRoster {
    pub fn status_of(&self, user_id: &str) -> Option<PresenceStatus> {
        self.users.get(user_id).copied()
    }

    pub fn with_status(&self, status: PresenceStatus) -> Vec<String> {
        self.users
            .iter()
            .filter(|(_, s)| **s == status)
            .map(|(user_id, _)| user_id.clone())
            .collect()
    }

    pub fn online_count(&self) -> usize {
        self.users
            .values()
            .filter(|s| **s == PresenceStatus::Online)
            .count()
    }
}

impl FieldRecord for PresenceRoster {
    const KIND: EntityKind = EntityKind::Presence;
    const EMPTY_IS_PRESENT: bool = true;

    fn apply_field(&mut self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let status = decode_parsed(key, value)?;
        self.users.insert(key.to_string(), status);
        Ok(())
    }

    fn clear_field(&mut self, key: &str) {
        self.users.remove(key);
    }

    fn to_fields(&self) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        Ok(self
            .users
            .iter()
            .map(|(user_id, status)| (user_id.clone(), encode_display(status)))
            .collect())
    }
}

/// What the caller knows about a user when issuing a join token
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JoinAttributes {
    pub name: String,
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default)]
    pub is_presenter: bool,
    #[serde(default)]
    pub metadata: UserMetadata,
}

/// A detail record joined with its presence status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomUser {
    pub user: UserRecord,
    pub status: PresenceStatus,
}
