use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::presence::models::PresenceStatus;
use crate::room::models::RoomMetadata;

/// State-affecting notifications delivered through a room's reliable log
///
/// Events represent facts about things that have already happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RoomEvent {
    /// Transport connected for the first time
    UserJoined { user_id: String, name: String },

    /// Transport connected again after a disconnect, identity kept
    UserReconnected { user_id: String, name: String },

    /// Transport lost; clients should keep the user's state for now
    UserDisconnected { user_id: String },

    /// Grace period over; clients may release the user's resources
    UserOffline { user_id: String },

    /// Explicit logout
    UserLeft { user_id: String },

    /// Room-wide settings replaced
    RoomMetadataUpdated { metadata: RoomMetadata },

    /// Per-user alert, e.g. a raised hand sent only to admins
    UserNotification { from_user_id: String, message: String },

    /// The session is over
    SessionEnded { reason: String },
}

impl RoomEvent {
    /// Get a human-readable description of the event type
    pub fn event_type(&self) -> &'static str {
        match self {
            RoomEvent::UserJoined { .. } => "user_joined",
            RoomEvent::UserReconnected { .. } => "user_reconnected",
            RoomEvent::UserDisconnected { .. } => "user_disconnected",
            RoomEvent::UserOffline { .. } => "user_offline",
            RoomEvent::UserLeft { .. } => "user_left",
            RoomEvent::RoomMetadataUpdated { .. } => "room_metadata_updated",
            RoomEvent::UserNotification { .. } => "user_notification",
            RoomEvent::SessionEnded { .. } => "session_ended",
        }
    }

    /// The event announcing a presence transition, if that transition is announced
    pub fn for_presence(
        user_id: &str,
        name: &str,
        status: PresenceStatus,
        reconnect: bool,
    ) -> Option<Self> {
        let user_id = user_id.to_string();
        match status {
            PresenceStatus::Added => None,
            PresenceStatus::Online if reconnect => Some(RoomEvent::UserReconnected {
                user_id,
                name: name.to_string(),
            }),
            PresenceStatus::Online => Some(RoomEvent::UserJoined {
                user_id,
                name: name.to_string(),
            }),
            PresenceStatus::Disconnected => Some(RoomEvent::UserDisconnected { user_id }),
            PresenceStatus::Offline => Some(RoomEvent::UserOffline { user_id }),
        }
    }
}

/// What actually travels on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub room_id: String,
    /// Set when the message was addressed to one user
    pub target_user_id: Option<String>,
    pub sent_at: DateTime<Utc>,
    pub payload: T,
}

impl<T> Envelope<T> {
    pub fn new(room_id: &str, target_user_id: Option<&str>, payload: T) -> Self {
        Self {
            room_id: room_id.to_string(),
            target_user_id: target_user_id.map(str::to_string),
            sent_at: Utc::now(),
            payload,
        }
    }
}
