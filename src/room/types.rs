use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::models::{RoomMetadata, RoomRecord, RoomStatus};

/// Request payload for creating a room session
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateRoomRequest {
    pub room_id: String,
    /// Seconds; falls back to the configured default
    #[serde(default)]
    pub empty_timeout: Option<u64>,
    #[serde(default)]
    pub max_participants: Option<u32>,
    #[serde(default)]
    pub metadata: Option<RoomMetadata>,
}

impl CreateRoomRequest {
    pub fn new(room_id: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            ..Self::default()
        }
    }
}

/// Response for room information
#[derive(Debug, Serialize, Deserialize)]
pub struct RoomResponse {
    pub room_id: String,
    pub room_sid: String,
    pub status: RoomStatus,
    pub empty_timeout: u64,
    pub max_participants: u32,
    pub created_at: Option<DateTime<Utc>>,
    pub metadata: RoomMetadata,
}

impl From<RoomRecord> for RoomResponse {
    fn from(record: RoomRecord) -> Self {
        Self {
            room_id: record.room_id,
            room_sid: record.room_sid,
            status: record.status,
            empty_timeout: record.empty_timeout,
            max_participants: record.max_participants,
            created_at: record.created_at,
            metadata: record.metadata,
        }
    }
}
