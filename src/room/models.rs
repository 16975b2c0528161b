use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum_macros::{Display, EnumString};

use crate::cache::record::{
    decode_json, decode_parsed, decode_string, decode_timestamp, encode_display,
    encode_timestamp,
};
use crate::cache::{EntityKind, FieldRecord};
use crate::shared::StoreError;

/// Field keys of a room bucket
pub mod fields {
    pub const DB_TABLE_ID: &str = "db_table_id";
    pub const ROOM_ID: &str = "room_id";
    pub const ROOM_SID: &str = "room_sid";
    pub const STATUS: &str = "status";
    pub const EMPTY_TIMEOUT: &str = "empty_timeout";
    pub const MAX_PARTICIPANTS: &str = "max_participants";
    pub const CREATED_AT: &str = "created_at";
    pub const ENDED_AT: &str = "ended_at";
    pub const METADATA: &str = "metadata";
}

const MAX_TITLE_LEN: usize = 256;

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum RoomStatus {
    #[default]
    Created,
    Active,
    Ended,
}

/// One lifetime instance of a meeting room as mirrored on the bus
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoomRecord {
    pub db_table_id: i64,
    /// Stable business key
    pub room_id: String,
    /// Unique per lifetime instance
    pub room_sid: String,
    pub status: RoomStatus,
    /// Seconds without online users before the room is flagged for ending
    pub empty_timeout: u64,
    pub max_participants: u32,
    pub created_at: Option<DateTime<Utc>>,
    /// Set when the lifetime ends; cleanup waits for a grace period after it
    pub ended_at: Option<DateTime<Utc>>,
    pub metadata: RoomMetadata,
}

impl RoomRecord {
    pub fn is_ended(&self) -> bool {
        self.status == RoomStatus::Ended
    }
}

impl FieldRecord for RoomRecord {
    const KIND: EntityKind = EntityKind::Room;

    fn apply_field(&mut self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        match key {
            fields::DB_TABLE_ID => self.db_table_id = decode_parsed(key, value)?,
            fields::ROOM_ID => self.room_id = decode_string(key, value)?,
            fields::ROOM_SID => self.room_sid = decode_string(key, value)?,
            fields::STATUS => self.status = decode_parsed(key, value)?,
            fields::EMPTY_TIMEOUT => self.empty_timeout = decode_parsed(key, value)?,
            fields::MAX_PARTICIPANTS => self.max_participants = decode_parsed(key, value)?,
            fields::CREATED_AT => self.created_at = decode_timestamp(key, value)?,
            fields::ENDED_AT => self.ended_at = decode_timestamp(key, value)?,
            fields::METADATA => self.metadata = decode_json(key, value)?,
            // Unknown keys belong to newer writers
            _ => {}
        }
        Ok(())
    }

    fn clear_field(&mut self, key: &str) {
        let defaults = RoomRecord::default();
        match key {
            fields::DB_TABLE_ID => self.db_table_id = defaults.db_table_id,
            fields::ROOM_SID => self.room_sid = defaults.room_sid,
            fields::STATUS => self.status = defaults.status,
            fields::EMPTY_TIMEOUT => self.empty_timeout = defaults.empty_timeout,
            fields::MAX_PARTICIPANTS => self.max_participants = defaults.max_participants,
            fields::CREATED_AT => self.created_at = defaults.created_at,
            fields::ENDED_AT => self.ended_at = defaults.ended_at,
            fields::METADATA => self.metadata = defaults.metadata,
            _ => {}
        }
    }

    fn to_fields(&self) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        Ok(vec![
            (fields::DB_TABLE_ID.into(), encode_display(self.db_table_id)),
            (fields::ROOM_ID.into(), self.room_id.clone().into_bytes()),
            (fields::ROOM_SID.into(), self.room_sid.clone().into_bytes()),
            (fields::STATUS.into(), encode_display(self.status)),
            (fields::EMPTY_TIMEOUT.into(), encode_display(self.empty_timeout)),
            (
                fields::MAX_PARTICIPANTS.into(),
                encode_display(self.max_participants),
            ),
            (fields::CREATED_AT.into(), encode_timestamp(&self.created_at)),
            (fields::ENDED_AT.into(), encode_timestamp(&self.ended_at)),
            (fields::METADATA.into(), serde_json::to_vec(&self.metadata)?),
        ])
    }

    fn is_terminal(&self) -> bool {
        self.is_ended()
    }
}

/// Versioned room-wide settings, replaced as a whole
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoomMetadata {
    /// Opaque version id, refreshed on every replace
    #[serde(default)]
    pub metadata_id: String,
    #[serde(default)]
    pub room_title: String,
    #[serde(default)]
    pub welcome_message: Option<String>,
    #[serde(default)]
    pub is_recording: bool,
    #[serde(default)]
    pub room_features: RoomFeatures,
    #[serde(default)]
    pub default_lock_settings: LockSettings,
}

impl RoomMetadata {
    /// Checks the blob before it is written to the bus
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.room_title.chars().count() > MAX_TITLE_LEN {
            return Err(StoreError::InvalidMetadata(format!(
                "room_title longer than {MAX_TITLE_LEN} characters"
            )));
        }
        if let Some(transcription) = &self.room_features.transcription {
            transcription.provider.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomFeatures {
    #[serde(default = "enabled")]
    pub allow_webcams: bool,
    #[serde(default)]
    pub mute_on_start: bool,
    #[serde(default = "enabled")]
    pub allow_screen_share: bool,
    #[serde(default)]
    pub allow_recording: bool,
    #[serde(default)]
    pub admin_only_webcams: bool,
    #[serde(default)]
    pub chat: ChatFeatures,
    #[serde(default)]
    pub transcription: Option<TranscriptionFeatures>,
}

impl Default for RoomFeatures {
    fn default() -> Self {
        Self {
            allow_webcams: true,
            mute_on_start: false,
            allow_screen_share: true,
            allow_recording: false,
            admin_only_webcams: false,
            chat: ChatFeatures::default(),
            transcription: None,
        }
    }
}

fn enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatFeatures {
    #[serde(default = "enabled")]
    pub allow_chat: bool,
    #[serde(default)]
    pub allow_file_upload: bool,
}

impl Default for ChatFeatures {
    fn default() -> Self {
        Self {
            allow_chat: true,
            allow_file_upload: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptionFeatures {
    pub provider: SpeechProvider,
    #[serde(default)]
    pub default_language: Option<String>,
}

/// Speech service settings, one variant per supported provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SpeechProvider {
    Azure {
        region: String,
    },
    Google {
        project_id: String,
    },
    /// Extension point: provider-specific options are kept as an open map
    Custom {
        name: String,
        #[serde(default)]
        options: Map<String, Value>,
    },
}

impl SpeechProvider {
    fn validate(&self) -> Result<(), StoreError> {
        let problem = match self {
            SpeechProvider::Azure { region } if region.trim().is_empty() => {
                Some("azure region is empty")
            }
            SpeechProvider::Google { project_id } if project_id.trim().is_empty() => {
                Some("google project_id is empty")
            }
            SpeechProvider::Custom { name, .. } if name.trim().is_empty() => {
                Some("custom provider name is empty")
            }
            SpeechProvider::Custom { options, .. } if options.keys().any(|k| k.is_empty()) => {
                Some("custom provider option with empty key")
            }
            _ => None,
        };

        match problem {
            Some(reason) => Err(StoreError::InvalidMetadata(reason.to_string())),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockSettings {
    #[serde(default)]
    pub lock_microphone: bool,
    #[serde(default)]
    pub lock_webcam: bool,
    #[serde(default)]
    pub lock_screen_sharing: bool,
    #[serde(default)]
    pub lock_chat: bool,
}
