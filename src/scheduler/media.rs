use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use tracing::debug;

use crate::shared::StoreError;

/// One participant as seen by the media server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaParticipant {
    pub identity: String,
    pub name: String,
    pub joined_at: DateTime<Utc>,
}

/// The media server's view of rooms; authoritative for who is really connected
#[async_trait]
pub trait MediaPlane: Send + Sync {
    /// `None` when the media server does not know the room
    async fn list_participants(
        &self,
        room_id: &str,
    ) -> Result<Option<Vec<MediaParticipant>>, StoreError>;

    async fn end_room(&self, room_id: &str) -> Result<(), StoreError>;
}

/// In-memory media plane for development and testing
#[derive(Default)]
pub struct InMemoryMediaPlane {
    rooms: RwLock<HashMap<String, Vec<MediaParticipant>>>,
    failing: RwLock<HashSet<String>>,
    ended: RwLock<Vec<String>>,
}

impl InMemoryMediaPlane {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn open_room(&self, room_id: &str) {
        self.rooms
            .write()
            .await
            .entry(room_id.to_string())
            .or_default();
    }

    pub async fn join(&self, room_id: &str, identity: &str) {
        let mut rooms = self.rooms.write().await;
        let participants = rooms.entry(room_id.to_string()).or_default();
        if !participants.iter().any(|p| p.identity == identity) {
            participants.push(MediaParticipant {
                identity: identity.to_string(),
                name: identity.to_string(),
                joined_at: Utc::now(),
            });
        }
    }

    pub async fn leave(&self, room_id: &str, identity: &str) {
        if let Some(participants) = self.rooms.write().await.get_mut(room_id) {
            participants.retain(|p| p.identity != identity);
        }
    }

    /// Forgets the room without telling anyone, like a crashed media node
    pub async fn drop_room(&self, room_id: &str) {
        self.rooms.write().await.remove(room_id);
    }

    /// Makes every call about `room_id` fail until cleared
    pub async fn set_failing(&self, room_id: &str, failing: bool) {
        let mut set = self.failing.write().await;
        if failing {
            set.insert(room_id.to_string());
        } else {
            set.remove(room_id);
        }
    }

    pub async fn ended_rooms(&self) -> Vec<String> {
        self.ended.read().await.clone()
    }

    async fn check(&self, room_id: &str) -> Result<(), StoreError> {
        if self.failing.read().await.contains(room_id) {
            return Err(StoreError::MediaPlane(format!(
                "injected failure for room {room_id}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl MediaPlane for InMemoryMediaPlane {
    async fn list_participants(
        &self,
        room_id: &str,
    ) -> Result<Option<Vec<MediaParticipant>>, StoreError> {
        self.check(room_id).await?;
        Ok(self.rooms.read().await.get(room_id).cloned())
    }

    async fn end_room(&self, room_id: &str) -> Result<(), StoreError> {
        self.check(room_id).await?;
        self.rooms.write().await.remove(room_id);
        self.ended.write().await.push(room_id.to_string());
        debug!(room_id = %room_id, "Media room ended");
        Ok(())
    }
}
