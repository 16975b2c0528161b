use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};

use super::permissions::ConnectionPermissions;
use super::token::TokenConfig;
use crate::bus::naming;
use crate::event::{ConsumerGrant, EventBus};
use crate::presence::{JoinAttributes, PresenceStore};
use crate::room::RoomStateStore;
use crate::shared::{AppError, StoreError};

/// Everything a transport needs to serve one authorized connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionGrant {
    pub room_id: String,
    pub room_sid: String,
    pub user_id: String,
    pub permissions: ConnectionPermissions,
    pub consumers: Vec<ConsumerGrant>,
}

/// Issues join tokens and turns them into connection grants
pub struct ConnectionAuthorizer {
    tokens: TokenConfig,
    rooms: Arc<RoomStateStore>,
    presence: Arc<PresenceStore>,
    events: EventBus,
}

impl ConnectionAuthorizer {
    pub fn new(
        tokens: TokenConfig,
        rooms: Arc<RoomStateStore>,
        presence: Arc<PresenceStore>,
        events: EventBus,
    ) -> Self {
        Self {
            tokens,
            rooms,
            presence,
            events,
        }
    }

    /// Registers the user in the room and signs their join token
    #[instrument(skip(self, attrs))]
    pub async fn issue_join_token(
        &self,
        room_id: &str,
        user_id: &str,
        attrs: JoinAttributes,
    ) -> Result<String, AppError> {
        naming::validate_id("room", room_id).map_err(StoreError::from)?;
        naming::validate_id("user", user_id).map_err(StoreError::from)?;

        if self.rooms.read(room_id).await?.is_none() {
            return Err(AppError::NotFound(format!("room {room_id}")));
        }

        let is_admin = attrs.is_admin;
        let record = self.presence.add_user(room_id, user_id, attrs).await?;
        self.tokens
            .create_token(room_id, user_id, &record.name, is_admin)
    }

    /// Validates the token and provisions the user's delivery consumers
    ///
    /// Any provisioning failure rejects the connection attempt.
    #[instrument(skip(self, token))]
    pub async fn authorize_connection(&self, token: &str) -> Result<ConnectionGrant, AppError> {
        let claims = self.tokens.validate_token(token)?;
        let permissions =
            ConnectionPermissions::for_user(&claims.room_id, &claims.user_id, claims.is_admin)
                .map_err(|e| AppError::Unauthorized(e.to_string()))?;

        let Some(room) = self.rooms.read(&claims.room_id).await? else {
            warn!(room_id = %claims.room_id, "Connection to a room that is not running");
            return Err(AppError::Unauthorized(format!(
                "room {} is not running",
                claims.room_id
            )));
        };

        if self
            .presence
            .get_user(&claims.room_id, &claims.user_id)
            .await?
            .is_none()
        {
            return Err(AppError::Unauthorized(format!(
                "user {} is not registered in room {}",
                claims.user_id, claims.room_id
            )));
        }

        let consumers = self
            .events
            .ensure_user_consumers(&claims.room_id, &claims.user_id)
            .await?;

        info!(
            room_id = %claims.room_id,
            user_id = %claims.user_id,
            "Connection authorized"
        );

        Ok(ConnectionGrant {
            permissions,
            room_id: claims.room_id,
            room_sid: room.room_sid,
            user_id: claims.user_id,
            consumers,
        })
    }
}
