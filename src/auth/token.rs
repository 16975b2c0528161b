use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::shared::AppError;

/// Claims carried by a room join token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinClaims {
    pub room_id: String,
    pub user_id: String,
    pub name: String,
    pub is_admin: bool,
    pub exp: usize,
    pub iat: usize,
}

/// Configuration for JWT token operations
#[derive(Clone)]
pub struct TokenConfig {
    secret: String,
    pub lifetime: Duration,
}

impl TokenConfig {
    pub fn new(secret: impl Into<String>, lifetime: Duration) -> Self {
        Self {
            secret: secret.into(),
            lifetime,
        }
    }

    /// Creates a signed join token for one user in one room
    #[instrument(skip(self, name))]
    pub fn create_token(
        &self,
        room_id: &str,
        user_id: &str,
        name: &str,
        is_admin: bool,
    ) -> Result<String, AppError> {
        let now = Utc::now();
        let exp = (now + self.lifetime).timestamp() as usize;

        debug!(exp_timestamp = exp, "Creating join token");

        let claims = JoinClaims {
            room_id: room_id.to_string(),
            user_id: user_id.to_string(),
            name: name.to_string(),
            is_admin,
            exp,
            iat: now.timestamp() as usize,
        };

        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_ref()),
        )
        .map_err(|e| {
            debug!(error = %e, "Failed to encode join token");
            AppError::JwtError(e.to_string())
        })
    }

    /// Validates a join token and returns its claims
    #[instrument(skip(self, token))]
    pub fn validate_token(&self, token: &str) -> Result<JoinClaims, AppError> {
        decode::<JoinClaims>(
            token,
            &DecodingKey::from_secret(self.secret.as_ref()),
            &Validation::default(),
        )
        .map(|data| {
            debug!(
                room_id = %data.claims.room_id,
                user_id = %data.claims.user_id,
                exp = data.claims.exp,
                "Join token decoded"
            );
            data.claims
        })
        .map_err(|e| {
            debug!(error = %e, "Failed to decode join token");
            AppError::Unauthorized(e.to_string())
        })
    }
}
