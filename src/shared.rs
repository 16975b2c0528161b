use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;

use crate::auth::ConnectionAuthorizer;
use crate::bus::naming::InvalidIdentifier;
use crate::bus::BusError;
use crate::presence::PresenceStore;
use crate::room::RoomStateStore;

/// Shared application state containing all dependencies
#[derive(Clone)]
pub struct AppState {
    pub rooms: Arc<RoomStateStore>,
    pub presence: Arc<PresenceStore>,
    pub authorizer: Arc<ConnectionAuthorizer>,
}

impl AppState {
    pub fn new(
        rooms: Arc<RoomStateStore>,
        presence: Arc<PresenceStore>,
        authorizer: Arc<ConnectionAuthorizer>,
    ) -> Self {
        Self {
            rooms,
            presence,
            authorizer,
        }
    }
}

/// Errors raised by the stores, the lock manager and the scheduler
///
/// Absence is not an error at the store layer: reads return `Ok(None)`.
/// `NotFound` is only used by operations that require the record to exist.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Room {room_id} already has an active session")]
    ConflictAlreadyActive { room_id: String },

    #[error("Stale write against metadata {expected}, current is {current}")]
    ConflictStaleWrite { expected: String, current: String },

    #[error("Lock held: {key}")]
    LockHeld { key: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid value for field {field}: {reason}")]
    Decode { field: String, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid metadata: {0}")]
    InvalidMetadata(String),

    #[error(transparent)]
    InvalidIdentifier(#[from] InvalidIdentifier),

    #[error("Durable storage error: {0}")]
    Durable(String),

    #[error("Media plane error: {0}")]
    MediaPlane(String),
}

impl StoreError {
    /// Whether retrying the same call later could succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Bus(_)
                | StoreError::LockHeld { .. }
                | StoreError::Durable(_)
                | StoreError::MediaPlane(_)
        )
    }
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("JWT error: {0}")]
    JwtError(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::JwtError(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Store(err) => {
                let status = match &err {
                    StoreError::NotFound(_) => StatusCode::NOT_FOUND,
                    StoreError::ConflictAlreadyActive { .. }
                    | StoreError::ConflictStaleWrite { .. } => StatusCode::CONFLICT,
                    StoreError::InvalidMetadata(_) | StoreError::InvalidIdentifier(_) => {
                        StatusCode::BAD_REQUEST
                    }
                    StoreError::Bus(_) | StoreError::LockHeld { .. } => {
                        StatusCode::SERVICE_UNAVAILABLE
                    }
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, err.to_string())
            }
        };

        let body = Json(json!({
            "error": error_message
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
pub mod test_utils {
    use super::*;
    use crate::bus::InMemorySubstrate;
    use crate::config::CoreConfig;
    use crate::room::InMemoryRoomInfoRepository;
    use crate::scheduler::InMemoryMediaPlane;
    use crate::services::CoreServices;

    /// Builder for creating AppState over in-memory collaborators
    pub struct AppStateBuilder {
        config: CoreConfig,
    }

    impl AppStateBuilder {
        pub fn new() -> Self {
            Self {
                config: CoreConfig::from_lookup(|_| None).unwrap(),
            }
        }

        pub fn with_jwt_secret(mut self, secret: &str) -> Self {
            self.config.jwt_secret = secret.to_string();
            self
        }

        pub fn build(self) -> AppState {
            CoreServices::build(
                Arc::new(InMemorySubstrate::new()),
                Arc::new(InMemoryRoomInfoRepository::new()),
                Arc::new(InMemoryMediaPlane::new()),
                &self.config,
            )
            .app_state()
        }
    }

    impl Default for AppStateBuilder {
        fn default() -> Self {
            Self::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_errors_map_to_status_codes() {
        let cases = [
            (
                AppError::Store(StoreError::NotFound("room".into())),
                StatusCode::NOT_FOUND,
            ),
            (
                AppError::Store(StoreError::ConflictAlreadyActive {
                    room_id: "r1".into(),
                }),
                StatusCode::CONFLICT,
            ),
            (
                AppError::Store(StoreError::Bus(BusError::Unavailable("down".into()))),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (AppError::Unauthorized("no".into()), StatusCode::UNAUTHORIZED),
        ];

        for (error, expected) in cases {
            assert_eq!(error.into_response().status(), expected);
        }
    }

    #[test]
    fn test_transient_classification() {
        assert!(StoreError::Bus(BusError::Unavailable("x".into())).is_transient());
        assert!(!StoreError::NotFound("x".into()).is_transient());
    }
}
