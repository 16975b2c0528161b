use async_trait::async_trait;
use thiserror::Error;

use super::events::{Envelope, RoomEvent};

#[derive(Debug, Error)]
pub enum RoomEventError {
    #[error("Handler error: {0}")]
    HandlerError(String),
}

/// Consumer of a room's reliable system events
///
/// A handler that returns an error leaves the message unacknowledged, so it
/// is delivered again once the consumer's ack wait elapses.
#[async_trait]
pub trait RoomEventHandler: Send + Sync {
    async fn handle_room_event(
        &self,
        room_id: &str,
        envelope: Envelope<RoomEvent>,
    ) -> Result<(), RoomEventError>;

    fn handler_name(&self) -> &'static str;
}
