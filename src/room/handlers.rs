use axum::{
    extract::{Path, State},
    Json,
};
use tracing::{info, instrument};

use super::types::RoomResponse;
use crate::shared::{AppError, AppState};

/// HTTP handler for reading a running room
///
/// GET /rooms/:room_id
/// Returns the current lifetime of the room, 404 once it has ended
#[instrument(name = "get_room", skip(state))]
pub async fn get_room(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
) -> Result<Json<RoomResponse>, AppError> {
    let record = state
        .rooms
        .read(&room_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("room {room_id}")))?;

    info!(room_id = %record.room_id, room_sid = %record.room_sid, "Room read");
    Ok(Json(record.into()))
}
