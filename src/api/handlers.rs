use axum::Json;
use axum::extract::{Path, State};

use crate::rooms::RoomSummary;

use super::errors::ApiError;
use super::models::*;
use super::state::SharedState;

// =========================================================================
// Health
// =========================================================================

/// GET /health
pub async fn health(State(state): State<SharedState>) -> Result<Json<HealthResponse>, ApiError> {
    let uptime = state.start_time.elapsed().as_secs();
    let connections = state.hub.connection_count().await?;
    Ok(Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime,
        connections,
        rooms: state.rooms.len().await,
    }))
}

// =========================================================================
// Rooms
// =========================================================================

/// GET /api/rooms
pub async fn list_rooms(State(state): State<SharedState>) -> Json<ListRoomsResponse> {
    let rooms = state.rooms.rooms().await;
    let total = rooms.len();
    Json(ListRoomsResponse { rooms, total })
}

/// GET /api/rooms/{code}
pub async fn get_room(
    State(state): State<SharedState>,
    Path(code): Path<String>,
) -> Result<Json<RoomSummary>, ApiError> {
    match state.rooms.room(&code).await {
        Some(room) => Ok(Json(room.summary().await)),
        None => Err(ApiError::RoomNotFound(code)),
    }
}
