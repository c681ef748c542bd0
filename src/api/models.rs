use serde::Serialize;

use crate::rooms::RoomSummary;

// ---------------------------------------------------------------------------
// Response models
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime: u64,
    pub connections: usize,
    pub rooms: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListRoomsResponse {
    pub rooms: Vec<RoomSummary>,
    pub total: usize,
}
