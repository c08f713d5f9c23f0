use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use serde::Serialize;

use syncparty_core::net::messages::RoomSnapshot;
use syncparty_core::transport::TransportState;

use crate::error::AppError;
use crate::state::AppState;

/// One live room, as listed by the status endpoint.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummary {
    pub code: String,
    pub name: String,
    pub grid_size: u32,
    pub devices: usize,
    pub connected: usize,
    pub track: Option<String>,
    pub transport: TransportState,
    pub seq: u64,
}

impl From<RoomSnapshot> for RoomSummary {
    fn from(s: RoomSnapshot) -> Self {
        Self {
            connected: s.devices.iter().filter(|d| d.connected).count(),
            devices: s.devices.len(),
            code: s.code,
            name: s.name,
            grid_size: s.grid_size,
            track: s.track,
            transport: s.transport,
            seq: s.seq,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub rooms: Vec<RoomSummary>,
    pub websocket_connections: usize,
}

/// GET /api/v1/status: live rooms and their occupancy.
pub async fn get_status(State(state): State<AppState>) -> Json<StatusResponse> {
    let rooms = state
        .hub
        .list()
        .await
        .into_iter()
        .map(RoomSummary::from)
        .collect();
    Json(StatusResponse {
        rooms,
        websocket_connections: state
            .ws_connection_count
            .load(std::sync::atomic::Ordering::Relaxed),
    })
}

/// GET /api/v1/parties/{code}: snapshot of a live room.
pub async fn get_party(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<Json<RoomSnapshot>, AppError> {
    Ok(Json(state.hub.snapshot(&code).await?))
}

/// POST /api/v1/parties/{code}/open: activate a room with no devices.
pub async fn open_party(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<(StatusCode, Json<RoomSnapshot>), AppError> {
    let snapshot = state.hub.open(&code).await?;
    tracing::info!(room = %snapshot.code, "Room opened via API");
    Ok((StatusCode::CREATED, Json(snapshot)))
}
