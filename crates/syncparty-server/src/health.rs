use std::sync::atomic::Ordering;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use serde::Serialize;

use syncparty_core::net::protocol::PROTOCOL_VERSION;

use crate::state::AppState;

/// Structured health check response.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub protocol: u8,
    pub connections: ConnectionInfo,
    pub rooms: RoomInfo,
}

#[derive(Serialize)]
pub struct ConnectionInfo {
    pub websocket: usize,
}

#[derive(Serialize)]
pub struct RoomInfo {
    pub active: usize,
}

/// Structured health check endpoint. Returns server status, connection counts,
/// and room info as JSON.
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let ws = state.ws_connection_count.load(Ordering::Relaxed);
    let active = state.hub.room_count().await;

    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        protocol: PROTOCOL_VERSION,
        connections: ConnectionInfo { websocket: ws },
        rooms: RoomInfo { active },
    })
}

/// Readiness check. Not ready while the connection cap is exhausted.
pub async fn readiness_check(State(state): State<AppState>) -> (StatusCode, &'static str) {
    let ws = state.ws_connection_count.load(Ordering::Relaxed);
    if ws >= state.config.limits.max_ws_connections {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            "not ready: connection limit reached",
        );
    }
    (StatusCode::OK, "ready")
}
