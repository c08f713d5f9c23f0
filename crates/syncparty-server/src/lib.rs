pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod health;
pub mod hub;
pub mod records;
pub mod room_actor;
pub mod state;
pub mod ws;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::middleware;
use axum::routing::{get, post};
use tokio::time::MissedTickBehavior;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use config::ServerConfig;
use records::{PartyRecords, RecordsError};
use state::AppState;

/// Operator API requests are cut off after this long.
const API_TIMEOUT: Duration = Duration::from_secs(10);

/// Build the Axum router and application state from a config, with the
/// party records backend it selects.
pub fn build_app(config: ServerConfig) -> Result<(Router<()>, AppState), RecordsError> {
    let records = records::from_config(&config.records)?;
    Ok(build_app_with_records(config, records))
}

/// Build the router around an existing party records backend.
pub fn build_app_with_records(
    config: ServerConfig,
    records: Arc<dyn PartyRecords>,
) -> (Router<()>, AppState) {
    let state = AppState::new(config, records);

    // API routes (behind bearer auth middleware)
    let api_routes = Router::new()
        .route("/status", get(api::get_status))
        .route("/parties/{code}", get(api::get_party))
        .route("/parties/{code}/open", post(api::open_party))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            bearer_auth_layer,
        ))
        .layer(TimeoutLayer::new(API_TIMEOUT));

    let app = Router::new()
        .route("/health", get(health::health_check))
        .route("/ready", get(health::readiness_check))
        .route("/ws/party/{code}", get(ws::ws_handler))
        .nest("/api/v1", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state.clone());

    (app, state)
}

/// Background task that forgets expired room codes once their tombstones
/// outlive the configured TTL.
pub fn spawn_maintenance(state: AppState) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(state.hub.settings().reap_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tick.tick().await;
            let swept = state.hub.sweep_expired().await;
            if swept > 0 {
                tracing::debug!(swept, "Forgot expired room codes");
            }
        }
    })
}

/// Middleware wrapper that injects AuthConfig into request extensions for the
/// bearer auth middleware.
async fn bearer_auth_layer(
    axum::extract::State(state): axum::extract::State<AppState>,
    mut request: axum::extract::Request,
    next: middleware::Next,
) -> Result<axum::response::Response, error::AppError> {
    request.extensions_mut().insert(state.auth.clone());
    auth::bearer_auth_middleware(request, next).await
}
