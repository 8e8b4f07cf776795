use axum::extract::State;
use axum::{routing::get, Json, Router};
use serde::Serialize;

use crate::state::AppState;

/// Health check response payload.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    /// Crate version from Cargo.toml.
    pub version: &'static str,
    /// Open observer connections.
    pub connections: usize,
    /// Sessions with at least one subscriber.
    pub active_sessions: usize,
}

/// GET /health -- returns service status and observer counts.
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let stats = state.broadcaster.stats().await;

    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        connections: stats.total_connections,
        active_sessions: stats.active_sessions,
    })
}

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
