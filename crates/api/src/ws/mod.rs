//! Push-channel endpoint.
//!
//! Connection bookkeeping, fan-out and the heartbeat live in
//! `voxweave_events`; this module only adapts axum WebSockets to it.

mod handler;

pub use handler::{ws_handler, WsParams};

use axum::routing::get;
use axum::Router;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/ws", get(ws_handler))
}
