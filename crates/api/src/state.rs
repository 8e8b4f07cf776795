use std::sync::Arc;

use voxweave_events::ProgressBroadcaster;
use voxweave_pipeline::TaskScheduler;

use crate::config::ServerConfig;

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// Cheaply cloneable; every member is behind an `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    /// Observer connections and session fan-out.
    pub broadcaster: Arc<ProgressBroadcaster>,
    /// Task lifecycle entry point for embedding callers.
    pub scheduler: Arc<TaskScheduler>,
}
