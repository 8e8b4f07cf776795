#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, Response};
use axum::Router;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tower::ServiceExt;

use voxweave_api::config::{LogFormat, ServerConfig};
use voxweave_api::router::build_app_router;
use voxweave_api::state::AppState;
use voxweave_db::MemoryJobStore;
use voxweave_engine::{
    ArtifactMerger, EngineError, MergeError, SynthesisEngineClient, SynthesisOutput,
    SynthesisRequest,
};
use voxweave_events::{BroadcasterConfig, ProgressBroadcaster};
use voxweave_pipeline::{SchedulerConfig, TaskScheduler};

pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Build a test `ServerConfig` with safe defaults.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        cors_origins: vec!["http://localhost:5173".to_string()],
        request_timeout_secs: 30,
        shutdown_timeout_secs: 5,
        engine_url: "http://127.0.0.1:1".to_string(),
        engine_timeout_secs: 5,
        heartbeat_interval_secs: 30,
        idle_timeout_secs: 300,
        retry_backoff_secs: 1,
        log_format: LogFormat::Pretty,
    }
}

/// Engine fake that succeeds immediately for every segment.
pub struct InstantEngine;

#[async_trait]
impl SynthesisEngineClient for InstantEngine {
    async fn synthesize(&self, request: SynthesisRequest) -> Result<SynthesisOutput, EngineError> {
        Ok(SynthesisOutput {
            artifact_ref: format!("{}.wav", request.text.replace(' ', "_")),
            duration_secs: 1.0,
        })
    }
}

#[async_trait]
impl ArtifactMerger for InstantEngine {
    async fn merge(&self, ordered: &[String]) -> Result<String, MergeError> {
        Ok(ordered.join("+"))
    }
}

pub fn test_state() -> AppState {
    let config = test_config();
    let broadcaster = Arc::new(ProgressBroadcaster::new(BroadcasterConfig::default()));
    let engine = Arc::new(InstantEngine);
    let scheduler = TaskScheduler::new(
        Arc::new(MemoryJobStore::new()),
        engine.clone(),
        engine,
        Arc::clone(&broadcaster),
        SchedulerConfig {
            window_pause: Duration::from_millis(1),
            ..SchedulerConfig::default()
        },
    );
    AppState {
        config: Arc::new(config),
        broadcaster,
        scheduler,
    }
}

/// Build the full application router over `state`, as `main.rs` does.
pub fn build_test_app(state: AppState) -> Router {
    build_app_router(state, &test_config())
}

pub async fn get(app: Router, uri: &str) -> Response<Body> {
    app.oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap()
}

pub async fn body_json(response: Response<Body>) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

/// Serve the app on an ephemeral local port.
pub async fn spawn_server(state: AppState) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = build_test_app(state);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

pub async fn connect(addr: SocketAddr, query: &str) -> Client {
    let (client, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws{query}"))
        .await
        .unwrap();
    client
}

/// Next JSON text message, skipping transport frames.
pub async fn next_json(client: &mut Client) -> Value {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("timed out waiting for a message")
            .expect("stream ended")
            .unwrap();
        if let Message::Text(text) = message {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

/// Next message of the given envelope type.
pub async fn next_of_type(client: &mut Client, kind: &str) -> Value {
    loop {
        let message = next_json(client).await;
        if message["type"] == kind {
            return message;
        }
    }
}

pub async fn send_json(client: &mut Client, value: Value) {
    client
        .send(Message::Text(value.to_string()))
        .await
        .unwrap();
}
