use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use voxweave_events::{ChannelTransport, Frame, ProgressBroadcaster, ANONYMOUS_CALLER};

use crate::error::{AppError, AppResult};
use crate::state::AppState;

const MAX_CALLER_ID_LEN: usize = 128;

#[derive(Debug, Default, Deserialize)]
pub struct WsParams {
    /// Caller identity used for per-user notifications.
    pub user_id: Option<String>,
}

/// Resolve the caller id from the query, defaulting to the anonymous caller.
fn caller_id(user_id: Option<String>) -> AppResult<String> {
    let Some(raw) = user_id else {
        return Ok(ANONYMOUS_CALLER.to_string());
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(ANONYMOUS_CALLER.to_string());
    }
    if trimmed.len() > MAX_CALLER_ID_LEN || trimmed.chars().any(char::is_control) {
        return Err(AppError::BadRequest(format!(
            "user_id must be at most {MAX_CALLER_ID_LEN} printable characters"
        )));
    }
    Ok(trimmed.to_string())
}

/// GET /ws -- upgrades to the progress push channel.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<AppState>,
) -> AppResult<Response> {
    let caller_id = caller_id(params.user_id)?;
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state.broadcaster, caller_id)))
}

fn to_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text.into()),
        Frame::Ping => Message::Ping(Default::default()),
        Frame::Close => Message::Close(None),
    }
}

/// Run one observer connection after upgrade.
///
/// Outbound frames flow broadcaster -> channel -> sender task -> sink.
/// Inbound text frames go to the broadcaster's control-message handling;
/// pongs only refresh liveness.
async fn handle_socket(
    socket: WebSocket,
    broadcaster: Arc<ProgressBroadcaster>,
    caller_id: String,
) {
    let (transport, mut rx) = ChannelTransport::new();
    let (mut sink, mut stream) = socket.split();

    let send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let closing = frame == Frame::Close;
            if sink.send(to_message(frame)).await.is_err() {
                tracing::debug!("WebSocket sink closed");
                break;
            }
            if closing {
                break;
            }
        }
    });

    let conn = match broadcaster.connect(Arc::new(transport), caller_id).await {
        Ok(conn) => conn,
        Err(e) => {
            tracing::warn!(error = %e, "WebSocket handshake failed");
            send_task.abort();
            return;
        }
    };

    while let Some(result) = stream.next().await {
        match result {
            Ok(Message::Text(text)) => {
                if let Err(e) = broadcaster.handle_client_message(&conn.id, text.as_str()).await {
                    // The connection was evicted or dropped as broken.
                    tracing::debug!(conn_id = %conn.id, error = %e, "Dropping inbound message");
                    break;
                }
            }
            Ok(Message::Pong(_)) => {
                broadcaster.touch(&conn.id).await;
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(conn_id = %conn.id, error = %e, "WebSocket receive error");
                break;
            }
        }
    }

    broadcaster.disconnect(&conn.id).await;
    send_task.abort();
}
