//! Behavioural tests for `ProgressBroadcaster` and the heartbeat sweep.
//!
//! Observers are backed by `ChannelTransport`, so every frame the
//! broadcaster sends can be read back from the paired receiver.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc::Receiver;
use tokio_util::sync::CancellationToken;
use voxweave_core::progress::ProgressEvent;
use voxweave_core::scheduling::TaskStatus;
use voxweave_events::{
    start_heartbeat, BroadcastError, BroadcasterConfig, ChannelTransport, Frame, Notification,
    NotificationLevel, ObserverConnection, ObserverTransport, ProgressBroadcaster,
    TransportError,
};

fn fast_config() -> BroadcasterConfig {
    BroadcasterConfig {
        heartbeat_interval: Duration::from_millis(20),
        idle_timeout: Duration::from_millis(50),
        send_timeout: Duration::from_millis(50),
    }
}

async fn observer(
    broadcaster: &ProgressBroadcaster,
    caller: &str,
) -> (ObserverConnection, Receiver<Frame>) {
    let (transport, rx) = ChannelTransport::new();
    let conn = broadcaster.connect(Arc::new(transport), caller).await.unwrap();
    (conn, rx)
}

fn drain(rx: &mut Receiver<Frame>) -> Vec<Frame> {
    let mut frames = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        frames.push(frame);
    }
    frames
}

fn messages(frames: &[Frame]) -> Vec<Value> {
    frames
        .iter()
        .filter_map(|f| match f {
            Frame::Text(text) => Some(serde_json::from_str(text).unwrap()),
            _ => None,
        })
        .collect()
}

fn of_type(rx: &mut Receiver<Frame>, kind: &str) -> Vec<Value> {
    messages(&drain(rx))
        .into_iter()
        .filter(|m| m["type"] == kind)
        .collect()
}

fn event(session: &str, progress: u8) -> ProgressEvent {
    ProgressEvent::new(session, "window_completed", TaskStatus::Running).with_progress(progress)
}

/// Completes the first `allowed` sends, then never completes another.
struct StallingTransport {
    allowed: usize,
    sends: AtomicUsize,
}

impl StallingTransport {
    fn after(allowed: usize) -> Self {
        Self {
            allowed,
            sends: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ObserverTransport for StallingTransport {
    async fn send(&self, _frame: Frame) -> Result<(), TransportError> {
        if self.sends.fetch_add(1, Ordering::SeqCst) < self.allowed {
            return Ok(());
        }
        std::future::pending().await
    }
}

// ---------------------------------------------------------------------------
// Test: connect sends the handshake with the assigned connection id
// ---------------------------------------------------------------------------

#[tokio::test]
async fn connect_sends_handshake() {
    let broadcaster = ProgressBroadcaster::default();

    let (conn, mut rx) = observer(&broadcaster, "alice").await;

    let hello = of_type(&mut rx, "connection_established");
    assert_eq!(hello.len(), 1);
    assert_eq!(hello[0]["data"]["connection_id"], conn.id.as_str());
    assert_eq!(conn.caller_id, "alice");
    assert_eq!(broadcaster.connection_count().await, 1);
}

#[tokio::test]
async fn failed_handshake_leaves_no_connection() {
    let broadcaster = ProgressBroadcaster::default();
    let (transport, rx) = ChannelTransport::new();
    drop(rx);

    let result = broadcaster.connect(Arc::new(transport), "alice").await;

    assert_matches!(result, Err(TransportError::Closed));
    assert_eq!(broadcaster.connection_count().await, 0);
}

// ---------------------------------------------------------------------------
// Test: session routing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn subscriber_receives_only_its_session() {
    let broadcaster = ProgressBroadcaster::default();
    let (conn, mut rx) = observer(&broadcaster, "alice").await;
    broadcaster.subscribe(&conn.id, "synthesis_42").await.unwrap();

    let acks = of_type(&mut rx, "subscription_confirmed");
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0]["data"]["session_id"], "synthesis_42");

    assert_eq!(broadcaster.publish("synthesis_42", &event("synthesis_42", 40)).await, 1);
    assert_eq!(broadcaster.publish("synthesis_43", &event("synthesis_43", 40)).await, 0);

    let updates = of_type(&mut rx, "progress_update");
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0]["data"]["session_id"], "synthesis_42");
    assert_eq!(updates[0]["data"]["progress"], 40);
}

#[tokio::test]
async fn unsubscribe_stops_delivery() {
    let broadcaster = ProgressBroadcaster::default();
    let (conn, mut rx) = observer(&broadcaster, "alice").await;
    broadcaster.subscribe(&conn.id, "synthesis_1").await.unwrap();
    broadcaster.unsubscribe(&conn.id, "synthesis_1").await.unwrap();

    assert_eq!(of_type(&mut rx, "unsubscription_confirmed").len(), 1);
    assert_eq!(broadcaster.publish("synthesis_1", &event("synthesis_1", 10)).await, 0);
    assert_eq!(broadcaster.subscriber_count("synthesis_1").await, 0);
    assert!(of_type(&mut rx, "progress_update").is_empty());
}

#[tokio::test]
async fn subscribe_unknown_connection_is_rejected() {
    let broadcaster = ProgressBroadcaster::default();

    let result = broadcaster.subscribe("nope", "synthesis_1").await;

    assert_matches!(result, Err(BroadcastError::UnknownConnection(id)) if id == "nope");
    assert_eq!(broadcaster.subscriber_count("synthesis_1").await, 0);
}

#[tokio::test]
async fn disconnect_removes_subscriptions() {
    let broadcaster = ProgressBroadcaster::default();
    let (conn, _rx) = observer(&broadcaster, "alice").await;
    broadcaster.subscribe(&conn.id, "synthesis_1").await.unwrap();

    assert!(broadcaster.disconnect(&conn.id).await);
    assert!(!broadcaster.disconnect(&conn.id).await);
    assert_eq!(broadcaster.subscriber_count("synthesis_1").await, 0);
}

// ---------------------------------------------------------------------------
// Test: fan-out isolation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn broken_subscriber_does_not_affect_others() {
    let broadcaster = ProgressBroadcaster::default();
    let (a, mut rx_a) = observer(&broadcaster, "a").await;
    let (b, rx_b) = observer(&broadcaster, "b").await;
    let (c, mut rx_c) = observer(&broadcaster, "c").await;
    for conn in [&a, &b, &c] {
        broadcaster.subscribe(&conn.id, "synthesis_7").await.unwrap();
    }
    drop(rx_b);

    let delivered = broadcaster.publish("synthesis_7", &event("synthesis_7", 50)).await;

    assert_eq!(delivered, 2);
    assert_eq!(of_type(&mut rx_a, "progress_update").len(), 1);
    assert_eq!(of_type(&mut rx_c, "progress_update").len(), 1);
    assert!(broadcaster.connection(&b.id).await.is_none());
    assert_eq!(broadcaster.subscriber_count("synthesis_7").await, 2);
}

#[tokio::test]
async fn stalled_subscriber_is_bounded_and_dropped() {
    let broadcaster = ProgressBroadcaster::new(fast_config());
    let stalled = broadcaster
        .connect(Arc::new(StallingTransport::after(2)), "slow")
        .await
        .unwrap();
    let (ok, mut rx) = observer(&broadcaster, "fast").await;
    broadcaster.subscribe(&stalled.id, "synthesis_3").await.unwrap();
    broadcaster.subscribe(&ok.id, "synthesis_3").await.unwrap();

    let started = tokio::time::Instant::now();
    let delivered = broadcaster.publish("synthesis_3", &event("synthesis_3", 20)).await;

    assert_eq!(delivered, 1);
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(of_type(&mut rx, "progress_update").len(), 1);
    assert!(broadcaster.connection(&stalled.id).await.is_none());
    assert_eq!(broadcaster.subscriber_count("synthesis_3").await, 1);
}

#[tokio::test]
async fn undrained_channel_observer_is_dropped_after_send_timeout() {
    let broadcaster = ProgressBroadcaster::new(fast_config());
    // Room for the handshake and the subscription ack, nothing more.
    let (transport, mut full_rx) = ChannelTransport::with_capacity(2);
    let full = broadcaster.connect(Arc::new(transport), "slow").await.unwrap();
    broadcaster.subscribe(&full.id, "synthesis_4").await.unwrap();
    let (ok, mut rx) = observer(&broadcaster, "fast").await;
    broadcaster.subscribe(&ok.id, "synthesis_4").await.unwrap();

    let started = tokio::time::Instant::now();
    let delivered = broadcaster.publish("synthesis_4", &event("synthesis_4", 30)).await;

    assert_eq!(delivered, 1);
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(of_type(&mut rx, "progress_update").len(), 1);
    assert!(broadcaster.connection(&full.id).await.is_none());
    assert!(of_type(&mut full_rx, "progress_update").is_empty());
}

// ---------------------------------------------------------------------------
// Test: idle eviction
// ---------------------------------------------------------------------------

#[tokio::test]
async fn idle_observer_is_evicted_and_gets_nothing_more() {
    let broadcaster = ProgressBroadcaster::new(fast_config());
    let (idle, mut rx_idle) = observer(&broadcaster, "idle").await;
    let (live, mut rx_live) = observer(&broadcaster, "live").await;
    broadcaster.subscribe(&idle.id, "synthesis_5").await.unwrap();
    broadcaster.subscribe(&live.id, "synthesis_5").await.unwrap();

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(broadcaster.touch(&live.id).await);

    let evicted = broadcaster.sweep_idle().await;
    assert_eq!(evicted, vec![idle.id.clone()]);

    assert_eq!(broadcaster.publish("synthesis_5", &event("synthesis_5", 60)).await, 1);

    let idle_frames = drain(&mut rx_idle);
    assert_eq!(idle_frames.last(), Some(&Frame::Close));
    assert!(messages(&idle_frames)
        .iter()
        .all(|m| m["type"] != "progress_update"));
    assert_eq!(of_type(&mut rx_live, "progress_update").len(), 1);
}

#[tokio::test]
async fn outbound_traffic_does_not_keep_observer_alive() {
    let broadcaster = ProgressBroadcaster::new(fast_config());
    let (conn, _rx) = observer(&broadcaster, "quiet").await;
    broadcaster.subscribe(&conn.id, "synthesis_8").await.unwrap();

    for step in 0..4 {
        broadcaster
            .publish("synthesis_8", &event("synthesis_8", step * 10))
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert_eq!(broadcaster.sweep_idle().await, vec![conn.id]);
    assert_eq!(broadcaster.connection_count().await, 0);
}

#[tokio::test]
async fn heartbeat_evicts_idle_and_stops_on_cancel() {
    let broadcaster = Arc::new(ProgressBroadcaster::new(fast_config()));
    let (_conn, mut rx) = observer(&broadcaster, "idle").await;
    let cancel = CancellationToken::new();
    let handle = start_heartbeat(Arc::clone(&broadcaster), cancel.clone());

    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(broadcaster.connection_count().await, 0);
    let frames = drain(&mut rx);
    assert!(frames.contains(&Frame::Ping));
    assert_eq!(frames.last(), Some(&Frame::Close));

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("heartbeat should stop after cancel")
        .unwrap();
}

#[tokio::test]
async fn zero_heartbeat_interval_keeps_running_until_cancel() {
    let broadcaster = Arc::new(ProgressBroadcaster::new(BroadcasterConfig {
        heartbeat_interval: Duration::ZERO,
        ..fast_config()
    }));
    let cancel = CancellationToken::new();
    let handle = start_heartbeat(Arc::clone(&broadcaster), cancel.clone());

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!handle.is_finished());

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("heartbeat should stop after cancel")
        .unwrap();
}

// ---------------------------------------------------------------------------
// Test: inbound control messages
// ---------------------------------------------------------------------------

#[tokio::test]
async fn ping_message_gets_pong() {
    let broadcaster = ProgressBroadcaster::default();
    let (conn, mut rx) = observer(&broadcaster, "alice").await;

    broadcaster
        .handle_client_message(&conn.id, r#"{"type":"ping"}"#)
        .await
        .unwrap();

    let pongs = of_type(&mut rx, "pong");
    assert_eq!(pongs.len(), 1);
    assert!(pongs[0]["timestamp"].is_string());
}

#[tokio::test]
async fn subscribe_message_subscribes() {
    let broadcaster = ProgressBroadcaster::default();
    let (conn, mut rx) = observer(&broadcaster, "alice").await;

    broadcaster
        .handle_client_message(&conn.id, r#"{"type":"subscribe","session_id":"synthesis_9"}"#)
        .await
        .unwrap();

    assert_eq!(broadcaster.subscriber_count("synthesis_9").await, 1);
    assert_eq!(of_type(&mut rx, "subscription_confirmed").len(), 1);

    broadcaster
        .handle_client_message(&conn.id, r#"{"type":"unsubscribe","session_id":"synthesis_9"}"#)
        .await
        .unwrap();
    assert_eq!(broadcaster.subscriber_count("synthesis_9").await, 0);
}

#[tokio::test]
async fn malformed_message_gets_error_and_connection_survives() {
    let broadcaster = ProgressBroadcaster::default();
    let (conn, mut rx) = observer(&broadcaster, "alice").await;

    broadcaster
        .handle_client_message(&conn.id, "{not json")
        .await
        .unwrap();
    broadcaster
        .handle_client_message(&conn.id, r#"{"type":"dance"}"#)
        .await
        .unwrap();
    broadcaster
        .handle_client_message(&conn.id, r#"{"type":"subscribe","session_id":"  "}"#)
        .await
        .unwrap();

    let errors = of_type(&mut rx, "error");
    assert_eq!(errors.len(), 3);
    assert!(errors[2]["data"]["message"]
        .as_str()
        .unwrap()
        .contains("session_id"));
    assert!(broadcaster.connection(&conn.id).await.is_some());
}

#[tokio::test]
async fn message_from_unknown_connection_is_rejected() {
    let broadcaster = ProgressBroadcaster::default();

    let result = broadcaster
        .handle_client_message("ghost", r#"{"type":"ping"}"#)
        .await;

    assert_matches!(result, Err(BroadcastError::UnknownConnection(_)));
}

#[tokio::test]
async fn inbound_message_refreshes_activity() {
    let broadcaster = ProgressBroadcaster::new(fast_config());
    let (conn, _rx) = observer(&broadcaster, "chatty").await;
    let before = broadcaster.connection(&conn.id).await.unwrap().last_activity;

    tokio::time::sleep(Duration::from_millis(40)).await;
    broadcaster
        .handle_client_message(&conn.id, r#"{"type":"ping"}"#)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert!(broadcaster.sweep_idle().await.is_empty());
    let after = broadcaster.connection(&conn.id).await.unwrap().last_activity;
    assert!(after > before);
}

// ---------------------------------------------------------------------------
// Test: notifications, broadcast, stats, shutdown
// ---------------------------------------------------------------------------

#[tokio::test]
async fn notify_user_reaches_only_that_caller() {
    let broadcaster = ProgressBroadcaster::default();
    let (_a1, mut rx_a1) = observer(&broadcaster, "alice").await;
    let (_a2, mut rx_a2) = observer(&broadcaster, "alice").await;
    let (_b, mut rx_b) = observer(&broadcaster, "bob").await;

    let sent = broadcaster
        .notify_user(
            "alice",
            Notification::new(NotificationLevel::Success, "Done", "Chapter 3 synthesized"),
        )
        .await;

    assert_eq!(sent, 2);
    assert_eq!(of_type(&mut rx_a1, "notification").len(), 1);
    assert_eq!(of_type(&mut rx_a2, "notification").len(), 1);
    assert!(of_type(&mut rx_b, "notification").is_empty());
    assert_eq!(
        broadcaster
            .notify_user("carol", Notification::new(NotificationLevel::Info, "x", "y"))
            .await,
        0
    );
}

#[tokio::test]
async fn broadcast_ignores_subscriptions() {
    let broadcaster = ProgressBroadcaster::default();
    let (_a, mut rx_a) = observer(&broadcaster, "a").await;
    let (_b, mut rx_b) = observer(&broadcaster, "b").await;

    assert_eq!(broadcaster.broadcast(&event("system", 0)).await, 2);
    assert_eq!(of_type(&mut rx_a, "progress_update").len(), 1);
    assert_eq!(of_type(&mut rx_b, "progress_update").len(), 1);
}

#[tokio::test]
async fn stats_reflect_indexes() {
    let broadcaster = ProgressBroadcaster::default();
    let (a1, _rx1) = observer(&broadcaster, "alice").await;
    let (a2, _rx2) = observer(&broadcaster, "alice").await;
    let (b, _rx3) = observer(&broadcaster, "bob").await;
    broadcaster.subscribe(&a1.id, "synthesis_1").await.unwrap();
    broadcaster.subscribe(&a2.id, "synthesis_1").await.unwrap();
    broadcaster.subscribe(&b.id, "synthesis_2").await.unwrap();

    let stats = broadcaster.stats().await;

    assert_eq!(stats.total_connections, 3);
    assert_eq!(stats.unique_callers, 2);
    assert_eq!(stats.active_sessions, 2);
    assert_eq!(stats.caller_connections["alice"], 2);
    assert_eq!(stats.session_subscribers["synthesis_1"], 2);
}

#[tokio::test]
async fn shutdown_all_closes_every_observer() {
    let broadcaster = ProgressBroadcaster::default();
    let (a, mut rx_a) = observer(&broadcaster, "a").await;
    let (_b, mut rx_b) = observer(&broadcaster, "b").await;
    broadcaster.subscribe(&a.id, "synthesis_1").await.unwrap();

    broadcaster.shutdown_all().await;

    assert_eq!(broadcaster.connection_count().await, 0);
    assert_eq!(broadcaster.subscriber_count("synthesis_1").await, 0);
    assert_eq!(drain(&mut rx_a).last(), Some(&Frame::Close));
    assert_eq!(drain(&mut rx_b).last(), Some(&Frame::Close));
}
