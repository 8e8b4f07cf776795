//! Observer registry and progress fan-out.
//!
//! A single `RwLock` guards the connection table together with the
//! session → subscribers and caller → connections indexes, so every index
//! changes in the same critical section as the table. Deliveries never
//! happen under the lock: targets are snapshotted, the lock is released,
//! and frames are sent concurrently with a per-send timeout. A failed or
//! timed-out send tears down that one connection and is never reported to
//! the publisher.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::time::Instant;
use voxweave_core::progress::ProgressEvent;
use voxweave_core::types::Timestamp;

use crate::transport::{Frame, ObserverTransport, TransportError};
use crate::wire::{ClientMessage, Notification, ServerMessage};

pub type ConnectionId = String;

/// Caller id recorded for observers that did not identify themselves.
pub const ANONYMOUS_CALLER: &str = "anonymous";

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct BroadcasterConfig {
    /// Period of the idle sweep and keep-alive pings.
    pub heartbeat_interval: Duration,
    /// Connections with no inbound traffic for this long are evicted.
    pub idle_timeout: Duration,
    /// Upper bound on a single delivery to one observer.
    pub send_timeout: Duration,
}

impl Default for BroadcasterConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(300),
            send_timeout: Duration::from_secs(5),
        }
    }
}

// ---------------------------------------------------------------------------
// Public views
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum BroadcastError {
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Point-in-time view of one registered observer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObserverConnection {
    pub id: ConnectionId,
    pub caller_id: String,
    /// Sorted for stable output.
    pub subscriptions: Vec<String>,
    pub connected_at: Timestamp,
    pub last_activity: Timestamp,
}

#[derive(Debug, Clone, Serialize)]
pub struct BroadcasterStats {
    pub total_connections: usize,
    pub unique_callers: usize,
    pub active_sessions: usize,
    pub caller_connections: HashMap<String, usize>,
    pub session_subscribers: HashMap<String, usize>,
    pub timestamp: Timestamp,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

type Target = (ConnectionId, Arc<dyn ObserverTransport>);

struct Entry {
    caller_id: String,
    transport: Arc<dyn ObserverTransport>,
    subscriptions: HashSet<String>,
    connected_at: Timestamp,
    last_activity: Timestamp,
    /// Monotonic twin of `last_activity`, used for idle checks.
    last_seen: Instant,
}

impl Entry {
    fn snapshot(&self, id: &str) -> ObserverConnection {
        let mut subscriptions: Vec<String> = self.subscriptions.iter().cloned().collect();
        subscriptions.sort();
        ObserverConnection {
            id: id.to_string(),
            caller_id: self.caller_id.clone(),
            subscriptions,
            connected_at: self.connected_at,
            last_activity: self.last_activity,
        }
    }
}

#[derive(Default)]
struct Registry {
    connections: HashMap<ConnectionId, Entry>,
    sessions: HashMap<String, HashSet<ConnectionId>>,
    callers: HashMap<String, HashSet<ConnectionId>>,
}

fn unlink(index: &mut HashMap<String, HashSet<ConnectionId>>, key: &str, id: &str) {
    if let Some(ids) = index.get_mut(key) {
        ids.remove(id);
        if ids.is_empty() {
            index.remove(key);
        }
    }
}

impl Registry {
    fn insert(&mut self, id: ConnectionId, entry: Entry) {
        self.callers
            .entry(entry.caller_id.clone())
            .or_default()
            .insert(id.clone());
        self.connections.insert(id, entry);
    }

    /// Remove a connection and every index entry pointing at it.
    fn remove(&mut self, id: &str) -> Option<Entry> {
        let entry = self.connections.remove(id)?;
        for session_id in &entry.subscriptions {
            unlink(&mut self.sessions, session_id, id);
        }
        unlink(&mut self.callers, &entry.caller_id, id);
        Some(entry)
    }

    fn subscribe(&mut self, id: &str, session_id: &str) -> bool {
        let Some(entry) = self.connections.get_mut(id) else {
            return false;
        };
        entry.subscriptions.insert(session_id.to_string());
        self.sessions
            .entry(session_id.to_string())
            .or_default()
            .insert(id.to_string());
        true
    }

    fn unsubscribe(&mut self, id: &str, session_id: &str) -> bool {
        let Some(entry) = self.connections.get_mut(id) else {
            return false;
        };
        entry.subscriptions.remove(session_id);
        unlink(&mut self.sessions, session_id, id);
        true
    }

    fn targets<'a>(&self, ids: impl IntoIterator<Item = &'a ConnectionId>) -> Vec<Target> {
        ids.into_iter()
            .filter_map(|id| {
                self.connections
                    .get(id)
                    .map(|entry| (id.clone(), Arc::clone(&entry.transport)))
            })
            .collect()
    }

    fn all_targets(&self) -> Vec<Target> {
        self.targets(self.connections.keys())
    }
}

fn encode(message: &ServerMessage) -> Result<String, TransportError> {
    serde_json::to_string(message).map_err(|e| {
        tracing::error!(error = %e, "Failed to serialize server message");
        TransportError::Io(e.to_string())
    })
}

// ---------------------------------------------------------------------------
// ProgressBroadcaster
// ---------------------------------------------------------------------------

/// Owns observer connections and routes progress events to them.
///
/// Shared as `Arc<ProgressBroadcaster>` between the push-channel handler,
/// the scheduler, and the heartbeat task.
pub struct ProgressBroadcaster {
    registry: RwLock<Registry>,
    config: BroadcasterConfig,
}

impl ProgressBroadcaster {
    pub fn new(config: BroadcasterConfig) -> Self {
        Self {
            registry: RwLock::new(Registry::default()),
            config,
        }
    }

    pub fn config(&self) -> &BroadcasterConfig {
        &self.config
    }

    // -- connection lifecycle -----------------------------------------------

    /// Register an observer and send it the `connection_established` handshake.
    ///
    /// If the handshake cannot be delivered the connection is removed again
    /// and the transport error is returned.
    pub async fn connect(
        &self,
        transport: Arc<dyn ObserverTransport>,
        caller_id: impl Into<String>,
    ) -> Result<ObserverConnection, TransportError> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let entry = Entry {
            caller_id: caller_id.into(),
            transport: Arc::clone(&transport),
            subscriptions: HashSet::new(),
            connected_at: now,
            last_activity: now,
            last_seen: Instant::now(),
        };
        let snapshot = entry.snapshot(&id);
        self.registry.write().await.insert(id.clone(), entry);

        let handshake = match encode(&ServerMessage::connection_established(&id)) {
            Ok(text) => self.send_frame(&transport, Frame::Text(text)).await,
            Err(e) => Err(e),
        };
        if let Err(e) = handshake {
            self.registry.write().await.remove(&id);
            tracing::warn!(connection_id = %id, error = %e, "Handshake failed");
            return Err(e);
        }

        tracing::info!(
            connection_id = %id,
            caller_id = %snapshot.caller_id,
            "Observer connected",
        );
        Ok(snapshot)
    }

    /// Remove a connection from all indexes. Returns `false` if it was unknown.
    pub async fn disconnect(&self, connection_id: &str) -> bool {
        let removed = self.registry.write().await.remove(connection_id);
        match removed {
            Some(entry) => {
                tracing::info!(
                    connection_id,
                    subscriptions = entry.subscriptions.len(),
                    "Observer disconnected",
                );
                true
            }
            None => false,
        }
    }

    pub async fn subscribe(
        &self,
        connection_id: &str,
        session_id: &str,
    ) -> Result<(), BroadcastError> {
        if !self.registry.write().await.subscribe(connection_id, session_id) {
            return Err(BroadcastError::UnknownConnection(connection_id.to_string()));
        }
        tracing::debug!(connection_id, session_id, "Observer subscribed");
        self.send_to_connection(connection_id, &ServerMessage::subscription_confirmed(session_id))
            .await;
        Ok(())
    }

    pub async fn unsubscribe(
        &self,
        connection_id: &str,
        session_id: &str,
    ) -> Result<(), BroadcastError> {
        if !self
            .registry
            .write()
            .await
            .unsubscribe(connection_id, session_id)
        {
            return Err(BroadcastError::UnknownConnection(connection_id.to_string()));
        }
        tracing::debug!(connection_id, session_id, "Observer unsubscribed");
        self.send_to_connection(
            connection_id,
            &ServerMessage::unsubscription_confirmed(session_id),
        )
        .await;
        Ok(())
    }

    /// Record inbound activity. Returns `false` if the connection is unknown.
    pub async fn touch(&self, connection_id: &str) -> bool {
        let mut registry = self.registry.write().await;
        match registry.connections.get_mut(connection_id) {
            Some(entry) => {
                entry.last_seen = Instant::now();
                entry.last_activity = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Handle one inbound text message from an observer.
    ///
    /// Counts as activity. Malformed input is answered with an `error`
    /// envelope; the connection stays open.
    pub async fn handle_client_message(
        &self,
        connection_id: &str,
        text: &str,
    ) -> Result<(), BroadcastError> {
        if !self.touch(connection_id).await {
            return Err(BroadcastError::UnknownConnection(connection_id.to_string()));
        }

        let message = match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(connection_id, error = %e, "Unrecognized client message");
                self.send_to_connection(
                    connection_id,
                    &ServerMessage::error(format!("invalid message: {e}")),
                )
                .await;
                return Ok(());
            }
        };

        match message {
            ClientMessage::Subscribe { session_id } | ClientMessage::Unsubscribe { session_id }
                if session_id.trim().is_empty() =>
            {
                self.send_to_connection(
                    connection_id,
                    &ServerMessage::error("session_id must not be empty"),
                )
                .await;
                Ok(())
            }
            ClientMessage::Subscribe { session_id } => {
                self.subscribe(connection_id, &session_id).await
            }
            ClientMessage::Unsubscribe { session_id } => {
                self.unsubscribe(connection_id, &session_id).await
            }
            ClientMessage::Ping => {
                self.send_to_connection(connection_id, &ServerMessage::pong())
                    .await;
                Ok(())
            }
        }
    }

    // -- delivery -----------------------------------------------------------

    /// Deliver `event` to every current subscriber of `session_id`.
    ///
    /// Returns the number of successful deliveries. Broken subscribers are
    /// dropped; nothing is reported back to the caller.
    pub async fn publish(&self, session_id: &str, event: &ProgressEvent) -> usize {
        let targets = {
            let registry = self.registry.read().await;
            match registry.sessions.get(session_id) {
                Some(ids) => registry.targets(ids),
                None => Vec::new(),
            }
        };
        if targets.is_empty() {
            tracing::trace!(session_id, "No subscribers for session");
            return 0;
        }

        let Ok(text) = encode(&ServerMessage::ProgressUpdate {
            data: event.clone(),
        }) else {
            return 0;
        };
        let delivered = self.deliver(targets, Frame::Text(text)).await;
        tracing::debug!(
            session_id,
            event_type = %event.event_type,
            progress = event.progress,
            delivered,
            "Progress published",
        );
        delivered
    }

    /// Deliver `event` to every connected observer regardless of subscription.
    pub async fn broadcast(&self, event: &ProgressEvent) -> usize {
        let Ok(text) = encode(&ServerMessage::ProgressUpdate {
            data: event.clone(),
        }) else {
            return 0;
        };
        let targets = self.registry.read().await.all_targets();
        self.deliver(targets, Frame::Text(text)).await
    }

    /// Deliver a notification to every connection opened by `caller_id`.
    pub async fn notify_user(&self, caller_id: &str, notification: Notification) -> usize {
        let targets = {
            let registry = self.registry.read().await;
            match registry.callers.get(caller_id) {
                Some(ids) => registry.targets(ids),
                None => Vec::new(),
            }
        };
        if targets.is_empty() {
            return 0;
        }
        let Ok(text) = encode(&ServerMessage::Notification { data: notification }) else {
            return 0;
        };
        self.deliver(targets, Frame::Text(text)).await
    }

    /// Send one message to a single connection. Returns whether it was delivered.
    pub async fn send_to_connection(&self, connection_id: &str, message: &ServerMessage) -> bool {
        let targets = self
            .registry
            .read()
            .await
            .targets(std::iter::once(&connection_id.to_string()));
        if targets.is_empty() {
            return false;
        }
        let Ok(text) = encode(message) else {
            return false;
        };
        self.deliver(targets, Frame::Text(text)).await == 1
    }

    // -- heartbeat ------------------------------------------------------------

    /// Evict every connection idle for longer than the configured timeout.
    ///
    /// Evicted observers are sent a best-effort close frame and receive no
    /// further deliveries.
    pub async fn sweep_idle(&self) -> Vec<ConnectionId> {
        let idle_timeout = self.config.idle_timeout;
        let evicted: Vec<(ConnectionId, Entry)> = {
            let mut registry = self.registry.write().await;
            let stale: Vec<ConnectionId> = registry
                .connections
                .iter()
                .filter(|(_, entry)| entry.last_seen.elapsed() > idle_timeout)
                .map(|(id, _)| id.clone())
                .collect();
            stale
                .into_iter()
                .filter_map(|id| registry.remove(&id).map(|entry| (id, entry)))
                .collect()
        };
        if evicted.is_empty() {
            return Vec::new();
        }

        join_all(
            evicted
                .iter()
                .map(|(_, entry)| self.send_frame(&entry.transport, Frame::Close)),
        )
        .await;

        evicted
            .into_iter()
            .map(|(id, entry)| {
                tracing::info!(
                    connection_id = %id,
                    caller_id = %entry.caller_id,
                    "Evicted idle observer",
                );
                id
            })
            .collect()
    }

    /// Send a keep-alive ping to every observer. Returns how many succeeded.
    pub async fn ping_all(&self) -> usize {
        let targets = self.registry.read().await.all_targets();
        self.deliver(targets, Frame::Ping).await
    }

    /// Send a close frame to every observer, then clear all indexes.
    pub async fn shutdown_all(&self) {
        let entries: Vec<Entry> = {
            let mut registry = self.registry.write().await;
            registry.sessions.clear();
            registry.callers.clear();
            registry.connections.drain().map(|(_, entry)| entry).collect()
        };
        let count = entries.len();
        join_all(
            entries
                .iter()
                .map(|entry| self.send_frame(&entry.transport, Frame::Close)),
        )
        .await;
        tracing::info!(count, "Closed all observer connections");
    }

    // -- queries --------------------------------------------------------------

    pub async fn connection(&self, connection_id: &str) -> Option<ObserverConnection> {
        self.registry
            .read()
            .await
            .connections
            .get(connection_id)
            .map(|entry| entry.snapshot(connection_id))
    }

    pub async fn connection_count(&self) -> usize {
        self.registry.read().await.connections.len()
    }

    pub async fn subscriber_count(&self, session_id: &str) -> usize {
        self.registry
            .read()
            .await
            .sessions
            .get(session_id)
            .map_or(0, HashSet::len)
    }

    pub async fn stats(&self) -> BroadcasterStats {
        let registry = self.registry.read().await;
        BroadcasterStats {
            total_connections: registry.connections.len(),
            unique_callers: registry.callers.len(),
            active_sessions: registry.sessions.len(),
            caller_connections: registry
                .callers
                .iter()
                .map(|(caller, ids)| (caller.clone(), ids.len()))
                .collect(),
            session_subscribers: registry
                .sessions
                .iter()
                .map(|(session, ids)| (session.clone(), ids.len()))
                .collect(),
            timestamp: Utc::now(),
        }
    }

    // -- internals ------------------------------------------------------------

    async fn send_frame(
        &self,
        transport: &Arc<dyn ObserverTransport>,
        frame: Frame,
    ) -> Result<(), TransportError> {
        match tokio::time::timeout(self.config.send_timeout, transport.send(frame)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::TimedOut(self.config.send_timeout)),
        }
    }

    /// Send `frame` to all targets concurrently and drop the ones that fail.
    async fn deliver(&self, targets: Vec<Target>, frame: Frame) -> usize {
        let sends = targets.into_iter().map(|(id, transport)| {
            let frame = frame.clone();
            async move {
                let result = self.send_frame(&transport, frame).await;
                (id, result)
            }
        });

        let mut delivered = 0;
        let mut broken = Vec::new();
        for (id, result) in join_all(sends).await {
            match result {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::warn!(
                        connection_id = %id,
                        error = %e,
                        "Delivery failed, dropping observer",
                    );
                    broken.push(id);
                }
            }
        }

        if !broken.is_empty() {
            let mut registry = self.registry.write().await;
            for id in &broken {
                registry.remove(id);
            }
        }
        delivered
    }
}

impl Default for ProgressBroadcaster {
    fn default() -> Self {
        Self::new(BroadcasterConfig::default())
    }
}
