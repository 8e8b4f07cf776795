//! JSON envelopes exchanged over the push channel.
//!
//! Every message carries a `type` discriminator. Server messages wrap their
//! body in `data`, except `pong` which only carries a timestamp.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use voxweave_core::progress::ProgressEvent;
use voxweave_core::types::Timestamp;

// ---------------------------------------------------------------------------
// Server -> client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    ConnectionEstablished { data: ConnectionInfo },
    ProgressUpdate { data: ProgressEvent },
    SubscriptionConfirmed { data: SubscriptionAck },
    UnsubscriptionConfirmed { data: SubscriptionAck },
    Notification { data: Notification },
    Pong { timestamp: Timestamp },
    Error { data: ErrorInfo },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub connection_id: String,
    pub timestamp: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionAck {
    pub session_id: String,
    pub timestamp: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub message: String,
}

impl ServerMessage {
    pub fn connection_established(connection_id: impl Into<String>) -> Self {
        Self::ConnectionEstablished {
            data: ConnectionInfo {
                connection_id: connection_id.into(),
                timestamp: Utc::now(),
            },
        }
    }

    pub fn subscription_confirmed(session_id: impl Into<String>) -> Self {
        Self::SubscriptionConfirmed {
            data: SubscriptionAck {
                session_id: session_id.into(),
                timestamp: Utc::now(),
            },
        }
    }

    pub fn unsubscription_confirmed(session_id: impl Into<String>) -> Self {
        Self::UnsubscriptionConfirmed {
            data: SubscriptionAck {
                session_id: session_id.into(),
                timestamp: Utc::now(),
            },
        }
    }

    pub fn pong() -> Self {
        Self::Pong {
            timestamp: Utc::now(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            data: ErrorInfo {
                message: message.into(),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    Info,
    Success,
    Warning,
    Error,
}

/// A user-facing notice, delivered per caller rather than per session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub level: NotificationLevel,
    pub title: String,
    pub message: String,
    /// How long a client should display the notice.
    pub duration_ms: u64,
    pub timestamp: Timestamp,
}

/// Display time used when the sender does not pick one.
pub const DEFAULT_NOTIFICATION_DURATION_MS: u64 = 5_000;

impl Notification {
    pub fn new(
        level: NotificationLevel,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            level,
            title: title.into(),
            message: message.into(),
            duration_ms: DEFAULT_NOTIFICATION_DURATION_MS,
            timestamp: Utc::now(),
        }
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }
}

// ---------------------------------------------------------------------------
// Client -> server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe { session_id: String },
    Unsubscribe { session_id: String },
    Ping,
}
