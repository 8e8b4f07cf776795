//! The outbound half of an observer connection.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

/// One outbound frame, independent of the underlying protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A serialized [`ServerMessage`](crate::wire::ServerMessage).
    Text(String),
    /// Transport-level keep-alive probe.
    Ping,
    /// Ask the peer to close the connection.
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,

    #[error("send timed out after {0:?}")]
    TimedOut(Duration),

    #[error("transport error: {0}")]
    Io(String),
}

/// Carries frames to one observer.
///
/// The broadcaster only ever holds an `Arc` to the transport; the socket
/// itself stays owned by whoever created the connection.
#[async_trait]
pub trait ObserverTransport: Send + Sync {
    async fn send(&self, frame: Frame) -> Result<(), TransportError>;
}

/// Frames buffered per observer before a send has to wait.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Transport that pushes frames into a bounded channel.
///
/// The WebSocket handler drains the receiver into the socket sink; tests
/// read it directly. A send into a full channel waits for room, so a
/// reader that stops draining trips the broadcaster's send timeout.
pub struct ChannelTransport {
    sender: mpsc::Sender<Frame>,
}

impl ChannelTransport {
    pub fn new() -> (Self, mpsc::Receiver<Frame>) {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// `capacity` is clamped to at least one frame.
    pub fn with_capacity(capacity: usize) -> (Self, mpsc::Receiver<Frame>) {
        let (sender, rx) = mpsc::channel(capacity.max(1));
        (Self { sender }, rx)
    }
}

#[async_trait]
impl ObserverTransport for ChannelTransport {
    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        self.sender
            .send(frame)
            .await
            .map_err(|_| TransportError::Closed)
    }
}
