//! Progress fan-out to observer connections.
//!
//! - [`ProgressBroadcaster`] owns the connection table and the
//!   session → subscriber index and delivers events with per-subscriber
//!   isolation.
//! - [`ObserverTransport`] is the seam to whatever carries frames to a
//!   client (a WebSocket in the server, a channel in tests).
//! - [`wire`] holds the JSON envelopes exchanged with clients.
//! - [`start_heartbeat`] runs the idle sweep and keep-alive pings.

pub mod broadcaster;
pub mod heartbeat;
pub mod transport;
pub mod wire;

pub use broadcaster::{
    BroadcastError, BroadcasterConfig, BroadcasterStats, ConnectionId, ObserverConnection,
    ProgressBroadcaster, ANONYMOUS_CALLER,
};
pub use heartbeat::start_heartbeat;
pub use transport::{ChannelTransport, Frame, ObserverTransport, TransportError};
pub use wire::{ClientMessage, Notification, NotificationLevel, ServerMessage};
