//! voxweave API server library.
//!
//! Exposes config, state, error handling, the router and the push-channel
//! endpoint so the binary and the integration tests share them.

pub mod config;
pub mod error;
pub mod router;
pub mod routes;
pub mod state;
pub mod ws;
