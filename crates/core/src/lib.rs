//! Shared domain types for the voxweave synthesis orchestrator.
//!
//! This crate has zero internal dependencies so the store, engine,
//! broadcaster, and scheduler crates can all build on it.

pub mod error;
pub mod event_types;
pub mod plan;
pub mod progress;
pub mod scheduling;
pub mod types;
