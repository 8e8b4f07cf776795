//! Synthesis task scheduling.
//!
//! [`TaskScheduler`] owns the task lifecycle: it validates and stores
//! plans, drives windowed concurrent execution against the synthesis
//! engine, retries systemic outages under a budget, assembles the final
//! artifact in plan order, and reports every step to the
//! [`ProgressBroadcaster`](voxweave_events::ProgressBroadcaster).

pub mod config;
pub mod error;
pub mod merge;
pub mod scheduler;
pub mod window;

pub use config::SchedulerConfig;
pub use error::SchedulerError;
pub use scheduler::{TaskScheduler, TaskSummary};
