//! Task and segment records plus the [`JobStore`] seam the scheduler persists through.
//!
//! The durable record store is an external collaborator; this crate defines
//! the narrow interface it must satisfy and ships [`MemoryJobStore`], an
//! in-process implementation used by the server binary and the test suites.

pub mod memory;
pub mod models;
pub mod store;

pub use memory::MemoryJobStore;
pub use store::{JobStore, StoreError, StoreResult};
