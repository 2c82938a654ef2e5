//! Core domain types
//!
//! These types represent the entities the orchestrator persists and the
//! values it exchanges with remote executors.

pub mod executor;
pub mod pool;
pub mod run;
pub mod task;
