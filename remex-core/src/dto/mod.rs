//! Data Transfer Objects
//!
//! Bodies exchanged with remote agents (outbound) and pushed by remote
//! executors to the status channel (inbound).

pub mod agent;
pub mod executor;
pub mod remote;
pub mod timestamp;
