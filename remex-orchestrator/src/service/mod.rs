//! Service Module
//!
//! Business logic layer for the orchestrator.
//! Services orchestrate between stores, backends and the run event bus.

pub mod global_type;
pub mod lease;
pub mod lifecycle;
pub mod permissions;
pub mod reconcile;
pub mod remote;
pub mod requests;
pub mod runs;

pub use global_type::GlobalTypeService;
pub use lifecycle::ExecutorLifecycle;
pub use reconcile::Reconciler;
pub use remote::RemotePushService;
pub use runs::RunService;
