//! Pool Provisioning
//!
//! A pool is a set of peers on one private subnet. Every peer runs the
//! worker agent; the master additionally runs the proxy every request to the
//! pool goes through. Cloud pools create their peers and reserve a private
//! address range from the per-type allocator; SSH pools bootstrap machines
//! that already exist.

pub mod allocator;
pub mod bootstrap;
pub mod cloud;
pub mod ssh_pool;

use async_trait::async_trait;
use remex_core::domain::pool::PoolState;
use thiserror::Error;

use crate::repository::StoreError;
use crate::service::lease::LeaseError;
use crate::ssh::SshError;

pub use allocator::IpAllocator;
pub use bootstrap::PeerBootstrap;
pub use cloud::{CloudApi, CloudPool};
pub use ssh_pool::SshPool;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Dedicated IP address space depleted")]
    AddressSpaceDepleted,

    #[error("invalid pool parameters: {0}")]
    Parameters(String),

    #[error("cloud provider error: {0}")]
    Cloud(String),

    #[error("{0}")]
    Provisioning(String),

    #[error(transparent)]
    Lease(#[from] LeaseError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Ssh(#[from] SshError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Provisions and tears down the pools of one executor type
#[async_trait]
pub trait PoolBackend: Send + Sync {
    /// Provision the pool. Failures are reported in [`PoolState::error`]
    /// next to whatever was created before them.
    async fn create_pool(&self, executor_id: i64, params: &serde_json::Value) -> PoolState;

    async fn shutdown_pool(
        &self,
        executor_id: i64,
        params: &serde_json::Value,
        state: &PoolState,
    ) -> Result<(), PoolError>;

    /// Best-effort teardown; never fails and always gives back shared
    /// resources
    async fn kill_pool_forced(&self, executor_id: i64, params: &serde_json::Value, state: &PoolState);
}
