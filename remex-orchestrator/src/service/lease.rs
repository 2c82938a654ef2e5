//! Per-type global lease
//!
//! The global state row of an executor type carries a lock flag. A lease is
//! taken by a conditional update that only succeeds on a clear flag, retried
//! a fixed number of times, and must be given back with [`TypeLease::release`].
//! A lease dropped without release (early return, panic) is released in the
//! background.

use remex_core::domain::executor::ExecutorType;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::repository::{GlobalStateStore, StoreError};

pub const LEASE_ATTEMPTS: u32 = 3;
pub const LEASE_BACKOFF: Duration = Duration::from_millis(200);

/// How long a release that must not be lost keeps waiting for the lease
pub const PERSISTENT_LEASE_DEADLINE: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum LeaseError {
    #[error("global state of {0} is locked by another operation")]
    Contended(ExecutorType),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct TypeLease {
    store: Arc<dyn GlobalStateStore>,
    executor_type: ExecutorType,
    released: bool,
}

impl TypeLease {
    pub async fn acquire(
        store: Arc<dyn GlobalStateStore>,
        executor_type: ExecutorType,
    ) -> Result<Self, LeaseError> {
        for attempt in 1..=LEASE_ATTEMPTS {
            if store.try_lock(executor_type).await? {
                tracing::debug!("Lease on {} acquired (attempt {})", executor_type, attempt);
                return Ok(Self {
                    store,
                    executor_type,
                    released: false,
                });
            }
            if attempt < LEASE_ATTEMPTS {
                tokio::time::sleep(LEASE_BACKOFF).await;
            }
        }

        tracing::warn!("Lease on {} not acquired after {} attempts", executor_type, LEASE_ATTEMPTS);
        Err(LeaseError::Contended(executor_type))
    }

    /// Keep retrying until the lease is taken or `deadline` has elapsed.
    /// Store failures are retried as well.
    pub async fn acquire_within(
        store: Arc<dyn GlobalStateStore>,
        executor_type: ExecutorType,
        deadline: Duration,
    ) -> Result<Self, LeaseError> {
        let started = tokio::time::Instant::now();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match store.try_lock(executor_type).await {
                Ok(true) => {
                    tracing::debug!("Lease on {} acquired (attempt {})", executor_type, attempt);
                    return Ok(Self {
                        store,
                        executor_type,
                        released: false,
                    });
                }
                Ok(false) => {
                    if started.elapsed() >= deadline {
                        tracing::warn!("Lease on {} not acquired within {:?}", executor_type, deadline);
                        return Err(LeaseError::Contended(executor_type));
                    }
                }
                Err(err) => {
                    if started.elapsed() >= deadline {
                        return Err(err.into());
                    }
                    tracing::warn!("Cannot take lease on {}: {}", executor_type, err);
                }
            }
            tokio::time::sleep(LEASE_BACKOFF).await;
        }
    }

    pub fn executor_type(&self) -> ExecutorType {
        self.executor_type
    }

    /// Store the lease guards
    pub fn store(&self) -> &dyn GlobalStateStore {
        self.store.as_ref()
    }

    pub async fn release(mut self) -> Result<(), StoreError> {
        self.released = true;
        self.store.unlock(self.executor_type).await
    }
}

impl Drop for TypeLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let store = self.store.clone();
        let executor_type = self.executor_type;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = store.unlock(executor_type).await {
                        tracing::error!("Cannot release lease on {}: {}", executor_type, err);
                    }
                });
            }
            Err(_) => tracing::error!("Lease on {} dropped outside a runtime", executor_type),
        }
    }
}
