//! Administration of the per-type global state

use remex_core::domain::executor::ExecutorType;
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;

use super::lease::{LeaseError, TypeLease};
use super::permissions::{
    Context, EXECUTOR_TYPE_RESOURCE, MANAGE_GLOBAL_STATE, PermissionDenied, PermissionEnforcer,
};
use crate::repository::{GlobalStateStore, StoreError, log_line};

#[derive(Debug, Error)]
pub enum GlobalTypeError {
    #[error(transparent)]
    Permission(#[from] PermissionDenied),

    #[error(transparent)]
    Lease(#[from] LeaseError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct GlobalTypeService {
    global: Arc<dyn GlobalStateStore>,
    permissions: Arc<dyn PermissionEnforcer>,
}

impl GlobalTypeService {
    pub fn new(global: Arc<dyn GlobalStateStore>, permissions: Arc<dyn PermissionEnforcer>) -> Self {
        Self { global, permissions }
    }

    /// Forget the shared state of a type. Only cloud pools keep any; the
    /// call is a no-op for the others. Returns whether anything was cleared.
    pub async fn clear_state(&self, ctx: &Context, executor_type: ExecutorType) -> Result<bool, GlobalTypeError> {
        self.permissions
            .enforce(ctx, EXECUTOR_TYPE_RESOURCE, None, MANAGE_GLOBAL_STATE)
            .await?;

        match executor_type {
            ExecutorType::OciBasic => {
                let lease = TypeLease::acquire(self.global.clone(), executor_type).await?;
                let result = async {
                    lease.store().set_state(executor_type, &json!({})).await?;
                    lease
                        .store()
                        .append_log(executor_type, &log_line("Global state cleared"))
                        .await
                }
                .await;
                lease.release().await?;
                result?;
                tracing::info!("Cleared global state of {}", executor_type);
                Ok(true)
            }
            ExecutorType::Local
            | ExecutorType::RemoteRunnerAgent
            | ExecutorType::RemotePool
            | ExecutorType::SlurmPool => Ok(false),
        }
    }

    pub async fn type_log(&self, ctx: &Context, executor_type: ExecutorType) -> Result<String, GlobalTypeError> {
        self.permissions
            .enforce(ctx, EXECUTOR_TYPE_RESOURCE, None, MANAGE_GLOBAL_STATE)
            .await?;
        Ok(self.global.log(executor_type).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::memory::MemoryStore;
    use crate::service::permissions::GrantedPermissions;

    fn service(store: &MemoryStore) -> GlobalTypeService {
        GlobalTypeService::new(Arc::new(store.clone()), Arc::new(GrantedPermissions))
    }

    #[tokio::test]
    async fn test_clear_cloud_state() {
        let store = MemoryStore::new();
        store
            .set_state(ExecutorType::OciBasic, &json!({ "ipsUsed": [{ "index": 1 }], "vcn": "vcn-1" }))
            .await
            .unwrap();

        assert!(service(&store).clear_state(&Context::admin(), ExecutorType::OciBasic).await.unwrap());

        assert_eq!(store.state(ExecutorType::OciBasic).await.unwrap(), json!({}));
        assert!(!store.is_locked(ExecutorType::OciBasic));
        let log = service(&store)
            .type_log(&Context::admin(), ExecutorType::OciBasic)
            .await
            .unwrap();
        assert!(log.contains("Global state cleared"));
    }

    #[tokio::test]
    async fn test_clear_is_noop_for_other_types() {
        let store = MemoryStore::new();
        assert!(!service(&store).clear_state(&Context::admin(), ExecutorType::SlurmPool).await.unwrap());
        assert_eq!(store.log(ExecutorType::SlurmPool).await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_clear_requires_permission() {
        let store = MemoryStore::new();
        let err = service(&store)
            .clear_state(&Context::user(4, Vec::new()), ExecutorType::OciBasic)
            .await
            .unwrap_err();
        assert!(matches!(err, GlobalTypeError::Permission(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_contended() {
        let store = MemoryStore::new();
        store.force_lock(ExecutorType::OciBasic);
        let err = service(&store)
            .clear_state(&Context::admin(), ExecutorType::OciBasic)
            .await
            .unwrap_err();
        assert!(matches!(err, GlobalTypeError::Lease(LeaseError::Contended(_))));
    }
}
