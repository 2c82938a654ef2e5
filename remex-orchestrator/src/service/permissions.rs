//! Permission checks
//!
//! Authentication happens upstream; requests reach the orchestrator with the
//! caller's identity and granted operations already resolved into a
//! [`Context`].

use async_trait::async_trait;
use std::collections::HashSet;
use thiserror::Error;

pub const EXECUTOR_RESOURCE: &str = "jobExecutor";
pub const EXECUTOR_TYPE_RESOURCE: &str = "jobExecutorType";

pub const CREATE_EXECUTOR: &str = "createExecutor";
pub const VIEW_EXECUTOR: &str = "view";
pub const DELETE_EXECUTOR: &str = "delete";
pub const MANAGE_GLOBAL_STATE: &str = "manageGlobalExecState";
pub const MANAGE_RUNS: &str = "manageRuns";

#[derive(Debug, Error)]
#[error("permission denied: {operation} on {resource_type}{}", .resource_id.map(|id| format!(" {}", id)).unwrap_or_default())]
pub struct PermissionDenied {
    pub resource_type: String,
    pub resource_id: Option<i64>,
    pub operation: String,
}

/// Caller of an operation
#[derive(Debug, Clone, Default)]
pub struct Context {
    pub user_id: Option<i64>,
    pub admin: bool,
    /// Granted `resourceType:operation` pairs
    pub granted: HashSet<String>,
}

impl Context {
    pub fn admin() -> Self {
        Self {
            user_id: None,
            admin: true,
            granted: HashSet::new(),
        }
    }

    pub fn user(user_id: i64, granted: impl IntoIterator<Item = String>) -> Self {
        Self {
            user_id: Some(user_id),
            admin: false,
            granted: granted.into_iter().collect(),
        }
    }

    pub fn has(&self, resource_type: &str, operation: &str) -> bool {
        self.admin || self.granted.contains(&format!("{}:{}", resource_type, operation))
    }
}

#[async_trait]
pub trait PermissionEnforcer: Send + Sync {
    async fn enforce(
        &self,
        context: &Context,
        resource_type: &str,
        resource_id: Option<i64>,
        operation: &str,
    ) -> Result<(), PermissionDenied>;
}

/// Decides from the operations granted in the context
pub struct GrantedPermissions;

#[async_trait]
impl PermissionEnforcer for GrantedPermissions {
    async fn enforce(
        &self,
        context: &Context,
        resource_type: &str,
        resource_id: Option<i64>,
        operation: &str,
    ) -> Result<(), PermissionDenied> {
        if context.has(resource_type, operation) {
            return Ok(());
        }
        tracing::warn!(
            "User {:?} denied {} on {} {:?}",
            context.user_id,
            operation,
            resource_type,
            resource_id
        );
        Err(PermissionDenied {
            resource_type: resource_type.to_string(),
            resource_id,
            operation: operation.to_string(),
        })
    }
}
