//! Executor Lifecycle
//!
//! Creation: PROVISIONING, then a per-type initializer that ends with exactly
//! one status update to READY or FAIL. Removal: PROVISIONING, stop the
//! executor's runs, tear down its resources, then delete the row and the
//! certificate. A failed graceful removal leaves the executor in FAIL with its
//! jobs rebound to the local executor; a forced removal always deletes.

use futures_util::future::join_all;
use remex_core::domain::executor::{
    AgentParams, Executor, ExecutorStatus, ExecutorType, LOCAL_EXECUTOR_ID, SlurmParams,
};
use remex_core::domain::pool::PoolState;
use remex_core::dto::executor::CreateExecutor;
use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;

use super::permissions::{
    CREATE_EXECUTOR, Context, DELETE_EXECUTOR, EXECUTOR_RESOURCE, PermissionDenied,
    PermissionEnforcer, VIEW_EXECUTOR,
};
use crate::dispatch::{Dispatch, DispatchError};
use crate::events::RunEventBus;
use crate::identity::{CertificateAuthority, IdentityError};
use crate::pool::{PoolBackend, PoolError};
use crate::repository::{ExecutorStore, RunStore, StoreError, log_line};
use crate::slurm::{SlurmBackend, SlurmError};

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("the local executor cannot be modified")]
    LocalImmutable,

    #[error("executor {0} not found")]
    NotFound(i64),

    #[error("{0}")]
    Invalid(String),

    #[error("removal of executor {id} failed: {message}")]
    RemovalFailed { id: i64, message: String },

    #[error(transparent)]
    Permission(#[from] PermissionDenied),

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Slurm(#[from] SlurmError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

fn invalid_parameters(err: serde_json::Error) -> LifecycleError {
    LifecycleError::Invalid(format!("invalid executor parameters: {}", err))
}

/// Pool state stored on the executor; nothing was provisioned when absent
fn stored_pool(executor: &Executor) -> PoolState {
    serde_json::from_value(executor.state.clone()).unwrap_or_default()
}

/// Backends that own per-type executor resources
pub struct Backends {
    pub slurm: Arc<SlurmBackend>,
    pub remote_pool: Arc<dyn PoolBackend>,
    /// Cloud pools. No provider ships with the binary: an integrator wraps
    /// their provider SDK in a [`crate::pool::CloudApi`] and passes a
    /// [`crate::pool::CloudPool`] built on it here. While this is `None`,
    /// every OCI_BASIC executor fails initialization with "cloud provider not
    /// configured".
    pub oci: Option<Arc<dyn PoolBackend>>,
}

pub struct ExecutorLifecycle {
    executors: Arc<dyn ExecutorStore>,
    runs: Arc<dyn RunStore>,
    certs: Arc<dyn CertificateAuthority>,
    dispatch: Arc<Dispatch>,
    bus: Arc<RunEventBus>,
    backends: Backends,
    permissions: Arc<dyn PermissionEnforcer>,
}

impl ExecutorLifecycle {
    pub fn new(
        executors: Arc<dyn ExecutorStore>,
        runs: Arc<dyn RunStore>,
        certs: Arc<dyn CertificateAuthority>,
        dispatch: Arc<Dispatch>,
        bus: Arc<RunEventBus>,
        backends: Backends,
        permissions: Arc<dyn PermissionEnforcer>,
    ) -> Self {
        Self {
            executors,
            runs,
            certs,
            dispatch,
            bus,
            backends,
            permissions,
        }
    }

    async fn log(&self, executor_id: i64, message: &str) {
        if let Err(err) = self.executors.append_log(executor_id, &log_line(message)).await {
            tracing::error!("Cannot append to log of executor {}: {}", executor_id, err);
        }
    }

    pub async fn get(&self, ctx: &Context, id: i64) -> Result<Executor, LifecycleError> {
        self.permissions
            .enforce(ctx, EXECUTOR_RESOURCE, Some(id), VIEW_EXECUTOR)
            .await?;
        self.executors
            .find(id)
            .await?
            .ok_or(LifecycleError::NotFound(id))
    }

    // =========================================================================
    // Creation
    // =========================================================================

    /// Insert the executor as PROVISIONING and initialize it in the
    /// background
    pub async fn create(
        self: &Arc<Self>,
        ctx: &Context,
        req: CreateExecutor,
    ) -> Result<(Executor, JoinHandle<ExecutorStatus>), LifecycleError> {
        self.permissions
            .enforce(ctx, EXECUTOR_RESOURCE, None, CREATE_EXECUTOR)
            .await?;
        if req.executor_type == ExecutorType::Local {
            return Err(LifecycleError::LocalImmutable);
        }
        if req.name.trim().is_empty() {
            return Err(LifecycleError::Invalid("executor name is required".to_string()));
        }

        let executor = self
            .executors
            .insert(&req, ExecutorStatus::Provisioning)
            .await?;
        tracing::info!(
            "Created executor {} ({}), initializing",
            executor.id,
            executor.executor_type
        );
        self.log(executor.id, &format!("Creating {} executor", executor.executor_type))
            .await;

        let this = Arc::clone(self);
        let pending = executor.clone();
        let task = tokio::spawn(async move { this.initialize(&pending).await });
        Ok((executor, task))
    }

    /// Run the type's initializer and record its outcome as the final
    /// status; initializer errors end in FAIL and the executor log
    pub async fn initialize(&self, executor: &Executor) -> ExecutorStatus {
        let status = match self.initialize_type(executor).await {
            Ok(()) => {
                self.log(executor.id, "Executor ready").await;
                ExecutorStatus::Ready
            }
            Err(err) => {
                tracing::error!("Initialization of executor {} failed: {}", executor.id, err);
                self.log(executor.id, &format!("Initialization failed: {}", err))
                    .await;
                ExecutorStatus::Fail
            }
        };

        if let Err(err) = self.executors.set_status(executor.id, status).await {
            tracing::error!("Cannot set status of executor {}: {}", executor.id, err);
        }
        status
    }

    async fn initialize_type(&self, executor: &Executor) -> Result<(), LifecycleError> {
        match executor.executor_type {
            ExecutorType::Local => Err(LifecycleError::LocalImmutable),
            ExecutorType::RemoteRunnerAgent => {
                let params: AgentParams = executor.params().map_err(invalid_parameters)?;
                self.issue_certificate(executor, &params.hostname).await
            }
            ExecutorType::RemotePool => {
                self.initialize_pool(executor, self.backends.remote_pool.as_ref())
                    .await
            }
            ExecutorType::OciBasic => match &self.backends.oci {
                Some(backend) => self.initialize_pool(executor, backend.as_ref()).await,
                None => Err(LifecycleError::Invalid(
                    "cloud provider not configured".to_string(),
                )),
            },
            ExecutorType::SlurmPool => {
                let params: SlurmParams = executor.params().map_err(invalid_parameters)?;
                self.issue_certificate(executor, &params.hostname).await?;
                let credentials = self.certs.credentials(executor.id).await?;
                self.log(executor.id, "Preparing executor directory on the login node")
                    .await;
                self.backends.slurm.setup(executor, &credentials).await?;
                Ok(())
            }
        }
    }

    async fn initialize_pool(
        &self,
        executor: &Executor,
        backend: &dyn PoolBackend,
    ) -> Result<(), LifecycleError> {
        self.log(executor.id, "Provisioning pool").await;
        let pool = backend.create_pool(executor.id, &executor.parameters).await;

        let state = serde_json::to_value(&pool).map_err(PoolError::from)?;
        self.executors.set_state(executor.id, &state).await?;

        if let Some(error) = pool.error {
            return Err(PoolError::Provisioning(error).into());
        }
        let master = pool.master_instance_ip.ok_or_else(|| {
            PoolError::Provisioning("pool has no master peer".to_string())
        })?;
        self.log(
            executor.id,
            &format!("Pool of {} peers ready, master {}", pool.pool_instance_ids.len(), master),
        )
        .await;
        self.issue_certificate(executor, &master).await
    }

    async fn issue_certificate(&self, executor: &Executor, host: &str) -> Result<(), LifecycleError> {
        let (ip, dns_name) = match host.parse::<IpAddr>() {
            Ok(_) => (Some(host), None),
            Err(_) => (None, Some(host)),
        };
        let serial = self.certs.issue(executor.id, ip, dns_name).await?;
        self.executors
            .set_cert_serial(executor.id, Some(&serial))
            .await?;
        self.log(executor.id, &format!("Certificate issued, serial {}", serial))
            .await;
        Ok(())
    }

    // =========================================================================
    // Removal
    // =========================================================================

    pub async fn remove(&self, ctx: &Context, id: i64, forced: bool) -> Result<(), LifecycleError> {
        self.permissions
            .enforce(ctx, EXECUTOR_RESOURCE, Some(id), DELETE_EXECUTOR)
            .await?;
        if id == LOCAL_EXECUTOR_ID {
            return Err(LifecycleError::LocalImmutable);
        }
        let executor = self
            .executors
            .find(id)
            .await?
            .ok_or(LifecycleError::NotFound(id))?;

        self.executors
            .set_status(id, ExecutorStatus::Provisioning)
            .await?;
        self.log(id, if forced { "Forced removal started" } else { "Removal started" })
            .await;

        if forced {
            self.remove_forced(&executor).await
        } else {
            self.remove_graceful(&executor).await
        }
    }

    async fn remove_graceful(&self, executor: &Executor) -> Result<(), LifecycleError> {
        let result = async {
            self.stop_runs(executor).await?;
            self.teardown(executor).await
        }
        .await;

        match result {
            Ok(()) => {
                self.certs.remove(executor.id).await;
                self.executors.delete(executor.id).await?;
                tracing::info!("Removed executor {}", executor.id);
                Ok(())
            }
            Err(err) => {
                let message = err.to_string();
                tracing::error!("Removal of executor {} failed: {}", executor.id, message);
                self.log(executor.id, &format!("Removal failed: {}", message))
                    .await;
                self.executors
                    .set_status(executor.id, ExecutorStatus::Fail)
                    .await?;
                let rebound = self.executors.rebind_jobs_to_local(executor.id).await?;
                if rebound > 0 {
                    self.log(
                        executor.id,
                        &format!("{} jobs moved to the local executor", rebound),
                    )
                    .await;
                }
                Err(LifecycleError::RemovalFailed {
                    id: executor.id,
                    message,
                })
            }
        }
    }

    async fn remove_forced(&self, executor: &Executor) -> Result<(), LifecycleError> {
        if let Err(err) = self.stop_runs(executor).await {
            tracing::warn!("Forced removal of executor {}: {}", executor.id, err);
        }
        if let Err(err) = self.teardown_forced(executor).await {
            tracing::warn!("Forced removal of executor {}: {}", executor.id, err);
        }
        self.certs.remove(executor.id).await;
        self.executors.delete(executor.id).await?;
        tracing::info!("Removed executor {} (forced)", executor.id);
        Ok(())
    }

    /// Stop every unfinished run of the executor, in parallel
    async fn stop_runs(&self, executor: &Executor) -> Result<(), LifecycleError> {
        let runs = self.runs.list_unfinished_for_executor(executor.id).await?;
        if runs.is_empty() {
            return Ok(());
        }
        self.log(executor.id, &format!("Stopping {} runs", runs.len()))
            .await;

        let results = join_all(runs.iter().map(|run| {
            self.dispatch
                .stop_run(self.runs.as_ref(), executor, run.id)
        }))
        .await;
        for (run, result) in runs.iter().zip(results) {
            if let Some(outcome) = result? {
                self.bus.settle(run.id, &outcome);
            }
        }
        Ok(())
    }

    async fn teardown(&self, executor: &Executor) -> Result<(), LifecycleError> {
        match executor.executor_type {
            ExecutorType::Local => Err(LifecycleError::LocalImmutable),
            ExecutorType::RemoteRunnerAgent => Ok(()),
            ExecutorType::RemotePool => {
                self.backends
                    .remote_pool
                    .shutdown_pool(executor.id, &executor.parameters, &stored_pool(executor))
                    .await?;
                Ok(())
            }
            ExecutorType::OciBasic => match &self.backends.oci {
                Some(backend) => {
                    backend
                        .shutdown_pool(executor.id, &executor.parameters, &stored_pool(executor))
                        .await?;
                    Ok(())
                }
                // nothing can have been provisioned
                None => Ok(()),
            },
            ExecutorType::SlurmPool => {
                self.backends.slurm.teardown(executor).await?;
                Ok(())
            }
        }
    }

    async fn teardown_forced(&self, executor: &Executor) -> Result<(), LifecycleError> {
        let pool = stored_pool(executor);
        match executor.executor_type {
            ExecutorType::RemotePool => {
                self.backends
                    .remote_pool
                    .kill_pool_forced(executor.id, &executor.parameters, &pool)
                    .await;
                Ok(())
            }
            ExecutorType::OciBasic => {
                if let Some(backend) = &self.backends.oci {
                    backend
                        .kill_pool_forced(executor.id, &executor.parameters, &pool)
                        .await;
                }
                Ok(())
            }
            _ => self.teardown(executor).await,
        }
    }
}
