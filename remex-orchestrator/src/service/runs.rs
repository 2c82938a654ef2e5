//! Remote runs: start, stop

use remex_core::domain::executor::{Executor, ExecutorStatus};
use remex_core::domain::run::RunStatus;
use remex_core::dto::agent::RunSpec;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;

use super::permissions::{Context, EXECUTOR_RESOURCE, MANAGE_RUNS, PermissionDenied, PermissionEnforcer};
use super::requests::JobRequestHandler;
use crate::dispatch::{Dispatch, DispatchError};
use crate::events::manager::{RunManager, RunManagerConfig};
use crate::events::RunEventBus;
use crate::repository::{ExecutorStore, MergeOutcome, RunStore, StoreError};

#[derive(Debug, Error)]
pub enum RunError {
    #[error("no executor owns job {0}")]
    UnknownJob(i64),

    #[error("no executor owns run {0}")]
    UnknownRun(i64),

    #[error("executor {id} is {status}, runs need a READY executor")]
    NotReady { id: i64, status: ExecutorStatus },

    #[error(transparent)]
    Permission(#[from] PermissionDenied),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct RunService {
    executors: Arc<dyn ExecutorStore>,
    runs: Arc<dyn RunStore>,
    dispatch: Arc<Dispatch>,
    bus: Arc<RunEventBus>,
    requests: Arc<dyn JobRequestHandler>,
    permissions: Arc<dyn PermissionEnforcer>,
    config: RunManagerConfig,
}

impl RunService {
    pub fn new(
        executors: Arc<dyn ExecutorStore>,
        runs: Arc<dyn RunStore>,
        dispatch: Arc<Dispatch>,
        bus: Arc<RunEventBus>,
        requests: Arc<dyn JobRequestHandler>,
        permissions: Arc<dyn PermissionEnforcer>,
        config: RunManagerConfig,
    ) -> Self {
        Self {
            executors,
            runs,
            dispatch,
            bus,
            requests,
            permissions,
            config,
        }
    }

    async fn authorize(&self, ctx: &Context, executor: &Executor) -> Result<(), RunError> {
        self.permissions
            .enforce(ctx, EXECUTOR_RESOURCE, Some(executor.id), MANAGE_RUNS)
            .await?;
        Ok(())
    }

    /// Start a run on the remote executor its job is bound to. The returned
    /// handle completes when the run's manager has seen the run finish.
    pub async fn start(
        &self,
        ctx: &Context,
        run_id: i64,
        job_id: i64,
        spec: &RunSpec,
    ) -> Result<JoinHandle<()>, RunError> {
        let executor = self
            .executors
            .find_for_job(job_id)
            .await?
            .ok_or(RunError::UnknownJob(job_id))?;
        self.authorize(ctx, &executor).await?;

        let handler = self.dispatch.handler(executor.executor_type)?;
        if executor.status != ExecutorStatus::Ready {
            return Err(RunError::NotReady {
                id: executor.id,
                status: executor.status,
            });
        }

        let manager = RunManager::new(
            run_id,
            job_id,
            self.runs.clone(),
            self.bus.clone(),
            self.requests.clone(),
            self.config.clone(),
        );
        let events = manager.start(spec.access_token.clone());

        if let Err(err) = handler.run(&executor, run_id, job_id, spec).await {
            tracing::error!("Cannot start run {} on executor {}: {}", run_id, executor.id, err);
            manager.on_run_fail(&err.to_string()).await;
            return Err(err.into());
        }

        let outcome = self
            .runs
            .merge_status(run_id, RunStatus::Scheduled, None, None)
            .await?;
        if let MergeOutcome::Conflict(conflict) = outcome {
            tracing::error!("Scheduling run {}: {}", run_id, conflict);
        }
        tracing::info!("Run {} of job {} sent to executor {}", run_id, job_id, executor.id);
        Ok(events)
    }

    /// Ask the owning executor to stop the run
    pub async fn stop(&self, ctx: &Context, run_id: i64) -> Result<(), RunError> {
        let executor = self
            .executors
            .find_for_run(run_id)
            .await?
            .ok_or(RunError::UnknownRun(run_id))?;
        self.authorize(ctx, &executor).await?;

        let outcome = self
            .dispatch
            .stop_run(self.runs.as_ref(), &executor, run_id)
            .await?;

        if let Some(outcome) = outcome {
            self.bus.settle(run_id, &outcome);
        }
        tracing::info!("Stop of run {} requested on executor {}", run_id, executor.id);
        Ok(())
    }
}
