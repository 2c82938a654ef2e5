//! Executor Dispatch
//!
//! Maps an executor type to the handler that runs, stops, polls and cleans
//! up its runs. Callers go through [`Dispatch`] and never branch on the type
//! themselves.

pub mod agent;
pub mod slurm;

#[cfg(test)]
pub mod fake;

use async_trait::async_trait;
use chrono::Utc;
use remex_core::domain::executor::{Executor, ExecutorType};
use remex_core::domain::run::RunStatus;
use remex_core::dto::agent::{RemoteRunStatus, RunSpec};
use remex_client::ClientError;
use std::sync::Arc;
use thiserror::Error;

use crate::repository::{MergeOutcome, RunStore, StoreError};
use crate::slurm::SlurmError;

pub use agent::AgentHandler;
pub use slurm::SlurmHandler;

/// Output recorded when a stop is not confirmed by the executor
pub const STOPPED_MESSAGE: &str = "Run stopped";

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("executor type {0} is not run remotely")]
    NotRemote(ExecutorType),

    #[error("invalid executor configuration: {0}")]
    Configuration(String),

    #[error("cannot read task archive: {0}")]
    Archive(#[from] std::io::Error),

    #[error(transparent)]
    Agent(#[from] ClientError),

    #[error(transparent)]
    Slurm(#[from] SlurmError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What every remote executor type can do with a run
#[async_trait]
pub trait ExecutorHandler: Send + Sync {
    async fn run(
        &self,
        executor: &Executor,
        run_id: i64,
        job_id: i64,
        spec: &RunSpec,
    ) -> Result<(), DispatchError>;

    async fn stop(&self, executor: &Executor, run_id: i64) -> Result<(), DispatchError>;

    /// Remote view of the run, `None` when the executor cannot tell
    async fn status(
        &self,
        executor: &Executor,
        run_id: i64,
    ) -> Result<Option<RemoteRunStatus>, DispatchError>;

    /// Delete remote artifacts of the run; idempotent
    async fn remove_run(&self, executor: &Executor, run_id: i64) -> Result<(), DispatchError>;

    /// Whether the executor reports the final status of a stopped run
    fn acknowledges_stop(&self) -> bool {
        true
    }
}

pub struct Dispatch {
    agent: Arc<dyn ExecutorHandler>,
    slurm: Arc<dyn ExecutorHandler>,
}

impl Dispatch {
    pub fn new(agent: Arc<dyn ExecutorHandler>, slurm: Arc<dyn ExecutorHandler>) -> Self {
        Self { agent, slurm }
    }

    pub fn handler(&self, executor_type: ExecutorType) -> Result<&dyn ExecutorHandler, DispatchError> {
        match executor_type {
            ExecutorType::Local => Err(DispatchError::NotRemote(executor_type)),
            ExecutorType::RemoteRunnerAgent | ExecutorType::RemotePool | ExecutorType::OciBasic => {
                Ok(self.agent.as_ref())
            }
            ExecutorType::SlurmPool => Ok(self.slurm.as_ref()),
        }
    }

    /// Request a stop; when the executor will not confirm it the run is
    /// failed locally right away
    pub async fn stop_run(
        &self,
        runs: &dyn RunStore,
        executor: &Executor,
        run_id: i64,
    ) -> Result<Option<MergeOutcome>, DispatchError> {
        let handler = self.handler(executor.executor_type)?;
        handler.stop(executor, run_id).await?;

        if handler.acknowledges_stop() {
            return Ok(None);
        }

        let outcome = runs
            .merge_status(run_id, RunStatus::Failed, Some(STOPPED_MESSAGE), Some(Utc::now()))
            .await?;
        if let MergeOutcome::Conflict(conflict) = outcome {
            tracing::error!("Stopping run {}: {}", run_id, conflict);
        }
        Ok(Some(outcome))
    }
}
