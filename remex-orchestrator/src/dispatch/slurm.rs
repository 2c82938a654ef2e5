//! SLURM handler

use async_trait::async_trait;
use remex_core::domain::executor::Executor;
use remex_core::dto::agent::{RemoteRunStatus, RunSpec};
use std::sync::Arc;

use super::{DispatchError, ExecutorHandler};
use crate::slurm::SlurmBackend;

pub struct SlurmHandler {
    backend: Arc<SlurmBackend>,
}

impl SlurmHandler {
    pub fn new(backend: Arc<SlurmBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl ExecutorHandler for SlurmHandler {
    async fn run(
        &self,
        executor: &Executor,
        run_id: i64,
        job_id: i64,
        spec: &RunSpec,
    ) -> Result<(), DispatchError> {
        self.backend.run(executor, run_id, job_id, spec).await?;
        Ok(())
    }

    async fn stop(&self, executor: &Executor, run_id: i64) -> Result<(), DispatchError> {
        self.backend.stop(executor, run_id).await?;
        Ok(())
    }

    async fn status(
        &self,
        executor: &Executor,
        run_id: i64,
    ) -> Result<Option<RemoteRunStatus>, DispatchError> {
        Ok(self
            .backend
            .status(executor, run_id)
            .await
            .map(RemoteRunStatus::bare))
    }

    async fn remove_run(&self, executor: &Executor, run_id: i64) -> Result<(), DispatchError> {
        self.backend.remove_run(executor, run_id).await?;
        Ok(())
    }

    /// `scancel` kills the job before it can report anything
    fn acknowledges_stop(&self) -> bool {
        false
    }
}
