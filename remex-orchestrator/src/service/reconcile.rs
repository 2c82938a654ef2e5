//! Startup reconciliation of unfinished runs

use chrono::Utc;
use remex_core::domain::run::{RemoteRunState, Run, RunStatus};
use std::sync::Arc;

use crate::dispatch::Dispatch;
use crate::repository::{ExecutorStore, RunStore, StoreError};

pub const CANCELLED_UPON_START: &str = "Cancelled upon start";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    pub cancelled: usize,
    pub finished: usize,
    pub promoted: usize,
    pub untouched: usize,
}

enum Outcome {
    Cancelled,
    Finished,
    Promoted,
    Untouched,
}

pub struct Reconciler {
    executors: Arc<dyn ExecutorStore>,
    runs: Arc<dyn RunStore>,
    dispatch: Arc<Dispatch>,
}

impl Reconciler {
    pub fn new(executors: Arc<dyn ExecutorStore>, runs: Arc<dyn RunStore>, dispatch: Arc<Dispatch>) -> Self {
        Self {
            executors,
            runs,
            dispatch,
        }
    }

    /// Bring every unfinished run in line with what its executor reports
    pub async fn reconcile(&self) -> Result<ReconcileReport, StoreError> {
        let mut report = ReconcileReport::default();

        for run in self.runs.list_unfinished().await? {
            match self.reconcile_run(&run).await? {
                Outcome::Cancelled => report.cancelled += 1,
                Outcome::Finished => report.finished += 1,
                Outcome::Promoted => report.promoted += 1,
                Outcome::Untouched => report.untouched += 1,
            }
        }

        tracing::info!(
            "Reconciled runs: {} cancelled, {} finished, {} promoted, {} untouched",
            report.cancelled,
            report.finished,
            report.promoted,
            report.untouched
        );
        Ok(report)
    }

    async fn reconcile_run(&self, run: &Run) -> Result<Outcome, StoreError> {
        let executor = self.executors.find_for_run(run.id).await?;

        let executor = match executor {
            Some(executor) if !executor.is_local() && run.status != RunStatus::Initialization => executor,
            _ => {
                self.runs.cancel(run.id, CANCELLED_UPON_START).await?;
                return Ok(Outcome::Cancelled);
            }
        };

        let handler = match self.dispatch.handler(executor.executor_type) {
            Ok(handler) => handler,
            Err(err) => {
                tracing::warn!("Run {}: {}", run.id, err);
                return Ok(Outcome::Untouched);
            }
        };

        let remote = match handler.status(&executor, run.id).await {
            Ok(Some(remote)) => remote,
            Ok(None) => {
                tracing::debug!("Executor {} has no status for run {}", executor.id, run.id);
                return Ok(Outcome::Untouched);
            }
            Err(err) => {
                tracing::warn!("Cannot get status of run {} from executor {}: {}", run.id, executor.id, err);
                return Ok(Outcome::Untouched);
            }
        };

        let status = match remote.status {
            RemoteRunState::Success => RunStatus::Success,
            RemoteRunState::RunFail | RemoteRunState::BuildFail => RunStatus::Failed,
            RemoteRunState::Running => RunStatus::Running,
            RemoteRunState::Queued => RunStatus::Scheduled,
        };

        if !status.is_terminal() {
            let promoted = self.runs.promote_scheduled(run.id, status).await?;
            return Ok(if promoted { Outcome::Promoted } else { Outcome::Untouched });
        }

        let output = remote.output_to_append();
        let finished_at = remote.finished_at.unwrap_or_else(Utc::now);
        self.runs
            .apply_remote_result(run.id, status, output.as_deref(), Some(finished_at))
            .await?;
        if let Err(err) = handler.remove_run(&executor, run.id).await {
            tracing::warn!("Cannot remove run {} from executor {}: {}", run.id, executor.id, err);
        }
        Ok(Outcome::Finished)
    }
}
