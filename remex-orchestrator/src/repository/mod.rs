//! Repository Module
//!
//! Data access layer for the orchestrator.
//!
//! All stores are trait-based so that services can be exercised against the
//! in-memory implementation in tests. Every status mutation of a single row
//! runs inside one database transaction; no application-level lock is used
//! except the per-type global lease.

pub mod executor;
pub mod global_state;
pub mod run;

#[cfg(test)]
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use remex_core::domain::executor::{Executor, ExecutorStatus, ExecutorType};
use remex_core::domain::run::{Run, RunStatus, StatusConflict};
use remex_core::dto::executor::CreateExecutor;
use thiserror::Error;

pub use executor::PgExecutorStore;
pub use global_state::PgGlobalStateStore;
pub use run::PgRunStore;

/// Storage failure
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Outcome of merging an incoming run status into the stored one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Written {
        previous: RunStatus,
        status: RunStatus,
    },
    Conflict(StatusConflict),
    NotFound,
}

impl MergeOutcome {
    /// True when this merge moved the run into a terminal status
    pub fn entered_terminal(&self) -> bool {
        matches!(self, MergeOutcome::Written { previous, status }
            if status.is_terminal() && !previous.is_terminal())
    }
}

#[async_trait]
pub trait ExecutorStore: Send + Sync {
    async fn insert(&self, req: &CreateExecutor, status: ExecutorStatus) -> Result<Executor, StoreError>;

    async fn find(&self, id: i64) -> Result<Option<Executor>, StoreError>;

    /// Executor owning the job the run belongs to
    async fn find_for_run(&self, run_id: i64) -> Result<Option<Executor>, StoreError>;

    async fn find_for_job(&self, job_id: i64) -> Result<Option<Executor>, StoreError>;

    async fn set_status(&self, id: i64, status: ExecutorStatus) -> Result<(), StoreError>;

    async fn set_state(&self, id: i64, state: &serde_json::Value) -> Result<(), StoreError>;

    async fn set_cert_serial(&self, id: i64, serial: Option<&str>) -> Result<(), StoreError>;

    async fn append_log(&self, id: i64, text: &str) -> Result<(), StoreError>;

    /// Point every job bound to the executor back at the local executor
    async fn rebind_jobs_to_local(&self, id: i64) -> Result<u64, StoreError>;

    async fn delete(&self, id: i64) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait RunStore: Send + Sync {
    async fn find(&self, run_id: i64) -> Result<Option<Run>, StoreError>;

    /// Runs in INITIALIZATION, QUEUED, SCHEDULED or RUNNING
    async fn list_unfinished(&self) -> Result<Vec<Run>, StoreError>;

    async fn list_unfinished_for_executor(&self, executor_id: i64) -> Result<Vec<Run>, StoreError>;

    /// Merge `incoming` into the stored status, appending output and
    /// recording the finish time, all in one row transaction
    async fn merge_status(
        &self,
        run_id: i64,
        incoming: RunStatus,
        append: Option<&str>,
        finished_at: Option<DateTime<Utc>>,
    ) -> Result<MergeOutcome, StoreError>;

    /// Overwrite status with a terminal remote result
    async fn apply_remote_result(
        &self,
        run_id: i64,
        status: RunStatus,
        append: Option<&str>,
        finished_at: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError>;

    /// Move a SCHEDULED run to `status`; any other stored status is kept
    async fn promote_scheduled(&self, run_id: i64, status: RunStatus) -> Result<bool, StoreError>;

    async fn append_output(&self, run_id: i64, text: &str) -> Result<(), StoreError>;

    /// Fail the run replacing its output with `message`
    async fn cancel(&self, run_id: i64, message: &str) -> Result<(), StoreError>;
}

#[async_trait]
pub trait GlobalStateStore: Send + Sync {
    /// Set the lock flag iff it is currently clear
    async fn try_lock(&self, executor_type: ExecutorType) -> Result<bool, StoreError>;

    async fn unlock(&self, executor_type: ExecutorType) -> Result<(), StoreError>;

    async fn unlock_all(&self) -> Result<u64, StoreError>;

    async fn state(&self, executor_type: ExecutorType) -> Result<serde_json::Value, StoreError>;

    async fn set_state(
        &self,
        executor_type: ExecutorType,
        state: &serde_json::Value,
    ) -> Result<(), StoreError>;

    async fn append_log(&self, executor_type: ExecutorType, text: &str) -> Result<(), StoreError>;

    async fn log(&self, executor_type: ExecutorType) -> Result<String, StoreError>;
}

/// Format a log line the way executor and type logs store them
pub fn log_line(message: &str) -> String {
    format!("[{}] {}\n", Utc::now().format("%Y-%m-%d %H:%M:%S"), message)
}
