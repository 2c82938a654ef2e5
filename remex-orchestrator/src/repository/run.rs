//! Run Repository
//!
//! Handles all database operations related to runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use remex_core::domain::run::{Run, RunStatus};
use sqlx::PgPool;

use super::{MergeOutcome, RunStore, StoreError};

/// Postgres-backed run store
#[derive(Clone)]
pub struct PgRunStore {
    pool: PgPool,
}

impl PgRunStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn unfinished_statuses() -> Vec<String> {
    RunStatus::UNFINISHED
        .iter()
        .map(|s| s.as_str().to_string())
        .collect()
}

#[async_trait]
impl RunStore for PgRunStore {
    async fn find(&self, run_id: i64) -> Result<Option<Run>, StoreError> {
        let row = sqlx::query_as::<_, RunRow>(
            r#"
            SELECT id, job_id, status, output, started_at, finished_at
            FROM job_runs
            WHERE id = $1
            "#,
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Run::try_from).transpose()
    }

    async fn list_unfinished(&self) -> Result<Vec<Run>, StoreError> {
        let rows = sqlx::query_as::<_, RunRow>(
            r#"
            SELECT id, job_id, status, output, started_at, finished_at
            FROM job_runs
            WHERE status = ANY($1)
            ORDER BY id
            "#,
        )
        .bind(unfinished_statuses())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Run::try_from).collect()
    }

    async fn list_unfinished_for_executor(&self, executor_id: i64) -> Result<Vec<Run>, StoreError> {
        let rows = sqlx::query_as::<_, RunRow>(
            r#"
            SELECT r.id, r.job_id, r.status, r.output, r.started_at, r.finished_at
            FROM job_runs r
            JOIN jobs j ON j.id = r.job_id
            WHERE j.executor_id = $1 AND r.status = ANY($2)
            ORDER BY r.id
            "#,
        )
        .bind(executor_id)
        .bind(unfinished_statuses())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Run::try_from).collect()
    }

    async fn merge_status(
        &self,
        run_id: i64,
        incoming: RunStatus,
        append: Option<&str>,
        finished_at: Option<DateTime<Utc>>,
    ) -> Result<MergeOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        let current: Option<String> =
            sqlx::query_scalar("SELECT status FROM job_runs WHERE id = $1 FOR UPDATE")
                .bind(run_id)
                .fetch_optional(&mut *tx)
                .await?;

        let Some(current) = current else {
            return Ok(MergeOutcome::NotFound);
        };
        let current = parse_status(run_id, &current)?;

        let merged = match RunStatus::merge(current, incoming) {
            Ok(status) => status,
            // dropping the transaction rolls it back; the row stays untouched
            Err(conflict) => return Ok(MergeOutcome::Conflict(conflict)),
        };

        sqlx::query(
            r#"
            UPDATE job_runs
            SET status = $1,
                output = CASE WHEN $2::TEXT IS NULL THEN output ELSE output || E'\n' || $2 END,
                finished_at = COALESCE($3, finished_at)
            WHERE id = $4
            "#,
        )
        .bind(merged.as_str())
        .bind(append)
        .bind(finished_at)
        .bind(run_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(MergeOutcome::Written {
            previous: current,
            status: merged,
        })
    }

    async fn apply_remote_result(
        &self,
        run_id: i64,
        status: RunStatus,
        append: Option<&str>,
        finished_at: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE job_runs
            SET status = $1,
                output = CASE WHEN $2::TEXT IS NULL THEN output ELSE output || E'\n' || $2 END,
                finished_at = COALESCE($3, finished_at)
            WHERE id = $4
            "#,
        )
        .bind(status.as_str())
        .bind(append)
        .bind(finished_at)
        .bind(run_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn promote_scheduled(&self, run_id: i64, status: RunStatus) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE job_runs SET status = $1 WHERE id = $2 AND status = $3")
            .bind(status.as_str())
            .bind(run_id)
            .bind(RunStatus::Scheduled.as_str())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn append_output(&self, run_id: i64, text: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE job_runs SET output = output || $1 WHERE id = $2")
            .bind(text)
            .bind(run_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn cancel(&self, run_id: i64, message: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE job_runs SET status = $1, output = $2 WHERE id = $3")
            .bind(RunStatus::Failed.as_str())
            .bind(message)
            .bind(run_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn parse_status(run_id: i64, raw: &str) -> Result<RunStatus, StoreError> {
    raw.parse()
        .map_err(|e| StoreError::Corrupt(format!("run {}: {}", run_id, e)))
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct RunRow {
    id: i64,
    job_id: i64,
    status: String,
    output: String,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl TryFrom<RunRow> for Run {
    type Error = StoreError;

    fn try_from(row: RunRow) -> Result<Self, Self::Error> {
        Ok(Run {
            id: row.id,
            job_id: row.job_id,
            status: parse_status(row.id, &row.status)?,
            output: row.output,
            started_at: row.started_at,
            finished_at: row.finished_at,
        })
    }
}
