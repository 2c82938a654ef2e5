//! Executor Repository
//!
//! Handles all database operations related to executors.

use async_trait::async_trait;
use remex_core::domain::executor::{Executor, ExecutorStatus, LOCAL_EXECUTOR_ID};
use remex_core::dto::executor::CreateExecutor;
use sqlx::PgPool;

use super::{ExecutorStore, StoreError};

const EXECUTOR_COLUMNS: &str =
    "e.id, e.name, e.description, e.type, e.parameters, e.state, e.status, e.log, e.cert_serial";

/// Postgres-backed executor store
#[derive(Clone)]
pub struct PgExecutorStore {
    pool: PgPool,
}

impl PgExecutorStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ExecutorStore for PgExecutorStore {
    async fn insert(&self, req: &CreateExecutor, status: ExecutorStatus) -> Result<Executor, StoreError> {
        let row = sqlx::query_as::<_, ExecutorRow>(&format!(
            r#"
            WITH e AS (
                INSERT INTO job_executors (name, description, type, parameters, status)
                VALUES ($1, $2, $3, $4, $5)
                RETURNING *
            )
            SELECT {EXECUTOR_COLUMNS} FROM e
            "#
        ))
        .bind(&req.name)
        .bind(&req.description)
        .bind(req.executor_type.as_str())
        .bind(&req.parameters)
        .bind(status.as_str())
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }

    async fn find(&self, id: i64) -> Result<Option<Executor>, StoreError> {
        let row = sqlx::query_as::<_, ExecutorRow>(&format!(
            "SELECT {EXECUTOR_COLUMNS} FROM job_executors e WHERE e.id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Executor::try_from).transpose()
    }

    async fn find_for_run(&self, run_id: i64) -> Result<Option<Executor>, StoreError> {
        let row = sqlx::query_as::<_, ExecutorRow>(&format!(
            r#"
            SELECT {EXECUTOR_COLUMNS}
            FROM job_runs r
            JOIN jobs j ON j.id = r.job_id
            JOIN job_executors e ON e.id = j.executor_id
            WHERE r.id = $1
            "#
        ))
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Executor::try_from).transpose()
    }

    async fn find_for_job(&self, job_id: i64) -> Result<Option<Executor>, StoreError> {
        let row = sqlx::query_as::<_, ExecutorRow>(&format!(
            r#"
            SELECT {EXECUTOR_COLUMNS}
            FROM jobs j
            JOIN job_executors e ON e.id = j.executor_id
            WHERE j.id = $1
            "#
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Executor::try_from).transpose()
    }

    async fn set_status(&self, id: i64, status: ExecutorStatus) -> Result<(), StoreError> {
        sqlx::query("UPDATE job_executors SET status = $1 WHERE id = $2")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_state(&self, id: i64, state: &serde_json::Value) -> Result<(), StoreError> {
        sqlx::query("UPDATE job_executors SET state = $1 WHERE id = $2")
            .bind(state)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_cert_serial(&self, id: i64, serial: Option<&str>) -> Result<(), StoreError> {
        sqlx::query("UPDATE job_executors SET cert_serial = $1 WHERE id = $2")
            .bind(serial)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn append_log(&self, id: i64, text: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE job_executors SET log = log || $1 WHERE id = $2")
            .bind(text)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn rebind_jobs_to_local(&self, id: i64) -> Result<u64, StoreError> {
        let result = sqlx::query("UPDATE jobs SET executor_id = $1 WHERE executor_id = $2")
            .bind(LOCAL_EXECUTOR_ID)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn delete(&self, id: i64) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE jobs SET executor_id = $1 WHERE executor_id = $2")
            .bind(LOCAL_EXECUTOR_ID)
            .bind(id)
            .execute(&mut *tx)
            .await?;

        let result = sqlx::query("DELETE FROM job_executors WHERE id = $1 AND id <> $2")
            .bind(id)
            .bind(LOCAL_EXECUTOR_ID)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct ExecutorRow {
    id: i64,
    name: String,
    description: Option<String>,
    #[sqlx(rename = "type")]
    executor_type: String,
    parameters: serde_json::Value,
    state: serde_json::Value,
    status: String,
    log: String,
    cert_serial: Option<String>,
}

impl TryFrom<ExecutorRow> for Executor {
    type Error = StoreError;

    fn try_from(row: ExecutorRow) -> Result<Self, Self::Error> {
        let executor_type = row
            .executor_type
            .parse()
            .map_err(|e| StoreError::Corrupt(format!("executor {}: {}", row.id, e)))?;
        let status = row
            .status
            .parse()
            .map_err(|e| StoreError::Corrupt(format!("executor {}: {}", row.id, e)))?;

        Ok(Executor {
            id: row.id,
            name: row.name,
            description: row.description,
            executor_type,
            status,
            parameters: row.parameters,
            state: row.state,
            log: row.log,
            cert_serial: row.cert_serial,
        })
    }
}
