//! Global Executor Type State Repository
//!
//! One row per executor type holding an opaque state blob, a lock flag and
//! an append-only log.

use async_trait::async_trait;
use remex_core::domain::executor::ExecutorType;
use sqlx::PgPool;

use super::{GlobalStateStore, StoreError};

/// Postgres-backed global type state
#[derive(Clone)]
pub struct PgGlobalStateStore {
    pool: PgPool,
}

impl PgGlobalStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl GlobalStateStore for PgGlobalStateStore {
    async fn try_lock(&self, executor_type: ExecutorType) -> Result<bool, StoreError> {
        // A single conditional update: only one caller can flip the flag
        let result = sqlx::query(
            "UPDATE global_executor_type_state SET locked = TRUE WHERE type = $1 AND locked = FALSE",
        )
        .bind(executor_type.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn unlock(&self, executor_type: ExecutorType) -> Result<(), StoreError> {
        sqlx::query("UPDATE global_executor_type_state SET locked = FALSE WHERE type = $1")
            .bind(executor_type.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn unlock_all(&self) -> Result<u64, StoreError> {
        let result =
            sqlx::query("UPDATE global_executor_type_state SET locked = FALSE WHERE locked = TRUE")
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    async fn state(&self, executor_type: ExecutorType) -> Result<serde_json::Value, StoreError> {
        let state: Option<serde_json::Value> =
            sqlx::query_scalar("SELECT state FROM global_executor_type_state WHERE type = $1")
                .bind(executor_type.as_str())
                .fetch_optional(&self.pool)
                .await?;

        Ok(state.unwrap_or_else(|| serde_json::json!({})))
    }

    async fn set_state(
        &self,
        executor_type: ExecutorType,
        state: &serde_json::Value,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE global_executor_type_state SET state = $1 WHERE type = $2")
            .bind(state)
            .bind(executor_type.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn append_log(&self, executor_type: ExecutorType, text: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE global_executor_type_state SET log = log || $1 WHERE type = $2")
            .bind(text)
            .bind(executor_type.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn log(&self, executor_type: ExecutorType) -> Result<String, StoreError> {
        let log: Option<String> =
            sqlx::query_scalar("SELECT log FROM global_executor_type_state WHERE type = $1")
                .bind(executor_type.as_str())
                .fetch_optional(&self.pool)
                .await?;

        Ok(log.unwrap_or_default())
    }
}
