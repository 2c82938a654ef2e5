use remex_core::domain::executor::{ExecutorStatus, ExecutorType, LOCAL_EXECUTOR_ID};
use sqlx::{PgPool, postgres::PgPoolOptions};
use std::time::Duration;

pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    // Create executors table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS job_executors (
            id BIGSERIAL PRIMARY KEY,
            name VARCHAR(255) NOT NULL,
            description TEXT,
            type VARCHAR(50) NOT NULL,
            parameters JSONB NOT NULL DEFAULT '{}',
            state JSONB NOT NULL DEFAULT 'null',
            status VARCHAR(50) NOT NULL,
            log TEXT NOT NULL DEFAULT '',
            cert_serial VARCHAR(255)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // The local executor always exists with id 1
    sqlx::query(
        r#"
        INSERT INTO job_executors (id, name, description, type, status)
        VALUES ($1, 'Local', 'Runs jobs on the orchestrator host', $2, $3)
        ON CONFLICT (id) DO NOTHING
        "#,
    )
    .bind(LOCAL_EXECUTOR_ID)
    .bind(ExecutorType::Local.as_str())
    .bind(ExecutorStatus::Ready.as_str())
    .execute(pool)
    .await?;

    sqlx::query(
        "SELECT setval(pg_get_serial_sequence('job_executors', 'id'), GREATEST((SELECT MAX(id) FROM job_executors), 1))",
    )
    .execute(pool)
    .await?;

    // Jobs are owned by the scheduler; only the executor binding lives here
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id BIGSERIAL PRIMARY KEY,
            executor_id BIGINT NOT NULL DEFAULT 1 REFERENCES job_executors(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create runs table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS job_runs (
            id BIGSERIAL PRIMARY KEY,
            job_id BIGINT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
            status VARCHAR(50) NOT NULL,
            output TEXT NOT NULL DEFAULT '',
            started_at TIMESTAMPTZ,
            finished_at TIMESTAMPTZ
        )
        "#,
    )
    .execute(pool)
    .await?;

    // One state row per executor type
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS global_executor_type_state (
            type VARCHAR(50) PRIMARY KEY,
            state JSONB NOT NULL DEFAULT '{}',
            locked BOOLEAN NOT NULL DEFAULT FALSE,
            log TEXT NOT NULL DEFAULT ''
        )
        "#,
    )
    .execute(pool)
    .await?;

    for executor_type in ExecutorType::ALL {
        sqlx::query(
            "INSERT INTO global_executor_type_state (type) VALUES ($1) ON CONFLICT (type) DO NOTHING",
        )
        .bind(executor_type.as_str())
        .execute(pool)
        .await?;
    }

    // Create indexes for better query performance
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_job_runs_status ON job_runs(status)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_job_runs_job_id ON job_runs(job_id)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_executor_id ON jobs(executor_id)")
        .execute(pool)
        .await?;

    tracing::info!("Database migrations completed successfully");
    Ok(())
}
