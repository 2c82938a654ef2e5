//! Run API Handlers

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use remex_core::dto::agent::RunSpec;

use super::AppState;
use crate::api::error::ApiResult;
use crate::service::permissions::Context;

/// POST /jobs/{job_id}/runs/{run_id}
/// Hand a run to the remote executor of its job
pub async fn start_run(
    State(state): State<AppState>,
    ctx: Context,
    Path((job_id, run_id)): Path<(i64, i64)>,
    Json(spec): Json<RunSpec>,
) -> ApiResult<StatusCode> {
    tracing::info!("Starting run {} of job {}", run_id, job_id);

    state.runs.start(&ctx, run_id, job_id, &spec).await?;
    Ok(StatusCode::ACCEPTED)
}

/// POST /runs/{id}/stop
pub async fn stop_run(
    State(state): State<AppState>,
    ctx: Context,
    Path(run_id): Path<i64>,
) -> ApiResult<StatusCode> {
    tracing::info!("Stopping run {}", run_id);

    state.runs.stop(&ctx, run_id).await?;
    Ok(StatusCode::ACCEPTED)
}
