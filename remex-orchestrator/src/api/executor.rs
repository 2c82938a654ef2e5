//! Executor API Handlers
//!
//! Administration of executors and of the per-type global state.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use remex_core::domain::executor::{Executor, ExecutorType};
use remex_core::dto::executor::CreateExecutor;
use serde::Deserialize;
use serde_json::{Value, json};

use super::AppState;
use crate::api::error::{ApiError, ApiResult};
use crate::service::permissions::Context;

#[derive(Debug, Default, Deserialize)]
pub struct RemoveQuery {
    #[serde(default)]
    pub forced: bool,
}

fn executor_type(raw: &str) -> ApiResult<ExecutorType> {
    raw.parse()
        .map_err(|_| ApiError::BadRequest(format!("unknown executor type {}", raw)))
}

/// POST /executors
/// Create an executor; initialization continues in the background
pub async fn create_executor(
    State(state): State<AppState>,
    ctx: Context,
    Json(req): Json<CreateExecutor>,
) -> ApiResult<(StatusCode, Json<Executor>)> {
    tracing::info!("Creating {} executor: {}", req.executor_type, req.name);

    let (executor, _initialization) = state.lifecycle.create(&ctx, req).await?;
    Ok((StatusCode::ACCEPTED, Json(executor)))
}

/// GET /executors/{id}
pub async fn get_executor(
    State(state): State<AppState>,
    ctx: Context,
    Path(id): Path<i64>,
) -> ApiResult<Json<Executor>> {
    tracing::debug!("Getting executor: {}", id);

    Ok(Json(state.lifecycle.get(&ctx, id).await?))
}

/// DELETE /executors/{id}?forced=true
pub async fn remove_executor(
    State(state): State<AppState>,
    ctx: Context,
    Path(id): Path<i64>,
    Query(query): Query<RemoveQuery>,
) -> ApiResult<StatusCode> {
    tracing::info!("Removing executor {} (forced: {})", id, query.forced);

    state.lifecycle.remove(&ctx, id, query.forced).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /executor-types/{type}/log
pub async fn get_type_log(
    State(state): State<AppState>,
    ctx: Context,
    Path(raw_type): Path<String>,
) -> ApiResult<String> {
    let executor_type = executor_type(&raw_type)?;
    Ok(state.global_types.type_log(&ctx, executor_type).await?)
}

/// POST /executor-types/{type}/clear
pub async fn clear_type_state(
    State(state): State<AppState>,
    ctx: Context,
    Path(raw_type): Path<String>,
) -> ApiResult<Json<Value>> {
    let executor_type = executor_type(&raw_type)?;
    let cleared = state.global_types.clear_state(&ctx, executor_type).await?;
    Ok(Json(json!({ "cleared": cleared })))
}
