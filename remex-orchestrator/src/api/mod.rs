//! API Module
//!
//! HTTP API layer for the orchestrator.
//! Each submodule handles endpoints for a specific domain.

pub mod context;
pub mod error;
pub mod executor;
pub mod health;
pub mod remote;
pub mod run;

use axum::{
    Router,
    routing::{delete, get, post},
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::service::{ExecutorLifecycle, GlobalTypeService, RemotePushService, RunService};

/// Services shared by every handler
#[derive(Clone)]
pub struct AppState {
    pub remote: Arc<RemotePushService>,
    pub lifecycle: Arc<ExecutorLifecycle>,
    pub global_types: Arc<GlobalTypeService>,
    pub runs: Arc<RunService>,
}

/// Create the main API router with all endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health::health_check))
        // Pushes from remote executors
        .route("/remote/status", post(remote::push_status))
        .route("/remote/emit", post(remote::push_event))
        .route("/remote/runRequest", post(remote::push_request))
        // Executor endpoints
        .route("/executors", post(executor::create_executor))
        .route("/executors/{id}", get(executor::get_executor))
        .route("/executors/{id}", delete(executor::remove_executor))
        .route("/executor-types/{type}/log", get(executor::get_type_log))
        .route("/executor-types/{type}/clear", post(executor::clear_type_state))
        // Run endpoints
        .route("/jobs/{job_id}/runs/{run_id}", post(run::start_run))
        .route("/runs/{id}/stop", post(run::stop_run))
        // Add state and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
