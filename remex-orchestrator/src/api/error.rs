//! API Error Handling
//!
//! Admin endpoints answer `{"error": message}`. Pushes from remote executors
//! only ever get an empty object next to the status code.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;

use crate::dispatch::DispatchError;
use crate::service::global_type::GlobalTypeError;
use crate::service::lease::LeaseError;
use crate::service::lifecycle::LifecycleError;
use crate::service::remote::StatusPushError;
use crate::service::runs::RunError;

/// API error type
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    Conflict(String),
    InternalError(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::InternalError(msg) => {
                tracing::error!("Internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<LifecycleError> for ApiError {
    fn from(err: LifecycleError) -> Self {
        match err {
            LifecycleError::NotFound(_) => ApiError::NotFound(err.to_string()),
            LifecycleError::LocalImmutable | LifecycleError::Invalid(_) => {
                ApiError::BadRequest(err.to_string())
            }
            LifecycleError::Permission(_) => ApiError::Forbidden(err.to_string()),
            _ => ApiError::InternalError(err.to_string()),
        }
    }
}

impl From<RunError> for ApiError {
    fn from(err: RunError) -> Self {
        match err {
            RunError::UnknownJob(_) | RunError::UnknownRun(_) => ApiError::NotFound(err.to_string()),
            RunError::NotReady { .. } => ApiError::Conflict(err.to_string()),
            RunError::Permission(_) => ApiError::Forbidden(err.to_string()),
            RunError::Dispatch(DispatchError::NotRemote(_)) => ApiError::BadRequest(err.to_string()),
            _ => ApiError::InternalError(err.to_string()),
        }
    }
}

impl From<GlobalTypeError> for ApiError {
    fn from(err: GlobalTypeError) -> Self {
        match err {
            GlobalTypeError::Permission(_) => ApiError::Forbidden(err.to_string()),
            GlobalTypeError::Lease(LeaseError::Contended(_)) => ApiError::Conflict(err.to_string()),
            _ => ApiError::InternalError(err.to_string()),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Rejection of a push from a remote executor
#[derive(Debug)]
pub struct PushError(pub StatusPushError);

impl From<StatusPushError> for PushError {
    fn from(err: StatusPushError) -> Self {
        PushError(err)
    }
}

impl IntoResponse for PushError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            StatusPushError::MissingSerial
            | StatusPushError::Malformed(_)
            | StatusPushError::UnknownRun(_)
            | StatusPushError::UnknownJob(_) => {
                tracing::warn!("Rejected push: {}", self.0);
                StatusCode::BAD_REQUEST
            }
            StatusPushError::IdentityMismatch { .. } => StatusCode::FORBIDDEN,
            StatusPushError::Conflict { .. }
            | StatusPushError::RequestFailed(_)
            | StatusPushError::Store(_) => {
                tracing::error!("Push failed: {}", self.0);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        (status, Json(json!({}))).into_response()
    }
}

pub type PushResult<T> = Result<T, PushError>;
