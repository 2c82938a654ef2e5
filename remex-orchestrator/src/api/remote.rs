//! Remote Executor API Handlers
//!
//! Endpoints remote agents and SLURM scripts push to over mutual TLS. The
//! terminating proxy forwards the client certificate serial in
//! [`CERT_SERIAL_HEADER`]; everything else is checked by the service.

use axum::{
    Json,
    body::Bytes,
    extract::State,
    http::HeaderMap,
};
use serde_json::{Value, json};

use super::AppState;
use crate::api::error::PushResult;
use crate::identity::CERT_SERIAL_HEADER;

fn serial_header(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(CERT_SERIAL_HEADER)
        .and_then(|value| value.to_str().ok())
}

/// A body that is not JSON is treated like an empty one, so the serial is
/// still checked first
fn json_body(body: &Bytes) -> Value {
    serde_json::from_slice(body).unwrap_or(Value::Null)
}

/// POST /remote/status
pub async fn push_status(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> PushResult<Json<Value>> {
    let outcome = state
        .remote
        .push_status(serial_header(&headers), &json_body(&body))
        .await?;
    tracing::debug!("Status push merged: {:?}", outcome);
    Ok(Json(json!({})))
}

/// POST /remote/emit
pub async fn push_event(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> PushResult<Json<Value>> {
    state
        .remote
        .push_event(serial_header(&headers), &json_body(&body))
        .await?;
    Ok(Json(json!({})))
}

/// POST /remote/runRequest
pub async fn push_request(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> PushResult<Json<Value>> {
    let answer = state
        .remote
        .push_request(serial_header(&headers), &json_body(&body))
        .await?;
    Ok(Json(answer))
}
