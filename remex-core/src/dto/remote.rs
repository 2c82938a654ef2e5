//! Pushes received from remote executors

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::run::RemoteRunState;
use crate::dto::timestamp;

/// `POST /remote/status`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusPush {
    pub run_id: i64,
    pub status: RemoteStatus,
    pub output: Option<String>,
    pub errors: Option<String>,
}

impl StatusPush {
    /// Text to append to the run output (stdout followed by stderr)
    pub fn output_to_append(&self) -> Option<String> {
        let text = format!(
            "{}{}",
            self.output.as_deref().unwrap_or_default(),
            self.errors.as_deref().unwrap_or_default()
        );
        (!text.is_empty()).then_some(text)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteStatus {
    pub status: RemoteRunState,
    #[serde(default, deserialize_with = "timestamp::deserialize_opt")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// `POST /remote/emit`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmitPush {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

/// Kind of a job request pushed by a remote executor (numeric on the wire)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum RequestType {
    CreateSignals = 0,
    StoreState = 1,
}

impl TryFrom<u8> for RequestType {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(RequestType::CreateSignals),
            1 => Ok(RequestType::StoreState),
            other => Err(format!("invalid request type {}", other)),
        }
    }
}

impl From<RequestType> for u8 {
    fn from(value: RequestType) -> Self {
        value as u8
    }
}

/// `POST /remote/runRequest`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequestPush {
    #[serde(rename = "type")]
    pub request_type: RequestType,
    pub payload: RunRequestPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequestPayload {
    pub job_id: i64,
    /// Carries `state` for STORE_STATE
    #[serde(default)]
    pub request: Option<serde_json::Value>,
    /// Carries the sets to create for CREATE_SIG
    #[serde(default)]
    pub signal_sets: Option<serde_json::Value>,
    #[serde(default)]
    pub signals_spec: Option<serde_json::Value>,
}
