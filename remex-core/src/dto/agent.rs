//! Remote agent DTOs
//!
//! Bodies sent to (and received from) a remote run agent over HTTPS.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::run::RemoteRunState;
use crate::domain::task::{PythonSubtype, TaskInfo, TaskType};
use crate::dto::timestamp;

/// Everything a backend needs to start one run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSpec {
    pub task: TaskInfo,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default)]
    pub entities: serde_json::Value,
    #[serde(default)]
    pub owned: serde_json::Value,
    pub access_token: Option<String>,
    #[serde(default)]
    pub state: serde_json::Value,
}

/// Packed task code in the buffer layout the agent expects
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeArchive {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Vec<u8>,
}

impl CodeArchive {
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self {
            kind: "Buffer".to_string(),
            data,
        }
    }
}

/// `POST /run/{runId}`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRunRequest {
    pub params: serde_json::Value,
    pub entities: serde_json::Value,
    pub owned: serde_json::Value,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub subtype: PythonSubtype,
    pub code_archive: CodeArchive,
    pub access_token: Option<String>,
    pub state: serde_json::Value,
    pub job_id: i64,
    pub run_id: i64,
    pub task_id: i64,
}

impl AgentRunRequest {
    pub fn new(run_id: i64, job_id: i64, spec: &RunSpec, archive: Vec<u8>) -> Self {
        let params = if spec.params.is_null() {
            serde_json::json!({})
        } else {
            spec.params.clone()
        };
        Self {
            params,
            entities: spec.entities.clone(),
            owned: spec.owned.clone(),
            task_type: spec.task.task_type,
            subtype: spec.task.subtype,
            code_archive: CodeArchive::from_bytes(archive),
            access_token: spec.access_token.clone(),
            state: spec.state.clone(),
            job_id,
            run_id,
            task_id: spec.task.task_id,
        }
    }
}

/// `GET /run/{runId}` and the status returned by every backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteRunStatus {
    pub status: RemoteRunState,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default, deserialize_with = "timestamp::deserialize_opt")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl RemoteRunStatus {
    pub fn bare(status: RemoteRunState) -> Self {
        Self {
            status,
            output: None,
            error: None,
            finished_at: None,
        }
    }

    pub fn output_to_append(&self) -> Option<String> {
        let text = format!(
            "{}{}",
            self.output.as_deref().unwrap_or_default(),
            self.error.as_deref().unwrap_or_default()
        );
        (!text.is_empty()).then_some(text)
    }
}
