//! Job requests
//!
//! Running jobs may ask the orchestrator to store their state blob or to
//! create signal sets. Requests arrive either as `request` run events (a
//! JSON string) or through `POST /remote/runRequest`.

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use std::time::Duration;
use thiserror::Error;

pub const STATE_FIELD: &str = "state";

const CREATE_SIGNALS: &str = "create_signals";
const STORE_STATE: &str = "store_state";

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("document store error: {0}")]
    Store(#[from] reqwest::Error),

    #[error("document store rejected request: {0}")]
    Rejected(String),

    #[error("signal creation is not available")]
    Unsupported,
}

/// Collaborators serving job requests (trait-based for mocking)
#[async_trait]
pub trait JobRequestHandler: Send + Sync {
    /// Create signal sets and signals owned by the job, returning the
    /// created index information
    async fn create_signals(
        &self,
        job_id: i64,
        signal_sets: Option<&Value>,
        signals_spec: Option<&Value>,
    ) -> Result<Value, RequestError>;

    /// Overwrite the job's stored state
    async fn store_state(&self, job_id: i64, state: &Value) -> Result<(), RequestError>;
}

/// Stores job state in the document store; signal creation is owned by
/// another service and is answered with an error
pub struct DocumentStoreRequests {
    client: reqwest::Client,
    base_url: String,
}

impl DocumentStoreRequests {
    pub fn new(base_url: &str) -> Result<Self, RequestError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl JobRequestHandler for DocumentStoreRequests {
    async fn create_signals(
        &self,
        _job_id: i64,
        _signal_sets: Option<&Value>,
        _signals_spec: Option<&Value>,
    ) -> Result<Value, RequestError> {
        Err(RequestError::Unsupported)
    }

    async fn store_state(&self, job_id: i64, state: &Value) -> Result<(), RequestError> {
        let url = format!("{}/jobs/_doc/{}", self.base_url, job_id);
        let response = self
            .client
            .put(&url)
            .json(&json!({ STATE_FIELD: state }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(RequestError::Rejected(format!("{}: {}", status, body)));
        }
        Ok(())
    }
}

fn error(mut response: Map<String, Value>, message: impl Into<String>) -> Value {
    response.insert("error".to_string(), Value::String(message.into()));
    Value::Object(response)
}

/// Answer a `request` run event
///
/// The answer always is an object; failures are reported in its `error`
/// field and the request `id`, if any, is echoed back.
pub async fn handle_request(handler: &dyn JobRequestHandler, job_id: i64, raw: &str) -> Value {
    let mut response = Map::new();

    if raw.trim().is_empty() {
        return error(response, "Request not specified");
    }

    let request: Value = match serde_json::from_str(raw) {
        Ok(request) => request,
        Err(err) => return error(response, format!("Request parsing failed: {}", err)),
    };

    if let Some(id) = request.get("id").filter(|id| !id.is_null()) {
        response.insert("id".to_string(), id.clone());
    }

    let Some(request_type) = request.get("type").and_then(Value::as_str) else {
        return error(response, "Type not specified");
    };

    match request_type {
        CREATE_SIGNALS => {
            let signal_sets = request.get("signalSets").filter(|v| !v.is_null());
            let signals = request.get("signals").filter(|v| !v.is_null());
            if signal_sets.is_none() && signals.is_none() {
                return error(response, "Either signalSets or signals have to be specified");
            }
            match handler.create_signals(job_id, signal_sets, signals).await {
                Ok(Value::Object(created)) => response.extend(created),
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!("Signal creation for job {} failed: {}", job_id, err);
                    return error(response, err.to_string());
                }
            }
        }
        STORE_STATE => {
            let Some(state) = request.get(STATE_FIELD).filter(|v| !v.is_null()) else {
                return error(response, format!("{} not specified", STATE_FIELD));
            };
            if let Err(err) = handler.store_state(job_id, state).await {
                tracing::error!("Storing state of job {} failed: {}", job_id, err);
                return error(response, err.to_string());
            }
        }
        other => return error(response, format!("Type {} not recognized", other)),
    }

    Value::Object(response)
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::sync::Mutex;

    /// Records stored states and answers signal creation with a fixed index
    #[derive(Default)]
    pub struct RecordingRequests {
        pub states: Mutex<Vec<(i64, Value)>>,
        pub fail: bool,
    }

    #[async_trait]
    impl JobRequestHandler for RecordingRequests {
        async fn create_signals(
            &self,
            _job_id: i64,
            _signal_sets: Option<&Value>,
            _signals_spec: Option<&Value>,
        ) -> Result<Value, RequestError> {
            if self.fail {
                return Err(RequestError::Unsupported);
            }
            Ok(json!({ "sigset": { "index": "signal_set_1" } }))
        }

        async fn store_state(&self, job_id: i64, state: &Value) -> Result<(), RequestError> {
            if self.fail {
                return Err(RequestError::Rejected("503".into()));
            }
            self.states.lock().unwrap().push((job_id, state.clone()));
            Ok(())
        }
    }
}
