//! Identity & Status Channel
//!
//! Remote executors push run status, run events and job requests back over
//! mutual TLS. The proxy terminating TLS forwards the client certificate
//! serial in a header; a push is accepted only when that serial matches the
//! one stored on the executor owning the referenced run or job. The check is
//! repeated on every push.

use remex_core::domain::executor::Executor;
use remex_core::domain::run::StatusConflict;
use remex_core::dto::remote::{EmitPush, RequestType, RunRequestPush, StatusPush};
use serde_json::{Value, json};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::oneshot;

use super::requests::{JobRequestHandler, STATE_FIELD};
use crate::dispatch::Dispatch;
use crate::events::{
    ACCESS_TOKEN_REFRESH_EVENT, RunEvent, RunEventBus, RunEventKind, RunNotice, parse_event_type,
};
use crate::identity::{parse_serial_header, serials_match};
use crate::repository::{ExecutorStore, MergeOutcome, RunStore, StoreError};

#[derive(Debug, Error)]
pub enum StatusPushError {
    #[error("missing or malformed certificate serial")]
    MissingSerial,

    #[error("malformed push: {0}")]
    Malformed(String),

    #[error("no executor owns run {0}")]
    UnknownRun(i64),

    #[error("no executor owns job {0}")]
    UnknownJob(i64),

    #[error("certificate serial {presented} does not belong to executor {executor_id}")]
    IdentityMismatch { executor_id: i64, presented: String },

    #[error("run {run_id}: {conflict}")]
    Conflict { run_id: i64, conflict: StatusConflict },

    #[error("job request failed: {0}")]
    RequestFailed(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct RemotePushService {
    executors: Arc<dyn ExecutorStore>,
    runs: Arc<dyn RunStore>,
    dispatch: Arc<Dispatch>,
    bus: Arc<RunEventBus>,
    requests: Arc<dyn JobRequestHandler>,
}

fn presented_serial(header: Option<&str>) -> Result<String, StatusPushError> {
    header
        .and_then(parse_serial_header)
        .ok_or(StatusPushError::MissingSerial)
}

fn text_of(data: Option<Value>) -> String {
    match data {
        Some(Value::String(text)) => text,
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

impl RemotePushService {
    pub fn new(
        executors: Arc<dyn ExecutorStore>,
        runs: Arc<dyn RunStore>,
        dispatch: Arc<Dispatch>,
        bus: Arc<RunEventBus>,
        requests: Arc<dyn JobRequestHandler>,
    ) -> Self {
        Self {
            executors,
            runs,
            dispatch,
            bus,
            requests,
        }
    }

    fn authorize(&self, executor: &Executor, serial: &str) -> Result<(), StatusPushError> {
        let stored = executor.cert_serial.as_deref().unwrap_or_default();
        if serials_match(stored, serial) {
            return Ok(());
        }
        tracing::warn!(
            "Rejected push for executor {}: stored serial '{}', presented '{}'",
            executor.id,
            stored,
            serial
        );
        Err(StatusPushError::IdentityMismatch {
            executor_id: executor.id,
            presented: serial.to_string(),
        })
    }

    async fn run_owner(&self, run_id: i64, serial: &str) -> Result<Executor, StatusPushError> {
        let executor = self
            .executors
            .find_for_run(run_id)
            .await?
            .ok_or(StatusPushError::UnknownRun(run_id))?;
        self.authorize(&executor, serial)?;
        Ok(executor)
    }

    async fn job_owner(&self, job_id: i64, serial: &str) -> Result<Executor, StatusPushError> {
        let executor = self
            .executors
            .find_for_job(job_id)
            .await?
            .ok_or(StatusPushError::UnknownJob(job_id))?;
        self.authorize(&executor, serial)?;
        Ok(executor)
    }

    // =========================================================================
    // POST /remote/status
    // =========================================================================

    pub async fn push_status(
        &self,
        serial_header: Option<&str>,
        body: &Value,
    ) -> Result<MergeOutcome, StatusPushError> {
        let serial = presented_serial(serial_header)?;
        let run_id = body
            .get("runId")
            .and_then(Value::as_i64)
            .ok_or_else(|| StatusPushError::Malformed("runId not specified".to_string()))?;
        let executor = self.run_owner(run_id, &serial).await?;

        let push: StatusPush = serde_json::from_value(body.clone())
            .map_err(|e| StatusPushError::Malformed(e.to_string()))?;
        let incoming = push.status.status.to_run_status().ok_or_else(|| {
            StatusPushError::Malformed(format!("status {:?} is not accepted", push.status.status))
        })?;
        let output = push.output_to_append();

        let outcome = self
            .runs
            .merge_status(run_id, incoming, output.as_deref(), push.status.finished_at)
            .await?;

        match outcome {
            MergeOutcome::NotFound => Err(StatusPushError::UnknownRun(run_id)),
            MergeOutcome::Conflict(conflict) => {
                tracing::error!("Status clash on run {}: {}", run_id, conflict);
                Err(StatusPushError::Conflict { run_id, conflict })
            }
            MergeOutcome::Written { status, .. } => {
                if status.is_terminal() && status == incoming {
                    if self.bus.settle(run_id, &outcome) {
                        tracing::info!("Remote run {} finished: {}", run_id, status);
                    }
                    self.remove_remote_run(&executor, run_id).await;
                }
                Ok(outcome)
            }
        }
    }

    async fn remove_remote_run(&self, executor: &Executor, run_id: i64) {
        let result = match self.dispatch.handler(executor.executor_type) {
            Ok(handler) => handler.remove_run(executor, run_id).await,
            Err(err) => Err(err),
        };
        if let Err(err) = result {
            tracing::error!("Cannot remove run {} from executor {}: {}", run_id, executor.id, err);
        }
    }

    // =========================================================================
    // POST /remote/emit
    // =========================================================================

    pub async fn push_event(&self, serial_header: Option<&str>, body: &Value) -> Result<(), StatusPushError> {
        let serial = presented_serial(serial_header)?;
        let push: EmitPush = serde_json::from_value(body.clone())
            .map_err(|e| StatusPushError::Malformed(e.to_string()))?;

        if let Some((run_id, kind)) = parse_event_type(&push.event_type) {
            self.run_owner(run_id, &serial).await?;
            self.deliver(run_id, kind, push.data).await?;
            return Ok(());
        }

        if push.event_type == ACCESS_TOKEN_REFRESH_EVENT {
            let data = push.data.unwrap_or(Value::Null);
            let field = |name: &str| {
                StatusPushError::Malformed(format!("{} not specified", name))
            };
            let job_id = data.get("jobId").and_then(Value::as_i64).ok_or_else(|| field("jobId"))?;
            self.job_owner(job_id, &serial).await?;

            let run_id = data.get("runId").and_then(Value::as_i64).ok_or_else(|| field("runId"))?;
            let access_token = data
                .get("accessToken")
                .and_then(Value::as_str)
                .ok_or_else(|| field("accessToken"))?;
            self.bus.notify(RunNotice::TokenRefresh {
                run_id,
                job_id,
                access_token: access_token.to_string(),
            });
            return Ok(());
        }

        Err(StatusPushError::Malformed(format!(
            "unknown event type {}",
            push.event_type
        )))
    }

    async fn deliver(&self, run_id: i64, kind: RunEventKind, data: Option<Value>) -> Result<(), StatusPushError> {
        match kind {
            RunEventKind::Output => {
                let text = text_of(data);
                if !self.bus.publish(run_id, RunEvent::Output(text.clone())) {
                    self.runs.append_output(run_id, &text).await?;
                }
            }
            RunEventKind::Request => {
                // the answer has no way back over emit
                let (reply, _) = oneshot::channel();
                let payload = text_of(data);
                self.bus.publish(run_id, RunEvent::Request { payload, reply });
            }
            RunEventKind::Success => {
                let state = data.filter(|state| !state.is_null());
                self.bus.publish(run_id, RunEvent::Success { state });
            }
            RunEventKind::Fail => {
                let message = text_of(data);
                self.bus.publish(run_id, RunEvent::Fail { message });
            }
            RunEventKind::Init | RunEventKind::Stop => {
                tracing::debug!("Ignoring {} event of run {}", kind, run_id);
            }
        }
        Ok(())
    }

    // =========================================================================
    // POST /remote/runRequest
    // =========================================================================

    pub async fn push_request(&self, serial_header: Option<&str>, body: &Value) -> Result<Value, StatusPushError> {
        let serial = presented_serial(serial_header)?;
        let job_id = body
            .pointer("/payload/jobId")
            .and_then(Value::as_i64)
            .ok_or_else(|| StatusPushError::Malformed("jobId not specified".to_string()))?;
        self.job_owner(job_id, &serial).await?;

        let push: RunRequestPush = serde_json::from_value(body.clone())
            .map_err(|e| StatusPushError::Malformed(e.to_string()))?;
        let payload = push.payload;

        match push.request_type {
            RequestType::StoreState => {
                let state = payload
                    .request
                    .as_ref()
                    .and_then(|request| request.get(STATE_FIELD))
                    .filter(|state| !state.is_null())
                    .ok_or_else(|| {
                        StatusPushError::Malformed(format!("{} not specified", STATE_FIELD))
                    })?;
                self.requests
                    .store_state(job_id, state)
                    .await
                    .map_err(|e| StatusPushError::RequestFailed(e.to_string()))?;
                Ok(json!({}))
            }
            RequestType::CreateSignals => {
                let signal_sets = payload
                    .signal_sets
                    .as_ref()
                    .filter(|sets| !sets.is_null())
                    .ok_or_else(|| StatusPushError::Malformed("signalSets not specified".to_string()))?;
                self.requests
                    .create_signals(job_id, Some(signal_sets), payload.signals_spec.as_ref())
                    .await
                    .map_err(|e| StatusPushError::RequestFailed(e.to_string()))
            }
        }
    }
}
