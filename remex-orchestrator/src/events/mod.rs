//! Run Event Bus
//!
//! Each active run owns one channel, created when the run starts and torn
//! down when it finishes; producers address it by run id. Consumers that
//! want to follow runs (UI streams, schedulers) subscribe to the broadcast
//! of [`RunNotice`]s instead.

pub mod manager;

use remex_core::domain::run::RunStatus;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::{broadcast, mpsc, oneshot};

pub use manager::{RunManager, RunManagerConfig};

use crate::repository::MergeOutcome;

const NOTICE_CAPACITY: usize = 1024;

/// Event type remote executors use to keep a run's access token alive
pub const ACCESS_TOKEN_REFRESH_EVENT: &str = "access_token_refresh";

/// Suffix of a run event type, `run/{runId}/{kind}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunEventKind {
    Output,
    Request,
    Init,
    Stop,
    Success,
    Fail,
}

impl RunEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunEventKind::Output => "output",
            RunEventKind::Request => "request",
            RunEventKind::Init => "init",
            RunEventKind::Stop => "stop",
            RunEventKind::Success => "success",
            RunEventKind::Fail => "fail",
        }
    }
}

impl fmt::Display for RunEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunEventKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "output" => Ok(RunEventKind::Output),
            "request" => Ok(RunEventKind::Request),
            "init" => Ok(RunEventKind::Init),
            "stop" => Ok(RunEventKind::Stop),
            "success" => Ok(RunEventKind::Success),
            "fail" => Ok(RunEventKind::Fail),
            _ => Err(()),
        }
    }
}

pub fn event_type(run_id: i64, kind: RunEventKind) -> String {
    format!("run/{}/{}", run_id, kind)
}

/// Split `run/{runId}/{kind}`
pub fn parse_event_type(event_type: &str) -> Option<(i64, RunEventKind)> {
    let mut parts = event_type.split('/');
    if parts.next()? != "run" {
        return None;
    }
    let run_id = parts.next()?.parse().ok()?;
    let kind = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((run_id, kind))
}

/// Message delivered to the run's manager
#[derive(Debug)]
pub enum RunEvent {
    Output(String),
    /// A job request; the answer goes back through `reply`
    Request {
        payload: String,
        reply: oneshot::Sender<serde_json::Value>,
    },
    Success {
        state: Option<serde_json::Value>,
    },
    Fail {
        message: String,
    },
}

/// What downstream consumers are told about a run
#[derive(Debug, Clone, PartialEq)]
pub enum RunNotice {
    Output {
        run_id: i64,
        text: String,
    },
    TokenRefresh {
        run_id: i64,
        job_id: i64,
        access_token: String,
    },
    Finished {
        run_id: i64,
        status: RunStatus,
    },
}

/// Registry of per-run channels
pub struct RunEventBus {
    runs: Mutex<HashMap<i64, mpsc::UnboundedSender<RunEvent>>>,
    notices: broadcast::Sender<RunNotice>,
}

impl Default for RunEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl RunEventBus {
    pub fn new() -> Self {
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        Self {
            runs: Mutex::new(HashMap::new()),
            notices,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<i64, mpsc::UnboundedSender<RunEvent>>> {
        self.runs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Open the run's channel, replacing a stale one
    pub fn register(&self, run_id: i64) -> mpsc::UnboundedReceiver<RunEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        if self.lock().insert(run_id, tx).is_some() {
            tracing::warn!("Run {} registered twice, dropping the previous channel", run_id);
        }
        rx
    }

    pub fn unregister(&self, run_id: i64) {
        self.lock().remove(&run_id);
    }

    pub fn is_registered(&self, run_id: i64) -> bool {
        self.lock().contains_key(&run_id)
    }

    /// Deliver an event; false when the run has no live channel
    pub fn publish(&self, run_id: i64, event: RunEvent) -> bool {
        let sender = self.lock().get(&run_id).cloned();
        match sender {
            Some(sender) => {
                if sender.send(event).is_err() {
                    self.lock().remove(&run_id);
                    return false;
                }
                true
            }
            None => {
                tracing::debug!("No listener for run {}", run_id);
                false
            }
        }
    }

    /// Publish a request and wait for the manager's answer
    pub async fn request(&self, run_id: i64, payload: String) -> Option<serde_json::Value> {
        let (reply, answer) = oneshot::channel();
        if !self.publish(run_id, RunEvent::Request { payload, reply }) {
            return None;
        }
        answer.await.ok()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunNotice> {
        self.notices.subscribe()
    }

    pub fn notify(&self, notice: RunNotice) {
        // no subscribers is fine
        let _ = self.notices.send(notice);
    }

    /// When `outcome` is the merge that made the run terminal, announce the
    /// end of the run and drop its channel. Returns whether it did.
    pub fn settle(&self, run_id: i64, outcome: &MergeOutcome) -> bool {
        match *outcome {
            MergeOutcome::Written { status, .. } if outcome.entered_terminal() => {
                self.notify(RunNotice::Finished { run_id, status });
                self.unregister(run_id);
                true
            }
            _ => false,
        }
    }
}
