//! Run domain types
//!
//! A run is one execution of a job on one executor. Its status is owned jointly
//! by the local database and, while the run is live, by the remote executor, so
//! every status update goes through [`RunStatus::merge`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::domain::executor::UnknownVariant;

/// One execution attempt of a job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: i64,
    pub job_id: i64,
    pub status: RunStatus,
    pub output: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Local run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Initialization,
    Queued,
    Scheduled,
    Running,
    Success,
    Failed,
}

impl RunStatus {
    /// Statuses a run can still leave
    pub const UNFINISHED: [RunStatus; 4] = [
        RunStatus::Initialization,
        RunStatus::Queued,
        RunStatus::Scheduled,
        RunStatus::Running,
    ];

    /// Merge priority. Terminal statuses share the highest rank.
    pub fn priority(self) -> i32 {
        match self {
            RunStatus::Success | RunStatus::Failed => 10_000,
            RunStatus::Running => 0,
            RunStatus::Scheduled => -1_000,
            RunStatus::Queued => -1_500,
            RunStatus::Initialization => -2_000,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Success | RunStatus::Failed)
    }

    /// Pick the status to store given the current one and an incoming one.
    ///
    /// The strictly higher priority wins. Two different statuses of equal
    /// priority cannot be ordered and are reported as a conflict.
    pub fn merge(current: RunStatus, incoming: RunStatus) -> Result<RunStatus, StatusConflict> {
        let (cur, inc) = (current.priority(), incoming.priority());
        if inc > cur {
            Ok(incoming)
        } else if cur > inc {
            Ok(current)
        } else if current != incoming {
            Err(StatusConflict { current, incoming })
        } else {
            Ok(current)
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Initialization => "INITIALIZATION",
            RunStatus::Queued => "QUEUED",
            RunStatus::Scheduled => "SCHEDULED",
            RunStatus::Running => "RUNNING",
            RunStatus::Success => "SUCCESS",
            RunStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INITIALIZATION" => Ok(RunStatus::Initialization),
            "QUEUED" => Ok(RunStatus::Queued),
            "SCHEDULED" => Ok(RunStatus::Scheduled),
            "RUNNING" => Ok(RunStatus::Running),
            "SUCCESS" => Ok(RunStatus::Success),
            "FAILED" => Ok(RunStatus::Failed),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// Two distinct statuses of equal priority met during a merge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusConflict {
    pub current: RunStatus,
    pub incoming: RunStatus,
}

impl fmt::Display for StatusConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "status clash: stored {} vs incoming {}",
            self.current, self.incoming
        )
    }
}

impl std::error::Error for StatusConflict {}

/// Run state as reported by a remote executor (numeric on the wire)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum RemoteRunState {
    Success = 0,
    BuildFail = 1,
    RunFail = 2,
    Running = 3,
    Queued = 4,
}

impl RemoteRunState {
    /// Translate into a local status. A build failure has no local
    /// counterpart; remote executors report it as a run failure instead.
    pub fn to_run_status(self) -> Option<RunStatus> {
        match self {
            RemoteRunState::Success => Some(RunStatus::Success),
            RemoteRunState::RunFail => Some(RunStatus::Failed),
            RemoteRunState::Running => Some(RunStatus::Running),
            RemoteRunState::Queued => Some(RunStatus::Scheduled),
            RemoteRunState::BuildFail => None,
        }
    }

    pub fn is_finished(self) -> bool {
        matches!(self, RemoteRunState::Success | RemoteRunState::RunFail)
    }
}

impl TryFrom<u8> for RemoteRunState {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(RemoteRunState::Success),
            1 => Ok(RemoteRunState::BuildFail),
            2 => Ok(RemoteRunState::RunFail),
            3 => Ok(RemoteRunState::Running),
            4 => Ok(RemoteRunState::Queued),
            other => Err(format!("invalid remote run state {}", other)),
        }
    }
}

impl From<RemoteRunState> for u8 {
    fn from(state: RemoteRunState) -> Self {
        state as u8
    }
}
