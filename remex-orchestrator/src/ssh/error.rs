//! Errors surfaced by the remote command channel

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SshError {
    /// Transport or authentication failure reaching the host
    #[error("connection to {target} failed: {message}")]
    Connection { target: String, message: String },

    /// The command exited non-zero or was killed by a signal
    #[error("command failed (exit code {exit_code:?}, signal {signal:?}): {stderr}")]
    Command {
        stdout: String,
        stderr: String,
        exit_code: Option<u32>,
        signal: Option<String>,
    },

    /// `execute` was called after `end`
    #[error("channel is closed")]
    Closed,

    /// `end` was called twice on the same channel
    #[error("channel already ended")]
    AlreadyEnded,

    #[error("transport error: {0}")]
    Transport(#[from] russh::Error),

    #[error("sftp error: {0}")]
    Sftp(#[from] russh_sftp::client::error::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SshError {
    pub fn connection(target: impl Into<String>, message: impl ToString) -> Self {
        SshError::Connection {
            target: target.into(),
            message: message.to_string(),
        }
    }

    /// Exit code of a failed command, if any
    pub fn exit_code(&self) -> Option<u32> {
        match self {
            SshError::Command { exit_code, .. } => *exit_code,
            _ => None,
        }
    }
}
