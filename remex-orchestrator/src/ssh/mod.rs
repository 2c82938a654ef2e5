//! Remote Command Channel
//!
//! One authenticated login session to a remote host. Commands run one shell
//! invocation each and settle exactly once with either their captured output
//! or a [`SshError::Command`]. No retry happens here; callers that need to
//! wait for a host to come up use [`probe`].

pub mod channel;
pub mod error;

#[cfg(test)]
pub mod fake;

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;

pub use channel::RusshConnector;
pub use error::SshError;

/// How to authenticate against a host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SshAuth {
    Password(String),
    Key(PathBuf),
}

/// Host, port and user of a login session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub auth: SshAuth,
}

impl SshTarget {
    pub fn new(host: impl Into<String>, port: u16, user: impl Into<String>, auth: SshAuth) -> Self {
        Self {
            host: host.into(),
            port,
            user: user.into(),
            auth,
        }
    }

    /// `user@host:port`, used in logs and errors
    pub fn label(&self) -> String {
        format!("{}@{}:{}", self.user, self.host, self.port)
    }
}

/// Captured output of a successful command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Stdout without the trailing newline
    pub fn trimmed(&self) -> &str {
        self.stdout.trim_end_matches(['\n', '\r'])
    }
}

/// An open session
#[async_trait]
pub trait RemoteShell: Send + Sync {
    async fn execute(&self, command: &str) -> Result<CommandOutput, SshError>;

    async fn upload_file(&self, local: &Path, remote: &str) -> Result<(), SshError>;

    /// Close the session; a second call fails with [`SshError::AlreadyEnded`]
    async fn end(&self) -> Result<(), SshError>;
}

/// Opens sessions (trait-based for mocking)
#[async_trait]
pub trait ShellConnector: Send + Sync {
    async fn connect(&self, target: &SshTarget) -> Result<Box<dyn RemoteShell>, SshError>;
}

/// Liveness check that never leaves a session open
pub async fn can_connect(connector: &dyn ShellConnector, target: &SshTarget) -> bool {
    match connector.connect(target).await {
        Ok(shell) => {
            let _ = shell.end().await;
            true
        }
        Err(err) => {
            tracing::debug!("SSH liveness check for {} failed: {}", target.label(), err);
            false
        }
    }
}

/// Upload a single file over a dedicated session
pub async fn upload_file(
    connector: &dyn ShellConnector,
    target: &SshTarget,
    local: &Path,
    remote: &str,
) -> Result<(), SshError> {
    let shell = connector.connect(target).await?;
    let result = shell.upload_file(local, remote).await;
    let _ = shell.end().await;
    result
}

/// Bounded retry policy for waiting on a host
#[derive(Debug, Clone, Copy)]
pub struct ProbePolicy {
    pub attempts: u32,
    pub cooldown: Duration,
    pub deadline: Duration,
}

impl Default for ProbePolicy {
    fn default() -> Self {
        Self {
            attempts: 30,
            cooldown: Duration::from_secs(10),
            deadline: Duration::from_secs(600),
        }
    }
}

/// Wait until the host accepts a login, failing once attempts or the
/// deadline run out
pub async fn probe(
    connector: &dyn ShellConnector,
    target: &SshTarget,
    policy: ProbePolicy,
) -> Result<(), SshError> {
    let started = Instant::now();
    for attempt in 1..=policy.attempts {
        if can_connect(connector, target).await {
            tracing::info!("{} reachable after {} attempt(s)", target.label(), attempt);
            return Ok(());
        }
        if started.elapsed() + policy.cooldown > policy.deadline {
            break;
        }
        tokio::time::sleep(policy.cooldown).await;
    }

    Err(SshError::connection(
        target.label(),
        format!(
            "host not reachable after {} attempts or {}s",
            policy.attempts,
            policy.deadline.as_secs()
        ),
    ))
}

#[cfg(test)]
mod tests {
    use super::fake::{FakeConnector, ScriptedShell};
    use super::*;

    fn target() -> SshTarget {
        SshTarget::new("10.0.0.1", 22, "remex", SshAuth::Password("secret".into()))
    }

    #[test]
    fn test_target_label() {
        assert_eq!(target().label(), "remex@10.0.0.1:22");
    }

    #[test]
    fn test_trimmed_output() {
        let out = CommandOutput {
            stdout: "/home/remex\n".into(),
            stderr: String::new(),
        };
        assert_eq!(out.trimmed(), "/home/remex");
    }

    #[tokio::test]
    async fn test_can_connect_closes_session() {
        let shell = ScriptedShell::new();
        let connector = FakeConnector::new(shell.clone());

        assert!(can_connect(&connector, &target()).await);
        assert!(shell.is_ended());
    }

    #[tokio::test]
    async fn test_can_connect_refused() {
        let connector = FakeConnector::refusing();
        assert!(!can_connect(&connector, &target()).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_gives_up_after_attempts() {
        let connector = FakeConnector::refusing();
        let policy = ProbePolicy {
            attempts: 3,
            cooldown: Duration::from_secs(1),
            deadline: Duration::from_secs(60),
        };

        let err = probe(&connector, &target(), policy).await.unwrap_err();
        assert!(matches!(err, SshError::Connection { .. }));
        assert_eq!(connector.attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_respects_deadline() {
        let connector = FakeConnector::refusing();
        let policy = ProbePolicy {
            attempts: 100,
            cooldown: Duration::from_secs(10),
            deadline: Duration::from_secs(25),
        };

        assert!(probe(&connector, &target(), policy).await.is_err());
        assert_eq!(connector.attempts(), 3);
    }
}
