//! russh-backed command channel
//!
//! Every `execute` mints a correlation token, parks a one-shot completion
//! handle under it and hands the command to the session's driver task. The
//! driver settles the token when the remote process closes its channel.
//! Settling removes the entry, so a token resolves at most once; a caller
//! that gives up drops its guard, which disarms the entry so a late result
//! is discarded instead of lingering in the map.

use async_trait::async_trait;
use russh::client::{self, AuthResult, Handle};
use russh::keys::PrivateKeyWithHashAlg;
use russh::{ChannelMsg, Disconnect};
use russh_sftp::client::SftpSession;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use super::{CommandOutput, RemoteShell, ShellConnector, SshAuth, SshError, SshTarget};

type Settlement = Result<CommandOutput, SshError>;

/// Host keys are not pinned; executors are addressed by operator-entered
/// hosts or by addresses we just provisioned.
struct ClientHandler;

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

// =============================================================================
// Correlation
// =============================================================================

/// Outstanding commands keyed by correlation token
#[derive(Clone, Default)]
pub(crate) struct PendingCommands {
    inner: Arc<Mutex<HashMap<Uuid, oneshot::Sender<Settlement>>>>,
}

/// Disarms its token when dropped
pub(crate) struct PendingGuard {
    pending: PendingCommands,
    token: Uuid,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.disarm(self.token);
    }
}

impl PendingCommands {
    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, oneshot::Sender<Settlement>>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn register(&self) -> (Uuid, oneshot::Receiver<Settlement>, PendingGuard) {
        let (tx, rx) = oneshot::channel();
        let mut map = self.lock();
        let mut token = Uuid::new_v4();
        while map.contains_key(&token) {
            token = Uuid::new_v4();
        }
        map.insert(token, tx);
        drop(map);

        let guard = PendingGuard {
            pending: self.clone(),
            token,
        };
        (token, rx, guard)
    }

    /// Resolve `token`; false when it was already settled or disarmed
    pub(crate) fn settle(&self, token: Uuid, outcome: Settlement) -> bool {
        match self.lock().remove(&token) {
            Some(tx) => {
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }

    pub(crate) fn disarm(&self, token: Uuid) -> bool {
        self.lock().remove(&token).is_some()
    }

    /// Fail every outstanding command with [`SshError::Closed`]
    pub(crate) fn close_all(&self) -> usize {
        let drained: Vec<_> = self.lock().drain().collect();
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(SshError::Closed));
        }
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }
}

// =============================================================================
// Session
// =============================================================================

struct CommandRequest {
    token: Uuid,
    command: String,
}

/// One open login session
pub struct SshChannel {
    label: String,
    handle: Arc<Handle<ClientHandler>>,
    requests: Mutex<Option<mpsc::UnboundedSender<CommandRequest>>>,
    pending: PendingCommands,
}

impl SshChannel {
    pub async fn connect(config: Arc<client::Config>, target: &SshTarget) -> Result<Self, SshError> {
        let label = target.label();
        tracing::debug!("Opening SSH session to {}", label);

        let mut handle = client::connect(config, (target.host.as_str(), target.port), ClientHandler)
            .await
            .map_err(|e| SshError::connection(&label, e))?;

        let result = match &target.auth {
            SshAuth::Password(password) => {
                handle
                    .authenticate_password(target.user.clone(), password.clone())
                    .await
            }
            SshAuth::Key(path) => {
                let key = russh::keys::load_secret_key(path, None)
                    .map_err(|e| SshError::connection(&label, e))?;
                let hash = handle
                    .best_supported_rsa_hash()
                    .await
                    .map_err(|e| SshError::connection(&label, e))?
                    .flatten();
                handle
                    .authenticate_publickey(
                        target.user.clone(),
                        PrivateKeyWithHashAlg::new(Arc::new(key), hash),
                    )
                    .await
            }
        }
        .map_err(|e| SshError::connection(&label, e))?;

        if !matches!(result, AuthResult::Success) {
            return Err(SshError::connection(&label, "authentication rejected"));
        }

        let handle = Arc::new(handle);
        let pending = PendingCommands::default();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(drive(handle.clone(), pending.clone(), rx));

        Ok(Self {
            label,
            handle,
            requests: Mutex::new(Some(tx)),
            pending,
        })
    }

    fn sender(&self) -> Result<mpsc::UnboundedSender<CommandRequest>, SshError> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or(SshError::Closed)
    }
}

/// Runs each requested command on its own channel and settles its token
async fn drive(
    handle: Arc<Handle<ClientHandler>>,
    pending: PendingCommands,
    mut requests: mpsc::UnboundedReceiver<CommandRequest>,
) {
    while let Some(request) = requests.recv().await {
        let handle = handle.clone();
        let pending = pending.clone();
        tokio::spawn(async move {
            let outcome = run_command(&handle, &request.command).await;
            if !pending.settle(request.token, outcome) {
                tracing::debug!("Discarding result of disarmed command {}", request.token);
            }
        });
    }
}

async fn run_command(handle: &Handle<ClientHandler>, command: &str) -> Settlement {
    let mut chan = handle.channel_open_session().await?;
    chan.exec(true, command).await?;

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut exit_code = None;
    let mut signal = None;

    while let Some(msg) = chan.wait().await {
        match msg {
            ChannelMsg::Data { data } => stdout.extend_from_slice(&data),
            ChannelMsg::ExtendedData { data, ext: 1 } => stderr.extend_from_slice(&data),
            ChannelMsg::ExitStatus { exit_status } => exit_code = Some(exit_status),
            ChannelMsg::ExitSignal { signal_name, .. } => signal = Some(format!("{:?}", signal_name)),
            ChannelMsg::Close => break,
            _ => {}
        }
    }
    let _ = chan.close().await;

    let stdout = String::from_utf8_lossy(&stdout).into_owned();
    let stderr = String::from_utf8_lossy(&stderr).into_owned();

    if exit_code == Some(0) && signal.is_none() {
        Ok(CommandOutput { stdout, stderr })
    } else {
        Err(SshError::Command {
            stdout,
            stderr,
            exit_code,
            signal,
        })
    }
}

#[async_trait]
impl RemoteShell for SshChannel {
    async fn execute(&self, command: &str) -> Result<CommandOutput, SshError> {
        let sender = self.sender()?;
        let (token, rx, _guard) = self.pending.register();

        tracing::trace!("[{}] {} -> {}", self.label, token, command);
        sender
            .send(CommandRequest {
                token,
                command: command.to_string(),
            })
            .map_err(|_| SshError::Closed)?;

        rx.await.unwrap_or(Err(SshError::Closed))
    }

    async fn upload_file(&self, local: &Path, remote: &str) -> Result<(), SshError> {
        self.sender()?;

        let bytes = tokio::fs::read(local).await?;
        let channel = self.handle.channel_open_session().await?;
        channel.request_subsystem(true, "sftp").await?;
        let sftp = SftpSession::new(channel.into_stream()).await?;

        let mut file = sftp.create(remote).await?;
        file.write_all(&bytes).await?;
        file.shutdown().await?;
        sftp.close().await?;

        tracing::debug!("[{}] uploaded {} bytes to {}", self.label, bytes.len(), remote);
        Ok(())
    }

    async fn end(&self) -> Result<(), SshError> {
        let sender = self
            .requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if sender.is_none() {
            return Err(SshError::AlreadyEnded);
        }
        drop(sender);

        let abandoned = self.pending.close_all();
        if abandoned > 0 {
            tracing::warn!("[{}] ended with {} command(s) in flight", self.label, abandoned);
        }

        self.handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await?;
        Ok(())
    }
}

/// Opens russh sessions
pub struct RusshConnector {
    config: Arc<client::Config>,
}

impl RusshConnector {
    pub fn new(inactivity_timeout: Duration) -> Self {
        let config = client::Config {
            inactivity_timeout: Some(inactivity_timeout),
            ..Default::default()
        };
        Self {
            config: Arc::new(config),
        }
    }
}

impl Default for RusshConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

#[async_trait]
impl ShellConnector for RusshConnector {
    async fn connect(&self, target: &SshTarget) -> Result<Box<dyn RemoteShell>, SshError> {
        let channel = SshChannel::connect(self.config.clone(), target).await?;
        Ok(Box::new(channel))
    }
}
