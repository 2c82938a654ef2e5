//! Scripted shell for tests

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use super::{CommandOutput, RemoteShell, ShellConnector, SshError, SshTarget};

#[derive(Clone)]
enum Reply {
    Stdout(String),
    Fail { exit_code: u32, stderr: String },
}

#[derive(Default)]
struct ShellInner {
    rules: Vec<(String, Reply)>,
    commands: Vec<String>,
    uploads: Vec<(PathBuf, String)>,
    opened: u32,
    ended: u32,
}

/// Records every command and answers from rules matched by substring,
/// first rule wins, unmatched commands succeed with empty output
#[derive(Clone, Default)]
pub struct ScriptedShell {
    inner: Arc<Mutex<ShellInner>>,
}

impl ScriptedShell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, pattern: &str, stdout: &str) -> &Self {
        self.inner
            .lock()
            .unwrap()
            .rules
            .push((pattern.to_string(), Reply::Stdout(stdout.to_string())));
        self
    }

    pub fn fail_on(&self, pattern: &str, exit_code: u32, stderr: &str) -> &Self {
        self.inner.lock().unwrap().rules.push((
            pattern.to_string(),
            Reply::Fail {
                exit_code,
                stderr: stderr.to_string(),
            },
        ));
        self
    }

    pub fn commands(&self) -> Vec<String> {
        self.inner.lock().unwrap().commands.clone()
    }

    /// Commands containing `pattern`
    pub fn matching(&self, pattern: &str) -> Vec<String> {
        self.commands()
            .into_iter()
            .filter(|command| command.contains(pattern))
            .collect()
    }

    pub fn uploads(&self) -> Vec<(PathBuf, String)> {
        self.inner.lock().unwrap().uploads.clone()
    }

    /// True when every opened session was ended
    pub fn is_ended(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.opened > 0 && inner.opened == inner.ended
    }

    fn session(&self) -> FakeSession {
        self.inner.lock().unwrap().opened += 1;
        FakeSession {
            shell: self.clone(),
            ended: AtomicBool::new(false),
        }
    }

    fn reply(&self, command: &str) -> Result<CommandOutput, SshError> {
        let mut inner = self.inner.lock().unwrap();
        inner.commands.push(command.to_string());
        let reply = inner
            .rules
            .iter()
            .find(|(pattern, _)| command.contains(pattern.as_str()))
            .map(|(_, reply)| reply.clone());

        match reply {
            None => Ok(CommandOutput::default()),
            Some(Reply::Stdout(stdout)) => Ok(CommandOutput {
                stdout,
                stderr: String::new(),
            }),
            Some(Reply::Fail { exit_code, stderr }) => Err(SshError::Command {
                stdout: String::new(),
                stderr,
                exit_code: Some(exit_code),
                signal: None,
            }),
        }
    }
}

struct FakeSession {
    shell: ScriptedShell,
    ended: AtomicBool,
}

#[async_trait]
impl RemoteShell for FakeSession {
    async fn execute(&self, command: &str) -> Result<CommandOutput, SshError> {
        if self.ended.load(Ordering::SeqCst) {
            return Err(SshError::Closed);
        }
        self.shell.reply(command)
    }

    async fn upload_file(&self, local: &Path, remote: &str) -> Result<(), SshError> {
        if self.ended.load(Ordering::SeqCst) {
            return Err(SshError::Closed);
        }
        self.shell
            .inner
            .lock()
            .unwrap()
            .uploads
            .push((local.to_path_buf(), remote.to_string()));
        Ok(())
    }

    async fn end(&self) -> Result<(), SshError> {
        if self.ended.swap(true, Ordering::SeqCst) {
            return Err(SshError::AlreadyEnded);
        }
        self.shell.inner.lock().unwrap().ended += 1;
        Ok(())
    }
}

/// Hands out sessions on one scripted shell, or refuses every login
pub struct FakeConnector {
    shell: Option<ScriptedShell>,
    attempts: AtomicU32,
}

impl FakeConnector {
    pub fn new(shell: ScriptedShell) -> Self {
        Self {
            shell: Some(shell),
            attempts: AtomicU32::new(0),
        }
    }

    pub fn refusing() -> Self {
        Self {
            shell: None,
            attempts: AtomicU32::new(0),
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ShellConnector for FakeConnector {
    async fn connect(&self, target: &SshTarget) -> Result<Box<dyn RemoteShell>, SshError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        match &self.shell {
            Some(shell) => Ok(Box::new(shell.session())),
            None => Err(SshError::connection(target.label(), "connection refused")),
        }
    }
}
