//! Build cache records
//!
//! A record is a one-line file holding the guard (content hash) of the build
//! that produced the task environment. It is written by the remote clean job
//! once the build reports completion, never eagerly from here.

use remex_core::domain::task::{PythonSubtype, TaskType};
use sha2::{Digest, Sha512};

use crate::ssh::{RemoteShell, SshError};

const NOT_CACHED: &str = "notcached";

/// Hash over task type, archive bytes and subtype, hex encoded
pub fn validity_guard(task_type: TaskType, archive: &[u8], subtype: PythonSubtype) -> String {
    let mut hasher = Sha512::new();
    hasher.update(task_type.as_str().as_bytes());
    hasher.update(archive);
    hasher.update(subtype.as_str().as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone)]
pub struct CacheRecord {
    path: String,
}

impl CacheRecord {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Prints `notcached` unless the record exists and holds exactly `guard`
    pub fn check_command(&self, guard: &str) -> String {
        format!(
            "( [ -f {path} ] && [ \"$(grep -e ^{guard}$ {path})\" = \"{guard}\" ] ) || echo {marker}",
            path = self.path,
            guard = guard,
            marker = NOT_CACHED,
        )
    }

    pub fn remove_command(&self) -> String {
        format!("rm -f {}", self.path)
    }

    pub async fn is_valid(&self, shell: &dyn RemoteShell, guard: &str) -> Result<bool, SshError> {
        let output = shell.execute(&self.check_command(guard)).await?;
        Ok(output.trimmed().trim() != NOT_CACHED)
    }

    pub async fn remove(&self, shell: &dyn RemoteShell) -> Result<(), SshError> {
        shell.execute(&self.remove_command()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::SshTarget;
    use crate::ssh::fake::{FakeConnector, ScriptedShell};
    use crate::ssh::{ShellConnector, SshAuth};

    fn target() -> SshTarget {
        SshTarget::new("login", 22, "ci", SshAuth::Password("pw".into()))
    }

    #[test]
    fn test_guard_depends_on_every_input() {
        let base = validity_guard(TaskType::Python, b"code", PythonSubtype::Default);
        assert_eq!(base.len(), 128);
        assert_eq!(base, validity_guard(TaskType::Python, b"code", PythonSubtype::Default));
        assert_ne!(base, validity_guard(TaskType::Python, b"code2", PythonSubtype::Default));
        assert_ne!(base, validity_guard(TaskType::Python, b"code", PythonSubtype::Numpy));
    }

    #[test]
    fn test_check_command_shape() {
        let record = CacheRecord::new("~/R/cache/3.cache");
        assert_eq!(
            record.check_command("abc"),
            "( [ -f ~/R/cache/3.cache ] && [ \"$(grep -e ^abc$ ~/R/cache/3.cache)\" = \"abc\" ] ) || echo notcached"
        );
    }

    #[tokio::test]
    async fn test_validity_follows_remote_answer() {
        let shell = ScriptedShell::new();
        shell.on("|| echo notcached", "notcached\n");
        let session = FakeConnector::new(shell.clone()).connect(&target()).await.unwrap();

        let record = CacheRecord::new("~/R/cache/3.cache");
        assert!(!record.is_valid(session.as_ref(), "abc").await.unwrap());
        assert!(!record.is_valid(session.as_ref(), "abc").await.unwrap());
    }

    #[tokio::test]
    async fn test_valid_when_nothing_printed() {
        let shell = ScriptedShell::new();
        let session = FakeConnector::new(shell.clone()).connect(&target()).await.unwrap();

        let record = CacheRecord::new("~/R/cache/3.cache");
        assert!(record.is_valid(session.as_ref(), "abc").await.unwrap());

        record.remove(session.as_ref()).await.unwrap();
        assert_eq!(shell.matching("rm -f").len(), 1);
    }
}
