//! SLURM Backend
//!
//! Builds and runs tasks on a SLURM cluster through its login node. A run is
//! either `build -> run` or, when the task's cache record matches, `run`
//! alone. The build is submitted as a batch job followed by a dependent
//! clean job; the run is submitted depending on the clean job and checks
//! the build output itself, so a failed build is reported from the cluster
//! instead of racing a half-built environment.

pub mod cache;
pub mod paths;
pub mod scripts;

use remex_core::domain::executor::{Executor, SlurmParams};
use remex_core::domain::run::RemoteRunState;
use remex_core::domain::task::TaskInfo;
use remex_core::dto::agent::RunSpec;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

use crate::config::Settings;
use crate::events::{RunEventKind, event_type};
use crate::identity::ExecutorCredentials;
use crate::ssh::{RemoteShell, ShellConnector, SshAuth, SshError, SshTarget};
use cache::{CacheRecord, validity_guard};
use paths::{ExecutorPaths, RunPaths};
use scripts::NO_BUILD_CHECK;

#[derive(Debug, Error)]
pub enum SlurmError {
    #[error("invalid SLURM executor parameters: {0}")]
    Parameters(String),

    #[error(transparent)]
    Ssh(#[from] SshError),

    #[error("scheduler returned an invalid job id: '{0}'")]
    InvalidJobId(String),

    #[error("cannot read task archive: {0}")]
    Archive(#[from] std::io::Error),
}

/// Jobs submitted for one build
struct BuildJobs {
    clean_job_id: String,
    output: String,
}

pub struct SlurmBackend {
    connector: Arc<dyn ShellConnector>,
    ssh_key: Option<PathBuf>,
    trusted_url_base: String,
    es_host: String,
    es_port: u16,
    utils_repo: String,
    utils_commit: Option<String>,
}

impl SlurmBackend {
    pub fn new(connector: Arc<dyn ShellConnector>, settings: &Settings) -> Self {
        let (es_host, es_port) = settings.es_host_port();
        Self {
            connector,
            ssh_key: settings.ssh_key_path.clone(),
            trusted_url_base: settings.trusted_url_base.clone(),
            es_host,
            es_port,
            utils_repo: settings.slurm_utils_repo.clone(),
            utils_commit: settings.slurm_utils_commit.clone(),
        }
    }

    fn target(&self, executor: &Executor) -> Result<SshTarget, SlurmError> {
        let params: SlurmParams = executor
            .params()
            .map_err(|e| SlurmError::Parameters(e.to_string()))?;

        let auth = match (params.password, &self.ssh_key) {
            (Some(password), _) => SshAuth::Password(password),
            (None, Some(key)) => SshAuth::Key(key.clone()),
            (None, None) => {
                return Err(SlurmError::Parameters(
                    "no password given and no SSH key configured".to_string(),
                ));
            }
        };

        Ok(SshTarget::new(params.hostname, params.port, params.username, auth))
    }

    async fn session(&self, executor: &Executor) -> Result<Box<dyn RemoteShell>, SlurmError> {
        let target = self.target(executor)?;
        Ok(self.connector.connect(&target).await?)
    }

    // =========================================================================
    // Runs
    // =========================================================================

    /// Submit a run, building the task environment first when its cache
    /// record is missing or stale
    pub async fn run(
        &self,
        executor: &Executor,
        run_id: i64,
        job_id: i64,
        spec: &RunSpec,
    ) -> Result<(), SlurmError> {
        let archive = tokio::fs::read(&spec.task.archive_path).await?;
        let guard = validity_guard(spec.task.task_type, &archive, spec.task.subtype);

        let shell = self.session(executor).await?;
        let result = self
            .submit_run(shell.as_ref(), executor.id, run_id, job_id, spec, &guard)
            .await;
        let _ = shell.end().await;
        result
    }

    async fn submit_run(
        &self,
        shell: &dyn RemoteShell,
        executor_id: i64,
        run_id: i64,
        job_id: i64,
        spec: &RunSpec,
        guard: &str,
    ) -> Result<(), SlurmError> {
        let paths = ExecutorPaths::new(executor_id);
        let task = paths.task(spec.task.task_id);
        let run = paths.run(run_id);
        let record = CacheRecord::new(task.cache_record());

        let mut dependency = None;
        let mut build_output = NO_BUILD_CHECK.to_string();

        if !record.is_valid(shell, guard).await? {
            tracing::info!(
                "Task {} not cached on executor {}, building",
                spec.task.task_id,
                executor_id
            );
            record.remove(shell).await?;
            let build = self.build(shell, executor_id, &spec.task, guard).await?;
            dependency = Some(build.clean_job_id);
            build_output = build.output;
        }

        let input = self.run_input(&paths, job_id, spec);
        shell
            .execute(&literal_heredoc(&run.input(), &input.to_string()))
            .await?;

        let dependency = dependency
            .map(|id| format!(" --dependency=afterany:{}", id))
            .unwrap_or_default();
        let command = format!(
            "sbatch --parsable{} --job-name={} {} {} {} {} {} {} {} > {}",
            dependency,
            run_id,
            paths.run_script(),
            task.dir(),
            run.input(),
            build_output,
            paths.informant_script(),
            event_type(run_id, RunEventKind::Fail),
            run_id,
            run.id_mapping(),
        );
        shell.execute(&command).await?;

        tracing::info!("Run {} submitted to executor {}", run_id, executor_id);
        Ok(())
    }

    async fn build(
        &self,
        shell: &dyn RemoteShell,
        executor_id: i64,
        task: &TaskInfo,
        guard: &str,
    ) -> Result<BuildJobs, SlurmError> {
        let paths = ExecutorPaths::new(executor_id);
        let task_paths = paths.task(task.task_id);

        let home = shell.execute("echo ~").await?;
        let rooted = ExecutorPaths::with_home(home.trimmed(), executor_id).task(task.task_id);

        shell.execute(&format!("mkdir -p {}", task_paths.dir())).await?;
        shell.upload_file(&task.archive_path, &rooted.archive()).await?;
        shell
            .execute(&format!(
                "tar -xf {} --directory={}",
                rooted.archive(),
                rooted.dir()
            ))
            .await?;
        shell.execute(&format!("rm -f {}", rooted.archive())).await?;

        let libs = task.subtype.libs().join(" ");
        let build_id = submit(
            shell,
            &format!(
                "sbatch --parsable {} {} {}",
                paths.init_script(),
                task_paths.dir(),
                libs
            ),
        )
        .await?;

        let output = paths.build_output(&build_id);
        let clean_job_id = submit(
            shell,
            &format!(
                "sbatch --parsable --output=/dev/null --dependency=afterany:{} {} {} {} {}",
                build_id,
                paths.clean_script(),
                output,
                guard,
                task_paths.cache_record(),
            ),
        )
        .await?;

        tracing::debug!("Build job {} with clean job {}", build_id, clean_job_id);
        Ok(BuildJobs {
            clean_job_id,
            output,
        })
    }

    fn run_input(&self, paths: &ExecutorPaths, job_id: i64, spec: &RunSpec) -> serde_json::Value {
        serde_json::json!({
            "context": { "jobId": job_id },
            "params": spec.params,
            "entities": spec.entities,
            "owned": spec.owned,
            "accessToken": spec.access_token,
            "certs": true,
            "caPath": paths.ca_cert(),
            "certPath": paths.runner_cert(),
            "keyPath": paths.runner_key(),
            "es": { "host": self.es_host, "port": self.es_port },
            "server": {
                "trustedUrlBase": self.trusted_url_base,
                "trustedEmitPath": "/remote/emit",
            },
            "state": spec.state,
        })
    }

    /// Remote state of a run, `None` when it cannot be determined
    pub async fn status(&self, executor: &Executor, run_id: i64) -> Option<RemoteRunState> {
        let shell = match self.session(executor).await {
            Ok(shell) => shell,
            Err(err) => {
                tracing::warn!("Cannot reach executor {} for run {}: {}", executor.id, run_id, err);
                return None;
            }
        };
        let run = ExecutorPaths::new(executor.id).run(run_id);
        let state = status_on(shell.as_ref(), &run).await;
        let _ = shell.end().await;
        state
    }

    /// Cancel the run's batch job; a run without a mapping is already gone
    pub async fn stop(&self, executor: &Executor, run_id: i64) -> Result<(), SlurmError> {
        let shell = self.session(executor).await?;
        let run = ExecutorPaths::new(executor.id).run(run_id);

        let result = match read_mapping(shell.as_ref(), &run).await {
            Some(job) => shell
                .execute(&format!("scancel {}", job))
                .await
                .map(|_| ())
                .map_err(SlurmError::from),
            None => Ok(()),
        };
        let _ = shell.end().await;
        result
    }

    /// Delete the run's input, mapping and output files
    pub async fn remove_run(&self, executor: &Executor, run_id: i64) -> Result<(), SlurmError> {
        let shell = self.session(executor).await?;
        let run = ExecutorPaths::new(executor.id).run(run_id);
        let result = remove_run_on(shell.as_ref(), &run).await;
        let _ = shell.end().await;
        result
    }

    // =========================================================================
    // Executor setup
    // =========================================================================

    /// Commands preparing a fresh executor tree on the login node
    pub fn setup_commands(
        &self,
        home: &str,
        executor_id: i64,
        credentials: &ExecutorCredentials,
    ) -> Vec<String> {
        let paths = ExecutorPaths::with_home(home, executor_id);

        let mut commands: Vec<String> = paths
            .directories()
            .into_iter()
            .map(|dir| format!("mkdir -p {}", dir))
            .collect();

        commands.push(literal_heredoc(&paths.ca_cert(), &credentials.ca_cert));
        commands.push(literal_heredoc(&paths.runner_key(), &credentials.key));
        commands.push(literal_heredoc(&paths.runner_cert(), &credentials.cert));

        commands.push(format!("git clone {} {}", self.utils_repo, paths.utils_dir()));
        commands.push(match &self.utils_commit {
            Some(commit) => format!("cd {} && git checkout {}", paths.utils_dir(), commit),
            None => "echo using HEAD".to_string(),
        });

        commands.extend(scripts::install_script(
            &paths.init_script(),
            &scripts::init_script(&paths),
        ));
        commands.extend(scripts::install_script(
            &paths.run_script(),
            &scripts::run_script(&paths),
        ));
        commands.extend(scripts::install_script(
            &paths.clean_script(),
            &scripts::clean_script(),
        ));
        commands.extend(scripts::install_script(
            &paths.informant_script(),
            &scripts::informant_script(&paths, &self.trusted_url_base),
        ));

        commands.push(format!("chmod u+x {}", paths.install_script()));
        commands.push(format!("srun {} {}", paths.install_script(), paths.utils_dir()));
        commands
    }

    /// Prepare the executor tree, install credentials and helper scripts
    pub async fn setup(
        &self,
        executor: &Executor,
        credentials: &ExecutorCredentials,
    ) -> Result<(), SlurmError> {
        let shell = self.session(executor).await?;
        let result = async {
            let home = shell.execute("echo ~").await?;
            for command in self.setup_commands(home.trimmed(), executor.id, credentials) {
                shell.execute(&command).await?;
            }
            Ok::<(), SlurmError>(())
        }
        .await;
        let _ = shell.end().await;
        result
    }

    /// Remove the executor tree from the login node
    pub async fn teardown(&self, executor: &Executor) -> Result<(), SlurmError> {
        let shell = self.session(executor).await?;
        let result = shell
            .execute(&format!("rm -rf {}", ExecutorPaths::new(executor.id).root()))
            .await;
        let _ = shell.end().await;
        result?;
        Ok(())
    }
}

/// Write data verbatim, without shell expansion
fn literal_heredoc(path: &str, contents: &str) -> String {
    format!("cat > {} << 'HEREDOC_EOF'\n{}\nHEREDOC_EOF", path, contents)
}

/// Run an `sbatch --parsable` command and return the numeric job id
async fn submit(shell: &dyn RemoteShell, command: &str) -> Result<String, SlurmError> {
    let output = shell.execute(command).await?;
    let id = output.trimmed().trim();
    if id.is_empty() || !id.bytes().all(|b| b.is_ascii_digit()) {
        return Err(SlurmError::InvalidJobId(id.to_string()));
    }
    Ok(id.to_string())
}

async fn read_mapping(shell: &dyn RemoteShell, run: &RunPaths) -> Option<String> {
    let output = shell.execute(&format!("cat {}", run.id_mapping())).await.ok()?;
    let id = output.trimmed().trim();
    if id.is_empty() {
        None
    } else {
        Some(id.to_string())
    }
}

async fn status_on(shell: &dyn RemoteShell, run: &RunPaths) -> Option<RemoteRunState> {
    let job = read_mapping(shell, run).await?;

    let queued = shell
        .execute(&format!("squeue --job {} -o \"%t\" | sed -n 2p", job))
        .await
        .ok()
        .and_then(|output| scripts::squeue_state(output.trimmed()));
    if queued.is_some() {
        return queued;
    }

    let tail = match shell
        .execute(&format!("cat {} | tail -n 1", run.output(&job)))
        .await
    {
        Ok(output) => output,
        Err(err) => {
            tracing::warn!("Cannot read output of SLURM job {}: {}", job, err);
            return None;
        }
    };

    let state = scripts::exit_code_state(tail.trimmed());
    if state.is_none() {
        tracing::error!(
            "Unexpected last line of SLURM job {} output, expected an exit code, got: {}",
            job,
            tail.trimmed()
        );
    }
    state
}

async fn remove_run_on(shell: &dyn RemoteShell, run: &RunPaths) -> Result<(), SlurmError> {
    let job = read_mapping(shell, run).await;
    shell
        .execute(&format!("rm -f {} {}", run.input(), run.id_mapping()))
        .await?;
    if let Some(job) = job {
        shell.execute(&format!("rm -f {}", run.output(&job))).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::memory::executor;
    use crate::ssh::fake::{FakeConnector, ScriptedShell};
    use remex_core::domain::executor::{ExecutorStatus, ExecutorType};
    use remex_core::domain::task::{PythonSubtype, TaskType};
    use std::io::Write;

    fn slurm_executor() -> Executor {
        let mut executor = executor(7, ExecutorType::SlurmPool, ExecutorStatus::Ready);
        executor.parameters = serde_json::json!({
            "hostname": "login.cluster",
            "username": "ci",
            "password": "pw"
        });
        executor
    }

    fn backend(shell: &ScriptedShell) -> SlurmBackend {
        SlurmBackend::new(
            Arc::new(FakeConnector::new(shell.clone())),
            &Settings::default(),
        )
    }

    fn spec(archive: &tempfile::NamedTempFile) -> RunSpec {
        RunSpec {
            task: TaskInfo {
                task_id: 3,
                task_type: TaskType::Python,
                subtype: PythonSubtype::Numpy,
                archive_path: archive.path().to_path_buf(),
            },
            params: serde_json::json!({ "window": 5 }),
            entities: serde_json::json!({}),
            owned: serde_json::json!({}),
            access_token: Some("token".into()),
            state: serde_json::Value::Null,
        }
    }

    fn archive() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"packed task").unwrap();
        file
    }

    #[test]
    fn test_target_requires_credentials() {
        let shell = ScriptedShell::new();
        let backend = backend(&shell);
        let mut executor = slurm_executor();
        executor.parameters = serde_json::json!({ "hostname": "h", "username": "u" });

        assert!(matches!(backend.target(&executor), Err(SlurmError::Parameters(_))));
    }

    #[tokio::test]
    async fn test_cached_run_skips_build() {
        let shell = ScriptedShell::new();
        let archive = archive();

        backend(&shell)
            .run(&slurm_executor(), 9, 4, &spec(&archive))
            .await
            .unwrap();

        assert!(shell.matching("__python_init.sh").is_empty());
        assert!(shell.uploads().is_empty());

        let submitted = shell.matching("sbatch --parsable --job-name=9");
        assert_eq!(submitted.len(), 1);
        assert!(submitted[0].contains(" nocheck "));
        assert!(submitted[0].contains(" run/9/fail 9 > ~/REMEX_SLURM_EXECUTOR_7/inputs/9.id"));

        let input = shell.matching("cat > ~/REMEX_SLURM_EXECUTOR_7/inputs/9 << 'HEREDOC_EOF'");
        assert_eq!(input.len(), 1);
        assert!(input[0].contains(r#""jobId":4"#));
        assert!(input[0].contains(r#""trustedEmitPath":"/remote/emit""#));
        assert!(shell.is_ended());
    }

    #[tokio::test]
    async fn test_uncached_run_builds_first() {
        let shell = ScriptedShell::new();
        shell
            .on("|| echo notcached", "notcached\n")
            .on("echo ~", "/home/ci\n")
            .on("__build_clean.sh", "102\n")
            .on("__python_init.sh", "101\n");
        let archive = archive();

        backend(&shell)
            .run(&slurm_executor(), 9, 4, &spec(&archive))
            .await
            .unwrap();

        assert_eq!(
            shell.matching("rm -f ~/REMEX_SLURM_EXECUTOR_7/cache/3.cache").len(),
            1
        );
        assert_eq!(
            shell.uploads(),
            vec![(
                archive.path().to_path_buf(),
                "/home/ci/REMEX_SLURM_EXECUTOR_7/tasks/3/____taskarchive".to_string()
            )]
        );
        assert_eq!(
            shell.matching("tar -xf /home/ci/REMEX_SLURM_EXECUTOR_7/tasks/3/____taskarchive").len(),
            1
        );

        let init = shell.matching("__python_init.sh");
        assert!(init[0].ends_with("elasticsearch6 requests numpy dtw"));

        let clean = shell.matching("__build_clean.sh");
        assert!(clean[0].contains("--dependency=afterany:101"));
        assert!(clean[0].ends_with("~/REMEX_SLURM_EXECUTOR_7/cache/3.cache"));

        let submitted = shell.matching("--job-name=9");
        assert!(submitted[0].contains("--dependency=afterany:102"));
        assert!(submitted[0].contains("remex-build-101.out"));
    }

    #[tokio::test]
    async fn test_invalid_build_id_fails_run() {
        let shell = ScriptedShell::new();
        shell
            .on("|| echo notcached", "notcached\n")
            .on("__python_init.sh", "sbatch: error: invalid partition\n");
        let archive = archive();

        let err = backend(&shell)
            .run(&slurm_executor(), 9, 4, &spec(&archive))
            .await
            .unwrap_err();

        assert!(matches!(err, SlurmError::InvalidJobId(_)));
        assert!(shell.matching("--job-name=9").is_empty());
        assert!(shell.is_ended());
    }

    #[tokio::test]
    async fn test_status_prefers_scheduler_state() {
        let shell = ScriptedShell::new();
        shell.on("inputs/9.id", "555\n").on("squeue --job 555", "R\n");

        let state = backend(&shell).status(&slurm_executor(), 9).await;
        assert_eq!(state, Some(RemoteRunState::Running));
        assert!(shell.matching("tail -n 1").is_empty());
    }

    #[tokio::test]
    async fn test_status_falls_back_to_exit_code() {
        for (tail, expected) in [
            ("0\n", Some(RemoteRunState::Success)),
            ("1\n", Some(RemoteRunState::RunFail)),
            ("Killed\n", None),
        ] {
            let shell = ScriptedShell::new();
            shell.on("inputs/9.id", "555\n").on("tail -n 1", tail);

            let state = backend(&shell).status(&slurm_executor(), 9).await;
            assert_eq!(state, expected);
            assert_eq!(
                shell.matching("remex-run-555-9.out").len(),
                1,
                "tail {:?}",
                tail
            );
        }
    }

    #[tokio::test]
    async fn test_status_unknown_without_mapping() {
        let shell = ScriptedShell::new();
        shell.fail_on("inputs/9.id", 1, "No such file or directory");

        assert_eq!(backend(&shell).status(&slurm_executor(), 9).await, None);
        assert!(shell.matching("squeue").is_empty());
    }

    #[tokio::test]
    async fn test_status_unknown_when_unreachable() {
        let backend = SlurmBackend::new(Arc::new(FakeConnector::refusing()), &Settings::default());
        assert_eq!(backend.status(&slurm_executor(), 9).await, None);
    }

    #[tokio::test]
    async fn test_stop_without_mapping_is_noop() {
        let shell = ScriptedShell::new();
        shell.fail_on("inputs/9.id", 1, "No such file or directory");

        backend(&shell).stop(&slurm_executor(), 9).await.unwrap();
        assert!(shell.matching("scancel").is_empty());
    }

    #[tokio::test]
    async fn test_stop_cancels_mapped_job() {
        let shell = ScriptedShell::new();
        shell.on("inputs/9.id", "555\n");

        backend(&shell).stop(&slurm_executor(), 9).await.unwrap();
        assert_eq!(shell.matching("scancel 555").len(), 1);
    }

    #[tokio::test]
    async fn test_remove_run_deletes_files() {
        let shell = ScriptedShell::new();
        shell.on("cat ~/REMEX_SLURM_EXECUTOR_7/inputs/9.id", "555\n");

        backend(&shell).remove_run(&slurm_executor(), 9).await.unwrap();
        assert_eq!(
            shell
                .matching("rm -f ~/REMEX_SLURM_EXECUTOR_7/inputs/9 ~/REMEX_SLURM_EXECUTOR_7/inputs/9.id")
                .len(),
            1
        );
        assert_eq!(
            shell
                .matching("rm -f ~/REMEX_SLURM_EXECUTOR_7/outputs/remex-run-555-9.out")
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_remove_run_is_idempotent() {
        let shell = ScriptedShell::new();
        shell.fail_on("cat ~/REMEX_SLURM_EXECUTOR_7/inputs/9.id", 1, "missing");

        let backend = backend(&shell);
        backend.remove_run(&slurm_executor(), 9).await.unwrap();
        backend.remove_run(&slurm_executor(), 9).await.unwrap();
        assert!(shell.matching("remex-run-").is_empty());
    }

    #[test]
    fn test_setup_commands() {
        let shell = ScriptedShell::new();
        let credentials = ExecutorCredentials {
            ca_cert: "CA".into(),
            cert: "CERT".into(),
            key: "KEY".into(),
        };
        let commands = backend(&shell).setup_commands("/home/ci", 7, &credentials);

        assert_eq!(commands[0], "mkdir -p /home/ci/REMEX_SLURM_EXECUTOR_7");
        assert!(commands.contains(&"echo using HEAD".to_string()));
        assert!(commands.iter().any(|c| c.starts_with("git clone ")));
        assert!(
            commands.contains(&"cat > /home/ci/REMEX_SLURM_EXECUTOR_7/cert/key.pem << 'HEREDOC_EOF'\nKEY\nHEREDOC_EOF".to_string())
        );
        assert_eq!(
            commands.last().unwrap(),
            "srun /home/ci/REMEX_SLURM_EXECUTOR_7/utils/install.sh /home/ci/REMEX_SLURM_EXECUTOR_7/utils"
        );
    }

    #[tokio::test]
    async fn test_teardown_removes_tree() {
        let shell = ScriptedShell::new();
        backend(&shell).teardown(&slurm_executor()).await.unwrap();
        assert_eq!(shell.commands(), vec!["rm -rf ~/REMEX_SLURM_EXECUTOR_7".to_string()]);
    }
}
