//! Remote path layout of a SLURM executor
//!
//! Every path is derived from database ids only, so any remote artifact can
//! be found again after an orchestrator restart.

/// Root of one executor's tree, either `~`-relative or rooted at an
/// expanded home directory (SFTP and `tar --directory` do not expand `~`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorPaths {
    root: String,
}

impl ExecutorPaths {
    pub fn new(executor_id: i64) -> Self {
        Self::rooted_at("~", executor_id)
    }

    pub fn with_home(home: &str, executor_id: i64) -> Self {
        Self::rooted_at(home.trim_end_matches('/'), executor_id)
    }

    fn rooted_at(base: &str, executor_id: i64) -> Self {
        Self {
            root: format!("{}/REMEX_SLURM_EXECUTOR_{}", base, executor_id),
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    fn join(&self, path: &str) -> String {
        format!("{}/{}", self.root, path)
    }

    pub fn cache_dir(&self) -> String {
        self.join("cache")
    }

    pub fn cert_dir(&self) -> String {
        self.join("cert")
    }

    pub fn ca_cert(&self) -> String {
        format!("{}/ca.cert", self.cert_dir())
    }

    pub fn runner_cert(&self) -> String {
        format!("{}/runner.cert", self.cert_dir())
    }

    pub fn runner_key(&self) -> String {
        format!("{}/key.pem", self.cert_dir())
    }

    pub fn outputs_dir(&self) -> String {
        self.join("outputs")
    }

    pub fn inputs_dir(&self) -> String {
        self.join("inputs")
    }

    pub fn tasks_dir(&self) -> String {
        self.join("tasks")
    }

    pub fn utils_dir(&self) -> String {
        self.join("utils")
    }

    /// Directories created when the executor is set up
    pub fn directories(&self) -> Vec<String> {
        vec![
            self.root.clone(),
            self.tasks_dir(),
            self.cert_dir(),
            self.cache_dir(),
            self.outputs_dir(),
            self.inputs_dir(),
        ]
    }

    /// `%j` is the SLURM job id, `%x` the job name (the run id)
    pub fn run_output_pattern(&self) -> String {
        format!("{}/remex-run-%j-%x.out", self.outputs_dir())
    }

    pub fn build_output_pattern(&self) -> String {
        format!("{}/remex-build-%j.out", self.outputs_dir())
    }

    pub fn build_output(&self, build_job_id: &str) -> String {
        format!("{}/remex-build-{}.out", self.outputs_dir(), build_job_id)
    }

    pub fn init_script(&self) -> String {
        format!("{}/__python_init.sh", self.utils_dir())
    }

    pub fn run_script(&self) -> String {
        format!("{}/__python_start.sh", self.utils_dir())
    }

    pub fn runner(&self) -> String {
        format!("{}/runner.py", self.utils_dir())
    }

    pub fn clean_script(&self) -> String {
        format!("{}/__build_clean.sh", self.utils_dir())
    }

    pub fn informant_script(&self) -> String {
        format!("{}/__build_fail_informant.sh", self.utils_dir())
    }

    pub fn install_script(&self) -> String {
        format!("{}/install.sh", self.utils_dir())
    }

    pub fn task(&self, task_id: i64) -> TaskPaths {
        TaskPaths {
            executor: self.clone(),
            task_id,
        }
    }

    pub fn run(&self, run_id: i64) -> RunPaths {
        RunPaths {
            executor: self.clone(),
            run_id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskPaths {
    executor: ExecutorPaths,
    task_id: i64,
}

impl TaskPaths {
    pub fn dir(&self) -> String {
        format!("{}/{}", self.executor.tasks_dir(), self.task_id)
    }

    pub fn archive(&self) -> String {
        format!("{}/____taskarchive", self.dir())
    }

    pub fn cache_record(&self) -> String {
        format!("{}/{}.cache", self.executor.cache_dir(), self.task_id)
    }
}

#[derive(Debug, Clone)]
pub struct RunPaths {
    executor: ExecutorPaths,
    run_id: i64,
}

impl RunPaths {
    pub fn input(&self) -> String {
        format!("{}/{}", self.executor.inputs_dir(), self.run_id)
    }

    /// Holds the SLURM job id of the run
    pub fn id_mapping(&self) -> String {
        format!("{}/{}.id", self.executor.inputs_dir(), self.run_id)
    }

    pub fn output(&self, slurm_job_id: &str) -> String {
        format!(
            "{}/remex-run-{}-{}.out",
            self.executor.outputs_dir(),
            slurm_job_id,
            self.run_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_executor_layout() {
        let paths = ExecutorPaths::new(4);
        assert_eq!(paths.root(), "~/REMEX_SLURM_EXECUTOR_4");
        assert_eq!(paths.cache_dir(), "~/REMEX_SLURM_EXECUTOR_4/cache");
        assert_eq!(paths.runner_key(), "~/REMEX_SLURM_EXECUTOR_4/cert/key.pem");
        assert_eq!(
            paths.run_output_pattern(),
            "~/REMEX_SLURM_EXECUTOR_4/outputs/remex-run-%j-%x.out"
        );
    }

    #[test]
    fn test_home_variant() {
        let paths = ExecutorPaths::with_home("/home/remex/", 4);
        assert_eq!(paths.root(), "/home/remex/REMEX_SLURM_EXECUTOR_4");
        assert_eq!(
            paths.task(9).archive(),
            "/home/remex/REMEX_SLURM_EXECUTOR_4/tasks/9/____taskarchive"
        );
    }

    #[test]
    fn test_task_and_run_paths() {
        let paths = ExecutorPaths::new(2);
        assert_eq!(paths.task(5).dir(), "~/REMEX_SLURM_EXECUTOR_2/tasks/5");
        assert_eq!(paths.task(5).cache_record(), "~/REMEX_SLURM_EXECUTOR_2/cache/5.cache");

        let run = paths.run(17);
        assert_eq!(run.input(), "~/REMEX_SLURM_EXECUTOR_2/inputs/17");
        assert_eq!(run.id_mapping(), "~/REMEX_SLURM_EXECUTOR_2/inputs/17.id");
        assert_eq!(
            run.output("3301"),
            "~/REMEX_SLURM_EXECUTOR_2/outputs/remex-run-3301-17.out"
        );
    }

    #[test]
    fn test_run_paths_do_not_collide() {
        let paths = ExecutorPaths::new(2);
        assert_ne!(paths.run(1).input(), paths.run(11).input());
        assert_ne!(paths.run(1).id_mapping(), paths.run(1).input());
    }
}
