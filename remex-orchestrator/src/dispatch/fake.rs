//! Recording handler for tests

use async_trait::async_trait;
use remex_core::domain::executor::Executor;
use remex_core::dto::agent::{RemoteRunStatus, RunSpec};
use std::collections::HashMap;
use std::sync::Mutex;

use super::{DispatchError, ExecutorHandler};

/// Records `"{op} {executorId}/{runId}"` for every call and answers status
/// lookups from a fixed table
#[derive(Default)]
pub struct FakeHandler {
    calls: Mutex<Vec<String>>,
    statuses: Mutex<HashMap<i64, RemoteRunStatus>>,
    silent_on_stop: bool,
    fail_status: bool,
    fail_stop: bool,
}

impl FakeHandler {
    /// A handler that never reports the outcome of a stop
    pub fn silent_on_stop() -> Self {
        Self {
            silent_on_stop: true,
            ..Self::default()
        }
    }

    /// A handler whose status lookups fail
    pub fn unreachable() -> Self {
        Self {
            fail_status: true,
            ..Self::default()
        }
    }

    pub fn failing_stop() -> Self {
        Self {
            fail_stop: true,
            ..Self::default()
        }
    }

    pub fn with_status(self, run_id: i64, status: RemoteRunStatus) -> Self {
        self.statuses.lock().unwrap().insert(run_id, status);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, op: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| call.split(' ').next() == Some(op))
            .count()
    }

    fn record(&self, op: &str, executor: &Executor, run_id: i64) {
        self.calls
            .lock()
            .unwrap()
            .push(format!("{} {}/{}", op, executor.id, run_id));
    }
}

#[async_trait]
impl ExecutorHandler for FakeHandler {
    async fn run(
        &self,
        executor: &Executor,
        run_id: i64,
        _job_id: i64,
        _spec: &RunSpec,
    ) -> Result<(), DispatchError> {
        self.record("run", executor, run_id);
        Ok(())
    }

    async fn stop(&self, executor: &Executor, run_id: i64) -> Result<(), DispatchError> {
        self.record("stop", executor, run_id);
        if self.fail_stop {
            return Err(DispatchError::Configuration("unreachable".into()));
        }
        Ok(())
    }

    async fn status(
        &self,
        executor: &Executor,
        run_id: i64,
    ) -> Result<Option<RemoteRunStatus>, DispatchError> {
        self.record("status", executor, run_id);
        if self.fail_status {
            return Err(DispatchError::Configuration("unreachable".into()));
        }
        Ok(self.statuses.lock().unwrap().get(&run_id).cloned())
    }

    async fn remove_run(&self, executor: &Executor, run_id: i64) -> Result<(), DispatchError> {
        self.record("remove", executor, run_id);
        Ok(())
    }

    fn acknowledges_stop(&self) -> bool {
        !self.silent_on_stop
    }
}
