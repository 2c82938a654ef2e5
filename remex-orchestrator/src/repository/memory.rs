//! In-memory stores used by tests

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use remex_core::domain::executor::{Executor, ExecutorStatus, ExecutorType, LOCAL_EXECUTOR_ID};
use remex_core::domain::run::{Run, RunStatus};
use remex_core::dto::executor::CreateExecutor;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use super::{ExecutorStore, GlobalStateStore, MergeOutcome, RunStore, StoreError};

#[derive(Default)]
struct TypeRow {
    state: serde_json::Value,
    locked: bool,
    log: String,
}

#[derive(Default)]
struct Inner {
    executors: BTreeMap<i64, Executor>,
    jobs: HashMap<i64, i64>,
    runs: BTreeMap<i64, Run>,
    types: HashMap<ExecutorType, TypeRow>,
    next_executor_id: i64,
}

/// One shared in-memory database implementing every store trait
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let store = Self {
            inner: Arc::new(Mutex::new(Inner {
                next_executor_id: LOCAL_EXECUTOR_ID + 1,
                ..Default::default()
            })),
        };
        store.put_executor(executor(LOCAL_EXECUTOR_ID, ExecutorType::Local, ExecutorStatus::Ready));
        store
    }

    pub fn put_executor(&self, executor: Executor) {
        let mut inner = self.inner.lock().unwrap();
        inner.next_executor_id = inner.next_executor_id.max(executor.id + 1);
        inner.executors.insert(executor.id, executor);
    }

    pub fn put_job(&self, job_id: i64, executor_id: i64) {
        self.inner.lock().unwrap().jobs.insert(job_id, executor_id);
    }

    pub fn put_run(&self, run_id: i64, job_id: i64, status: RunStatus) {
        self.inner.lock().unwrap().runs.insert(
            run_id,
            Run {
                id: run_id,
                job_id,
                status,
                output: String::new(),
                started_at: Some(Utc::now()),
                finished_at: None,
            },
        );
    }

    pub fn run(&self, run_id: i64) -> Option<Run> {
        self.inner.lock().unwrap().runs.get(&run_id).cloned()
    }

    pub fn executor(&self, id: i64) -> Option<Executor> {
        self.inner.lock().unwrap().executors.get(&id).cloned()
    }

    pub fn job_executor(&self, job_id: i64) -> Option<i64> {
        self.inner.lock().unwrap().jobs.get(&job_id).copied()
    }

    pub fn is_locked(&self, executor_type: ExecutorType) -> bool {
        self.inner
            .lock()
            .unwrap()
            .types
            .get(&executor_type)
            .is_some_and(|row| row.locked)
    }

    pub fn force_lock(&self, executor_type: ExecutorType) {
        self.inner
            .lock()
            .unwrap()
            .types
            .entry(executor_type)
            .or_default()
            .locked = true;
    }
}

/// Build an executor value for tests
pub fn executor(id: i64, executor_type: ExecutorType, status: ExecutorStatus) -> Executor {
    Executor {
        id,
        name: format!("executor-{}", id),
        description: None,
        executor_type,
        status,
        parameters: serde_json::json!({}),
        state: serde_json::Value::Null,
        log: String::new(),
        cert_serial: None,
    }
}

fn append(output: &mut String, text: Option<&str>) {
    if let Some(text) = text {
        output.push('\n');
        output.push_str(text);
    }
}

#[async_trait]
impl ExecutorStore for MemoryStore {
    async fn insert(&self, req: &CreateExecutor, status: ExecutorStatus) -> Result<Executor, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_executor_id;
        inner.next_executor_id += 1;
        let created = Executor {
            id,
            name: req.name.clone(),
            description: req.description.clone(),
            executor_type: req.executor_type,
            status,
            parameters: req.parameters.clone(),
            state: serde_json::Value::Null,
            log: String::new(),
            cert_serial: None,
        };
        inner.executors.insert(id, created.clone());
        Ok(created)
    }

    async fn find(&self, id: i64) -> Result<Option<Executor>, StoreError> {
        Ok(self.executor(id))
    }

    async fn find_for_run(&self, run_id: i64) -> Result<Option<Executor>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .runs
            .get(&run_id)
            .and_then(|run| inner.jobs.get(&run.job_id))
            .and_then(|executor_id| inner.executors.get(executor_id))
            .cloned())
    }

    async fn find_for_job(&self, job_id: i64) -> Result<Option<Executor>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .jobs
            .get(&job_id)
            .and_then(|executor_id| inner.executors.get(executor_id))
            .cloned())
    }

    async fn set_status(&self, id: i64, status: ExecutorStatus) -> Result<(), StoreError> {
        if let Some(executor) = self.inner.lock().unwrap().executors.get_mut(&id) {
            executor.status = status;
        }
        Ok(())
    }

    async fn set_state(&self, id: i64, state: &serde_json::Value) -> Result<(), StoreError> {
        if let Some(executor) = self.inner.lock().unwrap().executors.get_mut(&id) {
            executor.state = state.clone();
        }
        Ok(())
    }

    async fn set_cert_serial(&self, id: i64, serial: Option<&str>) -> Result<(), StoreError> {
        if let Some(executor) = self.inner.lock().unwrap().executors.get_mut(&id) {
            executor.cert_serial = serial.map(str::to_string);
        }
        Ok(())
    }

    async fn append_log(&self, id: i64, text: &str) -> Result<(), StoreError> {
        if let Some(executor) = self.inner.lock().unwrap().executors.get_mut(&id) {
            executor.log.push_str(text);
        }
        Ok(())
    }

    async fn rebind_jobs_to_local(&self, id: i64) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let mut count = 0;
        for executor_id in inner.jobs.values_mut() {
            if *executor_id == id {
                *executor_id = LOCAL_EXECUTOR_ID;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn delete(&self, id: i64) -> Result<bool, StoreError> {
        if id == LOCAL_EXECUTOR_ID {
            return Ok(false);
        }
        self.rebind_jobs_to_local(id).await?;
        Ok(self.inner.lock().unwrap().executors.remove(&id).is_some())
    }
}

#[async_trait]
impl RunStore for MemoryStore {
    async fn find(&self, run_id: i64) -> Result<Option<Run>, StoreError> {
        Ok(self.run(run_id))
    }

    async fn list_unfinished(&self) -> Result<Vec<Run>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .runs
            .values()
            .filter(|run| !run.status.is_terminal())
            .cloned()
            .collect())
    }

    async fn list_unfinished_for_executor(&self, executor_id: i64) -> Result<Vec<Run>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .runs
            .values()
            .filter(|run| !run.status.is_terminal())
            .filter(|run| inner.jobs.get(&run.job_id) == Some(&executor_id))
            .cloned()
            .collect())
    }

    async fn merge_status(
        &self,
        run_id: i64,
        incoming: RunStatus,
        text: Option<&str>,
        finished_at: Option<DateTime<Utc>>,
    ) -> Result<MergeOutcome, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let Some(run) = inner.runs.get_mut(&run_id) else {
            return Ok(MergeOutcome::NotFound);
        };
        let previous = run.status;
        match RunStatus::merge(previous, incoming) {
            Ok(status) => {
                run.status = status;
                append(&mut run.output, text);
                if finished_at.is_some() {
                    run.finished_at = finished_at;
                }
                Ok(MergeOutcome::Written { previous, status })
            }
            Err(conflict) => Ok(MergeOutcome::Conflict(conflict)),
        }
    }

    async fn apply_remote_result(
        &self,
        run_id: i64,
        status: RunStatus,
        text: Option<&str>,
        finished_at: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let Some(run) = inner.runs.get_mut(&run_id) else {
            return Ok(false);
        };
        run.status = status;
        append(&mut run.output, text);
        if finished_at.is_some() {
            run.finished_at = finished_at;
        }
        Ok(true)
    }

    async fn promote_scheduled(&self, run_id: i64, status: RunStatus) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.runs.get_mut(&run_id) {
            Some(run) if run.status == RunStatus::Scheduled => {
                run.status = status;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn append_output(&self, run_id: i64, text: &str) -> Result<(), StoreError> {
        if let Some(run) = self.inner.lock().unwrap().runs.get_mut(&run_id) {
            run.output.push_str(text);
        }
        Ok(())
    }

    async fn cancel(&self, run_id: i64, message: &str) -> Result<(), StoreError> {
        if let Some(run) = self.inner.lock().unwrap().runs.get_mut(&run_id) {
            run.status = RunStatus::Failed;
            run.output = message.to_string();
        }
        Ok(())
    }
}

#[async_trait]
impl GlobalStateStore for MemoryStore {
    async fn try_lock(&self, executor_type: ExecutorType) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let row = inner.types.entry(executor_type).or_default();
        if row.locked {
            return Ok(false);
        }
        row.locked = true;
        Ok(true)
    }

    async fn unlock(&self, executor_type: ExecutorType) -> Result<(), StoreError> {
        self.inner
            .lock()
            .unwrap()
            .types
            .entry(executor_type)
            .or_default()
            .locked = false;
        Ok(())
    }

    async fn unlock_all(&self) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let mut count = 0;
        for row in inner.types.values_mut() {
            if row.locked {
                row.locked = false;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn state(&self, executor_type: ExecutorType) -> Result<serde_json::Value, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .types
            .get(&executor_type)
            .map(|row| row.state.clone())
            .unwrap_or_else(|| serde_json::json!({})))
    }

    async fn set_state(
        &self,
        executor_type: ExecutorType,
        state: &serde_json::Value,
    ) -> Result<(), StoreError> {
        self.inner
            .lock()
            .unwrap()
            .types
            .entry(executor_type)
            .or_default()
            .state = state.clone();
        Ok(())
    }

    async fn append_log(&self, executor_type: ExecutorType, text: &str) -> Result<(), StoreError> {
        self.inner
            .lock()
            .unwrap()
            .types
            .entry(executor_type)
            .or_default()
            .log
            .push_str(text);
        Ok(())
    }

    async fn log(&self, executor_type: ExecutorType) -> Result<String, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .types
            .get(&executor_type)
            .map(|row| row.log.clone())
            .unwrap_or_default())
    }
}
