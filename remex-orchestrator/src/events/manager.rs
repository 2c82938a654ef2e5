//! Run Manager
//!
//! One manager per active run. Streamed output is buffered and flushed on a
//! fixed cadence, both to the run row and downstream, until the per-run byte
//! cap is hit. Terminal callbacks flush, stop the access-token refresh loop,
//! persist the final status and announce the end of the run exactly once.

use chrono::Utc;
use remex_core::domain::run::RunStatus;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;

use super::{RunEvent, RunEventBus, RunEventKind, RunNotice};
use crate::config::Settings;
use crate::repository::{MergeOutcome, RunStore};
use crate::service::requests::{JobRequestHandler, handle_request};

pub const MAX_OUTPUT_MARKER: &str = "INFO: max output capacity reached";

#[derive(Debug, Clone)]
pub struct RunManagerConfig {
    pub max_output_bytes: usize,
    pub print_limit_reached_message: bool,
    pub flush_interval: Duration,
    pub token_refresh_interval: Duration,
}

impl RunManagerConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_output_bytes: settings.max_run_output_bytes,
            print_limit_reached_message: settings.print_limit_reached_message,
            flush_interval: settings.output_flush_interval,
            token_refresh_interval: settings.token_refresh_interval,
        }
    }
}

#[derive(Default)]
struct OutputState {
    buffer: Vec<String>,
    bytes: usize,
    limit_reached: bool,
    flush_pending: bool,
}

enum FlushAction {
    Nothing,
    Now,
    Later,
}

pub struct RunManager {
    run_id: i64,
    job_id: i64,
    runs: Arc<dyn RunStore>,
    bus: Arc<RunEventBus>,
    requests: Arc<dyn JobRequestHandler>,
    config: RunManagerConfig,
    output: Mutex<OutputState>,
    flush_lock: tokio::sync::Mutex<()>,
    token_refresh: Mutex<Option<JoinHandle<()>>>,
    finished: AtomicBool,
}

impl RunManager {
    pub fn new(
        run_id: i64,
        job_id: i64,
        runs: Arc<dyn RunStore>,
        bus: Arc<RunEventBus>,
        requests: Arc<dyn JobRequestHandler>,
        config: RunManagerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            run_id,
            job_id,
            runs,
            bus,
            requests,
            config,
            output: Mutex::new(OutputState::default()),
            flush_lock: tokio::sync::Mutex::new(()),
            token_refresh: Mutex::new(None),
            finished: AtomicBool::new(false),
        })
    }

    /// Register the run on the bus and consume its events until it finishes
    pub fn start(self: &Arc<Self>, access_token: Option<String>) -> JoinHandle<()> {
        let mut events = self.bus.register(self.run_id);
        if let Some(token) = access_token {
            self.start_token_refresh(token);
        }

        let manager = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    RunEvent::Output(text) => manager.on_output(text),
                    RunEvent::Request { payload, reply } => {
                        let answer = handle_request(manager.requests.as_ref(), manager.job_id, &payload).await;
                        let _ = reply.send(answer);
                    }
                    RunEvent::Success { state } => {
                        manager.on_run_success(state).await;
                        break;
                    }
                    RunEvent::Fail { message } => {
                        manager.on_run_fail(&message).await;
                        break;
                    }
                }
            }
            tracing::debug!("Run {} event loop ended", manager.run_id);
        })
    }

    pub fn run_id(&self) -> i64 {
        self.run_id
    }

    /// Handle one event pushed by the executing job; requests are answered
    pub async fn on_run_event(self: &Arc<Self>, kind: RunEventKind, data: &Value) -> Option<Value> {
        match kind {
            RunEventKind::Output => {
                let text = match data {
                    Value::String(text) => text.clone(),
                    Value::Null => return None,
                    other => other.to_string(),
                };
                self.on_output(text);
                None
            }
            RunEventKind::Request => {
                let payload = match data {
                    Value::String(payload) => payload.clone(),
                    Value::Null => String::new(),
                    other => other.to_string(),
                };
                Some(handle_request(self.requests.as_ref(), self.job_id, &payload).await)
            }
            other => {
                tracing::info!("Job {} run {}: unknown event {}", self.job_id, self.run_id, other);
                None
            }
        }
    }

    fn output_state(&self) -> MutexGuard<'_, OutputState> {
        self.output.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn on_output(self: &Arc<Self>, text: String) {
        let action = {
            let mut output = self.output_state();
            if output.limit_reached {
                return;
            }

            output.bytes += text.len();
            if output.bytes >= self.config.max_output_bytes {
                output.limit_reached = true;
                tracing::info!("Run {} reached the output limit", self.run_id);
                if !self.config.print_limit_reached_message {
                    return;
                }
                output.buffer.push(MAX_OUTPUT_MARKER.to_string());
                if output.flush_pending {
                    FlushAction::Nothing
                } else {
                    FlushAction::Now
                }
            } else {
                output.buffer.push(text);
                if output.flush_pending {
                    FlushAction::Nothing
                } else {
                    output.flush_pending = true;
                    FlushAction::Later
                }
            }
        };

        match action {
            FlushAction::Nothing => {}
            FlushAction::Now => {
                let manager = self.clone();
                tokio::spawn(async move { manager.flush().await });
            }
            FlushAction::Later => {
                let manager = self.clone();
                let interval = self.config.flush_interval;
                tokio::spawn(async move {
                    tokio::time::sleep(interval).await;
                    manager.flush().await;
                });
            }
        }
    }

    async fn flush(&self) {
        let _serial = self.flush_lock.lock().await;
        let text: String = {
            let mut output = self.output_state();
            output.flush_pending = false;
            if output.buffer.is_empty() {
                return;
            }
            output.buffer.drain(..).collect()
        };

        self.bus.notify(RunNotice::Output {
            run_id: self.run_id,
            text: text.clone(),
        });
        if let Err(err) = self.runs.append_output(self.run_id, &text).await {
            tracing::error!("Output handling for run {} failed: {}", self.run_id, err);
        }
    }

    fn start_token_refresh(&self, access_token: String) {
        let bus = self.bus.clone();
        let (run_id, job_id) = (self.run_id, self.job_id);
        let interval = self.config.token_refresh_interval;

        let handle = tokio::spawn(async move {
            loop {
                bus.notify(RunNotice::TokenRefresh {
                    run_id,
                    job_id,
                    access_token: access_token.clone(),
                });
                tokio::time::sleep(interval).await;
            }
        });

        if let Some(previous) = self.token_slot().replace(handle) {
            previous.abort();
        }
    }

    fn token_slot(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.token_refresh.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn cancel_token_refresh(&self) {
        if let Some(handle) = self.token_slot().take() {
            handle.abort();
        }
    }

    pub async fn on_run_success(&self, state: Option<Value>) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        self.flush().await;
        self.cancel_token_refresh();

        if let Some(state) = state.filter(|state| !state.is_null()) {
            if let Err(err) = self.requests.store_state(self.job_id, &state).await {
                tracing::error!("Cannot store state of job {}: {}", self.job_id, err);
            }
        }
        self.finalize(RunStatus::Success, None).await;
    }

    pub async fn on_run_fail(&self, message: &str) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        self.flush().await;
        self.cancel_token_refresh();

        let message = Some(message).filter(|message| !message.is_empty());
        self.finalize(RunStatus::Failed, message).await;
    }

    /// Merge the final status into the stored one. The end of the run is
    /// announced only when this merge is the one that made it terminal.
    async fn finalize(&self, status: RunStatus, message: Option<&str>) {
        let outcome = self
            .runs
            .merge_status(self.run_id, status, message, Some(Utc::now()))
            .await;

        match outcome {
            Ok(written @ MergeOutcome::Written { status, .. }) if written.entered_terminal() => {
                tracing::info!("Run {} of job {} finished: {}", self.run_id, self.job_id, status);
                self.bus.notify(RunNotice::Finished {
                    run_id: self.run_id,
                    status,
                });
            }
            Ok(MergeOutcome::Written { previous, .. }) => {
                tracing::debug!("Run {} already {}, nothing to announce", self.run_id, previous);
            }
            Ok(MergeOutcome::Conflict(conflict)) => {
                tracing::error!("Cannot finalize run {}: {}", self.run_id, conflict);
            }
            Ok(MergeOutcome::NotFound) => {
                tracing::warn!("Run {} vanished before it finished", self.run_id);
            }
            Err(err) => {
                tracing::error!("Cannot finalize run {}: {}", self.run_id, err);
            }
        }
        self.bus.unregister(self.run_id);
    }
}

impl Drop for RunManager {
    fn drop(&mut self) {
        self.cancel_token_refresh();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::memory::MemoryStore;
    use crate::service::requests::fake::RecordingRequests;
    use serde_json::json;
    use tokio::sync::broadcast;

    struct Fixture {
        store: MemoryStore,
        bus: Arc<RunEventBus>,
        requests: Arc<RecordingRequests>,
        notices: broadcast::Receiver<RunNotice>,
    }

    fn fixture() -> Fixture {
        let store = MemoryStore::new();
        store.put_job(4, 1);
        store.put_run(9, 4, RunStatus::Running);
        let bus = Arc::new(RunEventBus::new());
        let notices = bus.subscribe();
        Fixture {
            store,
            bus,
            requests: Arc::new(RecordingRequests::default()),
            notices,
        }
    }

    fn config(max_output_bytes: usize) -> RunManagerConfig {
        RunManagerConfig {
            max_output_bytes,
            print_limit_reached_message: true,
            flush_interval: Duration::from_secs(1),
            token_refresh_interval: Duration::from_secs(30),
        }
    }

    fn manager(f: &Fixture, max_output_bytes: usize) -> Arc<RunManager> {
        RunManager::new(
            9,
            4,
            Arc::new(f.store.clone()),
            f.bus.clone(),
            f.requests.clone(),
            config(max_output_bytes),
        )
    }

    fn drain(notices: &mut broadcast::Receiver<RunNotice>) -> Vec<RunNotice> {
        let mut seen = Vec::new();
        while let Ok(notice) = notices.try_recv() {
            seen.push(notice);
        }
        seen
    }

    #[tokio::test(start_paused = true)]
    async fn test_output_flushed_on_cadence() {
        let mut f = fixture();
        let manager = manager(&f, 1_000);

        manager.on_run_event(RunEventKind::Output, &json!("a")).await;
        manager.on_run_event(RunEventKind::Output, &json!("b")).await;
        tokio::task::yield_now().await;
        assert_eq!(f.store.run(9).unwrap().output, "");

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(f.store.run(9).unwrap().output, "ab");
        assert_eq!(
            drain(&mut f.notices),
            vec![RunNotice::Output {
                run_id: 9,
                text: "ab".into()
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_output_cap_records_single_marker() {
        let f = fixture();
        let manager = manager(&f, 10);

        for chunk in ["12345", "67890", "more", "even more"] {
            manager.on_run_event(RunEventKind::Output, &json!(chunk)).await;
        }
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(
            f.store.run(9).unwrap().output,
            format!("12345{}", MAX_OUTPUT_MARKER)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cap_without_marker() {
        let f = fixture();
        let manager = RunManager::new(
            9,
            4,
            Arc::new(f.store.clone()),
            f.bus.clone(),
            f.requests.clone(),
            RunManagerConfig {
                print_limit_reached_message: false,
                ..config(4)
            },
        );

        manager.on_run_event(RunEventKind::Output, &json!("abc")).await;
        manager.on_run_event(RunEventKind::Output, &json!("def")).await;
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(f.store.run(9).unwrap().output, "abc");
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_flushes_and_finishes_once() {
        let mut f = fixture();
        let manager = manager(&f, 1_000);
        let events = manager.start(None);

        assert!(f.bus.publish(9, RunEvent::Output("partial".into())));
        assert!(f.bus.publish(
            9,
            RunEvent::Success {
                state: Some(json!({ "step": 2 }))
            }
        ));
        events.await.unwrap();
        manager.on_run_success(None).await;

        let run = f.store.run(9).unwrap();
        assert_eq!(run.status, RunStatus::Success);
        assert_eq!(run.output, "partial");
        assert!(run.finished_at.is_some());
        assert_eq!(*f.requests.states.lock().unwrap(), vec![(4, json!({ "step": 2 }))]);
        assert!(!f.bus.is_registered(9));

        let finished: Vec<_> = drain(&mut f.notices)
            .into_iter()
            .filter(|n| matches!(n, RunNotice::Finished { .. }))
            .collect();
        assert_eq!(
            finished,
            vec![RunNotice::Finished {
                run_id: 9,
                status: RunStatus::Success
            }]
        );
    }

    #[tokio::test]
    async fn test_fail_appends_message() {
        let f = fixture();
        let manager = manager(&f, 1_000);

        manager.on_run_fail("exit code 3").await;
        manager.on_run_fail("again").await;

        let run = f.store.run(9).unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.output, "\nexit code 3");
    }

    #[tokio::test]
    async fn test_late_fail_keeps_stored_success() {
        let mut f = fixture();
        let manager = manager(&f, 1_000);
        let _events = manager.start(None);
        f.store
            .merge_status(9, RunStatus::Success, Some("done"), Some(Utc::now()))
            .await
            .unwrap();

        manager.on_run_fail("late fail event").await;

        let run = f.store.run(9).unwrap();
        assert_eq!(run.status, RunStatus::Success);
        assert_eq!(run.output, "\ndone");
        assert!(!f.bus.is_registered(9));
        assert!(
            drain(&mut f.notices)
                .iter()
                .all(|n| !matches!(n, RunNotice::Finished { .. }))
        );
    }

    #[tokio::test]
    async fn test_repeated_terminal_status_not_announced_twice() {
        let mut f = fixture();
        let manager = manager(&f, 1_000);
        f.store
            .merge_status(9, RunStatus::Success, None, Some(Utc::now()))
            .await
            .unwrap();

        manager.on_run_success(None).await;

        assert_eq!(f.store.run(9).unwrap().status, RunStatus::Success);
        assert!(drain(&mut f.notices).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_refresh_until_finished() {
        let mut f = fixture();
        let manager = manager(&f, 1_000);
        let _events = manager.start(Some("tok".into()));

        tokio::time::sleep(Duration::from_secs(65)).await;
        let refreshes = drain(&mut f.notices)
            .into_iter()
            .filter(|n| matches!(n, RunNotice::TokenRefresh { .. }))
            .count();
        assert_eq!(refreshes, 3);

        manager.on_run_success(None).await;
        drain(&mut f.notices);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(
            drain(&mut f.notices)
                .iter()
                .all(|n| !matches!(n, RunNotice::TokenRefresh { .. }))
        );
    }

    #[tokio::test]
    async fn test_request_answered_through_bus() {
        let f = fixture();
        let manager = manager(&f, 1_000);
        let _events = manager.start(None);

        let answer = f
            .bus
            .request(9, r#"{"id": 1, "type": "store_state", "state": {"x": 1}}"#.into())
            .await;
        assert_eq!(answer, Some(json!({ "id": 1 })));
    }
}
