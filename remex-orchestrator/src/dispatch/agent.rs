//! Remote agent handler
//!
//! Single agents are addressed directly; pools are reached through the
//! proxy on their master under `/rps`.

use async_trait::async_trait;
use remex_client::AgentClient;
use remex_core::domain::executor::{AgentParams, Executor, ExecutorType, RemotePoolParams};
use remex_core::domain::pool::PoolState;
use remex_core::dto::agent::{AgentRunRequest, RemoteRunStatus, RunSpec};

use super::{DispatchError, ExecutorHandler};
use crate::pool::bootstrap::PROXY_PUBLIC_PORT;

/// Base URL of the agent serving `executor`
pub fn agent_base_url(executor: &Executor) -> Result<String, DispatchError> {
    let config = |e: serde_json::Error| DispatchError::Configuration(e.to_string());

    match executor.executor_type {
        ExecutorType::RemoteRunnerAgent => {
            let params: AgentParams = executor.params().map_err(config)?;
            Ok(format!("https://{}:{}", params.hostname, params.port))
        }
        ExecutorType::RemotePool => {
            let params: RemotePoolParams = executor.params().map_err(config)?;
            Ok(format!("https://{}:{}/rps", pool_master(executor)?, params.port))
        }
        ExecutorType::OciBasic => Ok(format!(
            "https://{}:{}/rps",
            pool_master(executor)?,
            PROXY_PUBLIC_PORT
        )),
        ExecutorType::Local | ExecutorType::SlurmPool => {
            Err(DispatchError::NotRemote(executor.executor_type))
        }
    }
}

fn pool_master(executor: &Executor) -> Result<String, DispatchError> {
    let state: PoolState = serde_json::from_value(executor.state.clone())
        .map_err(|e| DispatchError::Configuration(format!("pool state: {}", e)))?;
    state.master_instance_ip.ok_or_else(|| {
        DispatchError::Configuration(format!("pool of executor {} has no master", executor.id))
    })
}

pub struct AgentHandler {
    client: AgentClient,
}

impl AgentHandler {
    pub fn new(client: AgentClient) -> Self {
        Self { client }
    }

    async fn run_at(
        &self,
        base_url: &str,
        run_id: i64,
        job_id: i64,
        spec: &RunSpec,
    ) -> Result<(), DispatchError> {
        let archive = tokio::fs::read(&spec.task.archive_path).await?;
        let request = AgentRunRequest::new(run_id, job_id, spec, archive);
        self.client.start_run(base_url, &request).await?;
        Ok(())
    }

    async fn status_at(&self, base_url: &str, run_id: i64) -> Result<Option<RemoteRunStatus>, DispatchError> {
        match self.client.run_status(base_url, run_id).await {
            Ok(status) => Ok(Some(status)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn remove_at(&self, base_url: &str, run_id: i64) -> Result<(), DispatchError> {
        match self.client.remove_run(base_url, run_id).await {
            Err(err) if !err.is_not_found() => Err(err.into()),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl ExecutorHandler for AgentHandler {
    async fn run(
        &self,
        executor: &Executor,
        run_id: i64,
        job_id: i64,
        spec: &RunSpec,
    ) -> Result<(), DispatchError> {
        let base_url = agent_base_url(executor)?;
        tracing::info!("Dispatching run {} to executor {} at {}", run_id, executor.id, base_url);
        self.run_at(&base_url, run_id, job_id, spec).await
    }

    async fn stop(&self, executor: &Executor, run_id: i64) -> Result<(), DispatchError> {
        let base_url = agent_base_url(executor)?;
        self.client.stop_run(&base_url, run_id).await?;
        Ok(())
    }

    async fn status(
        &self,
        executor: &Executor,
        run_id: i64,
    ) -> Result<Option<RemoteRunStatus>, DispatchError> {
        self.status_at(&agent_base_url(executor)?, run_id).await
    }

    async fn remove_run(&self, executor: &Executor, run_id: i64) -> Result<(), DispatchError> {
        self.remove_at(&agent_base_url(executor)?, run_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::memory::executor;
    use axum::{
        Json, Router,
        extract::Path,
        http::StatusCode,
        routing::{get, post},
    };
    use remex_core::domain::executor::ExecutorStatus;
    use remex_core::domain::run::RemoteRunState;
    use remex_core::domain::task::{PythonSubtype, TaskInfo, TaskType};
    use serde_json::{Value, json};
    use std::io::Write;
    use std::sync::{Arc, Mutex};

    fn with(executor_type: ExecutorType, parameters: Value, state: Value) -> Executor {
        Executor {
            parameters,
            state,
            ..executor(4, executor_type, ExecutorStatus::Ready)
        }
    }

    #[test]
    fn test_base_url_per_type() {
        let agent = with(
            ExecutorType::RemoteRunnerAgent,
            json!({ "hostname": "agent.example.org", "port": 8080 }),
            Value::Null,
        );
        assert_eq!(agent_base_url(&agent).unwrap(), "https://agent.example.org:8080");

        let pool = with(
            ExecutorType::RemotePool,
            json!({
                "peers": [{ "host": "198.51.100.1", "privateIp": "10.1.0.1" }],
                "username": "remex",
                "subnetMask": "10.1.0.0/24",
                "port": 9443
            }),
            json!({ "masterInstanceIp": "198.51.100.1", "poolInstanceIds": [] }),
        );
        assert_eq!(agent_base_url(&pool).unwrap(), "https://198.51.100.1:9443/rps");

        let oci = with(
            ExecutorType::OciBasic,
            json!({ "size": 1, "shape": "s" }),
            json!({ "masterInstanceIp": "203.0.113.10", "poolInstanceIds": [] }),
        );
        assert_eq!(agent_base_url(&oci).unwrap(), "https://203.0.113.10:10443/rps");
    }

    #[test]
    fn test_base_url_errors() {
        let unprovisioned = with(ExecutorType::OciBasic, json!({}), Value::Null);
        assert!(matches!(
            agent_base_url(&unprovisioned),
            Err(DispatchError::Configuration(_))
        ));
        let slurm = with(ExecutorType::SlurmPool, json!({}), Value::Null);
        assert!(matches!(agent_base_url(&slurm), Err(DispatchError::NotRemote(_))));
    }

    #[tokio::test]
    async fn test_agent_round_trip() {
        let started: Arc<Mutex<Vec<Value>>> = Arc::default();
        let sink = started.clone();
        let app = Router::new()
            .route(
                "/run/{id}",
                post(move |Json(body): Json<Value>| {
                    let sink = sink.clone();
                    async move {
                        sink.lock().unwrap().push(body);
                        StatusCode::OK
                    }
                })
                .get(|Path(id): Path<i64>| async move {
                    if id == 5 {
                        Ok(Json(json!({ "status": 0, "output": "done", "finished_at": 1704067200000i64 })))
                    } else {
                        Err(StatusCode::NOT_FOUND)
                    }
                })
                .delete(|| async { StatusCode::NOT_FOUND }),
            )
            .route("/health", get(|| async { "ok" }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let mut archive = tempfile::NamedTempFile::new().unwrap();
        archive.write_all(b"tar").unwrap();
        let spec = RunSpec {
            task: TaskInfo {
                task_id: 2,
                task_type: TaskType::Python,
                subtype: PythonSubtype::Numpy,
                archive_path: archive.path().to_path_buf(),
            },
            params: json!({ "window": 3 }),
            entities: json!({}),
            owned: json!({}),
            access_token: None,
            state: Value::Null,
        };

        let handler = AgentHandler::new(AgentClient::with_client(reqwest::Client::new()));
        handler.run_at(&base, 5, 9, &spec).await.unwrap();
        let body = started.lock().unwrap()[0].clone();
        assert_eq!(body["runId"], 5);
        assert_eq!(body["jobId"], 9);
        assert_eq!(body["codeArchive"]["data"], json!([116, 97, 114]));

        let status = handler.status_at(&base, 5).await.unwrap().unwrap();
        assert_eq!(status.status, RemoteRunState::Success);
        assert!(handler.status_at(&base, 6).await.unwrap().is_none());

        handler.remove_at(&base, 5).await.unwrap();
    }
}
