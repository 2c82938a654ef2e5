use anyhow::Context as _;
use remex_client::{AgentClient, TlsMaterial};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub mod api;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod events;
pub mod identity;
pub mod pool;
pub mod repository;
pub mod service;
pub mod slurm;
pub mod ssh;

use config::Settings;
use dispatch::{AgentHandler, Dispatch, SlurmHandler};
use events::{RunEventBus, RunManagerConfig};
use identity::ScriptCertificateAuthority;
use pool::{PeerBootstrap, SshPool};
use repository::{
    ExecutorStore, GlobalStateStore, RunStore,
    executor::PgExecutorStore,
    global_state::PgGlobalStateStore,
    run::PgRunStore,
};
use service::lifecycle::Backends;
use service::permissions::GrantedPermissions;
use service::requests::DocumentStoreRequests;
use service::{ExecutorLifecycle, GlobalTypeService, Reconciler, RemotePushService, RunService};
use slurm::SlurmBackend;
use ssh::RusshConnector;

async fn read_tls(settings: &Settings) -> anyhow::Result<TlsMaterial> {
    let read = |path: &std::path::Path| {
        let path = path.to_path_buf();
        async move {
            tokio::fs::read(&path)
                .await
                .with_context(|| format!("cannot read {}", path.display()))
        }
    };
    Ok(TlsMaterial {
        ca_cert: read(&settings.ca_cert_path).await?,
        client_cert: read(&settings.client_cert_path).await?,
        client_key: read(&settings.client_key_path).await?,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "remex_orchestrator=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Remex Orchestrator...");

    let settings = Settings::from_env()?;

    tracing::info!("Connecting to database...");
    let pool = db::create_pool(&settings.database_url)
        .await
        .context("Failed to create database pool")?;
    db::run_migrations(&pool)
        .await
        .context("Failed to run database migrations")?;

    let executors: Arc<dyn ExecutorStore> = Arc::new(PgExecutorStore::new(pool.clone()));
    let runs: Arc<dyn RunStore> = Arc::new(PgRunStore::new(pool.clone()));
    let global: Arc<dyn GlobalStateStore> = Arc::new(PgGlobalStateStore::new(pool));

    // A crashed process may have left a type locked
    let unlocked = global.unlock_all().await?;
    if unlocked > 0 {
        tracing::warn!("Cleared {} stale global state locks", unlocked);
    }

    let tls = read_tls(&settings).await?;
    let agent = AgentClient::new(&tls, settings.agent_timeout)?;
    let connector = Arc::new(RusshConnector::default());
    let slurm = Arc::new(SlurmBackend::new(connector.clone(), &settings));
    let dispatch = Arc::new(Dispatch::new(
        Arc::new(AgentHandler::new(agent)),
        Arc::new(SlurmHandler::new(slurm.clone())),
    ));

    let bus = Arc::new(RunEventBus::new());
    let requests = Arc::new(DocumentStoreRequests::new(&settings.es_url)?);
    let permissions = Arc::new(GrantedPermissions);
    let certs = Arc::new(ScriptCertificateAuthority::new(
        &settings.executor_cert_dir,
        &settings.ca_cert_path,
    ));

    let report = Reconciler::new(executors.clone(), runs.clone(), dispatch.clone())
        .reconcile()
        .await?;
    tracing::info!("Startup reconciliation: {:?}", report);

    let backends = Backends {
        slurm,
        remote_pool: Arc::new(SshPool::new(PeerBootstrap::new(connector, &settings))),
        oci: None,
    };

    let state = api::AppState {
        remote: Arc::new(RemotePushService::new(
            executors.clone(),
            runs.clone(),
            dispatch.clone(),
            bus.clone(),
            requests.clone(),
        )),
        lifecycle: Arc::new(ExecutorLifecycle::new(
            executors.clone(),
            runs.clone(),
            certs,
            dispatch.clone(),
            bus.clone(),
            backends,
            permissions.clone(),
        )),
        global_types: Arc::new(GlobalTypeService::new(global, permissions.clone())),
        runs: Arc::new(RunService::new(
            executors,
            runs,
            dispatch,
            bus,
            requests,
            permissions,
            RunManagerConfig::from_settings(&settings),
        )),
    };

    // Build router with all API endpoints
    let app = api::create_router(state);

    tracing::info!("Listening on {}", settings.bind_addr);
    let listener = tokio::net::TcpListener::bind(&settings.bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", settings.bind_addr))?;

    axum::serve(listener, app).await.context("Server failed")?;
    Ok(())
}
