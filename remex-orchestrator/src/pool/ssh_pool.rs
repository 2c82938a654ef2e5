//! Pools of existing machines
//!
//! The peers are given by the executor parameters and reached over SSH; the
//! first one is the master. Nothing is allocated, so teardown only removes
//! the installed software.

use async_trait::async_trait;
use futures_util::future::join_all;
use remex_core::domain::executor::RemotePoolParams;
use remex_core::domain::pool::PoolState;

use super::bootstrap::{PeerBootstrap, PeerSpec};
use super::{PoolBackend, PoolError};

pub struct SshPool {
    bootstrap: PeerBootstrap,
}

impl SshPool {
    pub fn new(bootstrap: PeerBootstrap) -> Self {
        Self { bootstrap }
    }

    async fn provision(&self, params: &RemotePoolParams, pool: &mut PoolState) -> Result<(), PoolError> {
        let peers = peer_specs(params);
        let Some(master) = peers.first() else {
            return Err(PoolError::Parameters("a pool needs at least one peer".to_string()));
        };

        pool.subnet_mask = Some(params.subnet_mask.clone());
        pool.master_instance_id = Some(master.host.clone());
        pool.master_instance_subnet_ip = Some(master.private_ip.clone());
        pool.pool_instance_ids = peers.iter().map(|peer| peer.host.clone()).collect();

        let installs = peers.iter().enumerate().map(|(index, peer)| {
            let master_subnet = (index == 0).then_some(params.subnet_mask.as_str());
            self.bootstrap.install(peer, &master.private_ip, master_subnet)
        });
        for result in join_all(installs).await {
            result?;
        }

        pool.master_instance_ip = Some(master.host.clone());
        Ok(())
    }

    async fn uninstall_all(&self, params: &serde_json::Value) -> Result<(), PoolError> {
        let params = pool_params(params)?;
        let peers = peer_specs(&params);
        let results = join_all(peers.iter().map(|peer| self.bootstrap.uninstall(peer))).await;

        let mut first_error = None;
        for (peer, result) in peers.iter().zip(results) {
            if let Err(err) = result {
                tracing::error!("Cannot clean up pool peer {}: {}", peer.host, err);
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

fn pool_params(params: &serde_json::Value) -> Result<RemotePoolParams, PoolError> {
    serde_json::from_value(params.clone()).map_err(|e| PoolError::Parameters(e.to_string()))
}

fn peer_specs(params: &RemotePoolParams) -> Vec<PeerSpec> {
    params
        .peers
        .iter()
        .map(|peer| PeerSpec {
            host: peer.host.clone(),
            ssh_port: params.ssh_port,
            user: params.username.clone(),
            private_ip: peer.private_ip.clone(),
        })
        .collect()
}

#[async_trait]
impl PoolBackend for SshPool {
    async fn create_pool(&self, executor_id: i64, params: &serde_json::Value) -> PoolState {
        let mut pool = PoolState::default();
        let result = match pool_params(params) {
            Ok(params) => self.provision(&params, &mut pool).await,
            Err(err) => Err(err),
        };
        if let Err(err) = result {
            tracing::error!("Pool of executor {} not provisioned: {}", executor_id, err);
            pool.error = Some(err.to_string());
        }
        pool
    }

    async fn shutdown_pool(
        &self,
        _executor_id: i64,
        params: &serde_json::Value,
        _state: &PoolState,
    ) -> Result<(), PoolError> {
        self.uninstall_all(params).await
    }

    async fn kill_pool_forced(&self, executor_id: i64, params: &serde_json::Value, _state: &PoolState) {
        if let Err(err) = self.uninstall_all(params).await {
            tracing::warn!("Forced cleanup of pool {} incomplete: {}", executor_id, err);
        }
    }
}
