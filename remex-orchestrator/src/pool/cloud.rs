//! Cloud pools
//!
//! The provider's network (VCN, gateway, route table, security list) is
//! shared by every pool of the type and recorded in the type's global state.
//! Each pool then gets its own subnet from a reserved address range and
//! `size` peers launched in parallel; the first peer is the master.

use async_trait::async_trait;
use futures_util::future::join_all;
use remex_core::domain::executor::{ExecutorType, OciParams};
use remex_core::domain::pool::{PoolGlobalState, PoolState};
use std::sync::Arc;

use super::allocator::{IpAllocator, VCN_CIDR, parse_subnet_mask, subnet_mask};
use super::bootstrap::{INGRESS_PORTS, PeerBootstrap, PeerSpec};
use super::{PoolBackend, PoolError};
use crate::repository::{GlobalStateStore, log_line};
use crate::service::lease::TypeLease;

/// Login of the provider's stock peer image
pub const PEER_USER: &str = "opc";
pub const PEER_SSH_PORT: u16 = 22;

pub fn peer_name(executor_id: i64, index: usize) -> String {
    format!("REMEX-PEER-ex{}-{}", executor_id, index)
}

pub fn subnet_name(executor_id: i64) -> String {
    format!("REMEX-executor-{}-subnet", executor_id)
}

/// Provider network shared by every pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Network {
    pub vcn: String,
    pub route_table: String,
    pub gateway: String,
    pub security_list: String,
}

impl Network {
    fn from_state(state: &PoolGlobalState) -> Option<Self> {
        Some(Self {
            vcn: state.vcn.clone()?,
            route_table: state.route_table.clone()?,
            gateway: state.gateway.clone()?,
            security_list: state.security_list.clone()?,
        })
    }

    fn store_in(&self, state: &mut PoolGlobalState) {
        state.vcn = Some(self.vcn.clone());
        state.route_table = Some(self.route_table.clone());
        state.gateway = Some(self.gateway.clone());
        state.security_list = Some(self.security_list.clone());
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRequest {
    pub name: String,
    pub subnet_id: String,
    pub shape: String,
    pub ocpus: Option<u32>,
    pub memory_gb: Option<u32>,
}

impl InstanceRequest {
    /// Flexible shapes need an explicit size, one OCPU and 1 GB unless given
    pub fn new(name: String, subnet_id: &str, params: &OciParams) -> Self {
        let flexible = params.shape.to_lowercase().contains("flex");
        Self {
            name,
            subnet_id: subnet_id.to_string(),
            shape: params.shape.clone(),
            ocpus: flexible.then(|| params.shape_config_cpu.unwrap_or(1)),
            memory_gb: flexible.then(|| params.shape_config_ram.unwrap_or(1)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub id: String,
    pub public_ip: Option<String>,
    pub private_ip: String,
}

/// Compute and network operations of a cloud provider. Every call returns
/// once the resource reached its final lifecycle state.
#[async_trait]
pub trait CloudApi: Send + Sync {
    async fn create_network(&self, cidr: &str, ingress_ports: &[u16]) -> Result<Network, PoolError>;

    async fn create_subnet(&self, name: &str, cidr: &str, vcn: &str) -> Result<String, PoolError>;

    async fn launch_instance(&self, request: &InstanceRequest) -> Result<Instance, PoolError>;

    async fn terminate_instance(&self, id: &str) -> Result<(), PoolError>;

    async fn delete_subnet(&self, id: &str) -> Result<(), PoolError>;
}

pub struct CloudPool {
    cloud: Arc<dyn CloudApi>,
    global: Arc<dyn GlobalStateStore>,
    allocator: IpAllocator,
    bootstrap: PeerBootstrap,
}

const POOL_TYPE: ExecutorType = ExecutorType::OciBasic;

impl CloudPool {
    pub fn new(
        cloud: Arc<dyn CloudApi>,
        global: Arc<dyn GlobalStateStore>,
        bootstrap: PeerBootstrap,
    ) -> Self {
        Self {
            allocator: IpAllocator::new(global.clone(), POOL_TYPE),
            cloud,
            global,
            bootstrap,
        }
    }

    /// Shared network, created on first use
    pub async fn ensure_network(&self) -> Result<Network, PoolError> {
        let lease = TypeLease::acquire(self.global.clone(), POOL_TYPE).await?;
        let result = self.ensure_network_leased(&lease).await;
        lease.release().await?;
        result
    }

    async fn ensure_network_leased(&self, lease: &TypeLease) -> Result<Network, PoolError> {
        let store = lease.store();
        let mut state = PoolGlobalState::from_value(&store.state(POOL_TYPE).await?);
        if let Some(network) = Network::from_state(&state) {
            return Ok(network);
        }

        store
            .append_log(POOL_TYPE, &log_line("Setting up the shared network"))
            .await?;
        let network = match self.cloud.create_network(VCN_CIDR, &INGRESS_PORTS).await {
            Ok(network) => network,
            Err(err) => {
                store
                    .append_log(POOL_TYPE, &log_line(&format!("Network setup failed: {}", err)))
                    .await?;
                return Err(err);
            }
        };

        network.store_in(&mut state);
        store.set_state(POOL_TYPE, &serde_json::to_value(&state)?).await?;
        store
            .append_log(POOL_TYPE, &log_line(&format!("Network ready in VCN {}", network.vcn)))
            .await?;
        Ok(network)
    }

    async fn provision(
        &self,
        executor_id: i64,
        params: &OciParams,
        pool: &mut PoolState,
    ) -> Result<(), PoolError> {
        if params.size == 0 {
            return Err(PoolError::Parameters("pool size must be at least 1".to_string()));
        }

        let network = self.ensure_network().await?;

        let range = self.allocator.allocate().await?;
        let mask = subnet_mask(range);
        pool.subnet_mask = Some(mask.clone());

        let subnet_id = match self
            .cloud
            .create_subnet(&subnet_name(executor_id), &mask, &network.vcn)
            .await
        {
            Ok(id) => id,
            Err(err) => {
                // nothing uses the range yet
                if let Err(release) = self.allocator.release(range).await {
                    tracing::error!("Cannot release {} of executor {}: {}", mask, executor_id, release);
                } else {
                    pool.subnet_mask = None;
                }
                return Err(err);
            }
        };
        pool.subnet_id = Some(subnet_id.clone());

        let launches = (0..params.size).map(|index| {
            let request = InstanceRequest::new(peer_name(executor_id, index), &subnet_id, params);
            async move { self.cloud.launch_instance(&request).await }
        });
        let results = join_all(launches).await;

        let mut instances = Vec::with_capacity(results.len());
        let mut first_error = None;
        for result in results {
            match result {
                Ok(instance) => instances.push(instance),
                Err(err) => {
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }
        pool.pool_instance_ids = instances.iter().map(|i| i.id.clone()).collect();
        if let Some(err) = first_error {
            return Err(err);
        }

        let master = &instances[0];
        pool.master_instance_id = Some(master.id.clone());
        pool.master_instance_subnet_ip = Some(master.private_ip.clone());
        let Some(master_ip) = master.public_ip.clone() else {
            return Err(PoolError::Provisioning("master instance IP not found".to_string()));
        };
        pool.master_instance_ip = Some(master_ip);

        let installs = instances.iter().enumerate().map(|(index, instance)| {
            let peer = PeerSpec {
                host: instance
                    .public_ip
                    .clone()
                    .unwrap_or_else(|| instance.private_ip.clone()),
                ssh_port: PEER_SSH_PORT,
                user: PEER_USER.to_string(),
                private_ip: instance.private_ip.clone(),
            };
            let master_subnet = (index == 0).then_some(mask.as_str());
            let master_private_ip = master.private_ip.as_str();
            async move { self.bootstrap.install(&peer, master_private_ip, master_subnet).await }
        });
        for result in join_all(installs).await {
            result?;
        }
        Ok(())
    }

    /// Terminate peers and the subnet; with `forced` every failure is only
    /// logged. Returns the first failure otherwise.
    async fn teardown(&self, executor_id: i64, pool: &PoolState, forced: bool) -> Result<(), PoolError> {
        let terminations = pool
            .pool_instance_ids
            .iter()
            .map(|id| self.cloud.terminate_instance(id));
        let mut first_error = None;
        for (id, result) in pool.pool_instance_ids.iter().zip(join_all(terminations).await) {
            if let Err(err) = result {
                tracing::error!("Cannot terminate {} of executor {}: {}", id, executor_id, err);
                first_error.get_or_insert(err);
            }
        }

        if let Some(subnet) = &pool.subnet_id {
            if first_error.is_none() || forced {
                if let Err(err) = self.cloud.delete_subnet(subnet).await {
                    tracing::error!("Cannot delete subnet {} of executor {}: {}", subnet, executor_id, err);
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) if !forced => Err(err),
            _ => Ok(()),
        }
    }

    async fn release_range(&self, executor_id: i64, pool: &PoolState, forced: bool) -> Result<(), PoolError> {
        let Some(range) = pool.subnet_mask.as_deref().and_then(parse_subnet_mask) else {
            return Ok(());
        };
        tracing::info!("Releasing {} of executor {}", subnet_mask(range), executor_id);
        if forced {
            self.allocator.release_persistent(range).await
        } else {
            self.allocator.release(range).await
        }
    }
}

fn oci_params(params: &serde_json::Value) -> Result<OciParams, PoolError> {
    serde_json::from_value(params.clone()).map_err(|e| PoolError::Parameters(e.to_string()))
}

#[async_trait]
impl PoolBackend for CloudPool {
    async fn create_pool(&self, executor_id: i64, params: &serde_json::Value) -> PoolState {
        let mut pool = PoolState::default();
        let result = match oci_params(params) {
            Ok(params) => self.provision(executor_id, &params, &mut pool).await,
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
        executor_id: i64,
        _params: &serde_json::Value,
        state: &PoolState,
    ) -> Result<(), PoolError> {
        self.teardown(executor_id, state, false).await?;
        self.release_range(executor_id, state, false).await
    }

    async fn kill_pool_forced(&self, executor_id: i64, _params: &serde_json::Value, state: &PoolState) {
        let _ = self.teardown(executor_id, state, true).await;
        if let Err(err) = self.release_range(executor_id, state, true).await {
            tracing::error!("Cannot release address range of executor {}: {}", executor_id, err);
        }
    }
}
