//! Pool domain types
//!
//! State of a provisioned pool (stored per executor) and the per-type global
//! state that tracks which private address ranges are in use.

use serde::{Deserialize, Serialize};

/// Result of provisioning a pool, persisted as the executor state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolState {
    pub subnet_id: Option<String>,
    pub subnet_mask: Option<String>,
    pub master_instance_id: Option<String>,
    pub master_instance_ip: Option<String>,
    pub master_instance_subnet_ip: Option<String>,
    pub pool_instance_ids: Vec<String>,
    pub error: Option<String>,
}

impl PoolState {
    pub fn is_ready(&self) -> bool {
        self.error.is_none() && self.master_instance_ip.is_some()
    }
}

/// One reserved `/24` range, identified by its third octet
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IpRange {
    pub index: u16,
}

/// Global state shared by every cloud pool executor
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolGlobalState {
    #[serde(default)]
    pub ips_used: Vec<IpRange>,
    pub vcn: Option<String>,
    pub route_table: Option<String>,
    pub gateway: Option<String>,
    pub security_list: Option<String>,
}

impl PoolGlobalState {
    /// Read the state blob, treating an empty or foreign blob as fresh state
    pub fn from_value(value: &serde_json::Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_default()
    }

    pub fn network_ready(&self) -> bool {
        self.vcn.is_some()
            && self.route_table.is_some()
            && self.gateway.is_some()
            && self.security_list.is_some()
    }
}
