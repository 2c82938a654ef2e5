//! Executor domain types

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier of the built-in local executor. It always exists and is immutable.
pub const LOCAL_EXECUTOR_ID: i64 = 1;

/// A configured execution target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Executor {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub executor_type: ExecutorType,
    pub status: ExecutorStatus,
    /// Type-specific parameters (host/port/credentials or cloud shape)
    pub parameters: serde_json::Value,
    /// Opaque per-type state, e.g. the provisioned pool
    pub state: serde_json::Value,
    /// Append-only, user-visible log
    pub log: String,
    /// Hexadecimal serial of the certificate bound to this executor
    pub cert_serial: Option<String>,
}

impl Executor {
    pub fn is_local(&self) -> bool {
        self.id == LOCAL_EXECUTOR_ID
    }

    /// Deserialize the type-specific parameters
    pub fn params<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.parameters.clone())
    }
}

/// Kind of execution backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutorType {
    #[serde(rename = "local")]
    Local,
    #[serde(rename = "agent")]
    RemoteRunnerAgent,
    #[serde(rename = "remote_pool")]
    RemotePool,
    #[serde(rename = "oci_basic")]
    OciBasic,
    #[serde(rename = "slurm")]
    SlurmPool,
}

impl ExecutorType {
    pub const ALL: [ExecutorType; 5] = [
        ExecutorType::Local,
        ExecutorType::RemoteRunnerAgent,
        ExecutorType::RemotePool,
        ExecutorType::OciBasic,
        ExecutorType::SlurmPool,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutorType::Local => "local",
            ExecutorType::RemoteRunnerAgent => "agent",
            ExecutorType::RemotePool => "remote_pool",
            ExecutorType::OciBasic => "oci_basic",
            ExecutorType::SlurmPool => "slurm",
        }
    }
}

impl fmt::Display for ExecutorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutorType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ExecutorType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownVariant(s.to_string()))
    }
}

/// Executor lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutorStatus {
    /// Being created or removed; no new runs may be scheduled
    Provisioning,
    Ready,
    Fail,
}

impl ExecutorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutorStatus::Provisioning => "PROVISIONING",
            ExecutorStatus::Ready => "READY",
            ExecutorStatus::Fail => "FAIL",
        }
    }
}

impl fmt::Display for ExecutorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutorStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PROVISIONING" => Ok(ExecutorStatus::Provisioning),
            "READY" => Ok(ExecutorStatus::Ready),
            "FAIL" => Ok(ExecutorStatus::Fail),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// Returned when parsing an enum from its stored string form fails
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant(pub String);

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown variant '{}'", self.0)
    }
}

impl std::error::Error for UnknownVariant {}

// =============================================================================
// Type-specific parameters
// =============================================================================

/// Parameters of a single remote agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentParams {
    pub hostname: String,
    pub port: u16,
}

/// Parameters of a SLURM login node reached over SSH
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlurmParams {
    pub hostname: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
}

/// Parameters of a pool of pre-existing machines bootstrapped over SSH
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemotePoolParams {
    /// The first peer becomes the pool master
    pub peers: Vec<PoolPeer>,
    pub username: String,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    /// CIDR of the private network the peers share
    pub subnet_mask: String,
    /// Port on which the master proxy is reachable
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolPeer {
    pub host: String,
    pub private_ip: String,
}

/// Parameters of a homogenous cloud pool
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciParams {
    pub size: usize,
    pub shape: String,
    #[serde(alias = "shapeConfigCPU")]
    pub shape_config_cpu: Option<u32>,
    #[serde(alias = "shapeConfigRAM")]
    pub shape_config_ram: Option<u32>,
}

fn default_ssh_port() -> u16 {
    22
}
