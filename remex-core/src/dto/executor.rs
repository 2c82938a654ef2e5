//! Executor DTOs

use serde::{Deserialize, Serialize};

use crate::domain::executor::ExecutorType;

/// Request to create an executor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateExecutor {
    pub name: String,
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub executor_type: ExecutorType,
    #[serde(default)]
    pub parameters: serde_json::Value,
}
