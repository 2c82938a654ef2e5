//! Task descriptors
//!
//! The orchestrator does not interpret job code. It only needs the task type
//! and subtype to pick build scripts and dependency sets.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    Python,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Python => "python",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PythonSubtype {
    #[default]
    Default,
    EnergyPlus,
    Numpy,
    Pandas,
}

const DEFAULT_PYTHON_LIBS: [&str; 2] = ["elasticsearch6", "requests"];

impl PythonSubtype {
    pub fn as_str(&self) -> &'static str {
        match self {
            PythonSubtype::Default => "default",
            PythonSubtype::EnergyPlus => "energy_plus",
            PythonSubtype::Numpy => "numpy",
            PythonSubtype::Pandas => "pandas",
        }
    }

    /// Packages installed into the task environment
    pub fn libs(&self) -> Vec<&'static str> {
        let extra: &[&'static str] = match self {
            PythonSubtype::Default => &[],
            PythonSubtype::EnergyPlus => &["eppy"],
            PythonSubtype::Numpy => &["numpy", "dtw"],
            PythonSubtype::Pandas => &["pandas"],
        };
        DEFAULT_PYTHON_LIBS.iter().chain(extra).copied().collect()
    }
}

/// The task a run executes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInfo {
    pub task_id: i64,
    pub task_type: TaskType,
    #[serde(default)]
    pub subtype: PythonSubtype,
    /// Local path of the packed task code
    pub archive_path: PathBuf,
}
