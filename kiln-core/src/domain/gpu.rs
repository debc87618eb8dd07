//! GPU domain types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::domain::task::TaskId;

/// A GPU found in the host's hardware inventory
///
/// Enumerated once at daemon startup and never removed while the daemon runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gpu {
    /// Hardware index as reported by the driver
    pub index: u32,

    /// Human-readable model name
    pub name: String,
}

/// What a GPU slot is currently doing
///
/// Serialized with the names the control plane expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum WorkloadState {
    #[default]
    #[serde(rename = "stopped")]
    Stopped,
    #[serde(rename = "crypto")]
    CryptoMining,
    #[serde(rename = "gpc")]
    Rendering,
}

impl fmt::Display for WorkloadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkloadState::Stopped => write!(f, "Stopped"),
            WorkloadState::CryptoMining => write!(f, "CryptoMining"),
            WorkloadState::Rendering => write!(f, "Rendering"),
        }
    }
}

/// The kind of workload a sandbox was started for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadKind {
    Render,
    Crypto,
    Benchmark,
}

/// Prefix shared by every sandbox container the daemon owns
pub const CONTAINER_PREFIX: &str = "kiln";

impl WorkloadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadKind::Render => "render",
            WorkloadKind::Crypto => "crypto",
            WorkloadKind::Benchmark => "benchmark",
        }
    }

    /// Container name for this workload on one GPU, e.g. `kiln-render-0`
    pub fn container_name(&self, gpu: u32) -> String {
        format!("{}-{}-{}", CONTAINER_PREFIX, self.as_str(), gpu)
    }

    /// Inverse of [`WorkloadKind::container_name`]
    pub fn from_container_name(name: &str) -> Option<(WorkloadKind, u32)> {
        let mut parts = name.trim().splitn(3, '-');
        if parts.next()? != CONTAINER_PREFIX {
            return None;
        }
        let kind = parts.next()?.parse().ok()?;
        let gpu = parts.next()?.parse().ok()?;
        Some((kind, gpu))
    }
}

impl FromStr for WorkloadKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "render" => Ok(WorkloadKind::Render),
            "crypto" => Ok(WorkloadKind::Crypto),
            "benchmark" => Ok(WorkloadKind::Benchmark),
            other => Err(format!("unknown workload kind '{}'", other)),
        }
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-GPU entry of the host status report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuStatus {
    pub index: u32,
    pub name: String,
    pub state: WorkloadState,

    /// Queue contents of the GPU's sandbox, empty unless rendering
    #[serde(default)]
    pub queue: Vec<TaskId>,
}

impl GpuStatus {
    pub fn stopped(gpu: &Gpu) -> Self {
        Self {
            index: gpu.index,
            name: gpu.name.clone(),
            state: WorkloadState::Stopped,
            queue: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_name_round_trip() {
        let name = WorkloadKind::Benchmark.container_name(3);
        assert_eq!(name, "kiln-benchmark-3");
        assert_eq!(
            WorkloadKind::from_container_name(&name),
            Some((WorkloadKind::Benchmark, 3))
        );
    }

    #[test]
    fn test_foreign_container_names_are_ignored() {
        assert_eq!(WorkloadKind::from_container_name("postgres"), None);
        assert_eq!(WorkloadKind::from_container_name("kiln-web-0"), None);
        assert_eq!(WorkloadKind::from_container_name("kiln-render-x"), None);
    }

    #[test]
    fn test_workload_state_wire_names() {
        assert_eq!(
            serde_json::to_string(&WorkloadState::Rendering).unwrap(),
            "\"gpc\""
        );
        let state: WorkloadState = serde_json::from_str("\"crypto\"").unwrap();
        assert_eq!(state, WorkloadState::CryptoMining);
    }
}
