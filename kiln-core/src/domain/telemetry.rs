//! Telemetry and host state types

use serde::{Deserialize, Serialize};

use crate::domain::gpu::GpuStatus;

/// Mining statistics in the format rig monitors expect
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MinerStats {
    /// Per-GPU hash rates
    pub hs: Vec<f64>,
    pub hs_units: String,
    pub temp: Vec<f64>,
    pub fan: Vec<f64>,

    /// Seconds since the reporting process started
    pub uptime: u64,
    pub ver: String,

    /// Accepted and rejected share counts
    pub ar: Vec<u64>,
    pub algo: String,

    /// PCI bus numbers in decimal
    pub bus_numbers: Vec<u32>,
}

impl Default for MinerStats {
    fn default() -> Self {
        Self {
            hs: Vec::new(),
            hs_units: "khs".to_string(),
            temp: Vec::new(),
            fan: Vec::new(),
            uptime: 0,
            ver: String::new(),
            ar: Vec::new(),
            algo: String::new(),
            bus_numbers: Vec::new(),
        }
    }
}

impl MinerStats {
    pub fn accepted(&self) -> u64 {
        self.ar.first().copied().unwrap_or(0)
    }

    pub fn rejected(&self) -> u64 {
        self.ar.get(1).copied().unwrap_or(0)
    }
}

/// GPUs the requirement checks accepted
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostResources {
    pub gpu_indexes: Vec<u32>,
    pub gpu_names: Vec<String>,
}

/// Aggregated status report for the whole host
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostState {
    pub gpus: Vec<GpuStatus>,
    pub n_gpus: usize,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<HostResources>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Total hash rate across all sandboxes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub khs: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<MinerStats>,
}
