//! Control plane DTOs
//!
//! Bodies exchanged between a host and the remote control plane.

use serde::{Deserialize, Serialize};

use crate::domain::task::TaskId;
use crate::domain::telemetry::HostState;

/// Registration or periodic check-in sent by the daemon
///
/// An empty `rentaflop_id` asks the control plane to register the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkin {
    pub state: HostState,

    /// Public address of the host, if it could be determined
    pub ip: Option<String>,

    pub rentaflop_id: String,
    pub email: String,
    pub wallet_address: String,
}

/// Identity issued to a newly registered host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationGrant {
    pub rentaflop_id: String,
    pub sandbox_id: String,
}

/// Captured log lines forwarded upstream
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogUpload {
    pub logs: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rentaflop_id: Option<String>,
}

/// Benchmark score reported by a sandbox
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkReport {
    /// Score as printed by the benchmark, kept verbatim
    pub benchmark: String,
    pub sandbox_id: String,
}

/// Request for an output upload location, and later its confirmation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRequest {
    pub task_id: TaskId,
    pub sandbox_id: String,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub confirm: bool,
}

impl OutputRequest {
    pub fn new(task_id: TaskId, sandbox_id: impl Into<String>) -> Self {
        Self {
            task_id,
            sandbox_id: sandbox_id.into(),
            confirm: false,
        }
    }

    pub fn confirmed(mut self) -> Self {
        self.confirm = true;
        self
    }
}

/// Pre-signed storage location for rendered output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadLocation {
    pub url: String,

    /// Form fields that must accompany the upload
    #[serde(default)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_request_only_carries_confirm_when_set() {
        let request = OutputRequest::new("7".parse().unwrap(), "sb-1");
        let body = serde_json::to_value(&request).unwrap();
        assert!(body.get("confirm").is_none());

        let body = serde_json::to_value(request.confirmed()).unwrap();
        assert_eq!(body["confirm"], true);
        assert_eq!(body["task_id"], "7");
    }
}
