//! Sandbox queue DTOs
//!
//! Envelopes understood by the queue listener running inside each sandbox.

use serde::{Deserialize, Serialize};

use crate::domain::task::TaskId;
use crate::domain::telemetry::MinerStats;

/// Command sent to a sandbox's queue listener
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueRequest {
    pub cmd: String,

    #[serde(default)]
    pub params: serde_json::Value,
}

impl QueueRequest {
    pub fn push(task: &PushTask) -> Self {
        Self {
            cmd: "push".to_string(),
            params: serde_json::to_value(task).unwrap_or_default(),
        }
    }

    pub fn pop(task_id: &TaskId) -> Self {
        Self {
            cmd: "pop".to_string(),
            params: serde_json::json!({ "task_id": task_id }),
        }
    }

    pub fn status() -> Self {
        Self {
            cmd: "status".to_string(),
            params: serde_json::Value::Null,
        }
    }

    pub fn benchmark() -> Self {
        Self {
            cmd: "benchmark".to_string(),
            params: serde_json::Value::Null,
        }
    }
}

/// Render task submission; the payload travels as a separate multipart part
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushTask {
    pub task_id: TaskId,
    pub start_frame: u32,
    pub end_frame: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PopTask {
    pub task_id: TaskId,
}

/// Answer to a `status` request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SandboxStatus {
    /// Enqueued task identities in FIFO order
    #[serde(default)]
    pub queue: Vec<TaskId>,

    /// Hash rate of the sandbox's miner; zero unless mining
    #[serde(default)]
    pub khs: f64,

    #[serde(default)]
    pub stats: MinerStats,
}
