//! Sandbox driver
//!
//! A sandbox is an isolated container bound to one GPU that runs either the
//! miner or a render/benchmark queue. Every operation is idempotent from the
//! caller's point of view: stopping an absent sandbox or starting one that
//! already runs is not an error.

mod docker;

pub use docker::DockerSandbox;

use async_trait::async_trait;
use kiln_core::domain::gpu::WorkloadKind;
use kiln_core::domain::registration::CryptoConfig;
use kiln_core::domain::task::TaskId;
use kiln_core::dto::sandbox::{PushTask, SandboxStatus};
use std::time::Duration;

/// Everything needed to start one sandbox
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    pub gpu: u32,
    pub kind: WorkloadKind,
    pub sandbox_id: String,

    /// Handed to mining sandboxes only
    pub crypto: Option<CryptoConfig>,

    /// The sandbox exits by itself after this long
    pub timeout: Option<Duration>,
}

impl SandboxSpec {
    pub fn new(gpu: u32, kind: WorkloadKind, sandbox_id: impl Into<String>) -> Self {
        Self {
            gpu,
            kind,
            sandbox_id: sandbox_id.into(),
            crypto: None,
            timeout: None,
        }
    }

    pub fn with_crypto(mut self, crypto: CryptoConfig) -> Self {
        self.crypto = Some(crypto);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Environment the sandbox process reads its configuration from
    pub fn env(&self) -> Vec<(String, String)> {
        let mut env = vec![
            ("SANDBOX_ID".to_string(), self.sandbox_id.clone()),
            ("GPU".to_string(), self.gpu.to_string()),
            ("WORKLOAD".to_string(), self.kind.as_str().to_string()),
            (
                "TIMEOUT".to_string(),
                self.timeout.map(|t| t.as_secs()).unwrap_or(0).to_string(),
            ),
        ];
        if let Some(crypto) = &self.crypto {
            env.extend(crypto.sandbox_env());
        }
        env
    }
}

#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Starts the sandbox unless it already runs; returns its listener address
    async fn start(&self, spec: &SandboxSpec) -> Option<String>;

    async fn stop(&self, gpu: u32, kind: WorkloadKind);

    /// Sandboxes currently running on this host
    async fn running(&self) -> Vec<(WorkloadKind, u32)>;

    /// Queue and telemetry of one sandbox; `None` when it cannot be reached
    async fn status(&self, gpu: u32, kind: WorkloadKind) -> Option<SandboxStatus>;

    async fn push(&self, gpu: u32, task: &PushTask, render_file: Vec<u8>) -> bool;

    async fn pop(&self, gpu: u32, task_id: &TaskId) -> bool;

    async fn start_benchmark(&self, gpu: u32) -> bool;

    async fn stop_all(&self) {
        for (kind, gpu) in self.running().await {
            self.stop(gpu, kind).await;
        }
    }

    /// Removes the sandbox image from the host
    async fn remove_images(&self);
}
