//! Docker-backed sandboxes
//!
//! Each sandbox is a container named after its workload and GPU, e.g.
//! `kiln-render-0`, running the sandbox image with that GPU passed through.
//! Queue operations go to the listener inside the container.

use async_trait::async_trait;
use kiln_client::SandboxClient;
use kiln_core::domain::gpu::{CONTAINER_PREFIX, WorkloadKind};
use kiln_core::domain::task::TaskId;
use kiln_core::dto::sandbox::{PushTask, SandboxStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::{Sandbox, SandboxSpec};
use crate::shell::{CommandRunner, Verbosity};

const INSPECT_IP: &str = "docker inspect -f '{{range .NetworkSettings.Networks}}{{.IPAddress}}{{end}}'";
const LIST_NAMES: &str = "docker ps --format '{{.Names}}' --filter name=";

pub struct DockerSandbox {
    shell: Arc<dyn CommandRunner>,
    image: String,
    port: u16,
    start_attempts: u32,
    ready_timeout: Duration,
    http: reqwest::Client,
}

impl DockerSandbox {
    pub fn new(
        shell: Arc<dyn CommandRunner>,
        image: impl Into<String>,
        port: u16,
        start_attempts: u32,
        ready_timeout: Duration,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();

        Self {
            shell,
            image: image.into(),
            port,
            start_attempts: start_attempts.max(1),
            ready_timeout,
            http,
        }
    }

    /// `docker run` invocation for a sandbox
    pub fn run_command(&self, spec: &SandboxSpec) -> String {
        let mut cmd = format!(
            "docker run -d --rm --gpus device={} --name {}",
            spec.gpu,
            spec.kind.container_name(spec.gpu)
        );
        for (key, value) in spec.env() {
            cmd.push_str(&format!(" -e {}={}", key, shell_quote(&value)));
        }
        cmd.push(' ');
        cmd.push_str(&self.image);
        cmd
    }

    async fn address(&self, name: &str) -> Option<String> {
        let output = self
            .shell
            .run(&format!("{} {}", INSPECT_IP, name), Verbosity::VeryQuiet)
            .await?;
        let ip = output.trim();
        if ip.is_empty() {
            return None;
        }
        Some(format!("{}:{}", ip, self.port))
    }

    fn client(&self, address: &str) -> SandboxClient {
        SandboxClient::with_client(address, self.http.clone())
    }

    async fn client_for(&self, gpu: u32, kind: WorkloadKind) -> Option<SandboxClient> {
        let address = self.address(&kind.container_name(gpu)).await?;
        Some(self.client(&address))
    }

    /// Waits until the listener inside a fresh container answers
    async fn wait_until_ready(&self, address: &str) -> bool {
        let client = self.client(address);
        let deadline = Instant::now() + self.ready_timeout;

        loop {
            if client.status().await.is_ok() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    async fn try_start(&self, spec: &SandboxSpec) -> Option<String> {
        let name = spec.kind.container_name(spec.gpu);

        // Leftover stopped container with the same name
        self.shell
            .run(&format!("docker rm -f {}", name), Verbosity::VeryQuiet)
            .await;

        self.shell.run(&self.run_command(spec), Verbosity::Normal).await?;

        let address = self.address(&name).await?;
        if !self.wait_until_ready(&address).await {
            warn!("Sandbox {} did not become reachable at {}", name, address);
            return None;
        }

        Some(address)
    }
}

#[async_trait]
impl Sandbox for DockerSandbox {
    async fn start(&self, spec: &SandboxSpec) -> Option<String> {
        let name = spec.kind.container_name(spec.gpu);

        if self.running().await.contains(&(spec.kind, spec.gpu)) {
            debug!("Sandbox {} already running", name);
            return self.address(&name).await;
        }

        for attempt in 1..=self.start_attempts {
            if let Some(address) = self.try_start(spec).await {
                info!("Started sandbox {} at {}", name, address);
                return Some(address);
            }
            warn!(
                "Failed to start sandbox {} (attempt {}/{})",
                name, attempt, self.start_attempts
            );
        }

        error!("Giving up on starting sandbox {}", name);
        None
    }

    async fn stop(&self, gpu: u32, kind: WorkloadKind) {
        let name = kind.container_name(gpu);
        if self
            .shell
            .run(&format!("docker kill {}", name), Verbosity::VeryQuiet)
            .await
            .is_some()
        {
            info!("Stopped sandbox {}", name);
        }
        self.shell
            .run(&format!("docker rm -f {}", name), Verbosity::VeryQuiet)
            .await;
    }

    async fn running(&self) -> Vec<(WorkloadKind, u32)> {
        let cmd = format!("{}{}-", LIST_NAMES, CONTAINER_PREFIX);
        self.shell
            .run(&cmd, Verbosity::VeryQuiet)
            .await
            .map(|output| parse_container_names(&output))
            .unwrap_or_default()
    }

    async fn status(&self, gpu: u32, kind: WorkloadKind) -> Option<SandboxStatus> {
        let client = self.client_for(gpu, kind).await?;
        match client.status().await {
            Ok(status) => Some(status),
            Err(e) => {
                debug!("Sandbox {} unreachable: {}", kind.container_name(gpu), e);
                None
            }
        }
    }

    async fn push(&self, gpu: u32, task: &PushTask, render_file: Vec<u8>) -> bool {
        let Some(client) = self.client_for(gpu, WorkloadKind::Render).await else {
            return false;
        };
        match client.push(task, render_file).await {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to push task {} to GPU {}: {}", task.task_id, gpu, e);
                false
            }
        }
    }

    async fn pop(&self, gpu: u32, task_id: &TaskId) -> bool {
        let Some(client) = self.client_for(gpu, WorkloadKind::Render).await else {
            return false;
        };
        match client.pop(task_id).await {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to pop task {} from GPU {}: {}", task_id, gpu, e);
                false
            }
        }
    }

    async fn start_benchmark(&self, gpu: u32) -> bool {
        let Some(client) = self.client_for(gpu, WorkloadKind::Benchmark).await else {
            return false;
        };
        match client.start_benchmark().await {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to start benchmark on GPU {}: {}", gpu, e);
                false
            }
        }
    }

    async fn remove_images(&self) {
        self.shell
            .run(&format!("docker rmi -f {}", self.image), Verbosity::Quiet)
            .await;
    }
}

/// Sandboxes among `docker ps` names; foreign containers are ignored
pub fn parse_container_names(output: &str) -> Vec<(WorkloadKind, u32)> {
    output
        .lines()
        .filter_map(WorkloadKind::from_container_name)
        .collect()
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
