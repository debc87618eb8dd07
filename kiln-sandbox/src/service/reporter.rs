//! Result reporting

use anyhow::Result;
use async_trait::async_trait;
use kiln_client::ControlPlaneClient;
use kiln_core::dto::control::BenchmarkReport;

/// Sends results produced inside the sandbox upstream
#[async_trait]
pub trait ResultReporter: Send + Sync {
    async fn report_benchmark(&self, score: &str) -> Result<()>;
}

/// Reports to the control plane under this sandbox's identity
pub struct ControlPlaneReporter {
    client: ControlPlaneClient,
    sandbox_id: String,
}

impl ControlPlaneReporter {
    pub fn new(client: ControlPlaneClient, sandbox_id: String) -> Self {
        Self { client, sandbox_id }
    }
}

#[async_trait]
impl ResultReporter for ControlPlaneReporter {
    async fn report_benchmark(&self, score: &str) -> Result<()> {
        let report = BenchmarkReport {
            benchmark: score.to_string(),
            sandbox_id: self.sandbox_id.clone(),
        };
        self.client.report_benchmark(&report).await?;
        Ok(())
    }
}
