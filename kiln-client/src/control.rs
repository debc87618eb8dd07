//! Control plane endpoints

use reqwest::Client;
use reqwest::multipart::{Form, Part};
use tracing::{debug, warn};

use crate::error::{ClientError, Result};
use crate::{handle_empty_response, handle_optional_json, handle_response};
use kiln_core::dto::control::{
    BenchmarkReport, Checkin, LogUpload, OutputRequest, RegistrationGrant, UploadLocation,
};

/// Default IP echo service used to learn the host's public address
pub const DEFAULT_IP_ECHO_URL: &str = "https://api.ipify.org";

/// HTTP client for the remote control plane
#[derive(Debug, Clone)]
pub struct ControlPlaneClient {
    /// Base URL of the host API (e.g., "https://api.example.com/host")
    base_url: String,
    /// Where to ask for the public address
    ip_echo_url: String,
    /// HTTP client instance
    client: Client,
}

impl ControlPlaneClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, Client::new())
    }

    /// Create a client with a custom HTTP client (timeouts, proxies, TLS settings)
    pub fn with_client(base_url: impl Into<String>, client: Client) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            ip_echo_url: DEFAULT_IP_ECHO_URL.to_string(),
            client,
        }
    }

    pub fn with_ip_echo_url(mut self, url: impl Into<String>) -> Self {
        self.ip_echo_url = url.into();
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    // =============================================================================
    // Registration & Check-in
    // =============================================================================

    /// Register a host that has no identity yet
    pub async fn register(&self, checkin: &Checkin) -> Result<RegistrationGrant> {
        let url = format!("{}/daemon", self.base_url);
        debug!("Sending registration to {}", url);
        let response = self.client.post(&url).json(checkin).send().await?;

        handle_response(response).await
    }

    /// Report host state and receive an optional instruction
    ///
    /// Returns `Value::Null` or an empty object when there is nothing to do;
    /// otherwise the body is a command envelope.
    pub async fn checkin(&self, checkin: &Checkin) -> Result<serde_json::Value> {
        let url = format!("{}/daemon", self.base_url);
        let response = self.client.post(&url).json(checkin).send().await?;

        handle_optional_json(response).await
    }

    /// Public address of this host, `None` when the echo service is unreachable
    pub async fn public_ip(&self) -> Option<String> {
        let response = match self.client.get(&self.ip_echo_url).send().await {
            Ok(response) => response,
            Err(e) => {
                warn!("Failed to determine public ip: {}", e);
                return None;
            }
        };

        match response.error_for_status() {
            Ok(response) => response
                .text()
                .await
                .ok()
                .map(|ip| ip.trim().to_string())
                .filter(|ip| !ip.is_empty()),
            Err(e) => {
                warn!("Failed to determine public ip: {}", e);
                None
            }
        }
    }

    // =============================================================================
    // Logs
    // =============================================================================

    pub async fn send_logs(&self, logs: &LogUpload) -> Result<()> {
        let url = format!("{}/logs", self.base_url);
        let response = self.client.post(&url).json(logs).send().await?;

        handle_empty_response(response).await
    }

    // =============================================================================
    // Output
    // =============================================================================

    pub async fn report_benchmark(&self, report: &BenchmarkReport) -> Result<()> {
        let url = format!("{}/output", self.base_url);
        let response = self.client.post(&url).json(report).send().await?;

        handle_empty_response(response).await
    }

    /// Ask where the rendered output of a task should be uploaded
    pub async fn request_upload(&self, request: &OutputRequest) -> Result<UploadLocation> {
        let url = format!("{}/output", self.base_url);
        let response = self.client.post(&url).json(request).send().await?;

        handle_response(response).await
    }

    /// Upload an output archive to a pre-signed location
    pub async fn upload_output(
        &self,
        location: &UploadLocation,
        file_name: &str,
        archive: Vec<u8>,
    ) -> Result<()> {
        let mut form = Form::new();
        for (key, value) in &location.fields {
            let value = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            form = form.text(key.clone(), value);
        }

        let part = Part::bytes(archive)
            .file_name(file_name.to_string())
            .mime_str("application/gzip")
            .map_err(|e| ClientError::InvalidRequest(e.to_string()))?;
        form = form.part("file", part);

        let response = self
            .client
            .post(&location.url)
            .multipart(form)
            .send()
            .await?;

        handle_empty_response(response).await
    }

    /// Tell the control plane an upload is complete
    pub async fn confirm_upload(&self, request: &OutputRequest) -> Result<()> {
        let url = format!("{}/output", self.base_url);
        let confirmed = request.clone().confirmed();
        let response = self.client.post(&url).json(&confirmed).send().await?;

        handle_empty_response(response).await
    }
}
