//! Sandbox queue listener endpoints

use reqwest::Client;
use reqwest::multipart::{Form, Part};

use crate::error::{ClientError, Result};
use crate::{handle_empty_response, handle_response};
use kiln_core::domain::task::{TaskId, files};
use kiln_core::dto::sandbox::{PushTask, QueueRequest, SandboxStatus};

/// HTTP client for the queue listener of one sandbox
#[derive(Debug, Clone)]
pub struct SandboxClient {
    base_url: String,
    client: Client,
}

impl SandboxClient {
    /// Create a client for a sandbox address such as `172.17.0.2:5000`
    pub fn new(address: impl Into<String>) -> Self {
        Self::with_client(address, Client::new())
    }

    pub fn with_client(address: impl Into<String>, client: Client) -> Self {
        let address = address.into();
        let address = address.trim_end_matches('/');
        let base_url = if address.starts_with("http://") || address.starts_with("https://") {
            address.to_string()
        } else {
            format!("http://{}", address)
        };
        Self { base_url, client }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Enqueue a render task together with its scene payload
    pub async fn push(&self, task: &PushTask, render_file: Vec<u8>) -> Result<()> {
        let envelope = serde_json::to_string(&QueueRequest::push(task))
            .map_err(|e| ClientError::InvalidRequest(e.to_string()))?;
        let part = Part::bytes(render_file).file_name(files::RENDER_FILE);
        let form = Form::new().text("json", envelope).part("render_file", part);

        let response = self
            .client
            .post(format!("{}/", self.base_url))
            .multipart(form)
            .send()
            .await?;

        handle_empty_response(response).await
    }

    pub async fn pop(&self, task_id: &TaskId) -> Result<()> {
        self.send(&QueueRequest::pop(task_id)).await
    }

    /// Enqueue the benchmark task
    pub async fn start_benchmark(&self) -> Result<()> {
        self.send(&QueueRequest::benchmark()).await
    }

    pub async fn status(&self) -> Result<SandboxStatus> {
        let response = self
            .client
            .post(format!("{}/", self.base_url))
            .json(&QueueRequest::status())
            .send()
            .await?;

        handle_response(response).await
    }

    async fn send(&self, request: &QueueRequest) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/", self.base_url))
            .json(request)
            .send()
            .await?;

        handle_empty_response(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};
    use serde_json::json;

    #[test]
    fn test_bare_address_gets_scheme() {
        assert_eq!(
            SandboxClient::new("10.0.0.5:5000").base_url(),
            "http://10.0.0.5:5000"
        );
        assert_eq!(
            SandboxClient::new("https://10.0.0.5:5000/").base_url(),
            "https://10.0.0.5:5000"
        );
    }

    #[tokio::test]
    async fn test_status_parses_queue() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/")
            .match_body(Matcher::PartialJson(json!({"cmd": "status"})))
            .with_status(200)
            .with_body(r#"{"queue": ["7", "8"], "khs": 0}"#)
            .create_async()
            .await;

        let sandbox = SandboxClient::new(server.url());
        let status = sandbox.status().await.unwrap();
        assert_eq!(status.queue.len(), 2);
        assert_eq!(status.queue[0].as_str(), "7");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_push_sends_multipart() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/")
            .match_header(
                "content-type",
                Matcher::Regex("multipart/form-data".to_string()),
            )
            .match_body(Matcher::Regex("render_file.blend".to_string()))
            .with_status(200)
            .create_async()
            .await;

        let sandbox = SandboxClient::new(server.url());
        let task = PushTask {
            task_id: "7".parse().unwrap(),
            start_frame: 1,
            end_frame: 10,
        };
        sandbox.push(&task, b"scene".to_vec()).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_pop_error_is_reported() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/")
            .with_status(500)
            .with_body("boom")
            .create_async()
            .await;

        let sandbox = SandboxClient::new(server.url());
        let err = sandbox.pop(&"7".parse().unwrap()).await.unwrap_err();
        assert!(matches!(err, ClientError::ApiError { status: 500, .. }));
    }
}
