//! Kiln HTTP Clients
//!
//! Typed clients for the two HTTP peers of a kiln host:
//!
//! - [`ControlPlaneClient`]: registration and check-in, log upload, render
//!   output and benchmark reporting
//! - [`SandboxClient`]: the queue listener running inside one GPU sandbox
//!
//! # Example
//!
//! ```no_run
//! use kiln_client::SandboxClient;
//!
//! # async fn example() -> kiln_client::Result<()> {
//! let sandbox = SandboxClient::new("172.17.0.2:5000");
//! let status = sandbox.status().await?;
//! println!("{} task(s) queued", status.queue.len());
//! # Ok(())
//! # }
//! ```

mod control;
pub mod error;
mod sandbox;

pub use control::ControlPlaneClient;
pub use error::{ClientError, Result};
pub use sandbox::SandboxClient;

use serde::de::DeserializeOwned;

// =============================================================================
// Response Handlers
// =============================================================================

/// Check the status code and deserialize a JSON body
async fn handle_response<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let response = error_for_status(response).await?;

    response
        .json()
        .await
        .map_err(|e| ClientError::ParseError(format!("Failed to parse JSON response: {}", e)))
}

/// Check the status code and parse a JSON body that may legitimately be empty
async fn handle_optional_json(response: reqwest::Response) -> Result<serde_json::Value> {
    let response = error_for_status(response).await?;
    let body = response.text().await?;

    if body.trim().is_empty() {
        return Ok(serde_json::Value::Null);
    }

    serde_json::from_str(&body)
        .map_err(|e| ClientError::ParseError(format!("Failed to parse JSON response: {}", e)))
}

/// Check the status code of a response whose body is ignored
async fn handle_empty_response(response: reqwest::Response) -> Result<()> {
    error_for_status(response).await.map(|_| ())
}

async fn error_for_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();

    if !status.is_success() {
        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        return Err(ClientError::api_error(status.as_u16(), error_text));
    }

    Ok(response)
}
