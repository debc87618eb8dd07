//! Envelope extraction
//!
//! Commands arrive as a JSON body, or as a multipart form with a `json`
//! part and an optional `render_file` part carrying the scene.

use axum::extract::{FromRequest, Multipart, Request};
use axum::http::header::CONTENT_TYPE;
use kiln_core::domain::command::CommandEnvelope;

use crate::api::error::{ApiError, ApiResult};

/// Largest request body accepted, scene files included
pub const MAX_BODY_BYTES: usize = 1024 * 1024 * 1024;

fn parse(bytes: &[u8]) -> ApiResult<CommandEnvelope> {
    serde_json::from_slice(bytes).map_err(|e| ApiError::BadRequest(format!("Invalid envelope: {}", e)))
}

pub async fn read_envelope(request: Request) -> ApiResult<(CommandEnvelope, Option<Vec<u8>>)> {
    let is_multipart = request
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("multipart/form-data"));

    if !is_multipart {
        let body = axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES)
            .await
            .map_err(|e| ApiError::BadRequest(format!("Unreadable body: {}", e)))?;
        return Ok((parse(&body)?, None));
    }

    let mut multipart = Multipart::from_request(request, &())
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let mut envelope = None;
    let mut render_file = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::BadRequest(e.to_string()))?;

        match name.as_str() {
            "json" => envelope = Some(parse(&bytes)?),
            "render_file" => render_file = Some(bytes.to_vec()),
            _ => {}
        }
    }

    let envelope =
        envelope.ok_or_else(|| ApiError::BadRequest("Missing 'json' part".to_string()))?;
    Ok((envelope, render_file))
}
