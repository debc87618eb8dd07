//! Envelope extraction
//!
//! Requests carry their envelope either as a JSON body or, when a scene file
//! travels along, as a multipart form with a `json` part and a `render_file`
//! part.

use axum::extract::{FromRequest, Multipart, Request};
use axum::http::header::CONTENT_TYPE;
use serde::de::DeserializeOwned;

use crate::api::error::ApiError;

/// Largest request body accepted, scene files included
pub const MAX_BODY_BYTES: usize = 1024 * 1024 * 1024;

/// Read an envelope and the optional render file from a request
pub async fn read_envelope<T: DeserializeOwned>(
    request: Request,
) -> Result<(T, Option<Vec<u8>>), ApiError> {
    let is_multipart = request
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("multipart/form-data"));

    if !is_multipart {
        let body = axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES)
            .await
            .map_err(|e| ApiError::BadRequest(format!("Unreadable body: {}", e)))?;
        let envelope = serde_json::from_slice(&body)
            .map_err(|e| ApiError::BadRequest(format!("Invalid envelope: {}", e)))?;
        return Ok((envelope, None));
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
            "json" => {
                envelope = Some(
                    serde_json::from_slice(&bytes)
                        .map_err(|e| ApiError::BadRequest(format!("Invalid envelope: {}", e)))?,
                );
            }
            "render_file" => render_file = Some(bytes.to_vec()),
            other => tracing::debug!("Ignoring multipart field '{}'", other),
        }
    }

    let envelope =
        envelope.ok_or_else(|| ApiError::BadRequest("Missing 'json' part".to_string()))?;
    Ok((envelope, render_file))
}
