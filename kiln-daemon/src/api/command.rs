//! Command endpoint

use axum::{
    Json,
    extract::{Request, State},
    http::{HeaderMap, StatusCode, Uri, header::HOST},
    response::{IntoResponse, Response},
};
use tracing::warn;

use crate::api::AppState;
use crate::api::envelope::read_envelope;
use crate::api::error::{ApiError, ApiResult};
use crate::commands::Outcome;

/// Authenticates, then requires a secure request, then dispatches
pub async fn handle_command(State(state): State<AppState>, request: Request) -> ApiResult<Response> {
    let headers = request.headers().clone();
    let uri = request.uri().clone();
    let (envelope, render_file) = read_envelope(request).await?;

    if !state.dispatcher.authorize(&envelope).await {
        warn!("Rejected '{}' command for another host", envelope.cmd);
        return Err(ApiError::Forbidden);
    }

    if !state.assume_secure && !is_secure(&headers) {
        return Err(ApiError::Redirect(secure_location(&headers, &uri)));
    }

    let response = match state.dispatcher.dispatch(envelope, render_file).await {
        Outcome::Reply(Some(payload)) => Json(payload).into_response(),
        Outcome::Reply(None) | Outcome::Finished => StatusCode::OK.into_response(),
    };
    Ok(response)
}

/// TLS is terminated in front of the daemon, which marks forwarded requests
pub fn is_secure(headers: &HeaderMap) -> bool {
    headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|proto| proto.eq_ignore_ascii_case("https"))
}

pub fn secure_location(headers: &HeaderMap, uri: &Uri) -> String {
    let host = headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| uri.host())
        .unwrap_or("localhost");
    let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    format!("https://{}{}", host, path)
}
