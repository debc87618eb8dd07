//! API Error Handling

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::service::QueueError;

/// API error type
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Queue(QueueError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Queue(QueueError::Validation(msg)) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Queue(err) => {
                tracing::error!("Queue error: {}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<QueueError> for ApiError {
    fn from(err: QueueError) -> Self {
        ApiError::Queue(err)
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
