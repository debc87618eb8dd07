//! Queue listener handler

use axum::{Json, extract::Request, extract::State};
use kiln_core::domain::task::FrameRange;
use kiln_core::dto::sandbox::{PopTask, PushTask, QueueRequest, SandboxStatus};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use crate::api::AppState;
use crate::api::envelope::read_envelope;
use crate::api::error::{ApiError, ApiResult};
use crate::service::miner;

/// POST /
/// Dispatch one queue command
pub async fn handle_command(
    State(state): State<AppState>,
    request: Request,
) -> ApiResult<Json<Value>> {
    let (envelope, render_file) = read_envelope::<QueueRequest>(request).await?;

    match envelope.cmd.as_str() {
        "push" => {
            let task: PushTask = params(envelope.params)?;
            let frames = FrameRange::new(task.start_frame, task.end_frame).ok_or_else(|| {
                ApiError::BadRequest("start_frame must not exceed end_frame".to_string())
            })?;
            let payload = render_file
                .ok_or_else(|| ApiError::BadRequest("Missing render_file".to_string()))?;

            state.queue.push(&task.task_id, frames, &payload).await?;
            Ok(Json(json!({})))
        }
        "pop" => {
            let task: PopTask = params(envelope.params)?;
            state.queue.pop(&task.task_id).await?;
            Ok(Json(json!({})))
        }
        "benchmark" => {
            state.queue.push_benchmark().await?;
            Ok(Json(json!({})))
        }
        "status" => {
            let queue = state.queue.status().await?;
            let stats = match &state.miner {
                Some(miner) => miner.stats().await,
                None => Default::default(),
            };
            let status = SandboxStatus {
                queue,
                khs: miner::total_khs(&stats),
                stats,
            };
            Ok(Json(serde_json::to_value(status).unwrap_or_default()))
        }
        other => Err(ApiError::BadRequest(format!("Unknown command '{}'", other))),
    }
}

fn params<T: DeserializeOwned>(params: Value) -> ApiResult<T> {
    serde_json::from_value(params).map_err(|e| ApiError::BadRequest(format!("Invalid params: {}", e)))
}
