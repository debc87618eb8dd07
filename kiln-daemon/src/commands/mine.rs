//! `mine` command
//!
//! With a `task_id` the command drives rendering, without one it drives
//! crypto mining on the requested GPU.

use anyhow::{Context, Result};
use kiln_core::domain::command::{MineAction, MineParams};
use kiln_core::dto::sandbox::PushTask;

use crate::gpu::GpuManager;

pub async fn handle(gpus: &GpuManager, params: MineParams) -> Result<()> {
    let gpu = params.gpu;

    match (params.action, params.task_id.clone()) {
        (MineAction::Start, Some(task_id)) => {
            let frames = params
                .frames()
                .context("Render submission needs start_frame and n_frames")?;
            let task = PushTask {
                task_id,
                start_frame: frames.start,
                end_frame: frames.end,
            };
            gpus.start_render(gpu, &task, params.render_file.unwrap_or_default())
                .await
        }
        (MineAction::Stop, Some(task_id)) => gpus.cancel_task(gpu, &task_id).await,
        (MineAction::Start, None) => gpus.start_mining(gpu).await,
        (MineAction::Stop, None) => gpus.stop_mining(gpu).await,
    }
}
