//! Render executor
//!
//! Body of the `run` sub-command. The queue launches one of these per render
//! task; it renders the frames, ships the output upstream and always leaves
//! the `finished` marker behind so the queue can retire the task.

use anyhow::{Context, Result};
use kiln_client::ControlPlaneClient;
use kiln_core::domain::task::{FrameRange, TaskId, files};
use kiln_core::dto::control::OutputRequest;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{error, info};

const ARCHIVE_NAME: &str = "output.tar.gz";

/// One render invocation
#[derive(Debug, Clone)]
pub struct RenderJob {
    pub task_dir: PathBuf,
    pub frames: FrameRange,
}

impl RenderJob {
    pub fn task_id(&self) -> Result<TaskId> {
        let name = self
            .task_dir
            .file_name()
            .and_then(|n| n.to_str())
            .context("Task directory has no name")?;
        name.parse().map_err(|e: String| anyhow::anyhow!(e))
    }

    /// Render command with the job's paths and frames substituted
    pub fn command_line(&self, template: &str) -> String {
        template
            .replace(
                "{input}",
                &self.task_dir.join(files::RENDER_FILE).to_string_lossy(),
            )
            .replace(
                "{output}",
                &self.task_dir.join(files::OUTPUT_DIR).to_string_lossy(),
            )
            .replace("{start}", &self.frames.start.to_string())
            .replace("{end}", &self.frames.end.to_string())
    }
}

/// Render, upload, and mark the task finished whatever the outcome
pub async fn run(
    job: &RenderJob,
    template: &str,
    client: &ControlPlaneClient,
    sandbox_id: &str,
) -> Result<()> {
    let result = render_and_upload(job, template, client, sandbox_id).await;

    if let Err(e) = &result {
        error!("Exception during task execution: {:#}", e);
    }

    tokio::fs::write(job.task_dir.join(files::FINISHED), b"")
        .await
        .context("Failed to write finished marker")?;

    result
}

async fn render_and_upload(
    job: &RenderJob,
    template: &str,
    client: &ControlPlaneClient,
    sandbox_id: &str,
) -> Result<()> {
    let task_id = job.task_id()?;

    tokio::fs::create_dir_all(job.task_dir.join(files::OUTPUT_DIR))
        .await
        .context("Failed to create output directory")?;
    tokio::fs::write(job.task_dir.join(files::STARTED), b"")
        .await
        .context("Failed to write started marker")?;

    let command = job.command_line(template);
    info!("Rendering task {}: {}", task_id, command);

    let status = Command::new("sh")
        .arg("-c")
        .arg(&command)
        .current_dir(&job.task_dir)
        .status()
        .await
        .context("Failed to run render command")?;

    if !status.success() {
        anyhow::bail!("Task execution command failed with {}", status);
    }

    let archive = archive_output(&job.task_dir).await?;

    let request = OutputRequest::new(task_id.clone(), sandbox_id);
    let location = client
        .request_upload(&request)
        .await
        .context("Failed to request upload location")?;
    client
        .upload_output(&location, ARCHIVE_NAME, archive)
        .await
        .context("Failed to upload output")?;
    client
        .confirm_upload(&request)
        .await
        .context("Failed to confirm upload")?;

    info!("Output of task {} uploaded", task_id);
    Ok(())
}

/// Compress the output directory, returning the archive bytes
async fn archive_output(task_dir: &Path) -> Result<Vec<u8>> {
    let archive = task_dir.join(ARCHIVE_NAME);

    let status = Command::new("tar")
        .arg("-czf")
        .arg(&archive)
        .arg("-C")
        .arg(task_dir)
        .arg(files::OUTPUT_DIR)
        .status()
        .await
        .context("Failed to run tar")?;

    if !status.success() {
        anyhow::bail!("tar exited with {}", status);
    }

    tokio::fs::read(&archive)
        .await
        .context("Failed to read output archive")
}
