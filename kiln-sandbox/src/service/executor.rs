//! Task executors
//!
//! The queue only decides when a task runs. Actually running it, and killing
//! it again, is delegated to a [`TaskExecutor`].

use anyhow::{Context, Result};
use async_trait::async_trait;
use kiln_core::domain::task::{Task, TaskId, files};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Launches and terminates task processes in the background
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Start rendering a task; must return as soon as the process is running
    async fn launch_render(&self, task: &Task) -> Result<()>;

    /// Start the hardware benchmark, writing its score into the task directory
    async fn launch_benchmark(&self, task: &Task) -> Result<()>;

    /// Signal every process belonging to a task; absent processes are fine
    async fn terminate(&self, task_id: &TaskId);
}

/// Executor spawning real processes, each in its own process group
pub struct ProcessExecutor {
    /// Program run for render tasks; normally this binary's `run` sub-command
    render_program: PathBuf,
    benchmark_command: String,
    groups: Arc<Mutex<HashMap<TaskId, i32>>>,
}

impl ProcessExecutor {
    pub fn new(render_program: PathBuf, benchmark_command: String) -> Self {
        Self {
            render_program,
            benchmark_command,
            groups: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Executor whose render tasks run through the current executable
    pub fn current_exe(benchmark_command: String) -> Result<Self> {
        let exe = std::env::current_exe().context("Failed to locate current executable")?;
        Ok(Self::new(exe, benchmark_command))
    }

    fn track(&self, task_id: &TaskId, mut child: tokio::process::Child) {
        let Some(pid) = child.id() else {
            return;
        };
        let pgid = pid as i32;

        if let Ok(mut groups) = self.groups.lock() {
            groups.insert(task_id.clone(), pgid);
        }

        let groups = Arc::clone(&self.groups);
        let task_id = task_id.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => debug!("Task {} process exited with {}", task_id, status),
                Err(e) => warn!("Failed to wait for task {} process: {}", task_id, e),
            }
            if let Ok(mut groups) = groups.lock() {
                if groups.get(&task_id) == Some(&pgid) {
                    groups.remove(&task_id);
                }
            }
        });
    }
}

#[async_trait]
impl TaskExecutor for ProcessExecutor {
    async fn launch_render(&self, task: &Task) -> Result<()> {
        let frames = task
            .frames
            .with_context(|| format!("Render task {} has no frame range", task.id))?;

        info!(
            "Launching render task {} (frames {}-{})",
            task.id, frames.start, frames.end
        );

        let child = Command::new(&self.render_program)
            .arg("run")
            .arg(&task.dir)
            .arg(frames.start.to_string())
            .arg(frames.end.to_string())
            .arg(task.id.process_tag())
            .process_group(0)
            .stdin(Stdio::null())
            .spawn()
            .with_context(|| format!("Failed to launch render task {}", task.id))?;

        self.track(&task.id, child);
        Ok(())
    }

    async fn launch_benchmark(&self, task: &Task) -> Result<()> {
        let output = task.dir.join(files::BENCHMARK_OUTPUT);
        let command = self
            .benchmark_command
            .replace("{output}", &output.to_string_lossy());

        info!("Launching benchmark: {}", command);

        let child = Command::new("sh")
            .arg("-c")
            .arg(&command)
            .arg(task.id.process_tag())
            .current_dir(&task.dir)
            .process_group(0)
            .stdin(Stdio::null())
            .spawn()
            .context("Failed to launch benchmark")?;

        self.track(&task.id, child);
        Ok(())
    }

    async fn terminate(&self, task_id: &TaskId) {
        let pgid = self
            .groups
            .lock()
            .ok()
            .and_then(|mut groups| groups.remove(task_id));

        if let Some(pgid) = pgid {
            debug!("Terminating process group {} of task {}", pgid, task_id);
            quiet(Command::new("kill").arg("-TERM").arg("--").arg(format!("-{}", pgid))).await;
        }

        // Processes left behind by an earlier instance of this sandbox
        quiet(Command::new("pkill").arg("-f").arg(task_id.process_pattern())).await;
    }
}

/// Run a signalling command whose failure only means nothing was there
async fn quiet(command: &mut Command) {
    if let Err(e) = command
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
    {
        debug!("Signal command failed: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::domain::task::{FrameRange, TaskStatus};
    use std::time::Duration;
    use tempfile::TempDir;

    fn render_task(root: &TempDir, id: &str) -> Task {
        Task {
            id: id.parse().unwrap(),
            dir: root.path().join(id),
            frames: FrameRange::new(1, 10),
            status: TaskStatus::Queued,
            started_at: None,
        }
    }

    fn alive(pid: i32) -> bool {
        std::process::Command::new("kill")
            .arg("-0")
            .arg(pid.to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .is_ok_and(|status| status.success())
    }

    fn group_of(executor: &ProcessExecutor, task_id: &str) -> i32 {
        executor.groups.lock().unwrap()[&task_id.parse::<TaskId>().unwrap()]
    }

    #[tokio::test]
    async fn test_terminate_leaves_tasks_with_longer_ids_running() {
        let root = TempDir::new().unwrap();
        let program = root.path().join("render.sh");
        std::fs::write(&program, "#!/bin/sh\nsleep 30\n").unwrap();
        std::process::Command::new("chmod")
            .arg("+x")
            .arg(&program)
            .status()
            .unwrap();

        let executor = ProcessExecutor::new(program, "true".to_string());
        executor.launch_render(&render_task(&root, "10")).await.unwrap();
        let pid = group_of(&executor, "10");
        tokio::time::sleep(Duration::from_millis(200)).await;

        executor.terminate(&"1".parse().unwrap()).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(alive(pid));

        executor.terminate(&"10".parse().unwrap()).await;
        let mut stopped = false;
        for _ in 0..50 {
            if !alive(pid) {
                stopped = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(stopped);
    }

    #[tokio::test]
    async fn test_render_task_without_frames_is_rejected() {
        let root = TempDir::new().unwrap();
        let executor = ProcessExecutor::new(PathBuf::from("/bin/true"), "true".to_string());
        let mut task = render_task(&root, "7");
        task.frames = None;

        assert!(executor.launch_render(&task).await.is_err());
        assert!(executor.groups.lock().unwrap().is_empty());
    }
}
