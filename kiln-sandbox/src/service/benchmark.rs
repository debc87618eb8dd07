//! Benchmark sub-state-machine
//!
//! The benchmark occupies the queue under the sentinel identity. Its progress
//! lives entirely in marker files inside the task directory:
//!
//! - no `started` marker: not started yet
//! - `started` but no `benchmark.txt`: running, subject to the absolute timeout
//! - `benchmark.txt` present: finished, score ready to report

use chrono::{DateTime, Utc};
use kiln_core::domain::task::{Task, TaskStatus, files};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::service::QueueError;
use crate::service::executor::TaskExecutor;
use crate::service::reporter::ResultReporter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BenchmarkProgress {
    NotFinished,
    /// `Completed` once a score was read, `TimedOut` without one
    Finished(TaskStatus),
}

/// Advance the benchmark by one step
pub async fn drive(
    task: &Task,
    now: DateTime<Utc>,
    timeout: Duration,
    executor: &dyn TaskExecutor,
    reporter: &dyn ResultReporter,
) -> Result<BenchmarkProgress, QueueError> {
    let started = task.started_marker();
    let output = task.dir.join(files::BENCHMARK_OUTPUT);

    if !started.exists() {
        tokio::fs::create_dir_all(&task.dir).await?;
        tokio::fs::write(&started, b"").await?;

        if let Err(e) = executor.launch_benchmark(task).await {
            error!("Failed to launch benchmark: {:#}", e);
        }
        return Ok(BenchmarkProgress::NotFinished);
    }

    if !output.exists() {
        let elapsed = elapsed_since(&started, now).await?;
        if elapsed > timeout {
            warn!("Benchmark produced no score within {:?}", timeout);
            remove_quietly(&started).await;
            return Ok(BenchmarkProgress::Finished(TaskStatus::TimedOut));
        }

        debug!("Benchmark still running ({:?} elapsed)", elapsed);
        return Ok(BenchmarkProgress::NotFinished);
    }

    let contents = tokio::fs::read_to_string(&output).await?;
    let score = parse_score(&contents).unwrap_or_default();

    info!("Sending benchmark score {} to servers", score);
    if let Err(e) = reporter.report_benchmark(&score).await {
        error!("Failed to report benchmark score: {:#}", e);
    }

    remove_quietly(&started).await;
    remove_quietly(&output).await;

    Ok(BenchmarkProgress::Finished(TaskStatus::Completed))
}

/// The score is printed on the line following `Total score:`
pub fn parse_score(contents: &str) -> Option<String> {
    let mut lines = contents.lines();
    lines.find(|line| line.contains("Total score:"))?;
    lines
        .next()
        .map(|line| line.trim().to_string())
        .filter(|score| !score.is_empty())
}

/// Time since a marker file was last modified
pub async fn elapsed_since(marker: &Path, now: DateTime<Utc>) -> std::io::Result<Duration> {
    let modified: DateTime<Utc> = tokio::fs::metadata(marker).await?.modified()?.into();
    Ok((now - modified).to_std().unwrap_or_default())
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove {}: {}", path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use kiln_core::domain::task::TaskId;
    use tempfile::TempDir;

    struct IdleExecutor;

    #[async_trait]
    impl TaskExecutor for IdleExecutor {
        async fn launch_render(&self, _task: &Task) -> anyhow::Result<()> {
            Ok(())
        }
        async fn launch_benchmark(&self, _task: &Task) -> anyhow::Result<()> {
            Ok(())
        }
        async fn terminate(&self, _task_id: &TaskId) {}
    }

    struct IdleReporter;

    #[async_trait]
    impl ResultReporter for IdleReporter {
        async fn report_benchmark(&self, _score: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn benchmark_task(root: &TempDir) -> Task {
        Task {
            id: TaskId::benchmark(),
            dir: root.path().join("-1"),
            frames: None,
            status: TaskStatus::Running,
            started_at: None,
        }
    }

    async fn step(task: &Task, now: DateTime<Utc>) -> BenchmarkProgress {
        drive(task, now, Duration::from_secs(20 * 60), &IdleExecutor, &IdleReporter)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_drive_reports_terminal_status() {
        let root = TempDir::new().unwrap();
        let task = benchmark_task(&root);

        assert_eq!(step(&task, Utc::now()).await, BenchmarkProgress::NotFinished);
        assert_eq!(
            step(&task, Utc::now() + chrono::Duration::minutes(21)).await,
            BenchmarkProgress::Finished(TaskStatus::TimedOut)
        );
        assert!(!task.started_marker().exists());

        assert_eq!(step(&task, Utc::now()).await, BenchmarkProgress::NotFinished);
        std::fs::write(task.dir.join(files::BENCHMARK_OUTPUT), "Total score:\n300\n").unwrap();
        assert_eq!(
            step(&task, Utc::now()).await,
            BenchmarkProgress::Finished(TaskStatus::Completed)
        );
    }

    #[test]
    fn test_parse_score_takes_following_line() {
        let output = "OctaneBench 2020\nTotal score:\n  412.73  \nDone\n";
        assert_eq!(parse_score(output), Some("412.73".to_string()));
    }

    #[test]
    fn test_parse_score_missing() {
        assert_eq!(parse_score("crashed before finishing"), None);
        assert_eq!(parse_score("Total score:"), None);
    }
}
