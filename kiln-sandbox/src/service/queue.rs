//! Task Queue
//!
//! Ordered, deduplicated queue of compute tasks for one execution slot.
//! Only the head of the queue ever runs; `tick` retires finished or
//! timed-out work and admits the next task.

use chrono::{DateTime, Utc};
use kiln_core::domain::task::{FrameRange, Task, TaskId, TaskStatus, files};
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::repository::task_repository;
use crate::service::QueueError;
use crate::service::benchmark::{self, BenchmarkProgress};
use crate::service::executor::TaskExecutor;
use crate::service::reporter::ResultReporter;

pub type Result<T> = std::result::Result<T, QueueError>;

/// Settings of one slot's queue
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Directory task working directories are created under
    pub root: PathBuf,
    pub render_timeout: Duration,
    pub benchmark_timeout: Duration,
}

pub struct TaskQueue {
    pool: SqlitePool,
    config: QueueConfig,
    executor: Arc<dyn TaskExecutor>,
    reporter: Arc<dyn ResultReporter>,

    /// Serializes push, pop and tick
    lock: Mutex<()>,
}

impl TaskQueue {
    pub fn new(
        pool: SqlitePool,
        config: QueueConfig,
        executor: Arc<dyn TaskExecutor>,
        reporter: Arc<dyn ResultReporter>,
    ) -> Self {
        Self {
            pool,
            config,
            executor,
            reporter,
            lock: Mutex::new(()),
        }
    }

    /// Enqueue a render task
    ///
    /// Returns false without touching anything when a task with the same
    /// identity is already queued.
    pub async fn push(&self, task_id: &TaskId, frames: FrameRange, payload: &[u8]) -> Result<bool> {
        if task_id.is_benchmark() {
            return Err(QueueError::Validation(
                "the benchmark identity is reserved".to_string(),
            ));
        }

        let _guard = self.lock.lock().await;

        if task_repository::exists(&self.pool, task_id).await? {
            debug!("Task {} already queued, ignoring push", task_id);
            return Ok(false);
        }

        let dir = self.task_dir(task_id);
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(dir.join(files::RENDER_FILE), payload).await?;

        let inserted = task_repository::insert(&self.pool, task_id, &dir, Some(frames)).await?;
        if inserted {
            info!(
                "Queued task {} (frames {}-{})",
                task_id, frames.start, frames.end
            );
        }
        Ok(inserted)
    }

    /// Enqueue the benchmark under its sentinel identity
    pub async fn push_benchmark(&self) -> Result<bool> {
        let task_id = TaskId::benchmark();
        let _guard = self.lock.lock().await;

        if task_repository::exists(&self.pool, &task_id).await? {
            debug!("Benchmark already queued, ignoring push");
            return Ok(false);
        }

        let dir = self.task_dir(&task_id);
        tokio::fs::create_dir_all(&dir).await?;

        let inserted = task_repository::insert(&self.pool, &task_id, &dir, None).await?;
        if inserted {
            info!("Queued benchmark");
        }
        Ok(inserted)
    }

    /// Remove a task, kill its processes and delete its directory
    ///
    /// Returns false if the task was not queued.
    pub async fn pop(&self, task_id: &TaskId) -> Result<bool> {
        let _guard = self.lock.lock().await;
        self.pop_locked(task_id).await
    }

    /// Task identities in queue order
    pub async fn status(&self) -> Result<Vec<TaskId>> {
        Ok(task_repository::list_ids(&self.pool).await?)
    }

    pub async fn tick(&self) -> Result<()> {
        self.tick_at(Utc::now()).await
    }

    /// One scheduling step evaluated at `now`
    ///
    /// Drains every finished or timed-out task at the head of the queue
    /// before admitting the next one.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<()> {
        let _guard = self.lock.lock().await;

        loop {
            let Some(task) = task_repository::head(&self.pool).await? else {
                return Ok(());
            };

            if task.finished_marker().exists() {
                self.retire(&task.id, TaskStatus::Completed).await?;
                continue;
            }

            if !task.is_benchmark() {
                if let Some(started) = self.started_at(&task).await {
                    let elapsed = (now - started).to_std().unwrap_or_default();
                    if elapsed > self.config.render_timeout {
                        warn!("Task {} ran for {:?}", task.id, elapsed);
                        self.retire(&task.id, TaskStatus::TimedOut).await?;
                        continue;
                    }
                }
            }

            if task.is_benchmark() {
                let progress = benchmark::drive(
                    &task,
                    now,
                    self.config.benchmark_timeout,
                    self.executor.as_ref(),
                    self.reporter.as_ref(),
                )
                .await?;

                if task.status == TaskStatus::Queued {
                    task_repository::mark_running(&self.pool, &task.id, now).await?;
                }

                match progress {
                    BenchmarkProgress::Finished(status) => {
                        self.retire(&task.id, status).await?;
                        continue;
                    }
                    BenchmarkProgress::NotFinished => return Ok(()),
                }
            }

            if task.status == TaskStatus::Queued {
                if let Err(e) = self.executor.launch_render(&task).await {
                    error!("Failed to start task {}: {:#}", task.id, e);
                    self.pop_locked(&task.id).await?;
                    continue;
                }
                task_repository::mark_running(&self.pool, &task.id, now).await?;
            }

            return Ok(());
        }
    }

    /// Removes a task that reached a terminal status
    async fn retire(&self, task_id: &TaskId, status: TaskStatus) -> Result<()> {
        info!("Task {} {}", task_id, status);
        self.pop_locked(task_id).await?;
        Ok(())
    }

    async fn pop_locked(&self, task_id: &TaskId) -> Result<bool> {
        let Some(dir) = task_repository::delete(&self.pool, task_id).await? else {
            debug!("Task {} not queued, nothing to pop", task_id);
            return Ok(false);
        };

        self.executor.terminate(task_id).await;
        remove_dir(&dir).await?;

        info!("Removed task {}", task_id);
        Ok(true)
    }

    /// When execution began: the executor's start marker, else the admission time
    async fn started_at(&self, task: &Task) -> Option<DateTime<Utc>> {
        match tokio::fs::metadata(task.started_marker()).await {
            Ok(meta) => meta.modified().ok().map(DateTime::<Utc>::from),
            Err(_) => task.started_at,
        }
    }

    fn task_dir(&self, task_id: &TaskId) -> PathBuf {
        self.config.root.join(task_id.as_str())
    }
}

async fn remove_dir(dir: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
