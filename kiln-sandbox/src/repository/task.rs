//! Task Repository
//!
//! Database operations on the durable queue. Insertion order is queue order.

use chrono::{DateTime, Utc};
use kiln_core::domain::task::{FrameRange, Task, TaskId, TaskStatus};
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};

/// Append a task; returns false if a task with the same identity exists
pub async fn insert(
    pool: &SqlitePool,
    task_id: &TaskId,
    task_dir: &Path,
    frames: Option<FrameRange>,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        INSERT OR IGNORE INTO tasks (task_id, task_dir, start_frame, end_frame, status, created_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(task_id.as_str())
    .bind(task_dir.to_string_lossy().into_owned())
    .bind(frames.map(|f| f.start as i64))
    .bind(frames.map(|f| f.end as i64))
    .bind(TaskStatus::Queued.as_str())
    .bind(Utc::now())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

pub async fn exists(pool: &SqlitePool, task_id: &TaskId) -> Result<bool, sqlx::Error> {
    let row: Option<(i64,)> = sqlx::query_as("SELECT id FROM tasks WHERE task_id = $1")
        .bind(task_id.as_str())
        .fetch_optional(pool)
        .await?;

    Ok(row.is_some())
}

/// Oldest task in the queue
pub async fn head(pool: &SqlitePool) -> Result<Option<Task>, sqlx::Error> {
    let row = sqlx::query_as::<_, TaskRow>(
        r#"
        SELECT task_id, task_dir, start_frame, end_frame, status, started_at
        FROM tasks
        ORDER BY id ASC
        LIMIT 1
        "#,
    )
    .fetch_optional(pool)
    .await?;

    row.map(TaskRow::into_task).transpose()
}

/// Task identities in queue order
pub async fn list_ids(pool: &SqlitePool) -> Result<Vec<TaskId>, sqlx::Error> {
    let rows: Vec<(String,)> = sqlx::query_as("SELECT task_id FROM tasks ORDER BY id ASC")
        .fetch_all(pool)
        .await?;

    rows.into_iter().map(|(id,)| parse_task_id(&id)).collect()
}

pub async fn mark_running(
    pool: &SqlitePool,
    task_id: &TaskId,
    started_at: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE tasks
        SET status = $1, started_at = $2
        WHERE task_id = $3
        "#,
    )
    .bind(TaskStatus::Running.as_str())
    .bind(started_at)
    .bind(task_id.as_str())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Remove a task, returning its working directory if it was present
pub async fn delete(pool: &SqlitePool, task_id: &TaskId) -> Result<Option<PathBuf>, sqlx::Error> {
    let row: Option<(String,)> =
        sqlx::query_as("DELETE FROM tasks WHERE task_id = $1 RETURNING task_dir")
            .bind(task_id.as_str())
            .fetch_optional(pool)
            .await?;

    Ok(row.map(|(dir,)| PathBuf::from(dir)))
}

fn parse_task_id(raw: &str) -> Result<TaskId, sqlx::Error> {
    raw.parse::<TaskId>()
        .map_err(|e| sqlx::Error::Decode(e.into()))
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct TaskRow {
    task_id: String,
    task_dir: String,
    start_frame: Option<i64>,
    end_frame: Option<i64>,
    status: String,
    started_at: Option<DateTime<Utc>>,
}

impl TaskRow {
    fn into_task(self) -> Result<Task, sqlx::Error> {
        let frames = match (self.start_frame, self.end_frame) {
            (Some(start), Some(end)) => FrameRange::new(start as u32, end as u32),
            _ => None,
        };

        Ok(Task {
            id: parse_task_id(&self.task_id)?,
            dir: PathBuf::from(self.task_dir),
            frames,
            // Unknown status strings are treated as not yet started
            status: self.status.parse().unwrap_or(TaskStatus::Queued),
            started_at: self.started_at,
        })
    }
}
