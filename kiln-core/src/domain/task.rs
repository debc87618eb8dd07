//! Task domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Identity reserved for the hardware benchmark task
pub const BENCHMARK_TASK_ID: &str = "-1";

/// File names inside a task's working directory
pub mod files {
    /// Input payload written on push
    pub const RENDER_FILE: &str = "render_file.blend";
    /// Directory the executor renders into
    pub const OUTPUT_DIR: &str = "output";
    /// Marker touched by the executor when execution begins
    pub const STARTED: &str = "started";
    /// Marker touched by the executor when execution ends, successful or not
    pub const FINISHED: &str = "finished";
    /// Score file the benchmark executor writes
    pub const BENCHMARK_OUTPUT: &str = "benchmark.txt";
}

/// Externally supplied job identity
///
/// Task ids become directory names and process tags, so only ASCII
/// alphanumerics, `-` and `_` are accepted. The control plane sends them
/// either as strings or as integers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "RawTaskId", into = "String")]
pub struct TaskId(String);

#[derive(Deserialize)]
#[serde(untagged)]
enum RawTaskId {
    Int(i64),
    Str(String),
}

impl TryFrom<RawTaskId> for TaskId {
    type Error = String;

    fn try_from(raw: RawTaskId) -> Result<Self, Self::Error> {
        match raw {
            RawTaskId::Int(n) => Ok(TaskId(n.to_string())),
            RawTaskId::Str(s) => s.parse(),
        }
    }
}

impl From<TaskId> for String {
    fn from(id: TaskId) -> Self {
        id.0
    }
}

impl FromStr for TaskId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err("task id cannot be empty".to_string());
        }
        if s.len() > 128 {
            return Err("task id is too long (max 128 characters)".to_string());
        }
        if !s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(format!("task id '{}' contains invalid characters", s));
        }
        Ok(TaskId(s.to_string()))
    }
}

impl TaskId {
    /// The benchmark sentinel
    pub fn benchmark() -> Self {
        TaskId(BENCHMARK_TASK_ID.to_string())
    }

    pub fn is_benchmark(&self) -> bool {
        self.0 == BENCHMARK_TASK_ID
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Tag carried on the command line of every process run for this task,
    /// used to signal the whole group on pop
    pub fn process_tag(&self) -> String {
        format!("task_{}", self.0)
    }

    /// `pkill -f` pattern matching only command lines that end with this
    /// task's tag, so `task_1` leaves `task_10` alone
    pub fn process_pattern(&self) -> String {
        format!("(^| ){}$", self.process_tag())
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Inclusive frame range of a render task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameRange {
    pub start: u32,
    pub end: u32,
}

impl FrameRange {
    pub fn new(start: u32, end: u32) -> Option<Self> {
        (start <= end).then_some(Self { start, end })
    }

    /// Range of `count` frames beginning at `start`
    pub fn from_count(start: u32, count: u32) -> Option<Self> {
        let end = start.checked_add(count.checked_sub(1)?)?;
        Some(Self { start, end })
    }

    pub fn frame_count(&self) -> u32 {
        self.end - self.start + 1
    }
}

/// Task lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    TimedOut,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "Queued",
            TaskStatus::Running => "Running",
            TaskStatus::Completed => "Completed",
            TaskStatus::TimedOut => "TimedOut",
        }
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Queued" => Ok(TaskStatus::Queued),
            "Running" => Ok(TaskStatus::Running),
            "Completed" => Ok(TaskStatus::Completed),
            "TimedOut" => Ok(TaskStatus::TimedOut),
            other => Err(format!("unknown task status '{}'", other)),
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A compute job owned by one slot's queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,

    /// Working directory holding the payload, output and markers
    pub dir: PathBuf,

    /// Frames to render; absent for the benchmark
    pub frames: Option<FrameRange>,

    pub status: TaskStatus,

    /// Set the instant execution begins
    pub started_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn is_benchmark(&self) -> bool {
        self.id.is_benchmark()
    }

    pub fn started_marker(&self) -> PathBuf {
        self.dir.join(files::STARTED)
    }

    pub fn finished_marker(&self) -> PathBuf {
        self.dir.join(files::FINISHED)
    }
}
