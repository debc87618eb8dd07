//! Service Module
//!
//! The task queue and the processes it drives.

pub mod benchmark;
pub mod executor;
pub mod miner;
pub mod queue;
pub mod reporter;

pub use executor::{ProcessExecutor, TaskExecutor};
pub use miner::Miner;
pub use queue::{QueueConfig, TaskQueue};
pub use reporter::{ControlPlaneReporter, ResultReporter};

use thiserror::Error;

/// Queue service error type
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("invalid task: {0}")]
    Validation(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),
}
