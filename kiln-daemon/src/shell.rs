//! Shell command execution
//!
//! External commands never fail loudly: a command that cannot be run or
//! exits non-zero yields `None` and, unless very quiet, an error log line.

use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, error};

/// How much of a command's execution is logged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    /// Command and output at debug level, failures at error level
    Normal,
    /// Failures only
    Quiet,
    /// Nothing at all
    VeryQuiet,
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a shell command to completion, returning its output on success
    async fn run(&self, cmd: &str, verbosity: Verbosity) -> Option<String>;

    /// Start a shell command without waiting for it
    fn spawn_detached(&self, cmd: &str) -> bool;
}

/// Runs commands through `sh -c`
#[derive(Debug, Clone, Default)]
pub struct SystemShell;

#[async_trait]
impl CommandRunner for SystemShell {
    async fn run(&self, cmd: &str, verbosity: Verbosity) -> Option<String> {
        if verbosity == Verbosity::Normal {
            debug!("Running command {}...", cmd);
        }

        let output = match Command::new("sh")
            .arg("-c")
            .arg(cmd)
            .stdin(Stdio::null())
            .output()
            .await
        {
            Ok(output) => output,
            Err(e) => {
                if verbosity != Verbosity::VeryQuiet {
                    error!("Failed to run '{}': {}", cmd, e);
                }
                return None;
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();

        if !output.status.success() {
            if verbosity != Verbosity::VeryQuiet {
                let stderr = String::from_utf8_lossy(&output.stderr);
                error!(
                    "Command '{}' failed with {}\n{}{}",
                    cmd,
                    output.status,
                    stdout,
                    stderr.trim_end()
                );
            }
            return None;
        }

        if verbosity == Verbosity::Normal && !stdout.trim().is_empty() {
            debug!("Output: {}", stdout.trim_end().replace('\n', " \\n "));
        }

        Some(stdout)
    }

    fn spawn_detached(&self, cmd: &str) -> bool {
        debug!("Spawning {} in the background", cmd);

        match std::process::Command::new("sh")
            .arg("-c")
            .arg(cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
        {
            Ok(_) => true,
            Err(e) => {
                error!("Failed to spawn '{}': {}", cmd, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_successful_command_returns_output() {
        let output = SystemShell.run("echo hello", Verbosity::Quiet).await;
        assert_eq!(output.as_deref(), Some("hello\n"));
    }

    #[tokio::test]
    async fn test_failed_command_is_none() {
        assert_eq!(SystemShell.run("exit 4", Verbosity::VeryQuiet).await, None);
    }
}
