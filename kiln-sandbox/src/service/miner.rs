//! Miner supervision for sandboxes started for crypto mining

use anyhow::{Context, Result};
use kiln_core::domain::telemetry::MinerStats;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Keeps one miner process alive and reads back its statistics
pub struct Miner {
    command: String,
    stats_path: PathBuf,
    child: Mutex<Option<Child>>,
}

impl Miner {
    pub fn new(command: String, stats_path: PathBuf) -> Self {
        Self {
            command,
            stats_path,
            child: Mutex::new(None),
        }
    }

    /// Start the miner unless it is already running
    ///
    /// Returns true if a new process was spawned.
    pub async fn ensure_running(&self) -> Result<bool> {
        let mut child = self.child.lock().await;

        if let Some(running) = child.as_mut() {
            match running.try_wait() {
                Ok(None) => return Ok(false),
                Ok(Some(status)) => warn!("Miner exited with {}, restarting", status),
                Err(e) => warn!("Failed to poll miner process: {}", e),
            }
        }

        info!("Starting miner: {}", self.command);
        let spawned = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .context("Failed to start miner")?;

        *child = Some(spawned);
        Ok(true)
    }

    /// Stop the miner; a miner that is not running is left alone
    pub async fn stop(&self) {
        let Some(mut running) = self.child.lock().await.take() else {
            return;
        };

        if let Err(e) = running.kill().await {
            debug!("Miner already gone: {}", e);
        }
        info!("Miner stopped");
    }

    /// Current statistics; zeroed when the miner has not written any
    pub async fn stats(&self) -> MinerStats {
        let contents = match tokio::fs::read_to_string(&self.stats_path).await {
            Ok(contents) => contents,
            Err(_) => return MinerStats::default(),
        };

        serde_json::from_str(&contents).unwrap_or_else(|e| {
            warn!("Unreadable miner stats in {}: {}", self.stats_path.display(), e);
            MinerStats::default()
        })
    }
}

/// Total hash rate of a stats record
pub fn total_khs(stats: &MinerStats) -> f64 {
    stats.hs.iter().sum()
}
