//! `uninstall`, `send_logs` and `status` commands

use anyhow::{Context, Result};
use serde_json::{Value, json};
use tracing::info;

use super::Dispatcher;
use crate::lifecycle::install;
use crate::shell::Verbosity;

/// Removes every workload and the local installation
pub async fn uninstall(dispatcher: &Dispatcher) -> Result<()> {
    info!("Uninstalling daemon");
    dispatcher.gpus.stop_all().await;
    dispatcher.sandbox.remove_images().await;
    install::remove_crontab(dispatcher.shell.as_ref()).await;
    dispatcher
        .shell
        .run(
            &format!("sudo rm -rf {}", dispatcher.config.install_dir.display()),
            Verbosity::Normal,
        )
        .await;
    Ok(())
}

pub fn send_logs(dispatcher: &Dispatcher) -> Result<Value> {
    let logs = dispatcher
        .trace
        .read_lines()
        .context("Failed to read daemon log")?;
    Ok(json!({ "logs": logs }))
}

pub async fn status(dispatcher: &Dispatcher) -> Result<Value> {
    let state = dispatcher.state.get_state().await;
    Ok(json!({ "state": state }))
}
