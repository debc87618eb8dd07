//! Kiln Daemon
//!
//! Long-running agent on a GPU host. It keeps every GPU busy, either with
//! crypto mining or with render jobs dispatched by the control plane, each
//! workload running in its own sandbox container.
//!
//! Architecture:
//! - Lifecycle: startup classification, update handoff, self-healing
//! - GPU manager: per-GPU workload state machine over the sandbox driver
//! - Commands: authorized dispatch for the endpoint and check-in answers
//! - Scheduler: mining sweep, check-in and log rotation loops
//!
//! The trace file next to the installation is both the operator's log and
//! durable state: how the previous process ended decides how this one starts.

mod api;
mod cli;
mod commands;
mod config;
mod gpu;
mod hardware;
mod lifecycle;
mod logging;
mod registration;
mod sandbox;
mod scheduler;
mod shell;
mod state;
mod trace;
mod tuning;

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::cli::{Cli, Commands};
use crate::config::DaemonConfig;
use crate::lifecycle::Lifecycle;
use crate::sandbox::{DockerSandbox, Sandbox};
use crate::shell::{CommandRunner, SystemShell};
use crate::trace::Trace;
use kiln_client::ControlPlaneClient;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Arc::new(load_config()?);

    // Read before logging touches the file
    let trace = Arc::new(Trace::new(&config.log_path, &config.lifecycle_path));
    let first_startup = !trace.exists();
    let startup = trace.classify_startup();

    let shell: Arc<dyn CommandRunner> = Arc::new(SystemShell);
    let sandbox: Arc<dyn Sandbox> = Arc::new(DockerSandbox::new(
        shell.clone(),
        config.sandbox_image.clone(),
        config.sandbox_port,
        config.sandbox_start_attempts,
        config.sandbox_ready_timeout,
    ));
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(60))
        .build()
        .context("Failed to build HTTP client")?;
    let client = Arc::new(ControlPlaneClient::with_client(
        config.control_plane_url.clone(),
        http,
    ));

    let lifecycle = Lifecycle::new(config.clone(), shell, sandbox, client, trace);

    if first_startup {
        init_logging(&config)?;
        lifecycle.first_startup().await;
        return Ok(());
    }

    match cli.command {
        // Writes nothing to the trace
        Some(Commands::Sleep) => lifecycle.placeholder().await,
        Some(Commands::Update { target_version }) => {
            init_logging(&config)?;
            lifecycle.second_update(target_version).await;
        }
        None => {
            init_logging(&config)?;
            lifecycle.run(startup).await?;
        }
    }

    Ok(())
}

fn init_logging(config: &DaemonConfig) -> Result<()> {
    logging::init(&config.log_path)?;
    info!(
        "Loaded configuration: install_dir={}, control_plane_url={}",
        config.install_dir.display(),
        config.control_plane_url
    );
    Ok(())
}

/// Loads configuration from environment variables with fallback to defaults
fn load_config() -> Result<DaemonConfig> {
    match DaemonConfig::from_env() {
        Ok(config) => {
            config.validate()?;
            Ok(config)
        }
        Err(e) => {
            eprintln!("Failed to load config from environment ({}), using defaults", e);
            let config = DaemonConfig::default();
            config.validate()?;
            Ok(config)
        }
    }
}
