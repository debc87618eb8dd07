use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kiln_client::ControlPlaneClient;
use kiln_core::domain::gpu::WorkloadKind;
use kiln_core::domain::task::FrameRange;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kiln_sandbox::api::{self, AppState};
use kiln_sandbox::config::SandboxConfig;
use kiln_sandbox::db;
use kiln_sandbox::render::{self, RenderJob};
use kiln_sandbox::service::{
    ControlPlaneReporter, Miner, ProcessExecutor, QueueConfig, TaskQueue,
};

#[derive(Parser)]
#[command(name = "kiln-sandbox")]
#[command(about = "Per-GPU task queue and executor", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the queue listener (default)
    Serve,

    /// Render the frames of one task and upload the result
    Run {
        task_dir: PathBuf,
        start_frame: u32,
        end_frame: u32,
        /// Tag identifying every process of the task
        tag: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kiln_sandbox=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = load_config()?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await,
        Commands::Run {
            task_dir,
            start_frame,
            end_frame,
            tag,
        } => {
            let frames = FrameRange::new(start_frame, end_frame)
                .context("start_frame must not exceed end_frame")?;
            info!("Running {} for {}", tag, task_dir.display());

            let client = ControlPlaneClient::new(config.control_plane_url.clone());
            let job = RenderJob { task_dir, frames };
            render::run(&job, &config.render_command, &client, &config.sandbox_id).await
        }
    }
}

async fn serve(config: SandboxConfig) -> Result<()> {
    info!(
        "Starting sandbox {} on GPU {} for {}",
        config.sandbox_id, config.gpu, config.workload
    );

    tokio::fs::create_dir_all(&config.file_dir)
        .await
        .context("Failed to create task directory root")?;

    let pool = db::create_pool(&config.database_url)
        .await
        .context("Failed to create database pool")?;
    db::run_migrations(&pool)
        .await
        .context("Failed to run database migrations")?;

    let client = ControlPlaneClient::new(config.control_plane_url.clone());
    let executor = ProcessExecutor::current_exe(config.benchmark_command.clone())?;
    let reporter = ControlPlaneReporter::new(client, config.sandbox_id.clone());

    let queue = Arc::new(TaskQueue::new(
        pool,
        QueueConfig {
            root: config.file_dir.clone(),
            render_timeout: config.render_timeout,
            benchmark_timeout: config.benchmark_timeout,
        },
        Arc::new(executor),
        Arc::new(reporter),
    ));

    let miner = match (&config.workload, &config.miner_command) {
        (WorkloadKind::Crypto, Some(command)) => Some(Arc::new(Miner::new(
            command.clone(),
            config.miner_stats_path.clone(),
        ))),
        _ => None,
    };

    let ticker = spawn_tick_loop(
        Arc::clone(&queue),
        miner.clone(),
        config.tick_interval,
    );

    let app = api::create_router(AppState {
        queue,
        miner: miner.clone(),
    });

    info!("Listening on {}", config.bind_addr);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(config.timeout))
        .await
        .context("Failed to start server")?;

    ticker.abort();
    if let Some(miner) = miner {
        miner.stop().await;
    }

    info!("Sandbox stopped");
    Ok(())
}

fn spawn_tick_loop(
    queue: Arc<TaskQueue>,
    miner: Option<Arc<Miner>>,
    period: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);

        loop {
            interval.tick().await;

            if let Err(e) = queue.tick().await {
                error!("Error during queue tick: {}", e);
            }

            if let Some(miner) = &miner {
                if let Err(e) = miner.ensure_running().await {
                    error!("Failed to keep miner running: {:#}", e);
                }
            }
        }
    })
}

/// Resolves on Ctrl-C or when the sandbox lifetime runs out
async fn shutdown_signal(timeout: Option<Duration>) {
    let expiry = async {
        match timeout {
            Some(timeout) => tokio::time::sleep(timeout).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received Ctrl-C, shutting down"),
        _ = expiry => info!("Sandbox lifetime reached, shutting down"),
    }
}

/// Loads configuration from environment variables with fallback to defaults
fn load_config() -> Result<SandboxConfig> {
    match SandboxConfig::from_env() {
        Ok(config) => {
            config.validate()?;
            Ok(config)
        }
        Err(e) => {
            info!("Failed to load config from environment ({}), using defaults", e);
            let config = SandboxConfig::default();
            config.validate()?;
            Ok(config)
        }
    }
}
