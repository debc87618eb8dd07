//! Lifecycle state machine
//!
//! ```text
//! FirstStartup ──────────────────────────────> reboot
//! NormalStartup(Clean | BenignRestart | Crashed) ──> Running ──> ShuttingDown
//! UpdateInProgress(second pass) ──> exit             │
//!                                                    └─ error ─> self-heal ─> update ─> exit
//! ```
//!
//! Every phase that ends the process is recorded in the trace so the next
//! process can tell a deliberate handoff from a crash.

pub mod install;
pub mod update;

use anyhow::Context;
use kiln_client::ControlPlaneClient;
use kiln_core::domain::command::UpdateParams;
use kiln_core::domain::gpu::GpuStatus;
use kiln_core::domain::telemetry::HostState;
use kiln_core::dto::control::LogUpload;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::api::{self, AppState};
use crate::commands::Dispatcher;
use crate::config::DaemonConfig;
use crate::gpu::GpuManager;
use crate::registration::{self, RegistrationStore};
use crate::sandbox::Sandbox;
use crate::scheduler::Scheduler;
use crate::shell::{CommandRunner, Verbosity};
use crate::state::{self, StateAggregator};
use crate::trace::{Phase, StartupKind, Trace};
use crate::tuning::ClockTuner;
use update::Updater;

#[derive(Debug, Error)]
pub enum DaemonError {
    /// The host cannot run the daemon at all; fatal
    #[error("Requirements not met: {0}")]
    RequirementsNotMet(String),

    /// Anything else; handled by self-healing
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Collaborators that outlive a single Running phase
pub struct Lifecycle {
    config: Arc<DaemonConfig>,
    shell: Arc<dyn CommandRunner>,
    sandbox: Arc<dyn Sandbox>,
    client: Arc<ControlPlaneClient>,
    trace: Arc<Trace>,
}

impl Lifecycle {
    pub fn new(
        config: Arc<DaemonConfig>,
        shell: Arc<dyn CommandRunner>,
        sandbox: Arc<dyn Sandbox>,
        client: Arc<ControlPlaneClient>,
        trace: Arc<Trace>,
    ) -> Self {
        Self {
            config,
            shell,
            sandbox,
            client,
            trace,
        }
    }

    fn updater(&self) -> Updater {
        Updater::new(
            self.config.clone(),
            self.shell.clone(),
            self.sandbox.clone(),
            self.trace.clone(),
        )
    }

    fn record(&self, phase: Phase) {
        if let Err(e) = self.trace.record(phase) {
            warn!("Failed to record lifecycle phase {:?}: {}", phase, e);
        }
    }

    /// One-time installation, ending in a reboot
    pub async fn first_startup(&self) {
        install::first_startup(&self.config, self.shell.as_ref()).await;
        self.record(Phase::Rebooting);
        self.shell.run("sudo reboot", Verbosity::Normal).await;
    }

    /// Re-runs the update from the freshly built code, then exits
    pub async fn second_update(&self, target_version: Option<String>) {
        info!("Entering second update...");
        self.updater()
            .update(&UpdateParams::code(target_version), true)
            .await;
        self.record(Phase::SecondUpdateComplete);
        info!("Exiting second update.");
    }

    /// Keeps a daemon process visible to supervisors during a handoff
    pub async fn placeholder(&self) {
        tokio::time::sleep(self.config.placeholder_duration).await;
    }

    /// Normal startup: runs until shutdown, self-healing on errors
    pub async fn run(&self, startup: StartupKind) -> Result<(), DaemonError> {
        match startup {
            StartupKind::Clean => info!("Starting daemon..."),
            StartupKind::BenignRestart => {
                info!("Daemon restarted after reboot or update");
                self.kill_other_daemons().await;
            }
            StartupKind::Crashed => error!("Daemon crashed."),
        }

        match self.run_until_shutdown().await {
            Ok(()) => Ok(()),
            Err(DaemonError::RequirementsNotMet(msg)) => {
                error!("Requirements not met: {}", msg);
                Err(DaemonError::RequirementsNotMet(msg))
            }
            Err(DaemonError::Other(e)) => {
                self.self_heal(e).await;
                Ok(())
            }
        }
    }

    /// Kills daemon processes left over from the update window
    async fn kill_other_daemons(&self) {
        let Some(output) = self
            .shell
            .run("pgrep -f kiln-daemon", Verbosity::VeryQuiet)
            .await
        else {
            return;
        };

        let spared = [std::process::id(), std::os::unix::process::parent_id()];
        for pid in parse_pids(&output).filter(|pid| !spared.contains(pid)) {
            info!("Killing leftover daemon process {}", pid);
            self.shell
                .run(&format!("kill -9 {}", pid), Verbosity::VeryQuiet)
                .await;
        }
    }

    async fn run_until_shutdown(&self) -> Result<(), DaemonError> {
        let gpus = install::prepare_host(&self.config, self.shell.as_ref()).await?;
        self.record(Phase::Running);

        let initial_state = HostState {
            n_gpus: gpus.len(),
            gpus: gpus.iter().map(GpuStatus::stopped).collect(),
            ..Default::default()
        };
        let session = registration::establish(
            &RegistrationStore::new(&self.config.registration_path),
            &self.config.rig_config_path,
            self.config.daemon_port,
            &self.client,
            initial_state,
        )
        .await?;

        let tuner = Arc::new(ClockTuner::new(
            self.shell.clone(),
            self.config.clock_restore_command.clone(),
        ));
        let gpus = Arc::new(GpuManager::new(
            gpus,
            self.sandbox.clone(),
            session.clone(),
            tuner,
            self.config.benchmark_timeout,
        ));
        let version = state::detect_version(self.shell.as_ref(), &self.config.install_dir).await;
        info!("Running version {}", version);
        let aggregator = Arc::new(StateAggregator::new(gpus.clone(), version));

        let (finished_tx, finished_rx) = watch::channel(false);
        let dispatcher = Arc::new(Dispatcher::new(
            self.config.clone(),
            session.clone(),
            gpus.clone(),
            aggregator.clone(),
            self.sandbox.clone(),
            self.shell.clone(),
            self.trace.clone(),
            Arc::new(self.updater()),
            finished_tx,
        ));

        let router = api::create_router(AppState {
            dispatcher: dispatcher.clone(),
            assume_secure: self.config.assume_secure,
        });
        let addr = format!("0.0.0.0:{}", self.config.daemon_port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind command endpoint on {}", addr))?;
        info!("Command endpoint listening on {}", addr);

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let mut server = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = stop_rx.await;
                })
                .await
        });

        let scheduler = Arc::new(Scheduler::new(
            self.config.clone(),
            session,
            gpus.clone(),
            aggregator,
            dispatcher,
            self.client.clone(),
            self.trace.clone(),
        ));
        let mut tasks = scheduler.spawn();
        tasks.push(self.spawn_startup_sweep(gpus.clone()));

        tokio::select! {
            _ = wait_finished(finished_rx) => info!("Command handler requested shutdown"),
            _ = tokio::signal::ctrl_c() => info!("Received shutdown signal"),
            result = &mut server => {
                for task in &tasks {
                    task.abort();
                }
                return match result {
                    Ok(Ok(())) => Err(anyhow::anyhow!("Command endpoint stopped unexpectedly").into()),
                    Ok(Err(e)) => Err(anyhow::Error::from(e).context("Command endpoint failed").into()),
                    Err(e) => Err(anyhow::anyhow!("Command endpoint panicked: {}", e).into()),
                };
            }
        }

        self.prep_shutdown(&gpus, stop_tx, server, tasks).await;
        Ok(())
    }

    fn spawn_startup_sweep(&self, gpus: Arc<GpuManager>) -> JoinHandle<()> {
        let warmup = self.config.warmup;
        tokio::spawn(async move {
            tokio::time::sleep(warmup).await;
            if let Err(e) = gpus.reconcile_idle_gpus(None).await {
                error!("Startup mining sweep failed: {:#}", e);
            }
        })
    }

    async fn prep_shutdown(
        &self,
        gpus: &GpuManager,
        stop_server: oneshot::Sender<()>,
        server: JoinHandle<std::io::Result<()>>,
        tasks: Vec<JoinHandle<()>>,
    ) {
        gpus.stop_all().await;
        gpus.restore_clocks().await;
        tokio::time::sleep(self.config.shutdown_grace).await;

        let _ = stop_server.send(());
        if let Err(e) = server.await {
            warn!("Command endpoint did not stop cleanly: {}", e);
        }
        for task in tasks {
            task.abort();
        }

        // An update has already recorded its handoff
        if self.trace.last_phase() == Some(Phase::Running) {
            self.record(Phase::Stopped);
        }
        info!("Stopping daemon.");
    }

    /// Turns an unexpected error into "pull the latest code and restart"
    async fn self_heal(&self, e: anyhow::Error) {
        error!("Unhandled error: {:#}", e);

        let host_id = RegistrationStore::new(&self.config.registration_path)
            .load()
            .ok()
            .flatten()
            .map(|registration| registration.host_id);
        let upload = LogUpload {
            logs: self.trace.read_lines().unwrap_or_default(),
            error: Some(format!("{:#}", e)),
            rentaflop_id: host_id,
        };
        if let Err(e) = self.client.send_logs(&upload).await {
            warn!("Failed to upload logs: {}", e);
        }

        if let Err(e) = install::prepare_host(&self.config, self.shell.as_ref()).await {
            warn!("Reinstalling requirements failed: {}", e);
        }

        info!(
            "Pausing {:?} before updating",
            self.config.self_heal_backoff
        );
        tokio::time::sleep(self.config.self_heal_backoff).await;

        self.updater().update(&UpdateParams::code(None), false).await;
        info!("Exiting update.");
    }
}

async fn wait_finished(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

pub fn parse_pids(output: &str) -> impl Iterator<Item = u32> + '_ {
    output.lines().filter_map(|line| line.trim().parse().ok())
}
