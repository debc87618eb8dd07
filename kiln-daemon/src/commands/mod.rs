//! Command dispatch
//!
//! Commands arrive on the local endpoint or as the answer to a check-in.
//! Both paths authorize the envelope against the registered host identity
//! before anything is parsed or executed.

mod maintenance;
mod mine;

use anyhow::Result;
use kiln_core::domain::command::{Command, CommandEnvelope};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::DaemonConfig;
use crate::gpu::GpuManager;
use crate::lifecycle::update::Updater;
use crate::registration::Session;
use crate::sandbox::Sandbox;
use crate::shell::CommandRunner;
use crate::state::StateAggregator;
use crate::trace::Trace;

/// Result of a dispatched command
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Bare acknowledgement, or a JSON payload
    Reply(Option<Value>),
    /// The daemon must shut down; a scheduled job takes over
    Finished,
}

pub struct Dispatcher {
    config: Arc<DaemonConfig>,
    session: Session,
    gpus: Arc<GpuManager>,
    state: Arc<StateAggregator>,
    sandbox: Arc<dyn Sandbox>,
    shell: Arc<dyn CommandRunner>,
    trace: Arc<Trace>,
    updater: Arc<Updater>,
    shutdown: watch::Sender<bool>,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<DaemonConfig>,
        session: Session,
        gpus: Arc<GpuManager>,
        state: Arc<StateAggregator>,
        sandbox: Arc<dyn Sandbox>,
        shell: Arc<dyn CommandRunner>,
        trace: Arc<Trace>,
        updater: Arc<Updater>,
        shutdown: watch::Sender<bool>,
    ) -> Self {
        Self {
            config,
            session,
            gpus,
            state,
            sandbox,
            shell,
            trace,
            updater,
            shutdown,
        }
    }

    /// Whether the envelope was issued for this host
    pub async fn authorize(&self, envelope: &CommandEnvelope) -> bool {
        let session = self.session.read().await;
        session.is_registered() && envelope.host_id == session.host_id
    }

    /// Runs an authorized command
    ///
    /// Failures are logged and answered with a bare acknowledgement. A
    /// [`Outcome::Finished`] also signals the shutdown channel.
    pub async fn dispatch(&self, envelope: CommandEnvelope, render_file: Option<Vec<u8>>) -> Outcome {
        let command = match Command::from_envelope(&envelope, render_file) {
            Ok(command) => command,
            Err(e) => {
                warn!("Rejected command: {}", e);
                return Outcome::Reply(None);
            }
        };

        let name = command.name();
        // Polled constantly
        let quiet = matches!(command, Command::Status);

        if !quiet {
            info!("Entering {} with params {}", name, envelope.params);
        }

        let outcome = match self.execute(command).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Command {} failed: {:#}", name, e);
                Outcome::Reply(None)
            }
        };

        if !quiet {
            info!("Exiting {}.", name);
        }

        if outcome == Outcome::Finished {
            self.shutdown.send_replace(true);
        }

        outcome
    }

    async fn execute(&self, command: Command) -> Result<Outcome> {
        match command {
            Command::Mine(params) => {
                mine::handle(&self.gpus, params).await?;
                Ok(Outcome::Reply(None))
            }
            Command::Update(params) => {
                if self.updater.update(&params, false).await {
                    Ok(Outcome::Finished)
                } else {
                    Ok(Outcome::Reply(None))
                }
            }
            Command::Uninstall => {
                maintenance::uninstall(self).await?;
                Ok(Outcome::Finished)
            }
            Command::SendLogs => Ok(Outcome::Reply(Some(maintenance::send_logs(self)?))),
            Command::Status => Ok(Outcome::Reply(Some(maintenance::status(self).await?))),
            Command::Benchmark => {
                let gpus = Arc::clone(&self.gpus);
                tokio::spawn(async move {
                    if let Err(e) = gpus.benchmark().await {
                        error!("Benchmark failed: {:#}", e);
                    }
                });
                Ok(Outcome::Reply(None))
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! A dispatcher wired to in-memory collaborators

    use super::*;
    use crate::sandbox::testing::FakeSandbox;
    use crate::shell::Verbosity;
    use crate::tuning::ClockTuner;
    use async_trait::async_trait;
    use kiln_core::domain::gpu::Gpu;
    use kiln_core::domain::registration::{CryptoConfig, Registration};
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::RwLock;

    #[derive(Default)]
    pub struct RecordingShell {
        pub calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CommandRunner for RecordingShell {
        async fn run(&self, cmd: &str, _verbosity: Verbosity) -> Option<String> {
            self.calls.lock().unwrap().push(cmd.to_string());
            Some(String::new())
        }

        fn spawn_detached(&self, cmd: &str) -> bool {
            self.calls.lock().unwrap().push(format!("spawn {}", cmd));
            true
        }
    }

    pub struct Harness {
        pub dispatcher: Arc<Dispatcher>,
        pub session: Session,
        pub gpus: Arc<GpuManager>,
        pub sandbox: Arc<FakeSandbox>,
        pub shell: Arc<RecordingShell>,
        pub trace: Arc<Trace>,
        pub shutdown: watch::Receiver<bool>,
        pub _dir: TempDir,
    }

    pub fn harness(sandbox: FakeSandbox) -> Harness {
        let dir = TempDir::new().unwrap();
        let mut config = DaemonConfig::new(PathBuf::from("/opt/kiln"));
        config.daemon_binary = PathBuf::from("/opt/kiln/kiln-daemon");
        let config = Arc::new(config);

        let session: Session = Arc::new(RwLock::new(Registration {
            host_id: "host-1".to_string(),
            sandbox_id: "sbx-1".to_string(),
            daemon_port: 46443,
            crypto: CryptoConfig::default(),
        }));
        let sandbox = Arc::new(sandbox);
        let shell = Arc::new(RecordingShell::default());
        let trace = Arc::new(Trace::new(
            dir.path().join("daemon.log"),
            dir.path().join("lifecycle.json"),
        ));
        let gpus = Arc::new(GpuManager::new(
            (0..2)
                .map(|index| Gpu {
                    index,
                    name: "RTX 3080".to_string(),
                })
                .collect(),
            sandbox.clone(),
            session.clone(),
            Arc::new(ClockTuner::new(shell.clone(), None)),
            Duration::from_secs(900),
        ));
        let state = Arc::new(StateAggregator::new(gpus.clone(), "test".to_string()));
        let updater = Arc::new(Updater::new(
            config.clone(),
            shell.clone(),
            sandbox.clone(),
            trace.clone(),
        ));
        let (tx, rx) = watch::channel(false);

        let dispatcher = Arc::new(Dispatcher::new(
            config,
            session.clone(),
            gpus.clone(),
            state,
            sandbox.clone(),
            shell.clone(),
            trace.clone(),
            updater,
            tx,
        ));

        Harness {
            dispatcher,
            session,
            gpus,
            sandbox,
            shell,
            trace,
            shutdown: rx,
            _dir: dir,
        }
    }
}
