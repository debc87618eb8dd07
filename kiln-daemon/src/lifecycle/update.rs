//! Update protocol
//!
//! A code update rebuilds the daemon in place and hands off to a fresh
//! process: it stops every sandbox, leaves a short-lived `sleep` placeholder
//! running for supervisors, and asks `at` to start the daemon again a few
//! seconds later. The first pass starts it with `update` so the update
//! routine runs once more from the new code.

use kiln_core::domain::command::{UpdateKind, UpdateParams};
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::DaemonConfig;
use crate::sandbox::Sandbox;
use crate::shell::{CommandRunner, Verbosity};
use crate::trace::{Phase, Trace};

/// Upgrades only packages from security sources
const SECURITY_UPGRADE: &str = "sudo apt-get -s dist-upgrade | grep \"^Inst\" | grep -i securi \
     | awk -F \" \" '{print $2}' | xargs -r sudo apt-get install -y";

pub struct Updater {
    config: Arc<DaemonConfig>,
    shell: Arc<dyn CommandRunner>,
    sandbox: Arc<dyn Sandbox>,
    trace: Arc<Trace>,
}

impl Updater {
    pub fn new(
        config: Arc<DaemonConfig>,
        shell: Arc<dyn CommandRunner>,
        sandbox: Arc<dyn Sandbox>,
        trace: Arc<Trace>,
    ) -> Self {
        Self {
            config,
            shell,
            sandbox,
            trace,
        }
    }

    /// Runs an update; `true` means this process must now shut down
    pub async fn update(&self, params: &UpdateParams, second_pass: bool) -> bool {
        match params.kind {
            UpdateKind::Code => {
                self.update_code(params.target_version.as_deref(), second_pass)
                    .await;
                true
            }
            UpdateKind::System => {
                self.update_system(params.reboot).await;
                false
            }
        }
    }

    /// Fetch and rebuild steps, run on both passes
    pub fn build_steps(&self, target_version: Option<&str>) -> Vec<String> {
        let dir = self.config.install_dir.display();
        let mut steps = vec![
            format!("git -C {} checkout {}", dir, self.config.update_branch),
            format!("git -C {} pull", dir),
        ];
        if let Some(target) = target_version {
            steps.push(format!("git -C {} checkout {}", dir, target));
        }
        steps.push(format!("cd {} && cargo build --release", dir));
        steps.push(format!(
            "docker build -t {} {}",
            self.config.sandbox_image, dir
        ));
        steps
    }

    /// Deferred job that brings the daemon back after the handoff
    pub fn restart_command(&self, target_version: Option<&str>, second_pass: bool) -> String {
        let mut invocation = self.config.daemon_binary.display().to_string();
        if !second_pass {
            invocation.push_str(" update");
            if let Some(target) = target_version {
                invocation.push(' ');
                invocation.push_str(target);
            }
        }

        format!(
            "echo \"sleep {}; {}\" | at now",
            self.config.restart_delay.as_secs(),
            invocation
        )
    }

    async fn update_code(&self, target_version: Option<&str>, second_pass: bool) {
        info!(
            "Updating daemon code to {} (second pass: {})",
            target_version.unwrap_or("latest"),
            second_pass
        );

        for step in self.build_steps(target_version) {
            self.shell.run(&step, Verbosity::Normal).await;
        }

        self.sandbox.stop_all().await;

        let placeholder = format!("{} sleep", self.config.daemon_binary.display());
        self.shell.spawn_detached(&placeholder);

        if let Err(e) = self.trace.record(Phase::RestartScheduled) {
            warn!("Failed to record lifecycle phase: {}", e);
        }
        self.shell
            .run(
                &self.restart_command(target_version, second_pass),
                Verbosity::Normal,
            )
            .await;
    }

    async fn update_system(&self, reboot: bool) {
        info!("Installing security updates");
        self.shell
            .run("sudo apt-get update -y", Verbosity::Normal)
            .await;
        self.shell.run(SECURITY_UPGRADE, Verbosity::Normal).await;

        if reboot {
            if let Err(e) = self.trace.record(Phase::Rebooting) {
                warn!("Failed to record lifecycle phase: {}", e);
            }
            self.shell.run("sudo reboot", Verbosity::Normal).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::testing::FakeSandbox;
    use async_trait::async_trait;
    use kiln_core::domain::gpu::WorkloadKind;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingShell {
        calls: Mutex<Vec<String>>,
        spawned: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CommandRunner for RecordingShell {
        async fn run(&self, cmd: &str, _verbosity: Verbosity) -> Option<String> {
            self.calls.lock().unwrap().push(cmd.to_string());
            Some(String::new())
        }

        fn spawn_detached(&self, cmd: &str) -> bool {
            self.spawned.lock().unwrap().push(cmd.to_string());
            true
        }
    }

    fn updater(
        dir: &TempDir,
        shell: Arc<RecordingShell>,
        sandbox: Arc<FakeSandbox>,
    ) -> (Updater, Arc<Trace>) {
        let mut config = DaemonConfig::new(PathBuf::from("/opt/kiln"));
        config.daemon_binary = PathBuf::from("/opt/kiln/kiln-daemon");
        let trace = Arc::new(Trace::new(
            dir.path().join("daemon.log"),
            dir.path().join("lifecycle.json"),
        ));
        (
            Updater::new(Arc::new(config), shell, sandbox, trace.clone()),
            trace,
        )
    }

    #[tokio::test]
    async fn test_code_update_hands_off_to_second_pass() {
        let dir = TempDir::new().unwrap();
        let shell = Arc::new(RecordingShell::default());
        let sandbox = Arc::new(FakeSandbox::with_running(&[(0, WorkloadKind::Crypto, &[])]));
        let (updater, trace) = updater(&dir, shell.clone(), sandbox.clone());

        let finished = updater
            .update(&UpdateParams::code(Some("v2".to_string())), false)
            .await;

        assert!(finished);
        assert!(sandbox.running().await.is_empty());
        assert_eq!(trace.last_phase(), Some(Phase::RestartScheduled));
        assert_eq!(
            *shell.spawned.lock().unwrap(),
            vec!["/opt/kiln/kiln-daemon sleep"]
        );

        let calls = shell.calls.lock().unwrap();
        assert_eq!(calls[0], "git -C /opt/kiln checkout master");
        assert!(calls.contains(&"git -C /opt/kiln checkout v2".to_string()));
        assert!(calls.contains(&"cd /opt/kiln && cargo build --release".to_string()));
        assert_eq!(
            calls.last().unwrap(),
            "echo \"sleep 3; /opt/kiln/kiln-daemon update v2\" | at now"
        );
    }

    #[tokio::test]
    async fn test_second_pass_rebuilds_and_restarts_plainly() {
        let dir = TempDir::new().unwrap();
        let shell = Arc::new(RecordingShell::default());
        let (updater, _trace) = updater(&dir, shell.clone(), Arc::new(FakeSandbox::default()));

        assert!(updater.update(&UpdateParams::code(None), true).await);

        let calls = shell.calls.lock().unwrap();
        assert!(calls.iter().any(|c| c.contains("cargo build --release")));
        assert_eq!(
            calls.last().unwrap(),
            "echo \"sleep 3; /opt/kiln/kiln-daemon\" | at now"
        );
    }

    #[tokio::test]
    async fn test_system_update_without_reboot() {
        let dir = TempDir::new().unwrap();
        let shell = Arc::new(RecordingShell::default());
        let sandbox = Arc::new(FakeSandbox::with_running(&[(0, WorkloadKind::Crypto, &[])]));
        let (updater, trace) = updater(&dir, shell.clone(), sandbox.clone());

        let params = UpdateParams {
            kind: UpdateKind::System,
            target_version: None,
            reboot: false,
        };
        assert!(!updater.update(&params, false).await);

        let calls = shell.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert!(calls[1].contains("securi"));
        assert_eq!(trace.last_phase(), None);
        assert_eq!(sandbox.running().await.len(), 1);
    }
}
