//! Per-GPU clock settings
//!
//! Renders and benchmarks run with the driver's default application clocks.
//! GPUs reset that way are remembered so the operator's overclock can be put
//! back once the GPU returns to mining or the daemon stops.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::shell::{CommandRunner, Verbosity};

pub struct ClockTuner {
    shell: Arc<dyn CommandRunner>,

    /// Restore command template, `{gpu}` is substituted
    restore_command: Option<String>,

    altered: Mutex<BTreeSet<u32>>,
}

impl ClockTuner {
    pub fn new(shell: Arc<dyn CommandRunner>, restore_command: Option<String>) -> Self {
        Self {
            shell,
            restore_command,
            altered: Mutex::new(BTreeSet::new()),
        }
    }

    fn altered(&self) -> std::sync::MutexGuard<'_, BTreeSet<u32>> {
        self.altered.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub async fn reset(&self, gpu: u32) {
        debug!("Resetting clocks on GPU {}", gpu);
        self.shell
            .run(&format!("nvidia-smi -i {} -rgc", gpu), Verbosity::Quiet)
            .await;
        self.altered().insert(gpu);
    }

    /// Puts the operator's clock settings back if this GPU was reset
    pub async fn restore(&self, gpu: u32) {
        if !self.altered().remove(&gpu) {
            return;
        }
        let Some(template) = &self.restore_command else {
            return;
        };

        info!("Restoring clock settings on GPU {}", gpu);
        let cmd = template.replace("{gpu}", &gpu.to_string());
        self.shell.run(&cmd, Verbosity::Quiet).await;
    }

    pub async fn restore_all(&self) {
        let gpus: Vec<u32> = self.altered().iter().copied().collect();
        for gpu in gpus {
            self.restore(gpu).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    #[derive(Default)]
    struct RecordingShell {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CommandRunner for RecordingShell {
        async fn run(&self, cmd: &str, _verbosity: Verbosity) -> Option<String> {
            self.calls.lock().unwrap().push(cmd.to_string());
            Some(String::new())
        }

        fn spawn_detached(&self, _cmd: &str) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn test_only_reset_gpus_are_restored() {
        let shell = Arc::new(RecordingShell::default());
        let tuner = ClockTuner::new(shell.clone(), Some("oc apply --gpu {gpu}".to_string()));

        tuner.restore(0).await;
        tuner.reset(1).await;
        tuner.restore_all().await;
        tuner.restore_all().await;

        assert_eq!(
            *shell.calls.lock().unwrap(),
            vec!["nvidia-smi -i 1 -rgc", "oc apply --gpu 1"]
        );
    }

    #[tokio::test]
    async fn test_restore_without_template_is_silent() {
        let shell = Arc::new(RecordingShell::default());
        let tuner = ClockTuner::new(shell.clone(), None);

        tuner.reset(0).await;
        tuner.restore(0).await;

        assert_eq!(shell.calls.lock().unwrap().len(), 1);
    }
}
