//! Host state aggregation
//!
//! Builds the status report sent with every check-in and returned by the
//! `status` command from what each sandbox reports about itself.

use kiln_core::domain::gpu::GpuStatus;
use kiln_core::domain::telemetry::{HostResources, HostState, MinerStats};
use kiln_core::dto::sandbox::SandboxStatus;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::gpu::GpuManager;
use crate::shell::{CommandRunner, Verbosity};

pub struct StateAggregator {
    gpus: Arc<GpuManager>,
    started: Instant,
    version: String,
}

impl StateAggregator {
    pub fn new(gpus: Arc<GpuManager>, version: String) -> Self {
        Self {
            gpus,
            started: Instant::now(),
            version,
        }
    }

    pub async fn get_state(&self) -> HostState {
        let slots = self.gpus.snapshot().await;

        let gpus: Vec<GpuStatus> = slots
            .iter()
            .map(|slot| GpuStatus {
                index: slot.gpu.index,
                name: slot.gpu.name.clone(),
                state: slot.state(),
                queue: slot.queue(),
            })
            .collect();

        let statuses: Vec<&SandboxStatus> = slots.iter().flat_map(|slot| slot.statuses()).collect();
        let (khs, mut stats) = fold_telemetry(&statuses, self.started.elapsed());
        stats.ver = self.version.clone();

        HostState {
            n_gpus: gpus.len(),
            resources: Some(HostResources {
                gpu_indexes: gpus.iter().map(|gpu| gpu.index).collect(),
                gpu_names: gpus.iter().map(|gpu| gpu.name.clone()).collect(),
            }),
            gpus,
            version: Some(self.version.clone()),
            khs: Some(khs),
            stats: Some(stats),
        }
    }
}

/// Folds per-sandbox telemetry into host totals
///
/// Hash rates and share counts are summed; per-GPU arrays are concatenated
/// in sandbox order; uptime is the daemon's own.
pub fn fold_telemetry(statuses: &[&SandboxStatus], uptime: Duration) -> (f64, MinerStats) {
    let mut stats = MinerStats {
        ar: vec![0, 0],
        uptime: uptime.as_secs(),
        ..Default::default()
    };
    let mut khs = 0.0;

    for status in statuses {
        khs += status.khs;
        stats.hs.extend(&status.stats.hs);
        stats.temp.extend(&status.stats.temp);
        stats.fan.extend(&status.stats.fan);
        stats.bus_numbers.extend(&status.stats.bus_numbers);
        stats.ar[0] += status.stats.accepted();
        stats.ar[1] += status.stats.rejected();
        if stats.algo.is_empty() {
            stats.algo = status.stats.algo.clone();
        }
    }

    (khs, stats)
}

/// Revision of the installed checkout, the crate version if unavailable
pub async fn detect_version(shell: &dyn CommandRunner, install_dir: &Path) -> String {
    let cmd = format!("git -C {} rev-parse HEAD", install_dir.display());
    shell
        .run(&cmd, Verbosity::VeryQuiet)
        .await
        .map(|rev| rev.trim().to_string())
        .filter(|rev| !rev.is_empty())
        .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registration::Session;
    use crate::sandbox::testing::FakeSandbox;
    use crate::tuning::ClockTuner;
    use async_trait::async_trait;
    use kiln_core::domain::gpu::{Gpu, WorkloadKind, WorkloadState};
    use kiln_core::domain::registration::Registration;
    use tokio::sync::RwLock;

    struct NullShell;

    #[async_trait]
    impl CommandRunner for NullShell {
        async fn run(&self, _cmd: &str, _verbosity: Verbosity) -> Option<String> {
            None
        }

        fn spawn_detached(&self, _cmd: &str) -> bool {
            false
        }
    }

    fn status(khs: f64, temp: f64, ar: Vec<u64>, bus: u32) -> SandboxStatus {
        SandboxStatus {
            queue: Vec::new(),
            khs,
            stats: MinerStats {
                hs: vec![khs],
                temp: vec![temp],
                fan: vec![50.0],
                ar,
                bus_numbers: vec![bus],
                algo: "ethash".to_string(),
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_fold_telemetry() {
        let a = status(100.0, 60.0, vec![10, 1], 1);
        let b = status(50.5, 65.0, vec![], 3);
        let (khs, stats) = fold_telemetry(&[&a, &b], Duration::from_secs(42));

        assert_eq!(khs, 150.5);
        assert_eq!(stats.hs, vec![100.0, 50.5]);
        assert_eq!(stats.temp, vec![60.0, 65.0]);
        assert_eq!(stats.bus_numbers, vec![1, 3]);
        assert_eq!(stats.ar, vec![10, 1]);
        assert_eq!(stats.uptime, 42);
        assert_eq!(stats.algo, "ethash");
    }

    #[test]
    fn test_fold_without_sandboxes() {
        let (khs, stats) = fold_telemetry(&[], Duration::ZERO);
        assert_eq!(khs, 0.0);
        assert_eq!(stats.ar, vec![0, 0]);
        assert!(stats.hs.is_empty());
        assert_eq!(stats.hs_units, "khs");
    }

    #[tokio::test]
    async fn test_version_falls_back_to_crate_version() {
        let version = detect_version(&NullShell, Path::new("/nonexistent")).await;
        assert_eq!(version, env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn test_get_state_classifies_each_gpu() {
        let sandbox = Arc::new(FakeSandbox::with_running(&[
            (0, WorkloadKind::Crypto, &[]),
            (1, WorkloadKind::Render, &["54"]),
            (2, WorkloadKind::Render, &[]),
        ]));
        let session: Session = Arc::new(RwLock::new(Registration::default()));
        let gpus = (0..4)
            .map(|index| Gpu {
                index,
                name: "RTX 3080".to_string(),
            })
            .collect();
        let manager = Arc::new(GpuManager::new(
            gpus,
            sandbox,
            session,
            Arc::new(ClockTuner::new(Arc::new(NullShell), None)),
            Duration::from_secs(900),
        ));

        let state = StateAggregator::new(manager, "abc123".to_string())
            .get_state()
            .await;

        assert_eq!(state.n_gpus, 4);
        let states: Vec<WorkloadState> = state.gpus.iter().map(|gpu| gpu.state).collect();
        assert_eq!(
            states,
            vec![
                WorkloadState::CryptoMining,
                WorkloadState::Rendering,
                WorkloadState::Stopped,
                WorkloadState::Stopped
            ]
        );
        assert_eq!(state.gpus[1].queue[0].as_str(), "54");
        assert_eq!(state.khs, Some(100.0));
        assert_eq!(state.version.as_deref(), Some("abc123"));
        assert_eq!(state.stats.unwrap().ver, "abc123");
        assert_eq!(state.resources.unwrap().gpu_indexes, vec![0, 1, 2, 3]);
    }
}
