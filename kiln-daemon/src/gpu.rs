//! GPU resource manager
//!
//! Owns the workload state machine of every GPU slot:
//!
//! ```text
//! Stopped <-> CryptoMining
//!    ^  \         |
//!    |   v        v
//!    +-- Rendering
//! ```
//!
//! Every transition on one GPU runs under that GPU's lock, so a reconcile
//! sweep and an inbound `mine` command cannot interleave their stop/start
//! sequences. A render never starts before mining on the same GPU has been
//! stopped.

use anyhow::{Context, Result};
use kiln_core::domain::gpu::{Gpu, WorkloadKind, WorkloadState};
use kiln_core::domain::task::TaskId;
use kiln_core::dto::sandbox::{PushTask, SandboxStatus};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::registration::Session;
use crate::sandbox::{Sandbox, SandboxSpec};
use crate::tuning::ClockTuner;

/// Point-in-time view of one GPU slot
#[derive(Debug, Clone)]
pub struct SlotSnapshot {
    pub gpu: Gpu,

    /// Sandboxes present on the GPU with their status, `None` if unreachable
    pub sandboxes: Vec<(WorkloadKind, Option<SandboxStatus>)>,
}

impl SlotSnapshot {
    /// Rendering when any sandbox reports queued work, CryptoMining when a
    /// mining sandbox is present, Stopped otherwise
    ///
    /// Only a crypto sandbox counts as mining. A render or benchmark sandbox
    /// with an empty queue is draining and leaves the slot Stopped.
    pub fn state(&self) -> WorkloadState {
        let has_work = self
            .sandboxes
            .iter()
            .any(|(_, status)| status.as_ref().is_some_and(|s| !s.queue.is_empty()));
        if has_work {
            return WorkloadState::Rendering;
        }

        if self
            .sandboxes
            .iter()
            .any(|(kind, _)| *kind == WorkloadKind::Crypto)
        {
            return WorkloadState::CryptoMining;
        }

        WorkloadState::Stopped
    }

    /// Queue contents while rendering, empty otherwise
    pub fn queue(&self) -> Vec<TaskId> {
        self.sandboxes
            .iter()
            .filter_map(|(_, status)| status.as_ref())
            .flat_map(|status| status.queue.iter().cloned())
            .collect()
    }

    pub fn statuses(&self) -> impl Iterator<Item = &SandboxStatus> {
        self.sandboxes.iter().filter_map(|(_, status)| status.as_ref())
    }
}

pub struct GpuManager {
    gpus: Vec<Gpu>,
    sandbox: Arc<dyn Sandbox>,
    session: Session,
    tuner: Arc<ClockTuner>,
    locks: HashMap<u32, Mutex<()>>,
    benchmark_timeout: Duration,
}

impl GpuManager {
    pub fn new(
        gpus: Vec<Gpu>,
        sandbox: Arc<dyn Sandbox>,
        session: Session,
        tuner: Arc<ClockTuner>,
        benchmark_timeout: Duration,
    ) -> Self {
        let locks = gpus.iter().map(|gpu| (gpu.index, Mutex::new(()))).collect();
        Self {
            gpus,
            sandbox,
            session,
            tuner,
            locks,
            benchmark_timeout,
        }
    }

    fn lock(&self, gpu: u32) -> Result<&Mutex<()>> {
        self.locks
            .get(&gpu)
            .with_context(|| format!("GPU {} is not part of this host", gpu))
    }

    async fn sandbox_id(&self) -> String {
        self.session.read().await.sandbox_id.clone()
    }

    // =============================================================================
    // Rendering
    // =============================================================================

    /// Starts a render sandbox on `gpu` and enqueues the task
    ///
    /// Mining is always stopped first. A render sandbox that already has
    /// queued work is kept and receives the task; an idle one is replaced.
    pub async fn start_render(&self, gpu: u32, task: &PushTask, render_file: Vec<u8>) -> Result<()> {
        let _guard = self.lock(gpu)?.lock().await;
        info!("Starting render of task {} on GPU {}", task.task_id, gpu);

        self.sandbox.stop(gpu, WorkloadKind::Crypto).await;

        let busy = self
            .sandbox
            .status(gpu, WorkloadKind::Render)
            .await
            .is_some_and(|status| !status.queue.is_empty());
        if !busy {
            self.sandbox.stop(gpu, WorkloadKind::Render).await;
        }

        self.tuner.reset(gpu).await;

        let spec = SandboxSpec::new(gpu, WorkloadKind::Render, self.sandbox_id().await);
        self.sandbox
            .start(&spec)
            .await
            .with_context(|| format!("Render sandbox on GPU {} did not start", gpu))?;

        if !self.sandbox.push(gpu, task, render_file).await {
            anyhow::bail!("Failed to enqueue task {} on GPU {}", task.task_id, gpu);
        }

        Ok(())
    }

    /// Stops the render sandbox; with `restart` the GPU goes back to mining
    ///
    /// The stop and the mining start happen under one hold of the GPU lock.
    pub async fn stop_render(&self, gpu: u32, restart: bool) -> Result<()> {
        let _guard = self.lock(gpu)?.lock().await;
        self.sandbox.stop(gpu, WorkloadKind::Render).await;

        if restart {
            self.start_mining_locked(gpu).await;
        }
        Ok(())
    }

    /// Removes one task from a GPU's queue, stopping rendering once the
    /// queue runs empty
    pub async fn cancel_task(&self, gpu: u32, task_id: &TaskId) -> Result<()> {
        let _guard = self.lock(gpu)?.lock().await;
        self.sandbox.pop(gpu, task_id).await;

        let drained = self
            .sandbox
            .status(gpu, WorkloadKind::Render)
            .await
            .is_none_or(|status| status.queue.is_empty());
        if drained {
            info!("Queue on GPU {} is empty, returning to mining", gpu);
            self.sandbox.stop(gpu, WorkloadKind::Render).await;
            self.start_mining_locked(gpu).await;
        }
        Ok(())
    }

    // =============================================================================
    // Mining
    // =============================================================================

    /// Starts mining on `gpu` unless it is disabled or already running
    pub async fn start_mining(&self, gpu: u32) -> Result<()> {
        let _guard = self.lock(gpu)?.lock().await;
        self.start_mining_locked(gpu).await;
        Ok(())
    }

    /// Starts mining on `gpu` only if no render or benchmark work is queued
    /// on it once the GPU lock is held
    ///
    /// Returns whether the slot was idle.
    pub async fn start_mining_if_idle(&self, gpu: u32) -> Result<bool> {
        let _guard = self.lock(gpu)?.lock().await;

        if self.has_queued_work(gpu).await {
            debug!("GPU {} picked up work before the sweep reached it", gpu);
            return Ok(false);
        }

        self.start_mining_locked(gpu).await;
        Ok(true)
    }

    /// Caller holds the lock of `gpu`
    async fn start_mining_locked(&self, gpu: u32) {
        let crypto = self.session.read().await.crypto.clone();
        if crypto.disable_crypto {
            debug!("Crypto mining disabled, not starting it on GPU {}", gpu);
            return;
        }

        if self
            .sandbox
            .running()
            .await
            .contains(&(WorkloadKind::Crypto, gpu))
        {
            return;
        }

        self.sandbox.stop(gpu, WorkloadKind::Render).await;
        self.tuner.restore(gpu).await;

        info!("Starting crypto mining on GPU {}", gpu);
        let spec = SandboxSpec::new(gpu, WorkloadKind::Crypto, self.sandbox_id().await)
            .with_crypto(crypto);
        if self.sandbox.start(&spec).await.is_none() {
            warn!("Mining sandbox on GPU {} did not start", gpu);
        }
    }

    async fn has_queued_work(&self, gpu: u32) -> bool {
        for (kind, index) in self.sandbox.running().await {
            if index != gpu || kind == WorkloadKind::Crypto {
                continue;
            }
            if self
                .sandbox
                .status(gpu, kind)
                .await
                .is_some_and(|status| !status.queue.is_empty())
            {
                return true;
            }
        }
        false
    }

    pub async fn stop_mining(&self, gpu: u32) -> Result<()> {
        let _guard = self.lock(gpu)?.lock().await;
        self.sandbox.stop(gpu, WorkloadKind::Crypto).await;
        Ok(())
    }

    /// GPUs that are currently Stopped
    pub async fn idle_gpus(&self) -> BTreeSet<u32> {
        self.snapshot()
            .await
            .into_iter()
            .filter(|slot| slot.state() == WorkloadState::Stopped)
            .map(|slot| slot.gpu.index)
            .collect()
    }

    /// Restarts mining on GPUs found Stopped
    ///
    /// With a debounce, a GPU must be Stopped on two samples taken that far
    /// apart. Each GPU is checked once more under its lock before mining
    /// starts, so a render that got the lock after the samples is kept.
    pub async fn reconcile_idle_gpus(&self, debounce: Option<Duration>) -> Result<()> {
        if self.session.read().await.crypto.disable_crypto {
            return Ok(());
        }

        let mut idle = self.idle_gpus().await;
        if let Some(delay) = debounce {
            if idle.is_empty() {
                return Ok(());
            }
            tokio::time::sleep(delay).await;
            let second = self.idle_gpus().await;
            idle.retain(|gpu| second.contains(gpu));
        }

        for gpu in idle {
            self.start_mining_if_idle(gpu).await?;
        }
        Ok(())
    }

    // =============================================================================
    // Whole host
    // =============================================================================

    pub async fn snapshot(&self) -> Vec<SlotSnapshot> {
        let running = self.sandbox.running().await;
        let mut slots = Vec::with_capacity(self.gpus.len());

        for gpu in &self.gpus {
            let mut sandboxes = Vec::new();
            for (kind, _) in running.iter().filter(|(_, index)| *index == gpu.index) {
                sandboxes.push((*kind, self.sandbox.status(gpu.index, *kind).await));
            }
            slots.push(SlotSnapshot {
                gpu: gpu.clone(),
                sandboxes,
            });
        }

        slots
    }

    pub async fn stop_all(&self) {
        info!("Stopping all sandboxes");
        self.sandbox.stop_all().await;
    }

    pub async fn restore_clocks(&self) {
        self.tuner.restore_all().await;
    }

    /// Runs the hardware benchmark on every GPU
    pub async fn benchmark(&self) -> Result<()> {
        self.stop_all().await;

        let sandbox_id = self.sandbox_id().await;
        for gpu in &self.gpus {
            let _guard = self.lock(gpu.index)?.lock().await;
            self.tuner.reset(gpu.index).await;

            let spec = SandboxSpec::new(gpu.index, WorkloadKind::Benchmark, sandbox_id.clone())
                .with_timeout(self.benchmark_timeout);
            if self.sandbox.start(&spec).await.is_none() {
                warn!("Benchmark sandbox on GPU {} did not start", gpu.index);
                continue;
            }
            if !self.sandbox.start_benchmark(gpu.index).await {
                warn!("Benchmark on GPU {} was not enqueued", gpu.index);
            }
        }
        Ok(())
    }
}
