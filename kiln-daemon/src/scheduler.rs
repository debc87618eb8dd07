//! Periodic background work
//!
//! Three fixed-interval loops run next to the command listener: the idle-GPU
//! mining sweep, the control-plane check-in, and weekly log rotation. A
//! failing cycle is logged and the loop waits for its next tick.

use anyhow::{Context, Result};
use kiln_client::ControlPlaneClient;
use kiln_core::domain::command::CommandEnvelope;
use kiln_core::dto::control::{Checkin, LogUpload};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};

use crate::commands::Dispatcher;
use crate::config::DaemonConfig;
use crate::gpu::GpuManager;
use crate::registration::Session;
use crate::state::StateAggregator;
use crate::trace::Trace;

pub struct Scheduler {
    config: Arc<DaemonConfig>,
    session: Session,
    gpus: Arc<GpuManager>,
    state: Arc<StateAggregator>,
    dispatcher: Arc<Dispatcher>,
    client: Arc<ControlPlaneClient>,
    trace: Arc<Trace>,
}

impl Scheduler {
    pub fn new(
        config: Arc<DaemonConfig>,
        session: Session,
        gpus: Arc<GpuManager>,
        state: Arc<StateAggregator>,
        dispatcher: Arc<Dispatcher>,
        client: Arc<ControlPlaneClient>,
        trace: Arc<Trace>,
    ) -> Self {
        Self {
            config,
            session,
            gpus,
            state,
            dispatcher,
            client,
            trace,
        }
    }

    /// Spawns every loop; the handles are aborted on shutdown
    pub fn spawn(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        info!(
            "Starting scheduler (reconcile: {:?}, checkin: {:?}, log rotation: {:?})",
            self.config.reconcile_interval,
            self.config.checkin_interval,
            self.config.log_rotation_interval
        );

        vec![
            self.clone().spawn_loop(
                "reconcile",
                self.config.reconcile_interval,
                |s| async move { s.reconcile().await },
            ),
            self.clone().spawn_loop(
                "checkin",
                self.config.checkin_interval,
                |s| async move { s.checkin().await },
            ),
            self.clone().spawn_loop(
                "log rotation",
                self.config.log_rotation_interval,
                |s| async move { s.clean_logs().await },
            ),
        ]
    }

    fn spawn_loop<F, Fut>(self: Arc<Self>, name: &'static str, period: Duration, job: F) -> JoinHandle<()>
    where
        F: Fn(Arc<Self>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);

            loop {
                ticker.tick().await;
                debug!("Running {} cycle", name);

                if let Err(e) = job(Arc::clone(&self)).await {
                    error!("Error during {} cycle: {:#}", name, e);
                }
            }
        })
    }

    async fn reconcile(&self) -> Result<()> {
        self.gpus
            .reconcile_idle_gpus(Some(self.config.reconcile_debounce))
            .await
    }

    /// Reports host state; a non-empty answer is dispatched as a command
    pub async fn checkin(&self) -> Result<()> {
        let (host_id, email, wallet_address) = {
            let session = self.session.read().await;
            (
                session.host_id.clone(),
                session.crypto.email.clone(),
                session.crypto.wallet_address.clone(),
            )
        };

        let checkin = Checkin {
            state: self.state.get_state().await,
            ip: self.client.public_ip().await,
            rentaflop_id: host_id,
            email,
            wallet_address,
        };

        let reply = self
            .client
            .checkin(&checkin)
            .await
            .context("Check-in failed")?;

        let is_empty = match &reply {
            serde_json::Value::Null => true,
            serde_json::Value::Object(map) => map.is_empty(),
            _ => false,
        };
        if is_empty {
            return Ok(());
        }

        let envelope: CommandEnvelope =
            serde_json::from_value(reply).context("Check-in answer is not a command")?;
        if !self.dispatcher.authorize(&envelope).await {
            warn!("Ignoring '{}' command issued for another host", envelope.cmd);
            return Ok(());
        }

        self.dispatcher.dispatch(envelope, None).await;
        Ok(())
    }

    /// Uploads the log and truncates it
    pub async fn clean_logs(&self) -> Result<()> {
        debug!("Rotating {}", self.trace.log_path().display());
        let logs = self.trace.read_lines().context("Failed to read daemon log")?;
        let upload = LogUpload {
            logs,
            error: None,
            rentaflop_id: Some(self.session.read().await.host_id.clone()),
        };
        self.client
            .send_logs(&upload)
            .await
            .context("Failed to upload logs")?;
        self.trace.reset().context("Failed to truncate daemon log")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::testing::{Harness, harness};
    use crate::sandbox::testing::FakeSandbox;
    use crate::trace::ROTATED_MARKER;
    use kiln_core::domain::gpu::WorkloadKind;

    fn scheduler(h: &Harness, server: &mockito::ServerGuard) -> Scheduler {
        let client = ControlPlaneClient::new(server.url())
            .with_ip_echo_url(format!("{}/ip", server.url()));
        let config = Arc::new(DaemonConfig::default());
        let session = h.session.clone();
        let gpus = h.gpus.clone();
        let state = Arc::new(StateAggregator::new(gpus.clone(), "test".to_string()));
        Scheduler::new(
            config,
            session,
            gpus,
            state,
            h.dispatcher.clone(),
            Arc::new(client),
            h.trace.clone(),
        )
    }

    #[tokio::test]
    async fn test_checkin_dispatches_returned_command() {
        let mut server = mockito::Server::new_async().await;
        let _ip = server.mock("GET", "/ip").with_status(500).create_async().await;
        let checkin = server
            .mock("POST", "/daemon")
            .match_body(mockito::Matcher::PartialJson(
                serde_json::json!({"rentaflop_id": "host-1", "ip": null}),
            ))
            .with_status(200)
            .with_body(
                r#"{"cmd": "mine", "rentaflop_id": "host-1", "params": {"action": "start", "gpu": 1}}"#,
            )
            .create_async()
            .await;

        let h = harness(FakeSandbox::default());
        scheduler(&h, &server).checkin().await.unwrap();

        checkin.assert_async().await;
        assert_eq!(h.sandbox.kinds_on(1), vec![WorkloadKind::Crypto]);
    }

    #[tokio::test]
    async fn test_checkin_ignores_commands_for_other_hosts() {
        let mut server = mockito::Server::new_async().await;
        let _ip = server.mock("GET", "/ip").with_status(500).create_async().await;
        let _checkin = server
            .mock("POST", "/daemon")
            .with_status(200)
            .with_body(r#"{"cmd": "uninstall", "rentaflop_id": "someone-else"}"#)
            .create_async()
            .await;

        let h = harness(FakeSandbox::default());
        scheduler(&h, &server).checkin().await.unwrap();

        assert!(!*h.shutdown.borrow());
    }

    #[tokio::test]
    async fn test_empty_checkin_answer_is_a_no_op() {
        let mut server = mockito::Server::new_async().await;
        let _ip = server.mock("GET", "/ip").with_status(500).create_async().await;
        let _checkin = server
            .mock("POST", "/daemon")
            .with_status(200)
            .with_body("")
            .create_async()
            .await;

        let h = harness(FakeSandbox::default());
        assert!(scheduler(&h, &server).checkin().await.is_ok());
        assert!(h.sandbox.events().is_empty());
    }

    #[tokio::test]
    async fn test_failed_checkin_is_an_error() {
        let mut server = mockito::Server::new_async().await;
        let _ip = server.mock("GET", "/ip").with_status(500).create_async().await;
        let _checkin = server
            .mock("POST", "/daemon")
            .with_status(503)
            .create_async()
            .await;

        let h = harness(FakeSandbox::default());
        assert!(scheduler(&h, &server).checkin().await.is_err());
    }

    #[tokio::test]
    async fn test_clean_logs_uploads_then_truncates() {
        let mut server = mockito::Server::new_async().await;
        let upload = server
            .mock("POST", "/logs")
            .match_body(mockito::Matcher::PartialJson(
                serde_json::json!({"logs": ["a", "b"], "rentaflop_id": "host-1"}),
            ))
            .with_status(200)
            .create_async()
            .await;

        let h = harness(FakeSandbox::default());
        std::fs::write(h.trace.log_path(), "a\nb\n").unwrap();
        scheduler(&h, &server).clean_logs().await.unwrap();

        upload.assert_async().await;
        assert_eq!(h.trace.read_lines().unwrap(), vec![ROTATED_MARKER]);
    }

    #[tokio::test]
    async fn test_failed_upload_keeps_log() {
        let mut server = mockito::Server::new_async().await;
        let _upload = server
            .mock("POST", "/logs")
            .with_status(500)
            .create_async()
            .await;

        let h = harness(FakeSandbox::default());
        std::fs::write(h.trace.log_path(), "a\n").unwrap();
        assert!(scheduler(&h, &server).clean_logs().await.is_err());
        assert_eq!(h.trace.read_lines().unwrap(), vec!["a"]);
    }
}
