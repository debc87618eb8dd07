//! Host preparation
//!
//! One-time installation on first startup, and the requirement steps that
//! are re-applied on every entry into the running state.

use kiln_core::domain::gpu::Gpu;
use std::net::IpAddr;
use std::path::Path;
use tokio::net::UdpSocket;
use tracing::{info, warn};

use super::DaemonError;
use crate::config::DaemonConfig;
use crate::hardware;
use crate::shell::{CommandRunner, Verbosity};

/// Private ranges sandboxes must not reach
const BLOCKED_RANGES: [&str; 2] = ["10.0.0.0/8", "172.16.0.0/12"];

const DEPENDENCIES: [&str; 4] = [
    "sudo apt-get update -y",
    "sudo apt-get install -y docker.io at iptables-persistent git",
    "sudo apt-get install -y nvidia-container-toolkit",
    "sudo systemctl restart docker",
];

/// Steps of the first startup; the host is rebooted afterwards
pub async fn first_startup(config: &DaemonConfig, shell: &dyn CommandRunner) {
    info!("Performing first startup...");

    for step in DEPENDENCIES {
        shell.run(step, Verbosity::Normal).await;
    }

    shell
        .run(
            &format!(
                "docker build -t {} {}",
                config.sandbox_image,
                config.install_dir.display()
            ),
            Verbosity::Normal,
        )
        .await;

    install_crontab(shell, &config.daemon_binary).await;
}

/// Requirements every running daemon depends on
///
/// Fails when the host has no usable GPU.
pub async fn prepare_host(
    config: &DaemonConfig,
    shell: &dyn CommandRunner,
) -> Result<Vec<Gpu>, DaemonError> {
    shell.run("sudo nvidia-smi -pm 1", Verbosity::Quiet).await;

    let gpus = hardware::detect_gpus(shell).await;
    if gpus.is_empty() {
        return Err(DaemonError::RequirementsNotMet(
            "no GPUs detected".to_string(),
        ));
    }
    info!("Found {} GPU(s)", gpus.len());

    install_firewall(shell, &config.iptables_rules_path).await;
    install_crontab(shell, &config.daemon_binary).await;

    Ok(gpus)
}

/// Keeps sandboxes away from private networks and the host itself
pub async fn install_firewall(shell: &dyn CommandRunner, rules_path: &Path) {
    let lan_ip = local_ip().await;
    for rule in firewall_rules(lan_ip) {
        shell.run(&format!("sudo {}", rule), Verbosity::Quiet).await;
    }
    shell
        .run(
            &format!("sudo sh -c 'iptables-save > {}'", rules_path.display()),
            Verbosity::Quiet,
        )
        .await;
}

pub fn firewall_rules(lan_ip: Option<IpAddr>) -> Vec<String> {
    let mut rules: Vec<String> = BLOCKED_RANGES
        .iter()
        .map(|range| format!("iptables -I FORWARD -i docker0 -d {} -j DROP", range))
        .collect();
    if let Some(ip) = lan_ip {
        rules.push(format!("iptables -A INPUT -i docker0 -d {} -j DROP", ip));
    }
    rules
}

/// Starts the daemon again after every reboot
pub async fn install_crontab(shell: &dyn CommandRunner, daemon_binary: &Path) {
    let cmd = format!(
        "(crontab -l 2>/dev/null | grep -v kiln-daemon; echo '@reboot sleep 30; {}') | crontab -",
        daemon_binary.display()
    );
    shell.run(&cmd, Verbosity::Quiet).await;
}

pub async fn remove_crontab(shell: &dyn CommandRunner) {
    shell
        .run(
            "(crontab -l 2>/dev/null | grep -v kiln-daemon) | crontab -",
            Verbosity::Quiet,
        )
        .await;
}

/// Address of the interface used for outbound traffic
pub async fn local_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").await.ok()?;
    if let Err(e) = socket.connect("8.8.8.8:80").await {
        warn!("Failed to determine local ip: {}", e);
        return None;
    }
    socket.local_addr().ok().map(|addr| addr.ip())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct NoGpus;

    #[async_trait]
    impl CommandRunner for NoGpus {
        async fn run(&self, cmd: &str, _verbosity: Verbosity) -> Option<String> {
            if cmd.starts_with("nvidia-smi --query-gpu") {
                return Some(String::new());
            }
            None
        }

        fn spawn_detached(&self, _cmd: &str) -> bool {
            false
        }
    }

    #[test]
    fn test_firewall_rules() {
        let rules = firewall_rules(Some("192.168.1.20".parse().unwrap()));
        assert_eq!(
            rules,
            vec![
                "iptables -I FORWARD -i docker0 -d 10.0.0.0/8 -j DROP",
                "iptables -I FORWARD -i docker0 -d 172.16.0.0/12 -j DROP",
                "iptables -A INPUT -i docker0 -d 192.168.1.20 -j DROP",
            ]
        );
        assert_eq!(firewall_rules(None).len(), 2);
    }

    #[tokio::test]
    async fn test_no_gpus_is_a_requirement_failure() {
        let config = DaemonConfig::default();
        let result = prepare_host(&config, &NoGpus).await;
        assert!(matches!(result, Err(DaemonError::RequirementsNotMet(_))));
    }
}
