//! Host registration and session
//!
//! The registration file keeps the identity issued by the control plane
//! together with the wallet and email it was issued for. The operator's rig
//! configuration is merged in on every startup; a changed wallet, email or
//! port is written back.

use anyhow::{Context, Result};
use kiln_client::ControlPlaneClient;
use kiln_core::domain::registration::{CryptoConfig, Registration};
use kiln_core::domain::telemetry::HostState;
use kiln_core::dto::control::{Checkin, RegistrationGrant};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Registration and crypto settings shared by every component
pub type Session = Arc<RwLock<Registration>>;

/// On-disk layout of the registration file
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct RegistrationFile {
    rentaflop_id: String,
    sandbox_id: String,
    daemon_port: u16,
    wallet_address: String,
    email: String,
}

#[derive(Debug, Clone)]
pub struct RegistrationStore {
    path: PathBuf,
}

impl RegistrationStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Loads the stored registration; `None` when the host never registered
    pub fn load(&self) -> Result<Option<Registration>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let bytes = std::fs::read(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        let file: RegistrationFile =
            serde_json::from_slice(&bytes).context("Registration file is not valid JSON")?;

        Ok(Some(Registration {
            host_id: file.rentaflop_id,
            sandbox_id: file.sandbox_id,
            daemon_port: file.daemon_port,
            crypto: CryptoConfig {
                wallet_address: file.wallet_address,
                email: file.email,
                ..Default::default()
            },
        }))
    }

    pub fn save(&self, registration: &Registration) -> Result<()> {
        let file = RegistrationFile {
            rentaflop_id: registration.host_id.clone(),
            sandbox_id: registration.sandbox_id.clone(),
            daemon_port: registration.daemon_port,
            wallet_address: registration.crypto.wallet_address.clone(),
            email: registration.crypto.email.clone(),
        };
        let json = serde_json::to_vec_pretty(&file)?;
        std::fs::write(&self.path, json)
            .with_context(|| format!("Failed to write {}", self.path.display()))
    }
}

/// Reads the crypto settings from the operator's rig configuration
///
/// The file holds `KEY=value` lines. `CUSTOM_TEMPLATE` carries the wallet as
/// the part before the first `.`, and `CUSTOM_USER_CONFIG` carries
/// `;`-separated `EMAIL=`, `DISABLE_CRYPTO=`, `POOL_URL=`, `HASH_ALGORITHM=`
/// and `PASS=` entries.
pub fn parse_rig_config(content: &str) -> CryptoConfig {
    let mut crypto = CryptoConfig::default();

    for line in content.lines() {
        let Some((key, value)) = line.trim().split_once('=') else {
            continue;
        };
        let value = unquote(value);

        match key.trim() {
            "CUSTOM_TEMPLATE" => {
                let wallet = value.split('.').next().unwrap_or_default();
                crypto.wallet_address = wallet.trim().to_string();
            }
            "CUSTOM_USER_CONFIG" => {
                for entry in value.split(';') {
                    let Some((k, v)) = entry.trim().split_once('=') else {
                        continue;
                    };
                    let v = unquote(v).to_string();
                    match k.trim() {
                        "EMAIL" => crypto.email = v,
                        "DISABLE_CRYPTO" => {
                            crypto.disable_crypto =
                                matches!(v.to_ascii_lowercase().as_str(), "true" | "1" | "yes")
                        }
                        "POOL_URL" => crypto.pool_url = v,
                        "HASH_ALGORITHM" => crypto.hash_algorithm = v,
                        "PASS" => crypto.password = v,
                        other => debug!("Ignoring rig config entry {}", other),
                    }
                }
            }
            _ => {}
        }
    }

    crypto
}

fn unquote(value: &str) -> &str {
    value.trim().trim_matches(|c| c == '"' || c == '\'').trim()
}

/// Crypto settings from the rig configuration file, defaults when absent
pub fn load_rig_config(path: &Path) -> CryptoConfig {
    match std::fs::read_to_string(path) {
        Ok(content) => parse_rig_config(&content),
        Err(e) => {
            debug!("No rig config at {}: {}", path.display(), e);
            CryptoConfig::default()
        }
    }
}

/// Merges the rig configuration into a stored registration
///
/// Returns the merged registration and whether it differs from what is on
/// disk. Blank wallet or email values never overwrite stored ones.
pub fn merge(stored: Registration, rig: CryptoConfig, daemon_port: u16) -> (Registration, bool) {
    let mut merged = stored;
    let mut changed = false;

    if !rig.wallet_address.is_empty() && rig.wallet_address != merged.crypto.wallet_address {
        merged.crypto.wallet_address = rig.wallet_address;
        changed = true;
    }
    if !rig.email.is_empty() && rig.email != merged.crypto.email {
        merged.crypto.email = rig.email;
        changed = true;
    }
    if merged.daemon_port != daemon_port {
        merged.daemon_port = daemon_port;
        changed = true;
    }

    merged.crypto.disable_crypto = rig.disable_crypto;
    merged.crypto.pool_url = rig.pool_url;
    merged.crypto.hash_algorithm = rig.hash_algorithm;
    merged.crypto.password = rig.password;

    (merged, changed)
}

/// Loads or creates the host registration and wraps it in a [`Session`]
pub async fn establish(
    store: &RegistrationStore,
    rig_config_path: &Path,
    daemon_port: u16,
    client: &ControlPlaneClient,
    state: HostState,
) -> Result<Session> {
    let stored = store.load()?.unwrap_or_default();
    let rig = load_rig_config(rig_config_path);
    let (mut registration, mut changed) = merge(stored, rig, daemon_port);

    if !registration.is_registered() {
        info!("Registering host with control plane");
        let checkin = Checkin {
            state,
            ip: client.public_ip().await,
            rentaflop_id: String::new(),
            email: registration.crypto.email.clone(),
            wallet_address: registration.crypto.wallet_address.clone(),
        };
        let grant = register_with_retry(client, &checkin).await?;
        registration.host_id = grant.rentaflop_id;
        registration.sandbox_id = grant.sandbox_id;
        changed = true;
        store.save(&registration)?;
        info!("Registration successful.");
    } else if changed {
        store.save(&registration)?;
        info!("Registration updated with new rig configuration");
    }

    Ok(Arc::new(RwLock::new(registration)))
}

/// Register with the control plane with retry logic and exponential backoff
///
/// Rejections (4xx) are not retried.
pub async fn register_with_retry(
    client: &ControlPlaneClient,
    checkin: &Checkin,
) -> Result<RegistrationGrant> {
    const MAX_RETRIES: u32 = 10;
    const INITIAL_DELAY_MS: u64 = 500;
    const MAX_DELAY_MS: u64 = 30_000;

    let mut attempt = 0;
    let mut delay_ms = INITIAL_DELAY_MS;

    loop {
        attempt += 1;

        match client.register(checkin).await {
            Ok(grant) => {
                if attempt > 1 {
                    info!(
                        "Successfully registered with control plane after {} attempt(s)",
                        attempt
                    );
                }
                return Ok(grant);
            }
            Err(e) if e.is_client_error() => {
                error!("Control plane rejected registration: {}", e);
                return Err(anyhow::anyhow!("Registration rejected: {}", e));
            }
            Err(e) => {
                if attempt >= MAX_RETRIES {
                    error!(
                        "Failed to register with control plane after {} attempts",
                        MAX_RETRIES
                    );
                    return Err(anyhow::anyhow!("Failed to register host: {}", e));
                }

                warn!(
                    "Failed to register with control plane (attempt {}/{}): {}",
                    attempt, MAX_RETRIES, e
                );
                warn!("Retrying in {} ms...", delay_ms);

                tokio::time::sleep(Duration::from_millis(delay_ms)).await;

                delay_ms = (delay_ms * 2).min(MAX_DELAY_MS);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const RIG_CONFIG: &str = r#"
RIG_ID=1234
CUSTOM_TEMPLATE="0xabc123.%WORKER_NAME%"
CUSTOM_USER_CONFIG='EMAIL=ops@example.com; DISABLE_CRYPTO=false;POOL_URL=stratum+tcp://pool:4444;HASH_ALGORITHM=ethash;PASS=x'
"#;

    #[test]
    fn test_parse_rig_config() {
        let crypto = parse_rig_config(RIG_CONFIG);
        assert_eq!(crypto.wallet_address, "0xabc123");
        assert_eq!(crypto.email, "ops@example.com");
        assert!(!crypto.disable_crypto);
        assert_eq!(crypto.pool_url, "stratum+tcp://pool:4444");
        assert_eq!(crypto.hash_algorithm, "ethash");
        assert_eq!(crypto.password, "x");
    }

    #[test]
    fn test_parse_rig_config_disable_flag() {
        let crypto = parse_rig_config("CUSTOM_USER_CONFIG=\"DISABLE_CRYPTO=True\"");
        assert!(crypto.disable_crypto);
        assert!(crypto.wallet_address.is_empty());
    }

    #[test]
    fn test_merge_detects_changes() {
        let stored = Registration {
            host_id: "host".to_string(),
            sandbox_id: "sbx".to_string(),
            daemon_port: 46443,
            crypto: CryptoConfig {
                wallet_address: "0xold".to_string(),
                email: "a@example.com".to_string(),
                ..Default::default()
            },
        };

        let (same, changed) = merge(stored.clone(), CryptoConfig::default(), 46443);
        assert!(!changed);
        assert_eq!(same.crypto.wallet_address, "0xold");

        let rig = CryptoConfig {
            wallet_address: "0xnew".to_string(),
            disable_crypto: true,
            ..Default::default()
        };
        let (merged, changed) = merge(stored, rig, 46443);
        assert!(changed);
        assert_eq!(merged.crypto.wallet_address, "0xnew");
        assert_eq!(merged.crypto.email, "a@example.com");
        assert!(merged.crypto.disable_crypto);
    }

    #[test]
    fn test_store_round_trip_keeps_wire_names() {
        let dir = TempDir::new().unwrap();
        let store = RegistrationStore::new(dir.path().join("registration.json"));
        assert!(store.load().unwrap().is_none());

        let registration = Registration {
            host_id: "host".to_string(),
            sandbox_id: "sbx".to_string(),
            daemon_port: 46443,
            crypto: CryptoConfig {
                wallet_address: "0xabc".to_string(),
                email: "a@example.com".to_string(),
                pool_url: "not persisted".to_string(),
                ..Default::default()
            },
        };
        store.save(&registration).unwrap();

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(dir.path().join("registration.json")).unwrap())
                .unwrap();
        assert_eq!(raw["rentaflop_id"], "host");
        assert_eq!(raw["wallet_address"], "0xabc");

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.host_id, "host");
        assert_eq!(loaded.crypto.email, "a@example.com");
        assert!(loaded.crypto.pool_url.is_empty());
    }

    #[tokio::test]
    async fn test_establish_registers_new_host() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/daemon")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"rentaflop_id": "host-1", "sandbox_id": "sbx-1"}"#)
            .create_async()
            .await;
        let ip = server
            .mock("GET", "/ip")
            .with_status(200)
            .with_body("203.0.113.7")
            .create_async()
            .await;

        let client = ControlPlaneClient::new(server.url())
            .with_ip_echo_url(format!("{}/ip", server.url()));
        let dir = TempDir::new().unwrap();
        let store = RegistrationStore::new(dir.path().join("registration.json"));
        let rig = dir.path().join("wallet.conf");
        std::fs::write(&rig, RIG_CONFIG).unwrap();

        let session = establish(&store, &rig, 46443, &client, HostState::default())
            .await
            .unwrap();

        mock.assert_async().await;
        ip.assert_async().await;
        let registration = session.read().await;
        assert_eq!(registration.host_id, "host-1");
        assert_eq!(registration.crypto.wallet_address, "0xabc123");
        assert_eq!(store.load().unwrap().unwrap().sandbox_id, "sbx-1");
    }

    #[tokio::test]
    async fn test_registration_rejection_is_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/daemon")
            .with_status(400)
            .with_body("bad wallet")
            .expect(1)
            .create_async()
            .await;

        let client = ControlPlaneClient::new(server.url());
        let checkin = Checkin {
            state: HostState::default(),
            ip: None,
            rentaflop_id: String::new(),
            email: String::new(),
            wallet_address: String::new(),
        };

        assert!(register_with_retry(&client, &checkin).await.is_err());
        mock.assert_async().await;
    }
}
