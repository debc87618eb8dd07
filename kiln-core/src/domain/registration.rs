//! Registration domain types

use serde::{Deserialize, Serialize};

/// Crypto-mining configuration for this host
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    pub wallet_address: String,
    pub email: String,

    /// Globally disables mining on every GPU
    pub disable_crypto: bool,

    pub pool_url: String,
    pub hash_algorithm: String,

    #[serde(rename = "pass")]
    pub password: String,
}

impl CryptoConfig {
    /// Environment handed to a mining sandbox
    pub fn sandbox_env(&self) -> Vec<(String, String)> {
        vec![
            ("WALLET_ADDRESS".to_string(), self.wallet_address.clone()),
            ("EMAIL".to_string(), self.email.clone()),
            ("POOL_URL".to_string(), self.pool_url.clone()),
            ("HASH_ALGORITHM".to_string(), self.hash_algorithm.clone()),
            ("POOL_PASS".to_string(), self.password.clone()),
        ]
    }
}

/// Identity issued by the control plane plus the crypto configuration
/// in force for this host
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    /// Host identity; empty until the first successful registration
    #[serde(rename = "rentaflop_id")]
    pub host_id: String,

    /// Identity every sandbox on this host reports results under
    pub sandbox_id: String,

    pub daemon_port: u16,

    pub crypto: CryptoConfig,
}

impl Registration {
    pub fn is_registered(&self) -> bool {
        !self.host_id.is_empty()
    }
}
