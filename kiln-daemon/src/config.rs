//! Daemon configuration
//!
//! Static settings of the host daemon. Runtime-mutable state (identity and
//! crypto settings) lives in the [`Session`](crate::registration::Session).

use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_CONTROL_PLANE_URL: &str = "https://api.rentaflop.com/host";

/// Daemon configuration
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Checkout the daemon is built from and updates itself in
    pub install_dir: PathBuf,

    /// Durable trace; doubles as the operator log
    pub log_path: PathBuf,

    /// Explicit last-known lifecycle phase
    pub lifecycle_path: PathBuf,

    /// Host identity and crypto settings
    pub registration_path: PathBuf,

    /// Operator rig configuration (`KEY=value` lines)
    pub rig_config_path: PathBuf,

    /// Base URL of the control plane host API
    pub control_plane_url: String,

    /// Port of the command endpoint
    pub daemon_port: u16,

    /// Treat every request as arriving over TLS
    pub assume_secure: bool,

    pub reconcile_interval: Duration,
    pub checkin_interval: Duration,
    pub log_rotation_interval: Duration,

    /// Delay before the startup mining sweep
    pub warmup: Duration,

    /// Gap between the two samples of a reconcile sweep
    pub reconcile_debounce: Duration,

    /// Pause of the self-healing loop before updating
    pub self_heal_backoff: Duration,

    /// Delay before the deferred re-invocation after an update
    pub restart_delay: Duration,

    /// Wait for in-flight operations during shutdown
    pub shutdown_grace: Duration,

    /// Lifetime of the `sleep` placeholder process
    pub placeholder_duration: Duration,

    /// Image every sandbox container runs
    pub sandbox_image: String,

    /// Port of the queue listener inside a sandbox
    pub sandbox_port: u16,

    /// Attempts at starting a sandbox container
    pub sandbox_start_attempts: u32,

    /// How long a started sandbox may take to answer
    pub sandbox_ready_timeout: Duration,

    /// Lifetime of benchmark sandboxes
    pub benchmark_timeout: Duration,

    /// Branch code updates follow
    pub update_branch: String,

    /// Command restoring operator clock settings; `{gpu}` is substituted
    pub clock_restore_command: Option<String>,

    /// Binary the deferred re-invocation runs
    pub daemon_binary: PathBuf,

    /// Where firewall rules are persisted
    pub iptables_rules_path: PathBuf,
}

impl DaemonConfig {
    /// Creates a new configuration with defaults rooted at `install_dir`
    pub fn new(install_dir: PathBuf) -> Self {
        Self {
            log_path: install_dir.join("daemon.log"),
            lifecycle_path: install_dir.join("lifecycle.json"),
            registration_path: install_dir.join("registration.json"),
            rig_config_path: PathBuf::from("/hive-config/wallet.conf"),
            control_plane_url: DEFAULT_CONTROL_PLANE_URL.to_string(),
            daemon_port: 46443,
            assume_secure: false,
            reconcile_interval: Duration::from_secs(60),
            checkin_interval: Duration::from_secs(60),
            log_rotation_interval: Duration::from_secs(7 * 24 * 60 * 60),
            warmup: Duration::from_secs(10),
            reconcile_debounce: Duration::from_secs(10),
            self_heal_backoff: Duration::from_secs(180),
            restart_delay: Duration::from_secs(3),
            shutdown_grace: Duration::from_secs(5),
            placeholder_duration: Duration::from_secs(5),
            sandbox_image: "kiln/sandbox".to_string(),
            sandbox_port: 5000,
            sandbox_start_attempts: 2,
            sandbox_ready_timeout: Duration::from_secs(30),
            benchmark_timeout: Duration::from_secs(15 * 60),
            update_branch: "master".to_string(),
            clock_restore_command: None,
            daemon_binary: install_dir.join("target/release/kiln-daemon"),
            iptables_rules_path: PathBuf::from("/etc/iptables/rules.v4"),
            install_dir,
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Every setting is optional:
    /// - KILN_INSTALL_DIR (default: /opt/kiln)
    /// - KILN_LOG_FILE, KILN_RIG_CONFIG, KILN_CONTROL_PLANE_URL
    /// - KILN_DAEMON_PORT, KILN_ASSUME_SECURE
    /// - KILN_RECONCILE_INTERVAL, KILN_CHECKIN_INTERVAL (seconds)
    /// - KILN_SANDBOX_IMAGE, KILN_UPDATE_BRANCH, KILN_CLOCK_RESTORE_COMMAND
    pub fn from_env() -> anyhow::Result<Self> {
        let install_dir = std::env::var("KILN_INSTALL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/opt/kiln"));

        let mut config = Self::new(install_dir);

        if let Ok(path) = std::env::var("KILN_LOG_FILE") {
            config.log_path = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("KILN_RIG_CONFIG") {
            config.rig_config_path = PathBuf::from(path);
        }
        if let Ok(url) = std::env::var("KILN_CONTROL_PLANE_URL") {
            config.control_plane_url = url;
        }
        if let Ok(port) = std::env::var("KILN_DAEMON_PORT") {
            config.daemon_port = port
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("KILN_DAEMON_PORT is not a port: {}", e))?;
        }
        if let Ok(flag) = std::env::var("KILN_ASSUME_SECURE") {
            config.assume_secure = matches!(flag.trim(), "1" | "true" | "yes");
        }

        config.reconcile_interval =
            env_secs("KILN_RECONCILE_INTERVAL").unwrap_or(config.reconcile_interval);
        config.checkin_interval =
            env_secs("KILN_CHECKIN_INTERVAL").unwrap_or(config.checkin_interval);

        if let Ok(image) = std::env::var("KILN_SANDBOX_IMAGE") {
            config.sandbox_image = image;
        }
        if let Ok(branch) = std::env::var("KILN_UPDATE_BRANCH") {
            config.update_branch = branch;
        }
        config.clock_restore_command = std::env::var("KILN_CLOCK_RESTORE_COMMAND")
            .ok()
            .filter(|cmd| !cmd.trim().is_empty());

        if let Ok(exe) = std::env::current_exe() {
            config.daemon_binary = exe;
        }

        Ok(config)
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.control_plane_url.starts_with("http://")
            && !self.control_plane_url.starts_with("https://")
        {
            anyhow::bail!("control_plane_url must start with http:// or https://");
        }

        if self.reconcile_interval.is_zero() || self.checkin_interval.is_zero() {
            anyhow::bail!("scheduler intervals must be greater than 0");
        }

        if self.sandbox_start_attempts == 0 {
            anyhow::bail!("sandbox_start_attempts must be at least 1");
        }

        if self.update_branch.trim().is_empty() {
            anyhow::bail!("update_branch cannot be empty");
        }

        Ok(())
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self::new(PathBuf::from("/opt/kiln"))
    }
}

fn env_secs(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}
