//! Sandbox configuration
//!
//! Everything the sandbox needs is handed to it by the daemon through the
//! container environment.

use kiln_core::domain::gpu::WorkloadKind;
use std::path::PathBuf;
use std::time::Duration;

/// Sandbox configuration
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Identity results are reported under
    pub sandbox_id: String,

    /// GPU this sandbox is bound to
    pub gpu: u32,

    /// What the daemon started this sandbox for
    pub workload: WorkloadKind,

    /// Lifetime of the sandbox; it shuts itself down afterwards
    pub timeout: Option<Duration>,

    /// Root under which task directories are created
    pub file_dir: PathBuf,

    /// SQLite database holding the durable queue
    pub database_url: String,

    /// Address of the queue listener
    pub bind_addr: String,

    /// How often the queue is ticked
    pub tick_interval: Duration,

    /// Base URL of the control plane host API
    pub control_plane_url: String,

    /// Maximum running time of a render task
    pub render_timeout: Duration,

    /// Absolute limit for the benchmark to produce its score
    pub benchmark_timeout: Duration,

    /// Render command; `{input}`, `{output}`, `{start}` and `{end}` are substituted
    pub render_command: String,

    /// Benchmark command; `{output}` is the score file
    pub benchmark_command: String,

    /// Miner command, started through the shell with the crypto environment
    pub miner_command: Option<String>,

    /// JSON file the miner keeps its statistics in
    pub miner_stats_path: PathBuf,
}

pub const DEFAULT_CONTROL_PLANE_URL: &str = "https://api.rentaflop.com/host";

impl SandboxConfig {
    /// Creates a new configuration with defaults
    pub fn new(sandbox_id: String, gpu: u32, workload: WorkloadKind) -> Self {
        let file_dir = std::env::temp_dir().join("kiln-tasks");
        Self {
            sandbox_id,
            gpu,
            workload,
            timeout: None,
            database_url: default_database_url(&file_dir),
            file_dir,
            bind_addr: "0.0.0.0:5000".to_string(),
            tick_interval: Duration::from_secs(10),
            control_plane_url: DEFAULT_CONTROL_PLANE_URL.to_string(),
            render_timeout: Duration::from_secs(2 * 60 * 60),
            benchmark_timeout: Duration::from_secs(20 * 60),
            render_command: "blender -b {input} -o {output}/ -s {start} -e {end} --disable-autoexec -a"
                .to_string(),
            benchmark_command: "octane --benchmark -a {output} --no-gui".to_string(),
            miner_command: None,
            miner_stats_path: PathBuf::from("/tmp/miner-stats.json"),
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Expected environment variables:
    /// - SANDBOX_ID (required)
    /// - GPU (required)
    /// - WORKLOAD (optional, render|crypto|benchmark, default: render)
    /// - TIMEOUT (optional, seconds, 0 = none)
    /// - FILE_DIR, DATABASE_URL, BIND_ADDR, CONTROL_PLANE_URL (optional)
    /// - TICK_INTERVAL, RENDER_TIMEOUT, BENCHMARK_TIMEOUT (optional, seconds)
    /// - RENDER_COMMAND, BENCHMARK_COMMAND, MINER_COMMAND, MINER_STATS_PATH (optional)
    pub fn from_env() -> anyhow::Result<Self> {
        let sandbox_id = std::env::var("SANDBOX_ID")
            .map_err(|_| anyhow::anyhow!("SANDBOX_ID environment variable not set"))?;

        let gpu = std::env::var("GPU")
            .map_err(|_| anyhow::anyhow!("GPU environment variable not set"))?
            .trim()
            .parse::<u32>()
            .map_err(|e| anyhow::anyhow!("GPU must be a GPU index: {}", e))?;

        let workload = match std::env::var("WORKLOAD") {
            Ok(value) => value.parse().map_err(|e: String| anyhow::anyhow!(e))?,
            Err(_) => WorkloadKind::Render,
        };

        let mut config = Self::new(sandbox_id, gpu, workload);

        config.timeout = env_secs("TIMEOUT").filter(|t| !t.is_zero());

        if let Ok(dir) = std::env::var("FILE_DIR") {
            config.file_dir = PathBuf::from(dir);
        }
        config.database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| default_database_url(&config.file_dir));

        if let Ok(addr) = std::env::var("BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Ok(url) = std::env::var("CONTROL_PLANE_URL") {
            config.control_plane_url = url;
        }

        config.tick_interval = env_secs("TICK_INTERVAL").unwrap_or(config.tick_interval);
        config.render_timeout = env_secs("RENDER_TIMEOUT").unwrap_or(config.render_timeout);
        config.benchmark_timeout =
            env_secs("BENCHMARK_TIMEOUT").unwrap_or(config.benchmark_timeout);

        if let Ok(cmd) = std::env::var("RENDER_COMMAND") {
            config.render_command = cmd;
        }
        if let Ok(cmd) = std::env::var("BENCHMARK_COMMAND") {
            config.benchmark_command = cmd;
        }
        config.miner_command = std::env::var("MINER_COMMAND")
            .ok()
            .filter(|cmd| !cmd.trim().is_empty());
        if let Ok(path) = std::env::var("MINER_STATS_PATH") {
            config.miner_stats_path = PathBuf::from(path);
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

        if self.tick_interval.is_zero() {
            anyhow::bail!("tick_interval must be greater than 0");
        }

        if self.render_timeout.is_zero() || self.benchmark_timeout.is_zero() {
            anyhow::bail!("task timeouts must be greater than 0");
        }

        if self.workload == WorkloadKind::Crypto && self.miner_command.is_none() {
            anyhow::bail!("a crypto sandbox needs MINER_COMMAND");
        }

        Ok(())
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self::new(String::new(), 0, WorkloadKind::Render)
    }
}

fn default_database_url(file_dir: &std::path::Path) -> String {
    format!("sqlite://{}", file_dir.join("queue.db").display())
}

fn env_secs(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SandboxConfig::default();
        assert_eq!(config.tick_interval, Duration::from_secs(10));
        assert_eq!(config.render_timeout, Duration::from_secs(7200));
        assert_eq!(config.benchmark_timeout, Duration::from_secs(1200));
        assert!(config.database_url.ends_with("queue.db"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = SandboxConfig::default();

        config.control_plane_url = "api.example.com".to_string();
        assert!(config.validate().is_err());
        config.control_plane_url = DEFAULT_CONTROL_PLANE_URL.to_string();

        config.workload = WorkloadKind::Crypto;
        assert!(config.validate().is_err());

        config.miner_command = Some("xmrig".to_string());
        assert!(config.validate().is_ok());
    }
}
