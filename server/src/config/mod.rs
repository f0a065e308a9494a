//! Server configuration

use anyhow::{Context, Result};
use protocol::{DEFAULT_CONTROL_PORT, DEFAULT_DURATION_SEC, FlagSet};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Environment variable that overrides `[binary] path`
pub const BINARY_PATH_ENV: &str = "UDPST_BINARY_PATH";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub binary: BinaryConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_bind_port")]
    pub bind_port: u16,
    /// Owner label for server instances; "auto" uses the host name
    #[serde(default = "default_auto")]
    pub machine_id: String,
    #[serde(default = "default_database_path")]
    pub database_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BinaryConfig {
    #[serde(default = "default_binary_path")]
    pub path: PathBuf,
    #[serde(default = "default_control_port")]
    pub default_port: u16,
    #[serde(default = "default_duration_sec")]
    pub default_duration_sec: u32,
    /// Soft ceiling, only logged when exceeded
    #[serde(default = "default_max_concurrent_tests")]
    pub max_concurrent_tests: usize,
    #[serde(default = "default_startup_grace_ms")]
    pub startup_grace_ms: u64,
    /// Added to the requested duration before a run is killed. At least
    /// [`MIN_WATCHDOG_GRACE_SEC`].
    #[serde(default = "default_watchdog_grace_sec")]
    pub watchdog_grace_sec: u64,
    #[serde(default)]
    pub flags: FlagSet,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProbeConfig {
    #[serde(default = "default_ping_timeout_ms")]
    pub ping_timeout_ms: u64,
    #[serde(default = "default_udp_timeout_ms")]
    pub udp_timeout_ms: u64,
    #[serde(default = "default_binary_probe_timeout_ms")]
    pub binary_probe_timeout_ms: u64,
    /// Lowercase substrings in binary output that mean the service answered
    #[serde(default = "default_success_markers")]
    pub success_markers: Vec<String>,
    /// Lowercase substrings that mean it did not; checked first
    #[serde(default = "default_failure_markers")]
    pub failure_markers: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_bind_port() -> u16 {
    3000
}

fn default_auto() -> String {
    "auto".to_string()
}

fn default_database_path() -> String {
    "udpst-panel.db".to_string()
}

fn default_binary_path() -> PathBuf {
    PathBuf::from("./udpst")
}

fn default_control_port() -> u16 {
    DEFAULT_CONTROL_PORT
}

fn default_duration_sec() -> u32 {
    DEFAULT_DURATION_SEC
}

fn default_max_concurrent_tests() -> usize {
    10
}

fn default_startup_grace_ms() -> u64 {
    2000
}

pub const MIN_WATCHDOG_GRACE_SEC: u64 = 60;

fn default_watchdog_grace_sec() -> u64 {
    MIN_WATCHDOG_GRACE_SEC
}

fn default_ping_timeout_ms() -> u64 {
    2000
}

fn default_udp_timeout_ms() -> u64 {
    3000
}

fn default_binary_probe_timeout_ms() -> u64 {
    5000
}

fn default_success_markers() -> Vec<String> {
    ["\"errorstatus\"", "sub-interval", "connection established", "test completed"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_failure_markers() -> Vec<String> {
    [
        "connection refused",
        "no route to host",
        "network is unreachable",
        "host is unreachable",
        "name or service not known",
        "connection unavailable",
        "timed out",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            bind_port: default_bind_port(),
            machine_id: default_auto(),
            database_path: default_database_path(),
        }
    }
}

impl Default for BinaryConfig {
    fn default() -> Self {
        Self {
            path: default_binary_path(),
            default_port: default_control_port(),
            default_duration_sec: default_duration_sec(),
            max_concurrent_tests: default_max_concurrent_tests(),
            startup_grace_ms: default_startup_grace_ms(),
            watchdog_grace_sec: default_watchdog_grace_sec(),
            flags: FlagSet::default(),
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            ping_timeout_ms: default_ping_timeout_ms(),
            udp_timeout_ms: default_udp_timeout_ms(),
            binary_probe_timeout_ms: default_binary_probe_timeout_ms(),
            success_markers: default_success_markers(),
            failure_markers: default_failure_markers(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(content).context("Failed to parse config file")?;

        if let Ok(path) = std::env::var(BINARY_PATH_ENV) {
            if !path.is_empty() {
                config.binary.path = PathBuf::from(path);
            }
        }

        if config.general.machine_id == "auto" {
            config.general.machine_id = detect_machine_id();
        }

        if config.binary.default_duration_sec == 0 {
            anyhow::bail!("binary.default_duration_sec must be positive");
        }

        if config.binary.watchdog_grace_sec < MIN_WATCHDOG_GRACE_SEC {
            anyhow::bail!(
                "binary.watchdog_grace_sec must be at least {}, got {}",
                MIN_WATCHDOG_GRACE_SEC,
                config.binary.watchdog_grace_sec
            );
        }

        Ok(config)
    }
}

/// Host name, or a fixed label when the OS will not tell us
fn detect_machine_id() -> String {
    sysinfo::System::host_name()
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "default".to_string())
}
