use crate::probe::VerifyMode;
use crate::retry::RetryPolicy;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Engine configuration, loaded from a TOML file. Every field has a
/// default, so a missing file yields a fully working configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_machine_id")]
    pub machine_id: i32,
    #[serde(default = "default_node_id")]
    pub node_id: i32,
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub boot: BootConfig,
    #[serde(default)]
    pub http_check: HttpCheckConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScanConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_verify_mode")]
    pub verify_mode: VerifyMode,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_max_retry_elapsed_secs")]
    pub max_retry_elapsed_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_poll_secs")]
    pub poll_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BootConfig {
    #[serde(default = "default_boot_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_boot_retry_delay_secs")]
    pub retry_delay_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpCheckConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_connect_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_data_dir() -> String {
    "data".to_string()
}

fn default_machine_id() -> i32 {
    1
}

fn default_node_id() -> i32 {
    1
}

fn default_max_concurrent() -> usize {
    500
}

fn default_batch_size() -> usize {
    1000
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_verify_mode() -> VerifyMode {
    VerifyMode::Permissive
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_max_retry_elapsed_secs() -> u64 {
    30
}

fn default_interval_secs() -> u64 {
    3600
}

fn default_poll_secs() -> u64 {
    10
}

fn default_boot_max_retries() -> u32 {
    30
}

fn default_boot_retry_delay_secs() -> u64 {
    2
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            batch_size: default_batch_size(),
            connect_timeout_secs: default_connect_timeout_secs(),
            verify_mode: default_verify_mode(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            max_retry_elapsed_secs: default_max_retry_elapsed_secs(),
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            poll_secs: default_poll_secs(),
        }
    }
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            max_retries: default_boot_max_retries(),
            retry_delay_secs: default_boot_retry_delay_secs(),
        }
    }
}

impl Default for HttpCheckConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            machine_id: default_machine_id(),
            node_id: default_node_id(),
            scan: ScanConfig::default(),
            retry: RetryConfig::default(),
            schedule: ScheduleConfig::default(),
            boot: BootConfig::default(),
            http_check: HttpCheckConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load from `path`. A missing file falls back to defaults; a file
    /// that exists but does not parse is an error.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            tracing::warn!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(raw)?;
        Ok(config)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry.max_attempts,
            Duration::from_millis(self.retry.backoff_base_ms),
            Duration::from_secs(self.retry.max_retry_elapsed_secs),
        )
    }
}
