//! Configuration types for workshop-dl

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::{path::Path, path::PathBuf, time::Duration};

/// External tool settings (steamcmd binary, app, login)
///
/// Used as a nested sub-config within [`Config`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolConfig {
    /// Path to the steamcmd executable (auto-detected if None)
    #[serde(default)]
    pub steamcmd_path: Option<PathBuf>,

    /// Whether to search PATH for steamcmd if no explicit path is set (default: true)
    #[serde(default = "default_true")]
    pub search_path: bool,

    /// Steam application ID whose workshop items are downloaded (default: "252490")
    #[serde(default = "default_app_id")]
    pub app_id: String,

    /// Account used in the `login` directive (default: "anonymous")
    #[serde(default = "default_login")]
    pub login: String,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            steamcmd_path: None,
            search_path: true,
            app_id: default_app_id(),
            login: default_login(),
        }
    }
}

/// Filesystem layout: shared destination, per-slot roots, logs, reports
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LayoutConfig {
    /// Shared destination root (default: "rust_workshop")
    #[serde(default = "default_shared_root")]
    pub shared_root: PathBuf,

    /// Parent directory of all isolation directories (default: "instances")
    #[serde(default = "default_instances_root")]
    pub instances_root: PathBuf,

    /// Directory name prefix for each slot, the slot index is appended (default: "rust_workshop_t")
    #[serde(default = "default_instance_prefix")]
    pub instance_prefix: String,

    /// Per-slot, per-pass tool logs (default: "logs")
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// Generated command scripts (default: "temp_scripts")
    #[serde(default = "default_script_dir")]
    pub script_dir: PathBuf,

    /// Persisted retry list written at the end of a run (default: "failed_ids.txt")
    #[serde(default = "default_failed_ids_file")]
    pub failed_ids_file: PathBuf,

    /// Human-readable run report (default: "download_report.txt")
    #[serde(default = "default_report_file")]
    pub report_file: PathBuf,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            shared_root: default_shared_root(),
            instances_root: default_instances_root(),
            instance_prefix: default_instance_prefix(),
            log_dir: default_log_dir(),
            script_dir: default_script_dir(),
            failed_ids_file: default_failed_ids_file(),
            report_file: default_report_file(),
        }
    }
}

/// Pass and worker behavior
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunConfig {
    /// Concurrent tool instances on the first pass (default: 4)
    #[serde(default = "default_max_instances")]
    pub max_instances: usize,

    /// Per-item timeout budget; an instance gets this times its chunk size (default: 90 seconds)
    #[serde(default = "default_base_timeout", with = "duration_serde")]
    pub base_timeout_per_item: Duration,

    /// Retry passes after the first pass (default: 3)
    #[serde(default = "default_max_retry_passes")]
    pub max_retry_passes: u32,

    /// How often the progress reporter samples the result store (default: 500 ms)
    #[serde(default = "default_poll_interval", with = "duration_millis_serde")]
    pub poll_interval: Duration,

    /// Mark items already present in the shared destination as skipped (default: true)
    #[serde(default = "default_true")]
    pub skip_existing: bool,

    /// Only dispatch IDs listed in the persisted retry list (default: false)
    #[serde(default)]
    pub only_previously_failed: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_instances: default_max_instances(),
            base_timeout_per_item: default_base_timeout(),
            max_retry_passes: default_max_retry_passes(),
            poll_interval: default_poll_interval(),
            skip_existing: true,
            only_previously_failed: false,
        }
    }
}

/// Backoff applied between retry passes after a rate-limit signal
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Delay before the first retry pass (default: 60 seconds)
    #[serde(default = "default_initial_delay", with = "duration_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between passes (default: 600 seconds)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

/// Main configuration for the download engine
///
/// Sub-configs are flattened, so the JSON file is a single flat object:
///
/// ```json
/// { "app_id": "252490", "max_instances": 3, "base_timeout_per_item": 120 }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// External tool settings
    #[serde(flatten)]
    pub tool: ToolConfig,

    /// Filesystem layout
    #[serde(flatten)]
    pub layout: LayoutConfig,

    /// Pass and worker behavior
    #[serde(flatten)]
    pub run: RunConfig,

    /// Rate-limit backoff between passes
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Config {
    /// Load a configuration from a JSON file; missing keys take their defaults
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| Error::Config {
            message: format!("cannot read config file {}: {}", path.display(), e),
            key: None,
        })?;
        let config: Config = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.run.max_instances == 0 {
            return Err(Error::config("max_instances", "must be at least 1"));
        }
        if self.run.base_timeout_per_item.is_zero() {
            return Err(Error::config(
                "base_timeout_per_item",
                "must be greater than zero",
            ));
        }
        if self.run.poll_interval.is_zero() {
            return Err(Error::config("poll_interval", "must be greater than zero"));
        }
        if self.tool.app_id.is_empty() || !self.tool.app_id.chars().all(|c| c.is_ascii_digit()) {
            return Err(Error::config("app_id", "must be a numeric Steam app id"));
        }
        if self.tool.login.trim().is_empty() {
            return Err(Error::config("login", "must not be empty"));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(Error::config(
                "backoff_multiplier",
                "must be at least 1.0",
            ));
        }
        Ok(())
    }

    /// Slots used by retry passes: half the initial count, at least one
    pub fn retry_instances(&self) -> usize {
        (self.run.max_instances / 2).max(1)
    }

    /// Total number of passes including the first one
    pub fn total_passes(&self) -> u32 {
        self.run.max_retry_passes + 1
    }
}

fn default_true() -> bool {
    true
}

fn default_app_id() -> String {
    "252490".to_string()
}

fn default_login() -> String {
    "anonymous".to_string()
}

fn default_shared_root() -> PathBuf {
    PathBuf::from("rust_workshop")
}

fn default_instances_root() -> PathBuf {
    PathBuf::from("instances")
}

fn default_instance_prefix() -> String {
    "rust_workshop_t".to_string()
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_script_dir() -> PathBuf {
    PathBuf::from("temp_scripts")
}

fn default_failed_ids_file() -> PathBuf {
    PathBuf::from("failed_ids.txt")
}

fn default_report_file() -> PathBuf {
    PathBuf::from("download_report.txt")
}

fn default_max_instances() -> usize {
    4
}

fn default_base_timeout() -> Duration {
    Duration::from_secs(90)
}

fn default_max_retry_passes() -> u32 {
    3
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(500)
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(600)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

// Duration serialization helper
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

// Millisecond Duration serialization helper, shared with the event types
pub(crate) mod duration_millis_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
