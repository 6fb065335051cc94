//! Load config from file and environment.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use meshinfo_core::{CoreConfig, NodeId};
use serde::Deserialize;

/// Daemon configuration. File: $MESHINFO_CONFIG, ~/.config/meshinfo/config.toml
/// or /etc/meshinfo/config.toml.
/// Env overrides: MESHINFO_DATA_DIR, MESHINFO_STORAGE_BACKEND, MESHINFO_TRACEROUTE_TIMEOUT_SECS.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub core: CoreConfig,
    #[serde(default)]
    pub hub: HubConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BusConfig {
    /// Subscription filters; `+` and `#` wildcards as on the bus.
    #[serde(default = "default_topics")]
    pub topics: Vec<String>,
    /// Single-topic shorthand, added to `topics`.
    #[serde(default)]
    pub topic: Option<String>,
}

fn default_topics() -> Vec<String> {
    vec!["msh/#".to_string()]
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            topics: default_topics(),
            topic: None,
        }
    }
}

impl BusConfig {
    /// All subscription filters, deduplicated, in declaration order.
    pub fn filters(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for t in self.topics.iter().chain(self.topic.iter()) {
            let t = t.trim();
            if !t.is_empty() && !out.iter().any(|o| o == t) {
                out.push(t.to_string());
            }
        }
        out
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IngestConfig {
    /// Depth of the source -> decode and decode -> apply channels.
    #[serde(default = "default_channel_depth")]
    pub channel_depth: usize,
    /// How often traceroute timeouts are checked.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_channel_depth() -> usize {
    1024
}
fn default_sweep_interval_secs() -> u64 {
    5
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            channel_depth: default_channel_depth(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    File,
    Sqlite,
    Memory,
}

impl FromStr for Backend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" => Ok(Backend::File),
            "sqlite" => Ok(Backend::Sqlite),
            "memory" => Ok(Backend::Memory),
            other => Err(ConfigError::Invalid(format!("unknown storage backend {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    #[serde(default = "default_backend")]
    pub backend: Backend,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_snapshot_interval_secs")]
    pub snapshot_interval_secs: u64,
    /// Pending persistence jobs; appends beyond this are dropped.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    /// Time allowed for the final flush on shutdown.
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_backend() -> Backend {
    Backend::File
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}
fn default_snapshot_interval_secs() -> u64 {
    300
}
fn default_queue_depth() -> usize {
    1024
}
fn default_shutdown_timeout_secs() -> u64 {
    10
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            data_dir: default_data_dir(),
            snapshot_interval_secs: default_snapshot_interval_secs(),
            queue_depth: default_queue_depth(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    5
}
fn default_initial_backoff_ms() -> u64 {
    500
}
fn default_max_backoff_ms() -> u64 {
    30_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HubConfig {
    /// Events buffered per subscriber before the oldest are dropped.
    #[serde(default = "default_hub_capacity")]
    pub capacity: usize,
}

fn default_hub_capacity() -> usize {
    1024
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            capacity: default_hub_capacity(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Node that distances are reported from.
    #[serde(default)]
    pub home_node: Option<NodeId>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl Config {
    /// Apply environment overrides. `lookup` is `std::env::var` outside tests.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("MESHINFO_DATA_DIR") {
            self.storage.data_dir = PathBuf::from(dir);
        }
        if let Some(b) = lookup("MESHINFO_STORAGE_BACKEND") {
            self.storage.backend = b.parse()?;
        }
        if let Some(s) = lookup("MESHINFO_TRACEROUTE_TIMEOUT_SECS") {
            self.core.traceroute_timeout_secs = s.trim().parse().map_err(|_| {
                ConfigError::Invalid(format!("MESHINFO_TRACEROUTE_TIMEOUT_SECS={s:?}"))
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bus.filters().is_empty() {
            return Err(ConfigError::Invalid(
                "bus: at least one topic is required".into(),
            ));
        }
        if self.hub.capacity == 0 {
            return Err(ConfigError::Invalid("hub.capacity must be > 0".into()));
        }
        if self.ingest.channel_depth == 0 || self.storage.queue_depth == 0 {
            return Err(ConfigError::Invalid("channel and queue depths must be > 0".into()));
        }
        if self.storage.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "storage.retry.max_attempts must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Load config: defaults, then the first config file found (or `explicit`), then env vars.
pub fn load(explicit: Option<&Path>) -> Result<Config, ConfigError> {
    let path = match explicit {
        Some(p) => Some(p.to_path_buf()),
        None => config_paths().into_iter().find(|p| p.exists()),
    };
    let mut c = match path {
        Some(p) => load_file(&p)?,
        None => Config::default(),
    };
    c.apply_overrides(|k| std::env::var(k).ok())?;
    c.validate()?;
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Some(p) = std::env::var_os("MESHINFO_CONFIG") {
        out.push(PathBuf::from(p));
    }
    if let Some(h) = std::env::var_os("HOME").map(PathBuf::from) {
        out.push(h.join(".config/meshinfo/config.toml"));
    }
    out.push(PathBuf::from("/etc/meshinfo/config.toml"));
    out
}

pub fn load_file(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&s).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
