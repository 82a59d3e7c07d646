//! Configuration management for kpistore.
//!
//! This module provides configuration handling with:
//! - YAML file support
//! - Environment variable and CLI overrides (applied by the CLI layer)
//! - Validation and defaults
//! - Hot reload of the retention policy

use crate::core::{Result, StoreError};
use crate::rollup::Granularity;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

const HOUR: Duration = Duration::from_secs(3600);

/// Complete configuration for kpistore
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP server configuration
    pub server: ServerConfig,
    /// Storage configuration
    pub storage: StorageConfig,
    /// Retention policy (re-read on every retention cycle)
    pub retention: RetentionPolicy,
    /// Continuous aggregation configuration
    pub aggregation: AggregationConfig,
    /// Query budgets
    pub query: QueryConfig,
    /// Background job timers
    pub jobs: JobsConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Debug mode
    #[serde(skip)]
    pub debug: bool,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address for the API
    pub bind_address: IpAddr,
    /// HTTP port
    pub http_port: u16,
    /// Largest accepted batch
    pub max_batch_size: usize,
    /// Enable permissive CORS headers
    pub enable_cors: bool,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory for cold blocks
    pub data_dir: PathBuf,
    /// Width of a partition window; fixed for the lifetime of a store
    #[serde(with = "humantime_serde")]
    pub partition_window: Duration,
    /// How long after a window closes late writes still land in the open partition
    #[serde(with = "humantime_serde")]
    pub seal_grace: Duration,
    /// Capacity of the write path → aggregator queue
    pub aggregator_queue_capacity: usize,
    /// Number of decompressed cold blocks kept in memory
    pub cold_cache_capacity: usize,
}

/// Age thresholds for the hot → warm → cold → archived/purged state machine.
///
/// Every threshold is an age measured from the end of a partition's window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionPolicy {
    /// Partitions younger than this stay hot
    pub hot_days: u32,
    /// Partitions younger than this (and past `hot_days`) are warm
    pub warm_days: u32,
    /// Partitions younger than this (and past `warm_days`) are cold
    pub cold_days: u32,
    /// Export destination for expired partitions; purge outright when absent
    pub archive_sink: Option<PathBuf>,
}

/// Continuous aggregation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    /// Granularities materialized eagerly (hour is always maintained)
    pub materialize: Vec<Granularity>,
    /// Maximum events applied per drain
    pub max_events_per_drain: usize,
}

/// Query budgets
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Raw rows a single query may scan before it is truncated
    pub max_scanned_rows: usize,
    /// Wall-clock budget for a single query
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

/// Background job timers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    /// Compression/rollover cycle interval
    #[serde(with = "humantime_serde")]
    pub rollover_interval: Duration,
    /// Retention cycle interval
    #[serde(with = "humantime_serde")]
    pub retention_interval: Duration,
    /// Aggregator drain interval
    #[serde(with = "humantime_serde")]
    pub aggregation_interval: Duration,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: LogLevel,
    /// Structured (target/thread/line) output
    pub structured: bool,
}

/// Log levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            retention: RetentionPolicy::default(),
            aggregation: AggregationConfig::default(),
            query: QueryConfig::default(),
            jobs: JobsConfig::default(),
            logging: LoggingConfig::default(),
            debug: false,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind_address: IpAddr::from([0, 0, 0, 0]),
            http_port: 8086,
            max_batch_size: 10_000,
            enable_cors: true,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            data_dir: PathBuf::from("./kpistore_data"),
            partition_window: Duration::from_secs(24 * 3600), // 1 day
            seal_grace: Duration::from_secs(2 * 3600),
            aggregator_queue_capacity: 65_536,
            cold_cache_capacity: 16,
        }
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        RetentionPolicy {
            hot_days: 90,
            warm_days: 365,
            cold_days: 7 * 365,
            archive_sink: None,
        }
    }
}

impl Default for AggregationConfig {
    fn default() -> Self {
        AggregationConfig {
            materialize: vec![Granularity::Hour, Granularity::Day],
            max_events_per_drain: 100_000,
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        QueryConfig {
            max_scanned_rows: 5_000_000,
            timeout: Duration::from_secs(10),
        }
    }
}

impl Default for JobsConfig {
    fn default() -> Self {
        JobsConfig {
            rollover_interval: Duration::from_secs(60),
            retention_interval: Duration::from_secs(3600),
            aggregation_interval: Duration::from_millis(500),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: LogLevel::Info,
            structured: false,
        }
    }
}

impl RetentionPolicy {
    /// Validate threshold ordering
    pub fn validate(&self) -> Result<()> {
        if self.hot_days > self.warm_days || self.warm_days > self.cold_days {
            return Err(StoreError::config(format!(
                "retention thresholds must satisfy hot_days <= warm_days <= cold_days, got {}/{}/{}",
                self.hot_days, self.warm_days, self.cold_days
            )));
        }
        Ok(())
    }

    /// Oldest window end still accepted by the store
    pub fn horizon(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.cold_days))
    }
}

impl Config {
    /// Create new config with defaults
    pub fn new() -> Result<Self> {
        let config = Config::default();
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML configuration file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            StoreError::config(format!("Failed to read config file {:?}: {}", path, e))
        })?;
        ConfigBuilder::new().from_yaml(&content)?.build()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.max_batch_size == 0 {
            return Err(StoreError::config("max_batch_size must be greater than 0"));
        }

        let window = self.storage.partition_window;
        if window < HOUR || window.as_secs() % HOUR.as_secs() != 0 || window.subsec_nanos() != 0 {
            return Err(StoreError::config(format!(
                "partition_window must be a whole number of hours, got {:?}",
                window
            )));
        }

        if self.storage.aggregator_queue_capacity == 0 {
            return Err(StoreError::config(
                "aggregator_queue_capacity must be greater than 0",
            ));
        }

        self.retention.validate()?;

        if self.query.max_scanned_rows == 0 {
            return Err(StoreError::config("max_scanned_rows must be greater than 0"));
        }

        if self.jobs.rollover_interval.is_zero()
            || self.jobs.retention_interval.is_zero()
            || self.jobs.aggregation_interval.is_zero()
        {
            return Err(StoreError::config("job intervals must be greater than 0"));
        }

        Ok(())
    }
}

impl LogLevel {
    /// Convert to tracing filter string
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Configuration builder for programmatic construction
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder with defaults
    pub fn new() -> Self {
        ConfigBuilder {
            config: Config::default(),
        }
    }

    /// Load configuration from YAML string
    pub fn from_yaml(mut self, yaml: &str) -> Result<Self> {
        self.config = serde_yaml::from_str(yaml)
            .map_err(|e| StoreError::config(format!("Failed to parse YAML config: {}", e)))?;
        Ok(self)
    }

    /// Set HTTP port
    pub fn http_port(mut self, port: u16) -> Self {
        self.config.server.http_port = port;
        self
    }

    /// Set data directory
    pub fn data_dir(mut self, path: PathBuf) -> Self {
        self.config.storage.data_dir = path;
        self
    }

    /// Set partition window width
    pub fn partition_window(mut self, window: Duration) -> Self {
        self.config.storage.partition_window = window;
        self
    }

    /// Set seal grace period
    pub fn seal_grace(mut self, grace: Duration) -> Self {
        self.config.storage.seal_grace = grace;
        self
    }

    /// Set aggregator queue capacity
    pub fn aggregator_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.storage.aggregator_queue_capacity = capacity;
        self
    }

    /// Set the retention policy
    pub fn retention(mut self, policy: RetentionPolicy) -> Self {
        self.config.retention = policy;
        self
    }

    /// Set eagerly materialized granularities
    pub fn materialize(mut self, granularities: Vec<Granularity>) -> Self {
        self.config.aggregation.materialize = granularities;
        self
    }

    /// Set query scan budget
    pub fn max_scanned_rows(mut self, rows: usize) -> Self {
        self.config.query.max_scanned_rows = rows;
        self
    }

    /// Set query timeout
    pub fn query_timeout(mut self, timeout: Duration) -> Self {
        self.config.query.timeout = timeout;
        self
    }

    /// Set debug mode
    pub fn debug(mut self, debug: bool) -> Self {
        self.config.debug = debug;
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Watch configuration file for changes
pub struct ConfigWatcher {
    path: PathBuf,
    tx: tokio::sync::watch::Sender<Config>,
    rx: tokio::sync::watch::Receiver<Config>,
}

impl ConfigWatcher {
    /// Create a new configuration watcher
    pub fn new(path: PathBuf, initial: Config) -> Self {
        let (tx, rx) = tokio::sync::watch::channel(initial);
        ConfigWatcher { path, tx, rx }
    }

    /// Get a receiver for configuration updates
    pub fn subscribe(&self) -> tokio::sync::watch::Receiver<Config> {
        self.rx.clone()
    }

    /// Start watching for configuration changes
    pub async fn watch(self) -> Result<()> {
        use notify::{RecursiveMode, Watcher};

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let mut watcher = notify::recommended_watcher(move |res| {
            if let Ok(event) = res {
                let _ = tx.send(event);
            }
        })
        .map_err(|e| StoreError::config(format!("Failed to create file watcher: {}", e)))?;

        watcher
            .watch(&self.path, RecursiveMode::NonRecursive)
            .map_err(|e| StoreError::config(format!("Failed to watch config file: {}", e)))?;

        tracing::info!("Watching configuration file: {:?}", self.path);

        while let Some(event) = rx.recv().await {
            if !matches!(event.kind, notify::EventKind::Modify(_)) {
                continue;
            }
            tracing::info!("Configuration file changed, reloading...");

            let content = match tokio::fs::read_to_string(&self.path).await {
                Ok(content) => content,
                Err(e) => {
                    tracing::error!("Failed to read configuration file: {}", e);
                    continue;
                },
            };

            match serde_yaml::from_str::<Config>(&content) {
                Ok(new_config) => {
                    if let Err(e) = new_config.validate() {
                        tracing::error!("Invalid configuration: {}", e);
                        continue;
                    }
                    let merged = self.merge_reloaded(new_config);
                    if let Err(e) = self.tx.send(merged) {
                        tracing::error!("Failed to update configuration: {}", e);
                    }
                    tracing::info!("Configuration reloaded successfully");
                },
                Err(e) => {
                    tracing::error!("Failed to parse configuration: {}", e);
                },
            }
        }

        Ok(())
    }

    /// Keep settings that cannot change while a store is running.
    fn merge_reloaded(&self, mut new_config: Config) -> Config {
        let current = self.tx.borrow();
        if new_config.storage.partition_window != current.storage.partition_window {
            tracing::warn!(
                "partition_window is fixed for the lifetime of a store; ignoring change from {:?} to {:?}",
                current.storage.partition_window,
                new_config.storage.partition_window
            );
            new_config.storage.partition_window = current.storage.partition_window;
        }
        new_config.storage.data_dir = current.storage.data_dir.clone();
        new_config.debug = current.debug;
        new_config
    }
}
