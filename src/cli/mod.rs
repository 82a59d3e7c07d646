//! Command-line interface for kpistore.
//!
//! Run `kpistore` to start the store and HTTP API with sensible defaults.

use crate::application::Application;
use crate::core::config::ConfigBuilder;
use crate::core::{Config, Result, StoreError};
use crate::registry::{KpiRegistry, StaticKpiRegistry};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

/// Time-partitioned store for KPI observations
#[derive(Parser, Debug)]
#[command(name = "kpistore")]
#[command(version, about, long_about = None)]
#[command(disable_version_flag = true)]
pub struct Cli {
    /// HTTP port for the API
    #[arg(long, env = "KPISTORE_HTTP_PORT")]
    pub http_port: Option<u16>,

    /// Directory for cold blocks
    #[arg(long, env = "KPISTORE_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Configuration file path (default: ~/.config/kpistore/config.yaml)
    #[arg(short, long, env = "KPISTORE_CONFIG")]
    pub config: Option<PathBuf>,

    /// KPI definitions file used for display names
    #[arg(long, env = "KPISTORE_REGISTRY")]
    pub registry: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, env = "KPISTORE_DEBUG")]
    pub debug: bool,

    /// Structured log output (targets, thread ids, line numbers)
    #[arg(long, env = "KPISTORE_STRUCTURED_LOGS")]
    pub structured: bool,

    /// Validate configuration and exit
    #[arg(long)]
    pub check_config: bool,

    /// Show version information
    #[arg(short = 'V', long = "show-version")]
    pub version: bool,
}

impl Cli {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Cli::parse()
    }

    /// Path of the config file in use, if any
    pub fn config_path(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config {
            return Some(path.clone());
        }
        dirs::config_dir()
            .map(|d| d.join("kpistore").join("config.yaml"))
            .filter(|p| p.exists())
    }

    /// Load configuration with precedence CLI > environment > file > defaults.
    ///
    /// Environment variables reach clap through `env = ...`, so they share
    /// the CLI override step.
    pub async fn load_config(&self) -> Result<Config> {
        let mut builder = ConfigBuilder::new();

        if let Some(path) = self.config_path() {
            match tokio::fs::read_to_string(&path).await {
                Ok(content) => {
                    builder = builder.from_yaml(&content)?;
                    tracing::info!("Loaded configuration from: {:?}", path);
                },
                Err(e) if self.config.is_some() => {
                    return Err(StoreError::config(format!(
                        "Failed to read config file {:?}: {}",
                        path, e
                    )));
                },
                Err(_) => {
                    tracing::debug!("No config file found at {:?}, using defaults", path);
                },
            }
        }

        self.apply_overrides(builder).build()
    }

    fn apply_overrides(&self, mut builder: ConfigBuilder) -> ConfigBuilder {
        if let Some(port) = self.http_port {
            builder = builder.http_port(port);
        }
        if let Some(dir) = &self.data_dir {
            builder = builder.data_dir(dir.clone());
        }
        if self.debug {
            builder = builder.debug(true);
        }
        builder
    }

    /// Initialize logging.
    pub fn init_logging(&self) -> Result<()> {
        use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

        let env_log_level =
            std::env::var("KPISTORE_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        let log_level = if self.debug {
            "debug"
        } else {
            env_log_level.as_str()
        };

        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

        let fmt_layer = if self.structured {
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_line_number(true)
                .compact()
        } else {
            tracing_subscriber::fmt::layer().with_target(false).compact()
        };

        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .try_init()
            .map_err(|e| StoreError::config(format!("Failed to initialize logging: {}", e)))?;

        Ok(())
    }

    fn load_registry(&self) -> Result<Arc<dyn KpiRegistry>> {
        match &self.registry {
            Some(path) => {
                let registry = StaticKpiRegistry::from_file(path)?;
                tracing::info!("Loaded {} KPI definitions from {:?}", registry.len(), path);
                Ok(Arc::new(registry))
            },
            None => Ok(Arc::new(StaticKpiRegistry::new(Vec::new()))),
        }
    }
}

/// Execute kpistore.
pub async fn execute(cli: Cli) -> Result<()> {
    if cli.version {
        println!("kpistore {}", env!("CARGO_PKG_VERSION"));
        println!("Time-partitioned KPI observation store");
        return Ok(());
    }

    cli.init_logging()?;
    let config = cli.load_config().await?;

    if cli.check_config {
        config.validate()?;
        println!("Configuration is valid!");
        println!("  HTTP port: {}", config.server.http_port);
        println!("  Data dir: {}", config.storage.data_dir.display());
        println!("  Partition window: {:?}", config.storage.partition_window);
        println!(
            "  Retention: hot {}d, warm {}d, cold {}d",
            config.retention.hot_days, config.retention.warm_days, config.retention.cold_days
        );
        return Ok(());
    }

    let registry = cli.load_registry()?;
    let mut app = Application::new(config)?.with_registry(registry);
    if let Some(path) = cli.config_path() {
        app = app.with_config_path(path);
    }
    app.run().await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare() -> Cli {
        Cli {
            http_port: None,
            data_dir: None,
            config: None,
            registry: None,
            debug: false,
            structured: false,
            check_config: false,
            version: false,
        }
    }

    #[test]
    fn test_cli_flags_parse() {
        let cli = Cli::try_parse_from([
            "kpistore",
            "--http-port",
            "9000",
            "--data-dir",
            "/tmp/kpi",
            "--structured",
        ])
        .unwrap();
        assert_eq!(cli.http_port, Some(9000));
        assert_eq!(cli.data_dir, Some(PathBuf::from("/tmp/kpi")));
        assert!(cli.structured);
    }

    #[tokio::test]
    async fn test_cli_overrides_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "server:\n  http_port: 7000\nretention:\n  hot_days: 3\n").unwrap();

        let mut cli = bare();
        cli.config = Some(path);
        cli.http_port = Some(9100);
        let config = cli.load_config().await.unwrap();

        assert_eq!(config.server.http_port, 9100);
        assert_eq!(config.retention.hot_days, 3);
    }

    #[tokio::test]
    async fn test_missing_explicit_config_fails() {
        let mut cli = bare();
        cli.config = Some(PathBuf::from("/nonexistent/kpistore.yaml"));
        assert!(matches!(cli.load_config().await, Err(StoreError::Config(_))));
    }
}
