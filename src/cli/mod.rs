//! Command-line interface.
//!
//! Maintenance commands for the coordination stores, and a `start` command
//! running the background dispatchers.

pub mod commands;

use crate::core::config::{Config, ConfigOverrides};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Default configuration file path.
pub const DEFAULT_CONFIG_PATH: &str = "config/lorawan-coord.toml";

/// lorawan-coord - Redis-backed coordination for LoRaWAN servers.
#[derive(Parser, Debug)]
#[command(name = "lorawan-coord")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path. Defaults apply when the file is absent.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Redis address, overriding the configuration.
    #[arg(long, global = true)]
    pub redis_address: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Store maintenance.
    Db(commands::DbArgs),
    /// Configuration operations.
    Config(commands::ConfigArgs),
    /// Run the task dispatchers until interrupted.
    Start(commands::StartArgs),
}

impl Cli {
    pub fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            log_level: self.log_level.clone(),
            redis_address: self.redis_address.clone(),
        }
    }

    /// Load the configuration and apply command line overrides.
    ///
    /// A missing file is only an error when `--config` was given.
    pub fn load_config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)
                .with_context(|| format!("failed to load config from {}", path.display()))?,
            None => {
                let path = PathBuf::from(DEFAULT_CONFIG_PATH);
                if path.exists() {
                    Config::from_file(&path)?
                } else {
                    Config::default()
                }
            }
        };
        config.apply_overrides(&self.overrides());
        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}

/// Initialize the tracing subscriber if the telemetry feature is enabled.
///
/// `RUST_LOG` takes precedence over `level`.
#[cfg(feature = "telemetry")]
pub fn init_tracing(level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .try_init();
}

#[cfg(not(feature = "telemetry"))]
pub fn init_tracing(_level: &str) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_db_migrate() {
        let cli = Cli::parse_from([
            "lorawan-coord",
            "--log-level",
            "debug",
            "db",
            "migrate",
            "--namespace",
            "ns",
            "--rollback",
        ]);
        assert_eq!(cli.overrides().log_level.as_deref(), Some("debug"));
        assert!(matches!(cli.command, Commands::Db(_)));
    }

    #[test]
    fn test_overrides_apply() {
        let cli = Cli::parse_from([
            "lorawan-coord",
            "--redis-address",
            "10.0.0.1:6379",
            "config",
            "validate",
        ]);
        let config = cli.load_config().unwrap();
        assert_eq!(config.redis.address, "10.0.0.1:6379");
    }
}
