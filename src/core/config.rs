//! Configuration parsing and validation.
//!
//! Configuration is loaded from a TOML file with CLI overrides. Every
//! section has defaults, so an empty file is a valid configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Redis connection settings.
    #[serde(default)]
    pub redis: RedisConfig,

    /// Root key prefixes per stack component.
    #[serde(default)]
    pub namespaces: NamespaceConfig,

    /// Distributed mutex settings.
    #[serde(default)]
    pub mutex: MutexConfig,

    /// Scheduled task queue settings.
    #[serde(default)]
    pub tasks: TaskQueueConfig,

    /// Application uplink queue settings.
    #[serde(default)]
    pub uplinks: UplinkQueueConfig,

    /// Metadata deduplication window.
    #[serde(default)]
    pub dedup: DedupConfig,

    /// Scheduled downlink matcher settings.
    #[serde(default)]
    pub downlinks: DownlinkConfig,

    /// Cleanup pagination.
    #[serde(default)]
    pub cleanup: CleanupConfig,

    /// Logging.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Redis connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Server address (e.g., "127.0.0.1:6379").
    #[serde(default = "default_redis_address")]
    pub address: String,

    /// Password for AUTH, if required.
    #[serde(default)]
    pub password: Option<String>,

    /// Logical database index selected on connect.
    #[serde(default)]
    pub database: u32,

    /// Maximum idle connections kept in the pool.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// TCP connect timeout in milliseconds.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Timeout for a single non-blocking request in milliseconds.
    #[serde(default = "default_io_timeout_ms")]
    pub io_timeout_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            address: default_redis_address(),
            password: None,
            database: 0,
            pool_size: default_pool_size(),
            connect_timeout_ms: default_connect_timeout_ms(),
            io_timeout_ms: default_io_timeout_ms(),
        }
    }
}

impl RedisConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}

/// Root namespaces of the Network, Application and Join Server stores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamespaceConfig {
    #[serde(default = "default_ns_root")]
    pub ns: String,
    #[serde(rename = "as", default = "default_as_root")]
    pub r#as: String,
    #[serde(default = "default_js_root")]
    pub js: String,
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            ns: default_ns_root(),
            r#as: default_as_root(),
            js: default_js_root(),
        }
    }
}

/// Distributed mutex configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutexConfig {
    /// Lock TTL in milliseconds.
    #[serde(default = "default_mutex_ttl_ms")]
    pub ttl_ms: u64,

    /// Attempts at a watched transaction before giving up with Aborted.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for MutexConfig {
    fn default() -> Self {
        Self {
            ttl_ms: default_mutex_ttl_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl MutexConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

/// Task queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskQueueConfig {
    /// Approximate cap of the input and ready streams.
    #[serde(default = "default_max_len")]
    pub max_len: usize,

    /// Consumer group name.
    #[serde(default = "default_task_group")]
    pub group: String,

    /// Upper bound of a single blocking stream read in milliseconds.
    #[serde(default = "default_stream_block_limit_ms")]
    pub stream_block_limit_ms: u64,

    /// Idle time after which un-acked ready entries are reclaimed.
    #[serde(default = "default_min_idle_ms")]
    pub min_idle_ms: u64,
}

impl Default for TaskQueueConfig {
    fn default() -> Self {
        Self {
            max_len: default_max_len(),
            group: default_task_group(),
            stream_block_limit_ms: default_stream_block_limit_ms(),
            min_idle_ms: default_min_idle_ms(),
        }
    }
}

/// Application uplink queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UplinkQueueConfig {
    /// Approximate cap of each per-application sub-stream.
    #[serde(default = "default_max_len")]
    pub max_len: usize,

    /// Consumer group name for the sub-streams.
    #[serde(default = "default_uplink_group")]
    pub group: String,

    /// Idle time after which another consumer's entries are claimed.
    #[serde(default = "default_min_idle_ms")]
    pub min_idle_ms: u64,

    /// Messages read per drain call.
    #[serde(default = "default_drain_limit")]
    pub drain_limit: usize,
}

impl Default for UplinkQueueConfig {
    fn default() -> Self {
        Self {
            max_len: default_max_len(),
            group: default_uplink_group(),
            min_idle_ms: default_min_idle_ms(),
            drain_limit: default_drain_limit(),
        }
    }
}

/// Deduplication window configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    #[serde(default = "default_dedup_window_ms")]
    pub window_ms: u64,
    #[serde(default = "default_dedup_limit")]
    pub limit: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            window_ms: default_dedup_window_ms(),
            limit: default_dedup_limit(),
        }
    }
}

/// Scheduled downlink matcher configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownlinkConfig {
    /// How long a scheduled downlink waits for its TX acknowledgment.
    #[serde(default = "default_match_ttl_ms")]
    pub match_ttl_ms: u64,
}

impl Default for DownlinkConfig {
    fn default() -> Self {
        Self {
            match_ttl_ms: default_match_ttl_ms(),
        }
    }
}

/// Cleanup pagination configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupConfig {
    /// Keys requested per SCAN page.
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Delay between pages in milliseconds.
    #[serde(default = "default_pagination_delay_ms")]
    pub pagination_delay_ms: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            pagination_delay_ms: default_pagination_delay_ms(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

// Default value functions

fn default_redis_address() -> String {
    "127.0.0.1:6379".to_string()
}

fn default_pool_size() -> usize {
    16
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_io_timeout_ms() -> u64 {
    10_000
}

fn default_ns_root() -> String {
    "ttn:v3:ns".to_string()
}

fn default_as_root() -> String {
    "ttn:v3:as".to_string()
}

fn default_js_root() -> String {
    "ttn:v3:js".to_string()
}

fn default_mutex_ttl_ms() -> u64 {
    10_000
}

fn default_max_attempts() -> u32 {
    8
}

fn default_max_len() -> usize {
    10_000
}

fn default_task_group() -> String {
    "tasks".to_string()
}

fn default_uplink_group() -> String {
    "uplinks".to_string()
}

fn default_stream_block_limit_ms() -> u64 {
    1_000
}

fn default_min_idle_ms() -> u64 {
    60_000
}

fn default_drain_limit() -> usize {
    100
}

fn default_dedup_window_ms() -> u64 {
    200
}

fn default_dedup_limit() -> usize {
    64
}

fn default_match_ttl_ms() -> u64 {
    60_000
}

fn default_page_size() -> usize {
    1_000
}

fn default_pagination_delay_ms() -> u64 {
    100
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        Self::from_toml(&content)
    }

    /// Load configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).with_context(|| "failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Apply CLI overrides to the configuration.
    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(ref log_level) = overrides.log_level {
            self.telemetry.log_level = log_level.clone();
        }
        if let Some(ref address) = overrides.redis_address {
            self.redis.address = address.clone();
        }
    }

    /// Validate configuration consistency.
    pub fn validate(&self) -> Result<()> {
        self.validate_redis()?;
        self.validate_namespaces()?;
        self.validate_queues()?;
        self.validate_telemetry()?;
        Ok(())
    }

    fn validate_redis(&self) -> Result<()> {
        if self.redis.address.is_empty() {
            anyhow::bail!("redis.address must not be empty");
        }
        if self.redis.pool_size == 0 {
            anyhow::bail!("redis.pool_size must be > 0");
        }
        if self.redis.connect_timeout_ms == 0 || self.redis.io_timeout_ms == 0 {
            anyhow::bail!("redis timeouts must be > 0");
        }
        Ok(())
    }

    fn validate_namespaces(&self) -> Result<()> {
        for (name, root) in [
            ("ns", &self.namespaces.ns),
            ("as", &self.namespaces.r#as),
            ("js", &self.namespaces.js),
        ] {
            if root.is_empty() {
                anyhow::bail!("namespaces.{} must not be empty", name);
            }
            if root.ends_with(':') {
                anyhow::bail!("namespaces.{} must not end with ':', got: {}", name, root);
            }
        }
        Ok(())
    }

    fn validate_queues(&self) -> Result<()> {
        if self.mutex.ttl_ms == 0 {
            anyhow::bail!("mutex.ttl_ms must be > 0");
        }
        if self.mutex.max_attempts == 0 {
            anyhow::bail!("mutex.max_attempts must be > 0");
        }
        if self.tasks.max_len == 0 || self.uplinks.max_len == 0 {
            anyhow::bail!("queue max_len must be > 0");
        }
        if self.tasks.group.is_empty() || self.uplinks.group.is_empty() {
            anyhow::bail!("consumer group names must not be empty");
        }
        if self.tasks.stream_block_limit_ms == 0 {
            anyhow::bail!("tasks.stream_block_limit_ms must be > 0");
        }
        if self.uplinks.drain_limit == 0 {
            anyhow::bail!("uplinks.drain_limit must be > 0");
        }
        if self.dedup.window_ms == 0 || self.dedup.limit == 0 {
            anyhow::bail!("dedup.window_ms and dedup.limit must be > 0");
        }
        if self.downlinks.match_ttl_ms == 0 {
            anyhow::bail!("downlinks.match_ttl_ms must be > 0");
        }
        if self.cleanup.page_size == 0 {
            anyhow::bail!("cleanup.page_size must be > 0");
        }
        Ok(())
    }

    fn validate_telemetry(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.telemetry.log_level.as_str()) {
            anyhow::bail!(
                "telemetry.log_level must be one of {:?}, got: {}",
                valid_levels,
                self.telemetry.log_level
            );
        }
        Ok(())
    }
}

/// CLI override options that can be applied to configuration.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// Override log level.
    pub log_level: Option<String>,
    /// Override Redis address.
    pub redis_address: Option<String>,
}
