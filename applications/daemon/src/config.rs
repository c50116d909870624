/// Daemon configuration
use crate::error::{DaemonError, Result};
use serde::{Deserialize, Serialize};
use soulspot_jobs::WorkerPoolConfig;
use soulspot_metadata::DEFAULT_EXTENSIONS;
use soulspot_storage::logs::{LogLevel, LogWriterConfig};
use soulspot_storage::{PoolSettings, RetryConfig, WriteBufferConfig};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Config file read when `--config` is not given, if it exists
pub const DEFAULT_CONFIG_FILE: &str = "soulspot.toml";

/// Prefix of environment overrides, e.g. `SOULSPOT_WORKERS__COUNT=4`
pub const ENV_PREFIX: &str = "SOULSPOT";

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SoulSpotConfig {
    #[serde(default = "default_database")]
    pub database: DatabaseSettings,

    #[serde(default = "default_retry")]
    pub retry: RetrySettings,

    #[serde(default = "default_write_buffer")]
    pub write_buffer: WriteBufferSettings,

    #[serde(default = "default_workers")]
    pub workers: WorkerSettings,

    #[serde(default = "default_logging")]
    pub logging: LoggingSettings,

    #[serde(default = "default_library")]
    pub library: LibrarySettings,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DatabaseSettings {
    #[serde(default = "default_database_url")]
    pub url: String,

    /// Logs live in a separate file so log bursts never hold the library lock
    #[serde(default = "default_logs_url")]
    pub logs_url: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
}

/// Backoff for "database is locked"
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RetrySettings {
    #[serde(default = "default_retry_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_retry_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_retry_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_retry_multiplier")]
    pub multiplier: f64,

    #[serde(default = "default_retry_jitter")]
    pub jitter: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct WriteBufferSettings {
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,

    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct WorkerSettings {
    #[serde(default = "default_worker_count")]
    pub count: usize,

    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Attempts for jobs created by the daemon
    #[serde(default = "default_max_job_attempts")]
    pub max_job_attempts: u32,

    #[serde(default)]
    pub job_timeout_secs: Option<u64>,

    /// Delay before the first retry of a failed job
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,

    #[serde(default = "default_max_retry_delay_secs")]
    pub max_retry_delay_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LoggingSettings {
    /// Filter directive used when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Persist logs into the logs database
    #[serde(default = "default_true")]
    pub database: bool,

    /// Least severe level written to the logs database
    #[serde(default = "default_database_level")]
    pub database_level: LogLevel,

    #[serde(default = "default_retention_days")]
    pub retention_days: u64,

    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    #[serde(default = "default_log_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_log_flush_interval_ms")]
    pub flush_interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LibrarySettings {
    #[serde(default)]
    pub scan_paths: Vec<PathBuf>,

    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,

    /// Queue a scan of every `scan_paths` entry when the daemon starts
    #[serde(default = "default_true")]
    pub scan_on_start: bool,
}

impl SoulSpotConfig {
    /// Load from `path` (or `soulspot.toml` if present) and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(path, None)
    }

    /// Like [`load`](Self::load) with an explicit environment map instead of
    /// the process environment
    pub fn load_with_env(
        path: Option<&Path>,
        env: Option<HashMap<String, String>>,
    ) -> Result<Self> {
        let mut settings = config::Config::builder();

        match path {
            Some(path) => {
                if !path.exists() {
                    return Err(DaemonError::Config(format!(
                        "Config file not found: {}",
                        path.display()
                    )));
                }
                settings = settings.add_source(config::File::from(path.to_path_buf()));
            }
            None => {
                let default_path = PathBuf::from(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    settings = settings.add_source(config::File::from(default_path));
                }
            }
        }

        settings = settings.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("library.scan_paths")
                .with_list_parse_key("library.extensions")
                .try_parsing(true)
                .source(env),
        );

        let config: Self = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Reject settings the daemon cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.database.url.trim().is_empty() {
            return Err(DaemonError::Config("database.url is empty".to_string()));
        }
        if self.database.logs_url.trim().is_empty() {
            return Err(DaemonError::Config("database.logs_url is empty".to_string()));
        }
        if self.database.url == self.database.logs_url {
            return Err(DaemonError::Config(
                "database.logs_url must point at a separate database".to_string(),
            ));
        }
        if self.database.max_connections == 0 {
            return Err(DaemonError::Config(
                "database.max_connections must be at least 1".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(DaemonError::Config(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(DaemonError::Config(format!(
                "retry.jitter must be within 0.0 and 1.0, got {}",
                self.retry.jitter
            )));
        }
        if self.retry.multiplier < 1.0 {
            return Err(DaemonError::Config(format!(
                "retry.multiplier must be at least 1.0, got {}",
                self.retry.multiplier
            )));
        }
        if self.write_buffer.max_pending == 0 {
            return Err(DaemonError::Config(
                "write_buffer.max_pending must be at least 1".to_string(),
            ));
        }
        if self.workers.count == 0 {
            return Err(DaemonError::Config(
                "workers.count must be at least 1".to_string(),
            ));
        }
        if self.workers.max_job_attempts == 0 {
            return Err(DaemonError::Config(
                "workers.max_job_attempts must be at least 1".to_string(),
            ));
        }
        if self.workers.queue_capacity == 0 {
            return Err(DaemonError::Config(
                "workers.queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.logging.retention_days == 0 {
            return Err(DaemonError::Config(
                "logging.retention_days must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

impl DatabaseSettings {
    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            max_connections: self.max_connections,
            busy_timeout: Duration::from_millis(self.busy_timeout_ms),
            acquire_timeout: Duration::from_millis(self.acquire_timeout_ms),
        }
    }
}

impl RetrySettings {
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            multiplier: self.multiplier,
            jitter: self.jitter,
        }
    }
}

impl WriteBufferSettings {
    pub fn buffer_config(&self) -> WriteBufferConfig {
        WriteBufferConfig {
            max_pending: self.max_pending,
            flush_interval: Duration::from_millis(self.flush_interval_ms),
        }
    }
}

impl WorkerSettings {
    pub fn pool_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig {
            workers: self.count,
            queue_capacity: self.queue_capacity,
            retry_backoff: RetryConfig {
                max_attempts: u32::MAX,
                base_delay: Duration::from_secs(self.retry_delay_secs),
                max_delay: Duration::from_secs(self.max_retry_delay_secs),
                multiplier: 2.0,
                jitter: 0.0,
            },
            job_timeout: self.job_timeout_secs.map(Duration::from_secs),
            ..WorkerPoolConfig::default()
        }
    }
}

impl LoggingSettings {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_days.saturating_mul(24 * 3600))
    }

    pub fn writer_config(&self) -> LogWriterConfig {
        LogWriterConfig {
            batch_size: self.batch_size,
            flush_interval: Duration::from_millis(self.flush_interval_ms),
        }
    }
}

// Default values
fn default_database() -> DatabaseSettings {
    DatabaseSettings {
        url: default_database_url(),
        logs_url: default_logs_url(),
        max_connections: default_max_connections(),
        busy_timeout_ms: default_busy_timeout_ms(),
        acquire_timeout_ms: default_acquire_timeout_ms(),
    }
}

fn default_database_url() -> String {
    "sqlite://./data/soulspot.db".to_string()
}

fn default_logs_url() -> String {
    "sqlite://./data/soulspot-logs.db".to_string()
}

fn default_max_connections() -> u32 {
    5
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

fn default_acquire_timeout_ms() -> u64 {
    30_000
}

fn default_retry() -> RetrySettings {
    RetrySettings {
        max_attempts: default_retry_max_attempts(),
        base_delay_ms: default_retry_base_delay_ms(),
        max_delay_ms: default_retry_max_delay_ms(),
        multiplier: default_retry_multiplier(),
        jitter: default_retry_jitter(),
    }
}

fn default_retry_max_attempts() -> u32 {
    5
}

fn default_retry_base_delay_ms() -> u64 {
    100
}

fn default_retry_max_delay_ms() -> u64 {
    5000
}

fn default_retry_multiplier() -> f64 {
    2.0
}

fn default_retry_jitter() -> f64 {
    0.25
}

fn default_write_buffer() -> WriteBufferSettings {
    WriteBufferSettings {
        max_pending: default_max_pending(),
        flush_interval_ms: default_flush_interval_ms(),
    }
}

fn default_max_pending() -> usize {
    500
}

fn default_flush_interval_ms() -> u64 {
    2000
}

fn default_workers() -> WorkerSettings {
    WorkerSettings {
        count: default_worker_count(),
        queue_capacity: default_queue_capacity(),
        max_job_attempts: default_max_job_attempts(),
        job_timeout_secs: None,
        retry_delay_secs: default_retry_delay_secs(),
        max_retry_delay_secs: default_max_retry_delay_secs(),
    }
}

fn default_worker_count() -> usize {
    2
}

fn default_queue_capacity() -> usize {
    1000
}

fn default_max_job_attempts() -> u32 {
    3
}

fn default_retry_delay_secs() -> u64 {
    5
}

fn default_max_retry_delay_secs() -> u64 {
    300
}

fn default_logging() -> LoggingSettings {
    LoggingSettings {
        level: default_log_level(),
        database: default_true(),
        database_level: default_database_level(),
        retention_days: default_retention_days(),
        channel_capacity: default_channel_capacity(),
        batch_size: default_log_batch_size(),
        flush_interval_ms: default_log_flush_interval_ms(),
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_database_level() -> LogLevel {
    LogLevel::Info
}

fn default_retention_days() -> u64 {
    14
}

fn default_channel_capacity() -> usize {
    10_000
}

fn default_log_batch_size() -> usize {
    100
}

fn default_log_flush_interval_ms() -> u64 {
    1000
}

fn default_library() -> LibrarySettings {
    LibrarySettings {
        scan_paths: Vec::new(),
        extensions: default_extensions(),
        scan_on_start: default_true(),
    }
}

fn default_extensions() -> Vec<String> {
    DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect()
}

fn default_true() -> bool {
    true
}

impl Default for SoulSpotConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
            retry: default_retry(),
            write_buffer: default_write_buffer(),
            workers: default_workers(),
            logging: default_logging(),
            library: default_library(),
        }
    }
}
