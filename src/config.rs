//! TOML configuration for the cronix service.
//!
//! Every section has compiled-in defaults, so an empty file (or no file at
//! all) yields a working configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "CRONIX_CONFIG";

/// Config file looked up in the working directory.
pub const LOCAL_CONFIG: &str = "cronix.toml";

/// Hard bounds for a job's per-request timeout.
pub const MIN_TIMEOUT_SECS: u64 = 1;
pub const MAX_TIMEOUT_SECS: u64 = 300;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub logs: LogsConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Resolve configuration from, in order:
    /// 1. An explicit path (the `--config` flag); failures here are fatal.
    /// 2. The path in `CRONIX_CONFIG`.
    /// 3. `./cronix.toml`.
    /// 4. Compiled-in defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = PathBuf::from(&env_path);
            match Self::load(&path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "CRONIX_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let local = Path::new(LOCAL_CONFIG);
        if local.exists() {
            return Self::load(local);
        }

        debug!("no config file found, using compiled-in defaults");
        Ok(Self::default())
    }

    /// Reject values the service cannot run with.
    pub fn validate(&self) -> Result<()> {
        let ex = &self.executor;
        if ex.max_concurrent == 0 {
            bail!("executor.max_concurrent must be at least 1");
        }
        if !(MIN_TIMEOUT_SECS..=MAX_TIMEOUT_SECS).contains(&ex.default_timeout_secs) {
            bail!(
                "executor.default_timeout_secs must be within {MIN_TIMEOUT_SECS}-{MAX_TIMEOUT_SECS}"
            );
        }
        if !(MIN_TIMEOUT_SECS..=MAX_TIMEOUT_SECS).contains(&ex.max_timeout_secs)
            || ex.max_timeout_secs < ex.default_timeout_secs
        {
            bail!("executor.max_timeout_secs must be within {MIN_TIMEOUT_SECS}-{MAX_TIMEOUT_SECS} and not below the default");
        }
        if ex.backoff_base_ms == 0 || ex.backoff_base_ms > ex.backoff_max_ms {
            bail!("executor.backoff_base_ms must be positive and not exceed backoff_max_ms");
        }
        if ex.probe_timeout_secs == 0 {
            bail!("executor.probe_timeout_secs must be positive");
        }
        if self.scheduler.command_buffer == 0 {
            bail!("scheduler.command_buffer must be at least 1");
        }
        if self.logs.cleanup_interval_secs == 0 {
            bail!("logs.cleanup_interval_secs must be positive");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address and port for the HTTP API.
    pub bind: String,
    /// Browser origins allowed to call the API with credentials.
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
            cors_origins: vec![
                "http://localhost:5173".to_string(),
                "http://localhost:3000".to_string(),
            ],
        }
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file. Parent directories are created on startup.
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/cronix.db"),
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Capacity of the command channel feeding the scheduling loop.
    pub command_buffer: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            command_buffer: 256,
        }
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Timeout applied when a job does not set its own.
    pub default_timeout_secs: u64,
    /// Largest timeout a job may request.
    pub max_timeout_secs: u64,
    /// Largest retry count a job may request.
    pub max_retries: u32,
    /// First retry delay; doubles per attempt.
    pub backoff_base_ms: u64,
    /// Upper bound on any single retry delay.
    pub backoff_max_ms: u64,
    /// Maximum number of job runs in flight at once.
    pub max_concurrent: usize,
    /// Bytes of response body kept in a job log.
    pub response_snapshot_bytes: usize,
    /// Timeout for `POST /api/jobs/test` probes.
    pub probe_timeout_secs: u64,
    /// Bytes of response body returned by probes.
    pub probe_body_bytes: usize,
}

impl ExecutorConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: 30,
            max_timeout_secs: MAX_TIMEOUT_SECS,
            max_retries: 10,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
            max_concurrent: 64,
            response_snapshot_bytes: 64 * 1024,
            probe_timeout_secs: 30,
            probe_body_bytes: 1 << 20,
        }
    }
}

// ---------------------------------------------------------------------------
// Log retention
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogsConfig {
    /// Finalized logs older than this are evicted. `0` disables age eviction.
    pub retention_days: u32,
    /// Most recent logs kept per job. `0` disables the cap.
    pub max_per_job: usize,
    /// Period of the background cleanup cycle.
    pub cleanup_interval_secs: u64,
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            retention_days: 30,
            max_per_job: 5,
            cleanup_interval_secs: 3600,
        }
    }
}

// ---------------------------------------------------------------------------
// Shutdown
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Time in-flight runs get to finish once shutdown starts.
    pub grace_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self { grace_secs: 30 }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}
