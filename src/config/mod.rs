/// Configuration management for the flowrun engine
///
/// Handles server configuration, database connection, engine limits, scheduler
/// timing, backoff policy and feature flags. Every value can be overridden with
/// a `FLOWRUN_*` environment variable for container deployment.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Graph execution engine limits
    pub engine: EngineConfig,
    /// Cron reconciliation settings
    pub scheduler: SchedulerConfig,
    /// Per-job backoff policy for scheduled triggers
    pub backoff: BackoffConfig,
    /// Names of globally enabled feature flags
    pub feature_flags: Vec<String>,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Server port number
    pub port: u16,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite file holding workflows, executions, steps, jobs and backoff state
    pub path: String,
}

/// Engine limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum executions running at the same time (worker pool size)
    pub max_concurrent_executions: usize,
    /// How long a paused node waits for resume/cancel before failing
    pub pause_timeout_secs: u64,
}

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Interval between reconciliation passes over active workflows
    pub reconcile_interval_secs: u64,
    /// Finished queue jobs older than this are purged by the daily sweep
    pub job_retention_days: i64,
}

/// Backoff policy for recurring jobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub max_failures: u32,
    pub reset_on_success: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 60_000,
            max_delay_ms: 24 * 60 * 60 * 1000,
            multiplier: 2.0,
            max_failures: 10,
            reset_on_success: true,
        }
    }
}

impl EngineConfig {
    pub fn pause_timeout(&self) -> Duration {
        Duration::from_secs(self.pause_timeout_secs)
    }
}

impl SchedulerConfig {
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Default for Config {
    /// Default configuration with ENV_VAR support for k8s/container deployment
    fn default() -> Self {
        let backoff_defaults = BackoffConfig::default();

        Self {
            server: ServerConfig {
                host: std::env::var("FLOWRUN_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env_or("FLOWRUN_PORT", 3004),
            },
            database: DatabaseConfig {
                path: std::env::var("FLOWRUN_DATABASE_PATH")
                    .unwrap_or_else(|_| "data/flowrun.db".to_string()),
            },
            engine: EngineConfig {
                max_concurrent_executions: env_or("FLOWRUN_MAX_CONCURRENT_EXECUTIONS", 10),
                pause_timeout_secs: env_or("FLOWRUN_PAUSE_TIMEOUT_SECS", 3600),
            },
            scheduler: SchedulerConfig {
                reconcile_interval_secs: env_or("FLOWRUN_RECONCILE_INTERVAL_SECS", 60),
                job_retention_days: env_or("FLOWRUN_JOB_RETENTION_DAYS", 30),
            },
            backoff: BackoffConfig {
                initial_delay_ms: env_or("FLOWRUN_BACKOFF_INITIAL_DELAY_MS", backoff_defaults.initial_delay_ms),
                max_delay_ms: env_or("FLOWRUN_BACKOFF_MAX_DELAY_MS", backoff_defaults.max_delay_ms),
                multiplier: env_or("FLOWRUN_BACKOFF_MULTIPLIER", backoff_defaults.multiplier),
                max_failures: env_or("FLOWRUN_BACKOFF_MAX_FAILURES", backoff_defaults.max_failures),
                reset_on_success: env_or("FLOWRUN_BACKOFF_RESET_ON_SUCCESS", backoff_defaults.reset_on_success),
            },
            // Comma separated, e.g. "scheduler_backoff"
            feature_flags: std::env::var("FLOWRUN_FEATURE_FLAGS")
                .unwrap_or_else(|_| "scheduler_backoff".to_string())
                .split(',')
                .map(|flag| flag.trim().to_string())
                .filter(|flag| !flag.is_empty())
                .collect(),
        }
    }
}
