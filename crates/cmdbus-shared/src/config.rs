//! # Configuration Surface
//!
//! Layered TOML configuration (`config` crate) with environment overrides,
//! using `serde(default)`-annotated structs throughout. Every field in
//! spec.md §6's "Config surface" table is represented here, plus the
//! `database` and `tracing` sections every deployable binary needs.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root configuration for a command bus deployment.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CmdBusConfig {
    pub database: DatabaseConfig,
    pub bus: BusConfig,
    pub worker: WorkerConfig,
    pub batch: BatchConfig,
    pub tracing: TracingConfig,
}

impl Default for CmdBusConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            bus: BusConfig::default(),
            worker: WorkerConfig::default(),
            batch: BatchConfig::default(),
            tracing: TracingConfig::default(),
        }
    }
}

impl CmdBusConfig {
    /// Load configuration from `config/cmdbus/base.toml`, overridden by
    /// `config/cmdbus/environments/{env}.toml` (env defaults to
    /// `CMDBUS_ENV`, falling back to `development`), and finally by
    /// `CMDBUS_`-prefixed environment variables.
    pub fn load() -> Result<Self, config::ConfigError> {
        let env = std::env::var("CMDBUS_ENV").unwrap_or_else(|_| "development".to_string());
        let builder = config::Config::builder()
            .add_source(config::File::with_name("config/cmdbus/base").required(false))
            .add_source(
                config::File::with_name(&format!("config/cmdbus/environments/{env}"))
                    .required(false),
            )
            .add_source(config::Environment::with_prefix("CMDBUS").separator("__"));
        builder.build()?.try_deserialize()
    }
}

/// Database connection and pool sizing.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    /// Must satisfy `min_pool >= worker.concurrency + router headroom`
    /// (spec.md §5's shared-resource policy).
    pub min_pool_size: u32,
    pub max_pool_size: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost/cmdbus".to_string(),
            min_pool_size: 4,
            max_pool_size: 10,
        }
    }
}

/// Command bus (C6) send/batch behavior.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BusConfig {
    pub default_max_attempts: u32,
    pub backoff_schedule_seconds: Vec<u64>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            default_max_attempts: 3,
            backoff_schedule_seconds: vec![10, 60, 300],
        }
    }
}

impl BusConfig {
    /// Backoff delay for the given 1-indexed attempt number, clamped to the
    /// last scheduled value for attempts beyond the schedule (spec.md §4.7.4).
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        if self.backoff_schedule_seconds.is_empty() {
            return Duration::from_secs(60);
        }
        let index = (attempt.saturating_sub(1) as usize).min(self.backoff_schedule_seconds.len() - 1);
        Duration::from_secs(self.backoff_schedule_seconds[index])
    }
}

/// Worker (C7) scheduling knobs.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub visibility_timeout_seconds: u64,
    pub poll_interval_ms: u64,
    pub concurrency: usize,
    pub use_notify: bool,
    pub statement_timeout_ms: u64,
    pub runtime_mode: RuntimeMode,
    pub shutdown_timeout_seconds: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let visibility_timeout_seconds = 30;
        Self {
            visibility_timeout_seconds,
            poll_interval_ms: 1000,
            concurrency: 4,
            use_notify: true,
            statement_timeout_ms: visibility_timeout_seconds * 1000 - 5000,
            runtime_mode: RuntimeMode::Async,
            shutdown_timeout_seconds: 30,
        }
    }
}

impl WorkerConfig {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_seconds)
    }
}

/// Scheduler shape (spec.md §4.7.1 / §5): deployment-selected, never mixed
/// in one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeMode {
    /// Cooperative single-thread scheduler with a bounded semaphore.
    Async,
    /// Fixed-size thread pool, one connection checked out per in-flight message.
    Sync,
}

impl Default for RuntimeMode {
    fn default() -> Self {
        RuntimeMode::Async
    }
}

/// Batch (C3) chunking behavior.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BatchConfig {
    pub default_chunk_size: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            default_chunk_size: 1000,
        }
    }
}

/// Logging configuration for `tracing-subscriber` initialization.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TracingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Initialize the global tracing subscriber from `TracingConfig`. Safe to
/// call once per process; subsequent calls are no-ops if a subscriber is
/// already installed.
pub fn init_tracing(config: &TracingConfig) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let subscriber = fmt().with_env_filter(filter);
    let result = if config.json {
        subscriber.json().try_init()
    } else {
        subscriber.try_init()
    };
    if let Err(e) = result {
        tracing::debug!(error = %e, "tracing subscriber already initialized");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_bus_config_matches_spec() {
        let bus = BusConfig::default();
        assert_eq!(bus.default_max_attempts, 3);
        assert_eq!(bus.backoff_schedule_seconds, vec![10, 60, 300]);
    }

    #[test]
    fn backoff_clamps_to_last_value() {
        let bus = BusConfig::default();
        assert_eq!(bus.backoff_for_attempt(1), Duration::from_secs(10));
        assert_eq!(bus.backoff_for_attempt(2), Duration::from_secs(60));
        assert_eq!(bus.backoff_for_attempt(3), Duration::from_secs(300));
        assert_eq!(bus.backoff_for_attempt(10), Duration::from_secs(300));
    }

    #[test]
    fn default_worker_config_matches_spec() {
        let worker = WorkerConfig::default();
        assert_eq!(worker.visibility_timeout_seconds, 30);
        assert_eq!(worker.poll_interval_ms, 1000);
        assert_eq!(worker.concurrency, 4);
        assert!(worker.use_notify);
        assert_eq!(worker.statement_timeout_ms, 25_000);
        assert_eq!(worker.runtime_mode, RuntimeMode::Async);
    }

    #[test]
    fn default_batch_chunk_size_matches_spec() {
        assert_eq!(BatchConfig::default().default_chunk_size, 1000);
    }

    #[test]
    fn deserializes_partial_toml_with_defaults() {
        let toml_str = r#"
            [worker]
            concurrency = 8
        "#;
        let config: CmdBusConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.worker.concurrency, 8);
        assert_eq!(config.worker.visibility_timeout_seconds, 30);
        assert_eq!(config.bus.default_max_attempts, 3);
    }
}
