//! Engine configuration.
//!
//! [`EngineConfig`] comes from `JOBFORGE_*` environment variables and
//! [`PoolLayout`] (how many workers each queue and pool unit wants) from a
//! YAML file.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Settings shared by every process of a node.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Redis connection URL.
    pub redis_url: String,
    /// Node component of process identities.
    pub node_id: String,
    /// How long a blocking reservation waits.
    pub reserve_timeout: Duration,
    /// Attempts before a retried job fails for good.
    pub max_fails: u32,
    /// Age after which a running unique lock may be reclaimed.
    pub stale_lock_after: Duration,
    /// Consecutive empty reservations before a batch worker exits.
    pub terminate_after_waits: u32,
    /// Pause between scheduler drain passes.
    pub scheduler_tick: Duration,
    /// Optional cap on a single job execution.
    pub job_timeout: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            node_id: "local".to_string(),
            reserve_timeout: Duration::from_secs(5),
            max_fails: 3,
            stale_lock_after: Duration::from_secs(3600),
            terminate_after_waits: 2,
            scheduler_tick: Duration::from_millis(1000),
            job_timeout: None,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `JOBFORGE_REDIS_URL`: Redis URL (required)
    /// - `JOBFORGE_NODE_ID`: node name (default: local)
    /// - `JOBFORGE_RESERVE_TIMEOUT_SECS`: blocking reserve timeout (default: 5)
    /// - `JOBFORGE_MAX_FAILS`: attempts before permanent failure (default: 3)
    /// - `JOBFORGE_STALE_LOCK_SECS`: stale unique lock age (default: 3600)
    /// - `JOBFORGE_TERMINATE_AFTER_WAITS`: empty rounds before exit (default: 2)
    /// - `JOBFORGE_SCHEDULER_TICK_MS`: scheduler tick (default: 1000)
    /// - `JOBFORGE_JOB_TIMEOUT_SECS`: per-job timeout (default: none)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if required variables are missing or have invalid values.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        config.redis_url = std::env::var("JOBFORGE_REDIS_URL")
            .map_err(|_| ConfigError::MissingEnvVar("JOBFORGE_REDIS_URL".to_string()))?;

        if let Ok(val) = std::env::var("JOBFORGE_NODE_ID") {
            config.node_id = val;
        }

        if let Ok(val) = std::env::var("JOBFORGE_RESERVE_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "JOBFORGE_RESERVE_TIMEOUT_SECS")?;
            config.reserve_timeout = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("JOBFORGE_MAX_FAILS") {
            config.max_fails = parse_env_value(&val, "JOBFORGE_MAX_FAILS")?;
        }

        if let Ok(val) = std::env::var("JOBFORGE_STALE_LOCK_SECS") {
            let secs: u64 = parse_env_value(&val, "JOBFORGE_STALE_LOCK_SECS")?;
            config.stale_lock_after = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("JOBFORGE_TERMINATE_AFTER_WAITS") {
            config.terminate_after_waits = parse_env_value(&val, "JOBFORGE_TERMINATE_AFTER_WAITS")?;
        }

        if let Ok(val) = std::env::var("JOBFORGE_SCHEDULER_TICK_MS") {
            let millis: u64 = parse_env_value(&val, "JOBFORGE_SCHEDULER_TICK_MS")?;
            config.scheduler_tick = Duration::from_millis(millis);
        }

        if let Ok(val) = std::env::var("JOBFORGE_JOB_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "JOBFORGE_JOB_TIMEOUT_SECS")?;
            config.job_timeout = Some(Duration::from_secs(secs));
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.redis_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "redis_url cannot be empty".to_string(),
            ));
        }

        if self.node_id.is_empty()
            || self
                .node_id
                .chars()
                .any(|c| c == '~' || c.is_whitespace() || c.is_control())
        {
            return Err(ConfigError::ValidationFailed(format!(
                "node_id '{}' must be non-empty without '~' or whitespace",
                self.node_id
            )));
        }

        if self.reserve_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "reserve_timeout must be greater than 0".to_string(),
            ));
        }

        if self.max_fails == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_fails must be greater than 0".to_string(),
            ));
        }

        if self.terminate_after_waits == 0 {
            return Err(ConfigError::ValidationFailed(
                "terminate_after_waits must be greater than 0".to_string(),
            ));
        }

        if self.scheduler_tick.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "scheduler_tick must be greater than 0".to_string(),
            ));
        }

        if self.job_timeout.is_some_and(|t| t.is_zero()) {
            return Err(ConfigError::ValidationFailed(
                "job_timeout must be greater than 0 when set".to_string(),
            ));
        }

        Ok(())
    }

    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = node_id.into();
        self
    }

    pub fn with_reserve_timeout(mut self, timeout: Duration) -> Self {
        self.reserve_timeout = timeout;
        self
    }

    pub fn with_max_fails(mut self, max_fails: u32) -> Self {
        self.max_fails = max_fails;
        self
    }

    pub fn with_stale_lock_after(mut self, after: Duration) -> Self {
        self.stale_lock_after = after;
        self
    }

    pub fn with_terminate_after_waits(mut self, waits: u32) -> Self {
        self.terminate_after_waits = waits;
        self
    }

    pub fn with_scheduler_tick(mut self, tick: Duration) -> Self {
        self.scheduler_tick = tick;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.job_timeout = timeout;
        self
    }
}

/// Desired worker capacity of a FIFO queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueLayout {
    pub name: String,
    #[serde(default = "default_workers")]
    pub workers: u32,
}

/// Desired unit count and per-unit workers of a batch pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolUnitsLayout {
    pub name: String,
    pub units: u32,
    #[serde(default = "default_workers")]
    pub workers_per_unit: u32,
}

fn default_workers() -> u32 {
    1
}

/// Capacity layout of a node.
///
/// ```yaml
/// pools:
///   - name: reports
///     units: 4
///     workers_per_unit: 1
/// queues:
///   - name: default
///     workers: 2
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolLayout {
    #[serde(default)]
    pub pools: Vec<PoolUnitsLayout>,
    #[serde(default)]
    pub queues: Vec<QueueLayout>,
}

impl PoolLayout {
    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        let layout: Self = serde_yaml::from_str(raw)?;
        layout.validate()?;
        Ok(layout)
    }

    /// Reads and validates a layout file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for name in self
            .pools
            .iter()
            .map(|p| &p.name)
            .chain(self.queues.iter().map(|q| &q.name))
        {
            if name.is_empty() || name.contains('~') || name.contains(':') {
                return Err(ConfigError::ValidationFailed(format!(
                    "invalid pool or queue name '{name}'"
                )));
            }
            if !seen.insert(name.as_str()) {
                return Err(ConfigError::ValidationFailed(format!(
                    "'{name}' is declared more than once"
                )));
            }
        }

        if let Some(pool) = self.pools.iter().find(|p| p.units == 0) {
            return Err(ConfigError::ValidationFailed(format!(
                "pool '{}' must have at least one unit",
                pool.name
            )));
        }

        Ok(())
    }

    pub fn queue(&self, name: &str) -> Option<&QueueLayout> {
        self.queues.iter().find(|q| q.name == name)
    }

    pub fn pool(&self, name: &str) -> Option<&PoolUnitsLayout> {
        self.pools.iter().find(|p| p.name == name)
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}
