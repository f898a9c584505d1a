//! Engine configuration, loaded from TOML.
//!
//! Every key has a default, so an empty file (or no file) is a valid configuration:
//!
//! ```toml
//! poll_interval_ms = 2000
//!
//! [retry]
//! base_delay_ms = 10000
//! jitter = 0.25
//!
//! [store]
//! path = "/var/lib/assistant/tasks.db"
//!
//! [[pools]]
//! name = "chat"
//! concurrency = 2
//! task_types = ["reminders.send", "llm.followup"]
//!
//! [[pools]]
//! name = "index"
//! task_types = ["documents.embed"]
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::{DEFAULT_MAX_RETRIES, RetryPolicy, TaskType};
use crate::impls::{SqliteOptions, TransientRetry};
use crate::ports::TaskTypeFilter;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub poll_interval_ms: u64,
    pub default_max_retries: u32,
    pub max_error_len: usize,
    pub retry: RetryConfig,
    pub store: StoreConfig,
    pub reaper: ReaperConfig,
    pub pools: Vec<PoolConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
            default_max_retries: DEFAULT_MAX_RETRIES,
            max_error_len: 4_000,
            retry: RetryConfig::default(),
            store: StoreConfig::default(),
            reaper: ReaperConfig::default(),
            pools: vec![PoolConfig::default()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    /// Extra delay as a fraction of the nominal one, drawn uniformly from `[0, jitter]`.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 30_000,
            multiplier: 2.0,
            max_delay_ms: 3_600_000,
            jitter: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    pub path: PathBuf,
    pub busy_timeout_ms: u64,
    pub transient_max_attempts: u32,
    pub transient_base_delay_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("skein.db"),
            busy_timeout_ms: 5_000,
            transient_max_attempts: 5,
            transient_base_delay_ms: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReaperConfig {
    pub enabled: bool,
    /// A `running` row older than this is treated as abandoned.
    pub stale_after_secs: u64,
    pub interval_secs: u64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            stale_after_secs: 3_600,
            interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolConfig {
    pub name: String,
    pub concurrency: usize,
    /// Absent: any type. Tasks of a type no handler is registered for then fail.
    pub task_types: Option<Vec<String>>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            concurrency: 1,
            task_types: None,
        }
    }
}

impl PoolConfig {
    pub fn filter(&self) -> TaskTypeFilter {
        match &self.task_types {
            None => TaskTypeFilter::Any,
            Some(types) => TaskTypeFilter::Only(types.iter().map(TaskType::new).collect()),
        }
    }
}

impl EngineConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.poll_interval_ms == 0 {
            return invalid("poll_interval_ms must be > 0".into());
        }
        if self.retry.multiplier.is_nan() || self.retry.multiplier < 1.0 {
            return invalid(format!("retry.multiplier must be >= 1, got {}", self.retry.multiplier));
        }
        if !(0.0..=self.retry.multiplier - 1.0).contains(&self.retry.jitter) {
            return invalid(format!(
                "retry.jitter must be within [0, multiplier - 1] = [0, {}], got {}",
                self.retry.multiplier - 1.0,
                self.retry.jitter
            ));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return invalid("retry.max_delay_ms must be >= retry.base_delay_ms".into());
        }
        if self.store.transient_max_attempts == 0 {
            return invalid("store.transient_max_attempts must be >= 1".into());
        }
        if self.reaper.enabled && (self.reaper.interval_secs == 0 || self.reaper.stale_after_secs == 0) {
            return invalid("reaper.interval_secs and reaper.stale_after_secs must be > 0".into());
        }
        if self.pools.is_empty() {
            return invalid("at least one worker pool is required".into());
        }
        let mut names = HashSet::new();
        for pool in &self.pools {
            if pool.concurrency == 0 {
                return invalid(format!("pool '{}' has zero concurrency", pool.name));
            }
            if !names.insert(pool.name.as_str()) {
                return invalid(format!("duplicate pool name '{}'", pool.name));
            }
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(Duration::from_millis(self.retry.base_delay_ms))
            .with_multiplier(self.retry.multiplier)
            .with_max_delay(Duration::from_millis(self.retry.max_delay_ms))
            .with_jitter(self.retry.jitter)
    }

    pub fn sqlite_options(&self) -> SqliteOptions {
        let backoff = RetryPolicy::new(Duration::from_millis(self.store.transient_base_delay_ms))
            .with_max_delay(Duration::from_secs(2))
            .with_jitter(0.5);
        SqliteOptions {
            busy_timeout: Duration::from_millis(self.store.busy_timeout_ms),
            transient: TransientRetry::new(self.store.transient_max_attempts, backoff),
        }
    }

    pub fn reaper_stale_after(&self) -> Duration {
        Duration::from_secs(self.reaper.stale_after_secs)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper.interval_secs)
    }
}
