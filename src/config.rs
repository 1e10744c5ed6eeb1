//! Configuration types.

use std::thread;

use crate::error::ConfigError;

/// Pool size used when the host parallelism cannot be queried.
const FALLBACK_POOL_SIZE: usize = 4;

/// Worker pool configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Number of worker contexts, created once at construction.
    pub size: usize,
    /// Maximum number of tasks waiting for a worker (`None` = unbounded).
    pub max_queued: Option<usize>,
    /// Replace a worker whose context crashed with a fresh one.
    pub replace_crashed_workers: bool,
    /// Prefix for worker thread names (`{prefix}-{index}`).
    pub thread_name_prefix: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let size = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(FALLBACK_POOL_SIZE);

        Self {
            size,
            max_queued: None,
            replace_crashed_workers: true,
            thread_name_prefix: "pool-worker".to_string(),
        }
    }
}

impl PoolConfig {
    /// Configuration with a fixed number of workers and defaults otherwise.
    pub fn with_size(size: usize) -> Self {
        Self {
            size,
            ..Default::default()
        }
    }

    /// Load overrides from the environment on top of the defaults.
    ///
    /// Reads `WORKER_POOL_SIZE`, `WORKER_POOL_MAX_QUEUED` and
    /// `WORKER_POOL_REPLACE_CRASHED`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(raw) = lookup("WORKER_POOL_SIZE") {
            config.size = parse_usize("WORKER_POOL_SIZE", &raw)?;
        }

        if let Some(raw) = lookup("WORKER_POOL_MAX_QUEUED") {
            config.max_queued = match raw.trim() {
                "" | "unbounded" => None,
                value => Some(parse_usize("WORKER_POOL_MAX_QUEUED", value)?),
            };
        }

        if let Some(raw) = lookup("WORKER_POOL_REPLACE_CRASHED") {
            config.replace_crashed_workers = match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                other => {
                    return Err(ConfigError::InvalidValue {
                        key: "WORKER_POOL_REPLACE_CRASHED".to_string(),
                        message: format!("expected a boolean, got {other:?}"),
                    });
                }
            };
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the pool cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "size".to_string(),
                message: "pool needs at least one worker".to_string(),
            });
        }
        if self.max_queued == Some(0) {
            return Err(ConfigError::InvalidValue {
                key: "max_queued".to_string(),
                message: "queue limit must be at least 1 (omit it for unbounded)".to_string(),
            });
        }
        Ok(())
    }
}

fn parse_usize(key: &str, raw: &str) -> Result<usize, ConfigError> {
    raw.trim().parse().map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("{raw:?}: {e}"),
    })
}
