use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::errors::Error;
use crate::errors::Result;

/// Invalidation scheduler worker pool parameters.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SchedulerConfig {
    /// Maximum invalidation handlers running at once (across distinct
    /// caches; one cache never runs concurrently with itself)
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    /// How long shutdown waits for background tasks to stop
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_in_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_concurrency: default_worker_concurrency(),
            shutdown_timeout_in_ms: default_shutdown_timeout(),
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.worker_concurrency == 0 {
            return Err(Error::Config(ConfigError::Message(
                "worker_concurrency must be greater than 0".into(),
            )));
        }
        if self.shutdown_timeout_in_ms == 0 {
            return Err(Error::Config(ConfigError::Message(
                "shutdown_timeout_in_ms must be at least 1ms".into(),
            )));
        }
        Ok(())
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_in_ms)
    }
}

fn default_worker_concurrency() -> usize {
    4
}

fn default_shutdown_timeout() -> u64 {
    5_000
}
