use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::errors::Error;
use crate::errors::Result;

/// Parameters of the change transport receive loop.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TransportConfig {
    /// Upper bound of one blocking receive call. The loop wakes at least
    /// this often to observe cancellation.
    #[serde(default = "default_receive_timeout")]
    pub receive_timeout_in_ms: u64,

    /// First retry delay after a transport failure
    #[serde(default = "default_backoff_base")]
    pub backoff_base_in_ms: u64,

    /// Retry delay cap; backoff doubles per consecutive failure up to this
    #[serde(default = "default_backoff_max")]
    pub backoff_max_in_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            receive_timeout_in_ms: default_receive_timeout(),
            backoff_base_in_ms: default_backoff_base(),
            backoff_max_in_ms: default_backoff_max(),
        }
    }
}

impl TransportConfig {
    pub fn validate(&self) -> Result<()> {
        if self.receive_timeout_in_ms == 0 {
            return Err(Error::Config(ConfigError::Message(
                "receive_timeout_in_ms must be at least 1ms".into(),
            )));
        }
        if self.backoff_base_in_ms == 0 {
            return Err(Error::Config(ConfigError::Message(
                "backoff_base_in_ms must be at least 1ms".into(),
            )));
        }
        if self.backoff_max_in_ms < self.backoff_base_in_ms {
            return Err(Error::Config(ConfigError::Message(
                "backoff_max_in_ms must not be below backoff_base_in_ms".into(),
            )));
        }
        Ok(())
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_in_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_in_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_in_ms)
    }
}

fn default_receive_timeout() -> u64 {
    1_000
}

fn default_backoff_base() -> u64 {
    100
}

fn default_backoff_max() -> u64 {
    30_000
}
