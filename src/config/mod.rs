//! Engine configuration
//!
//! Loaded from an optional TOML file overlaid with `LIVEQUERY`-prefixed
//! environment variables; every field carries a serde default so embedders
//! can also construct the config programmatically with `Default`.

mod query;
mod scheduler;
mod transport;

pub use query::*;
pub use scheduler::*;
pub use transport::*;


use config::Config;
use config::Environment;
use config::File;
use serde::Deserialize;
use serde::Serialize;

use crate::errors::Error;
use crate::errors::Result;

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct EngineConfig {
    /// Change transport receive loop parameters
    #[serde(default)]
    pub transport: TransportConfig,

    /// Invalidation scheduler worker pool parameters
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Per-query cache defaults
    #[serde(default)]
    pub query: QueryConfig,
}

impl EngineConfig {
    /// Load configuration with priority: defaults, then `config_path` (if
    /// given), then environment variables (highest).
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = config_path {
            builder = builder.add_source(File::with_name(path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix("LIVEQUERY")
                .separator("__")
                .ignore_empty(true)
                .try_parsing(true),
        );

        let settings: EngineConfig = builder
            .build()?
            .try_deserialize()
            .map_err(Error::Config)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        self.transport.validate()?;
        self.scheduler.validate()?;
        Ok(())
    }
}
