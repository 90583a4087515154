use serde::Deserialize;
use serde::Serialize;

use crate::cache::CachePolicy;

/// Per-query defaults applied when an open call does not choose explicitly.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct QueryConfig {
    /// Diff mechanism used for newly opened queries
    #[serde(default)]
    pub default_cache_policy: CachePolicy,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_cache_policy: CachePolicy::default(),
        }
    }
}
