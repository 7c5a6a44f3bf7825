use serde::{Deserialize, Serialize};

use crate::error::OrmResult;

/// Runtime options of a [`Store`](crate::Store).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Memoize evaluated query results until a write invalidates them.
    pub query_cache: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { query_cache: true }
    }
}

impl StoreConfig {
    /// Parse store options from TOML text.
    pub fn from_toml_str(s: &str) -> OrmResult<Self> {
        Ok(toml::from_str(s)?)
    }
}
