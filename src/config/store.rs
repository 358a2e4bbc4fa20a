//! Subscription store backend configuration.

use serde::Deserialize;

/// Which backend holds subscription state (in addition to the in-memory trie).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreType {
    /// Trie only, nothing survives a restart.
    #[default]
    Ram,
    /// Mirrored to the embedded fjall KV store under the data directory.
    Disk,
    /// Mirrored to an external Redis-compatible server.
    Redis,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisStoreConfig {
    /// `host:port` pairs; the first reachable address is used.
    pub addrs: Vec<String>,
    pub user: Option<String>,
    pub pwd: Option<String>,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            addrs: vec!["127.0.0.1:6379".to_string()],
            user: None,
            pwd: None,
        }
    }
}

/// Configuration for the pluggable subscription store backend.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    #[serde(rename = "type")]
    pub store_type: StoreType,
    pub redis: RedisStoreConfig,
}
