//! Construction-time configuration for stores, cache and backing storage.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Configuration for a tree store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Maximum number of keys in a leaf, or pivots in a router, before a
    /// split is required.
    pub degree: usize,
    /// Maximum number of buffered operations per router before a flush.
    /// Ignored by the B+ store.
    pub buffer_size: usize,
    /// Node cache configuration.
    pub cache: CacheConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            degree: 64,
            buffer_size: 64,
            cache: CacheConfig::default(),
        }
    }
}

/// Configuration for the node cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of cached entries.
    pub capacity: usize,
    /// Spawn background workers for LRU promotion and eviction. Without
    /// workers both happen synchronously on every cache access.
    pub concurrent: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            capacity: 1024,
            concurrent: false,
        }
    }
}

/// Choice of backing byte storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BackingConfig {
    /// No backing medium; the cache never evicts.
    None,
    /// A raw file of sequential node records.
    File {
        path: PathBuf,
        /// Record offsets and lengths are rounded up to this many bytes.
        block_size: u32,
        /// Upper bound on the file size in bytes.
        file_size: u32,
    },
}
