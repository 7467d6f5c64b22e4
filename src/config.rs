//! Tunables for a [`crate::Cache`] instance.

use std::env;

/// Reference block size: 4096 bytes.
pub const DEFAULT_BLOCK_SIZE: usize = 4096;
/// Reference store capacity: 100 blocks.
pub const DEFAULT_CAPACITY: usize = 100;
/// Reference LRU-K parameter.
pub const DEFAULT_LRU_K: usize = 2;
/// Reference descriptor table size.
pub const DEFAULT_MAX_OPEN_FILES: usize = 1024;

/// Collects the four tunables that shape a cache instance: block size,
/// block-store capacity, the `K` of LRU-K, and the size of the descriptor
/// table.
///
/// `Default` yields the reference values from the design (B=4096, C=100,
/// K=2, N=1024).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    /// Size in bytes of every cached block.
    pub block_size: usize,
    /// Maximum number of resident blocks.
    pub capacity: usize,
    /// Number of most-recent accesses tracked per block.
    pub lru_k: usize,
    /// Number of slots in the descriptor table.
    pub max_open_files: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            block_size: DEFAULT_BLOCK_SIZE,
            capacity: DEFAULT_CAPACITY,
            lru_k: DEFAULT_LRU_K,
            max_open_files: DEFAULT_MAX_OPEN_FILES,
        }
    }
}

impl CacheConfig {
    /// Reads overrides from environment variables named
    /// `{prefix}_BLOCK_SIZE`, `{prefix}_CAPACITY`, `{prefix}_LRU_K` and
    /// `{prefix}_MAX_OPEN_FILES`.
    ///
    /// An absent or unparsable variable falls back to the corresponding
    /// default rather than failing; a parse failure is logged at `warn`
    /// level so misconfiguration is visible without aborting startup.
    pub fn from_env(prefix: &str) -> Self {
        let defaults = Self::default();
        CacheConfig {
            block_size: read_var(prefix, "BLOCK_SIZE", defaults.block_size),
            capacity: read_var(prefix, "CAPACITY", defaults.capacity),
            lru_k: read_var(prefix, "LRU_K", defaults.lru_k),
            max_open_files: read_var(prefix, "MAX_OPEN_FILES", defaults.max_open_files),
        }
    }
}

fn read_var(prefix: &str, suffix: &str, default: usize) -> usize {
    let name = format!("{}_{}", prefix, suffix);
    match env::var(&name) {
        Ok(value) => match value.parse() {
            Ok(parsed) => parsed,
            Err(_) => {
                log::warn!(
                    "{} has malformed value {:?}, falling back to default {}",
                    name,
                    value,
                    default
                );
                default
            }
        },
        Err(_) => default,
    }
}
