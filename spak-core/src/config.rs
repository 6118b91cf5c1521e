use crate::error::{Result, SpakError};
use serde::{Deserialize, Serialize};

/// Logical bytes per chunk when the archive does not say otherwise.
pub const DEFAULT_CHUNK_DATA_SIZE: u64 = 64 * 1024;
pub const MAX_CHUNK_DATA_SIZE: u64 = 16 * 1024 * 1024;
pub const DEFAULT_POOL_SIZE: usize = 8;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Decrypted bytes carried by every chunk except possibly the last.
    pub chunk_data_size: u64,
    /// Number of chunk buffers owned by the worker.
    pub pool_size: usize,
    /// Chunks requested ahead of each read as a read-ahead hint; 0 disables it.
    pub precache_chunks: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            chunk_data_size: DEFAULT_CHUNK_DATA_SIZE,
            pool_size: DEFAULT_POOL_SIZE,
            precache_chunks: 0,
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<()> {
        if self.chunk_data_size == 0 || self.chunk_data_size > MAX_CHUNK_DATA_SIZE {
            return Err(SpakError::Config(format!(
                "chunk_data_size must be in 1..={MAX_CHUNK_DATA_SIZE}, got {}",
                self.chunk_data_size
            )));
        }
        if self.pool_size == 0 {
            return Err(SpakError::Config("pool_size must be at least 1".into()));
        }
        if self.precache_chunks >= self.pool_size {
            return Err(SpakError::Config(format!(
                "precache_chunks ({}) must be smaller than pool_size ({})",
                self.precache_chunks, self.pool_size
            )));
        }
        Ok(())
    }

    /// Upper bound on chunk handles one reader holds while serving a read.
    /// Leaves room for the precache handles so a single reader never waits
    /// on a buffer only it could release.
    pub fn max_in_flight(&self) -> usize {
        self.pool_size.saturating_sub(self.precache_chunks).max(1)
    }
}
