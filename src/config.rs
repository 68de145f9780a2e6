//! Tunables: the low-water mark for diff storage, buffer pool size,
//! CoW chunk size, and worker thread count.

use serde::Deserialize;

use crate::types::PAGE_SIZE;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Low-water mark, in sectors, below which Diff Storage raises
    /// `Event::LowFreeSpace`.
    pub diff_storage_minimum_sectors: u64,

    /// Diff Area CoW granularity, in bytes. Must be a power of two and
    /// a multiple of `PAGE_SIZE`.
    pub diff_area_chunk_size: u64,

    /// Upper bound on sectors leased at once by the Diff Buffer Pool
    /// before `acquire(nowait)` starts failing with `Retryable`.
    pub buffer_pool_max_sectors: u64,

    /// Size of the worker pool that runs deferred CoW copies and async
    /// I/O completions off the filter's hot path.
    pub worker_threads: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            diff_storage_minimum_sectors: 2048, // 1 MiB
            diff_area_chunk_size: PAGE_SIZE * 4, // 16 KiB
            buffer_pool_max_sectors: 1 << 16,   // 32 MiB
            worker_threads: 4,
        }
    }
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }
}
