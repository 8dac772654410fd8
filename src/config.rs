//! Configuration for a basalt store

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, StoreError};

/// Configuration for a basalt store.
///
/// The default configuration uses 4 KiB pages and a small buffer pool,
/// which is a reasonable balance for most embedders.
///
/// # Presets
///
/// - [`StoreConfig::default()`] - 4 KiB pages, 64 buffers, 10 s lock wait
/// - [`StoreConfig::compact()`] - tiny pages and pool, short lock wait
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Directory holding every data file and the log file
    pub data_dir: PathBuf,
    /// Size of every block in every file (bytes). Must be larger than 4;
    /// the log reserves the first 4 bytes of each of its blocks.
    pub block_size: usize,
    /// Number of slots in the buffer pool
    pub buffer_pool_size: usize,
    /// Name of the write-ahead log file inside `data_dir`
    pub log_file: String,
    /// How long a lock acquisition waits before it is treated as a deadlock
    pub lock_wait: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            block_size: 4096,
            buffer_pool_size: 64,
            log_file: "wal.log".to_string(),
            lock_wait: Duration::from_secs(10),
        }
    }
}

impl StoreConfig {
    /// Create a config with the default settings in `data_dir`.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Create a config with tiny blocks and a tiny pool. Useful for tests
    /// that want to exercise block boundaries and eviction quickly.
    pub fn compact(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            block_size: 32,
            buffer_pool_size: 4,
            lock_wait: Duration::from_millis(500),
            ..Default::default()
        }
    }

    /// Check the configuration for values the store cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.block_size <= 4 {
            return Err(StoreError::Config(format!(
                "block size must be larger than 4, got {}",
                self.block_size
            )));
        }
        if self.buffer_pool_size == 0 {
            return Err(StoreError::Config(
                "buffer pool must have at least one slot".to_string(),
            ));
        }
        if self.log_file.is_empty() {
            return Err(StoreError::Config("log file name is empty".to_string()));
        }
        Ok(())
    }
}
