//! Basalt — a paged transactional storage core
//!
//! Basalt stores data in fixed-size blocks across files in one directory
//! and gives callers ACID transactions over byte ranges in those blocks:
//!
//! - a **disk manager** owns the on-disk layout,
//! - a **buffer pool** caches pages and enforces the write-ahead rule,
//! - a **write-ahead log** records before/after images of every change,
//! - a **lock table** provides strict two-phase locking per block,
//! - a **recovery manager** rolls back aborted transactions and repairs
//!   the store after a crash.
//!
//! ## Usage
//!
//! ```no_run
//! use basalt::{BlockId, Database, DiskPosition, StoreConfig};
//!
//! let db = Database::open(StoreConfig::new("./data"))?;
//!
//! let mut tx = db.transaction();
//! tx.allocate_new_blocks(&BlockId::new("accounts.tbl", 1))?;
//! tx.write_int(&DiskPosition::new(BlockId::new("accounts.tbl", 0), 0), 42)?;
//! tx.commit()?;
//! # Ok::<(), basalt::StoreError>(())
//! ```
//!
//! Opening a store runs crash recovery, so committed work from an earlier
//! run is visible and unfinished work is gone.

pub mod buffer;
pub mod concurrency;
pub mod config;
pub mod disk;
pub mod error;
pub mod log;
pub mod recovery;
pub mod transaction;

pub use config::StoreConfig;
pub use disk::{BlockId, DiskPosition, Page};
pub use error::{Result, StoreError};
pub use crate::log::{Lsn, TransactionId};
pub use transaction::Transaction;

use std::fs;
use std::sync::Arc;

use ::log::info;
use serde::{Deserialize, Serialize};

use crate::buffer::BufferManager;
use crate::concurrency::LockTable;
use crate::disk::DiskManager;
use crate::log::LogManager;
use crate::recovery::RecoveryManager;

/// Name of the store manifest inside the data directory.
const MANIFEST_FILE: &str = "basalt.json";

/// On-disk format version the crate writes and accepts.
const FORMAT_VERSION: u32 = 1;

/// Persisted store identity. Reopening a directory under a different block
/// size would silently reinterpret every page, so the manifest pins the
/// parameters the bytes were written with.
#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    format_version: u32,
    block_size: usize,
    log_file: String,
}

/// An open basalt store: the shared managers plus the transaction factory.
pub struct Database {
    disk: Arc<DiskManager>,
    log: Arc<LogManager>,
    buffers: Arc<BufferManager>,
    lock_table: Arc<LockTable>,
}

impl Database {
    /// Open the store at `config.data_dir`, creating it when missing, and
    /// run crash recovery.
    pub fn open(config: StoreConfig) -> Result<Database> {
        config.validate()?;
        fs::create_dir_all(&config.data_dir)?;
        check_manifest(&config)?;

        let disk = Arc::new(DiskManager::new(&config.data_dir, config.block_size));
        let log = Arc::new(LogManager::new(
            config.log_file.clone(),
            &config.data_dir,
            config.block_size,
        )?);
        let lock_table = Arc::new(LockTable::new(config.lock_wait));
        let buffers = Arc::new(BufferManager::new(
            config.buffer_pool_size,
            Arc::clone(&disk),
            Arc::clone(&log),
        ));

        let db = Database {
            disk,
            log,
            buffers,
            lock_table,
        };
        db.recover()?;
        info!("store opened at {}", config.data_dir.display());
        Ok(db)
    }

    /// Start a new transaction over this store.
    pub fn transaction(&self) -> Transaction {
        Transaction::new(
            Arc::clone(&self.disk),
            Arc::clone(&self.buffers),
            Arc::clone(&self.log),
            Arc::clone(&self.lock_table),
        )
    }

    /// Replay the log: redo committed transactions, erase unfinished ones.
    /// [`Database::open`] already does this; it is exposed for embedders
    /// that manage their own startup sequence.
    pub fn recover(&self) -> Result<()> {
        RecoveryManager::new(Arc::clone(&self.log)).recover(&self.buffers)
    }

    /// Flush every cached page and mark the log with a checkpoint record.
    pub fn checkpoint(&self) -> Result<()> {
        RecoveryManager::new(Arc::clone(&self.log)).checkpoint(&self.buffers)
    }

    pub fn block_size(&self) -> usize {
        self.disk.block_size()
    }
}

/// Verify the directory's manifest against `config`, or write one for a
/// fresh directory.
fn check_manifest(config: &StoreConfig) -> Result<()> {
    let path = config.data_dir.join(MANIFEST_FILE);
    if path.exists() {
        let manifest: Manifest = serde_json::from_str(&fs::read_to_string(&path)?)?;
        if manifest.format_version != FORMAT_VERSION {
            return Err(StoreError::Config(format!(
                "store format v{} is not supported by this build (expected v{})",
                manifest.format_version, FORMAT_VERSION
            )));
        }
        if manifest.block_size != config.block_size {
            return Err(StoreError::Config(format!(
                "store was created with block size {}, but {} is configured",
                manifest.block_size, config.block_size
            )));
        }
        if manifest.log_file != config.log_file {
            return Err(StoreError::Config(format!(
                "store logs to '{}', but '{}' is configured",
                manifest.log_file, config.log_file
            )));
        }
        return Ok(());
    }

    let manifest = Manifest {
        format_version: FORMAT_VERSION,
        block_size: config.block_size,
        log_file: config.log_file.clone(),
    };
    fs::write(&path, serde_json::to_string_pretty(&manifest)?)?;
    Ok(())
}
