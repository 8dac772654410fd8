//! The transaction façade
//!
//! Every primitive follows the same shape: acquire the block lock, read
//! the current page through the buffer pool, log the change, apply it
//! through the pool. Strict two-phase locking means locks accumulate until
//! [`Transaction::commit`] or [`Transaction::rollback`] releases them all.
//!
//! When any step fails — a lock timeout, an I/O error, an out-of-bounds
//! access — the transaction rolls itself back before returning, and the
//! caller receives the primary error (composed with the rollback's own
//! error if that failed too). A finished transaction refuses further work.
//!
//! File sizes are a shared resource like any block: `size` takes a shared
//! lock and `allocate_new_blocks` an exclusive lock on the file's
//! end-of-file marker, so size changes serialize against readers.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::buffer::BufferManager;
use crate::concurrency::{ConcurrencyManager, LockTable};
use crate::disk::{BlockId, DiskManager, DiskPosition, Page};
use crate::error::{Result, StoreError};
use crate::log::{LogManager, LogRecord, Lsn, TransactionId};
use crate::recovery::RecoveryManager;

static NEXT_TRANSACTION_ID: AtomicU32 = AtomicU32::new(0);

/// Mint a process-unique transaction id. Ids restart at zero each run;
/// they are only ever compared against ids from the same run's log.
pub fn next_transaction_id() -> TransactionId {
    NEXT_TRANSACTION_ID.fetch_add(1, Ordering::SeqCst)
}

/// One transaction over the shared store managers.
pub struct Transaction {
    id: TransactionId,
    disk: Arc<DiskManager>,
    buffers: Arc<BufferManager>,
    recovery: RecoveryManager,
    locks: ConcurrencyManager,
    began: bool,
    finished: bool,
}

impl Transaction {
    pub(crate) fn new(
        disk: Arc<DiskManager>,
        buffers: Arc<BufferManager>,
        log: Arc<LogManager>,
        lock_table: Arc<LockTable>,
    ) -> Self {
        Self {
            id: next_transaction_id(),
            disk,
            buffers,
            recovery: RecoveryManager::new(log),
            locks: ConcurrencyManager::new(lock_table),
            began: false,
            finished: false,
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Read `length` bytes at `position`.
    pub fn read(&mut self, position: &DiskPosition, length: usize) -> Result<Vec<u8>> {
        self.check_active()?;
        let locked = self.locks.read_lock(&position.block_id);
        self.guard(locked)?;
        let page = self.read_block(&position.block_id);
        let page = self.guard(page)?;
        let bytes = page.read_bytes(position.offset, length);
        self.guard(bytes)
    }

    /// Read the little-endian i32 at `position`.
    pub fn read_int(&mut self, position: &DiskPosition) -> Result<i32> {
        let bytes = self.read(position, 4)?;
        Ok(i32::from_le_bytes(bytes[..4].try_into().expect("4 bytes")))
    }

    /// Read the fixed-length string at `position`.
    pub fn read_string(&mut self, position: &DiskPosition, length: usize) -> Result<String> {
        self.check_active()?;
        let locked = self.locks.read_lock(&position.block_id);
        self.guard(locked)?;
        let page = self.read_block(&position.block_id);
        let page = self.guard(page)?;
        let text = page.read_string(position.offset, length);
        self.guard(text)
    }

    /// Write `data` at `position`. The bytes currently there become the
    /// logged before-image; the write is not durable until commit.
    pub fn write(&mut self, position: &DiskPosition, data: &[u8]) -> Result<()> {
        self.check_active()?;
        let locked = self.locks.write_lock(&position.block_id);
        self.guard(locked)?;

        let page = self.read_block(&position.block_id);
        let mut page = self.guard(page)?;
        let before = page.read_bytes(position.offset, data.len());
        let before = self.guard(before)?;

        let lsn = self.log_operation(position, before, data.to_vec());
        let lsn = self.guard(lsn)?;

        let written = page.write_bytes(position.offset, data);
        self.guard(written)?;
        let recorded = self.buffers.write(&position.block_id, &page, lsn);
        self.guard(recorded)
    }

    /// Write the little-endian i32 `value` at `position`.
    pub fn write_int(&mut self, position: &DiskPosition, value: i32) -> Result<()> {
        self.write(position, &value.to_le_bytes())
    }

    /// Write the string `value` at `position`.
    pub fn write_string(&mut self, position: &DiskPosition, value: &str) -> Result<()> {
        self.write(position, value.as_bytes())
    }

    /// The number of blocks in `filename`. Takes a shared lock on the
    /// file's end-of-file marker.
    pub fn size(&mut self, filename: &str) -> Result<usize> {
        self.check_active()?;
        let locked = self.locks.read_lock(&BlockId::end_of_file(filename));
        self.guard(locked)?;
        let size = self.disk.size(filename);
        self.guard(size)
    }

    /// Grow `block_id.filename()` to `block_id.index()` blocks. Takes the
    /// exclusive lock on the file's end-of-file marker.
    pub fn allocate_new_blocks(&mut self, block_id: &BlockId) -> Result<()> {
        self.check_active()?;
        let locked = self
            .locks
            .write_lock(&BlockId::end_of_file(block_id.filename()));
        self.guard(locked)?;
        let allocated = self.disk.allocate_new_blocks(block_id);
        self.guard(allocated)
    }

    /// Commit: force the log through this transaction's end record, then
    /// release every lock. A failed commit rolls the transaction back.
    pub fn commit(&mut self) -> Result<()> {
        self.check_active()?;
        match self.recovery.commit(self.id) {
            Ok(()) => {
                self.finished = true;
                self.locks.release_all();
                Ok(())
            }
            Err(e) => self.guard(Err(e)),
        }
    }

    /// Roll back every change this transaction made and release its locks.
    pub fn rollback(&mut self) -> Result<()> {
        self.check_active()?;
        self.rollback_inner()
    }

    fn check_active(&self) -> Result<()> {
        if self.finished {
            return Err(StoreError::Transaction(format!(
                "transaction {} has already finished",
                self.id
            )));
        }
        Ok(())
    }

    /// Funnel for every fallible step: pass successes through, roll the
    /// transaction back on failure and hand the caller the composed error.
    fn guard<T>(&mut self, result: Result<T>) -> Result<T> {
        match result {
            Ok(value) => Ok(value),
            Err(primary) => match self.rollback_inner() {
                Ok(()) => Err(primary),
                Err(rollback_error) => Err(primary.and_rollback(rollback_error)),
            },
        }
    }

    fn read_block(&mut self, block_id: &BlockId) -> Result<Page> {
        let mut page = Page::new(self.disk.block_size());
        self.buffers.read(block_id, &mut page)?;
        Ok(page)
    }

    /// Append the operation record, lazily preceded by this transaction's
    /// begin record so rollback's backward scan has a stopping point.
    fn log_operation(
        &mut self,
        position: &DiskPosition,
        before: Vec<u8>,
        after: Vec<u8>,
    ) -> Result<Lsn> {
        if !self.began {
            self.recovery.append(&LogRecord::Begin {
                transaction_id: self.id,
            })?;
            self.began = true;
        }
        self.recovery.append(&LogRecord::Operation {
            transaction_id: self.id,
            position: position.clone(),
            before,
            after,
        })
    }

    fn rollback_inner(&mut self) -> Result<()> {
        self.finished = true;
        let result = self.recovery.rollback(self.id, &self.buffers);
        // Locks go even when the rollback record could not be written;
        // recovery on the next start fixes the log.
        self.locks.release_all();
        result
    }
}
