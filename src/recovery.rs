//! Commit, rollback, and crash recovery over the write-ahead log
//!
//! The recovery manager is a thin composition layer: the log manager owns
//! the bytes, the buffer pool owns the pages, and this module walks log
//! records to make transactions atomic and durable.
//!
//! - Commit appends an end(commit) record and forces the log, so a
//!   committed transaction's records are durable before commit returns.
//! - Rollback walks backward from the newest record, restoring the
//!   before-image of every operation of the aborting transaction, until
//!   its begin record.
//! - Recover runs after a crash: a backward pass undoes every operation of
//!   transactions that never ended, then a forward pass re-applies every
//!   operation of committed transactions, and the pages are flushed.

use std::collections::HashSet;
use std::sync::Arc;

use log::{debug, info};

use crate::buffer::BufferManager;
use crate::error::Result;
use crate::log::{EndKind, LogManager, LogRecord, Lsn, TransactionId};

/// Transaction end bookkeeping for the recovery passes.
#[derive(Default)]
struct EndSets {
    committed: HashSet<TransactionId>,
    rollbacked: HashSet<TransactionId>,
}

impl EndSets {
    fn record(&mut self, transaction_id: TransactionId, kind: EndKind) {
        match kind {
            EndKind::Commit => self.committed.insert(transaction_id),
            EndKind::Rollback => self.rollbacked.insert(transaction_id),
        };
    }

    fn ended(&self, transaction_id: TransactionId) -> bool {
        self.committed.contains(&transaction_id) || self.rollbacked.contains(&transaction_id)
    }
}

/// Composes the log manager into commit/rollback/recover operations.
pub struct RecoveryManager {
    log: Arc<LogManager>,
}

impl RecoveryManager {
    pub fn new(log: Arc<LogManager>) -> Self {
        Self { log }
    }

    /// Append `record` to the log. The record is not durable until a
    /// commit or an explicit flush forces it.
    pub fn append(&self, record: &LogRecord) -> Result<Lsn> {
        self.log.append(record)
    }

    /// Commit `transaction_id`: append its end(commit) record and force
    /// the log through it.
    pub fn commit(&self, transaction_id: TransactionId) -> Result<()> {
        let lsn = self.log.append(&LogRecord::End {
            transaction_id,
            kind: EndKind::Commit,
        })?;
        self.log.flush(lsn)?;
        debug!("transaction {} committed at lsn {}", transaction_id, lsn);
        Ok(())
    }

    /// Roll back `transaction_id`: restore the before-image of each of its
    /// operations, newest first, then append its end(rollback) record. The
    /// rollback record needs no flush; an unflushed rollback replays as an
    /// unfinished transaction and is undone again at recovery.
    pub fn rollback(
        &self,
        transaction_id: TransactionId,
        buffers: &BufferManager,
    ) -> Result<()> {
        if let Some(mut iter) = self.log.last_log()? {
            loop {
                let record = LogRecord::decode(&iter.log_body()?)?;
                if record.transaction_id() == Some(transaction_id) {
                    if matches!(record, LogRecord::Begin { .. }) {
                        break;
                    }
                    record.undo(buffers)?;
                }
                if !iter.has_previous() {
                    break;
                }
                iter.previous()?;
            }
        }

        self.log.append(&LogRecord::End {
            transaction_id,
            kind: EndKind::Rollback,
        })?;
        debug!("transaction {} rolled back", transaction_id);
        Ok(())
    }

    /// Recover after a restart. Transactions with a durable end(commit)
    /// keep their effects; everything else is erased.
    pub fn recover(&self, buffers: &BufferManager) -> Result<()> {
        let mut iter = match self.log.last_log()? {
            Some(iter) => iter,
            None => {
                info!("recovery: log is empty, nothing to do");
                return Ok(());
            }
        };
        info!("recovery: starting undo pass");

        let mut ends = EndSets::default();
        loop {
            let record = match iter.log_body() {
                Ok(body) => LogRecord::decode(&body)?,
                // The undurable tail marks the end of the recoverable log.
                Err(e) if e.is_incomplete_log() => break,
                Err(e) => return Err(e),
            };
            match &record {
                LogRecord::End {
                    transaction_id,
                    kind,
                } => ends.record(*transaction_id, *kind),
                LogRecord::Operation { transaction_id, .. } if !ends.ended(*transaction_id) => {
                    record.undo(buffers)?;
                }
                _ => {}
            }
            if !iter.has_previous() {
                break;
            }
            iter.previous()?;
        }

        info!(
            "recovery: starting redo pass ({} committed, {} rolled back)",
            ends.committed.len(),
            ends.rollbacked.len()
        );
        loop {
            let record = match iter.log_body() {
                Ok(body) => LogRecord::decode(&body)?,
                Err(e) if e.is_incomplete_log() => break,
                Err(e) => return Err(e),
            };
            if let LogRecord::Operation { transaction_id, .. } = &record {
                if ends.committed.contains(transaction_id) {
                    record.redo(buffers)?;
                }
            }
            if !iter.has_next() {
                break;
            }
            iter.next()?;
        }

        buffers.flush_all()?;
        info!("recovery: complete");
        Ok(())
    }

    /// Flush every page, then mark the log with a checkpoint record. The
    /// log is not truncated; the record only documents that everything
    /// before it is on disk.
    pub fn checkpoint(&self, buffers: &BufferManager) -> Result<()> {
        buffers.flush_all()?;
        let lsn = self.log.append(&LogRecord::Checkpoint)?;
        self.log.flush(lsn)?;
        info!("checkpoint written at lsn {}", lsn);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::{BlockId, DiskManager, DiskPosition, Page};
    use std::sync::Arc;
    use tempfile::tempdir;

    const BLOCK_SIZE: usize = 64;

    struct Fixture {
        disk: Arc<DiskManager>,
        log: Arc<LogManager>,
        buffers: BufferManager,
        recovery: RecoveryManager,
    }

    fn fixture(dir: &std::path::Path) -> Fixture {
        let disk = Arc::new(DiskManager::new(dir, BLOCK_SIZE));
        let log = Arc::new(LogManager::new("wal.log", dir, BLOCK_SIZE).unwrap());
        disk.allocate_new_blocks(&BlockId::new("data.tbl", 4)).unwrap();
        let buffers = BufferManager::new(8, Arc::clone(&disk), Arc::clone(&log));
        let recovery = RecoveryManager::new(Arc::clone(&log));
        Fixture {
            disk,
            log,
            buffers,
            recovery,
        }
    }

    fn position(index: i32, offset: usize) -> DiskPosition {
        DiskPosition::new(BlockId::new("data.tbl", index), offset)
    }

    /// Log one operation and apply its after-image through the pool, the
    /// way the transaction layer does.
    fn logged_write(fx: &Fixture, transaction_id: u32, pos: &DiskPosition, value: i32) {
        let mut page = Page::new(BLOCK_SIZE);
        fx.buffers.read(&pos.block_id, &mut page).unwrap();
        let before = page.read_bytes(pos.offset, 4).unwrap();
        let lsn = fx
            .recovery
            .append(&LogRecord::Operation {
                transaction_id,
                position: pos.clone(),
                before,
                after: value.to_le_bytes().to_vec(),
            })
            .unwrap();
        page.write_int(pos.offset, value).unwrap();
        fx.buffers.write(&pos.block_id, &page, lsn).unwrap();
    }

    fn begin(fx: &Fixture, transaction_id: u32) {
        fx.recovery
            .append(&LogRecord::Begin { transaction_id })
            .unwrap();
    }

    fn read_int(fx: &Fixture, pos: &DiskPosition) -> i32 {
        let mut page = Page::new(BLOCK_SIZE);
        fx.buffers.read(&pos.block_id, &mut page).unwrap();
        page.read_int(pos.offset).unwrap()
    }

    #[test]
    fn test_commit_makes_log_durable() {
        let dir = tempdir().unwrap();
        let fx = fixture(dir.path());
        let pos = position(0, 0);

        begin(&fx, 0);
        logged_write(&fx, 0, &pos, 42);
        fx.recovery.commit(0).unwrap();

        // A reopened log sees everything up to and including the commit.
        let reopened = LogManager::new("wal.log", dir.path(), BLOCK_SIZE).unwrap();
        let iter = reopened.last_log().unwrap().expect("commit durable");
        assert_eq!(
            LogRecord::decode(&iter.log_body().unwrap()).unwrap(),
            LogRecord::End {
                transaction_id: 0,
                kind: EndKind::Commit
            }
        );
    }

    #[test]
    fn test_rollback_restores_before_images() {
        let dir = tempdir().unwrap();
        let fx = fixture(dir.path());
        let pos = position(0, 8);

        begin(&fx, 1);
        logged_write(&fx, 1, &pos, 5);
        logged_write(&fx, 1, &pos, 6);
        assert_eq!(read_int(&fx, &pos), 6);

        fx.recovery.rollback(1, &fx.buffers).unwrap();
        assert_eq!(read_int(&fx, &pos), 0);

        let iter = fx.log.last_log().unwrap().unwrap();
        assert_eq!(
            LogRecord::decode(&iter.log_body().unwrap()).unwrap(),
            LogRecord::End {
                transaction_id: 1,
                kind: EndKind::Rollback
            }
        );
    }

    #[test]
    fn test_rollback_leaves_other_transactions_alone() {
        let dir = tempdir().unwrap();
        let fx = fixture(dir.path());
        let mine = position(0, 0);
        let theirs = position(0, 8);

        begin(&fx, 2);
        logged_write(&fx, 2, &mine, 7);
        begin(&fx, 3);
        logged_write(&fx, 3, &theirs, 9);

        fx.recovery.rollback(2, &fx.buffers).unwrap();
        assert_eq!(read_int(&fx, &mine), 0);
        assert_eq!(read_int(&fx, &theirs), 9);
    }

    #[test]
    fn test_recover_redoes_committed_and_undoes_active() {
        let dir = tempdir().unwrap();
        let pos = position(1, 4);
        {
            let fx = fixture(dir.path());
            begin(&fx, 0);
            logged_write(&fx, 0, &pos, 4);
            fx.recovery.commit(0).unwrap();

            begin(&fx, 1);
            logged_write(&fx, 1, &pos, 5);
            // Crash: transaction 1 never ends, pages never flushed.
        }

        let fx = fixture(dir.path());
        fx.recovery.recover(&fx.buffers).unwrap();

        // The committed value survives; the unfinished one is erased,
        // durably, on disk.
        let mut page = Page::new(BLOCK_SIZE);
        fx.disk.read(&pos.block_id, &mut page).unwrap();
        assert_eq!(page.read_int(pos.offset).unwrap(), 4);
    }

    #[test]
    fn test_recover_skips_rolled_back_transactions() {
        let dir = tempdir().unwrap();
        let pos = position(0, 0);
        {
            let fx = fixture(dir.path());
            begin(&fx, 0);
            logged_write(&fx, 0, &pos, 3);
            fx.recovery.rollback(0, &fx.buffers).unwrap();
            fx.log.flush_all().unwrap();
        }

        let fx = fixture(dir.path());
        fx.recovery.recover(&fx.buffers).unwrap();
        assert_eq!(read_int(&fx, &pos), 0);
    }

    #[test]
    fn test_recover_empty_log_is_a_no_op() {
        let dir = tempdir().unwrap();
        let fx = fixture(dir.path());
        fx.recovery.recover(&fx.buffers).unwrap();
    }

    #[test]
    fn test_recover_is_idempotent() {
        let dir = tempdir().unwrap();
        let pos = position(0, 12);
        {
            let fx = fixture(dir.path());
            begin(&fx, 0);
            logged_write(&fx, 0, &pos, 11);
            fx.recovery.commit(0).unwrap();
        }

        for _ in 0..2 {
            let fx = fixture(dir.path());
            fx.recovery.recover(&fx.buffers).unwrap();
            assert_eq!(read_int(&fx, &pos), 11);
        }
    }

    #[test]
    fn test_undo_and_redo_are_idempotent() {
        let dir = tempdir().unwrap();
        let fx = fixture(dir.path());
        let pos = position(0, 4);

        begin(&fx, 0);
        logged_write(&fx, 0, &pos, 33);
        let iter = fx.log.last_log().unwrap().unwrap();
        let record = LogRecord::decode(&iter.log_body().unwrap()).unwrap();
        drop(iter);

        record.undo(&fx.buffers).unwrap();
        record.undo(&fx.buffers).unwrap();
        assert_eq!(read_int(&fx, &pos), 0);

        record.redo(&fx.buffers).unwrap();
        record.redo(&fx.buffers).unwrap();
        assert_eq!(read_int(&fx, &pos), 33);
    }

    #[test]
    fn test_checkpoint_record_is_transparent() {
        let dir = tempdir().unwrap();
        let pos = position(0, 0);
        {
            let fx = fixture(dir.path());
            begin(&fx, 0);
            logged_write(&fx, 0, &pos, 21);
            fx.recovery.commit(0).unwrap();
            fx.recovery.checkpoint(&fx.buffers).unwrap();

            begin(&fx, 1);
            logged_write(&fx, 1, &pos, 22);
            // Crash with the checkpoint mid-log.
        }

        let fx = fixture(dir.path());
        fx.recovery.recover(&fx.buffers).unwrap();
        assert_eq!(read_int(&fx, &pos), 21);
    }
}
