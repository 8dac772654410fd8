//! Block-granularity locking
//!
//! ## Lock table
//!
//! One integer per block: `0` means unlocked, a positive count means that
//! many shared holders, `-1` means one exclusive holder. Waits are bounded
//! by the configured wait time; basalt has no deadlock detection, so a
//! timed-out acquisition is reported as a probable deadlock and the caller
//! rolls its transaction back.
//!
//! ## Per-transaction lock set
//!
//! [`ConcurrencyManager`] tracks which mode a transaction already holds on
//! each block, so a repeated read lock is free, a write after a read uses
//! the upgrade primitive (waiting until the transaction is the sole shared
//! holder), and commit/rollback can release everything at once. Locks are
//! held until the transaction ends; nothing releases early.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use log::warn;

use crate::disk::BlockId;
use crate::error::{Result, StoreError};

const EXCLUSIVE: i32 = -1;

fn is_shared(state: i32) -> bool {
    state > 0
}

fn is_exclusive(state: i32) -> bool {
    state < 0
}

/// Shared/exclusive locks per block, with timed acquisition.
pub struct LockTable {
    wait_time: Duration,
    table: Mutex<HashMap<BlockId, i32>>,
    available: Condvar,
}

impl LockTable {
    pub fn new(wait_time: Duration) -> Self {
        Self {
            wait_time,
            table: Mutex::new(HashMap::new()),
            available: Condvar::new(),
        }
    }

    /// Acquire a shared lock on `block_id`, waiting while another holder
    /// has it exclusively.
    pub fn read_lock(&self, block_id: &BlockId) -> Result<()> {
        let guard = self.table.lock().expect("lock table poisoned");
        let (mut table, timeout) = self
            .available
            .wait_timeout_while(guard, self.wait_time, |table| {
                is_exclusive(state_of(table, block_id))
            })
            .expect("lock table poisoned");
        if timeout.timed_out() {
            warn!("read lock on {} timed out", block_id);
            return Err(StoreError::lock_timeout(block_id));
        }
        *table.entry(block_id.clone()).or_insert(0) += 1;
        Ok(())
    }

    /// Acquire the exclusive lock on `block_id`, waiting while any holder
    /// remains.
    pub fn write_lock(&self, block_id: &BlockId) -> Result<()> {
        let guard = self.table.lock().expect("lock table poisoned");
        let (mut table, timeout) = self
            .available
            .wait_timeout_while(guard, self.wait_time, |table| {
                state_of(table, block_id) != 0
            })
            .expect("lock table poisoned");
        if timeout.timed_out() {
            warn!("write lock on {} timed out", block_id);
            return Err(StoreError::lock_timeout(block_id));
        }
        table.insert(block_id.clone(), EXCLUSIVE);
        Ok(())
    }

    /// Upgrade the caller's shared lock on `block_id` to exclusive. Waits
    /// until the caller is the sole shared holder, so the caller never
    /// deadlocks against its own read lock.
    pub fn write_lock_when_owning_read_lock(&self, block_id: &BlockId) -> Result<()> {
        let guard = self.table.lock().expect("lock table poisoned");
        let (mut table, timeout) = self
            .available
            .wait_timeout_while(guard, self.wait_time, |table| {
                state_of(table, block_id) != 1
            })
            .expect("lock table poisoned");
        if timeout.timed_out() {
            warn!("lock upgrade on {} timed out", block_id);
            return Err(StoreError::lock_timeout(block_id));
        }
        table.insert(block_id.clone(), EXCLUSIVE);
        Ok(())
    }

    /// Release one hold on `block_id`: decrement a shared count or clear
    /// the exclusive holder. Releasing an unlocked block does nothing.
    pub fn release(&self, block_id: &BlockId) {
        let mut table = self.table.lock().expect("lock table poisoned");
        if let Some(state) = table.get_mut(block_id) {
            if is_shared(*state) {
                *state -= 1;
            } else if is_exclusive(*state) {
                *state = 0;
            }
            if *state == 0 {
                table.remove(block_id);
            }
        }
        self.available.notify_all();
    }

    #[cfg(test)]
    fn state(&self, block_id: &BlockId) -> i32 {
        state_of(&self.table.lock().unwrap(), block_id)
    }
}

fn state_of(table: &HashMap<BlockId, i32>, block_id: &BlockId) -> i32 {
    table.get(block_id).copied().unwrap_or(0)
}

/// Which mode a transaction holds on a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockMode {
    Shared,
    Exclusive,
}

/// The lock set of one transaction.
pub struct ConcurrencyManager {
    lock_table: Arc<LockTable>,
    held: HashMap<BlockId, LockMode>,
}

impl ConcurrencyManager {
    pub fn new(lock_table: Arc<LockTable>) -> Self {
        Self {
            lock_table,
            held: HashMap::new(),
        }
    }

    /// Take a shared lock on `block_id`. Free when any lock is already
    /// held on it.
    pub fn read_lock(&mut self, block_id: &BlockId) -> Result<()> {
        if self.held.contains_key(block_id) {
            return Ok(());
        }
        self.lock_table.read_lock(block_id)?;
        self.held.insert(block_id.clone(), LockMode::Shared);
        Ok(())
    }

    /// Take the exclusive lock on `block_id`, upgrading an already-held
    /// shared lock in place.
    pub fn write_lock(&mut self, block_id: &BlockId) -> Result<()> {
        match self.held.get(block_id) {
            Some(LockMode::Exclusive) => Ok(()),
            Some(LockMode::Shared) => {
                self.lock_table.write_lock_when_owning_read_lock(block_id)?;
                self.held.insert(block_id.clone(), LockMode::Exclusive);
                Ok(())
            }
            None => {
                self.lock_table.write_lock(block_id)?;
                self.held.insert(block_id.clone(), LockMode::Exclusive);
                Ok(())
            }
        }
    }

    /// Release every lock this transaction accumulated.
    pub fn release_all(&mut self) {
        for block_id in self.held.keys() {
            self.lock_table.release(block_id);
        }
        self.held.clear();
    }
}
