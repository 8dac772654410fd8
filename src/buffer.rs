//! Buffer pool: an N-way cache of pages between transactions and disk
//!
//! The pool obeys the write-ahead rule: before any page reaches disk —
//! whether through an explicit flush or an eviction — the log is flushed
//! through that page's `latest_lsn`. Only then is the block written and the
//! containing file synced.
//!
//! Eviction is round-robin over the fixed pool. Clients never pin buffers;
//! a page borrowed through [`BufferManager::read`] is a copy, and the slot
//! may be reused at any time.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use log::debug;

use crate::disk::{BlockId, DiskManager, Page};
use crate::error::Result;
use crate::log::{LogManager, Lsn};

/// One pool slot: a cached page and the log watermark it depends on.
pub struct PageBuffer {
    block_id: BlockId,
    page: Page,
    latest_lsn: Lsn,
    dirty: bool,
}

impl PageBuffer {
    fn new(block_id: BlockId, page: Page) -> Self {
        Self {
            block_id,
            page,
            latest_lsn: 0,
            dirty: false,
        }
    }

    pub fn block_id(&self) -> &BlockId {
        &self.block_id
    }

    pub fn latest_lsn(&self) -> Lsn {
        self.latest_lsn
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

/// A fixed-size pool of page buffers backed by one disk manager.
pub struct BufferManager {
    disk: Arc<DiskManager>,
    log: Arc<LogManager>,
    pool: RwLock<Vec<Option<PageBuffer>>>,
    next_victim: AtomicUsize,
}

impl BufferManager {
    pub fn new(pool_size: usize, disk: Arc<DiskManager>, log: Arc<LogManager>) -> Self {
        let mut pool = Vec::with_capacity(pool_size);
        pool.resize_with(pool_size, || None);
        Self {
            disk,
            log,
            pool: RwLock::new(pool),
            next_victim: AtomicUsize::new(0),
        }
    }

    pub fn block_size(&self) -> usize {
        self.disk.block_size()
    }

    /// Read the block of `block_id` into `page`, installing it in the pool
    /// on a miss (possibly evicting another buffer).
    pub fn read(&self, block_id: &BlockId, page: &mut Page) -> Result<()> {
        {
            let pool = self.pool.read().expect("buffer pool poisoned");
            if let Some(buffer) = find(&pool, block_id) {
                *page = buffer.page.clone();
                return Ok(());
            }
        }

        let mut pool = self.pool.write().expect("buffer pool poisoned");
        // Another thread may have installed the block while we upgraded.
        if let Some(buffer) = find(&pool, block_id) {
            *page = buffer.page.clone();
            return Ok(());
        }
        self.disk.read(block_id, page)?;
        self.install(&mut pool, PageBuffer::new(block_id.clone(), page.clone()))
    }

    /// Record `page` as the current image of `block_id`, raising the
    /// buffer's log watermark to `lsn`. The page stays in the pool until a
    /// flush or an eviction writes it out.
    pub fn write(&self, block_id: &BlockId, page: &Page, lsn: Lsn) -> Result<()> {
        let mut pool = self.pool.write().expect("buffer pool poisoned");
        if let Some(buffer) = find_mut(&mut pool, block_id) {
            buffer.page = page.clone();
            buffer.latest_lsn = buffer.latest_lsn.max(lsn);
            buffer.dirty = true;
            return Ok(());
        }

        let mut buffer = PageBuffer::new(block_id.clone(), page.clone());
        buffer.latest_lsn = lsn;
        buffer.dirty = true;
        self.install(&mut pool, buffer)
    }

    /// Write the cached page of `block_id` to disk and sync its file; when
    /// nothing is cached, just sync the file.
    pub fn flush(&self, block_id: &BlockId) -> Result<()> {
        let mut pool = self.pool.write().expect("buffer pool poisoned");
        if let Some(buffer) = find_mut(&mut pool, block_id) {
            write_back(&self.disk, &self.log, buffer)?;
            self.disk.flush(block_id.filename())?;
            return Ok(());
        }
        self.disk.flush(block_id.filename())
    }

    /// Write every dirty buffer to disk, then sync each touched file
    /// exactly once.
    pub fn flush_all(&self) -> Result<()> {
        let mut pool = self.pool.write().expect("buffer pool poisoned");
        let mut touched = BTreeSet::new();
        for slot in pool.iter_mut() {
            if let Some(buffer) = slot {
                if buffer.dirty {
                    write_back(&self.disk, &self.log, buffer)?;
                    touched.insert(buffer.block_id.filename().to_string());
                }
            }
        }
        for filename in touched {
            self.disk.flush(&filename)?;
        }
        Ok(())
    }

    /// Place `buffer` into a free slot, or evict the round-robin victim.
    /// A dirty victim is written out (under the write-ahead rule) first.
    fn install(&self, pool: &mut Vec<Option<PageBuffer>>, buffer: PageBuffer) -> Result<()> {
        if let Some(slot) = pool.iter_mut().find(|slot| slot.is_none()) {
            *slot = Some(buffer);
            return Ok(());
        }

        let victim = self.next_victim.fetch_add(1, Ordering::Relaxed) % pool.len();
        if let Some(evicted) = &mut pool[victim] {
            if evicted.dirty {
                write_back(&self.disk, &self.log, evicted)?;
                self.disk.flush(evicted.block_id.filename())?;
            }
            debug!("evicting buffer for {}", evicted.block_id);
        }
        pool[victim] = Some(buffer);
        Ok(())
    }
}

/// Write one buffer's page to disk, flushing the log through the buffer's
/// watermark first. The file sync is the caller's business.
fn write_back(disk: &DiskManager, log: &LogManager, buffer: &mut PageBuffer) -> Result<()> {
    log.flush(buffer.latest_lsn)?;
    disk.write(&buffer.block_id, &buffer.page)?;
    buffer.dirty = false;
    Ok(())
}

fn find<'a>(pool: &'a [Option<PageBuffer>], block_id: &BlockId) -> Option<&'a PageBuffer> {
    pool.iter()
        .flatten()
        .find(|buffer| &buffer.block_id == block_id)
}

fn find_mut<'a>(
    pool: &'a mut [Option<PageBuffer>],
    block_id: &BlockId,
) -> Option<&'a mut PageBuffer> {
    pool.iter_mut()
        .flatten()
        .find(|buffer| &buffer.block_id == block_id)
}
