//! Log blocks: pages with a leading append cursor
//!
//! The first 4 bytes of every log block hold a little-endian cursor naming
//! the next free byte in the block, so the append point survives restarts.
//! A fresh block's cursor is 4; a filled block's cursor equals the block
//! size.

use crate::disk::{BlockId, DiskManager, Page};
use crate::error::{Result, StoreError};
use crate::log::BLOCK_CURSOR_LEN;

/// A page specialized for the log: the cursor in its first 4 bytes tracks
/// the in-block append point.
#[derive(Debug, Clone)]
pub struct LogBlock {
    page: Page,
    cursor: usize,
}

impl LogBlock {
    /// A fresh, empty log block of `block_size` bytes. `block_size` must be
    /// larger than the cursor header; the log manager checks this once at
    /// startup.
    pub fn new(block_size: usize) -> Self {
        let mut block = Self {
            page: Page::new(block_size),
            cursor: 0,
        };
        block.set_cursor(BLOCK_CURSOR_LEN);
        block
    }

    /// Load the block of `block_id` from disk and adopt the cursor stored
    /// in its header.
    pub fn read_from(disk: &DiskManager, block_id: &BlockId) -> Result<LogBlock> {
        let mut page = Page::new(disk.block_size());
        disk.read(block_id, &mut page)?;
        let cursor = page.read_int(0)? as usize;
        if cursor < BLOCK_CURSOR_LEN || cursor > disk.block_size() {
            return Err(StoreError::LogCorrupt(format!(
                "log block {} has cursor {} outside 4..={}",
                block_id,
                cursor,
                disk.block_size()
            )));
        }
        Ok(Self { page, cursor })
    }

    /// Rebuild a block from a raw page and an explicit cursor, overriding
    /// whatever the page's header says. Tail repair truncates a torn append
    /// this way.
    pub(crate) fn from_parts(page: Page, cursor: usize) -> LogBlock {
        let mut block = Self { page, cursor: 0 };
        block.set_cursor(cursor);
        block
    }

    /// The next free byte offset in this block.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// The raw page, cursor header included. Used to write the block back.
    pub fn page(&self) -> &Page {
        &self.page
    }

    /// Append `bytes[bytes_offset..]` at the cursor. When everything fits
    /// the cursor advances and `Ok(())` is returned. When the block fills
    /// mid-copy, the cursor is pinned to the block size and `Err(resume)`
    /// names the source offset at which the next block's append continues.
    pub fn append(
        &mut self,
        bytes: &[u8],
        bytes_offset: usize,
    ) -> std::result::Result<(), usize> {
        match self.page.write_bytes_from(self.cursor, bytes, bytes_offset) {
            Ok(()) => {
                self.set_cursor(self.cursor + bytes.len() - bytes_offset);
                Ok(())
            }
            Err(consumed) => {
                self.set_cursor(self.page.block_size());
                Err(bytes_offset + consumed)
            }
        }
    }

    fn set_cursor(&mut self, cursor: usize) {
        self.cursor = cursor;
        // The page always has room for its own header.
        self.page
            .write_int(0, cursor as i32)
            .expect("log block smaller than its cursor header");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_fresh_block_cursor() {
        let block = LogBlock::new(16);
        assert_eq!(block.cursor(), 4);
        assert_eq!(block.page().read_int(0).unwrap(), 4);
    }

    #[test]
    fn test_append_fits() {
        let mut block = LogBlock::new(16);
        block.append(&[1, 2, 3], 0).unwrap();
        assert_eq!(block.cursor(), 7);
        assert_eq!(block.page().read_bytes(4, 3).unwrap(), vec![1, 2, 3]);

        block.append(&[4, 5], 0).unwrap();
        assert_eq!(block.cursor(), 9);
        assert_eq!(block.page().read_bytes(7, 2).unwrap(), vec![4, 5]);
    }

    #[test]
    fn test_append_spills_into_next_block() {
        let mut block = LogBlock::new(16);
        let bytes: Vec<u8> = (0..20).collect();

        // 12 payload bytes fit; the append reports where to resume.
        let resume = block.append(&bytes, 0).unwrap_err();
        assert_eq!(resume, 12);
        assert_eq!(block.cursor(), 16);
        assert_eq!(block.page().read_bytes(4, 12).unwrap(), bytes[..12]);

        let mut next = LogBlock::new(16);
        next.append(&bytes, resume).unwrap();
        assert_eq!(next.cursor(), 12);
        assert_eq!(next.page().read_bytes(4, 8).unwrap(), bytes[12..]);
    }

    #[test]
    fn test_append_to_full_block_consumes_nothing() {
        let mut block = LogBlock::new(16);
        block.append(&[0u8; 12], 0).unwrap();
        assert_eq!(block.cursor(), 16);

        let resume = block.append(&[1, 2, 3], 0).unwrap_err();
        assert_eq!(resume, 0);
    }

    #[test]
    fn test_read_from_disk_restores_cursor() {
        let dir = tempdir().unwrap();
        let disk = DiskManager::new(dir.path(), 16);
        let block_id = BlockId::new("wal.log", 0);
        disk.allocate_new_blocks(&BlockId::new("wal.log", 1)).unwrap();

        let mut block = LogBlock::new(16);
        block.append(&[7, 8, 9], 0).unwrap();
        disk.write(&block_id, block.page()).unwrap();

        let restored = LogBlock::read_from(&disk, &block_id).unwrap();
        assert_eq!(restored.cursor(), 7);
        assert_eq!(restored.page().read_bytes(4, 3).unwrap(), vec![7, 8, 9]);
    }

    #[test]
    fn test_read_from_rejects_bad_cursor() {
        let dir = tempdir().unwrap();
        let disk = DiskManager::new(dir.path(), 16);
        let block_id = BlockId::new("wal.log", 0);
        disk.allocate_new_blocks(&BlockId::new("wal.log", 1)).unwrap();

        let mut page = Page::new(16);
        page.write_int(0, 99).unwrap();
        disk.write(&block_id, &page).unwrap();

        assert!(LogBlock::read_from(&disk, &block_id).is_err());
    }
}
