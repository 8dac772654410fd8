//! Disk layer for basalt
//!
//! ## Storage Format
//!
//! Every file under the store directory is a sequence of fixed-size blocks.
//! A block is addressed by a [`BlockId`] (filename + zero-based index) and
//! lives at byte offset `index * block_size`. The [`DiskManager`] is a thin
//! I/O adapter: it never caches, and callers must pre-allocate blocks with
//! [`DiskManager::allocate_new_blocks`] before writing them.
//!
//! [`Page`] is the in-memory image of one block, with typed little-endian
//! accessors used by the log and by the layers above the core.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crate::error::{Result, StoreError};

/// Block index of the end-of-file marker. The marker names a lock-only
/// resource used to serialize file-size changes; it never reaches disk.
pub const END_OF_FILE_INDEX: i32 = -1;

/// Identifies one block: a filename within the store directory and the
/// zero-based index of the block in that file.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlockId {
    filename: String,
    index: i32,
}

impl BlockId {
    pub fn new(filename: impl Into<String>, index: i32) -> Self {
        Self {
            filename: filename.into(),
            index,
        }
    }

    /// The end-of-file marker for `filename`.
    pub fn end_of_file(filename: impl Into<String>) -> Self {
        Self::new(filename, END_OF_FILE_INDEX)
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn index(&self) -> i32 {
        self.index
    }

    /// The block directly after this one in the same file.
    pub fn next(&self) -> BlockId {
        BlockId::new(self.filename.clone(), self.index + 1)
    }

    pub fn is_end_of_file(&self) -> bool {
        self.index == END_OF_FILE_INDEX
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.filename, self.index)
    }
}

/// A byte position inside a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskPosition {
    pub block_id: BlockId,
    pub offset: usize,
}

impl DiskPosition {
    pub fn new(block_id: BlockId, offset: usize) -> Self {
        Self { block_id, offset }
    }
}

impl fmt::Display for DiskPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.block_id, self.offset)
    }
}

/// The in-memory image of one block.
///
/// All multi-byte values are little-endian. Strings are fixed-length byte
/// runs with no terminator; the caller tracks their lengths.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    content: Vec<u8>,
}

impl Page {
    /// A zeroed page of `block_size` bytes.
    pub fn new(block_size: usize) -> Self {
        Self {
            content: vec![0; block_size],
        }
    }

    /// A page owning `content` as-is.
    pub fn from_bytes(content: Vec<u8>) -> Self {
        Self { content }
    }

    pub fn block_size(&self) -> usize {
        self.content.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.content
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.content
    }

    fn check_bounds(&self, offset: usize, length: usize) -> Result<()> {
        if offset + length > self.content.len() {
            return Err(StoreError::out_of_bounds(offset, length, self.content.len()));
        }
        Ok(())
    }

    pub fn read_byte(&self, offset: usize) -> Result<u8> {
        self.check_bounds(offset, 1)?;
        Ok(self.content[offset])
    }

    pub fn write_byte(&mut self, offset: usize, value: u8) -> Result<()> {
        self.check_bounds(offset, 1)?;
        self.content[offset] = value;
        Ok(())
    }

    pub fn read_int(&self, offset: usize) -> Result<i32> {
        self.check_bounds(offset, 4)?;
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.content[offset..offset + 4]);
        Ok(i32::from_le_bytes(raw))
    }

    pub fn write_int(&mut self, offset: usize, value: i32) -> Result<()> {
        self.check_bounds(offset, 4)?;
        self.content[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    pub fn read_bytes(&self, offset: usize, length: usize) -> Result<Vec<u8>> {
        self.check_bounds(offset, length)?;
        Ok(self.content[offset..offset + length].to_vec())
    }

    pub fn write_bytes(&mut self, offset: usize, value: &[u8]) -> Result<()> {
        self.check_bounds(offset, value.len())?;
        self.content[offset..offset + value.len()].copy_from_slice(value);
        Ok(())
    }

    pub fn read_string(&self, offset: usize, length: usize) -> Result<String> {
        let bytes = self.read_bytes(offset, length)?;
        String::from_utf8(bytes).map_err(|_| {
            StoreError::Bounds(format!(
                "{} bytes at offset {} are not a valid string",
                length, offset
            ))
        })
    }

    pub fn write_string(&mut self, offset: usize, value: &str) -> Result<()> {
        self.write_bytes(offset, value.as_bytes())
    }

    /// Write `src[src_offset..]` starting at `offset`. If the page fills
    /// before the source is exhausted, writes what fits and returns
    /// `Err(consumed)` with the number of source bytes copied; the caller
    /// resumes the copy at `src_offset + consumed` in the next page.
    pub fn write_bytes_from(
        &mut self,
        offset: usize,
        src: &[u8],
        src_offset: usize,
    ) -> std::result::Result<(), usize> {
        let offset = offset.min(self.content.len());
        let pending = src.len() - src_offset;
        let room = self.content.len() - offset;
        if pending > room {
            self.content[offset..offset + room]
                .copy_from_slice(&src[src_offset..src_offset + room]);
            return Err(room);
        }
        self.content[offset..offset + pending].copy_from_slice(&src[src_offset..]);
        Ok(())
    }
}

/// Manages reads and writes of blocks within one directory.
///
/// Every method serializes against the others through an internal
/// readers-writer lock, so concurrent callers observe a consistent file
/// table. The disk manager holds no caches; the buffer pool above it does.
pub struct DiskManager {
    directory: PathBuf,
    block_size: usize,
    io_lock: RwLock<()>,
}

impl DiskManager {
    pub fn new(directory: impl Into<PathBuf>, block_size: usize) -> Self {
        Self {
            directory: directory.into(),
            block_size,
            io_lock: RwLock::new(()),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    fn file_path(&self, filename: &str) -> PathBuf {
        self.directory.join(filename)
    }

    fn byte_offset(&self, block_id: &BlockId) -> Result<u64> {
        if block_id.index() < 0 {
            return Err(StoreError::Bounds(format!(
                "block {} cannot be read or written",
                block_id
            )));
        }
        Ok(block_id.index() as u64 * self.block_size as u64)
    }

    /// Read the block of `block_id` into `page`. Fails when the file is
    /// absent or too short to contain the block.
    pub fn read(&self, block_id: &BlockId, page: &mut Page) -> Result<()> {
        let _guard = self.io_lock.read().expect("disk io lock poisoned");
        let offset = self.byte_offset(block_id)?;
        let mut file = File::open(self.file_path(block_id.filename()))?;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut page.as_mut_slice()[..])?;
        Ok(())
    }

    /// Write `page` to the place of `block_id`. The block must already be
    /// allocated; writing never extends a file.
    pub fn write(&self, block_id: &BlockId, page: &Page) -> Result<()> {
        let _guard = self.io_lock.write().expect("disk io lock poisoned");
        let offset = self.byte_offset(block_id)?;
        let path = self.file_path(block_id.filename());
        let mut file = OpenOptions::new().write(true).open(&path)?;
        let allocated = file.metadata()?.len();
        if offset + self.block_size as u64 > allocated {
            return Err(StoreError::Bounds(format!(
                "block {} is not allocated (file holds {} bytes)",
                block_id, allocated
            )));
        }
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(page.as_slice())?;
        Ok(())
    }

    /// Force the writes of `filename` down to the device.
    pub fn flush(&self, filename: &str) -> Result<()> {
        let _guard = self.io_lock.read().expect("disk io lock poisoned");
        let file = File::open(self.file_path(filename))?;
        file.sync_all()?;
        Ok(())
    }

    /// The number of whole blocks in `filename`.
    pub fn size(&self, filename: &str) -> Result<usize> {
        let _guard = self.io_lock.read().expect("disk io lock poisoned");
        let metadata = fs::metadata(self.file_path(filename))?;
        Ok(metadata.len() as usize / self.block_size)
    }

    /// Resize `block_id.filename()` so that `block_id.index()` blocks
    /// exist, creating the directory and the file when missing. Shrinking
    /// is permitted but unused.
    pub fn allocate_new_blocks(&self, block_id: &BlockId) -> Result<()> {
        let _guard = self.io_lock.write().expect("disk io lock poisoned");
        if block_id.index() < 0 {
            return Err(StoreError::Bounds(format!(
                "cannot allocate {} blocks",
                block_id.index()
            )));
        }
        if !self.directory.exists() {
            fs::create_dir_all(&self.directory)?;
        }
        let path = self.file_path(block_id.filename());
        let file = OpenOptions::new().write(true).create(true).open(&path)?;
        file.set_len(block_id.index() as u64 * self.block_size as u64)?;
        Ok(())
    }
}
