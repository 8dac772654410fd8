//! Bidirectional traversal over framed log records
//!
//! The iterator walks the logical record stream; all positions and
//! distances are in stream bytes, with the physical block cursors hidden by
//! [`LogPosition`] arithmetic. Forward movement adds the current frame
//! length; backward movement reads the 4-byte trailer just before the
//! current frame to learn the preceding record's length.

use crate::error::{Result, StoreError};
use crate::log::manager::LogManager;
use crate::log::{LogPosition, FRAME_HEADER_LEN, FRAME_TRAILER_LEN};

/// An iterator positioned on one complete log record.
pub struct LogIterator<'a> {
    log: &'a LogManager,
    start: LogPosition,
    checksum: u32,
    body_len: usize,
}

impl<'a> LogIterator<'a> {
    /// Position an iterator on the record whose frame starts at `start`.
    pub(crate) fn positioned(log: &'a LogManager, start: LogPosition) -> Result<Self> {
        let header = log.read_bytes(start, FRAME_HEADER_LEN)?;
        let checksum = u32::from_le_bytes(header[0..4].try_into().expect("4 bytes"));
        let body_len = u32::from_le_bytes(header[4..8].try_into().expect("4 bytes")) as usize;
        Ok(Self {
            log,
            start,
            checksum,
            body_len,
        })
    }

    /// The body bytes of the current record, verified against the frame
    /// checksum. A record whose bytes run past the durable end of the log
    /// surfaces the incomplete-log error instead.
    pub fn log_body(&self) -> Result<Vec<u8>> {
        let block_size = self.log.block_size();
        let body = self
            .log
            .read_bytes(self.start.advance(FRAME_HEADER_LEN, block_size), self.body_len)?;
        // A zero checksum marks an unverified frame and is accepted as-is.
        if self.checksum != 0 && crc32fast::hash(&body) != self.checksum {
            return Err(StoreError::LogCorrupt(format!(
                "log record at block {} offset {} fails its checksum",
                self.start.block_index, self.start.offset
            )));
        }
        Ok(body)
    }

    fn frame_len(&self) -> usize {
        FRAME_HEADER_LEN + self.body_len + FRAME_TRAILER_LEN
    }

    /// True when a record follows this one.
    pub fn has_next(&self) -> bool {
        let block_size = self.log.block_size();
        self.start.linear(block_size) + (self.frame_len() as u64) < self.log.append_linear()
    }

    /// Move onto the following record.
    pub fn next(&mut self) -> Result<()> {
        let block_size = self.log.block_size();
        let next_start = self.start.advance(self.frame_len(), block_size);
        *self = Self::positioned(self.log, next_start)?;
        Ok(())
    }

    /// True when a record precedes this one.
    pub fn has_previous(&self) -> bool {
        self.start.linear(self.log.block_size()) > 0
    }

    /// Move onto the preceding record.
    pub fn previous(&mut self) -> Result<()> {
        let block_size = self.log.block_size();
        let trailer = self
            .log
            .read_bytes(self.start.retreat(FRAME_TRAILER_LEN, block_size), FRAME_TRAILER_LEN)?;
        let previous_len =
            u32::from_le_bytes(trailer[0..4].try_into().expect("4 bytes")) as usize;
        let previous_start = self.start.retreat(
            FRAME_HEADER_LEN + previous_len + FRAME_TRAILER_LEN,
            block_size,
        );
        *self = Self::positioned(self.log, previous_start)?;
        Ok(())
    }
}
