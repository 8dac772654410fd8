//! Log manager: the append-only writer for the write-ahead log
//!
//! One manager owns one log file and serializes every append and flush
//! through an internal lock. Appends land in an in-memory tail block that
//! only reaches disk when it fills or when a flush is forced, so the
//! manager tracks two watermarks: `next_lsn` (the next sequence number to
//! hand out) and `next_save_lsn` (the first sequence number that is not yet
//! durable). A flush request below the save watermark is a no-op.
//!
//! The tail is transactional: a failed append restores the block and block
//! id captured before the attempt, so a half-appended record can never be
//! observed by a later append in the same process. Torn tails left by a
//! crash are repaired at startup by a forward scan that truncates the log
//! at the first incomplete or checksum-failing frame.

use std::path::PathBuf;
use std::sync::Mutex;

use bytes::BufMut;
use log::{debug, warn};

use crate::disk::{BlockId, DiskManager, Page};
use crate::error::{Result, StoreError};
use crate::log::block::LogBlock;
use crate::log::iterator::LogIterator;
use crate::log::record::{LogRecord, Lsn};
use crate::log::{LogPosition, BLOCK_CURSOR_LEN, FRAME_HEADER_LEN, FRAME_TRAILER_LEN};

/// Frame a record body for the log: checksum and length in front, the
/// length repeated behind so the stream can be walked backward.
pub(crate) fn frame_record(body: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(FRAME_HEADER_LEN + body.len() + FRAME_TRAILER_LEN);
    framed.put_u32_le(crc32fast::hash(body));
    framed.put_u32_le(body.len() as u32);
    framed.put_slice(body);
    framed.put_u32_le(body.len() as u32);
    framed
}

struct LogTail {
    current_block_id: BlockId,
    current_block: LogBlock,
    next_lsn: Lsn,
    next_save_lsn: Lsn,
    last_record_start: Option<LogPosition>,
}

/// Append-only writer over one log file.
pub struct LogManager {
    log_file: String,
    disk: DiskManager,
    tail: Mutex<LogTail>,
}

impl LogManager {
    /// Open (or create) the log file in `directory`. An existing log is
    /// scanned forward to find the last complete record; a torn tail left
    /// by a crash is truncated at the first bad frame.
    pub fn new(
        log_file: impl Into<String>,
        directory: impl Into<PathBuf>,
        block_size: usize,
    ) -> Result<LogManager> {
        if block_size <= BLOCK_CURSOR_LEN {
            return Err(StoreError::Config(format!(
                "log block size must be larger than {}, got {}",
                BLOCK_CURSOR_LEN, block_size
            )));
        }
        let disk = DiskManager::new(directory, block_size);
        let log_file = log_file.into();

        let blocks = disk.size(&log_file).unwrap_or(0);
        if blocks == 0 {
            disk.allocate_new_blocks(&BlockId::new(log_file.clone(), 1))?;
            let fresh = LogBlock::new(block_size);
            disk.write(&BlockId::new(log_file.clone(), 0), fresh.page())?;
            let tail = LogTail {
                current_block_id: BlockId::new(log_file.clone(), 0),
                current_block: fresh,
                next_lsn: 0,
                next_save_lsn: 0,
                last_record_start: None,
            };
            return Ok(LogManager {
                log_file,
                disk,
                tail: Mutex::new(tail),
            });
        }

        let last_index = (blocks - 1) as i32;
        let last_id = BlockId::new(log_file.clone(), last_index);
        let mut current_block_id = last_id.clone();
        let mut current_block = load_tail_block(&disk, &last_id)?;

        let (last_record_start, repair_at) =
            scan_records(&disk, &log_file, last_index, &current_block)?;

        if let Some(repair) = repair_at {
            warn!(
                "log {} has a torn tail; truncating at block {} offset {}",
                log_file, repair.block_index, repair.offset
            );
            if repair.block_index == last_index {
                current_block = LogBlock::from_parts(current_block.page().clone(), repair.offset);
            } else {
                let repair_id = BlockId::new(log_file.clone(), repair.block_index);
                let mut page = Page::new(block_size);
                disk.read(&repair_id, &mut page)?;
                current_block = LogBlock::from_parts(page, repair.offset);
                current_block_id = repair_id;
            }
        }

        let tail = LogTail {
            current_block_id,
            current_block,
            next_lsn: 0,
            next_save_lsn: 0,
            last_record_start,
        };
        Ok(LogManager {
            log_file,
            disk,
            tail: Mutex::new(tail),
        })
    }

    pub fn block_size(&self) -> usize {
        self.disk.block_size()
    }

    /// Frame `record` and append it, returning the sequence number minted
    /// for it. When the tail block fills mid-append it is written out and a
    /// fresh block is allocated; on any failure the tail is restored to its
    /// pre-call state.
    pub fn append(&self, record: &LogRecord) -> Result<Lsn> {
        let framed = frame_record(&record.encode());
        let block_size = self.disk.block_size();

        let mut tail = self.tail.lock().expect("log tail poisoned");
        let rollback_id = tail.current_block_id.clone();
        let rollback_block = tail.current_block.clone();
        let start = LogPosition::from_linear(
            LogPosition::new(tail.current_block_id.index(), tail.current_block.cursor())
                .linear(block_size),
            block_size,
        );

        let mut src_offset = 0;
        loop {
            match tail.current_block.append(&framed, src_offset) {
                Ok(()) => break,
                Err(resume) => {
                    src_offset = resume;
                    if let Err(e) = self.move_to_next_block(&mut tail) {
                        tail.current_block_id = rollback_id;
                        tail.current_block = rollback_block;
                        return Err(e);
                    }
                }
            }
        }

        let lsn = tail.next_lsn;
        tail.next_lsn += 1;
        tail.last_record_start = Some(start);
        Ok(lsn)
    }

    /// Make every record with a sequence number up to and including `lsn`
    /// durable. No-op when they already are.
    pub fn flush(&self, lsn: Lsn) -> Result<()> {
        let mut tail = self.tail.lock().expect("log tail poisoned");
        if lsn < tail.next_save_lsn {
            return Ok(());
        }
        self.flush_tail(&mut tail)
    }

    /// Make every appended record durable.
    pub fn flush_all(&self) -> Result<()> {
        let mut tail = self.tail.lock().expect("log tail poisoned");
        self.flush_tail(&mut tail)
    }

    /// An iterator positioned on the last complete record, or `None` while
    /// the log holds no records.
    pub fn last_log(&self) -> Result<Option<LogIterator<'_>>> {
        let start = {
            let tail = self.tail.lock().expect("log tail poisoned");
            tail.last_record_start
        };
        match start {
            None => Ok(None),
            Some(pos) => Ok(Some(LogIterator::positioned(self, pos)?)),
        }
    }

    /// Read `length` stream bytes starting at `start`, spanning blocks as
    /// needed. Bytes still sitting in the in-memory tail are served from
    /// it; a range past the append point is the undurable-tail error.
    pub(crate) fn read_bytes(&self, start: LogPosition, length: usize) -> Result<Vec<u8>> {
        let tail = self.tail.lock().expect("log tail poisoned");
        read_stream(
            &self.disk,
            &self.log_file,
            tail.current_block_id.index(),
            &tail.current_block,
            start,
            length,
        )
    }

    /// The logical byte offset of the append point.
    pub(crate) fn append_linear(&self) -> u64 {
        let tail = self.tail.lock().expect("log tail poisoned");
        LogPosition::new(tail.current_block_id.index(), tail.current_block.cursor())
            .linear(self.disk.block_size())
    }

    fn flush_tail(&self, tail: &mut LogTail) -> Result<()> {
        self.disk.write(&tail.current_block_id, tail.current_block.page())?;
        self.disk.flush(&self.log_file)?;
        tail.next_save_lsn = tail.next_lsn;
        debug!("log {} flushed through lsn {}", self.log_file, tail.next_lsn);
        Ok(())
    }

    fn move_to_next_block(&self, tail: &mut LogTail) -> Result<()> {
        self.disk
            .write(&tail.current_block_id, tail.current_block.page())?;
        let next = tail.current_block_id.next();
        self.disk
            .allocate_new_blocks(&BlockId::new(self.log_file.clone(), next.index() + 1))?;
        tail.current_block = LogBlock::new(self.disk.block_size());
        tail.current_block_id = next;
        Ok(())
    }
}

/// Load the last physical block as the tail. A block whose stored cursor is
/// out of range was allocated but never written (crash between allocation
/// and the first write); it is adopted as empty.
fn load_tail_block(disk: &DiskManager, block_id: &BlockId) -> Result<LogBlock> {
    let mut page = Page::new(disk.block_size());
    disk.read(block_id, &mut page)?;
    let cursor = page.read_int(0)? as usize;
    if cursor < BLOCK_CURSOR_LEN || cursor > disk.block_size() {
        warn!("log block {} has no valid cursor; treating it as empty", block_id);
        return Ok(LogBlock::new(disk.block_size()));
    }
    Ok(LogBlock::from_parts(page, cursor))
}

/// Walk the durable stream forward validating frames. Returns the position
/// of the last complete record and, when the stream ends in a torn frame,
/// the position the append point must be reset to.
fn scan_records(
    disk: &DiskManager,
    log_file: &str,
    tail_index: i32,
    tail_block: &LogBlock,
) -> Result<(Option<LogPosition>, Option<LogPosition>)> {
    let block_size = disk.block_size();
    let end = LogPosition::new(tail_index, tail_block.cursor()).linear(block_size);
    let overhead = (FRAME_HEADER_LEN + FRAME_TRAILER_LEN) as u64;

    let read = |at: u64, len: usize| {
        read_stream(
            disk,
            log_file,
            tail_index,
            tail_block,
            LogPosition::from_linear(at, block_size),
            len,
        )
    };

    let mut pos: u64 = 0;
    let mut last = None;
    while pos < end {
        if pos + FRAME_HEADER_LEN as u64 > end {
            return Ok((last, Some(LogPosition::from_linear(pos, block_size))));
        }
        let header = read(pos, FRAME_HEADER_LEN)?;
        let stored_checksum = u32::from_le_bytes(header[0..4].try_into().expect("4 bytes"));
        let body_len = u32::from_le_bytes(header[4..8].try_into().expect("4 bytes")) as u64;
        let frame_end = pos + overhead + body_len;
        if body_len == 0 || frame_end > end {
            return Ok((last, Some(LogPosition::from_linear(pos, block_size))));
        }

        let body = read(pos + FRAME_HEADER_LEN as u64, body_len as usize)?;
        let trailer = read(pos + FRAME_HEADER_LEN as u64 + body_len, FRAME_TRAILER_LEN)?;
        let trailer_len = u32::from_le_bytes(trailer[0..4].try_into().expect("4 bytes"));
        let checksum_ok = stored_checksum == 0 || crc32fast::hash(&body) == stored_checksum;
        if trailer_len as u64 != body_len || !checksum_ok {
            if frame_end == end {
                // Torn write in the final frame.
                return Ok((last, Some(LogPosition::from_linear(pos, block_size))));
            }
            return Err(StoreError::LogCorrupt(format!(
                "log frame at stream byte {} is corrupt",
                pos
            )));
        }

        last = Some(LogPosition::from_linear(pos, block_size));
        pos = frame_end;
    }
    Ok((last, None))
}

/// Read `length` stream bytes starting at `start`. Blocks before the tail
/// come from disk; the tail block supplies its own bytes up to its cursor.
fn read_stream(
    disk: &DiskManager,
    log_file: &str,
    tail_index: i32,
    tail_block: &LogBlock,
    start: LogPosition,
    length: usize,
) -> Result<Vec<u8>> {
    let block_size = disk.block_size();
    let end = LogPosition::new(tail_index, tail_block.cursor()).linear(block_size);
    if start.linear(block_size) + length as u64 > end {
        return Err(StoreError::IncompleteLog(format!(
            "{} log bytes at block {} offset {} run past the durable end",
            length, start.block_index, start.offset
        )));
    }

    let mut out = Vec::with_capacity(length);
    let mut cursor = LogPosition::from_linear(start.linear(block_size), block_size);
    while out.len() < length {
        let take = (block_size - cursor.offset).min(length - out.len());
        if cursor.block_index == tail_index {
            out.extend_from_slice(
                &tail_block.page().as_slice()[cursor.offset..cursor.offset + take],
            );
        } else {
            let mut page = Page::new(block_size);
            disk.read(&BlockId::new(log_file.to_string(), cursor.block_index), &mut page)?;
            out.extend_from_slice(&page.as_slice()[cursor.offset..cursor.offset + take]);
        }
        cursor = LogPosition::new(cursor.block_index + 1, BLOCK_CURSOR_LEN);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::record::{EndKind, LogRecord};
    use tempfile::tempdir;

    fn begin(id: u32) -> LogRecord {
        LogRecord::Begin { transaction_id: id }
    }

    fn collect_backward(log: &LogManager) -> Vec<LogRecord> {
        let mut records = Vec::new();
        let mut iter = match log.last_log().unwrap() {
            Some(iter) => iter,
            None => return records,
        };
        loop {
            records.push(LogRecord::decode(&iter.log_body().unwrap()).unwrap());
            if !iter.has_previous() {
                break;
            }
            iter.previous().unwrap();
        }
        records
    }

    #[test]
    fn test_rejects_tiny_block_size() {
        let dir = tempdir().unwrap();
        assert!(LogManager::new("wal.log", dir.path(), 4).is_err());
        assert!(LogManager::new("wal.log", dir.path(), 5).is_ok());
    }

    #[test]
    fn test_empty_log_has_no_records() {
        let dir = tempdir().unwrap();
        let log = LogManager::new("wal.log", dir.path(), 32).unwrap();
        assert!(log.last_log().unwrap().is_none());
    }

    #[test]
    fn test_lsns_are_sequential() {
        let dir = tempdir().unwrap();
        let log = LogManager::new("wal.log", dir.path(), 32).unwrap();
        for expected in 0..5u32 {
            assert_eq!(log.append(&begin(expected)).unwrap(), expected);
        }
    }

    #[test]
    fn test_backward_traversal_visits_every_record() {
        let dir = tempdir().unwrap();
        let log = LogManager::new("wal.log", dir.path(), 32).unwrap();

        let written: Vec<LogRecord> = (0..6).map(begin).collect();
        for record in &written {
            log.append(record).unwrap();
        }

        let mut backward = collect_backward(&log);
        backward.reverse();
        assert_eq!(backward, written);
    }

    #[test]
    fn test_forward_traversal_after_rewind() {
        let dir = tempdir().unwrap();
        let log = LogManager::new("wal.log", dir.path(), 32).unwrap();

        let written: Vec<LogRecord> = (0..6).map(begin).collect();
        for record in &written {
            log.append(record).unwrap();
        }

        // Rewind to the first record, then walk forward.
        let mut iter = log.last_log().unwrap().unwrap();
        while iter.has_previous() {
            iter.previous().unwrap();
        }
        let mut forward = Vec::new();
        loop {
            forward.push(LogRecord::decode(&iter.log_body().unwrap()).unwrap());
            if !iter.has_next() {
                break;
            }
            iter.next().unwrap();
        }
        assert_eq!(forward, written);
    }

    #[test]
    fn test_records_span_block_boundaries() {
        let dir = tempdir().unwrap();
        // 12 payload bytes per block; every record frame is larger.
        let log = LogManager::new("wal.log", dir.path(), 16).unwrap();

        let record = LogRecord::Operation {
            transaction_id: 9,
            position: crate::disk::DiskPosition::new(
                crate::disk::BlockId::new("data.tbl", 0),
                0,
            ),
            before: vec![0, 0, 0, 0],
            after: vec![9, 0, 0, 0],
        };
        log.append(&record).unwrap();
        log.append(&begin(1)).unwrap();

        let mut backward = collect_backward(&log);
        backward.reverse();
        assert_eq!(backward, vec![record, begin(1)]);
    }

    #[test]
    fn test_flushed_records_survive_reopen() {
        let dir = tempdir().unwrap();
        let written: Vec<LogRecord> = vec![
            begin(0),
            LogRecord::End {
                transaction_id: 0,
                kind: EndKind::Commit,
            },
        ];
        {
            let log = LogManager::new("wal.log", dir.path(), 16).unwrap();
            for record in &written {
                log.append(record).unwrap();
            }
            log.flush_all().unwrap();
        }

        let log = LogManager::new("wal.log", dir.path(), 16).unwrap();
        let mut backward = collect_backward(&log);
        backward.reverse();
        assert_eq!(backward, written);

        // The reopened log appends after the existing records.
        log.append(&begin(1)).unwrap();
        assert_eq!(collect_backward(&log).first().unwrap(), &begin(1));
    }

    #[test]
    fn test_unflushed_records_are_lost_on_reopen() {
        let dir = tempdir().unwrap();
        {
            let log = LogManager::new("wal.log", dir.path(), 32).unwrap();
            log.append(&begin(0)).unwrap();
            log.flush_all().unwrap();
            log.append(&begin(1)).unwrap();
            // No flush: record 1 only ever lives in the in-memory tail.
        }

        let log = LogManager::new("wal.log", dir.path(), 32).unwrap();
        assert_eq!(collect_backward(&log), vec![begin(0)]);
    }

    #[test]
    fn test_torn_tail_is_truncated_and_appendable() {
        let dir = tempdir().unwrap();
        let block_size = 32;
        {
            let log = LogManager::new("wal.log", dir.path(), block_size).unwrap();
            log.append(&begin(0)).unwrap();
            log.flush_all().unwrap();
        }

        // Craft a torn tail: extend the flushed block's cursor over five
        // garbage bytes, too short for even a frame header.
        {
            let disk = DiskManager::new(dir.path(), block_size);
            let block_id = BlockId::new("wal.log", 0);
            let mut page = Page::new(block_size);
            disk.read(&block_id, &mut page).unwrap();
            let cursor = page.read_int(0).unwrap();
            page.write_int(0, cursor + 5).unwrap();
            disk.write(&block_id, &page).unwrap();
        }

        let log = LogManager::new("wal.log", dir.path(), block_size).unwrap();
        assert_eq!(collect_backward(&log), vec![begin(0)]);

        log.append(&begin(7)).unwrap();
        let mut backward = collect_backward(&log);
        backward.reverse();
        assert_eq!(backward, vec![begin(0), begin(7)]);
    }

    #[test]
    fn test_corrupt_body_fails_checksum() {
        let dir = tempdir().unwrap();
        let block_size = 64;
        {
            let log = LogManager::new("wal.log", dir.path(), block_size).unwrap();
            log.append(&begin(3)).unwrap();
            log.flush_all().unwrap();
        }

        // Flip a byte inside the record body (header is 4 cursor + 8 frame
        // header bytes, so the body starts at offset 12).
        {
            let disk = DiskManager::new(dir.path(), block_size);
            let block_id = BlockId::new("wal.log", 0);
            let mut page = Page::new(block_size);
            disk.read(&block_id, &mut page).unwrap();
            let byte = page.read_byte(13).unwrap();
            page.write_byte(13, byte ^ 0xff).unwrap();
            disk.write(&block_id, &page).unwrap();
        }

        // The damaged frame is the final one, so startup treats it as a
        // torn tail and truncates it.
        let log = LogManager::new("wal.log", dir.path(), block_size).unwrap();
        assert!(log.last_log().unwrap().is_none());
    }
}
