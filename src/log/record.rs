//! Log record taxonomy and wire encoding
//!
//! Four record shapes share the log. The two high bits of the first body
//! byte carry the record tag; transaction-end records additionally flag
//! commit vs. rollback in bit 5:
//!
//! | Record          | First byte | Body                                         |
//! |-----------------|------------|----------------------------------------------|
//! | Begin           | `0x00`     | tag, txid u32                                |
//! | Operation       | `0x40`     | tag, txid, fn_len, filename, blk_idx, off, before, after |
//! | End (commit)    | `0x80`     | tag, txid u32                                |
//! | End (rollback)  | `0xA0`     | tag, txid u32                                |
//! | Checkpoint      | `0xC0`     | tag                                          |
//!
//! All integers are little-endian. An operation's `before` and `after`
//! images have the same length, so the decoder recovers it by halving the
//! remaining body.

use bytes::{Buf, BufMut};

use crate::buffer::BufferManager;
use crate::disk::{BlockId, DiskPosition, Page};
use crate::error::{Result, StoreError};

/// Log sequence number, assigned by the log manager at append time.
pub type Lsn = u32;

/// Transaction identifier, unique within one process run.
pub type TransactionId = u32;

const TAG_MASK: u8 = 0b1100_0000;
const TAG_BEGIN: u8 = 0b0000_0000;
const TAG_OPERATION: u8 = 0b0100_0000;
const TAG_END: u8 = 0b1000_0000;
const TAG_CHECKPOINT: u8 = 0b1100_0000;

const END_ROLLBACK_FLAG: u8 = 0b0010_0000;

/// How a transaction ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndKind {
    Commit,
    Rollback,
}

/// One record in the write-ahead log.
#[derive(Debug, Clone, PartialEq)]
pub enum LogRecord {
    /// A transaction wrote its first operation.
    Begin { transaction_id: TransactionId },
    /// A physical update: `before` and `after` images of the same span.
    Operation {
        transaction_id: TransactionId,
        position: DiskPosition,
        before: Vec<u8>,
        after: Vec<u8>,
    },
    /// A transaction committed or rolled back.
    End {
        transaction_id: TransactionId,
        kind: EndKind,
    },
    /// A checkpoint finished.
    Checkpoint,
}

impl LogRecord {
    /// The transaction this record belongs to; checkpoints belong to none.
    pub fn transaction_id(&self) -> Option<TransactionId> {
        match self {
            LogRecord::Begin { transaction_id } => Some(*transaction_id),
            LogRecord::Operation { transaction_id, .. } => Some(*transaction_id),
            LogRecord::End { transaction_id, .. } => Some(*transaction_id),
            LogRecord::Checkpoint => None,
        }
    }

    /// Encode this record's body for the log.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            LogRecord::Begin { transaction_id } => {
                let mut body = Vec::with_capacity(5);
                body.put_u8(TAG_BEGIN);
                body.put_u32_le(*transaction_id);
                body
            }
            LogRecord::Operation {
                transaction_id,
                position,
                before,
                after,
            } => {
                debug_assert_eq!(before.len(), after.len());
                let filename = position.block_id.filename();
                let mut body =
                    Vec::with_capacity(17 + filename.len() + before.len() + after.len());
                body.put_u8(TAG_OPERATION);
                body.put_u32_le(*transaction_id);
                body.put_u32_le(filename.len() as u32);
                body.put_slice(filename.as_bytes());
                body.put_i32_le(position.block_id.index());
                body.put_i32_le(position.offset as i32);
                body.put_slice(before);
                body.put_slice(after);
                body
            }
            LogRecord::End {
                transaction_id,
                kind,
            } => {
                let tag = match kind {
                    EndKind::Commit => TAG_END,
                    EndKind::Rollback => TAG_END | END_ROLLBACK_FLAG,
                };
                let mut body = Vec::with_capacity(5);
                body.put_u8(tag);
                body.put_u32_le(*transaction_id);
                body
            }
            LogRecord::Checkpoint => vec![TAG_CHECKPOINT],
        }
    }

    /// Decode a record from its body bytes.
    pub fn decode(body: &[u8]) -> Result<LogRecord> {
        let mut buf = body;
        if buf.is_empty() {
            return Err(StoreError::LogCorrupt("empty log record body".to_string()));
        }
        let tag = buf.get_u8();

        match tag & TAG_MASK {
            TAG_BEGIN => {
                let transaction_id = take_u32(&mut buf)?;
                expect_consumed(buf, "transaction-begin")?;
                Ok(LogRecord::Begin { transaction_id })
            }
            TAG_OPERATION => decode_operation(buf),
            TAG_END => {
                let transaction_id = take_u32(&mut buf)?;
                expect_consumed(buf, "transaction-end")?;
                let kind = if tag & END_ROLLBACK_FLAG == 0 {
                    EndKind::Commit
                } else {
                    EndKind::Rollback
                };
                Ok(LogRecord::End {
                    transaction_id,
                    kind,
                })
            }
            TAG_CHECKPOINT => {
                expect_consumed(buf, "checkpoint")?;
                Ok(LogRecord::Checkpoint)
            }
            _ => unreachable!("two-bit tag covers every value"),
        }
    }

    /// Restore the before-image of an operation record. Other record types
    /// undo to nothing. Idempotent.
    pub fn undo(&self, buffers: &BufferManager) -> Result<()> {
        if let LogRecord::Operation {
            position, before, ..
        } = self
        {
            apply_image(buffers, position, before)?;
        }
        Ok(())
    }

    /// Re-apply the after-image of an operation record. Other record types
    /// redo to nothing. Idempotent.
    pub fn redo(&self, buffers: &BufferManager) -> Result<()> {
        if let LogRecord::Operation {
            position, after, ..
        } = self
        {
            apply_image(buffers, position, after)?;
        }
        Ok(())
    }
}

fn decode_operation(mut buf: &[u8]) -> Result<LogRecord> {
    let transaction_id = take_u32(&mut buf)?;
    let filename_len = take_u32(&mut buf)? as usize;
    if buf.remaining() < filename_len {
        return Err(StoreError::LogCorrupt(
            "operation record filename is truncated".to_string(),
        ));
    }
    let filename = String::from_utf8(buf[..filename_len].to_vec()).map_err(|_| {
        StoreError::LogCorrupt("operation record filename is not valid UTF-8".to_string())
    })?;
    buf.advance(filename_len);

    let block_index = take_u32(&mut buf)? as i32;
    let offset = take_u32(&mut buf)? as i32;
    if offset < 0 {
        return Err(StoreError::LogCorrupt(format!(
            "operation record has negative offset {}",
            offset
        )));
    }

    let images = buf.remaining();
    if images % 2 != 0 {
        return Err(StoreError::LogCorrupt(format!(
            "operation record images have odd length {}",
            images
        )));
    }
    let half = images / 2;
    let before = buf[..half].to_vec();
    let after = buf[half..].to_vec();

    Ok(LogRecord::Operation {
        transaction_id,
        position: DiskPosition::new(BlockId::new(filename, block_index), offset as usize),
        before,
        after,
    })
}

fn take_u32(buf: &mut &[u8]) -> Result<u32> {
    if buf.remaining() < 4 {
        return Err(StoreError::LogCorrupt(
            "log record body is truncated".to_string(),
        ));
    }
    Ok(buf.get_u32_le())
}

fn expect_consumed(buf: &[u8], what: &str) -> Result<()> {
    if !buf.is_empty() {
        return Err(StoreError::LogCorrupt(format!(
            "{} record carries {} trailing bytes",
            what,
            buf.len()
        )));
    }
    Ok(())
}

/// Read the block at `position`, overlay `image`, and hand the page back to
/// the buffer pool. Undo and redo both funnel through here; applying the
/// same image twice leaves the same page.
fn apply_image(buffers: &BufferManager, position: &DiskPosition, image: &[u8]) -> Result<()> {
    let mut page = Page::new(buffers.block_size());
    buffers.read(&position.block_id, &mut page)?;
    page.write_bytes(position.offset, image)?;
    buffers.write(&position.block_id, &page, 0)
}
