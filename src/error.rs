//! Error types for basalt
//!
//! Defines a unified error type that can represent failures from all layers
//! of the storage core. Messages carry enough context to identify the block,
//! file or transaction involved.

use std::fmt;
use std::io;

/// Unified error type for basalt operations
#[derive(Debug)]
pub enum StoreError {
    /// I/O error (file open/seek/read/write/fsync)
    Io(io::Error),
    /// Offset or length outside a page or allocated file region
    Bounds(String),
    /// Lock acquisition timed out; treated as a probable deadlock
    LockTimeout(String),
    /// A log frame or record body that cannot be decoded
    LogCorrupt(String),
    /// The record at this position extends past the durable end of the log
    IncompleteLog(String),
    /// Transaction lifecycle misuse
    Transaction(String),
    /// Configuration or store manifest mismatch
    Config(String),
    /// A primary failure whose automatic rollback also failed
    Composed {
        primary: Box<StoreError>,
        rollback: Box<StoreError>,
    },
}

impl StoreError {
    /// Create a lock-timeout error for the given resource.
    pub fn lock_timeout(what: impl fmt::Display) -> Self {
        StoreError::LockTimeout(format!("timed out waiting for lock on {}", what))
    }

    /// Create a bounds error for an access of `length` bytes at `offset`
    /// into a region of `limit` bytes.
    pub fn out_of_bounds(offset: usize, length: usize, limit: usize) -> Self {
        StoreError::Bounds(format!(
            "access of {} bytes at offset {} exceeds {} bytes",
            length, offset, limit
        ))
    }

    /// Compose this error with the error of the rollback it triggered.
    pub fn and_rollback(self, rollback: StoreError) -> Self {
        StoreError::Composed {
            primary: Box::new(self),
            rollback: Box::new(rollback),
        }
    }

    /// True when this error is the undurable-tail marker. Recovery treats it
    /// as "end of durable log" rather than a failure.
    pub fn is_incomplete_log(&self) -> bool {
        matches!(self, StoreError::IncompleteLog(_))
    }

    /// True when this error is a lock acquisition timeout.
    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, StoreError::LockTimeout(_))
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Io(e) => write!(f, "{}", e),
            StoreError::Bounds(msg) => write!(f, "{}", msg),
            StoreError::LockTimeout(msg) => write!(f, "{}", msg),
            StoreError::LogCorrupt(msg) => write!(f, "{}", msg),
            StoreError::IncompleteLog(msg) => write!(f, "{}", msg),
            StoreError::Transaction(msg) => write!(f, "{}", msg),
            StoreError::Config(msg) => write!(f, "{}", msg),
            StoreError::Composed { primary, rollback } => {
                write!(f, "{}; rollback also failed: {}", primary, rollback)
            }
        }
    }
}

impl std::error::Error for StoreError {}

impl From<io::Error> for StoreError {
    fn from(e: io::Error) -> Self {
        StoreError::Io(e)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Config(e.to_string())
    }
}

/// Result type alias for basalt operations
pub type Result<T> = std::result::Result<T, StoreError>;
