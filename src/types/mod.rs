#![forbid(unsafe_code)]

//! Addressing primitives and the shared error type.

use std::fmt;
use std::io;

use serde::Serialize;

/// CRC-32 helpers for pages and record payloads.
pub mod checksum;

pub use checksum::{chunks_crc32, page_crc32};

/// Transaction identifier carried in every log record header.
pub type TranId = i32;

/// Encoded size of an [`Lsa`] on disk and on the wire.
pub const LSA_ENCODED_LEN: usize = 12;

/// Log Sequence Address: a logical page id plus a body offset inside that page.
///
/// Ordering is lexicographic on `(page_id, offset)`, which is the total order of
/// log records.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize)]
pub struct Lsa {
    /// Logical (never wrapping) page id.
    pub page_id: i64,
    /// Offset relative to the start of the page body.
    pub offset: i32,
}

/// The distinguished "no address" value.
pub const NULL_LSA: Lsa = Lsa {
    page_id: -1,
    offset: -1,
};

impl Lsa {
    /// Builds an address from its components.
    pub const fn new(page_id: i64, offset: i32) -> Self {
        Self { page_id, offset }
    }

    /// Returns true for [`NULL_LSA`].
    pub fn is_null(&self) -> bool {
        *self == NULL_LSA
    }

    /// Encodes into 12 big-endian bytes.
    pub fn encode(&self) -> [u8; LSA_ENCODED_LEN] {
        let mut buf = [0u8; LSA_ENCODED_LEN];
        buf[0..8].copy_from_slice(&self.page_id.to_be_bytes());
        buf[8..12].copy_from_slice(&self.offset.to_be_bytes());
        buf
    }

    /// Decodes from the first 12 bytes of `src`.
    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < LSA_ENCODED_LEN {
            return Err(LogError::Corruption("lsa truncated"));
        }
        Ok(Self {
            page_id: be_i64(&src[0..8]),
            offset: be_i32(&src[8..12]),
        })
    }
}

impl fmt::Display for Lsa {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.page_id, self.offset)
    }
}

/// Physical ring position of a logical page inside the active volume.
///
/// All logical to physical translation goes through [`PhysicalSlot::from_logical`].
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct PhysicalSlot(pub u64);

impl PhysicalSlot {
    /// Maps a logical page id onto a ring of `capacity` slots.
    pub fn from_logical(page_id: i64, capacity: u64) -> Result<Self> {
        if page_id < 0 {
            return Err(LogError::InvalidOwned(format!(
                "negative logical page id {page_id}"
            )));
        }
        if capacity == 0 {
            return Err(LogError::Invalid("active log capacity is zero"));
        }
        Ok(Self(page_id as u64 % capacity))
    }

    /// Page index inside the active volume file; page 0 holds the log header.
    pub fn volume_page(self) -> u64 {
        self.0 + 1
    }

    /// Byte offset of this slot inside the active volume file.
    pub fn file_offset(self, page_size: usize) -> u64 {
        self.volume_page() * page_size as u64
    }
}

/// Sequence number of an archive volume.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize)]
pub struct ArchiveNumber(pub i32);

impl fmt::Display for ArchiveNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors surfaced by the log core.
#[derive(thiserror::Error, Debug)]
pub enum LogError {
    /// Underlying I/O failure.
    #[error("IO: {0}")]
    Io(#[from] io::Error),
    /// On-disk structure failed validation.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// Caller supplied an invalid argument or configuration.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// Invalid argument with a formatted message.
    #[error("invalid argument: {0}")]
    InvalidOwned(String),
    /// The buffer pool could neither reclaim nor grow.
    #[error("out of log buffers (capacity {capacity})")]
    OutOfBuffers {
        /// Pool capacity at the time of failure.
        capacity: usize,
    },
    /// A page read back from disk carried a different logical id.
    #[error("page id mismatch: expected {expected}, found {found}")]
    PageMismatch {
        /// Logical page requested.
        expected: i64,
        /// Logical page id stored in the slot.
        found: i64,
    },
    /// Archive volume is missing or cannot be opened.
    #[error("archive {0} unavailable")]
    ArchiveUnavailable(ArchiveNumber),
    /// Bounded wait elapsed.
    #[error("timed out")]
    Timeout,
    /// Wait was cancelled by interrupt or shutdown.
    #[error("interrupted")]
    Interrupted,
    /// Unrecoverable failure; the log must not be used further.
    #[error("fatal error in {component} at lsa {lsa}: {reason}")]
    Fatal {
        /// Component that detected the failure.
        component: &'static str,
        /// LSA context at the time of failure.
        lsa: Lsa,
        /// Human readable cause.
        reason: String,
    },
    /// Requested item does not exist.
    #[error("not found")]
    NotFound,
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, LogError>;

impl LogError {
    /// True for errors after which the log must stop accepting work.
    pub fn is_fatal(&self) -> bool {
        matches!(self, LogError::Fatal { .. })
    }

    /// True for errors a caller may retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LogError::Timeout | LogError::Interrupted | LogError::ArchiveUnavailable(_)
        )
    }

    /// Wraps any error into [`LogError::Fatal`] with component context.
    pub fn into_fatal(self, component: &'static str, lsa: Lsa) -> LogError {
        match self {
            fatal @ LogError::Fatal { .. } => fatal,
            other => LogError::Fatal {
                component,
                lsa,
                reason: other.to_string(),
            },
        }
    }
}

/// Duplicates an error for delivery to several waiters.
pub fn clone_error(err: &LogError) -> LogError {
    match err {
        LogError::Io(io_err) => LogError::Io(io::Error::new(io_err.kind(), io_err.to_string())),
        LogError::Corruption(msg) => LogError::Corruption(msg),
        LogError::Invalid(msg) => LogError::Invalid(msg),
        LogError::InvalidOwned(msg) => LogError::InvalidOwned(msg.clone()),
        LogError::OutOfBuffers { capacity } => LogError::OutOfBuffers {
            capacity: *capacity,
        },
        LogError::PageMismatch { expected, found } => LogError::PageMismatch {
            expected: *expected,
            found: *found,
        },
        LogError::ArchiveUnavailable(num) => LogError::ArchiveUnavailable(*num),
        LogError::Timeout => LogError::Timeout,
        LogError::Interrupted => LogError::Interrupted,
        LogError::Fatal {
            component,
            lsa,
            reason,
        } => LogError::Fatal {
            component,
            lsa: *lsa,
            reason: reason.clone(),
        },
        LogError::NotFound => LogError::NotFound,
    }
}

pub(crate) fn be_i64(src: &[u8]) -> i64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&src[..8]);
    i64::from_be_bytes(buf)
}

pub(crate) fn be_i32(src: &[u8]) -> i32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&src[..4]);
    i32::from_be_bytes(buf)
}

pub(crate) fn be_u32(src: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&src[..4]);
    u32::from_be_bytes(buf)
}

pub(crate) fn be_u16(src: &[u8]) -> u16 {
    let mut buf = [0u8; 2];
    buf.copy_from_slice(&src[..2]);
    u16::from_be_bytes(buf)
}
