#![forbid(unsafe_code)]

use std::fmt;

use crate::types::{be_i32, be_i64, be_u16, be_u32, page_crc32, LogError, Result};

/// Size of the fixed header in front of every log page body.
pub const LOG_PAGE_HDR_LEN: usize = 24;

/// Flag: the page begins with the tail of a record started on an earlier page.
pub const PAGE_FLAG_CONTINUATION: u16 = 0x0001;

/// `first_record_offset` value for pages without a record start.
pub const NO_RECORD_OFFSET: i32 = -1;

pub mod header {
    //! Byte offsets for fixed log page header fields.
    use core::ops::Range;

    /// Logical page id.
    pub const PAGE_ID: Range<usize> = 0..8;
    /// Offset of the first record starting on the page, or [`super::NO_RECORD_OFFSET`].
    pub const FIRST_RECORD: Range<usize> = 8..12;
    /// Page flags such as [`super::PAGE_FLAG_CONTINUATION`].
    pub const FLAGS: Range<usize> = 12..14;
    /// Unused.
    pub const RESERVED: Range<usize> = 14..16;
    /// Checksum over the page with this field zeroed.
    pub const CRC32: Range<usize> = 16..20;
    /// Unused.
    pub const RESERVED_TAIL: Range<usize> = 20..24;
}

/// One fixed-size page of the logical log.
#[derive(Clone, PartialEq, Eq)]
pub struct LogPage {
    bytes: Box<[u8]>,
}

impl LogPage {
    /// Creates a formatted page with no records.
    pub fn new(page_id: i64, page_size: usize) -> Self {
        let mut page = Self {
            bytes: vec![0u8; page_size].into_boxed_slice(),
        };
        page.reset(page_id);
        page
    }

    /// Wraps raw bytes read from a volume.
    pub fn from_bytes(bytes: Box<[u8]>) -> Result<Self> {
        if bytes.len() <= LOG_PAGE_HDR_LEN {
            return Err(LogError::Corruption("log page shorter than header"));
        }
        Ok(Self { bytes })
    }

    /// Clears the page and stamps a new logical id.
    pub fn reset(&mut self, page_id: i64) {
        self.bytes.fill(0);
        self.bytes[header::PAGE_ID].copy_from_slice(&page_id.to_be_bytes());
        self.set_first_record_offset(NO_RECORD_OFFSET);
    }

    /// Logical page id stamped in the header.
    pub fn page_id(&self) -> i64 {
        be_i64(&self.bytes[header::PAGE_ID])
    }

    /// Offset of the first record starting on this page.
    pub fn first_record_offset(&self) -> i32 {
        be_i32(&self.bytes[header::FIRST_RECORD])
    }

    /// Overwrites the first-record offset.
    pub fn set_first_record_offset(&mut self, offset: i32) {
        self.bytes[header::FIRST_RECORD].copy_from_slice(&offset.to_be_bytes());
    }

    /// Records `offset` as the first record start unless one is already set.
    pub fn note_record_start(&mut self, offset: i32) {
        if self.first_record_offset() == NO_RECORD_OFFSET {
            self.set_first_record_offset(offset);
        }
    }

    /// Raw header flags.
    pub fn flags(&self) -> u16 {
        be_u16(&self.bytes[header::FLAGS])
    }

    /// Replaces the header flags.
    pub fn set_flags(&mut self, flags: u16) {
        self.bytes[header::FLAGS].copy_from_slice(&flags.to_be_bytes());
    }

    /// Whether the body starts with the tail of an earlier record.
    pub fn is_continuation(&self) -> bool {
        self.flags() & PAGE_FLAG_CONTINUATION != 0
    }

    /// Flags the body as starting mid-record.
    pub fn mark_continuation(&mut self) {
        let flags = self.flags() | PAGE_FLAG_CONTINUATION;
        self.set_flags(flags);
    }

    /// Total page size, header included.
    pub fn page_size(&self) -> usize {
        self.bytes.len()
    }

    /// Bytes available for records.
    pub fn body_len(&self) -> usize {
        self.bytes.len() - LOG_PAGE_HDR_LEN
    }

    /// Record area after the header.
    pub fn body(&self) -> &[u8] {
        &self.bytes[LOG_PAGE_HDR_LEN..]
    }

    /// Mutable record area.
    pub fn body_mut(&mut self) -> &mut [u8] {
        &mut self.bytes[LOG_PAGE_HDR_LEN..]
    }

    /// Whole page image as written to disk.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Recomputes and stores the page checksum.
    pub fn seal(&mut self) {
        let crc = page_crc32(&self.bytes, header::CRC32);
        self.bytes[header::CRC32].copy_from_slice(&crc.to_be_bytes());
    }

    /// Checks the stored checksum against the page contents.
    pub fn checksum_ok(&self) -> bool {
        be_u32(&self.bytes[header::CRC32]) == page_crc32(&self.bytes, header::CRC32)
    }

    /// Validates checksum and logical id of a page read back from disk.
    pub fn verify(&self, expected_page_id: i64) -> Result<()> {
        let found = self.page_id();
        if found != expected_page_id {
            return Err(LogError::PageMismatch {
                expected: expected_page_id,
                found,
            });
        }
        if !self.checksum_ok() {
            return Err(LogError::Corruption("log page checksum mismatch"));
        }
        Ok(())
    }

    /// Zeroes every body byte from `offset` to the end of the page.
    pub fn truncate_body(&mut self, offset: usize) {
        let body = self.body_mut();
        if offset < body.len() {
            body[offset..].fill(0);
        }
    }
}

impl fmt::Debug for LogPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogPage")
            .field("page_id", &self.page_id())
            .field("first_record_offset", &self.first_record_offset())
            .field("flags", &self.flags())
            .field("len", &self.bytes.len())
            .finish()
    }
}
