#![forbid(unsafe_code)]

use std::time::{SystemTime, UNIX_EPOCH};

use crate::types::{
    be_i32, be_i64, be_u16, be_u32, chunks_crc32, ArchiveNumber, LogError, Lsa, Result, TranId,
    NULL_LSA,
};

/// Magic bytes opening the active-volume header.
pub const LOG_HEADER_MAGIC: [u8; 4] = *b"ARCL";
/// Magic bytes opening an archive header.
pub const ARCHIVE_HEADER_MAGIC: [u8; 4] = *b"ARCA";
/// On-disk format version for both headers.
pub const LOG_FORMAT_VERSION: u16 = 1;
/// Longest accepted volume prefix.
pub const MAX_PREFIX_LEN: usize = 64;
/// Encoded size of [`LogHeader`].
pub const LOG_HEADER_LEN: usize = 164;
/// Encoded size of [`ArchiveHeader`].
pub const ARCHIVE_HEADER_LEN: usize = 44;

mod log_layout {
    use core::ops::Range;

    pub const MAGIC: Range<usize> = 0..4;
    pub const VERSION: Range<usize> = 4..6;
    pub const CREATION_TIME: Range<usize> = 8..16;
    pub const PAGE_SIZE: Range<usize> = 16..20;
    pub const ACTIVE_PAGES: Range<usize> = 20..24;
    pub const NEXT_TRID: Range<usize> = 24..28;
    pub const APPEND_LSA: Range<usize> = 28..40;
    pub const CHECKPOINT_LSA: Range<usize> = 40..52;
    pub const REDO_LSA: Range<usize> = 52..64;
    pub const EOF_LSA: Range<usize> = 64..76;
    pub const NEXT_ARCHIVE_PAGE: Range<usize> = 76..84;
    pub const NEXT_ARCHIVE_NUM: Range<usize> = 84..88;
    pub const LOWEST_ARCHIVE_NUM: Range<usize> = 88..92;
    pub const PREFIX_LEN: usize = 92;
    pub const PREFIX: Range<usize> = 93..157;
    pub const CRC32: Range<usize> = 160..164;
}

mod archive_layout {
    use core::ops::Range;

    pub const MAGIC: Range<usize> = 0..4;
    pub const VERSION: Range<usize> = 4..6;
    pub const CREATION_TIME: Range<usize> = 8..16;
    pub const NEXT_TRID: Range<usize> = 16..20;
    pub const FIRST_PAGE: Range<usize> = 20..28;
    pub const PAGE_COUNT: Range<usize> = 28..32;
    pub const ARCHIVE_NUM: Range<usize> = 32..36;
    pub const PAGE_SIZE: Range<usize> = 36..40;
    pub const CRC32: Range<usize> = 40..44;
}

/// Seconds since the Unix epoch.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Persistent metadata stored in page 0 of the active volume.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LogHeader {
    /// Unix seconds when the volume was formatted.
    pub creation_time: i64,
    /// Bytes per page.
    pub page_size: u32,
    /// Ring slots after the header page.
    pub active_pages: u32,
    /// Next transaction id to hand out.
    pub next_trid: TranId,
    /// Durable end of the log as of the last header write.
    pub append_lsa: Lsa,
    /// Start marker of the most recent completed checkpoint.
    pub checkpoint_lsa: Lsa,
    /// Smallest LSA crash recovery must replay from.
    pub redo_lsa: Lsa,
    /// End of the log recorded at the last clean shutdown.
    pub eof_lsa: Lsa,
    /// First logical page not yet copied into an archive.
    pub next_archive_page_id: i64,
    /// Number the next archive receives.
    pub next_archive_num: i32,
    /// Oldest archive still on disk.
    pub lowest_archive_num: i32,
    /// File name prefix the volume was created with.
    pub prefix: String,
}

impl LogHeader {
    /// Header for a freshly formatted volume.
    pub fn new(prefix: &str, page_size: u32, active_pages: u32) -> Result<Self> {
        if prefix.is_empty() || prefix.len() > MAX_PREFIX_LEN {
            return Err(LogError::Invalid("log prefix must be 1..=64 bytes"));
        }
        Ok(Self {
            creation_time: unix_now(),
            page_size,
            active_pages,
            next_trid: 1,
            append_lsa: Lsa::new(0, 0),
            checkpoint_lsa: NULL_LSA,
            redo_lsa: NULL_LSA,
            eof_lsa: Lsa::new(0, 0),
            next_archive_page_id: 0,
            next_archive_num: 0,
            lowest_archive_num: 0,
            prefix: prefix.to_string(),
        })
    }

    /// Encodes the header with a trailing CRC-32.
    pub fn encode(&self) -> [u8; LOG_HEADER_LEN] {
        let mut buf = [0u8; LOG_HEADER_LEN];
        buf[log_layout::MAGIC].copy_from_slice(&LOG_HEADER_MAGIC);
        buf[log_layout::VERSION].copy_from_slice(&LOG_FORMAT_VERSION.to_be_bytes());
        buf[log_layout::CREATION_TIME].copy_from_slice(&self.creation_time.to_be_bytes());
        buf[log_layout::PAGE_SIZE].copy_from_slice(&self.page_size.to_be_bytes());
        buf[log_layout::ACTIVE_PAGES].copy_from_slice(&self.active_pages.to_be_bytes());
        buf[log_layout::NEXT_TRID].copy_from_slice(&self.next_trid.to_be_bytes());
        buf[log_layout::APPEND_LSA].copy_from_slice(&self.append_lsa.encode());
        buf[log_layout::CHECKPOINT_LSA].copy_from_slice(&self.checkpoint_lsa.encode());
        buf[log_layout::REDO_LSA].copy_from_slice(&self.redo_lsa.encode());
        buf[log_layout::EOF_LSA].copy_from_slice(&self.eof_lsa.encode());
        buf[log_layout::NEXT_ARCHIVE_PAGE].copy_from_slice(&self.next_archive_page_id.to_be_bytes());
        buf[log_layout::NEXT_ARCHIVE_NUM].copy_from_slice(&self.next_archive_num.to_be_bytes());
        buf[log_layout::LOWEST_ARCHIVE_NUM]
            .copy_from_slice(&self.lowest_archive_num.to_be_bytes());
        let prefix = self.prefix.as_bytes();
        let len = prefix.len().min(MAX_PREFIX_LEN);
        buf[log_layout::PREFIX_LEN] = len as u8;
        buf[log_layout::PREFIX.start..log_layout::PREFIX.start + len]
            .copy_from_slice(&prefix[..len]);
        let crc = chunks_crc32(&[&buf[..log_layout::CRC32.start]]);
        buf[log_layout::CRC32].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    /// Decodes and verifies a header; rejects bad magic, version or checksum.
    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < LOG_HEADER_LEN {
            return Err(LogError::Corruption("log header truncated"));
        }
        if src[log_layout::MAGIC] != LOG_HEADER_MAGIC {
            return Err(LogError::Corruption("log header magic mismatch"));
        }
        if be_u16(&src[log_layout::VERSION]) != LOG_FORMAT_VERSION {
            return Err(LogError::Corruption("log header version mismatch"));
        }
        let stored = be_u32(&src[log_layout::CRC32]);
        if stored != chunks_crc32(&[&src[..log_layout::CRC32.start]]) {
            return Err(LogError::Corruption("log header crc mismatch"));
        }
        let len = src[log_layout::PREFIX_LEN] as usize;
        if len == 0 || len > MAX_PREFIX_LEN {
            return Err(LogError::Corruption("log header prefix length invalid"));
        }
        let prefix_bytes = &src[log_layout::PREFIX.start..log_layout::PREFIX.start + len];
        let prefix = std::str::from_utf8(prefix_bytes)
            .map_err(|_| LogError::Corruption("log header prefix not utf-8"))?
            .to_string();
        Ok(Self {
            creation_time: be_i64(&src[log_layout::CREATION_TIME]),
            page_size: be_u32(&src[log_layout::PAGE_SIZE]),
            active_pages: be_u32(&src[log_layout::ACTIVE_PAGES]),
            next_trid: be_i32(&src[log_layout::NEXT_TRID]),
            append_lsa: Lsa::decode(&src[log_layout::APPEND_LSA])?,
            checkpoint_lsa: Lsa::decode(&src[log_layout::CHECKPOINT_LSA])?,
            redo_lsa: Lsa::decode(&src[log_layout::REDO_LSA])?,
            eof_lsa: Lsa::decode(&src[log_layout::EOF_LSA])?,
            next_archive_page_id: be_i64(&src[log_layout::NEXT_ARCHIVE_PAGE]),
            next_archive_num: be_i32(&src[log_layout::NEXT_ARCHIVE_NUM]),
            lowest_archive_num: be_i32(&src[log_layout::LOWEST_ARCHIVE_NUM]),
            prefix,
        })
    }

    /// Encodes into a zero padded page image.
    pub fn encode_page(&self, page_size: usize) -> Vec<u8> {
        let mut page = vec![0u8; page_size];
        page[..LOG_HEADER_LEN].copy_from_slice(&self.encode());
        page
    }
}

/// Metadata stored in page 0 of every archive volume.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ArchiveHeader {
    /// Unix seconds when the archive was written.
    pub creation_time: i64,
    /// Next transaction id when the archive was written.
    pub next_trid: TranId,
    /// First logical page in the archive.
    pub first_page_id: i64,
    /// Pages after the header page.
    pub page_count: i32,
    /// Number the archive file carries.
    pub archive_number: ArchiveNumber,
    /// Bytes per page.
    pub page_size: u32,
}

impl ArchiveHeader {
    /// Last logical page held by the archive.
    pub fn last_page_id(&self) -> i64 {
        self.first_page_id + self.page_count as i64 - 1
    }

    /// Whether `page_id` lies in this archive.
    pub fn contains(&self, page_id: i64) -> bool {
        page_id >= self.first_page_id && page_id <= self.last_page_id()
    }

    /// Encodes the header with a trailing CRC-32.
    pub fn encode(&self) -> [u8; ARCHIVE_HEADER_LEN] {
        let mut buf = [0u8; ARCHIVE_HEADER_LEN];
        buf[archive_layout::MAGIC].copy_from_slice(&ARCHIVE_HEADER_MAGIC);
        buf[archive_layout::VERSION].copy_from_slice(&LOG_FORMAT_VERSION.to_be_bytes());
        buf[archive_layout::CREATION_TIME].copy_from_slice(&self.creation_time.to_be_bytes());
        buf[archive_layout::NEXT_TRID].copy_from_slice(&self.next_trid.to_be_bytes());
        buf[archive_layout::FIRST_PAGE].copy_from_slice(&self.first_page_id.to_be_bytes());
        buf[archive_layout::PAGE_COUNT].copy_from_slice(&self.page_count.to_be_bytes());
        buf[archive_layout::ARCHIVE_NUM].copy_from_slice(&self.archive_number.0.to_be_bytes());
        buf[archive_layout::PAGE_SIZE].copy_from_slice(&self.page_size.to_be_bytes());
        let crc = chunks_crc32(&[&buf[..archive_layout::CRC32.start]]);
        buf[archive_layout::CRC32].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    /// Decodes and verifies an archive header.
    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < ARCHIVE_HEADER_LEN {
            return Err(LogError::Corruption("archive header truncated"));
        }
        if src[archive_layout::MAGIC] != ARCHIVE_HEADER_MAGIC {
            return Err(LogError::Corruption("archive header magic mismatch"));
        }
        if be_u16(&src[archive_layout::VERSION]) != LOG_FORMAT_VERSION {
            return Err(LogError::Corruption("archive header version mismatch"));
        }
        let stored = be_u32(&src[archive_layout::CRC32]);
        if stored != chunks_crc32(&[&src[..archive_layout::CRC32.start]]) {
            return Err(LogError::Corruption("archive header crc mismatch"));
        }
        Ok(Self {
            creation_time: be_i64(&src[archive_layout::CREATION_TIME]),
            next_trid: be_i32(&src[archive_layout::NEXT_TRID]),
            first_page_id: be_i64(&src[archive_layout::FIRST_PAGE]),
            page_count: be_i32(&src[archive_layout::PAGE_COUNT]),
            archive_number: ArchiveNumber(be_i32(&src[archive_layout::ARCHIVE_NUM])),
            page_size: be_u32(&src[archive_layout::PAGE_SIZE]),
        })
    }

    /// Header encoded at the start of a zeroed page.
    pub fn encode_page(&self, page_size: usize) -> Vec<u8> {
        let mut page = vec![0u8; page_size];
        page[..ARCHIVE_HEADER_LEN].copy_from_slice(&self.encode());
        page
    }
}
