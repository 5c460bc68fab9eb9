#![forbid(unsafe_code)]

use crate::log::page::LOG_PAGE_HDR_LEN;
use crate::types::{be_i32, be_u32, chunks_crc32, LogError, Lsa, Result, TranId, NULL_LSA};

/// Encoded size of a [`LogRecordHeader`].
pub const LOG_RECORD_HDR_LEN: usize = 56;

/// Records begin on multiples of this many body bytes.
pub const LOG_RECORD_ALIGN: usize = 8;

mod layout {
    use core::ops::Range;

    pub const BACK_LSA: Range<usize> = 0..12;
    pub const FORW_LSA: Range<usize> = 12..24;
    pub const PREV_TRAN_LSA: Range<usize> = 24..36;
    pub const TRID: Range<usize> = 36..40;
    pub const RECTYPE: usize = 40;
    pub const DATA_LEN: Range<usize> = 44..48;
    pub const DATA_CRC: Range<usize> = 48..52;
}

/// Kinds of log records understood by the core.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum LogRecordType {
    /// Sentinel marking the current end of the log.
    EndOfLog = 0,
    /// Data with undo and redo images.
    UndoRedoData = 1,
    /// Undo image only.
    UndoData = 2,
    /// Redo image only.
    RedoData = 3,
    /// Compensation record written during rollback.
    Compensate = 4,
    /// Transaction commit.
    Commit = 5,
    /// Transaction abort.
    Abort = 6,
    /// Start of a fuzzy checkpoint; carries the transaction table.
    StartCheckpoint = 7,
    /// End of a fuzzy checkpoint.
    EndCheckpoint = 8,
    /// Filler record with no semantic content.
    Dummy = 9,
}

impl LogRecordType {
    /// Wire code.
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Decodes a wire code.
    pub fn from_u8(value: u8) -> Result<Self> {
        Ok(match value {
            0 => Self::EndOfLog,
            1 => Self::UndoRedoData,
            2 => Self::UndoData,
            3 => Self::RedoData,
            4 => Self::Compensate,
            5 => Self::Commit,
            6 => Self::Abort,
            7 => Self::StartCheckpoint,
            8 => Self::EndCheckpoint,
            9 => Self::Dummy,
            _ => return Err(LogError::Corruption("unknown log record type")),
        })
    }

    /// Whether this record closes the writing transaction's chain.
    pub fn ends_transaction(self) -> bool {
        matches!(self, Self::Commit | Self::Abort)
    }

    /// Whether records of this type join a transaction's `prev_tran_lsa` chain.
    pub fn is_transactional(self) -> bool {
        !matches!(
            self,
            Self::EndOfLog | Self::StartCheckpoint | Self::EndCheckpoint | Self::Dummy
        )
    }
}

/// Fixed header in front of every record's data.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct LogRecordHeader {
    /// LSA of the previous record in the log.
    pub back_lsa: Lsa,
    /// LSA at which the next record begins.
    pub forw_lsa: Lsa,
    /// LSA of the previous record written by the same transaction.
    pub prev_tran_lsa: Lsa,
    /// Writing transaction.
    pub trid: TranId,
    /// Record kind.
    pub rectype: LogRecordType,
    /// Payload length in bytes.
    pub data_len: u32,
    /// CRC-32 of the payload.
    pub data_crc: u32,
}

impl LogRecordHeader {
    /// Header for the end-of-log sentinel written at `back_lsa`'s successor.
    pub fn end_of_log(back_lsa: Lsa) -> Self {
        Self {
            back_lsa,
            forw_lsa: NULL_LSA,
            prev_tran_lsa: NULL_LSA,
            trid: 0,
            rectype: LogRecordType::EndOfLog,
            data_len: 0,
            data_crc: 0,
        }
    }

    /// Encodes the header in big-endian order.
    pub fn encode(&self) -> [u8; LOG_RECORD_HDR_LEN] {
        let mut buf = [0u8; LOG_RECORD_HDR_LEN];
        buf[layout::BACK_LSA].copy_from_slice(&self.back_lsa.encode());
        buf[layout::FORW_LSA].copy_from_slice(&self.forw_lsa.encode());
        buf[layout::PREV_TRAN_LSA].copy_from_slice(&self.prev_tran_lsa.encode());
        buf[layout::TRID].copy_from_slice(&self.trid.to_be_bytes());
        buf[layout::RECTYPE] = self.rectype.as_u8();
        buf[layout::DATA_LEN].copy_from_slice(&self.data_len.to_be_bytes());
        buf[layout::DATA_CRC].copy_from_slice(&self.data_crc.to_be_bytes());
        buf
    }

    /// Decodes a header; rejects unknown record types.
    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < LOG_RECORD_HDR_LEN {
            return Err(LogError::Corruption("log record header truncated"));
        }
        Ok(Self {
            back_lsa: Lsa::decode(&src[layout::BACK_LSA])?,
            forw_lsa: Lsa::decode(&src[layout::FORW_LSA])?,
            prev_tran_lsa: Lsa::decode(&src[layout::PREV_TRAN_LSA])?,
            trid: be_i32(&src[layout::TRID]),
            rectype: LogRecordType::from_u8(src[layout::RECTYPE])?,
            data_len: be_u32(&src[layout::DATA_LEN]),
            data_crc: be_u32(&src[layout::DATA_CRC]),
        })
    }

    /// Total encoded size of the record, header included.
    pub fn total_len(&self) -> usize {
        LOG_RECORD_HDR_LEN + self.data_len as usize
    }
}

/// A record as built by a producer, before it has been given an LSA.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LogRecord {
    /// Writing transaction.
    pub trid: TranId,
    /// Record kind.
    pub rectype: LogRecordType,
    /// Opaque payload.
    pub data: Vec<u8>,
}

impl LogRecord {
    /// Record of any kind.
    pub fn new(trid: TranId, rectype: LogRecordType, data: Vec<u8>) -> Self {
        Self {
            trid,
            rectype,
            data,
        }
    }

    /// Redo-only data record.
    pub fn redo(trid: TranId, data: Vec<u8>) -> Self {
        Self::new(trid, LogRecordType::RedoData, data)
    }

    /// Data record carrying undo and redo images.
    pub fn undo_redo(trid: TranId, data: Vec<u8>) -> Self {
        Self::new(trid, LogRecordType::UndoRedoData, data)
    }

    /// Commit record with no payload.
    pub fn commit(trid: TranId) -> Self {
        Self::new(trid, LogRecordType::Commit, Vec::new())
    }

    /// Abort record with no payload.
    pub fn abort(trid: TranId) -> Self {
        Self::new(trid, LogRecordType::Abort, Vec::new())
    }

    /// Encoded length, header included.
    pub fn total_len(&self) -> usize {
        LOG_RECORD_HDR_LEN + self.data.len()
    }

    /// CRC-32 of the payload.
    pub fn data_crc(&self) -> u32 {
        chunks_crc32(&[&self.data])
    }
}

/// Placement arithmetic for records inside page bodies.
///
/// Reservation and physical copy both use these rules, so a record's
/// `forw_lsa` is known before any byte of it is written.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RecordLayout {
    body_len: usize,
}

impl RecordLayout {
    /// Layout for pages of `page_size` bytes.
    pub fn new(page_size: usize) -> Result<Self> {
        let body_len = page_size
            .checked_sub(LOG_PAGE_HDR_LEN)
            .ok_or(LogError::Invalid("page size smaller than page header"))?;
        if body_len % LOG_RECORD_ALIGN != 0 {
            return Err(LogError::Invalid("page body not record aligned"));
        }
        if body_len < 2 * LOG_RECORD_HDR_LEN {
            return Err(LogError::Invalid("page too small for log records"));
        }
        Ok(Self { body_len })
    }

    /// Record bytes per page.
    pub fn body_len(&self) -> usize {
        self.body_len
    }

    /// Moves `cursor` to the next page when the remaining body cannot hold a header.
    pub fn record_start(&self, cursor: Lsa) -> Lsa {
        let offset = cursor.offset as usize;
        if self.body_len - offset.min(self.body_len) < LOG_RECORD_HDR_LEN {
            Lsa::new(cursor.page_id + 1, 0)
        } else {
            cursor
        }
    }

    /// LSA at which the record following a `total_len`-byte record at `start` begins.
    pub fn next_record(&self, start: Lsa, total_len: usize) -> Lsa {
        let pos = start.offset as usize + total_len;
        let mut page_id = start.page_id + (pos / self.body_len) as i64;
        let mut offset = pos % self.body_len;
        offset = (offset + LOG_RECORD_ALIGN - 1) & !(LOG_RECORD_ALIGN - 1);
        if offset >= self.body_len {
            page_id += 1;
            offset = 0;
        }
        self.record_start(Lsa::new(page_id, offset as i32))
    }

    /// Number of pages a record placed at `start` touches.
    pub fn pages_spanned(&self, start: Lsa, total_len: usize) -> i64 {
        let last_byte = start.offset as usize + total_len - 1;
        (last_byte / self.body_len) as i64 + 1
    }
}
