#![forbid(unsafe_code)]

use std::sync::Arc;

use tracing::{debug, info};

use crate::log::archive::Archiver;
use crate::log::buffer_pool::{BufferPool, FixMode};
use crate::log::flush::FlushCoordinator;
use crate::log::header::LogHeader;
use crate::log::page::{LogPage, NO_RECORD_OFFSET};
use crate::log::record::{LogRecordHeader, LogRecordType, RecordLayout, LOG_RECORD_HDR_LEN};
use crate::log::volume::ActiveVolume;
use crate::log::writer::PageSource;
use crate::types::{chunks_crc32, LogError, Lsa, Result, NULL_LSA};

const TORN_READ_RETRIES: usize = 3;

/// Reads durable pages from the active volume, falling back to archives.
pub struct DurablePageSource {
    volume: Arc<ActiveVolume>,
    archiver: Arc<Archiver>,
}

impl DurablePageSource {
    /// Source over the active volume and its archives.
    pub fn new(volume: Arc<ActiveVolume>, archiver: Arc<Archiver>) -> Self {
        Self { volume, archiver }
    }

    fn read_active(&self, page_id: i64) -> Result<LogPage> {
        let mut attempt = 0;
        loop {
            match self.volume.read_page(page_id) {
                // A flush may be rewriting the tail page while we read it.
                Err(LogError::Corruption(_)) if attempt + 1 < TORN_READ_RETRIES => {
                    attempt += 1;
                    std::thread::yield_now();
                }
                other => return other,
            }
        }
    }
}

impl PageSource for DurablePageSource {
    fn read_durable_page(&self, page_id: i64) -> Result<LogPage> {
        if page_id < self.archiver.next_archive_page_id() {
            return self.archiver.read_page(page_id);
        }
        match self.read_active(page_id) {
            Err(LogError::PageMismatch { .. })
                if page_id < self.archiver.next_archive_page_id() =>
            {
                self.archiver.read_page(page_id)
            }
            other => other,
        }
    }
}

/// One record returned by [`LogScan`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ScannedRecord {
    /// Where the record starts.
    pub lsa: Lsa,
    /// Decoded record header.
    pub header: LogRecordHeader,
    /// Record payload.
    pub data: Vec<u8>,
}

/// Reads the record at `lsa`; `None` at the end-of-log sentinel.
fn read_record(
    fetch: &mut dyn FnMut(i64) -> Result<LogPage>,
    layout: &RecordLayout,
    lsa: Lsa,
) -> Result<Option<(LogRecordHeader, Vec<u8>)>> {
    let body_len = layout.body_len();
    let offset = lsa.offset as usize;
    if lsa.offset < 0 || offset + LOG_RECORD_HDR_LEN > body_len {
        return Err(LogError::Corruption("record header outside page body"));
    }
    let mut page = fetch(lsa.page_id)?;
    let header = LogRecordHeader::decode(&page.body()[offset..offset + LOG_RECORD_HDR_LEN])?;
    if header.rectype == LogRecordType::EndOfLog {
        return Ok(None);
    }
    if header.forw_lsa != layout.next_record(lsa, header.total_len()) {
        return Err(LogError::Corruption("record forward link does not match its length"));
    }

    let mut data = Vec::with_capacity(header.data_len as usize);
    let mut pos = offset + LOG_RECORD_HDR_LEN;
    let mut page_id = lsa.page_id;
    while data.len() < header.data_len as usize {
        if pos == body_len {
            page_id += 1;
            page = fetch(page_id)?;
            if !page.is_continuation() {
                return Err(LogError::Corruption("record continues on a non-continuation page"));
            }
            pos = 0;
        }
        let n = (header.data_len as usize - data.len()).min(body_len - pos);
        data.extend_from_slice(&page.body()[pos..pos + n]);
        pos += n;
    }
    if chunks_crc32(&[&data]) != header.data_crc {
        return Err(LogError::Corruption("record data checksum mismatch"));
    }
    Ok(Some((header, data)))
}

/// Finds the end of the log after a restart.
///
/// Starting at the header's append LSA, follows forward links until the
/// end-of-log sentinel or the first record that cannot be read back intact.
/// Returns the LSA where appending resumes and the last record before it.
pub(crate) fn recover_end(
    volume: &ActiveVolume,
    layout: &RecordLayout,
    header: &LogHeader,
) -> Result<(Lsa, Lsa)> {
    let mut cursor = layout.record_start(header.append_lsa);
    let offset = cursor.offset as usize;
    // Whatever sits at the append LSA, sentinel or record, links back to the last record.
    let mut prev = volume
        .read_page(cursor.page_id)
        .and_then(|page| LogRecordHeader::decode(&page.body()[offset..offset + LOG_RECORD_HDR_LEN]))
        .map(|h| h.back_lsa)
        .unwrap_or(NULL_LSA);
    let mut recovered = 0u64;
    let mut fetch = |page_id: i64| volume.read_page(page_id);
    loop {
        match read_record(&mut fetch, layout, cursor) {
            Ok(Some((h, _))) => {
                prev = cursor;
                cursor = h.forw_lsa;
                recovered += 1;
            }
            Ok(None) => break,
            Err(err) => {
                debug!(%cursor, error = %err, "log.recovery.stop");
                break;
            }
        }
    }
    info!(end = %cursor, prev = %prev, recovered, "log.recovery.end_of_log");
    Ok((cursor, prev))
}

/// Random and sequential access to log records.
pub struct LogReader {
    flush: Arc<FlushCoordinator>,
    pool: Arc<BufferPool>,
    source: Arc<DurablePageSource>,
    archiver: Arc<Archiver>,
    layout: RecordLayout,
}

impl LogReader {
    pub(crate) fn new(
        flush: Arc<FlushCoordinator>,
        pool: Arc<BufferPool>,
        source: Arc<DurablePageSource>,
        archiver: Arc<Archiver>,
        layout: RecordLayout,
    ) -> Self {
        Self {
            flush,
            pool,
            source,
            archiver,
            layout,
        }
    }

    /// Returns a copy of `page_id`, wherever it currently lives.
    pub fn read_page(&self, page_id: i64) -> Result<LogPage> {
        self.flush.drain()?;
        if page_id > self.flush.appended_lsa().page_id {
            return Err(LogError::NotFound);
        }
        if page_id < self.archiver.next_archive_page_id() {
            return self.archiver.read_page(page_id);
        }
        if self.pool.is_resident(page_id) {
            let handle = self.pool.fix(page_id, FixMode::Existing)?;
            let page = handle.read().clone();
            self.pool.unfix(handle);
            return Ok(page);
        }
        self.source.read_durable_page(page_id)
    }

    /// First record that starts on or after `page_id`, or the end of the log.
    pub fn first_record_from(&self, page_id: i64) -> Result<Lsa> {
        self.flush.drain()?;
        let end = self.flush.appended_lsa();
        let mut page_id = page_id.max(self.archiver.next_archive_page_id());
        while page_id < end.page_id || (page_id == end.page_id && end.offset > 0) {
            let offset = self.read_page(page_id)?.first_record_offset();
            if offset != NO_RECORD_OFFSET {
                return Ok(Lsa::new(page_id, offset));
            }
            page_id += 1;
        }
        Ok(end)
    }

    /// Iterates records from `from` up to the current end of the log.
    pub fn scan(&self, from: Lsa) -> Result<LogScan<'_>> {
        self.flush.drain()?;
        Ok(LogScan {
            reader: self,
            cursor: self.layout.record_start(from),
            end: self.flush.appended_lsa(),
            cached: None,
            done: false,
        })
    }
}

/// Iterator returned by [`LogReader::scan`].
pub struct LogScan<'a> {
    reader: &'a LogReader,
    cursor: Lsa,
    end: Lsa,
    cached: Option<LogPage>,
    done: bool,
}

impl Iterator for LogScan<'_> {
    type Item = Result<ScannedRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.cursor >= self.end {
            return None;
        }
        let reader = self.reader;
        let cached = &mut self.cached;
        let mut fetch = |page_id: i64| -> Result<LogPage> {
            if let Some(page) = cached.as_ref().filter(|p| p.page_id() == page_id) {
                return Ok(page.clone());
            }
            let page = reader.read_page(page_id)?;
            *cached = Some(page.clone());
            Ok(page)
        };
        match read_record(&mut fetch, &reader.layout, self.cursor) {
            Ok(Some((header, data))) => {
                let lsa = self.cursor;
                self.cursor = header.forw_lsa;
                Some(Ok(ScannedRecord { lsa, header, data }))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}
