#![forbid(unsafe_code)]

use std::io::IoSlice;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use crate::log::header::{ArchiveHeader, LogHeader};
use crate::log::page::LogPage;
use crate::primitives::io::{DiskFile, FileIo};
use crate::types::{ArchiveNumber, LogError, PhysicalSlot, Result};

const MAX_IO_SLICES: usize = 512;

/// File names derived from a log directory and prefix.
#[derive(Clone, Debug)]
pub struct VolumePaths {
    dir: PathBuf,
    prefix: String,
}

impl VolumePaths {
    /// Paths for volumes named `prefix` under `dir`.
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
        }
    }

    /// Log directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Volume name prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// `{prefix}_lgat`, the active volume.
    pub fn active(&self) -> PathBuf {
        self.dir.join(format!("{}_lgat", self.prefix))
    }

    /// Full path of archive `num`.
    pub fn archive(&self, num: ArchiveNumber) -> PathBuf {
        self.dir.join(self.archive_file_name(num))
    }

    /// `{prefix}_logarchive.{num}`.
    pub fn archive_file_name(&self, num: ArchiveNumber) -> String {
        format!("{}_logarchive.{}", self.prefix, num.0)
    }

    /// Scratch path an archive is built under before its rename.
    pub fn archive_tmp(&self, num: ArchiveNumber) -> PathBuf {
        self.dir.join(format!("{}_logarchive.{}.tmp", self.prefix, num.0))
    }

    /// `{prefix}_lginf`, the log-information file.
    pub fn log_info(&self) -> PathBuf {
        self.dir.join(format!("{}_lginf", self.prefix))
    }

    /// `{prefix}_lgar_t`, the trailing background archive.
    pub fn background_archive(&self) -> PathBuf {
        self.dir.join(format!("{}_lgar_t", self.prefix))
    }
}

/// The active log: header page followed by a ring of `capacity` page slots.
pub struct ActiveVolume {
    io: Arc<dyn FileIo>,
    page_size: usize,
    capacity: u64,
}

impl ActiveVolume {
    /// Formats a new active volume and persists `header` in page 0.
    pub fn create(path: impl AsRef<Path>, header: &LogHeader) -> Result<Self> {
        let io = DiskFile::create(path.as_ref())?;
        let volume = Self {
            io: Arc::new(io),
            page_size: header.page_size as usize,
            capacity: u64::from(header.active_pages),
        };
        volume
            .io
            .set_len((volume.capacity + 1) * volume.page_size as u64)?;
        volume.write_header(header)?;
        volume.io.sync_all()?;
        debug!(
            path = %path.as_ref().display(),
            pages = volume.capacity,
            page_size = volume.page_size,
            "log.volume.formatted"
        );
        Ok(volume)
    }

    /// Opens an existing volume and returns it with its decoded header.
    pub fn open(path: impl AsRef<Path>, page_size: usize) -> Result<(Self, LogHeader)> {
        let io = DiskFile::open(path.as_ref())?;
        let mut page0 = vec![0u8; page_size];
        io.read_at(0, &mut page0)?;
        let header = LogHeader::decode(&page0)?;
        if header.page_size as usize != page_size {
            return Err(LogError::InvalidOwned(format!(
                "log volume page size {} does not match configured {}",
                header.page_size, page_size
            )));
        }
        let capacity = u64::from(header.active_pages);
        let expected_len = (capacity + 1) * page_size as u64;
        if io.len()? < expected_len {
            return Err(LogError::Corruption("active log volume truncated"));
        }
        Ok((
            Self {
                io: Arc::new(io),
                page_size,
                capacity,
            },
            header,
        ))
    }

    /// Bytes per page.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Ring slots after the header page.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Physical slot holding `page_id`.
    pub fn slot(&self, page_id: i64) -> Result<PhysicalSlot> {
        PhysicalSlot::from_logical(page_id, self.capacity)
    }

    /// Writes the header page. Does not sync.
    pub fn write_header(&self, header: &LogHeader) -> Result<()> {
        self.io.write_at(0, &header.encode_page(self.page_size))
    }

    /// Reads and verifies the header page.
    pub fn read_header(&self) -> Result<LogHeader> {
        let mut page0 = vec![0u8; self.page_size];
        self.io.read_at(0, &mut page0)?;
        LogHeader::decode(&page0)
    }

    /// Reads the slot currently assigned to `page_id` without validating it.
    pub fn read_page_raw(&self, page_id: i64) -> Result<LogPage> {
        let slot = self.slot(page_id)?;
        let mut buf = vec![0u8; self.page_size].into_boxed_slice();
        self.io.read_at(slot.file_offset(self.page_size), &mut buf)?;
        LogPage::from_bytes(buf)
    }

    /// Reads `page_id` and checks that the slot still holds it.
    pub fn read_page(&self, page_id: i64) -> Result<LogPage> {
        let page = self.read_page_raw(page_id)?;
        page.verify(page_id)?;
        Ok(page)
    }

    /// Reads `count` consecutive logical pages starting at `first` into `dst`.
    ///
    /// The range may wrap around the end of the ring.
    pub fn read_pages(&self, first: i64, count: usize, dst: &mut [u8]) -> Result<()> {
        if dst.len() != count * self.page_size {
            return Err(LogError::Invalid("read_pages buffer size mismatch"));
        }
        let mut done = 0usize;
        while done < count {
            let page_id = first + done as i64;
            let slot = self.slot(page_id)?;
            let until_wrap = (self.capacity - slot.0) as usize;
            let run = until_wrap.min(count - done);
            let start = done * self.page_size;
            let end = start + run * self.page_size;
            self.io
                .read_at(slot.file_offset(self.page_size), &mut dst[start..end])?;
            done += run;
        }
        Ok(())
    }

    /// Writes pages for consecutive logical ids, one vectored call per contiguous slot run.
    pub fn write_pages(&self, first: i64, pages: &[&[u8]]) -> Result<usize> {
        let mut calls = 0usize;
        let mut done = 0usize;
        while done < pages.len() {
            let slot = self.slot(first + done as i64)?;
            let until_wrap = (self.capacity - slot.0) as usize;
            let run = until_wrap.min(pages.len() - done).min(MAX_IO_SLICES);
            let slices: Vec<IoSlice<'_>> = pages[done..done + run]
                .iter()
                .map(|page| IoSlice::new(page))
                .collect();
            self.io.write_vectored_at(slot.file_offset(self.page_size), &slices)?;
            calls += 1;
            done += run;
        }
        Ok(calls)
    }

    /// Makes written pages and the header durable; the file length never changes after formatting.
    pub fn sync(&self) -> Result<()> {
        self.io.sync_data()
    }
}

/// A single immutable archive volume.
pub struct ArchiveVolume {
    io: Arc<dyn FileIo>,
    header: ArchiveHeader,
}

impl ArchiveVolume {
    /// Opens an archive, mapping a missing file to `ArchiveUnavailable`.
    pub fn open(path: impl AsRef<Path>, num: ArchiveNumber, page_size: usize) -> Result<Self> {
        let io = match DiskFile::open_read_only(path.as_ref()) {
            Ok(io) => io,
            Err(LogError::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(LogError::ArchiveUnavailable(num));
            }
            Err(err) => return Err(err),
        };
        let mut page0 = vec![0u8; page_size];
        io.read_at(0, &mut page0)?;
        let header = ArchiveHeader::decode(&page0)?;
        if header.archive_number != num {
            return Err(LogError::Corruption("archive number mismatch"));
        }
        Ok(Self {
            io: Arc::new(io),
            header,
        })
    }

    /// Decoded archive header.
    pub fn header(&self) -> &ArchiveHeader {
        &self.header
    }

    /// Reads an archived page; `NotFound` outside the archive's range.
    pub fn read_page(&self, page_id: i64) -> Result<LogPage> {
        if !self.header.contains(page_id) {
            return Err(LogError::NotFound);
        }
        let page_size = self.header.page_size as usize;
        let index = (page_id - self.header.first_page_id) as u64 + 1;
        let mut buf = vec![0u8; page_size].into_boxed_slice();
        self.io.read_at(index * page_size as u64, &mut buf)?;
        let page = LogPage::from_bytes(buf)?;
        page.verify(page_id)?;
        Ok(page)
    }
}
