#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::log::header::{unix_now, ArchiveHeader, LogHeader};
use crate::log::page::LogPage;
use crate::log::volume::{ActiveVolume, ArchiveVolume, VolumePaths};
use crate::primitives::io::{DiskFile, FileIo};
use crate::stats::LogStats;
use crate::types::{ArchiveNumber, LogError, Lsa, Result};

/// Entries kept in the in-memory lookup ring.
const RECENT_ARCHIVES: usize = 16;
const BACKGROUND_POLL: Duration = Duration::from_millis(200);

/// One archive volume and the logical pages it holds.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct ArchiveEntry {
    /// Archive number, also the file suffix.
    pub number: i32,
    /// First logical page in the archive.
    pub first_page_id: i64,
    /// Last logical page in the archive.
    pub last_page_id: i64,
    /// File name relative to the log directory.
    pub file: String,
}

impl ArchiveEntry {
    fn contains(&self, page_id: i64) -> bool {
        page_id >= self.first_page_id && page_id <= self.last_page_id
    }
}

/// Event kinds recorded in the log-information file.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum InfoEvent {
    Archive,
    Remove,
}

impl InfoEvent {
    fn as_str(self) -> &'static str {
        match self {
            InfoEvent::Archive => "ARCHIVE",
            InfoEvent::Remove => "REMOVE",
        }
    }
}

fn parse_info_line(line: &str) -> Option<(InfoEvent, ArchiveEntry)> {
    let mut parts = line.split_whitespace();
    let _timestamp = parts.next()?;
    let event = match parts.next()? {
        "ARCHIVE" => InfoEvent::Archive,
        "REMOVE" => InfoEvent::Remove,
        _ => return None,
    };
    let number = parts.next()?.parse().ok()?;
    let (first, last) = parts.next()?.split_once("..")?;
    let file = parts.next()?.to_string();
    Some((
        event,
        ArchiveEntry {
            number,
            first_page_id: first.parse().ok()?,
            last_page_id: last.parse().ok()?,
            file,
        },
    ))
}

/// Trailing copy of the active log kept by the background archiver.
struct BackgroundVolume {
    io: DiskFile,
    first_page_id: i64,
    next_page_id: i64,
}

struct ArchiverState {
    recent: VecDeque<ArchiveEntry>,
    background: Option<BackgroundVolume>,
    recovery_low_page: i64,
}

#[derive(Default)]
struct BackgroundSignal {
    durable: Option<Lsa>,
    shutdown: bool,
}

/// Archive behaviour knobs taken from the engine configuration.
#[derive(Copy, Clone, Debug)]
pub struct ArchiverOptions {
    /// Pages read from the active volume per copy step.
    pub io_pages: usize,
    /// Archives to keep on disk; 0 keeps everything.
    pub max_archives: usize,
    /// Maintain a trailing volume between archives.
    pub background: bool,
}

/// Moves completed ranges of the active log into numbered archive volumes.
pub struct Archiver {
    paths: VolumePaths,
    volume: Arc<ActiveVolume>,
    header: Arc<Mutex<LogHeader>>,
    options: ArchiverOptions,
    state: Mutex<ArchiverState>,
    signal: Mutex<BackgroundSignal>,
    signal_cv: Condvar,
    stats: Arc<LogStats>,
}

impl Archiver {
    /// Opens the archiver; creates the trailing volume when background archiving is on.
    pub fn new(
        paths: VolumePaths,
        volume: Arc<ActiveVolume>,
        header: Arc<Mutex<LogHeader>>,
        options: ArchiverOptions,
        stats: Arc<LogStats>,
    ) -> Result<Self> {
        let (next_page, recovery_low_page) = {
            let header = header.lock();
            let low = if header.redo_lsa.is_null() {
                0
            } else {
                header.redo_lsa.page_id
            };
            (header.next_archive_page_id, low)
        };
        let background = if options.background {
            Some(Self::create_background(&paths, next_page)?)
        } else {
            None
        };
        Ok(Self {
            paths,
            volume,
            header,
            options: ArchiverOptions {
                io_pages: options.io_pages.max(1),
                ..options
            },
            state: Mutex::new(ArchiverState {
                recent: VecDeque::with_capacity(RECENT_ARCHIVES),
                background,
                recovery_low_page,
            }),
            signal: Mutex::new(BackgroundSignal::default()),
            signal_cv: Condvar::new(),
            stats,
        })
    }

    fn create_background(paths: &VolumePaths, first_page_id: i64) -> Result<BackgroundVolume> {
        let io = DiskFile::create(paths.background_archive())?;
        Ok(BackgroundVolume {
            io,
            first_page_id,
            next_page_id: first_page_id,
        })
    }

    /// First logical page that has not been archived yet.
    pub fn next_archive_page_id(&self) -> i64 {
        self.header.lock().next_archive_page_id
    }

    /// Whether placing `page_id` in the ring would overwrite an unarchived page.
    pub fn needs_archive(&self, page_id: i64) -> bool {
        page_id - self.next_archive_page_id() >= self.volume.capacity() as i64
    }

    /// Archives every page from the next unarchived page through `last_page_id`.
    ///
    /// The caller must have flushed and synced all pages in the range.
    pub fn archive_through(
        &self,
        last_page_id: i64,
        consumer_floor: Option<i64>,
    ) -> Result<Option<ArchiveEntry>> {
        let mut state = self.state.lock();
        let (first, num, next_trid) = {
            let header = self.header.lock();
            (
                header.next_archive_page_id,
                ArchiveNumber(header.next_archive_num),
                header.next_trid,
            )
        };
        if last_page_id < first {
            return Ok(None);
        }
        let page_size = self.volume.page_size();
        let page_count = (last_page_id - first + 1) as i32;
        let archive_header = ArchiveHeader {
            creation_time: unix_now(),
            next_trid,
            first_page_id: first,
            page_count,
            archive_number: num,
            page_size: page_size as u32,
        };
        let final_path = self.paths.archive(num);
        let from_background = matches!(&state.background, Some(bg) if bg.first_page_id == first);
        match state.background.take() {
            Some(bg) if from_background => {
                let copy_from = bg.next_page_id.min(last_page_id + 1);
                self.copy_pages(&bg.io, first, copy_from, last_page_id)?;
                bg.io
                    .set_len((page_count as u64 + 1) * page_size as u64)?;
                bg.io.write_at(0, &archive_header.encode_page(page_size))?;
                bg.io.sync_all()?;
                drop(bg);
                fs::rename(self.paths.background_archive(), &final_path)?;
                debug!(
                    archive = num.0,
                    pages_from_background = copy_from - first,
                    "log.archive.background_finalize"
                );
            }
            _ => {
                let tmp_path = self.paths.archive_tmp(num);
                let io = DiskFile::create(&tmp_path)?;
                io.write_at(0, &archive_header.encode_page(page_size))?;
                self.copy_pages(&io, first, first, last_page_id)?;
                io.sync_all()?;
                fs::rename(&tmp_path, &final_path)?;
            }
        }
        if self.options.background {
            state.background = Some(Self::create_background(&self.paths, last_page_id + 1)?);
        }

        {
            let mut header = self.header.lock();
            header.next_archive_page_id = last_page_id + 1;
            header.next_archive_num = num.0 + 1;
            self.volume.write_header(&header)?;
            self.volume.sync()?;
        }

        let entry = ArchiveEntry {
            number: num.0,
            first_page_id: first,
            last_page_id,
            file: self.paths.archive_file_name(num),
        };
        self.append_info(InfoEvent::Archive, &entry)?;
        if state.recent.len() == RECENT_ARCHIVES {
            state.recent.pop_front();
        }
        state.recent.push_back(entry.clone());
        LogStats::bump(&self.stats.archives_created);
        info!(
            archive = num.0,
            first_page = first,
            last_page = last_page_id,
            "log.archive.created"
        );
        self.retain_locked(&mut state, consumer_floor)?;
        Ok(Some(entry))
    }

    /// Copies pages `[from, last]` of an archive whose first page is `first`.
    fn copy_pages(&self, dst: &dyn FileIo, first: i64, from: i64, last: i64) -> Result<()> {
        let page_size = self.volume.page_size();
        let mut page_id = from;
        let mut buf = Vec::new();
        while page_id <= last {
            let count = ((last - page_id + 1) as usize).min(self.options.io_pages);
            buf.resize(count * page_size, 0);
            self.volume.read_pages(page_id, count, &mut buf)?;
            for (i, chunk) in buf.chunks(page_size).enumerate() {
                let page = LogPage::from_bytes(chunk.to_vec().into_boxed_slice())?;
                page.verify(page_id + i as i64)?;
            }
            let offset = (page_id - first + 1) as u64 * page_size as u64;
            dst.write_at(offset, &buf)?;
            page_id += count as i64;
        }
        Ok(())
    }

    fn append_info(&self, event: InfoEvent, entry: &ArchiveEntry) -> Result<()> {
        let timestamp = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_else(|_| unix_now().to_string());
        let line = format!(
            "{timestamp} {} {} {}..{} {}\n",
            event.as_str(),
            entry.number,
            entry.first_page_id,
            entry.last_page_id,
            entry.file
        );
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.paths.log_info())?;
        file.write_all(line.as_bytes())?;
        file.sync_data()?;
        Ok(())
    }

    /// Records the oldest page crash recovery still needs.
    pub fn set_recovery_low_page(&self, page_id: i64) {
        let mut state = self.state.lock();
        state.recovery_low_page = state.recovery_low_page.max(page_id);
    }

    /// Removes archives beyond the retention limit that nobody still needs.
    pub fn apply_retention(&self, consumer_floor: Option<i64>) -> Result<Vec<ArchiveNumber>> {
        let mut state = self.state.lock();
        self.retain_locked(&mut state, consumer_floor)
    }

    fn retain_locked(
        &self,
        state: &mut ArchiverState,
        consumer_floor: Option<i64>,
    ) -> Result<Vec<ArchiveNumber>> {
        let mut removed = Vec::new();
        if self.options.max_archives == 0 {
            return Ok(removed);
        }
        let floor = consumer_floor
            .map_or(state.recovery_low_page, |c| c.min(state.recovery_low_page));
        loop {
            let (lowest, next) = {
                let header = self.header.lock();
                (header.lowest_archive_num, header.next_archive_num)
            };
            if ((next - lowest) as usize) <= self.options.max_archives {
                break;
            }
            let num = ArchiveNumber(lowest);
            let entry = match self.entry_for_number(state, num) {
                Ok(entry) => Some(entry),
                Err(LogError::ArchiveUnavailable(_)) => None,
                Err(err) => return Err(err),
            };
            if let Some(entry) = &entry {
                if entry.last_page_id >= floor {
                    LogStats::bump(&self.stats.archive_removals_deferred);
                    debug!(
                        archive = num.0,
                        last_page = entry.last_page_id,
                        floor,
                        "log.archive.retention_deferred"
                    );
                    break;
                }
                match fs::remove_file(self.paths.archive(num)) {
                    Ok(()) => {}
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => return Err(err.into()),
                }
                self.append_info(InfoEvent::Remove, entry)?;
            }
            {
                let mut header = self.header.lock();
                header.lowest_archive_num = lowest + 1;
                self.volume.write_header(&header)?;
                self.volume.sync()?;
            }
            state.recent.retain(|e| e.number != num.0);
            LogStats::bump(&self.stats.archives_removed);
            info!(archive = num.0, "log.archive.removed");
            removed.push(num);
        }
        Ok(removed)
    }

    fn entry_for_number(&self, state: &ArchiverState, num: ArchiveNumber) -> Result<ArchiveEntry> {
        if let Some(entry) = state.recent.iter().find(|e| e.number == num.0) {
            return Ok(entry.clone());
        }
        let archive = ArchiveVolume::open(self.paths.archive(num), num, self.volume.page_size())?;
        let header = archive.header();
        Ok(ArchiveEntry {
            number: num.0,
            first_page_id: header.first_page_id,
            last_page_id: header.last_page_id(),
            file: self.paths.archive_file_name(num),
        })
    }

    /// Finds the archive holding `page_id`: recent ring, then the info file, then headers.
    pub fn get_archive_number_for(&self, page_id: i64) -> Result<ArchiveNumber> {
        let (next_page, lowest, next_num) = {
            let header = self.header.lock();
            (
                header.next_archive_page_id,
                header.lowest_archive_num,
                header.next_archive_num,
            )
        };
        if page_id < 0 || page_id >= next_page {
            return Err(LogError::NotFound);
        }
        let state = self.state.lock();
        if let Some(entry) = state.recent.iter().find(|e| e.contains(page_id)) {
            return Ok(ArchiveNumber(entry.number));
        }
        if let Some(num) = self.scan_info_for(page_id)? {
            if num.0 < lowest {
                return Err(LogError::ArchiveUnavailable(num));
            }
            return Ok(num);
        }
        for n in (lowest..next_num).rev() {
            match self.entry_for_number(&state, ArchiveNumber(n)) {
                Ok(entry) if entry.contains(page_id) => return Ok(ArchiveNumber(n)),
                Ok(_) | Err(LogError::ArchiveUnavailable(_)) => continue,
                Err(err) => return Err(err),
            }
        }
        Err(LogError::NotFound)
    }

    fn scan_info_for(&self, page_id: i64) -> Result<Option<ArchiveNumber>> {
        let contents = match fs::read_to_string(self.paths.log_info()) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let found = contents
            .lines()
            .filter_map(parse_info_line)
            .filter(|(event, entry)| *event == InfoEvent::Archive && entry.contains(page_id))
            .map(|(_, entry)| ArchiveNumber(entry.number))
            .last();
        Ok(found)
    }

    /// Reads an archived page.
    pub fn read_page(&self, page_id: i64) -> Result<LogPage> {
        let num = self.get_archive_number_for(page_id)?;
        let archive = ArchiveVolume::open(self.paths.archive(num), num, self.volume.page_size())?;
        archive.read_page(page_id)
    }

    /// Archives currently on disk, oldest first.
    pub fn list(&self) -> Result<Vec<ArchiveEntry>> {
        let (lowest, next) = {
            let header = self.header.lock();
            (header.lowest_archive_num, header.next_archive_num)
        };
        let state = self.state.lock();
        let mut entries = Vec::new();
        for n in lowest..next {
            match self.entry_for_number(&state, ArchiveNumber(n)) {
                Ok(entry) => entries.push(entry),
                Err(LogError::ArchiveUnavailable(_)) => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(entries)
    }

    /// Wakes the background copier after the durable watermark moved.
    pub fn notify_durable(&self, durable: Lsa) {
        if !self.options.background {
            return;
        }
        let mut signal = self.signal.lock();
        signal.durable = Some(durable);
        self.signal_cv.notify_one();
    }

    /// Starts the background copier thread, if enabled.
    pub fn spawn_background(self: &Arc<Self>) -> std::io::Result<Option<JoinHandle<()>>> {
        if !self.options.background {
            return Ok(None);
        }
        let archiver = Arc::clone(self);
        thread::Builder::new()
            .name("arclog-archiver".into())
            .spawn(move || archiver.background_loop())
            .map(Some)
    }

    /// Asks the background copier to exit.
    pub fn stop_background(&self) {
        let mut signal = self.signal.lock();
        signal.shutdown = true;
        self.signal_cv.notify_all();
    }

    fn background_loop(&self) {
        debug!("log.archive.background_start");
        loop {
            let durable = {
                let mut signal = self.signal.lock();
                if signal.durable.is_none() && !signal.shutdown {
                    self.signal_cv.wait_for(&mut signal, BACKGROUND_POLL);
                }
                if signal.shutdown {
                    break;
                }
                signal.durable.take()
            };
            let Some(durable) = durable else { continue };
            if let Err(err) = self.copy_background(durable.page_id - 1) {
                self.abandon_background(&err);
            }
        }
        debug!("log.archive.background_exit");
    }

    /// Drops the trailing volume; the next archive is copied from the active
    /// log and a fresh trailing volume starts after it.
    fn abandon_background(&self, err: &LogError) {
        warn!(error = %err, "log.archive.background_copy_failed");
        self.state.lock().background = None;
    }

    /// Extends the trailing volume through `last_complete_page`.
    fn copy_background(&self, last_complete_page: i64) -> Result<()> {
        let mut state = self.state.lock();
        let Some(bg) = state.background.as_mut() else {
            return Ok(());
        };
        if last_complete_page < bg.next_page_id {
            return Ok(());
        }
        self.copy_pages(&bg.io, bg.first_page_id, bg.next_page_id, last_complete_page)?;
        debug!(
            from = bg.next_page_id,
            to = last_complete_page,
            "log.archive.background_copy"
        );
        bg.next_page_id = last_complete_page + 1;
        Ok(())
    }

    /// Pages already copied into the trailing volume, if background archiving is on.
    pub fn background_progress(&self) -> Option<(i64, i64)> {
        let state = self.state.lock();
        state
            .background
            .as_ref()
            .map(|bg| (bg.first_page_id, bg.next_page_id))
    }
}
