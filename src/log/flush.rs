#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, trace};

use crate::log::archive::{ArchiveEntry, Archiver};
use crate::log::buffer_pool::{BufferHandle, BufferPool, BufferRef, FixMode};
use crate::log::checkpoint::{CheckpointTrigger, FatalSink};
use crate::log::header::LogHeader;
use crate::log::page::LogPage;
use crate::log::prior::{AppendPipeline, PriorNode};
use crate::log::record::{LogRecordHeader, RecordLayout, LOG_RECORD_HDR_LEN};
use crate::log::volume::ActiveVolume;
use crate::log::writer::LogWriterHub;
use crate::stats::LogStats;
use crate::types::{LogError, Lsa, Result};

/// Typed reason a waiter woke up.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Wakeup {
    /// The condition being waited for holds.
    Resumed,
    /// The wait bound elapsed first.
    TimedOut,
    /// Shutdown or an interrupt ended the wait.
    Interrupted,
}

struct WatermarkState {
    lsa: Lsa,
    failure: Option<(&'static str, Lsa, String)>,
}

/// The durable LSA: every record strictly below it is written and synced.
pub struct DurableWatermark {
    state: Mutex<WatermarkState>,
    cv: Condvar,
}

impl DurableWatermark {
    /// Watermark starting at `initial`.
    pub fn new(initial: Lsa) -> Self {
        Self {
            state: Mutex::new(WatermarkState {
                lsa: initial,
                failure: None,
            }),
            cv: Condvar::new(),
        }
    }

    /// Current durable LSA.
    pub fn get(&self) -> Lsa {
        self.state.lock().lsa
    }

    /// Moves the watermark forward; smaller values are ignored.
    pub fn advance(&self, lsa: Lsa) -> bool {
        let mut state = self.state.lock();
        if lsa <= state.lsa {
            return false;
        }
        state.lsa = lsa;
        self.cv.notify_all();
        true
    }

    /// Latches a fatal failure and wakes every waiter.
    pub fn fail(&self, component: &'static str, lsa: Lsa, reason: String) {
        let mut state = self.state.lock();
        if state.failure.is_none() {
            state.failure = Some((component, lsa, reason));
        }
        self.cv.notify_all();
    }

    /// The latched failure as an error, if any.
    pub fn failure(&self) -> Option<LogError> {
        let state = self.state.lock();
        state
            .failure
            .as_ref()
            .map(|(component, lsa, reason)| LogError::Fatal {
                component,
                lsa: *lsa,
                reason: reason.clone(),
            })
    }

    /// Waits until the record at `lsa` is durable or `timeout` elapses.
    pub fn wait_past(&self, lsa: Lsa, timeout: Option<Duration>) -> Result<Wakeup> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        loop {
            if let Some((component, at, reason)) = state.failure.as_ref() {
                return Err(LogError::Fatal {
                    component,
                    lsa: *at,
                    reason: reason.clone(),
                });
            }
            if state.lsa > lsa {
                return Ok(Wakeup::Resumed);
            }
            match deadline {
                Some(deadline) => {
                    if self.cv.wait_until(&mut state, deadline).timed_out() && state.lsa <= lsa {
                        return Ok(Wakeup::TimedOut);
                    }
                }
                None => self.cv.wait(&mut state),
            }
        }
    }
}

/// Pages waiting to be written, in append order.
pub(crate) struct FlushInfo {
    pages: Vec<BufferRef>,
}

impl FlushInfo {
    fn new() -> Self {
        Self { pages: Vec::new() }
    }

    fn contains(&self, page_id: i64) -> bool {
        self.pages.iter().any(|p| p.page_id() == page_id)
    }
}

/// Physical append position; guarded by the append mutex.
pub(crate) struct AppendState {
    current: Option<BufferHandle>,
    /// Header page of a record whose data is still being copied onto later
    /// pages; stays pinned until the record is complete.
    record_head: Option<BufferHandle>,
    /// End of the last record copied into the pool.
    next_lsa: Lsa,
    prev_lsa: Lsa,
    highest_page: i64,
    flush_info: FlushInfo,
    /// End of the last record handed to the volume, synced or not.
    written_lsa: Lsa,
    pages_since_checkpoint: u64,
}

struct GroupCommitState {
    requested: bool,
    daemon_running: bool,
    shutdown: bool,
}

/// Flush behaviour knobs taken from the engine configuration.
#[derive(Copy, Clone, Debug)]
pub struct FlushOptions {
    /// Batch commit flushes on the daemon.
    pub group_commit: bool,
    /// Daemon wake-up period.
    pub group_commit_interval: Duration,
    /// Sync every n-th non-critical flush.
    pub fsync_sample: u64,
    /// Appended pages between checkpoint requests; 0 disables.
    pub checkpoint_interval_pages: u64,
}

/// Moves records from the prior list into pages and pages onto disk.
pub struct FlushCoordinator {
    append: Mutex<AppendState>,
    prior: Arc<AppendPipeline>,
    pool: Arc<BufferPool>,
    volume: Arc<ActiveVolume>,
    header: Arc<Mutex<LogHeader>>,
    archiver: Arc<Archiver>,
    writers: Arc<LogWriterHub>,
    watermark: Arc<DurableWatermark>,
    checkpoint_trigger: Arc<CheckpointTrigger>,
    fatal_sink: Arc<dyn FatalSink>,
    layout: RecordLayout,
    options: FlushOptions,
    non_critical_flushes: AtomicU64,
    group: Mutex<GroupCommitState>,
    group_cv: Condvar,
    stats: Arc<LogStats>,
}

/// Shared components a [`FlushCoordinator`] drives.
pub struct FlushParts {
    /// Records waiting to be copied into pages.
    pub prior: Arc<AppendPipeline>,
    /// Page cache the records are copied into.
    pub pool: Arc<BufferPool>,
    /// Destination of page writes.
    pub volume: Arc<ActiveVolume>,
    /// Shared header updated with the append LSA.
    pub header: Arc<Mutex<LogHeader>>,
    /// Archives pages before their slots are reused.
    pub archiver: Arc<Archiver>,
    /// Sync consumers the flush path waits for.
    pub writers: Arc<LogWriterHub>,
    /// Advanced after each synced flush.
    pub watermark: Arc<DurableWatermark>,
    /// Raised every `checkpoint_interval_pages` pages.
    pub checkpoint_trigger: Arc<CheckpointTrigger>,
    /// Receives write and sync failures.
    pub fatal_sink: Arc<dyn FatalSink>,
    /// Engine counters.
    pub stats: Arc<LogStats>,
}

impl FlushCoordinator {
    /// Resumes appending at `end`, the first free LSA found by recovery.
    pub fn open(parts: FlushParts, options: FlushOptions, end: Lsa, prev: Lsa) -> Result<Self> {
        let layout = *parts.prior.layout();
        let mode = if end.offset > 0 {
            FixMode::Existing
        } else {
            FixMode::New
        };
        let current = match parts.pool.fix(end.page_id, mode) {
            Ok(handle) => handle,
            Err(LogError::PageMismatch { .. } | LogError::Corruption(_))
                if mode == FixMode::Existing =>
            {
                return Err(LogError::Corruption("log end page unreadable after recovery"));
            }
            Err(err) => return Err(err),
        };
        {
            let mut page = current.write();
            page.truncate_body(end.offset as usize);
        }
        Ok(Self {
            append: Mutex::new(AppendState {
                current: Some(current),
                record_head: None,
                next_lsa: end,
                prev_lsa: prev,
                highest_page: end.page_id,
                flush_info: FlushInfo::new(),
                written_lsa: end,
                pages_since_checkpoint: 0,
            }),
            prior: parts.prior,
            pool: parts.pool,
            volume: parts.volume,
            header: parts.header,
            archiver: parts.archiver,
            writers: parts.writers,
            watermark: parts.watermark,
            checkpoint_trigger: parts.checkpoint_trigger,
            fatal_sink: parts.fatal_sink,
            layout,
            options: FlushOptions {
                fsync_sample: options.fsync_sample.max(1),
                ..options
            },
            non_critical_flushes: AtomicU64::new(0),
            group: Mutex::new(GroupCommitState {
                requested: false,
                daemon_running: false,
                shutdown: false,
            }),
            group_cv: Condvar::new(),
            stats: parts.stats,
        })
    }

    /// The durable watermark this coordinator advances.
    pub fn watermark(&self) -> &Arc<DurableWatermark> {
        &self.watermark
    }

    /// End of the last record physically present in the pool.
    pub fn appended_lsa(&self) -> Lsa {
        self.append.lock().next_lsa
    }

    fn check_failed(&self) -> Result<()> {
        match self.watermark.failure() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn fatal(&self, component: &'static str, lsa: Lsa, err: LogError) -> LogError {
        if err.is_fatal() {
            return err;
        }
        let fatal = err.into_fatal(component, lsa);
        if let LogError::Fatal { reason, .. } = &fatal {
            error!(component, %lsa, reason = %reason, "log.fatal");
            self.fatal_sink.report_fatal(component, lsa, reason);
            self.watermark.fail(component, lsa, reason.clone());
        }
        fatal
    }

    /// Copies every pending prior node into pool pages.
    pub fn drain(&self) -> Result<()> {
        self.check_failed()?;
        let mut state = self.append.lock();
        self.drain_locked(&mut state)
    }

    fn drain_locked(&self, state: &mut AppendState) -> Result<()> {
        let mut nodes = self.prior.take_pending();
        if nodes.is_empty() {
            return Ok(());
        }
        trace!(nodes = nodes.len(), "log.append.drain");
        while let Some(node) = nodes.pop_front() {
            if let Err(err) = self.copy_node(state, &node) {
                if matches!(err, LogError::OutOfBuffers { .. }) {
                    nodes.push_front(node);
                    self.prior.requeue_front(nodes);
                    return Err(err);
                }
                return Err(self.fatal("append", node.lsa, err));
            }
        }
        Ok(())
    }

    fn copy_node(&self, state: &mut AppendState, node: &PriorNode) -> Result<()> {
        if node.lsa != state.next_lsa {
            return Err(LogError::Corruption("prior list out of order"));
        }
        // A node requeued after OutOfBuffers is copied again from its header.
        self.release_record_head(state);
        let forw = node.header.forw_lsa;
        if self.archiver.needs_archive(forw.page_id) {
            self.archive_locked(state)?;
        }
        if state.current.as_ref().map(BufferHandle::page_id) != Some(node.lsa.page_id) {
            self.advance_page(state, node.lsa.page_id)?;
        }

        let body_len = self.layout.body_len();
        let mut offset = node.lsa.offset as usize;
        {
            let current = self.current(state)?;
            let mut page = current.write();
            page.note_record_start(node.lsa.offset);
            page.body_mut()[offset..offset + LOG_RECORD_HDR_LEN]
                .copy_from_slice(&node.header.encode());
        }
        offset += LOG_RECORD_HDR_LEN;
        self.touch_current(state)?;

        let mut remaining: &[u8] = &node.data;
        let mut page_id = node.lsa.page_id;
        while !remaining.is_empty() {
            if offset == body_len {
                if state.record_head.is_none() {
                    state.record_head = state.current.take();
                }
                page_id += 1;
                self.advance_page(state, page_id)?;
                self.current(state)?.write().mark_continuation();
                offset = 0;
            }
            let n = remaining.len().min(body_len - offset);
            {
                let current = self.current(state)?;
                let mut page = current.write();
                page.body_mut()[offset..offset + n].copy_from_slice(&remaining[..n]);
            }
            self.touch_current(state)?;
            remaining = &remaining[n..];
            offset += n;
        }

        // Published only once every byte is in the pool, so a flush never
        // claims a partially copied record.
        state.prev_lsa = node.lsa;
        state.next_lsa = forw;
        self.release_record_head(state);
        LogStats::bump(&self.stats.records_appended);
        LogStats::add(&self.stats.bytes_appended, node.total_len() as u64);
        Ok(())
    }

    fn release_record_head(&self, state: &mut AppendState) {
        if let Some(head) = state.record_head.take() {
            self.pool.unfix(head);
        }
    }

    fn current<'a>(&self, state: &'a AppendState) -> Result<&'a BufferHandle> {
        state
            .current
            .as_ref()
            .ok_or(LogError::Corruption("no current append page"))
    }

    /// Marks the current page dirty and queues it for the next flush.
    fn touch_current(&self, state: &mut AppendState) -> Result<()> {
        let current = self.current(state)?;
        self.pool.set_dirty(current);
        let page_id = current.page_id();
        if !state.flush_info.contains(page_id) {
            let page_ref = current.as_ref();
            state.flush_info.pages.push(page_ref);
        }
        Ok(())
    }

    fn advance_page(&self, state: &mut AppendState, page_id: i64) -> Result<()> {
        if let Some(old) = state.current.take() {
            self.pool.unfix(old);
        }
        if state.flush_info.pages.len() + 1 >= self.pool.capacity() {
            self.flush_locked(state, false)?;
        }
        let mode = if page_id <= state.highest_page {
            FixMode::Existing
        } else {
            FixMode::New
        };
        let handle = self.pool.fix_with(page_id, mode, &mut || {
            self.flush_locked(state, false).map(|_| ())
        })?;
        state.current = Some(handle);
        if page_id > state.highest_page {
            state.highest_page = page_id;
            state.pages_since_checkpoint += 1;
            let threshold = self.options.checkpoint_interval_pages;
            if threshold > 0 && state.pages_since_checkpoint >= threshold {
                state.pages_since_checkpoint = 0;
                self.checkpoint_trigger.request();
            }
            self.touch_current(state)?;
        }
        Ok(())
    }

    /// Archives every completed page so the ring can take new pages.
    fn archive_locked(&self, state: &mut AppendState) -> Result<()> {
        self.flush_locked(state, true)?;
        let last_complete = state.next_lsa.page_id - 1;
        let floor = self.writers.min_needed_page();
        self.archiver.archive_through(last_complete, floor)?;
        Ok(())
    }

    /// Drains, flushes, and archives every completed page.
    pub fn archive_now(&self) -> Result<Option<ArchiveEntry>> {
        self.check_failed()?;
        let mut state = self.append.lock();
        self.drain_locked(&mut state)?;
        let lsa = state.next_lsa;
        self.flush_locked(&mut state, true)
            .map_err(|err| self.fatal("flush", lsa, err))?;
        let last_complete = state.next_lsa.page_id - 1;
        let floor = self.writers.min_needed_page();
        self.archiver.archive_through(last_complete, floor)
    }

    /// Writes every dirty page, then syncs when the flush is critical or sampled.
    ///
    /// The page holding `next_lsa` gets an end-of-log sentinel in its written
    /// image. Returns the durable watermark after the flush.
    fn flush_locked(&self, state: &mut AppendState, critical: bool) -> Result<Lsa> {
        let target = state.next_lsa;
        let has_pages = !state.flush_info.pages.is_empty();
        let durable = self.watermark.get();
        if !has_pages && state.written_lsa == target && durable >= target {
            return Ok(durable);
        }
        let sync = critical || {
            let n = self.non_critical_flushes.fetch_add(1, Ordering::Relaxed) + 1;
            n % self.options.fsync_sample == 0
        };

        let refs = std::mem::take(&mut state.flush_info.pages);
        let sentinel = LogRecordHeader::end_of_log(state.prev_lsa).encode();
        let stamp = |image: &mut LogPage| {
            let offset = target.offset as usize;
            image.body_mut()[offset..offset + LOG_RECORD_HDR_LEN].copy_from_slice(&sentinel);
            image.seal();
        };
        let mut images: Vec<(i64, LogPage)> = refs
            .iter()
            .map(|r| {
                let mut image = r.read().clone();
                if r.page_id() == target.page_id {
                    stamp(&mut image);
                } else {
                    image.seal();
                }
                (r.page_id(), image)
            })
            .collect();
        // The next record starts on a page nothing was copied to yet; write
        // that page too so the sentinel the header points at exists on disk.
        if target.offset == 0
            && target.page_id > state.highest_page
            && !refs.iter().any(|r| r.page_id() == target.page_id)
        {
            let mut fresh = LogPage::new(target.page_id, self.volume.page_size());
            stamp(&mut fresh);
            images.push((target.page_id, fresh));
        }

        if !images.is_empty() {
            self.pool.mark_flushing(&refs, true);
            let written = self.write_images(&images);
            self.pool.mark_flushing(&refs, false);
            if let Err(err) = written {
                return Err(self.fatal("flush", target, err));
            }
            self.pool.mark_clean(&refs);
            if let Some(head) = state.record_head.as_ref() {
                if refs.iter().any(|r| r.page_id() == head.page_id()) {
                    // Disk holds the sentinel where memory holds the open record's header.
                    self.pool.set_dirty(head);
                    state.flush_info.pages.push(head.as_ref());
                }
            }
            LogStats::bump(&self.stats.flushes);
            LogStats::add(&self.stats.pages_written, images.len() as u64);
        }
        state.written_lsa = target;

        {
            let mut header = self.header.lock();
            header.append_lsa = target;
            header.eof_lsa = target;
            if let Err(err) = self.volume.write_header(&header) {
                drop(header);
                return Err(self.fatal("flush", target, err));
            }
        }
        if !sync {
            LogStats::bump(&self.stats.fsyncs_skipped);
            return Ok(durable);
        }
        if let Err(err) = self.volume.sync() {
            return Err(self.fatal("flush", target, err));
        }
        LogStats::bump(&self.stats.fsyncs);
        if self.watermark.advance(target) {
            debug!(durable = %target, critical, "log.flush.durable");
            self.writers.notify_durable();
            self.archiver.notify_durable(target);
        }
        Ok(target)
    }

    /// Writes pages after the first as contiguous runs, then the first page,
    /// which links the earlier log to them.
    fn write_images(&self, images: &[(i64, LogPage)]) -> Result<()> {
        let Some(((first_id, first), rest)) = images.split_first() else {
            return Ok(());
        };
        let mut start = 0;
        while start < rest.len() {
            let mut end = start + 1;
            while end < rest.len() && rest[end].0 == rest[end - 1].0 + 1 {
                end += 1;
            }
            let run: Vec<&[u8]> = rest[start..end].iter().map(|(_, p)| p.as_bytes()).collect();
            let calls = self.volume.write_pages(rest[start].0, &run)?;
            LogStats::add(&self.stats.write_calls, calls as u64);
            start = end;
        }
        self.volume.write_pages(*first_id, &[first.as_bytes()])?;
        LogStats::bump(&self.stats.write_calls);
        trace!(first = *first_id, pages = images.len(), "log.flush.write");
        Ok(())
    }

    /// Flushes every reserved record and blocks until it is durable.
    pub fn flush_direct(&self) -> Result<Lsa> {
        self.check_failed()?;
        let durable = {
            let mut state = self.append.lock();
            self.drain_locked(&mut state)?;
            let lsa = state.next_lsa;
            self.flush_locked(&mut state, true)
                .map_err(|err| self.fatal("flush", lsa, err))?
        };
        self.writers.wait_for_sync_consumers(durable);
        Ok(durable)
    }

    /// Waits until the record at `lsa` is durable, batching with other committers.
    pub fn request_flush(&self, lsa: Lsa) -> Result<()> {
        self.check_failed()?;
        if self.watermark.get() > lsa {
            return Ok(());
        }
        let daemon = {
            let mut group = self.group.lock();
            if self.options.group_commit && group.daemon_running && !group.shutdown {
                group.requested = true;
                self.group_cv.notify_one();
                true
            } else {
                false
            }
        };
        if daemon {
            let bound = self.options.group_commit_interval * 20 + Duration::from_millis(100);
            match self.watermark.wait_past(lsa, Some(bound))? {
                Wakeup::Resumed => return Ok(()),
                Wakeup::TimedOut | Wakeup::Interrupted => {
                    debug!(%lsa, "log.flush.group_commit_fallback");
                }
            }
        }
        self.flush_direct()?;
        if self.watermark.get() > lsa {
            Ok(())
        } else {
            Err(LogError::InvalidOwned(format!(
                "lsa {lsa} was never reserved"
            )))
        }
    }

    /// Starts the group-commit daemon when group commit is on.
    pub fn spawn_daemon(self: &Arc<Self>) -> std::io::Result<Option<JoinHandle<()>>> {
        if !self.options.group_commit {
            return Ok(None);
        }
        {
            let mut group = self.group.lock();
            if group.daemon_running {
                return Ok(None);
            }
            group.daemon_running = true;
            group.shutdown = false;
        }
        let coordinator = Arc::clone(self);
        thread::Builder::new()
            .name("arclog-flush".into())
            .spawn(move || coordinator.daemon_loop())
            .map(Some)
    }

    /// Asks the group-commit daemon to exit.
    pub fn stop_daemon(&self) {
        let mut group = self.group.lock();
        group.shutdown = true;
        self.group_cv.notify_all();
    }

    fn daemon_loop(&self) {
        debug!("log.flush.daemon_start");
        loop {
            {
                let mut group = self.group.lock();
                if !group.requested && !group.shutdown {
                    self.group_cv
                        .wait_for(&mut group, self.options.group_commit_interval);
                }
                if group.shutdown {
                    group.daemon_running = false;
                    break;
                }
                group.requested = false;
            }
            let pending = self.prior.has_pending() || self.watermark.get() < self.appended_lsa();
            if !pending {
                continue;
            }
            if let Err(err) = self.flush_direct() {
                error!(error = %err, "log.flush.daemon_failed");
                let mut group = self.group.lock();
                group.daemon_running = false;
                break;
            }
        }
        debug!("log.flush.daemon_exit");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::archive::ArchiverOptions;
    use crate::log::checkpoint::LoggingFatalSink;
    use crate::log::reader::DurablePageSource;
    use crate::log::record::{LogRecord, LogRecordType};
    use crate::log::volume::VolumePaths;
    use crate::log::writer::WriterOptions;
    use crate::types::NULL_LSA;
    use std::thread;
    use tempfile::{tempdir, TempDir};

    struct Rig {
        _dir: TempDir,
        prior: Arc<AppendPipeline>,
        pool: Arc<BufferPool>,
        volume: Arc<ActiveVolume>,
        flush: FlushCoordinator,
    }

    /// A coordinator over a fresh 1 KiB-page log with a fixed-size pool.
    fn rig(buffers: usize) -> Result<Rig> {
        let dir = tempdir()?;
        let paths = VolumePaths::new(dir.path(), "fl");
        let header = LogHeader::new("fl", 1024, 32)?;
        let volume = Arc::new(ActiveVolume::create(paths.active(), &header)?);
        let header = Arc::new(Mutex::new(header));
        let stats = Arc::new(LogStats::default());
        let archiver = Arc::new(Archiver::new(
            paths,
            Arc::clone(&volume),
            Arc::clone(&header),
            ArchiverOptions {
                io_pages: 8,
                max_archives: 0,
                background: false,
            },
            Arc::clone(&stats),
        )?);
        let watermark = Arc::new(DurableWatermark::new(Lsa::new(0, 0)));
        let writers = Arc::new(LogWriterHub::new(
            Arc::clone(&watermark),
            Arc::new(DurablePageSource::new(Arc::clone(&volume), Arc::clone(&archiver))),
            WriterOptions {
                async_poll: Duration::from_millis(10),
                sync_wait: Duration::from_millis(10),
                semi_sync_wait: Duration::from_millis(10),
                max_batch_pages: 4,
            },
            Arc::clone(&stats),
        ));
        let pool = Arc::new(BufferPool::new(
            Arc::clone(&volume),
            buffers,
            50,
            buffers,
            Arc::clone(&stats),
        )?);
        let prior = Arc::new(AppendPipeline::new(
            RecordLayout::new(1024)?,
            Lsa::new(0, 0),
            NULL_LSA,
            30,
            1 << 20,
        ));
        let flush = FlushCoordinator::open(
            FlushParts {
                prior: Arc::clone(&prior),
                pool: Arc::clone(&pool),
                volume: Arc::clone(&volume),
                header,
                archiver,
                writers,
                watermark,
                checkpoint_trigger: Arc::new(CheckpointTrigger::default()),
                fatal_sink: Arc::new(LoggingFatalSink),
                stats,
            },
            FlushOptions {
                group_commit: false,
                group_commit_interval: Duration::from_millis(5),
                fsync_sample: 1,
                checkpoint_interval_pages: 0,
            },
            Lsa::new(0, 0),
            NULL_LSA,
        )?;
        Ok(Rig {
            _dir: dir,
            prior,
            pool,
            volume,
            flush,
        })
    }

    #[test]
    fn out_of_buffers_mid_record_retries_from_the_header() -> Result<()> {
        let rig = rig(3)?;
        rig.prior.submit(LogRecord::redo(1, vec![1; 100]))?;
        rig.flush.drain()?;
        let pinned = [rig.pool.fix(20, FixMode::New)?, rig.pool.fix(21, FixMode::New)?];

        // Ends inside the last header-width of page 0, so the next record starts on page 1.
        rig.prior.submit(LogRecord::redo(1, vec![2; 760]))?;
        rig.flush.drain()?;
        assert_eq!(rig.flush.appended_lsa(), Lsa::new(1, 0));

        let spanning = rig.prior.submit(LogRecord::redo(1, vec![3; 1500]))?.lsa;
        assert_eq!(spanning, Lsa::new(1, 0));
        assert!(matches!(
            rig.flush.drain(),
            Err(LogError::OutOfBuffers { capacity: 3 })
        ));
        assert_eq!(rig.flush.appended_lsa(), spanning);
        assert!(rig.flush.watermark().failure().is_none());

        for handle in pinned {
            rig.pool.unfix(handle);
        }
        rig.flush.drain()?;
        assert_eq!(rig.flush.flush_direct()?, Lsa::new(2, 560));

        let head = rig.volume.read_page(1)?;
        let header = LogRecordHeader::decode(&head.body()[..LOG_RECORD_HDR_LEN])?;
        assert_eq!(header.rectype, LogRecordType::RedoData);
        assert_eq!(header.data_len, 1500);
        assert_eq!(header.forw_lsa, Lsa::new(2, 560));
        let tail = rig.volume.read_page(2)?;
        assert!(tail.is_continuation());
        assert!(tail.body()[..556].iter().all(|&b| b == 3));
        Ok(())
    }

    #[test]
    fn header_page_stays_dirty_after_a_mid_record_flush() -> Result<()> {
        let rig = rig(3)?;
        // Spans pages 0..=3; crossing into page 2 flushes while the record is open.
        let lsa = rig.prior.submit(LogRecord::redo(1, vec![9; 3200]))?.lsa;
        rig.flush.drain()?;
        assert!(rig.pool.is_dirty(0));
        let durable = rig.flush.flush_direct()?;
        assert!(durable > lsa);

        let head = rig.volume.read_page(0)?;
        let header = LogRecordHeader::decode(&head.body()[..LOG_RECORD_HDR_LEN])?;
        assert_eq!(header.rectype, LogRecordType::RedoData);
        assert_eq!(header.forw_lsa, durable);
        Ok(())
    }

    #[test]
    fn watermark_is_monotonic() {
        let mark = DurableWatermark::new(Lsa::new(1, 0));
        assert!(mark.advance(Lsa::new(2, 8)));
        assert!(!mark.advance(Lsa::new(2, 0)));
        assert_eq!(mark.get(), Lsa::new(2, 8));
    }

    #[test]
    fn waiters_resume_time_out_or_fail() -> Result<()> {
        let mark = Arc::new(DurableWatermark::new(Lsa::new(0, 0)));
        assert_eq!(
            mark.wait_past(Lsa::new(0, 0), Some(Duration::from_millis(10)))?,
            Wakeup::TimedOut
        );
        let waiter = {
            let mark = Arc::clone(&mark);
            thread::spawn(move || mark.wait_past(Lsa::new(0, 64), None))
        };
        thread::sleep(Duration::from_millis(20));
        mark.advance(Lsa::new(1, 0));
        assert_eq!(waiter.join().expect("join")?, Wakeup::Resumed);

        mark.fail("flush", Lsa::new(1, 0), "disk gone".into());
        assert!(mark
            .wait_past(Lsa::new(5, 0), None)
            .is_err_and(|e| e.is_fatal()));
        assert!(mark.failure().is_some());
        Ok(())
    }
}
