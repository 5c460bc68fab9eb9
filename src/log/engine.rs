#![forbid(unsafe_code)]

use std::fs;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::LogConfig;
use crate::log::archive::{ArchiveEntry, Archiver};
use crate::log::buffer_pool::BufferPool;
use crate::log::checkpoint::{
    CheckpointManager, CheckpointOutcome, CheckpointParts, CheckpointTrigger, EmptyTransactionTable,
    FatalSink, LoggingFatalSink, NoopPageCache, PageCache, TransactionTable,
};
use crate::log::flush::{DurableWatermark, FlushCoordinator, FlushParts};
use crate::log::header::LogHeader;
use crate::log::prior::AppendPipeline;
use crate::log::reader::{recover_end, DurablePageSource, LogReader};
use crate::log::record::{LogRecord, RecordLayout};
use crate::log::volume::{ActiveVolume, VolumePaths};
use crate::log::writer::{ConsumerId, LogWriterHub, PageSource, PullRequest, PullResponse};
use crate::stats::{LogStats, LogStatsSnapshot};
use crate::types::{ArchiveNumber, LogError, Lsa, Result, TranId};

/// External systems the log consults.
#[derive(Clone)]
pub struct Collaborators {
    /// Data-page cache flushed up to the redo point at checkpoints.
    pub page_cache: Arc<dyn PageCache>,
    /// Source of active transactions for checkpoints.
    pub transactions: Arc<dyn TransactionTable>,
    /// Receives unrecoverable failures.
    pub fatal_sink: Arc<dyn FatalSink>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            page_cache: Arc::new(NoopPageCache),
            transactions: Arc::new(EmptyTransactionTable),
            fatal_sink: Arc::new(LoggingFatalSink),
        }
    }
}

/// The write-ahead log: owns every log component and their threads.
pub struct LogEngine {
    config: LogConfig,
    header: Arc<Mutex<LogHeader>>,
    volume: Arc<ActiveVolume>,
    prior: Arc<AppendPipeline>,
    flush: Arc<FlushCoordinator>,
    archiver: Arc<Archiver>,
    checkpoints: Arc<CheckpointManager>,
    writers: Arc<LogWriterHub>,
    reader: LogReader,
    next_trid: AtomicI32,
    threads: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
    stats: Arc<LogStats>,
}

impl LogEngine {
    /// Opens the log in `config.log_dir`, formatting a new active volume if needed.
    pub fn open(config: LogConfig, collaborators: Collaborators) -> Result<Arc<Self>> {
        config
            .validate()
            .map_err(|err| LogError::InvalidOwned(err.to_string()))?;
        fs::create_dir_all(&config.log_dir)?;
        let paths = VolumePaths::new(&config.log_dir, &config.prefix);
        let page_size = config.page_size as usize;

        let active_path = paths.active();
        let (volume, header) = if active_path.exists() {
            let (volume, header) = ActiveVolume::open(&active_path, page_size)?;
            if header.prefix != config.prefix {
                return Err(LogError::InvalidOwned(format!(
                    "active log belongs to prefix {:?}",
                    header.prefix
                )));
            }
            (volume, header)
        } else {
            let header = LogHeader::new(&config.prefix, config.page_size, config.active_pages)?;
            (ActiveVolume::create(&active_path, &header)?, header)
        };
        let volume = Arc::new(volume);
        let layout = RecordLayout::new(page_size)?;
        let (end, prev) = recover_end(&volume, &layout, &header)?;
        let next_trid = header.next_trid;
        info!(
            dir = %config.log_dir.display(),
            prefix = %config.prefix,
            end = %end,
            checkpoint = %header.checkpoint_lsa,
            "log.engine.open"
        );

        let stats = Arc::new(LogStats::default());
        let header = Arc::new(Mutex::new(header));
        let archiver = Arc::new(Archiver::new(
            paths,
            Arc::clone(&volume),
            Arc::clone(&header),
            config.archiver_options(),
            Arc::clone(&stats),
        )?);
        let watermark = Arc::new(DurableWatermark::new(end));
        let source = Arc::new(DurablePageSource::new(
            Arc::clone(&volume),
            Arc::clone(&archiver),
        ));
        let page_source: Arc<dyn PageSource> = source.clone();
        let writers = Arc::new(LogWriterHub::new(
            Arc::clone(&watermark),
            page_source,
            config.writer_options(),
            Arc::clone(&stats),
        ));
        let pool = Arc::new(BufferPool::new(
            Arc::clone(&volume),
            config.buffer_pages,
            config.buffer_growth_percent,
            config.max_buffer_pages,
            Arc::clone(&stats),
        )?);
        let prior = Arc::new(AppendPipeline::new(
            layout,
            end,
            prev,
            volume.capacity() as i64 - 2,
            config.prior_drain_bytes,
        ));
        let trigger = Arc::new(CheckpointTrigger::default());
        let flush = Arc::new(FlushCoordinator::open(
            FlushParts {
                prior: Arc::clone(&prior),
                pool: Arc::clone(&pool),
                volume: Arc::clone(&volume),
                header: Arc::clone(&header),
                archiver: Arc::clone(&archiver),
                writers: Arc::clone(&writers),
                watermark,
                checkpoint_trigger: Arc::clone(&trigger),
                fatal_sink: Arc::clone(&collaborators.fatal_sink),
                stats: Arc::clone(&stats),
            },
            config.flush_options(),
            end,
            prev,
        )?);
        let checkpoints = Arc::new(CheckpointManager::new(CheckpointParts {
            prior: Arc::clone(&prior),
            flush: Arc::clone(&flush),
            volume: Arc::clone(&volume),
            header: Arc::clone(&header),
            archiver: Arc::clone(&archiver),
            writers: Arc::clone(&writers),
            page_cache: collaborators.page_cache,
            transactions: collaborators.transactions,
            fatal_sink: collaborators.fatal_sink,
            trigger,
            stats: Arc::clone(&stats),
        }));
        let reader = LogReader::new(
            Arc::clone(&flush),
            pool,
            source,
            Arc::clone(&archiver),
            layout,
        );

        let engine = Arc::new(Self {
            config,
            header,
            volume,
            prior,
            flush,
            archiver,
            checkpoints,
            writers,
            reader,
            next_trid: AtomicI32::new(next_trid),
            threads: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            stats,
        });
        engine.start_daemons()?;
        Ok(engine)
    }

    fn start_daemons(&self) -> Result<()> {
        let mut threads = self.threads.lock();
        if let Some(handle) = self.flush.spawn_daemon()? {
            threads.push(handle);
        }
        if let Some(handle) = self.archiver.spawn_background()? {
            threads.push(handle);
        }
        let page_triggered = self.config.checkpoint_interval_pages > 0;
        if let Some(handle) = self
            .checkpoints
            .spawn_daemon(self.config.checkpoint_interval(), page_triggered)?
        {
            threads.push(handle);
        }
        debug!(threads = threads.len(), "log.engine.daemons_started");
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if let Some(err) = self.flush.watermark().failure() {
            return Err(err);
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(LogError::Invalid("log engine is shut down"));
        }
        Ok(())
    }

    /// Configuration the engine was opened with.
    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    /// Bytes per log page.
    pub fn page_size(&self) -> usize {
        self.volume.page_size()
    }

    /// Hands out a fresh transaction id.
    pub fn begin_transaction(&self) -> TranId {
        let trid = self.next_trid.fetch_add(1, Ordering::Relaxed);
        let mut header = self.header.lock();
        header.next_trid = header.next_trid.max(trid + 1);
        trid
    }

    /// Reserves an LSA for `record` and queues it for the physical copy.
    ///
    /// On `OutOfBuffers` the record keeps its LSA and stays queued; a later
    /// drain copies it once buffers free up.
    pub fn append(&self, record: LogRecord) -> Result<Lsa> {
        self.ensure_open()?;
        let reservation = self.prior.submit(record)?;
        if reservation.should_drain {
            self.flush.drain()?;
        }
        Ok(reservation.lsa)
    }

    /// Appends a commit record for `trid` and waits until it is durable.
    pub fn commit(&self, trid: TranId) -> Result<Lsa> {
        let lsa = self.append(LogRecord::commit(trid))?;
        self.flush.request_flush(lsa)?;
        Ok(lsa)
    }

    /// Appends an abort record for `trid` without waiting for durability.
    pub fn abort(&self, trid: TranId) -> Result<Lsa> {
        self.append(LogRecord::abort(trid))
    }

    /// Flushes everything appended so far and returns the durable watermark.
    pub fn flush(&self) -> Result<Lsa> {
        self.ensure_open()?;
        self.flush.flush_direct()
    }

    /// Waits until the record at `lsa` is durable.
    pub fn request_flush(&self, lsa: Lsa) -> Result<()> {
        self.ensure_open()?;
        self.flush.request_flush(lsa)
    }

    /// Every record below this LSA is on disk and synced.
    pub fn durable_lsa(&self) -> Lsa {
        self.flush.watermark().get()
    }

    /// LSA the next appended record will receive.
    pub fn next_lsa(&self) -> Lsa {
        self.prior.next_lsa()
    }

    /// Archives every completed page now instead of waiting for the ring to fill.
    pub fn archive_now(&self) -> Result<Option<ArchiveEntry>> {
        self.ensure_open()?;
        self.flush.archive_now()
    }

    /// Archives currently on disk, oldest first.
    pub fn archives(&self) -> Result<Vec<ArchiveEntry>> {
        self.archiver.list()
    }

    /// Re-runs archive retention against the current consumers.
    pub fn purge_archives(&self) -> Result<Vec<ArchiveNumber>> {
        self.ensure_open()?;
        self.archiver.apply_retention(self.writers.min_needed_page())
    }

    /// Archive holding `page_id`.
    pub fn get_archive_number_for(&self, page_id: i64) -> Result<ArchiveNumber> {
        self.archiver.get_archive_number_for(page_id)
    }

    /// Runs a checkpoint, or joins one already running.
    pub fn checkpoint(&self) -> Result<CheckpointOutcome> {
        self.ensure_open()?;
        self.checkpoints.checkpoint()
    }

    /// Serves one log-shipping round trip.
    pub fn pull(&self, consumer: ConsumerId, request: PullRequest) -> Result<PullResponse> {
        self.writers.pull(consumer, request)
    }

    /// Log-shipping hub.
    pub fn writers(&self) -> &LogWriterHub {
        &self.writers
    }

    /// Random and sequential record access.
    pub fn reader(&self) -> &LogReader {
        &self.reader
    }

    /// Copy of the in-memory log header.
    pub fn header(&self) -> LogHeader {
        self.header.lock().clone()
    }

    /// Point-in-time copy of the engine counters.
    pub fn stats(&self) -> LogStatsSnapshot {
        self.stats.snapshot()
    }

    /// Stops the daemons, flushes what was appended, and fails pending consumers.
    ///
    /// Safe to call more than once.
    pub fn shutdown(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.writers.shutdown();
        self.flush.stop_daemon();
        self.checkpoints.stop_daemon();
        self.archiver.stop_background();
        let threads: Vec<_> = self.threads.lock().drain(..).collect();
        for handle in threads {
            if handle.join().is_err() {
                warn!("log.engine.daemon_panicked");
            }
        }
        let flushed = match self.flush.watermark().failure() {
            Some(err) => Err(err),
            None => self.flush.flush_direct().map(|_| ()),
        };
        info!(durable = %self.durable_lsa(), ok = flushed.is_ok(), "log.engine.shutdown");
        flushed
    }
}

impl Drop for LogEngine {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            warn!(error = %err, "log.engine.shutdown_on_drop_failed");
        }
    }
}
