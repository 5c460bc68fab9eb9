#![forbid(unsafe_code)]

//! Fuzzy checkpoints and the collaborator seams they consume.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::log::archive::Archiver;
use crate::log::flush::FlushCoordinator;
use crate::log::header::LogHeader;
use crate::log::prior::AppendPipeline;
use crate::log::record::{LogRecord, LogRecordType};
use crate::log::volume::ActiveVolume;
use crate::log::writer::LogWriterHub;
use crate::stats::LogStats;
use crate::types::{clone_error, be_i32, be_u32, LogError, Lsa, Result, TranId, LSA_ENCODED_LEN};

/// Transaction id used for records written by the log itself.
pub const SYSTEM_TRID: TranId = 0;

/// External data-page cache.
pub trait PageCache: Send + Sync {
    /// Flushes data pages whose changes are logged at or before `lsa`.
    ///
    /// Returns the oldest LSA still needed to redo a page that remains dirty.
    fn flush_dirty_data_pages_up_to(&self, lsa: Lsa) -> Result<Lsa>;
}

/// Transaction state captured in a checkpoint.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
pub enum TransactionState {
    /// Running normally.
    Active,
    /// Commit record appended, not yet durable.
    Committing,
    /// Rolling back.
    Aborting,
}

impl TransactionState {
    fn as_u8(self) -> u8 {
        match self {
            TransactionState::Active => 0,
            TransactionState::Committing => 1,
            TransactionState::Aborting => 2,
        }
    }

    fn from_u8(value: u8) -> Result<Self> {
        Ok(match value {
            0 => TransactionState::Active,
            1 => TransactionState::Committing,
            2 => TransactionState::Aborting,
            _ => return Err(LogError::Corruption("unknown transaction state")),
        })
    }
}

/// One active transaction as seen by a checkpoint.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
pub struct TransactionSnapshot {
    /// Transaction id.
    pub trid: TranId,
    /// State at snapshot time.
    pub state: TransactionState,
    /// First record of the transaction.
    pub begin_lsa: Lsa,
    /// Most recent record of the transaction.
    pub last_lsa: Lsa,
    /// Next record to undo.
    pub undo_next_lsa: Lsa,
}

const SNAPSHOT_LEN: usize = 4 + 1 + 3 * LSA_ENCODED_LEN;

/// Serializes the payload of an `EndCheckpoint` record.
pub fn encode_checkpoint_payload(redo_lsa: Lsa, txns: &[TransactionSnapshot]) -> Vec<u8> {
    let mut out = Vec::with_capacity(LSA_ENCODED_LEN + 4 + txns.len() * SNAPSHOT_LEN);
    out.extend_from_slice(&redo_lsa.encode());
    out.extend_from_slice(&(txns.len() as u32).to_be_bytes());
    for txn in txns {
        out.extend_from_slice(&txn.trid.to_be_bytes());
        out.push(txn.state.as_u8());
        out.extend_from_slice(&txn.begin_lsa.encode());
        out.extend_from_slice(&txn.last_lsa.encode());
        out.extend_from_slice(&txn.undo_next_lsa.encode());
    }
    out
}

/// Parses the payload written by [`encode_checkpoint_payload`].
pub fn decode_checkpoint_payload(src: &[u8]) -> Result<(Lsa, Vec<TransactionSnapshot>)> {
    if src.len() < LSA_ENCODED_LEN + 4 {
        return Err(LogError::Corruption("checkpoint payload truncated"));
    }
    let redo = Lsa::decode(&src[..LSA_ENCODED_LEN])?;
    let count = be_u32(&src[LSA_ENCODED_LEN..LSA_ENCODED_LEN + 4]) as usize;
    let body = &src[LSA_ENCODED_LEN + 4..];
    if body.len() != count * SNAPSHOT_LEN {
        return Err(LogError::Corruption("checkpoint payload length mismatch"));
    }
    let txns = body
        .chunks_exact(SNAPSHOT_LEN)
        .map(|chunk| {
            let lsa_at = |i: usize| Lsa::decode(&chunk[5 + i * LSA_ENCODED_LEN..]);
            Ok(TransactionSnapshot {
                trid: be_i32(&chunk[0..4]),
                state: TransactionState::from_u8(chunk[4])?,
                begin_lsa: lsa_at(0)?,
                last_lsa: lsa_at(1)?,
                undo_next_lsa: lsa_at(2)?,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok((redo, txns))
}

/// External transaction table.
pub trait TransactionTable: Send + Sync {
    /// Transactions active right now, for the start-checkpoint record.
    fn active_transaction_snapshot(&self) -> Vec<TransactionSnapshot>;
}

/// Receives unrecoverable failures before they are returned to callers.
pub trait FatalSink: Send + Sync {
    /// Called once per failure; `component` names the subsystem that hit it.
    fn report_fatal(&self, component: &'static str, lsa: Lsa, reason: &str);
}

/// Page cache with nothing to flush; redo starts at the checkpoint itself.
#[derive(Default, Debug)]
pub struct NoopPageCache;

impl PageCache for NoopPageCache {
    fn flush_dirty_data_pages_up_to(&self, lsa: Lsa) -> Result<Lsa> {
        Ok(lsa)
    }
}

/// Default table: no transactions are ever active.
#[derive(Default, Debug)]
pub struct EmptyTransactionTable;

impl TransactionTable for EmptyTransactionTable {
    fn active_transaction_snapshot(&self) -> Vec<TransactionSnapshot> {
        Vec::new()
    }
}

/// Default sink: records the failure through `tracing`.
#[derive(Default, Debug)]
pub struct LoggingFatalSink;

impl FatalSink for LoggingFatalSink {
    fn report_fatal(&self, component: &'static str, lsa: Lsa, reason: &str) {
        error!(component, %lsa, reason, "log.fatal_reported");
    }
}

/// Wakes the checkpoint daemon early.
#[derive(Default)]
pub struct CheckpointTrigger {
    state: Mutex<TriggerState>,
    cv: Condvar,
}

#[derive(Default)]
struct TriggerState {
    requested: bool,
    shutdown: bool,
}

impl CheckpointTrigger {
    /// Wakes the daemon for an immediate checkpoint.
    pub fn request(&self) {
        let mut state = self.state.lock();
        state.requested = true;
        self.cv.notify_all();
    }

    fn shutdown(&self) {
        let mut state = self.state.lock();
        state.shutdown = true;
        self.cv.notify_all();
    }

    /// Returns `None` on shutdown, otherwise whether the wake was requested.
    fn wait(&self, interval: Option<Duration>) -> Option<bool> {
        let mut state = self.state.lock();
        if !state.requested && !state.shutdown {
            match interval {
                Some(interval) => {
                    self.cv.wait_for(&mut state, interval);
                }
                None => self.cv.wait(&mut state),
            }
        }
        if state.shutdown {
            return None;
        }
        Some(std::mem::take(&mut state.requested))
    }
}

/// Result of one completed checkpoint.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
pub struct CheckpointOutcome {
    /// Start-checkpoint record.
    pub checkpoint_lsa: Lsa,
    /// Where redo would begin after a crash.
    pub redo_lsa: Lsa,
    /// Transactions listed in the checkpoint.
    pub active_transactions: usize,
}

struct Collapse {
    running: bool,
    generation: u64,
    last: Option<std::result::Result<CheckpointOutcome, LogError>>,
}

/// Components a checkpoint touches.
pub struct CheckpointParts {
    /// Reserves the checkpoint records.
    pub prior: Arc<AppendPipeline>,
    /// Makes the checkpoint durable.
    pub flush: Arc<FlushCoordinator>,
    /// Active volume whose header records the checkpoint.
    pub volume: Arc<ActiveVolume>,
    /// Shared active-volume header.
    pub header: Arc<Mutex<LogHeader>>,
    /// Told the new recovery low page.
    pub archiver: Arc<Archiver>,
    /// Consumers whose needs bound archive removal.
    pub writers: Arc<LogWriterHub>,
    /// Flushes dirty data pages before the redo point moves.
    pub page_cache: Arc<dyn PageCache>,
    /// Source of the active transaction list.
    pub transactions: Arc<dyn TransactionTable>,
    /// Receives failures the checkpoint cannot recover from.
    pub fatal_sink: Arc<dyn FatalSink>,
    /// Wakes the daemon.
    pub trigger: Arc<CheckpointTrigger>,
    /// Engine counters.
    pub stats: Arc<LogStats>,
}

/// Writes fuzzy checkpoints; concurrent requests share one run.
pub struct CheckpointManager {
    parts: CheckpointParts,
    collapse: Mutex<Collapse>,
    collapse_cv: Condvar,
}

impl CheckpointManager {
    /// Creates a manager over the given components.
    pub fn new(parts: CheckpointParts) -> Self {
        Self {
            parts,
            collapse: Mutex::new(Collapse {
                running: false,
                generation: 0,
                last: None,
            }),
            collapse_cv: Condvar::new(),
        }
    }

    /// Trigger shared with the flush coordinator.
    pub fn trigger(&self) -> &Arc<CheckpointTrigger> {
        &self.parts.trigger
    }

    /// Takes a checkpoint, or waits for the one already in progress.
    pub fn checkpoint(&self) -> Result<CheckpointOutcome> {
        {
            let mut collapse = self.collapse.lock();
            if collapse.running {
                let generation = collapse.generation;
                while collapse.generation == generation {
                    self.collapse_cv.wait(&mut collapse);
                }
                debug!(generation, "log.checkpoint.collapsed");
                return match collapse.last.as_ref() {
                    Some(Ok(outcome)) => Ok(*outcome),
                    Some(Err(err)) => Err(clone_error(err)),
                    None => Err(LogError::Interrupted),
                };
            }
            collapse.running = true;
        }

        let result = self.run();

        let mut collapse = self.collapse.lock();
        collapse.running = false;
        collapse.generation += 1;
        collapse.last = Some(match &result {
            Ok(outcome) => Ok(*outcome),
            Err(err) => Err(clone_error(err)),
        });
        self.collapse_cv.notify_all();
        result
    }

    fn run(&self) -> Result<CheckpointOutcome> {
        let parts = &self.parts;
        let start = parts
            .prior
            .submit(LogRecord::new(
                SYSTEM_TRID,
                LogRecordType::StartCheckpoint,
                Vec::new(),
            ))?
            .lsa;
        debug!(%start, "log.checkpoint.start");

        let cache_redo = parts
            .page_cache
            .flush_dirty_data_pages_up_to(start)
            .map_err(|err| self.fatal(start, err))?;
        let redo = if cache_redo.is_null() {
            start
        } else {
            cache_redo.min(start)
        };
        let txns = parts.transactions.active_transaction_snapshot();
        let payload = encode_checkpoint_payload(redo, &txns);
        parts.prior.submit(LogRecord::new(
            SYSTEM_TRID,
            LogRecordType::EndCheckpoint,
            payload,
        ))?;
        parts.flush.flush_direct()?;

        let (checkpoint_lsa, redo_lsa) = {
            let mut header = parts.header.lock();
            if start > header.checkpoint_lsa || header.checkpoint_lsa.is_null() {
                header.checkpoint_lsa = start;
                header.redo_lsa = redo;
            }
            let persisted = parts
                .volume
                .write_header(&header)
                .and_then(|_| parts.volume.sync());
            if let Err(err) = persisted {
                drop(header);
                return Err(self.fatal(start, err));
            }
            (header.checkpoint_lsa, header.redo_lsa)
        };
        parts.archiver.set_recovery_low_page(redo_lsa.page_id);
        if let Err(err) = parts
            .archiver
            .apply_retention(parts.writers.min_needed_page())
        {
            warn!(error = %err, "log.checkpoint.retention_failed");
        }
        LogStats::bump(&parts.stats.checkpoints);
        info!(
            checkpoint = %checkpoint_lsa,
            redo = %redo_lsa,
            active = txns.len(),
            "log.checkpoint.done"
        );
        Ok(CheckpointOutcome {
            checkpoint_lsa,
            redo_lsa,
            active_transactions: txns.len(),
        })
    }

    fn fatal(&self, lsa: Lsa, err: LogError) -> LogError {
        if err.is_fatal() {
            return err;
        }
        let fatal = err.into_fatal("checkpoint", lsa);
        if let LogError::Fatal { reason, .. } = &fatal {
            self.parts.fatal_sink.report_fatal("checkpoint", lsa, reason);
            self.parts
                .flush
                .watermark()
                .fail("checkpoint", lsa, reason.clone());
        }
        fatal
    }

    /// Starts the periodic checkpoint thread; `None` when both triggers are disabled.
    pub fn spawn_daemon(
        self: &Arc<Self>,
        interval: Option<Duration>,
        page_triggered: bool,
    ) -> std::io::Result<Option<JoinHandle<()>>> {
        if interval.is_none() && !page_triggered {
            return Ok(None);
        }
        let manager = Arc::clone(self);
        thread::Builder::new()
            .name("arclog-checkpoint".into())
            .spawn(move || manager.daemon_loop(interval))
            .map(Some)
    }

    /// Asks the daemon to exit.
    pub fn stop_daemon(&self) {
        self.parts.trigger.shutdown();
    }

    fn daemon_loop(&self, interval: Option<Duration>) {
        debug!("log.checkpoint.daemon_start");
        while let Some(requested) = self.parts.trigger.wait(interval) {
            if !requested && interval.is_none() {
                continue;
            }
            if let Err(err) = self.checkpoint() {
                error!(error = %err, "log.checkpoint.daemon_failed");
                if err.is_fatal() {
                    break;
                }
            }
        }
        debug!("log.checkpoint.daemon_exit");
    }
}
