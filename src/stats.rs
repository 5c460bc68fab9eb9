#![forbid(unsafe_code)]

//! Counters describing log engine activity.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Thread-safe counters updated by every log component.
#[derive(Default, Debug)]
pub struct LogStats {
    /// Records copied into log pages.
    pub records_appended: AtomicU64,
    /// Encoded record bytes appended, headers included.
    pub bytes_appended: AtomicU64,
    /// Flush cycles that wrote at least one page.
    pub flushes: AtomicU64,
    /// Pages written to the active volume.
    pub pages_written: AtomicU64,
    /// Vectored write calls issued by flushes.
    pub write_calls: AtomicU64,
    /// Volume syncs issued.
    pub fsyncs: AtomicU64,
    /// Non-critical flushes that skipped their fsync.
    pub fsyncs_skipped: AtomicU64,
    /// Buffers reclaimed for a different page.
    pub evictions: AtomicU64,
    /// Times the buffer pool grew.
    pub pool_growths: AtomicU64,
    /// Full flushes forced by a dirty eviction victim.
    pub dirty_victim_flushes: AtomicU64,
    /// Archive volumes written.
    pub archives_created: AtomicU64,
    /// Archives deleted by retention.
    pub archives_removed: AtomicU64,
    /// Retention passes that kept an archive because a consumer still needs it.
    pub archive_removals_deferred: AtomicU64,
    /// Completed checkpoints.
    pub checkpoints: AtomicU64,
    /// Pull responses that carried pages.
    pub writer_batches: AtomicU64,
    /// Pages shipped to consumers.
    pub writer_pages_sent: AtomicU64,
}

impl LogStats {
    pub(crate) fn add(counter: &AtomicU64, value: u64) {
        counter.fetch_add(value, Ordering::Relaxed);
    }

    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Copies every counter into a serializable snapshot.
    pub fn snapshot(&self) -> LogStatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        LogStatsSnapshot {
            records_appended: load(&self.records_appended),
            bytes_appended: load(&self.bytes_appended),
            flushes: load(&self.flushes),
            pages_written: load(&self.pages_written),
            write_calls: load(&self.write_calls),
            fsyncs: load(&self.fsyncs),
            fsyncs_skipped: load(&self.fsyncs_skipped),
            evictions: load(&self.evictions),
            pool_growths: load(&self.pool_growths),
            dirty_victim_flushes: load(&self.dirty_victim_flushes),
            archives_created: load(&self.archives_created),
            archives_removed: load(&self.archives_removed),
            archive_removals_deferred: load(&self.archive_removals_deferred),
            checkpoints: load(&self.checkpoints),
            writer_batches: load(&self.writer_batches),
            writer_pages_sent: load(&self.writer_pages_sent),
        }
    }
}

/// Point-in-time copy of [`LogStats`].
#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct LogStatsSnapshot {
    pub records_appended: u64,
    pub bytes_appended: u64,
    pub flushes: u64,
    pub pages_written: u64,
    pub write_calls: u64,
    pub fsyncs: u64,
    pub fsyncs_skipped: u64,
    pub evictions: u64,
    pub pool_growths: u64,
    pub dirty_victim_flushes: u64,
    pub archives_created: u64,
    pub archives_removed: u64,
    pub archive_removals_deferred: u64,
    pub checkpoints: u64,
    pub writer_batches: u64,
    pub writer_pages_sent: u64,
}
