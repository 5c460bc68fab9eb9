#![forbid(unsafe_code)]

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use tracing::trace;

use crate::log::record::{LogRecord, LogRecordHeader, LogRecordType, RecordLayout};
use crate::types::{LogError, Lsa, Result, TranId, NULL_LSA};

/// A record that has been given its LSA but not yet copied into a page.
#[derive(Debug)]
pub struct PriorNode {
    /// Reserved LSA.
    pub lsa: Lsa,
    /// Header with links and checksum already filled in.
    pub header: LogRecordHeader,
    /// Record payload.
    pub data: Vec<u8>,
}

impl PriorNode {
    /// Header plus payload length.
    pub fn total_len(&self) -> usize {
        self.header.total_len()
    }
}

/// Outcome of reserving an LSA for a record.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Reservation {
    /// Where the record starts.
    pub lsa: Lsa,
    /// Where the following record starts.
    pub forw_lsa: Lsa,
    /// The pending list grew past its threshold or the record crossed a page.
    pub should_drain: bool,
}

struct PriorState {
    next_lsa: Lsa,
    prev_lsa: Lsa,
    tran_tails: HashMap<TranId, Lsa>,
    pending: VecDeque<PriorNode>,
    pending_bytes: usize,
}

/// Serializes concurrent producers into a single LSA order.
///
/// Only reservation happens under the ordering mutex; the physical copy is
/// done later by whoever drains the pending list, in list order.
pub struct AppendPipeline {
    state: Mutex<PriorState>,
    layout: RecordLayout,
    max_record_pages: i64,
    drain_threshold: usize,
}

impl AppendPipeline {
    /// Pipeline resuming at `next_lsa` with `prev_lsa` as the last record.
    pub fn new(
        layout: RecordLayout,
        next_lsa: Lsa,
        prev_lsa: Lsa,
        max_record_pages: i64,
        drain_threshold: usize,
    ) -> Self {
        Self {
            state: Mutex::new(PriorState {
                next_lsa: layout.record_start(next_lsa),
                prev_lsa,
                tran_tails: HashMap::new(),
                pending: VecDeque::new(),
                pending_bytes: 0,
            }),
            layout,
            max_record_pages: max_record_pages.max(1),
            drain_threshold: drain_threshold.max(1),
        }
    }

    /// Assigns the next LSA to `record` and queues it for the physical copy.
    pub fn submit(&self, record: LogRecord) -> Result<Reservation> {
        if record.rectype == LogRecordType::EndOfLog {
            return Err(LogError::Invalid("end-of-log records are written by the flusher"));
        }
        let total_len = record.total_len();
        if total_len > u32::MAX as usize {
            return Err(LogError::Invalid("log record too large"));
        }
        let data_crc = record.data_crc();
        let LogRecord {
            trid,
            rectype,
            data,
        } = record;

        let mut state = self.state.lock();
        let lsa = state.next_lsa;
        if self.layout.pages_spanned(lsa, total_len) > self.max_record_pages {
            return Err(LogError::InvalidOwned(format!(
                "log record of {total_len} bytes spans more than {} pages",
                self.max_record_pages
            )));
        }
        let forw_lsa = self.layout.next_record(lsa, total_len);
        let prev_tran_lsa = if !rectype.is_transactional() {
            NULL_LSA
        } else if rectype.ends_transaction() {
            state.tran_tails.remove(&trid).unwrap_or(NULL_LSA)
        } else {
            state.tran_tails.insert(trid, lsa).unwrap_or(NULL_LSA)
        };
        let header = LogRecordHeader {
            back_lsa: state.prev_lsa,
            forw_lsa,
            prev_tran_lsa,
            trid,
            rectype,
            data_len: data.len() as u32,
            data_crc,
        };
        state.prev_lsa = lsa;
        state.next_lsa = forw_lsa;
        state.pending.push_back(PriorNode { lsa, header, data });
        state.pending_bytes += total_len;
        let should_drain =
            state.pending_bytes >= self.drain_threshold || forw_lsa.page_id > lsa.page_id;
        trace!(%lsa, %forw_lsa, trid, pending = state.pending.len(), "log.prior.submit");
        Ok(Reservation {
            lsa,
            forw_lsa,
            should_drain,
        })
    }

    /// Takes the whole pending list in one shot.
    pub fn take_pending(&self) -> VecDeque<PriorNode> {
        let mut state = self.state.lock();
        state.pending_bytes = 0;
        std::mem::take(&mut state.pending)
    }

    /// Puts undrained nodes back in front of anything queued since.
    pub fn requeue_front(&self, mut nodes: VecDeque<PriorNode>) {
        if nodes.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        let newer = std::mem::take(&mut state.pending);
        nodes.extend(newer);
        state.pending_bytes = nodes.iter().map(PriorNode::total_len).sum();
        state.pending = nodes;
    }

    /// Whether records are waiting to be copied.
    pub fn has_pending(&self) -> bool {
        !self.state.lock().pending.is_empty()
    }

    /// LSA the next submitted record will receive.
    pub fn next_lsa(&self) -> Lsa {
        self.state.lock().next_lsa
    }

    /// Last LSA written by an open transaction, if any.
    pub fn transaction_tail(&self, trid: TranId) -> Option<Lsa> {
        self.state.lock().tran_tails.get(&trid).copied()
    }

    /// Placement rules used for reservation.
    pub fn layout(&self) -> &RecordLayout {
        &self.layout
    }
}
