#![forbid(unsafe_code)]

//! Pull-based log shipping to replicas and backup agents.
//!
//! Each consumer owns a [`WriterEntry`] that moves through
//! `Waiting -> Fetching -> {Done, Delayed, Error}` on every pull. The flush
//! path wakes waiting consumers after each durable advance and may block for a
//! bounded time on synchronous consumers, but never depends on their liveness.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::log::flush::{DurableWatermark, Wakeup};
use crate::log::page::LogPage;
use crate::log::record::{LogRecordHeader, LOG_RECORD_HDR_LEN};
use crate::stats::LogStats;
use crate::types::{be_i32, be_i64, be_u32, LogError, Lsa, Result, LSA_ENCODED_LEN, NULL_LSA};

/// Set in the payload length when the payload is compressed.
pub const COMPRESSED_FLAG: u32 = 0x8000_0000;

/// Encoded size of a [`PullRequest`].
pub const PULL_REQUEST_LEN: usize = 10;

/// Fixed part of an encoded [`PullResponse`], before the payload length.
const RESPONSE_FIXED_LEN: usize = 1 + 4 + 8 + 4 + 1 + LSA_ENCODED_LEN;

/// Identifies one consumer connection.
pub type ConsumerId = u64;

/// How strongly the flush path waits for a consumer.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
pub enum WriterMode {
    /// Never blocks the flush path.
    Async,
    /// Blocks the flush path for a short bound.
    SemiSync,
    /// Blocks the flush path until the consumer received the pages or the bound expires.
    Sync,
}

impl WriterMode {
    /// Wire code.
    pub fn as_u8(self) -> u8 {
        match self {
            WriterMode::Async => 0,
            WriterMode::SemiSync => 1,
            WriterMode::Sync => 2,
        }
    }

    /// Decodes a wire code.
    pub fn from_u8(value: u8) -> Result<Self> {
        Ok(match value {
            0 => WriterMode::Async,
            1 => WriterMode::SemiSync,
            2 => WriterMode::Sync,
            _ => return Err(LogError::Corruption("unknown writer mode")),
        })
    }
}

/// Where a consumer is in the pull cycle.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
pub enum WriterStatus {
    /// Parked until new durable pages exist.
    Waiting,
    /// Reading pages for a response.
    Fetching,
    /// Sent everything durable at the time.
    Done,
    /// More pages are ready, or the async poll timed out.
    Delayed,
    /// The request failed or was interrupted; the entry is dropped.
    Error,
}

impl WriterStatus {
    /// Wire code.
    pub fn as_u8(self) -> u8 {
        match self {
            WriterStatus::Waiting => 0,
            WriterStatus::Fetching => 1,
            WriterStatus::Done => 2,
            WriterStatus::Delayed => 3,
            WriterStatus::Error => 4,
        }
    }

    /// Decodes a wire code.
    pub fn from_u8(value: u8) -> Result<Self> {
        Ok(match value {
            0 => WriterStatus::Waiting,
            1 => WriterStatus::Fetching,
            2 => WriterStatus::Done,
            3 => WriterStatus::Delayed,
            4 => WriterStatus::Error,
            _ => return Err(LogError::Corruption("unknown writer status")),
        })
    }
}

/// Server lifecycle reported in every response.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
pub enum ServerState {
    /// Serving pulls.
    Active,
    /// Failing pulls and refusing new ones.
    ShuttingDown,
}

impl ServerState {
    fn as_u8(self) -> u8 {
        match self {
            ServerState::Active => 0,
            ServerState::ShuttingDown => 1,
        }
    }

    fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(ServerState::Active),
            1 => Ok(ServerState::ShuttingDown),
            _ => Err(LogError::Corruption("unknown server state")),
        }
    }
}

/// Per-consumer protocol state.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
pub struct WriterEntry {
    /// First page the consumer last asked for.
    pub requested_first_page_id: i64,
    /// Mode of the latest request.
    pub mode: WriterMode,
    /// Position in the pull cycle.
    pub status: WriterStatus,
    /// Durable watermark seen by the consumer's latest pull.
    pub eof_lsa: Lsa,
    /// End of log included in the last response that caught the consumer up.
    pub last_sent_eof_lsa: Lsa,
    #[serde(skip)]
    interrupted: bool,
}

impl WriterEntry {
    fn new(request: &PullRequest) -> Self {
        Self {
            requested_first_page_id: request.first_page_id,
            mode: request.mode,
            status: WriterStatus::Waiting,
            eof_lsa: NULL_LSA,
            last_sent_eof_lsa: NULL_LSA,
            interrupted: false,
        }
    }
}

/// Client request: ship pages starting at `first_page_id`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PullRequest {
    /// First page the consumer still needs.
    pub first_page_id: i64,
    /// How long the flush path may wait for this consumer.
    pub mode: WriterMode,
    /// Ask for a snappy-compressed payload.
    pub compressed: bool,
}

impl PullRequest {
    /// Fixed-size big-endian encoding.
    pub fn encode(&self) -> [u8; PULL_REQUEST_LEN] {
        let mut buf = [0u8; PULL_REQUEST_LEN];
        buf[0..8].copy_from_slice(&self.first_page_id.to_be_bytes());
        buf[8] = self.mode.as_u8();
        buf[9] = u8::from(self.compressed);
        buf
    }

    /// Decodes a request; rejects bad lengths and flags.
    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() != PULL_REQUEST_LEN {
            return Err(LogError::Corruption("pull request length"));
        }
        let compressed = match src[9] {
            0 => false,
            1 => true,
            _ => return Err(LogError::Corruption("pull request compressed flag")),
        };
        Ok(Self {
            first_page_id: be_i64(&src[0..8]),
            mode: WriterMode::from_u8(src[8])?,
            compressed,
        })
    }
}

/// Batch body, optionally compressed with raw snappy.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Payload {
    /// Uncompressed page images.
    Raw(Vec<u8>),
    /// Raw snappy block.
    Compressed {
        /// Length before compression.
        original_len: u32,
        /// Compressed bytes.
        bytes: Vec<u8>,
    },
}

impl Payload {
    /// Compresses `raw` unless that would not make it smaller.
    pub fn compress(raw: Vec<u8>) -> Result<Self> {
        if raw.is_empty() {
            return Ok(Payload::Raw(raw));
        }
        let bytes = snap::raw::Encoder::new()
            .compress_vec(&raw)
            .map_err(|err| LogError::InvalidOwned(format!("compress payload: {err}")))?;
        if bytes.len() >= raw.len() {
            return Ok(Payload::Raw(raw));
        }
        Ok(Payload::Compressed {
            original_len: raw.len() as u32,
            bytes,
        })
    }

    /// Whether the payload is snappy-compressed.
    pub fn is_compressed(&self) -> bool {
        matches!(self, Payload::Compressed { .. })
    }

    /// Bytes as they travel on the wire.
    pub fn wire_len(&self) -> usize {
        match self {
            Payload::Raw(bytes) | Payload::Compressed { bytes, .. } => bytes.len(),
        }
    }

    /// Page images, decompressed if needed.
    pub fn into_raw(self) -> Result<Vec<u8>> {
        match self {
            Payload::Raw(bytes) => Ok(bytes),
            Payload::Compressed {
                original_len,
                bytes,
            } => {
                let raw = snap::raw::Decoder::new()
                    .decompress_vec(&bytes)
                    .map_err(|_| LogError::Corruption("payload decompression failed"))?;
                if raw.len() != original_len as usize {
                    return Err(LogError::Corruption("payload length mismatch"));
                }
                Ok(raw)
            }
        }
    }
}

/// Server reply to a [`PullRequest`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PullResponse {
    /// Outcome of the pull.
    pub status: WriterStatus,
    /// Largest batch the server sends, in pages.
    pub batch_size: i32,
    /// First page in the payload.
    pub first_page_id: i64,
    /// Pages in the payload.
    pub page_count: i32,
    /// Whether the server is shutting down.
    pub server_state: ServerState,
    /// Durable watermark the response was cut at.
    pub eof_lsa: Lsa,
    /// Page images.
    pub payload: Payload,
}

impl PullResponse {
    fn empty(status: WriterStatus, request: &PullRequest, batch: i32, state: ServerState) -> Self {
        Self {
            status,
            batch_size: batch,
            first_page_id: request.first_page_id,
            page_count: 0,
            server_state: state,
            eof_lsa: NULL_LSA,
            payload: Payload::Raw(Vec::new()),
        }
    }

    /// Encodes the response for the wire.
    pub fn encode(&self) -> Vec<u8> {
        let payload_len = self.payload.wire_len();
        let mut out = Vec::with_capacity(RESPONSE_FIXED_LEN + 8 + payload_len);
        out.push(self.status.as_u8());
        out.extend_from_slice(&self.batch_size.to_be_bytes());
        out.extend_from_slice(&self.first_page_id.to_be_bytes());
        out.extend_from_slice(&self.page_count.to_be_bytes());
        out.push(self.server_state.as_u8());
        out.extend_from_slice(&self.eof_lsa.encode());
        match &self.payload {
            Payload::Raw(bytes) => {
                out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
                out.extend_from_slice(bytes);
            }
            Payload::Compressed {
                original_len,
                bytes,
            } => {
                let len = bytes.len() as u32 | COMPRESSED_FLAG;
                out.extend_from_slice(&len.to_be_bytes());
                out.extend_from_slice(&original_len.to_be_bytes());
                out.extend_from_slice(bytes);
            }
        }
        out
    }

    /// Decodes a response; the payload stays as sent.
    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < RESPONSE_FIXED_LEN + 4 {
            return Err(LogError::Corruption("pull response truncated"));
        }
        let status = WriterStatus::from_u8(src[0])?;
        let batch_size = be_i32(&src[1..5]);
        let first_page_id = be_i64(&src[5..13]);
        let page_count = be_i32(&src[13..17]);
        let server_state = ServerState::from_u8(src[17])?;
        let eof_lsa = Lsa::decode(&src[18..30])?;
        let word = be_u32(&src[30..34]);
        let len = (word & !COMPRESSED_FLAG) as usize;
        let (payload, body) = if word & COMPRESSED_FLAG != 0 {
            if src.len() < 38 {
                return Err(LogError::Corruption("pull response truncated"));
            }
            let original_len = be_u32(&src[34..38]);
            let body = &src[38..];
            (
                Payload::Compressed {
                    original_len,
                    bytes: body.get(..len).unwrap_or_default().to_vec(),
                },
                body,
            )
        } else {
            let body = &src[34..];
            (Payload::Raw(body.get(..len).unwrap_or_default().to_vec()), body)
        };
        if body.len() != len {
            return Err(LogError::Corruption("pull response payload length"));
        }
        Ok(Self {
            status,
            batch_size,
            first_page_id,
            page_count,
            server_state,
            eof_lsa,
            payload,
        })
    }

    /// Decompresses the payload and splits it into pages.
    pub fn into_pages(self, page_size: usize) -> Result<Vec<LogPage>> {
        let count = self.page_count.max(0) as usize;
        let raw = self.payload.into_raw()?;
        if raw.len() != count * page_size {
            return Err(LogError::Corruption("payload does not hold page_count pages"));
        }
        raw.chunks_exact(page_size)
            .map(|chunk| LogPage::from_bytes(chunk.to_vec().into_boxed_slice()))
            .collect()
    }
}

/// Reads pages that are known to be durable.
pub trait PageSource: Send + Sync {
    /// Reads `page_id`, which must be below the durable watermark.
    fn read_durable_page(&self, page_id: i64) -> Result<LogPage>;
}

/// Wait bounds taken from the engine configuration.
#[derive(Copy, Clone, Debug)]
pub struct WriterOptions {
    /// How long an async pull waits before answering `Delayed`.
    pub async_poll: Duration,
    /// Longest the flush path waits for a sync consumer.
    pub sync_wait: Duration,
    /// Longest the flush path waits for a semi-sync consumer.
    pub semi_sync_wait: Duration,
    /// Pages per response.
    pub max_batch_pages: usize,
}

struct HubState {
    entries: BTreeMap<ConsumerId, WriterEntry>,
    shutdown: bool,
}

/// Registry of log-shipping consumers.
pub struct LogWriterHub {
    state: Mutex<HubState>,
    /// Consumers wait here for new durable pages.
    consumer_cv: Condvar,
    /// The flush path waits here for consumers to finish a fetch.
    fetch_cv: Condvar,
    next_id: AtomicU64,
    watermark: Arc<DurableWatermark>,
    source: Arc<dyn PageSource>,
    options: WriterOptions,
    stats: Arc<LogStats>,
}

/// Last page that holds only durable records, given the durable watermark.
pub fn last_durable_page(durable: Lsa) -> i64 {
    if durable.offset > 0 {
        durable.page_id
    } else {
        durable.page_id - 1
    }
}

/// Whether a consumer asking for `first` has durable bytes it was not sent yet.
///
/// Re-requesting the page that held the previous end of log waits until that
/// page grows; any other page is ready once it holds a durable record.
pub fn has_unsent(first: i64, last_sent: Lsa, durable: Lsa) -> bool {
    if !last_sent.is_null() && first == last_sent.page_id {
        durable > last_sent
    } else {
        first <= last_durable_page(durable)
    }
}

impl LogWriterHub {
    /// Creates a hub serving pages from `source` up to `watermark`.
    pub fn new(
        watermark: Arc<DurableWatermark>,
        source: Arc<dyn PageSource>,
        options: WriterOptions,
        stats: Arc<LogStats>,
    ) -> Self {
        Self {
            state: Mutex::new(HubState {
                entries: BTreeMap::new(),
                shutdown: false,
            }),
            consumer_cv: Condvar::new(),
            fetch_cv: Condvar::new(),
            next_id: AtomicU64::new(1),
            watermark,
            source,
            options: WriterOptions {
                max_batch_pages: options.max_batch_pages.max(1),
                ..options
            },
            stats,
        }
    }

    /// Allocates an id for a new consumer connection.
    pub fn register(&self) -> ConsumerId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn batch_size(&self) -> i32 {
        self.options.max_batch_pages as i32
    }

    fn server_state(&self, shutdown: bool) -> ServerState {
        if shutdown {
            ServerState::ShuttingDown
        } else {
            ServerState::Active
        }
    }

    /// Serves one pull round trip for consumer `id`.
    ///
    /// Protocol failures are reported as an `Error` response; only a failure
    /// to read durable pages is returned as `Err`.
    pub fn pull(&self, id: ConsumerId, request: PullRequest) -> Result<PullResponse> {
        let batch = self.batch_size();
        let mut state = self.state.lock();
        if request.first_page_id < 0 {
            state.entries.remove(&id);
            return Ok(PullResponse::empty(
                WriterStatus::Error,
                &request,
                batch,
                self.server_state(state.shutdown),
            ));
        }
        {
            let entry = state
                .entries
                .entry(id)
                .or_insert_with(|| WriterEntry::new(&request));
            entry.requested_first_page_id = request.first_page_id;
            entry.mode = request.mode;
            entry.status = WriterStatus::Waiting;
        }
        self.fetch_cv.notify_all();
        trace!(consumer = id, first = request.first_page_id, "log.writer.pull");

        let deadline = match request.mode {
            WriterMode::Async => Some(Instant::now() + self.options.async_poll),
            WriterMode::SemiSync | WriterMode::Sync => None,
        };
        let durable = loop {
            match self.wait_state(&state, id) {
                Wakeup::Interrupted => {
                    let shutdown = state.shutdown;
                    state.entries.remove(&id);
                    self.fetch_cv.notify_all();
                    debug!(consumer = id, "log.writer.interrupted");
                    return Ok(PullResponse::empty(
                        WriterStatus::Error,
                        &request,
                        batch,
                        self.server_state(shutdown),
                    ));
                }
                Wakeup::TimedOut | Wakeup::Resumed => {}
            }
            let last_sent = state
                .entries
                .get(&id)
                .map_or(NULL_LSA, |entry| entry.last_sent_eof_lsa);
            let durable = self.watermark.get();
            if has_unsent(request.first_page_id, last_sent, durable) {
                break durable;
            }
            let timed_out = match deadline {
                Some(deadline) => self.consumer_cv.wait_until(&mut state, deadline).timed_out(),
                None => {
                    self.consumer_cv.wait(&mut state);
                    false
                }
            };
            if timed_out && !has_unsent(request.first_page_id, last_sent, self.watermark.get()) {
                if let Some(entry) = state.entries.get_mut(&id) {
                    entry.status = WriterStatus::Delayed;
                    entry.eof_lsa = durable;
                }
                trace!(consumer = id, "log.writer.poll_timeout");
                let mut response = PullResponse::empty(
                    WriterStatus::Delayed,
                    &request,
                    batch,
                    self.server_state(state.shutdown),
                );
                response.eof_lsa = durable;
                return Ok(response);
            }
        };

        let last_available = last_durable_page(durable);
        let count = ((last_available - request.first_page_id + 1) as usize)
            .min(self.options.max_batch_pages);
        if let Some(entry) = state.entries.get_mut(&id) {
            entry.status = WriterStatus::Fetching;
            entry.eof_lsa = durable;
        }
        drop(state);

        let fetched = self.read_batch(request.first_page_id, count, durable);

        let mut state = self.state.lock();
        let interrupted = state
            .entries
            .get(&id)
            .map_or(true, |entry| entry.interrupted);
        let raw = match fetched {
            Ok(raw) if !interrupted => raw,
            Ok(_) => {
                state.entries.remove(&id);
                self.fetch_cv.notify_all();
                return Ok(PullResponse::empty(
                    WriterStatus::Error,
                    &request,
                    batch,
                    self.server_state(state.shutdown),
                ));
            }
            Err(err) => {
                state.entries.remove(&id);
                self.fetch_cv.notify_all();
                warn!(consumer = id, error = %err, "log.writer.fetch_failed");
                return Err(err);
            }
        };
        let caught_up = request.first_page_id + count as i64 > last_available;
        let status = if caught_up {
            WriterStatus::Done
        } else {
            WriterStatus::Delayed
        };
        if let Some(entry) = state.entries.get_mut(&id) {
            entry.status = status;
            if caught_up {
                entry.last_sent_eof_lsa = durable;
            }
        }
        let server_state = self.server_state(state.shutdown);
        self.fetch_cv.notify_all();
        drop(state);

        LogStats::bump(&self.stats.writer_batches);
        LogStats::add(&self.stats.writer_pages_sent, count as u64);
        let payload = if request.compressed {
            Payload::compress(raw)?
        } else {
            Payload::Raw(raw)
        };
        debug!(
            consumer = id,
            first = request.first_page_id,
            pages = count,
            status = ?status,
            compressed = payload.is_compressed(),
            "log.writer.batch"
        );
        Ok(PullResponse {
            status,
            batch_size: batch,
            first_page_id: request.first_page_id,
            page_count: count as i32,
            server_state,
            eof_lsa: durable,
            payload,
        })
    }

    fn wait_state(&self, state: &HubState, id: ConsumerId) -> Wakeup {
        let interrupted = state.entries.get(&id).map_or(true, |e| e.interrupted);
        if state.shutdown || interrupted {
            Wakeup::Interrupted
        } else {
            Wakeup::Resumed
        }
    }

    /// Reads `count` pages and hides anything past the durable watermark.
    fn read_batch(&self, first: i64, count: usize, durable: Lsa) -> Result<Vec<u8>> {
        let mut raw = Vec::new();
        for page_id in first..first + count as i64 {
            let mut page = self.source.read_durable_page(page_id)?;
            if page_id == durable.page_id {
                sanitize_tail(&mut page, durable.offset as usize);
            }
            raw.extend_from_slice(page.as_bytes());
        }
        Ok(raw)
    }

    /// Wakes consumers after the durable watermark moved.
    pub fn notify_durable(&self) {
        let _state = self.state.lock();
        self.consumer_cv.notify_all();
    }

    /// Blocks the flush path, within each consumer's bound, until synchronous
    /// consumers received everything up to `durable` and no fetch is in flight.
    pub fn wait_for_sync_consumers(&self, durable: Lsa) -> Wakeup {
        let start = Instant::now();
        let mut state = self.state.lock();
        loop {
            if state.shutdown {
                return Wakeup::Interrupted;
            }
            let now = Instant::now();
            let mut expired = false;
            let mut next_deadline: Option<Instant> = None;
            for entry in state.entries.values() {
                let Some(bound) = self.blocking_bound(entry, durable) else {
                    continue;
                };
                let deadline = start + bound;
                if deadline <= now {
                    expired = true;
                } else {
                    next_deadline = Some(next_deadline.map_or(deadline, |d| d.min(deadline)));
                }
            }
            match next_deadline {
                Some(deadline) => {
                    self.fetch_cv.wait_until(&mut state, deadline);
                }
                None if expired => {
                    debug!(%durable, "log.writer.sync_wait_expired");
                    return Wakeup::TimedOut;
                }
                None => return Wakeup::Resumed,
            }
        }
    }

    /// How long the flush path may wait for `entry`, or `None` if it must not.
    ///
    /// A consumer parked on a page this flush did not reach cannot be served
    /// by it, so it never holds the flush path.
    fn blocking_bound(&self, entry: &WriterEntry, durable: Lsa) -> Option<Duration> {
        if entry.interrupted || entry.status == WriterStatus::Error {
            return None;
        }
        let fetching = entry.status == WriterStatus::Fetching;
        let bound = match entry.mode {
            WriterMode::Async if fetching => return Some(self.options.semi_sync_wait),
            WriterMode::Async => return None,
            WriterMode::SemiSync => self.options.semi_sync_wait,
            WriterMode::Sync => self.options.sync_wait,
        };
        if fetching {
            return Some(bound);
        }
        if entry.last_sent_eof_lsa >= durable {
            return None;
        }
        let servable = has_unsent(
            entry.requested_first_page_id,
            entry.last_sent_eof_lsa,
            durable,
        );
        if entry.status == WriterStatus::Waiting && !servable {
            return None;
        }
        Some(bound)
    }

    /// Oldest page any live consumer still needs.
    pub fn min_needed_page(&self) -> Option<i64> {
        let state = self.state.lock();
        state
            .entries
            .values()
            .filter(|e| e.status != WriterStatus::Error && !e.interrupted)
            .map(|e| e.requested_first_page_id)
            .min()
    }

    /// Cancels the consumer's current or next wait; its entry is then removed.
    pub fn interrupt(&self, id: ConsumerId) -> bool {
        let mut state = self.state.lock();
        let found = match state.entries.get_mut(&id) {
            Some(entry) => {
                entry.interrupted = true;
                true
            }
            None => false,
        };
        self.consumer_cv.notify_all();
        self.fetch_cv.notify_all();
        found
    }

    /// Forgets consumer `id` and wakes anything waiting on it.
    pub fn disconnect(&self, id: ConsumerId) {
        let mut state = self.state.lock();
        if state.entries.remove(&id).is_some() {
            debug!(consumer = id, "log.writer.disconnect");
        }
        self.consumer_cv.notify_all();
        self.fetch_cv.notify_all();
    }

    /// Snapshot of one consumer's state.
    pub fn entry(&self, id: ConsumerId) -> Option<WriterEntry> {
        self.state.lock().entries.get(&id).copied()
    }

    /// Snapshot of every consumer, ordered by id.
    pub fn entries(&self) -> Vec<(ConsumerId, WriterEntry)> {
        let state = self.state.lock();
        state.entries.iter().map(|(id, e)| (*id, *e)).collect()
    }

    /// Fails every waiting consumer and rejects new pulls.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        state.shutdown = true;
        self.consumer_cv.notify_all();
        self.fetch_cv.notify_all();
    }
}

/// Writes an end-of-log marker at `offset` and clears the rest of the body.
fn sanitize_tail(page: &mut LogPage, offset: usize) {
    if offset + LOG_RECORD_HDR_LEN > page.body_len() {
        return;
    }
    let back = LogRecordHeader::decode(&page.body()[offset..offset + LOG_RECORD_HDR_LEN])
        .map(|h| h.back_lsa)
        .unwrap_or(NULL_LSA);
    page.truncate_body(offset);
    page.body_mut()[offset..offset + LOG_RECORD_HDR_LEN]
        .copy_from_slice(&LogRecordHeader::end_of_log(back).encode());
    page.seal();
}
