//! The write-ahead log core.
//!
//! Records flow from producers into the [`prior`] list, are copied into
//! [`buffer_pool`] pages by the [`flush`] coordinator, written to the active
//! [`volume`], rolled into archives by the [`archive`] module, bounded by
//! [`checkpoint`]s, and shipped to consumers through the [`writer`] hub.

/// Archive volumes, the log-information file, and retention.
pub mod archive;
/// Clock-replacement cache of log pages.
pub mod buffer_pool;
/// Fuzzy checkpoints and collaborator traits.
pub mod checkpoint;
/// Engine lifecycle owning every component.
pub mod engine;
/// Page copy, flush, group commit, and the durable watermark.
pub mod flush;
/// Active-volume and archive headers.
pub mod header;
/// Log page layout.
pub mod page;
/// LSA reservation for concurrent producers.
pub mod prior;
/// Page routing and record scans.
pub mod reader;
/// Record headers and placement arithmetic.
pub mod record;
/// Active and archive volume files.
pub mod volume;
/// Log-shipping protocol.
pub mod writer;

pub use archive::ArchiveEntry;
pub use checkpoint::{
    CheckpointOutcome, FatalSink, PageCache, TransactionSnapshot, TransactionState,
    TransactionTable,
};
pub use engine::{Collaborators, LogEngine};
pub use flush::{DurableWatermark, Wakeup};
pub use reader::{LogReader, ScannedRecord};
pub use record::{LogRecord, LogRecordHeader, LogRecordType};
pub use writer::{
    ConsumerId, Payload, PullRequest, PullResponse, ServerState, WriterMode, WriterStatus,
};
