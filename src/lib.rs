//! Write-ahead log core: buffered append, group commit, archiving,
//! fuzzy checkpoints, and pull-based log shipping.

#![warn(missing_docs)]

pub mod config;
pub mod log;
pub mod logging;
pub mod primitives;
pub mod stats;
pub mod types;

pub use config::{ConfigError, LogConfig};
pub use log::{Collaborators, LogEngine, LogRecord, LogRecordType};
pub use types::{LogError, Lsa, Result, NULL_LSA};
