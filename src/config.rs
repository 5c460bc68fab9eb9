#![forbid(unsafe_code)]

//! Engine configuration loaded from TOML.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::log::archive::ArchiverOptions;
use crate::log::flush::FlushOptions;
use crate::log::writer::WriterOptions;

const MIN_PAGE_SIZE: u32 = 1024;
const MAX_PAGE_SIZE: u32 = 64 * 1024;

/// Settings for one log engine instance.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct LogConfig {
    /// Directory holding the active volume, archives and the info file.
    pub log_dir: PathBuf,
    /// File name prefix shared by every volume.
    pub prefix: String,
    /// Bytes per log page, header included.
    pub page_size: u32,
    /// Ring slots in the active volume.
    pub active_pages: u32,
    /// Buffers the pool starts with.
    pub buffer_pages: usize,
    /// Growth step when every buffer is pinned or dirty.
    pub buffer_growth_percent: usize,
    /// Hard cap on pool growth.
    pub max_buffer_pages: usize,
    /// Batch commit flushes on the flush daemon instead of flushing inline.
    pub group_commit: bool,
    /// Daemon wake-up period when group commit is on.
    pub group_commit_interval_ms: u64,
    /// Sync every n-th non-critical flush; commit flushes always sync.
    pub fsync_sample: u64,
    /// Pending prior-list bytes that trigger a drain into pages.
    pub prior_drain_bytes: usize,
    /// Keep a trailing archive copy up to date in the background.
    pub background_archiving: bool,
    /// Pages copied per read when building an archive.
    pub archive_io_pages: usize,
    /// Archives kept on disk; 0 keeps all of them.
    pub max_archives: usize,
    /// Pages appended between checkpoints; 0 disables the page trigger.
    pub checkpoint_interval_pages: u64,
    /// Milliseconds between checkpoints; 0 disables the timer.
    pub checkpoint_interval_ms: u64,
    /// Log-shipping settings.
    pub writer: WriterConfig,
}

/// Log-shipping settings (`[writer]` table).
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct WriterConfig {
    /// How long an async pull waits for new pages before answering `Delayed`.
    pub async_poll_ms: u64,
    /// Longest a commit waits for sync consumers.
    pub sync_wait_ms: u64,
    /// Longest a commit waits for semi-sync consumers.
    pub semi_sync_wait_ms: u64,
    /// Pages per pull response.
    pub max_batch_pages: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            async_poll_ms: 10_000,
            sync_wait_ms: 5_000,
            semi_sync_wait_ms: 100,
            max_batch_pages: 64,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("./arclog"),
            prefix: "arclog".to_string(),
            page_size: 4096,
            active_pages: 1024,
            buffer_pages: 128,
            buffer_growth_percent: 15,
            max_buffer_pages: 4096,
            group_commit: true,
            group_commit_interval_ms: 10,
            fsync_sample: 1,
            prior_drain_bytes: 64 * 1024,
            background_archiving: false,
            archive_io_pages: 64,
            max_archives: 0,
            checkpoint_interval_pages: 0,
            checkpoint_interval_ms: 0,
            writer: WriterConfig::default(),
        }
    }
}

/// Failure to load or validate a [`LogConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read log config {path}: {source}")]
    Read {
        /// File that was opened.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// The file is not valid TOML for this schema.
    #[error("failed to parse log config {path}: {source}")]
    Parse {
        /// File that was parsed.
        path: PathBuf,
        /// Parser error with location.
        source: toml::de::Error,
    },
    /// A value is out of range.
    #[error("invalid log config: {0}")]
    Invalid(String),
}

impl LogConfig {
    /// Config rooted at `log_dir` with every other field defaulted.
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: log_dir.into(),
            ..Self::default()
        }
    }

    /// Reads and validates a TOML config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Parses and validates TOML text.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Explicit file, else the per-user config file if it exists, else defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        match default_config_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Checks value ranges that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));
        if !self.page_size.is_power_of_two()
            || !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&self.page_size)
        {
            return invalid(format!(
                "page_size {} must be a power of two between {MIN_PAGE_SIZE} and {MAX_PAGE_SIZE}",
                self.page_size
            ));
        }
        if self.active_pages < 4 {
            return invalid(format!("active_pages {} must be at least 4", self.active_pages));
        }
        if self.buffer_pages < 3 {
            return invalid(format!("buffer_pages {} must be at least 3", self.buffer_pages));
        }
        if self.max_buffer_pages < self.buffer_pages {
            return invalid(format!(
                "max_buffer_pages {} is below buffer_pages {}",
                self.max_buffer_pages, self.buffer_pages
            ));
        }
        if !(1..=100).contains(&self.buffer_growth_percent) {
            return invalid(format!(
                "buffer_growth_percent {} must be within 1..=100",
                self.buffer_growth_percent
            ));
        }
        if self.prefix.is_empty() {
            return invalid("prefix must not be empty".to_string());
        }
        Ok(())
    }

    /// Flush coordinator settings derived from this config.
    pub fn flush_options(&self) -> FlushOptions {
        FlushOptions {
            group_commit: self.group_commit,
            group_commit_interval: Duration::from_millis(self.group_commit_interval_ms.max(1)),
            fsync_sample: self.fsync_sample.max(1),
            checkpoint_interval_pages: self.checkpoint_interval_pages,
        }
    }

    /// Archiver settings derived from this config.
    pub fn archiver_options(&self) -> ArchiverOptions {
        ArchiverOptions {
            io_pages: self.archive_io_pages,
            max_archives: self.max_archives,
            background: self.background_archiving,
        }
    }

    /// Log-writer hub settings derived from this config.
    pub fn writer_options(&self) -> WriterOptions {
        WriterOptions {
            async_poll: Duration::from_millis(self.writer.async_poll_ms),
            sync_wait: Duration::from_millis(self.writer.sync_wait_ms),
            semi_sync_wait: Duration::from_millis(self.writer.semi_sync_wait_ms),
            max_batch_pages: self.writer.max_batch_pages,
        }
    }

    /// Checkpoint timer period, if the timer is enabled.
    pub fn checkpoint_interval(&self) -> Option<Duration> {
        (self.checkpoint_interval_ms > 0).then(|| Duration::from_millis(self.checkpoint_interval_ms))
    }
}

/// `$XDG_CONFIG_HOME/arclog/config.toml` or the platform equivalent.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|base| base.join("arclog").join("config.toml"))
}
