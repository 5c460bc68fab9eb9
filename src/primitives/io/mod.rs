#![forbid(unsafe_code)]

use std::fs::{File, OpenOptions};
use std::io::{self, IoSlice};
use std::path::Path;

use tracing::trace;

use crate::types::{LogError, Result};

/// Positioned access to one volume file.
///
/// Offsets are absolute; implementations never move a shared cursor, so a
/// single handle may serve concurrent readers and the flusher.
pub trait FileIo: Send + Sync {
    /// Fills `dst` from `off`; a short file is an `UnexpectedEof` error.
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()>;
    /// Writes all of `src` at `off`.
    fn write_at(&self, off: u64, src: &[u8]) -> Result<()>;

    /// Writes `bufs` back to back starting at `off`.
    fn write_vectored_at(&self, off: u64, bufs: &[IoSlice<'_>]) -> Result<()> {
        let mut pos = off;
        for buf in bufs.iter().filter(|b| !b.is_empty()) {
            self.write_at(pos, buf)?;
            pos += buf.len() as u64;
        }
        Ok(())
    }

    /// Flushes file contents and metadata.
    fn sync_all(&self) -> Result<()>;
    /// Flushes file contents only; enough once the file length is fixed.
    fn sync_data(&self) -> Result<()>;
    /// Current file length in bytes.
    fn len(&self) -> Result<u64>;
    /// Grows or truncates the file.
    fn set_len(&self, len: u64) -> Result<()>;
}

#[cfg(unix)]
fn read_exact_at(file: &File, off: u64, dst: &mut [u8]) -> io::Result<()> {
    std::os::unix::fs::FileExt::read_exact_at(file, dst, off)
}

#[cfg(unix)]
fn write_all_at(file: &File, off: u64, src: &[u8]) -> io::Result<()> {
    std::os::unix::fs::FileExt::write_all_at(file, src, off)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut off: u64, mut dst: &mut [u8]) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !dst.is_empty() {
        match file.seek_read(dst, off)? {
            0 => return Err(io::ErrorKind::UnexpectedEof.into()),
            n => {
                dst = &mut dst[n..];
                off += n as u64;
            }
        }
    }
    Ok(())
}

#[cfg(windows)]
fn write_all_at(file: &File, mut off: u64, mut src: &[u8]) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !src.is_empty() {
        match file.seek_write(src, off)? {
            0 => return Err(io::ErrorKind::WriteZero.into()),
            n => {
                src = &src[n..];
                off += n as u64;
            }
        }
    }
    Ok(())
}

#[cfg(not(any(unix, windows)))]
fn read_exact_at(_file: &File, _off: u64, _dst: &mut [u8]) -> io::Result<()> {
    Err(io::ErrorKind::Unsupported.into())
}

#[cfg(not(any(unix, windows)))]
fn write_all_at(_file: &File, _off: u64, _src: &[u8]) -> io::Result<()> {
    Err(io::ErrorKind::Unsupported.into())
}

/// A volume file on the local filesystem.
pub struct DiskFile {
    file: File,
}

impl DiskFile {
    /// Opens an existing volume for reading and writing.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self { file })
    }

    /// Opens a volume that is never written again, such as a finished archive.
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        Ok(Self { file })
    }

    /// Creates `path`, discarding any previous contents.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self { file })
    }
}

impl FileIo for DiskFile {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        Ok(read_exact_at(&self.file, off, dst)?)
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        Ok(write_all_at(&self.file, off, src)?)
    }

    fn sync_all(&self) -> Result<()> {
        self.file.sync_all().map_err(|err| {
            trace!(error = %err, "io.sync_all.failed");
            LogError::from(err)
        })
    }

    fn sync_data(&self) -> Result<()> {
        self.file.sync_data().map_err(|err| {
            trace!(error = %err, "io.sync_data.failed");
            LogError::from(err)
        })
    }

    fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn set_len(&self, len: u64) -> Result<()> {
        Ok(self.file.set_len(len)?)
    }
}
