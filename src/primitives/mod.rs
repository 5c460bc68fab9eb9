//! Low-level primitives for building the log engine.

/// I/O abstractions and utilities.
///
/// Positioned and vectored file access used by every log volume.
pub mod io;
