//! Error types for the watch engine.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for watcher operations.
pub type Result<T> = std::result::Result<T, WatcherError>;

/// Errors that can occur while registering, removing, or driving watches.
#[derive(Error, Debug)]
pub enum WatcherError {
    /// The watch target does not exist or is not a directory.
    #[error("path not found or not a directory: {0}")]
    PathNotFound(PathBuf),

    /// The OS refused to open a directory handle for watching.
    #[error("failed to open directory handle for {path}")]
    OpenFailed {
        /// The directory that could not be opened.
        path: PathBuf,
        /// The underlying OS error.
        #[source]
        source: io::Error,
    },

    /// The normalized path is already registered.
    #[error("already watching: {0}")]
    AlreadyWatched(PathBuf),

    /// Arming the asynchronous change read failed.
    #[error("failed to arm change read for {path}")]
    ReadFailed {
        /// The directory whose read could not be armed.
        path: PathBuf,
        /// The underlying OS error.
        #[source]
        source: io::Error,
    },

    /// A notification buffer violated the record format contract.
    #[error("malformed change notification: {0}")]
    Decode(#[from] DecodeError),

    /// The configured buffer size is unusable.
    #[error("invalid buffer size {0}: must be a non-zero multiple of 4 no larger than 64 KiB")]
    InvalidBufferSize(usize),

    /// Other IO error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Errors produced while decoding a raw notification buffer.
///
/// These indicate a violated contract between the OS and the engine, not a
/// transient fault: a correct buffer never triggers them.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The record carried an action code outside the documented set.
    #[error("unrecognized action code {0:#x}")]
    UnknownAction(u32),

    /// A record header, name, or chain offset points past the valid bytes.
    #[error("record at offset {offset} overruns the {len} valid buffer bytes")]
    Truncated {
        /// Byte offset of the offending record.
        offset: usize,
        /// Number of valid bytes in the buffer.
        len: usize,
    },

    /// The record name is not valid UTF-16 (or has an odd byte length).
    #[error("record at offset {offset} has a malformed UTF-16 file name")]
    InvalidFileName {
        /// Byte offset of the offending record.
        offset: usize,
    },
}
