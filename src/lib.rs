//! # dirwatch
//!
//! Asynchronous directory change notifications delivered through the host
//! OS's native watch facility, without polling and without a background
//! thread.
//!
//! The engine targets the Windows overlapped `ReadDirectoryChangesW`
//! mechanism with completion-routine delivery. Completions only run while
//! the caller's thread sits in an alertable wait, so everything — decoding,
//! dispatch, re-arming — happens synchronously inside [`FileWatcher::update`]
//! or [`FileWatcher::wait_and_update`].
//!
//! ## Architecture
//!
//! ```text
//! FileWatcher (registry: path -> entry)
//!     │ add_watch / remove_watch
//!     ▼
//! WatchEntry (handle, buffer, one outstanding read)
//!     │ completion
//!     ▼
//! decode (raw buffer -> (relative path, ChangeKind) records)
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! # #[cfg(windows)]
//! # fn main() -> dirwatch::Result<()> {
//! use std::time::Duration;
//!
//! use dirwatch::{FileWatcher, WatchFilter};
//!
//! let watcher = FileWatcher::new()?;
//! watcher.add_watch("C:\\projects", WatchFilter::ALL, true, |path, kind| {
//!     println!("{kind}: {}", path.display());
//! })?;
//!
//! loop {
//!     watcher.wait_and_update(Duration::from_millis(500));
//! }
//! # }
//! # #[cfg(not(windows))]
//! # fn main() {}
//! ```
//!
//! The decoder, filter, configuration, and error types are platform
//! independent and usable (and tested) everywhere; only the watch engine
//! itself is compiled on Windows.

pub mod config;
pub mod decode;
pub mod error;
pub mod event;
pub mod filter;
#[cfg(windows)]
pub mod watcher;

pub use config::{DEFAULT_BUFFER_SIZE, MAX_BUFFER_SIZE, WatcherConfig};
pub use decode::{ChangeRecord, Decoded, decode};
pub use error::{DecodeError, Result, WatcherError};
pub use event::{ChangeKind, WatchSignal};
pub use filter::WatchFilter;
#[cfg(windows)]
pub use watcher::FileWatcher;
