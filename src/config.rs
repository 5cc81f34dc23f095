//! Engine configuration.

use serde::{Deserialize, Serialize};

use crate::error::{Result, WatcherError};

/// Default notification buffer size in bytes.
pub const DEFAULT_BUFFER_SIZE: usize = 8 * 1024;

/// Largest notification buffer the OS accepts, in bytes.
///
/// Network paths may impose a smaller effective limit; the OS then reports
/// every completion as an overflow rather than failing registration.
pub const MAX_BUFFER_SIZE: usize = 64 * 1024;

/// Configuration for a watch engine instance.
///
/// One buffer of `buffer_size` bytes is allocated per watch and reused for
/// every read on that watch. Undersized buffers increase overflow-signal
/// frequency under burst write load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatcherConfig {
    /// Per-watch notification buffer size in bytes.
    ///
    /// Must be a non-zero multiple of 4 no larger than
    /// [`MAX_BUFFER_SIZE`] — an OS constraint on the notification record
    /// layout, validated at engine construction.
    pub buffer_size: usize,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl WatcherConfig {
    /// Create a configuration with the default buffer size.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-watch buffer size.
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Validate the configuration, failing fast on unusable values.
    pub fn validate(&self) -> Result<()> {
        if self.buffer_size == 0
            || self.buffer_size % 4 != 0
            || self.buffer_size > MAX_BUFFER_SIZE
        {
            return Err(WatcherError::InvalidBufferSize(self.buffer_size));
        }
        Ok(())
    }
}
