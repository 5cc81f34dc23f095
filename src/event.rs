//! Change kinds and engine-level signals.

use std::fmt;
use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::DecodeError;

/// The kind of filesystem change reported for a path.
///
/// Produced strictly from the OS raw action code through a total mapping;
/// an unrecognized code is a decode error, never a silent default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// A file or directory was created (or moved into the watched tree).
    Added,

    /// A file or directory was removed (or moved out of the watched tree).
    Removed,

    /// File contents or attributes changed.
    Modified,

    /// A rename occurred; this is the old name.
    RenamedFrom,

    /// A rename occurred; this is the new name.
    RenamedTo,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Added => "added",
            Self::Removed => "removed",
            Self::Modified => "modified",
            Self::RenamedFrom => "renamed from",
            Self::RenamedTo => "renamed to",
        };
        f.write_str(name)
    }
}

/// An engine-level event with no synchronously waiting caller.
///
/// Delivered through the side channel installed with
/// `FileWatcher::set_signal_handler` rather than thrown across the
/// completion boundary.
#[derive(Debug)]
pub enum WatchSignal {
    /// The OS dropped notifications because the buffer was not drained
    /// quickly enough. Some changes were not reported.
    Overflow {
        /// The watched directory whose events were dropped.
        path: PathBuf,
    },

    /// An outstanding read completed with a failure status. Delivery for
    /// this watch has stopped until the caller re-adds it.
    ReadFailed {
        /// The watched directory whose read failed.
        path: PathBuf,
        /// The failure reported by the OS.
        error: io::Error,
    },

    /// A notification buffer could not be decoded. Delivery for this watch
    /// has stopped; this indicates an engine/OS contract violation.
    Decode {
        /// The watched directory whose buffer was malformed.
        path: PathBuf,
        /// The decode failure.
        error: DecodeError,
    },
}
