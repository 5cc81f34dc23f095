//! Notification filter flags.

use bitflags::bitflags;

bitflags! {
    /// Selects which classes of change a watch is notified about.
    ///
    /// Flags combine with bitwise-or and translate to the native
    /// notification mask when the watch is armed. The bit values here are
    /// the crate's own contract; they are deliberately not the native
    /// constants (the mapping table in the engine is the only place that
    /// knows both sides).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct WatchFilter: u32 {
        /// File name changes: create, delete, rename of files.
        const FILE_NAME = 0x01;
        /// Directory name changes: create, delete, rename of directories.
        const DIR_NAME = 0x02;
        /// Attribute changes.
        const ATTRIBUTES = 0x04;
        /// File size changes.
        const SIZE = 0x08;
        /// Last-access time changes.
        const LAST_ACCESS = 0x10;
        /// Last-write time changes.
        const LAST_WRITE = 0x20;
        /// Creation time changes.
        const CREATION = 0x40;
        /// Security descriptor changes.
        const SECURITY = 0x80;

        /// Every notification class.
        const ALL = 0xFF;
    }
}

impl Default for WatchFilter {
    fn default() -> Self {
        Self::ALL
    }
}
