//! The watch engine: registry, watch entries, and native completion
//! plumbing.
//!
//! Single-threaded cooperative model. There is no engine-owned thread: the
//! OS queues completed reads internally and delivers them as completion
//! routines only while the servicing thread sits in an alertable wait
//! ([`FileWatcher::update`] / [`FileWatcher::wait_and_update`]). Every
//! state transition and every user callback therefore runs synchronously
//! on the calling thread.
//!
//! Each watch entry keeps exactly one read outstanding. The entry's buffer
//! is written by the OS while that read is pending and only read back by
//! the decoder on the servicing thread after completion — never both at
//! once. Entries live behind `Rc` and are resolved from the completion
//! routine through a thread-local arena of stable identifiers, so a
//! completion that races with removal finds either a live entry or
//! nothing, never freed memory.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io;
use std::mem;
use std::os::windows::ffi::OsStrExt;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::ptr;
use std::rc::Rc;
use std::time::Duration;

use tracing::{debug, error, info, warn};
use windows_sys::Win32::Foundation::{
    CloseHandle, ERROR_SUCCESS, HANDLE, INVALID_HANDLE_VALUE, STATUS_PENDING,
};
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, FILE_FLAG_BACKUP_SEMANTICS, FILE_FLAG_OVERLAPPED, FILE_LIST_DIRECTORY,
    FILE_NOTIFY_CHANGE_ATTRIBUTES, FILE_NOTIFY_CHANGE_CREATION, FILE_NOTIFY_CHANGE_DIR_NAME,
    FILE_NOTIFY_CHANGE_FILE_NAME, FILE_NOTIFY_CHANGE_LAST_ACCESS, FILE_NOTIFY_CHANGE_LAST_WRITE,
    FILE_NOTIFY_CHANGE_SECURITY, FILE_NOTIFY_CHANGE_SIZE, FILE_SHARE_DELETE, FILE_SHARE_READ,
    FILE_SHARE_WRITE, OPEN_EXISTING, ReadDirectoryChangesW,
};
use windows_sys::Win32::System::IO::{CancelIo, OVERLAPPED};
use windows_sys::Win32::System::Threading::SleepEx;

use crate::config::WatcherConfig;
use crate::decode::{Decoded, decode};
use crate::error::{Result, WatcherError};
use crate::event::{ChangeKind, WatchSignal};
use crate::filter::WatchFilter;

/// Length of one alertable-sleep slice while waiting for cancellation.
const CANCEL_WAIT_SLICE_MS: u32 = 2;

/// Hard bound on cancellation-confirmation slices. Past this the handle is
/// closed regardless and the in-flight memory is leaked, not freed.
const CANCEL_WAIT_SLICES: u32 = 10;

type WatchId = u64;

type ChangeHandler = Box<dyn FnMut(&Path, ChangeKind)>;
type SignalHandler = Box<dyn FnMut(WatchSignal)>;
type SharedSignalHandler = Rc<RefCell<Option<SignalHandler>>>;

thread_local! {
    /// Arena resolving completion-token ids to live entries. Thread-local
    /// because completions only ever run on the thread that armed them.
    static LIVE_ENTRIES: RefCell<HashMap<WatchId, Rc<WatchEntry>>> =
        RefCell::new(HashMap::new());

    static NEXT_ID: Cell<WatchId> = const { Cell::new(0) };
}

fn next_watch_id() -> WatchId {
    NEXT_ID.with(|next| {
        let id = next.get();
        next.set(id + 1);
        id
    })
}

/// The async operation's identity, heap-allocated so its address is stable
/// for the lifetime of the outstanding read.
///
/// The `OVERLAPPED` must stay the first field: the completion routine
/// receives its address and reads the arena id stored right behind it.
#[repr(C)]
struct CompletionToken {
    overlapped: OVERLAPPED,
    id: WatchId,
}

/// Completion routine invoked by the OS during an alertable wait.
///
/// Resolves the token id through the arena; a missing id means the watch
/// was removed while this completion was queued, in which case there is
/// nothing to do (the token memory is still alive or deliberately leaked).
unsafe extern "system" fn change_completion(
    error_code: u32,
    bytes_transferred: u32,
    overlapped: *mut OVERLAPPED,
) {
    let id = unsafe { (*overlapped.cast::<CompletionToken>()).id };
    let entry = LIVE_ENTRIES.with(|entries| entries.borrow().get(&id).cloned());
    // The clone keeps the entry alive for the whole callback even if a
    // handler removes it from the registry mid-dispatch.
    if let Some(entry) = entry {
        entry.on_read_complete(error_code, bytes_transferred as usize);
    }
}

/// Watch entry lifecycle states.
///
/// `Idle -> ReadArmed -> (Completing -> ReadArmed)` loop, with
/// `Cancelling -> Closed` terminal. A failed read or decode parks the
/// entry back in `Idle` without re-arming; delivery stays stopped until
/// the caller re-adds the watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WatchState {
    Idle,
    ReadArmed,
    Completing,
    Cancelling,
    Closed,
}

/// One registered watch: a directory handle, a reusable notification
/// buffer, and the user callback, driving one outstanding read at a time.
struct WatchEntry {
    id: WatchId,
    path: PathBuf,
    recursive: bool,
    /// Native notification mask, translated once at registration.
    filter: u32,
    handle: HANDLE,
    /// `u32` backing store guarantees the 4-byte alignment the record
    /// layout requires.
    buffer: RefCell<Vec<u32>>,
    token: Cell<*mut CompletionToken>,
    state: Cell<WatchState>,
    /// Set when the cancelled read's completion is drained during close.
    drained: Cell<bool>,
    handler: RefCell<ChangeHandler>,
    signal: SharedSignalHandler,
}

impl WatchEntry {
    fn open(
        path: PathBuf,
        filter: WatchFilter,
        recursive: bool,
        buffer_size: usize,
        handler: ChangeHandler,
        signal: SharedSignalHandler,
    ) -> Result<Rc<Self>> {
        let wide_path = to_wide(&path);
        // Sharing must not block concurrent readers, writers, or deleters
        // of the watched directory.
        let handle = unsafe {
            CreateFileW(
                wide_path.as_ptr(),
                FILE_LIST_DIRECTORY,
                FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE,
                ptr::null(),
                OPEN_EXISTING,
                FILE_FLAG_BACKUP_SEMANTICS | FILE_FLAG_OVERLAPPED,
                0,
            )
        };
        if handle == INVALID_HANDLE_VALUE {
            return Err(WatcherError::OpenFailed {
                path,
                source: io::Error::last_os_error(),
            });
        }

        let id = next_watch_id();
        let token = Box::into_raw(Box::new(CompletionToken {
            overlapped: unsafe { mem::zeroed() },
            id,
        }));

        Ok(Rc::new(Self {
            id,
            path,
            recursive,
            filter: native_filter(filter),
            handle,
            buffer: RefCell::new(vec![0u32; buffer_size / 4]),
            token: Cell::new(token),
            state: Cell::new(WatchState::Idle),
            drained: Cell::new(false),
            handler: RefCell::new(handler),
            signal,
        }))
    }

    /// Issue the next asynchronous read into the entry's buffer.
    ///
    /// At most one read is ever outstanding; callers arm only from `Idle`
    /// (registration) or `Completing` (the re-arm after dispatch).
    fn arm(&self) -> io::Result<()> {
        let token = self.token.get();
        debug_assert!(!token.is_null());
        debug_assert!(
            matches!(self.state.get(), WatchState::Idle | WatchState::Completing),
            "arm with a read already outstanding",
        );

        let (buffer_ptr, buffer_len) = {
            let mut buffer = self.buffer.borrow_mut();
            (buffer.as_mut_ptr(), buffer.len() * mem::size_of::<u32>())
        };

        unsafe {
            (*token).overlapped = mem::zeroed();
            let ok = ReadDirectoryChangesW(
                self.handle,
                buffer_ptr.cast(),
                buffer_len as u32,
                i32::from(self.recursive),
                self.filter,
                ptr::null_mut(),
                &mut (*token).overlapped,
                Some(change_completion),
            );
            if ok == 0 {
                return Err(io::Error::last_os_error());
            }
        }
        self.state.set(WatchState::ReadArmed);
        Ok(())
    }

    /// Handle one completed read: decode, dispatch, re-arm.
    fn on_read_complete(&self, error_code: u32, bytes: usize) {
        match self.state.get() {
            WatchState::ReadArmed => {}
            // The read was cancelled; this completion only confirms the
            // pending-operation slot is clear.
            WatchState::Cancelling | WatchState::Closed => {
                self.drained.set(true);
                return;
            }
            // One outstanding read per entry: no completion can arrive in
            // any other state.
            other => {
                debug_assert!(false, "completion delivered in state {other:?}");
                return;
            }
        }

        if error_code != ERROR_SUCCESS {
            let error = io::Error::from_raw_os_error(error_code as i32);
            error!(
                path = %self.path.display(),
                %error,
                "async change read failed; delivery stopped for this watch",
            );
            // Not re-armed: retrying blindly risks a tight failure loop.
            self.state.set(WatchState::Idle);
            self.emit(WatchSignal::ReadFailed {
                path: self.path.clone(),
                error,
            });
            return;
        }

        self.state.set(WatchState::Completing);

        let mut overflowed = false;
        {
            let buffer = self.buffer.borrow();
            // 4-byte aligned by construction; view the words as bytes.
            let raw = unsafe {
                std::slice::from_raw_parts(
                    buffer.as_ptr().cast::<u8>(),
                    buffer.len() * mem::size_of::<u32>(),
                )
            };
            match decode(raw, bytes) {
                Decoded::Overflow => overflowed = true,
                Decoded::Records(records) => {
                    for record in records {
                        match record {
                            Ok(record) => {
                                self.dispatch(&record.relative_path, record.kind);
                            }
                            Err(error) => {
                                error!(
                                    path = %self.path.display(),
                                    %error,
                                    "notification buffer failed to decode; delivery stopped",
                                );
                                self.state.set(WatchState::Idle);
                                self.emit(WatchSignal::Decode {
                                    path: self.path.clone(),
                                    error,
                                });
                                return;
                            }
                        }
                    }
                }
            }
        }

        if overflowed {
            warn!(
                path = %self.path.display(),
                "notification buffer overflowed; some changes were not reported",
            );
            self.emit(WatchSignal::Overflow {
                path: self.path.clone(),
            });
        }

        // A handler may have torn this watch down mid-dispatch; never
        // re-arm a closed entry.
        if self.state.get() != WatchState::Completing {
            return;
        }

        // Re-arm with the same buffer in place.
        if let Err(error) = self.arm() {
            error!(
                path = %self.path.display(),
                %error,
                "failed to re-arm change read; delivery stopped for this watch",
            );
            self.state.set(WatchState::Idle);
            self.emit(WatchSignal::ReadFailed {
                path: self.path.clone(),
                error,
            });
        }
    }

    /// Invoke the user callback for one decoded change.
    ///
    /// Panics are caught and discarded at this boundary: a panic must not
    /// unwind into the OS completion dispatcher, and one bad handler must
    /// not stop delivery for other watches.
    fn dispatch(&self, relative_path: &Path, kind: ChangeKind) {
        let absolute = self.path.join(relative_path);
        debug!(path = %absolute.display(), %kind, "change");
        let mut handler = self.handler.borrow_mut();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| (*handler)(&absolute, kind)));
        if outcome.is_err() {
            error!(
                path = %absolute.display(),
                "change handler panicked; panic discarded",
            );
        }
    }

    /// Deliver an engine-level signal, if a handler is installed.
    fn emit(&self, signal: WatchSignal) {
        if let Some(handler) = self.signal.borrow_mut().as_mut() {
            let outcome = panic::catch_unwind(AssertUnwindSafe(move || handler(signal)));
            if outcome.is_err() {
                error!("signal handler panicked; panic discarded");
            }
        }
    }

    /// Cancel any outstanding read and release the native resources.
    ///
    /// Best-effort drain with a hard timeout: cancel the pending read,
    /// re-issue a terminal read with no completion routine so nothing new
    /// can be queued against this entry, and sleep alertably in short
    /// slices until the cancelled completion drains. The handle is closed
    /// once drained or once the bound elapses; if the OS never confirmed,
    /// the buffer and token are leaked instead of freed so a straggler
    /// completion can never touch reclaimed memory.
    fn close(&self) {
        if self.state.get() == WatchState::Closed {
            return;
        }
        let had_outstanding = self.state.get() == WatchState::ReadArmed;
        self.state.set(WatchState::Cancelling);

        let token = self.token.replace(ptr::null_mut());
        if token.is_null() {
            unsafe { CloseHandle(self.handle) };
            self.state.set(WatchState::Closed);
            return;
        }

        if had_outstanding {
            unsafe {
                CancelIo(self.handle);
                // Terminal read: same slot, no completion routine. Ensures
                // the OS will not later queue a callback against an entry
                // that believes its handle is closed.
                let (buffer_ptr, buffer_len) = {
                    let mut buffer = self.buffer.borrow_mut();
                    (buffer.as_mut_ptr(), buffer.len() * mem::size_of::<u32>())
                };
                (*token).overlapped = mem::zeroed();
                ReadDirectoryChangesW(
                    self.handle,
                    buffer_ptr.cast(),
                    buffer_len as u32,
                    i32::from(self.recursive),
                    self.filter,
                    ptr::null_mut(),
                    &mut (*token).overlapped,
                    None,
                );
            }

            // Drain the cancelled completion, bounded.
            for _ in 0..CANCEL_WAIT_SLICES {
                if self.drained.get() {
                    break;
                }
                unsafe { SleepEx(CANCEL_WAIT_SLICE_MS, 1) };
            }
        }

        unsafe { CloseHandle(self.handle) };

        // Closing cancels the terminal read; wait (bounded) for the OS to
        // write its final status before freeing the overlapped memory.
        let mut confirmed = overlapped_completed(token);
        for _ in 0..CANCEL_WAIT_SLICES {
            if confirmed {
                break;
            }
            unsafe { SleepEx(CANCEL_WAIT_SLICE_MS, 1) };
            confirmed = overlapped_completed(token);
        }

        if confirmed {
            drop(unsafe { Box::from_raw(token) });
        } else {
            // Residual risk window, accepted rather than hanging forever:
            // the operation may still complete after this point, so its
            // memory must outlive us. Leak the token and the buffer.
            warn!(
                path = %self.path.display(),
                "cancellation unconfirmed within bound; leaking watch buffer",
            );
            mem::forget(mem::take(&mut *self.buffer.borrow_mut()));
        }
        self.state.set(WatchState::Closed);
    }
}

/// `HasOverlappedIoCompleted`: the kernel parks `STATUS_PENDING` in
/// `Internal` while the operation is outstanding.
fn overlapped_completed(token: *const CompletionToken) -> bool {
    let status = unsafe { ptr::read_volatile(&raw const (*token).overlapped.Internal) };
    status != STATUS_PENDING as usize
}

fn to_wide(path: &Path) -> Vec<u16> {
    path.as_os_str().encode_wide().chain(std::iter::once(0)).collect()
}

/// One-way translation from the public filter bits to the native
/// notification mask. The layouts differ (the OS swaps the last-access
/// and last-write positions), so this table is the only place that knows
/// both sides.
fn native_filter(filter: WatchFilter) -> u32 {
    const TABLE: [(WatchFilter, u32); 8] = [
        (WatchFilter::FILE_NAME, FILE_NOTIFY_CHANGE_FILE_NAME),
        (WatchFilter::DIR_NAME, FILE_NOTIFY_CHANGE_DIR_NAME),
        (WatchFilter::ATTRIBUTES, FILE_NOTIFY_CHANGE_ATTRIBUTES),
        (WatchFilter::SIZE, FILE_NOTIFY_CHANGE_SIZE),
        (WatchFilter::LAST_ACCESS, FILE_NOTIFY_CHANGE_LAST_ACCESS),
        (WatchFilter::LAST_WRITE, FILE_NOTIFY_CHANGE_LAST_WRITE),
        (WatchFilter::CREATION, FILE_NOTIFY_CHANGE_CREATION),
        (WatchFilter::SECURITY, FILE_NOTIFY_CHANGE_SECURITY),
    ];

    let mut mask = 0;
    for (bit, native) in TABLE {
        if filter.contains(bit) {
            mask |= native;
        }
    }
    mask
}

/// Normalize to a canonical absolute path so no two registrations can
/// alias the same directory.
fn normalize(path: &Path) -> Result<PathBuf> {
    dunce::canonicalize(path).map_err(|err| match err.kind() {
        io::ErrorKind::NotFound => WatcherError::PathNotFound(path.to_path_buf()),
        _ => WatcherError::Io(err),
    })
}

/// Resolve a caller path to the registry's key form for lookups.
///
/// Canonicalization needs the directory to still exist; a watch root that
/// has been deleted out from under its watch must remain addressable, so
/// the fallback absolutizes lexically instead.
fn lookup_key(path: &Path) -> PathBuf {
    normalize(path)
        .or_else(|_| std::path::absolute(path).map_err(WatcherError::Io))
        .unwrap_or_else(|_| path.to_path_buf())
}

/// The watch registry: maps normalized directory paths to watch entries
/// and drives completion delivery.
///
/// `FileWatcher` is deliberately not `Send`: all registration, servicing,
/// and callbacks happen on one thread. Watches can be removed from inside
/// a change callback for a *different* watch; removing a watch from inside
/// its own callback is not supported.
pub struct FileWatcher {
    buffer_size: usize,
    entries: RefCell<HashMap<PathBuf, Rc<WatchEntry>>>,
    signal: SharedSignalHandler,
}

impl FileWatcher {
    /// Create a watcher with the default configuration.
    pub fn new() -> Result<Self> {
        Self::with_config(WatcherConfig::default())
    }

    /// Create a watcher with an explicit configuration.
    ///
    /// Fails fast with [`WatcherError::InvalidBufferSize`] on an unusable
    /// buffer size.
    pub fn with_config(config: WatcherConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            buffer_size: config.buffer_size,
            entries: RefCell::new(HashMap::new()),
            signal: Rc::new(RefCell::new(None)),
        })
    }

    /// Install the engine-level signal handler, replacing any previous
    /// one. Overflow, read-failure, and decode-failure events arrive here
    /// because no caller is synchronously waiting when they occur.
    pub fn set_signal_handler(&self, handler: impl FnMut(WatchSignal) + 'static) {
        *self.signal.borrow_mut() = Some(Box::new(handler));
    }

    /// Register a watch on `path` and arm its first read.
    ///
    /// The handler is invoked synchronously on the servicing thread with
    /// the absolute path of each changed entry. Registering a path that is
    /// already watched fails with [`WatcherError::AlreadyWatched`]; the
    /// existing watch is never silently replaced.
    pub fn add_watch(
        &self,
        path: impl AsRef<Path>,
        filter: WatchFilter,
        recursive: bool,
        handler: impl FnMut(&Path, ChangeKind) + 'static,
    ) -> Result<()> {
        let path = normalize(path.as_ref())?;
        if !path.is_dir() {
            return Err(WatcherError::PathNotFound(path));
        }
        if self.entries.borrow().contains_key(&path) {
            return Err(WatcherError::AlreadyWatched(path));
        }

        let entry = WatchEntry::open(
            path.clone(),
            filter,
            recursive,
            self.buffer_size,
            Box::new(handler),
            Rc::clone(&self.signal),
        )?;

        LIVE_ENTRIES.with(|entries| {
            entries.borrow_mut().insert(entry.id, Rc::clone(&entry));
        });
        if let Err(source) = entry.arm() {
            LIVE_ENTRIES.with(|entries| {
                entries.borrow_mut().remove(&entry.id);
            });
            entry.close();
            return Err(WatcherError::ReadFailed { path, source });
        }
        self.entries.borrow_mut().insert(path.clone(), entry);

        info!(path = %path.display(), recursive, "watch added");
        Ok(())
    }

    /// Remove the watch on `path`, cancelling and draining its
    /// outstanding read before the handle is released.
    ///
    /// Removing a path that is not watched is a no-op.
    pub fn remove_watch(&self, path: impl AsRef<Path>) -> Result<()> {
        let normalized = lookup_key(path.as_ref());

        let entry = self.entries.borrow_mut().remove(&normalized);
        let Some(entry) = entry else {
            return Ok(());
        };

        entry.close();
        LIVE_ENTRIES.with(|entries| {
            entries.borrow_mut().remove(&entry.id);
        });

        info!(path = %normalized.display(), "watch removed");
        Ok(())
    }

    /// Drain whatever completions are already queued, without blocking.
    pub fn update(&self) {
        // Zero-duration alertable wait.
        unsafe { SleepEx(0, 1) };
    }

    /// Sleep alertably for up to `timeout`, running any completions that
    /// arrive meanwhile.
    ///
    /// Returns once the sleep period elapses, not at the first completion;
    /// multiple completions may run within a single call.
    pub fn wait_and_update(&self, timeout: Duration) {
        let millis = timeout.as_millis().min(u128::from(u32::MAX - 1)) as u32;
        unsafe { SleepEx(millis, 1) };
    }

    /// Whether `path` currently has a registered watch.
    pub fn is_watched(&self, path: impl AsRef<Path>) -> bool {
        let key = lookup_key(path.as_ref());
        self.entries.borrow().contains_key(&key)
    }

    /// The normalized paths of all registered watches.
    pub fn watched_paths(&self) -> Vec<PathBuf> {
        self.entries.borrow().keys().cloned().collect()
    }

    /// Number of registered watches.
    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    /// Whether no watches are registered.
    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        // Drain the map before closing anything: closing sleeps alertably,
        // which can dispatch completions for the remaining watches, and
        // their handlers must not find the registry mid-borrow.
        let entries: Vec<_> = self
            .entries
            .borrow_mut()
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        for entry in entries {
            entry.close();
            LIVE_ENTRIES.with(|live| {
                live.borrow_mut().remove(&entry.id);
            });
        }
    }
}
