//! Windows backend: overlapped `ReadDirectoryChangesW` per subscription.
//!
//! One alertable worker thread services every subscription through APCs and
//! I/O completion routines, so all per-subscription state is mutated from a
//! single thread. Renames arrive as an old-name/new-name record pair; the
//! old name parks in `pending_moves` keyed by the file's volume identifier,
//! and a new name with the same identifier within the TTL becomes a linked
//! rename instead of a bare create.

use std::collections::HashMap;
use std::ffi::{c_void, OsString};
use std::os::windows::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use windows_sys::Win32::Foundation::{
    CloseHandle, DuplicateHandle, DUPLICATE_SAME_ACCESS, ERROR_ACCESS_DENIED,
    ERROR_INVALID_PARAMETER, ERROR_NOTIFY_ENUM_DIR, ERROR_OPERATION_ABORTED, ERROR_SUCCESS,
    FALSE, FILETIME, HANDLE, INVALID_HANDLE_VALUE, TRUE,
};
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, GetFileAttributesExW, GetFileAttributesW, GetFileInformationByHandle,
    BY_HANDLE_FILE_INFORMATION, FILE_ACTION_ADDED, FILE_ACTION_MODIFIED, FILE_ACTION_REMOVED,
    FILE_ACTION_RENAMED_NEW_NAME, FILE_ACTION_RENAMED_OLD_NAME, FILE_ATTRIBUTE_DIRECTORY,
    FILE_ATTRIBUTE_REPARSE_POINT, FILE_FLAG_BACKUP_SEMANTICS, FILE_FLAG_OVERLAPPED,
    FILE_LIST_DIRECTORY, FILE_NOTIFY_CHANGE_ATTRIBUTES, FILE_NOTIFY_CHANGE_DIR_NAME,
    FILE_NOTIFY_CHANGE_FILE_NAME, FILE_NOTIFY_CHANGE_LAST_WRITE, FILE_NOTIFY_CHANGE_SIZE,
    FILE_NOTIFY_INFORMATION, FILE_SHARE_DELETE, FILE_SHARE_READ, FILE_SHARE_WRITE,
    GetFileExInfoStandard, INVALID_FILE_ATTRIBUTES, OPEN_EXISTING, ReadDirectoryChangesW,
    WIN32_FILE_ATTRIBUTE_DATA,
};
use windows_sys::Win32::System::Threading::{
    GetCurrentProcess, GetCurrentThread, QueueUserAPC, SleepEx, INFINITE,
};
use windows_sys::Win32::System::IO::{CancelIo, OVERLAPPED};

use crate::backend::{brute_force, Backend, BackendCore, BackendKind};
use crate::error::{Error, Result};
use crate::event::{Kind, FAKE_FILEID, FAKE_INO};
use crate::tree::DirTree;
use crate::watcher::Watcher;

const DEFAULT_BUF_SIZE: usize = 1024 * 1024;

/// `ReadDirectoryChangesW` over a network path rejects large buffers.
const NETWORK_BUF_SIZE: usize = 64 * 1024;

/// How long an old-name record waits for its matching new name.
const PENDING_MOVE_TTL: Duration = Duration::from_secs(5);

const NOTIFY_FILTER: u32 = FILE_NOTIFY_CHANGE_FILE_NAME
    | FILE_NOTIFY_CHANGE_DIR_NAME
    | FILE_NOTIFY_CHANGE_ATTRIBUTES
    | FILE_NOTIFY_CHANGE_SIZE
    | FILE_NOTIFY_CHANGE_LAST_WRITE;

struct ThreadHandle(HANDLE);
unsafe impl Send for ThreadHandle {}

struct SubscriptionHandle {
    watcher: Arc<Watcher>,
    sub: *mut Subscription,
}
unsafe impl Send for SubscriptionHandle {}

pub(crate) struct WindowsBackend {
    core: BackendCore,
    thread: Mutex<Option<ThreadHandle>>,
    subscriptions: Mutex<Vec<SubscriptionHandle>>,
    /// Set by the worker before the startup handshake completes; lets
    /// subscriptions route errors back through the shared dispatch.
    weak_self: Mutex<Weak<WindowsBackend>>,
}

impl WindowsBackend {
    pub fn new() -> Self {
        Self {
            core: BackendCore::new(BackendKind::Windows),
            thread: Mutex::new(None),
            subscriptions: Mutex::new(Vec::new()),
            weak_self: Mutex::new(Weak::new()),
        }
    }

    fn thread_handle(&self) -> Result<HANDLE> {
        self.thread
            .lock()
            .unwrap()
            .as_ref()
            .map(|handle| handle.0)
            .ok_or_else(|| Error::backend("backend thread is not running"))
    }

    fn queue_apc(&self, func: unsafe extern "system" fn(usize), data: usize) -> Result<()> {
        let thread = self.thread_handle()?;
        let queued = unsafe { QueueUserAPC(Some(func), thread, data) };
        if queued == 0 {
            return Err(Error::backend("unable to queue APC"));
        }
        Ok(())
    }
}

impl Backend for WindowsBackend {
    fn core(&self) -> &BackendCore {
        &self.core
    }

    fn run(self: Arc<Self>) {
        *self.weak_self.lock().unwrap() = Arc::downgrade(&self);
        unsafe {
            let mut handle: HANDLE = ptr::null_mut();
            let ok = DuplicateHandle(
                GetCurrentProcess(),
                GetCurrentThread(),
                GetCurrentProcess(),
                &mut handle,
                0,
                FALSE,
                DUPLICATE_SAME_ACCESS,
            );
            if ok == 0 {
                self.core
                    .fail_start(Error::backend("unable to duplicate thread handle"));
                return;
            }
            *self.thread.lock().unwrap() = Some(ThreadHandle(handle));
        }
        self.core.notify_started();

        // Alertable sleep: every subscription's polling and teardown runs as
        // an APC or completion routine on this thread.
        while self.core.is_running() {
            unsafe {
                SleepEx(INFINITE, TRUE);
            }
        }

        if let Some(handle) = self.thread.lock().unwrap().take() {
            unsafe {
                CloseHandle(handle.0);
            }
        }
        self.core.ended.notify();
    }

    fn wake(&self) {
        let _ = self.queue_apc(noop_apc, 0);
    }

    fn subscribe(&self, watcher: &Arc<Watcher>) -> Result<()> {
        let tree = brute_force::get_tree(watcher)?;
        watcher.set_tree(Arc::clone(&tree));

        let subscription = Subscription::open(
            self.weak_self.lock().unwrap().clone(),
            Arc::clone(watcher),
            tree,
        );
        let subscription = match subscription {
            Ok(subscription) => subscription,
            Err(error) => {
                watcher.clear_tree();
                return Err(error);
            }
        };

        let raw = Box::into_raw(Box::new(subscription));
        self.subscriptions.lock().unwrap().push(SubscriptionHandle {
            watcher: Arc::clone(watcher),
            sub: raw,
        });

        if let Err(error) = self.queue_apc(start_poll_apc, raw as usize) {
            self.subscriptions
                .lock()
                .unwrap()
                .retain(|handle| handle.sub != raw);
            unsafe {
                let mut subscription = Box::from_raw(raw);
                subscription.close_handle();
            }
            watcher.clear_tree();
            return Err(error);
        }
        Ok(())
    }

    fn unsubscribe(&self, watcher: &Arc<Watcher>) -> Result<()> {
        let raw = {
            let mut subscriptions = self.subscriptions.lock().unwrap();
            let index = subscriptions
                .iter()
                .position(|handle| Arc::ptr_eq(&handle.watcher, watcher));
            index.map(|index| subscriptions.swap_remove(index).sub)
        };
        watcher.clear_tree();

        if let Some(raw) = raw {
            // Teardown must run on the worker: the subscription may have a
            // completion routine in flight referencing it.
            self.queue_apc(stop_apc, raw as usize)?;
        }
        Ok(())
    }

    fn write_snapshot(&self, watcher: &Arc<Watcher>, snapshot_path: &Path) -> Result<()> {
        brute_force::write_snapshot(watcher, snapshot_path)
    }

    fn get_events_since(&self, watcher: &Arc<Watcher>, snapshot_path: &Path) -> Result<()> {
        brute_force::events_since(watcher, snapshot_path)
    }
}

struct PendingMove {
    path: PathBuf,
    at: Instant,
}

struct Subscription {
    backend: Weak<WindowsBackend>,
    watcher: Arc<Watcher>,
    tree: Arc<DirTree>,
    handle: HANDLE,
    running: bool,
    io_pending: bool,
    doomed: bool,
    read_buffer: Vec<u8>,
    write_buffer: Vec<u8>,
    overlapped: OVERLAPPED,
    pending_moves: HashMap<String, PendingMove>,
}

impl Subscription {
    fn open(
        backend: Weak<WindowsBackend>,
        watcher: Arc<Watcher>,
        tree: Arc<DirTree>,
    ) -> Result<Subscription> {
        let wide = extended_wide_path(watcher.dir());
        let handle = unsafe {
            CreateFileW(
                wide.as_ptr(),
                FILE_LIST_DIRECTORY,
                FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE,
                ptr::null(),
                OPEN_EXISTING,
                FILE_FLAG_BACKUP_SEMANTICS | FILE_FLAG_OVERLAPPED,
                ptr::null_mut(),
            )
        };
        if handle == INVALID_HANDLE_VALUE {
            return Err(Error::io(
                watcher.dir(),
                std::io::Error::last_os_error(),
            ));
        }

        let mut info: BY_HANDLE_FILE_INFORMATION = unsafe { std::mem::zeroed() };
        let ok = unsafe { GetFileInformationByHandle(handle, &mut info) };
        if ok == 0 {
            unsafe { CloseHandle(handle) };
            return Err(Error::io(
                watcher.dir(),
                std::io::Error::last_os_error(),
            ));
        }
        if !is_directory_attrs(info.dwFileAttributes) {
            unsafe { CloseHandle(handle) };
            return Err(Error::config(format!(
                "watched path is not a directory: {}",
                watcher.dir().display()
            )));
        }

        Ok(Subscription {
            backend,
            watcher,
            tree,
            handle,
            running: true,
            io_pending: false,
            doomed: false,
            read_buffer: vec![0u8; DEFAULT_BUF_SIZE],
            write_buffer: vec![0u8; DEFAULT_BUF_SIZE],
            overlapped: unsafe { std::mem::zeroed() },
            pending_moves: HashMap::new(),
        })
    }

    fn close_handle(&mut self) {
        if self.handle != INVALID_HANDLE_VALUE {
            unsafe {
                CloseHandle(self.handle);
            }
            self.handle = INVALID_HANDLE_VALUE;
        }
    }

    fn stop(&mut self) {
        if self.running {
            self.running = false;
            unsafe {
                CancelIo(self.handle);
            }
            self.close_handle();
        }
    }

    /// Arm the next overlapped read and sweep expired pending moves.
    fn poll(&mut self) -> Result<()> {
        if !self.running {
            return Ok(());
        }

        let ok = unsafe {
            ReadDirectoryChangesW(
                self.handle,
                self.write_buffer.as_mut_ptr() as *mut c_void,
                self.write_buffer.len() as u32,
                TRUE,
                NOTIFY_FILTER,
                ptr::null_mut(),
                &mut self.overlapped,
                Some(completion_routine),
            )
        };
        if ok == 0 {
            return Err(Error::io(
                self.watcher.dir(),
                std::io::Error::last_os_error(),
            ));
        }
        self.io_pending = true;

        self.pending_moves
            .retain(|_, pending| pending.at.elapsed() <= PENDING_MOVE_TTL);
        Ok(())
    }

    fn process_events(&mut self, error_code: u32) -> Result<()> {
        if !self.running {
            return Ok(());
        }

        match error_code {
            ERROR_OPERATION_ABORTED => return Ok(()),
            ERROR_INVALID_PARAMETER => {
                // Network-path buffer limit: shrink and retry.
                self.read_buffer = vec![0u8; NETWORK_BUF_SIZE];
                self.write_buffer = vec![0u8; NETWORK_BUF_SIZE];
                return self.poll();
            }
            ERROR_NOTIFY_ENUM_DIR => {
                // The kernel could not fit the changes; events were lost but
                // the subscription keeps going.
                tracing::warn!(
                    dir = %self.watcher.dir().display(),
                    "change buffer overflowed; some events were lost"
                );
                self.watcher.notify_error(Error::Overflow);
                return self.poll();
            }
            ERROR_ACCESS_DENIED => {
                let attrs =
                    unsafe { GetFileAttributesW(extended_wide_path(self.watcher.dir()).as_ptr()) };
                if attrs == INVALID_FILE_ATTRIBUTES {
                    // The watched root itself is gone: one final delete,
                    // then this subscription stops.
                    self.watcher.events.remove(
                        self.watcher.dir(),
                        Kind::Directory,
                        FAKE_INO,
                        FAKE_FILEID,
                    );
                    self.tree.remove(self.watcher.dir());
                    self.watcher.notify();
                    self.stop();
                    return Ok(());
                }
                return Err(Error::io(
                    self.watcher.dir(),
                    std::io::Error::from_raw_os_error(ERROR_ACCESS_DENIED as i32),
                ));
            }
            ERROR_SUCCESS => {}
            other => {
                return Err(Error::backend(format!(
                    "ReadDirectoryChangesW completion failed with code {other}"
                )));
            }
        }

        // Swap buffers and re-arm before decoding, so no window is left
        // unwatched while we process.
        std::mem::swap(&mut self.read_buffer, &mut self.write_buffer);
        self.poll()?;

        let mut offset = 0usize;
        loop {
            let info = unsafe {
                &*(self.read_buffer.as_ptr().add(offset) as *const FILE_NOTIFY_INFORMATION)
            };
            self.process_event(info);
            if info.NextEntryOffset == 0 {
                break;
            }
            offset += info.NextEntryOffset as usize;
        }

        self.watcher.notify();
        Ok(())
    }

    fn process_event(&mut self, info: &FILE_NOTIFY_INFORMATION) {
        let name_len = info.FileNameLength as usize / std::mem::size_of::<u16>();
        let name = unsafe { std::slice::from_raw_parts(info.FileName.as_ptr(), name_len) };
        let path = self.watcher.dir().join(OsString::from_wide(name));
        if self.watcher.is_ignored(&path) {
            return;
        }

        match info.Action {
            FILE_ACTION_ADDED | FILE_ACTION_RENAMED_NEW_NAME => {
                let mut data: WIN32_FILE_ATTRIBUTE_DATA = unsafe { std::mem::zeroed() };
                let ok = unsafe {
                    GetFileAttributesExW(
                        extended_wide_path(&path).as_ptr(),
                        GetFileExInfoStandard,
                        &mut data as *mut _ as *mut c_void,
                    )
                };
                if ok == 0 {
                    return;
                }
                let kind = if is_directory_attrs(data.dwFileAttributes) {
                    Kind::Directory
                } else {
                    Kind::File
                };
                let file_id = file_id(&path).unwrap_or_else(|| FAKE_FILEID.to_string());

                if let Some(pending) = self.pending_moves.remove(&file_id) {
                    if kind == Kind::Directory {
                        self.tree.rename(&pending.path, &path);
                    }
                    self.watcher
                        .events
                        .rename(&pending.path, &path, kind, FAKE_INO, &file_id);
                } else {
                    self.watcher.events.create(&path, kind, FAKE_INO, &file_id);
                }
                self.tree.add(
                    &path,
                    FAKE_INO,
                    convert_time(&data.ftLastWriteTime),
                    kind,
                    &file_id,
                );
            }
            FILE_ACTION_MODIFIED => {
                let mut data: WIN32_FILE_ATTRIBUTE_DATA = unsafe { std::mem::zeroed() };
                let ok = unsafe {
                    GetFileAttributesExW(
                        extended_wide_path(&path).as_ptr(),
                        GetFileExInfoStandard,
                        &mut data as *mut _ as *mut c_void,
                    )
                };
                if ok == 0 {
                    return;
                }
                let kind = if is_directory_attrs(data.dwFileAttributes) {
                    Kind::Directory
                } else {
                    Kind::File
                };
                let file_id = file_id(&path).unwrap_or_else(|| FAKE_FILEID.to_string());
                self.tree
                    .update(&path, FAKE_INO, convert_time(&data.ftLastWriteTime), &file_id);
                if kind != Kind::Directory {
                    self.watcher.events.update(&path, kind, FAKE_INO, &file_id);
                }
            }
            FILE_ACTION_REMOVED | FILE_ACTION_RENAMED_OLD_NAME => {
                match self.tree.find(&path) {
                    Some(entry) => {
                        self.pending_moves.insert(
                            entry.file_id.clone(),
                            PendingMove {
                                path: path.clone(),
                                at: Instant::now(),
                            },
                        );
                        self.watcher
                            .events
                            .remove(&path, entry.kind, entry.ino, &entry.file_id);
                    }
                    None => {
                        self.watcher
                            .events
                            .remove(&path, Kind::Unknown, FAKE_INO, FAKE_FILEID);
                    }
                }
                self.tree.remove(&path);
            }
            _ => {}
        }
    }

    fn report_error(&mut self, error: Error) {
        self.stop();
        if let Some(backend) = self.backend.upgrade() {
            let backend: Arc<dyn Backend> = backend;
            crate::backend::handle_watcher_error(&backend, &self.watcher, error);
        } else {
            self.watcher.notify_error(error);
        }
    }
}

unsafe extern "system" fn noop_apc(_data: usize) {}

unsafe extern "system" fn start_poll_apc(data: usize) {
    let subscription = &mut *(data as *mut Subscription);
    subscription.overlapped.hEvent = data as HANDLE;
    if let Err(error) = subscription.poll() {
        subscription.report_error(error);
    }
}

unsafe extern "system" fn stop_apc(data: usize) {
    let subscription = &mut *(data as *mut Subscription);
    subscription.stop();
    if !subscription.io_pending {
        drop(Box::from_raw(data as *mut Subscription));
    } else {
        // Freed by the aborted completion once it drains.
        subscription.doomed = true;
    }
}

unsafe extern "system" fn completion_routine(
    error_code: u32,
    _bytes_transferred: u32,
    overlapped: *mut OVERLAPPED,
) {
    let subscription = &mut *((*overlapped).hEvent as *mut Subscription);
    subscription.io_pending = false;

    if subscription.doomed {
        drop(Box::from_raw(subscription as *mut Subscription));
        return;
    }

    if let Err(error) = subscription.process_events(error_code) {
        subscription.report_error(error);
    }
}

/// Prefix a path with `\\?\` and NUL-terminate it for wide Win32 calls.
fn extended_wide_path(path: &Path) -> Vec<u16> {
    let mut wide: Vec<u16> = OsString::from("\\\\?\\").encode_wide().collect();
    wide.extend(path.as_os_str().encode_wide());
    wide.push(0);
    wide
}

fn is_directory_attrs(attrs: u32) -> bool {
    attrs & FILE_ATTRIBUTE_DIRECTORY != 0 && attrs & FILE_ATTRIBUTE_REPARSE_POINT == 0
}

/// Raw FILETIME ticks; only compared against other values from the same
/// volume, never interpreted as wall-clock time.
fn convert_time(time: &FILETIME) -> u64 {
    ((time.dwHighDateTime as u64) << 32) | time.dwLowDateTime as u64
}

/// Per-volume stable identifier from the file index, formatted the way the
/// snapshot format stores it.
pub(crate) fn file_id(path: &Path) -> Option<String> {
    let wide = extended_wide_path(path);
    let handle = unsafe {
        CreateFileW(
            wide.as_ptr(),
            0,
            FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE,
            ptr::null(),
            OPEN_EXISTING,
            FILE_FLAG_BACKUP_SEMANTICS,
            ptr::null_mut(),
        )
    };
    if handle == INVALID_HANDLE_VALUE {
        return None;
    }
    let mut info: BY_HANDLE_FILE_INFORMATION = unsafe { std::mem::zeroed() };
    let ok = unsafe { GetFileInformationByHandle(handle, &mut info) };
    unsafe {
        CloseHandle(handle);
    }
    if ok == 0 {
        return None;
    }
    Some(format!(
        "0x{:08X}{:08X}",
        info.nFileIndexHigh, info.nFileIndexLow
    ))
}
