//! macOS backend: one FSEvents stream per watcher on a shared run loop.
//!
//! FSEvents delivers coalesced flag sets per path, so several logical
//! changes can arrive as one callback. Exactly one of the item flags maps
//! directly; anything else is disambiguated by statting the path against
//! the mirror tree. History replay (snapshot catch-up) carries a `since`
//! timestamp from the snapshot file: during replay, a path that exists with
//! an mtime (or birth time) older than `since` classifies as an update
//! rather than a create.
//!
//! A create+delete pair coalesced into one flagged event resolves through
//! the failed stat: a `delete` is emitted when the mirror knew the path (or
//! a replay carries the removed/renamed flags), else nothing.

use std::ffi::CStr;
use std::os::raw::{c_char, c_void};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fsevent_sys as fs;
use fsevent_sys::core_foundation as cf;

use crate::backend::{brute_force, Backend, BackendCore, BackendKind};
use crate::error::{Error, Result};
use crate::event::{Kind, FAKE_FILEID, FAKE_INO};
use crate::tree::DirTree;
use crate::watcher::Watcher;

/// Stream latency for live subscriptions.
const LIVE_LATENCY: cf::CFTimeInterval = 0.01;

/// Stream latency while replaying history for a snapshot diff.
const REPLAY_LATENCY: cf::CFTimeInterval = 0.001;

// Not exported by fsevent-sys; declared against the system framework.
#[link(name = "CoreServices", kind = "framework")]
extern "C" {
    fn FSEventsGetCurrentEventId() -> fs::FSEventStreamEventId;
    fn FSEventStreamSetExclusionPaths(
        stream: fs::FSEventStreamRef,
        paths: cf::CFMutableArrayRef,
    ) -> cf::Boolean;
    fn CFRunLoopRunInMode(
        mode: cf::CFStringRef,
        seconds: cf::CFTimeInterval,
        return_after_source_handled: cf::Boolean,
    ) -> i32;
}

/// Context handed to the stream callback. Owned by the stream; freed by its
/// release callback.
struct StreamState {
    watcher: Weak<Watcher>,
    /// Snapshot start time during history replay; `None` on live streams.
    since: Option<SystemTime>,
}

struct StreamEntry {
    watcher: Arc<Watcher>,
    stream: fs::FSEventStreamRef,
}

// CFRef types may move across threads; all stream mutation happens under
// the backend's locks.
unsafe impl Send for StreamEntry {}

struct RunLoop(cf::CFRunLoopRef);
unsafe impl Send for RunLoop {}

pub(crate) struct FsEventsBackend {
    core: BackendCore,
    run_loop: Mutex<Option<RunLoop>>,
    streams: Mutex<Vec<StreamEntry>>,
}

impl FsEventsBackend {
    pub fn new() -> Self {
        Self {
            core: BackendCore::new(BackendKind::FsEvents),
            run_loop: Mutex::new(None),
            streams: Mutex::new(Vec::new()),
        }
    }

    fn run_loop_ref(&self) -> Result<cf::CFRunLoopRef> {
        self.run_loop
            .lock()
            .unwrap()
            .as_ref()
            .map(|run_loop| run_loop.0)
            .ok_or_else(|| Error::backend("FSEvents run loop is not available"))
    }

    fn start_stream(
        &self,
        watcher: &Arc<Watcher>,
        since_when: fs::FSEventStreamEventId,
        latency: cf::CFTimeInterval,
        since: Option<SystemTime>,
    ) -> Result<()> {
        let run_loop = self.run_loop_ref()?;
        let dir = watcher
            .dir()
            .to_str()
            .ok_or_else(|| Error::config("watched path is not valid UTF-8"))?
            .to_string();

        unsafe {
            let state = Box::into_raw(Box::new(StreamState {
                watcher: Arc::downgrade(watcher),
                since,
            }));
            let context = fs::FSEventStreamContext {
                version: 0,
                info: state as *mut c_void,
                retain: None,
                release: Some(release_state),
                copy_description: None,
            };

            let paths = cf::CFArrayCreateMutable(
                cf::kCFAllocatorDefault,
                0,
                &cf::kCFTypeArrayCallBacks,
            );
            let mut cf_err: cf::CFErrorRef = ptr::null_mut();
            let cf_path = cf::str_path_to_cfstring_ref(&dir, &mut cf_err);
            if !cf_err.is_null() {
                cf::CFRelease(cf_err as cf::CFRef);
                cf::CFRelease(paths as cf::CFRef);
                drop(Box::from_raw(state));
                return Err(Error::config("unable to convert path for FSEvents"));
            }
            cf::CFArrayAppendValue(paths, cf_path as cf::CFRef);
            cf::CFRelease(cf_path as cf::CFRef);

            let stream = fs::FSEventStreamCreate(
                cf::kCFAllocatorDefault,
                stream_callback,
                &context,
                paths,
                since_when,
                latency,
                fs::kFSEventStreamCreateFlagFileEvents,
            );
            cf::CFRelease(paths as cf::CFRef);

            if !watcher.ignore_paths().is_empty() {
                let exclusions = cf::CFArrayCreateMutable(
                    cf::kCFAllocatorDefault,
                    watcher.ignore_paths().len() as cf::CFIndex,
                    &cf::kCFTypeArrayCallBacks,
                );
                for ignored in watcher.ignore_paths() {
                    if let Some(ignored) = ignored.to_str() {
                        let mut err: cf::CFErrorRef = ptr::null_mut();
                        let cf_ignored = cf::str_path_to_cfstring_ref(ignored, &mut err);
                        if err.is_null() {
                            cf::CFArrayAppendValue(exclusions, cf_ignored as cf::CFRef);
                            cf::CFRelease(cf_ignored as cf::CFRef);
                        } else {
                            cf::CFRelease(err as cf::CFRef);
                        }
                    }
                }
                FSEventStreamSetExclusionPaths(stream, exclusions);
                cf::CFRelease(exclusions as cf::CFRef);
            }

            fs::FSEventStreamScheduleWithRunLoop(stream, run_loop, cf::kCFRunLoopDefaultMode);
            if fs::FSEventStreamStart(stream) == 0 {
                fs::FSEventStreamInvalidate(stream);
                fs::FSEventStreamRelease(stream);
                return Err(Error::backend("failed to start FSEvents stream"));
            }

            self.streams.lock().unwrap().push(StreamEntry {
                watcher: Arc::clone(watcher),
                stream,
            });
        }
        Ok(())
    }

    fn stop_stream(&self, watcher: &Arc<Watcher>) {
        let entry = {
            let mut streams = self.streams.lock().unwrap();
            let index = streams
                .iter()
                .position(|entry| Arc::ptr_eq(&entry.watcher, watcher));
            index.map(|index| streams.swap_remove(index))
        };
        let Some(entry) = entry else { return };
        let Ok(run_loop) = self.run_loop_ref() else {
            return;
        };

        unsafe {
            fs::FSEventStreamStop(entry.stream);
            fs::FSEventStreamUnscheduleFromRunLoop(
                entry.stream,
                run_loop,
                cf::kCFRunLoopDefaultMode,
            );
            fs::FSEventStreamInvalidate(entry.stream);
            fs::FSEventStreamRelease(entry.stream);
        }
    }
}

impl Backend for FsEventsBackend {
    fn core(&self) -> &BackendCore {
        &self.core
    }

    fn run(self: Arc<Self>) {
        unsafe {
            *self.run_loop.lock().unwrap() = Some(RunLoop(cf::CFRunLoopGetCurrent()));
        }
        self.core.notify_started();

        // Streams come and go while the backend lives; run the loop in
        // bounded slices so an empty source set cannot end it early.
        while self.core.is_running() {
            unsafe {
                CFRunLoopRunInMode(cf::kCFRunLoopDefaultMode, 0.5, 0);
            }
        }

        *self.run_loop.lock().unwrap() = None;
        self.core.ended.notify();
    }

    fn wake(&self) {
        if let Some(run_loop) = self.run_loop.lock().unwrap().as_ref() {
            unsafe {
                cf::CFRunLoopStop(run_loop.0);
            }
        }
    }

    fn subscribe(&self, watcher: &Arc<Watcher>) -> Result<()> {
        // The mirror starts empty and fills from the stream; it exists to
        // disambiguate flag sets, not to describe the whole disk.
        watcher.set_tree(Arc::new(DirTree::new(watcher.dir())));
        self.start_stream(
            watcher,
            fs::kFSEventStreamEventIdSinceNow,
            LIVE_LATENCY,
            None,
        )
        .inspect_err(|_| watcher.clear_tree())
    }

    fn unsubscribe(&self, watcher: &Arc<Watcher>) -> Result<()> {
        self.stop_stream(watcher);
        watcher.clear_tree();
        Ok(())
    }

    fn write_snapshot(&self, watcher: &Arc<Watcher>, snapshot_path: &Path) -> Result<()> {
        let _ = watcher;
        let id = unsafe { FSEventsGetCurrentEventId() };
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        let payload = format!("{}\n{}\n{}", id, now.as_secs(), now.subsec_nanos());
        std::fs::write(snapshot_path, payload).map_err(|err| Error::io(snapshot_path, err))
    }

    fn get_events_since(&self, watcher: &Arc<Watcher>, snapshot_path: &Path) -> Result<()> {
        let payload = std::fs::read_to_string(snapshot_path)
            .map_err(|err| Error::io(snapshot_path, err))?;
        let mut lines = payload.lines();
        let parse_err = || Error::config("malformed FSEvents snapshot");
        let id: fs::FSEventStreamEventId = lines
            .next()
            .and_then(|line| line.trim().parse().ok())
            .ok_or_else(parse_err)?;
        let sec: u64 = lines
            .next()
            .and_then(|line| line.trim().parse().ok())
            .ok_or_else(parse_err)?;
        let nsec: u32 = lines
            .next()
            .and_then(|line| line.trim().parse().ok())
            .ok_or_else(parse_err)?;
        let since = UNIX_EPOCH + Duration::new(sec, nsec);

        watcher.set_tree(Arc::new(DirTree::new(watcher.dir())));
        self.start_stream(watcher, id, REPLAY_LATENCY, Some(since))?;
        // The HistoryDone marker wakes us once replay has drained.
        watcher.wait();
        self.stop_stream(watcher);
        watcher.clear_tree();
        Ok(())
    }
}

extern "C" fn release_state(info: *const c_void) {
    if !info.is_null() {
        unsafe {
            drop(Box::from_raw(info as *mut StreamState));
        }
    }
}

extern "C" fn stream_callback(
    _stream: fs::FSEventStreamRef,
    info: *mut c_void,
    num_events: usize,
    event_paths: *mut c_void,
    event_flags: *const fs::FSEventStreamEventFlags,
    _event_ids: *const fs::FSEventStreamEventId,
) {
    let state = unsafe { &*(info as *const StreamState) };
    let Some(watcher) = state.watcher.upgrade() else {
        return;
    };
    let paths = event_paths as *const *const c_char;

    for index in 0..num_events {
        let (flags, path) = unsafe {
            let flags = *event_flags.add(index);
            let bytes = CStr::from_ptr(*paths.add(index)).to_bytes();
            let path = PathBuf::from(std::ffi::OsStr::from_bytes(bytes));
            (flags, path)
        };

        if flags & fs::kFSEventStreamEventFlagHistoryDone != 0 {
            watcher.notify();
            break;
        }
        if watcher.is_ignored(&path) {
            continue;
        }
        handle_event(state, &watcher, flags, &path);
    }

    if watcher.has_callbacks() {
        watcher.notify();
    }
}

fn handle_event(
    state: &StreamState,
    watcher: &Arc<Watcher>,
    flags: fs::FSEventStreamEventFlags,
    path: &Path,
) {
    let Some(tree) = watcher.tree() else { return };

    let created = flags & fs::kFSEventStreamEventFlagItemCreated != 0;
    let removed = flags & fs::kFSEventStreamEventFlagItemRemoved != 0;
    let renamed = flags & fs::kFSEventStreamEventFlagItemRenamed != 0;
    let modified = flags
        & (fs::kFSEventStreamEventFlagItemModified
            | fs::kFSEventStreamEventFlagItemInodeMetaMod
            | fs::kFSEventStreamEventFlagItemFinderInfoMod
            | fs::kFSEventStreamEventFlagItemChangeOwner
            | fs::kFSEventStreamEventFlagItemXattrMod)
        != 0;
    let is_dir = flags & fs::kFSEventStreamEventFlagItemIsDir != 0;
    let kind = if is_dir { Kind::Directory } else { Kind::File };

    // Unambiguous flag sets map directly.
    if created && !(removed || modified || renamed) {
        tree.add(path, FAKE_INO, 0, kind, FAKE_FILEID);
        watcher.events.create(path, kind, FAKE_INO, FAKE_FILEID);
        return;
    }
    if removed && !(created || modified || renamed) {
        tree.remove(path);
        watcher.events.remove(path, kind, FAKE_INO, FAKE_FILEID);
        return;
    }
    if modified && !(created || removed || renamed) {
        tree.update(path, FAKE_INO, 0, FAKE_FILEID);
        watcher.events.update(path, kind, FAKE_INO, FAKE_FILEID);
        return;
    }

    // Multiple flags: the path's present state decides.
    let known = tree.find(path).is_some();
    match std::fs::metadata(path) {
        Err(_) => {
            let replayed_removal = state.since.is_some() && (removed || renamed);
            if known || replayed_removal {
                tree.remove(path);
                watcher.events.remove(path, kind, FAKE_INO, FAKE_FILEID);
            }
        }
        Ok(meta) => {
            let kind = if meta.is_dir() {
                Kind::Directory
            } else {
                Kind::File
            };
            let ino = brute_force::inode(&meta);
            let mtime = brute_force::mtime_nanos(&meta);

            let is_update = match state.since {
                // Replay: anything whose content or birth predates the
                // snapshot is a change to an already-known file.
                Some(since) => {
                    (known && meta.modified().map(|time| time < since).unwrap_or(false))
                        || meta.created().map(|time| time < since).unwrap_or(false)
                }
                None => known,
            };

            if is_update {
                if known {
                    tree.update(path, ino, mtime, FAKE_FILEID);
                } else {
                    tree.add(path, ino, mtime, kind, FAKE_FILEID);
                }
                watcher.events.update(path, kind, ino, FAKE_FILEID);
            } else {
                tree.add(path, ino, mtime, kind, FAKE_FILEID);
                watcher.events.create(path, kind, ino, FAKE_FILEID);
            }
        }
    }
}
