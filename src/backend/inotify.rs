//! Linux backend: one inotify watch descriptor per mirrored directory.
//!
//! The worker thread polls the inotify fd together with a self-pipe; the
//! pipe is only ever written to wake the loop for shutdown. Events are
//! decoded against the shared mirror tree so that deletions know what kind
//! of entry vanished and new directories get their own descriptors.

use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};

use inotify::{EventMask, Inotify, WatchDescriptor, WatchMask};

use crate::backend::{brute_force, Backend, BackendCore, BackendKind};
use crate::error::{Error, Result};
use crate::event::{Kind, FAKE_FILEID, FAKE_INO};
use crate::watcher::Watcher;

/// Poll interval; also bounds how long shutdown can lag the wake write.
const POLL_TIMEOUT_MS: i32 = 500;

const EVENT_BUFFER_SIZE: usize = 8192;

fn watch_mask() -> WatchMask {
    WatchMask::ATTRIB
        | WatchMask::CREATE
        | WatchMask::DELETE
        | WatchMask::DELETE_SELF
        | WatchMask::MODIFY
        | WatchMask::MOVE_SELF
        | WatchMask::MOVED_FROM
        | WatchMask::MOVED_TO
        | WatchMask::DONT_FOLLOW
        | WatchMask::ONLYDIR
        | WatchMask::EXCL_UNLINK
}

#[derive(Clone)]
struct WatchRecord {
    path: PathBuf,
    watcher: Weak<Watcher>,
}

pub(crate) struct InotifyBackend {
    core: BackendCore,
    inotify: Mutex<Inotify>,
    inotify_fd: RawFd,
    pipe: [RawFd; 2],
    watches: Mutex<HashMap<WatchDescriptor, WatchRecord>>,
}

impl InotifyBackend {
    pub fn new() -> Result<Self> {
        let inotify = Inotify::init()
            .map_err(|err| Error::backend(format!("unable to initialize inotify: {err}")))?;
        let inotify_fd = inotify.as_raw_fd();

        let mut pipe = [0 as RawFd; 2];
        let rc = unsafe { libc::pipe2(pipe.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) };
        if rc == -1 {
            return Err(Error::backend(format!(
                "unable to open pipe: {}",
                io::Error::last_os_error()
            )));
        }

        Ok(Self {
            core: BackendCore::new(BackendKind::Inotify),
            inotify: Mutex::new(inotify),
            inotify_fd,
            pipe,
            watches: Mutex::new(HashMap::new()),
        })
    }

    fn watch_dir(&self, watcher: &Arc<Watcher>, path: &Path) -> Result<()> {
        let wd = self
            .inotify
            .lock()
            .unwrap()
            .watches()
            .add(path, watch_mask())
            .map_err(|err| Error::io(path, err))?;
        self.watches.lock().unwrap().insert(
            wd,
            WatchRecord {
                path: path.to_path_buf(),
                watcher: Arc::downgrade(watcher),
            },
        );
        Ok(())
    }

    /// Drop every descriptor owned by `watcher`, telling the kernel where it
    /// still can. Removal failures are expected for directories that no
    /// longer exist.
    fn drop_watches(&self, watcher: &Arc<Watcher>) {
        let doomed: Vec<WatchDescriptor> = {
            let mut watches = self.watches.lock().unwrap();
            let doomed = watches
                .iter()
                .filter(|(_, record)| {
                    record
                        .watcher
                        .upgrade()
                        .map(|owner| Arc::ptr_eq(&owner, watcher))
                        .unwrap_or(true)
                })
                .map(|(wd, _)| wd.clone())
                .collect::<Vec<_>>();
            for wd in &doomed {
                watches.remove(wd);
            }
            doomed
        };

        let mut kernel = self.inotify.lock().unwrap().watches();
        for wd in doomed {
            if let Err(err) = kernel.remove(wd) {
                tracing::debug!(%err, "inotify watch already gone");
            }
        }
    }

    fn handle_events(this: &Arc<Self>) {
        let mut touched: Vec<Arc<Watcher>> = Vec::new();
        let mut buffer = [0u8; EVENT_BUFFER_SIZE];

        loop {
            let batch: Vec<(WatchDescriptor, EventMask, Option<OsString>)> = {
                let mut inotify = this.inotify.lock().unwrap();
                match inotify.read_events(&mut buffer) {
                    Ok(events) => events
                        .map(|event| (event.wd, event.mask, event.name.map(OsStr::to_os_string)))
                        .collect(),
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                    Err(err) => {
                        tracing::warn!(%err, "error reading from inotify");
                        break;
                    }
                }
            };
            if batch.is_empty() {
                break;
            }
            for (wd, mask, name) in batch {
                Self::handle_event(this, wd, mask, name, &mut touched);
            }
        }

        for watcher in touched {
            watcher.notify();
        }
    }

    fn handle_event(
        this: &Arc<Self>,
        wd: WatchDescriptor,
        mask: EventMask,
        name: Option<OsString>,
        touched: &mut Vec<Arc<Watcher>>,
    ) {
        if mask.contains(EventMask::Q_OVERFLOW) {
            // Events were dropped by the kernel; tell every subscription and
            // keep watching.
            tracing::warn!("inotify queue overflowed; some events were lost");
            for watcher in this.core.watchers() {
                watcher.notify_error(Error::Overflow);
            }
            return;
        }
        if mask.contains(EventMask::IGNORED) {
            this.watches.lock().unwrap().remove(&wd);
            return;
        }

        let record = { this.watches.lock().unwrap().get(&wd).cloned() };
        let Some(record) = record else { return };
        let Some(watcher) = record.watcher.upgrade() else {
            return;
        };

        let path = match &name {
            Some(name) => record.path.join(name),
            None => record.path.clone(),
        };
        if watcher.is_ignored(&path) {
            return;
        }
        let Some(tree) = watcher.tree() else { return };

        let is_dir = mask.contains(EventMask::ISDIR);

        if mask.intersects(EventMask::CREATE | EventMask::MOVED_TO) {
            let (kind, ino, mtime) = stat_or(&path, is_dir);
            watcher.events.create(&path, kind, ino, FAKE_FILEID);
            let entry = tree.add(&path, ino, mtime, kind, FAKE_FILEID);

            if entry.kind == Kind::Directory {
                if let Err(error) = this.watch_dir(&watcher, &entry.path) {
                    let backend: Arc<dyn Backend> = Arc::clone(this) as Arc<dyn Backend>;
                    crate::backend::handle_watcher_error(&backend, &watcher, error);
                    return;
                }
            }
        } else if mask.intersects(EventMask::MODIFY | EventMask::ATTRIB) {
            let (kind, ino, mtime) = stat_or(&path, is_dir);
            watcher.events.update(&path, kind, ino, FAKE_FILEID);
            tree.update(&path, ino, mtime, FAKE_FILEID);
        } else if mask.intersects(
            EventMask::DELETE | EventMask::DELETE_SELF | EventMask::MOVED_FROM | EventMask::MOVE_SELF,
        ) {
            // A directory's own delete/move arrives on its descriptor and on
            // the parent's; only the parent's copy matters, except for the
            // subscription root which has no watched parent.
            if mask.intersects(EventMask::DELETE_SELF | EventMask::MOVE_SELF)
                && path != watcher.dir()
            {
                return;
            }

            let prior = tree.find(&path);
            if let Some(prior) = &prior {
                if prior.kind == Kind::Directory {
                    let mut watches = this.watches.lock().unwrap();
                    watches.retain(|_, record| {
                        record.path != path
                            || !record
                                .watcher
                                .upgrade()
                                .map(|owner| Arc::ptr_eq(&owner, &watcher))
                                .unwrap_or(true)
                    });
                }
            }

            let kind = prior
                .as_ref()
                .map(|entry| entry.kind)
                .unwrap_or(if is_dir { Kind::Directory } else { Kind::Unknown });
            let ino = prior.as_ref().map(|entry| entry.ino).unwrap_or(FAKE_INO);
            let file_id = prior
                .as_ref()
                .map(|entry| entry.file_id.clone())
                .unwrap_or_else(|| FAKE_FILEID.to_string());
            watcher.events.remove(&path, kind, ino, &file_id);
            tree.remove(&path);
        } else {
            return;
        }

        if !touched.iter().any(|seen| Arc::ptr_eq(seen, &watcher)) {
            touched.push(watcher);
        }
    }
}

impl Backend for InotifyBackend {
    fn core(&self) -> &BackendCore {
        &self.core
    }

    fn run(self: Arc<Self>) {
        self.core.notify_started();

        let mut pollfds = [
            libc::pollfd {
                fd: self.pipe[0],
                events: libc::POLLIN,
                revents: 0,
            },
            libc::pollfd {
                fd: self.inotify_fd,
                events: libc::POLLIN,
                revents: 0,
            },
        ];

        loop {
            if !self.core.is_running() {
                break;
            }

            let rc = unsafe { libc::poll(pollfds.as_mut_ptr(), 2, POLL_TIMEOUT_MS) };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                tracing::warn!(%err, "inotify poll failed");
                break;
            }

            if pollfds[0].revents != 0 {
                break;
            }
            if pollfds[1].revents != 0 {
                Self::handle_events(&self);
            }
        }

        self.core.ended.notify();
    }

    fn wake(&self) {
        let buf = [b'X'];
        unsafe {
            libc::write(self.pipe[1], buf.as_ptr() as *const libc::c_void, 1);
        }
    }

    fn subscribe(&self, watcher: &Arc<Watcher>) -> Result<()> {
        // Build the complete mirror first, then watch every directory in it.
        let tree = brute_force::get_tree(watcher)?;
        watcher.set_tree(Arc::clone(&tree));

        for entry in tree.directories() {
            if let Err(error) = self.watch_dir(watcher, &entry.path) {
                self.drop_watches(watcher);
                watcher.clear_tree();
                return Err(error);
            }
        }
        tracing::debug!(dir = %watcher.dir().display(), "inotify subscription established");
        Ok(())
    }

    fn unsubscribe(&self, watcher: &Arc<Watcher>) -> Result<()> {
        self.drop_watches(watcher);
        watcher.clear_tree();
        Ok(())
    }

    fn write_snapshot(&self, watcher: &Arc<Watcher>, snapshot_path: &Path) -> Result<()> {
        brute_force::write_snapshot(watcher, snapshot_path)
    }

    fn get_events_since(&self, watcher: &Arc<Watcher>, snapshot_path: &Path) -> Result<()> {
        brute_force::events_since(watcher, snapshot_path)
    }
}

impl Drop for InotifyBackend {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.pipe[0]);
            libc::close(self.pipe[1]);
        }
    }
}

/// Stat a path for the mirror; events for already-vanished paths fall back
/// to what the kernel told us about the entry.
fn stat_or(path: &Path, is_dir: bool) -> (Kind, u64, u64) {
    match std::fs::metadata(path) {
        Ok(meta) => {
            let kind = if meta.is_dir() {
                Kind::Directory
            } else {
                Kind::File
            };
            (kind, brute_force::inode(&meta), brute_force::mtime_nanos(&meta))
        }
        Err(_) => {
            let kind = if is_dir { Kind::Directory } else { Kind::File };
            (kind, FAKE_INO, 0)
        }
    }
}
