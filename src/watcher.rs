//! One logical subscription: a directory, its ignore sets, and the
//! callbacks that want its events.
//!
//! Watchers are shared: `get_shared` returns the process-wide unique
//! instance for a `(dir, ignorePaths, ignoreGlobs)` tuple, so two
//! subscribers to the same tree reuse one kernel-side subscription. A
//! watcher stays alive while any callback is registered or an in-flight
//! snapshot request holds it.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use crate::backend::Backend;
use crate::debounce::Debouncer;
use crate::error::Error;
use crate::event::{Event, EventList};
use crate::glob::Glob;
use crate::signal::Signal;
use crate::tree::DirTree;

/// Callback invoked on the debouncer thread with either a batch of
/// coalesced events or the error attached to this delivery.
///
/// Identity is `Arc` pointer identity: registering the same `Arc` twice is
/// a no-op, and `unsubscribe` must be handed a clone of the original.
pub type Callback = Arc<dyn Fn(Result<Vec<Event>, Error>) + Send + Sync>;

struct WatcherState {
    callbacks: Vec<Callback>,
    error: Option<Error>,
    tree: Option<Arc<DirTree>>,
    backend: Option<Arc<dyn Backend>>,
}

/// A shared subscription. See the module docs for lifetime rules.
pub struct Watcher {
    dir: PathBuf,
    ignore_paths: BTreeSet<PathBuf>,
    ignore_globs: Vec<Glob>,
    /// Coalescing buffer the owning backend appends into.
    pub(crate) events: EventList,
    signal: Signal,
    debouncer: Arc<Debouncer>,
    debounce_id: u64,
    state: Mutex<WatcherState>,
}

fn registry() -> &'static Mutex<Vec<Arc<Watcher>>> {
    static REGISTRY: OnceLock<Mutex<Vec<Arc<Watcher>>>> = OnceLock::new();
    REGISTRY.get_or_init(Default::default)
}

fn next_debounce_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

impl Watcher {
    /// Fetch the unique watcher for this identity tuple, creating it (and
    /// wiring it to the shared debouncer) if none exists. Equality is
    /// structural.
    pub(crate) fn get_shared(
        dir: &Path,
        ignore_paths: &BTreeSet<PathBuf>,
        ignore_globs: &[Glob],
    ) -> Arc<Watcher> {
        if let Some(existing) = Self::find_shared(dir, ignore_paths, ignore_globs) {
            return existing;
        }

        let debouncer = Debouncer::get_shared();
        let watcher = Arc::new(Watcher {
            dir: dir.to_path_buf(),
            ignore_paths: ignore_paths.clone(),
            ignore_globs: ignore_globs.to_vec(),
            events: EventList::new(),
            signal: Signal::new(),
            debouncer: Arc::clone(&debouncer),
            debounce_id: next_debounce_id(),
            state: Mutex::new(WatcherState {
                callbacks: Vec::new(),
                error: None,
                tree: None,
                backend: None,
            }),
        });

        let weak = Arc::downgrade(&watcher);
        debouncer.add(
            watcher.debounce_id,
            Arc::new(move || {
                if let Some(watcher) = weak.upgrade() {
                    watcher.deliver();
                }
            }),
        );

        registry().lock().unwrap().push(Arc::clone(&watcher));
        watcher
    }

    /// Look up an existing watcher without creating one.
    pub(crate) fn find_shared(
        dir: &Path,
        ignore_paths: &BTreeSet<PathBuf>,
        ignore_globs: &[Glob],
    ) -> Option<Arc<Watcher>> {
        let watchers = registry().lock().unwrap();
        watchers
            .iter()
            .find(|watcher| watcher.matches(dir, ignore_paths, ignore_globs))
            .cloned()
    }

    /// Drop `watcher` from the shared registry if nothing subscribes to it
    /// anymore. The caller's own `Arc` keeps it alive until the last
    /// in-flight operation finishes.
    pub(crate) fn release(watcher: &Arc<Watcher>) {
        let unused = watcher.state.lock().unwrap().callbacks.is_empty();
        if !unused {
            return;
        }
        let mut watchers = registry().lock().unwrap();
        watchers.retain(|candidate| !Arc::ptr_eq(candidate, watcher));
    }

    fn matches(&self, dir: &Path, ignore_paths: &BTreeSet<PathBuf>, ignore_globs: &[Glob]) -> bool {
        self.dir == dir && self.ignore_paths == *ignore_paths && self.ignore_globs == ignore_globs
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub(crate) fn ignore_paths(&self) -> &BTreeSet<PathBuf> {
        &self.ignore_paths
    }

    /// Register a callback. Returns true iff the callback set transitioned
    /// from empty to non-empty (the caller then subscribes with the OS).
    /// Registering a callback that is already present is a no-op.
    pub(crate) fn watch(&self, callback: &Callback) -> bool {
        let mut state = self.state.lock().unwrap();
        if state
            .callbacks
            .iter()
            .any(|existing| Arc::ptr_eq(existing, callback))
        {
            return false;
        }
        state.callbacks.push(Arc::clone(callback));
        state.callbacks.len() == 1
    }

    /// Remove a callback. Returns true iff the callback was present and the
    /// set is now empty (the caller then unsubscribes from the OS).
    pub(crate) fn unwatch(&self, callback: &Callback) -> bool {
        let mut state = self.state.lock().unwrap();
        let before = state.callbacks.len();
        state
            .callbacks
            .retain(|existing| !Arc::ptr_eq(existing, callback));
        state.callbacks.len() < before && state.callbacks.is_empty()
    }

    /// Forcibly clear all callbacks. Used when an asynchronous subscribe
    /// fails after the watcher was handed out.
    pub(crate) fn destroy(&self) {
        self.state.lock().unwrap().callbacks.clear();
    }

    pub(crate) fn has_callbacks(&self) -> bool {
        !self.state.lock().unwrap().callbacks.is_empty()
    }

    /// Called by the backend after appending to the event list: wakes any
    /// thread blocked in [`Watcher::wait`] and schedules delivery.
    pub(crate) fn notify(&self) {
        self.signal.notify();
        if self.has_callbacks() {
            self.debouncer.trigger();
        }
    }

    /// Attach an error to the next delivery and schedule it.
    pub(crate) fn notify_error(&self, error: Error) {
        self.state.lock().unwrap().error = Some(error);
        self.debouncer.trigger();
    }

    /// Block until the backend signals activity (used to pair a history
    /// replay with its completion marker).
    #[cfg_attr(not(target_os = "macos"), allow(dead_code))]
    pub(crate) fn wait(&self) {
        self.signal.wait();
        self.signal.reset();
    }

    /// Whether `path` is excluded by this watcher's ignore sets: equal to or
    /// beneath any ignore path, or fully matching any ignore glob.
    pub(crate) fn is_ignored(&self, path: &Path) -> bool {
        for ignored in &self.ignore_paths {
            if path.starts_with(ignored) {
                return true;
            }
        }
        self.ignore_globs.iter().any(|glob| glob.matches(path))
    }

    pub(crate) fn set_tree(&self, tree: Arc<DirTree>) {
        self.state.lock().unwrap().tree = Some(tree);
    }

    pub(crate) fn tree(&self) -> Option<Arc<DirTree>> {
        self.state.lock().unwrap().tree.clone()
    }

    pub(crate) fn clear_tree(&self) {
        self.state.lock().unwrap().tree = None;
    }

    /// Remember which backend this watcher is subscribed through, so
    /// `unsubscribe` tears down the same one `subscribe` used.
    pub(crate) fn set_backend(&self, backend: Arc<dyn Backend>) {
        self.state.lock().unwrap().backend = Some(backend);
    }

    pub(crate) fn take_backend(&self) -> Option<Arc<dyn Backend>> {
        self.state.lock().unwrap().backend.take()
    }

    /// Deliver the pending error or the coalesced batch to every callback.
    /// Runs on the debouncer thread.
    fn deliver(&self) {
        let error = self.state.lock().unwrap().error.take();
        if let Some(error) = error {
            for callback in self.callbacks_snapshot() {
                callback(Err(error.clone()));
            }
            // Events gathered around the failure still flow in the next
            // window rather than being dropped with it.
            if !self.events.is_empty() {
                self.debouncer.trigger();
            }
            return;
        }

        let events = self.events.take();
        if events.is_empty() {
            return;
        }
        for callback in self.callbacks_snapshot() {
            callback(Ok(events.clone()));
        }
    }

    fn callbacks_snapshot(&self) -> Vec<Callback> {
        self.state.lock().unwrap().callbacks.clone()
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.debouncer.remove(self.debounce_id);
    }
}

impl std::fmt::Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher")
            .field("dir", &self.dir)
            .field("ignore_paths", &self.ignore_paths)
            .field("ignore_globs", &self.ignore_globs)
            .finish_non_exhaustive()
    }
}
