//! Backend lifecycle, registry, and dispatch.
//!
//! A backend is one implementation of the event-source protocol. Each kind
//! is a process-wide singleton owning exactly one worker thread; watchers
//! subscribe through [`watch`] and the backend tears itself down (and joins
//! its thread) when the last watcher unsubscribes.
//!
//! Startup is a handshake: the worker thread either reports readiness or a
//! fatal error, and [`get_shared`] does not hand the backend out until one
//! of the two has happened.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::{self, JoinHandle};

use crate::error::{Error, Result};
use crate::signal::Signal;
use crate::watcher::Watcher;

pub(crate) mod brute_force;

#[cfg(target_os = "macos")]
pub(crate) mod fsevents;
#[cfg(target_os = "linux")]
pub(crate) mod inotify;
#[cfg(unix)]
pub(crate) mod watchman;
#[cfg(windows)]
pub(crate) mod windows;

/// Which event-source implementation to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// macOS FSEvents stream.
    FsEvents,
    /// External Watchman daemon over its socket.
    Watchman,
    /// Linux inotify watch descriptors.
    Inotify,
    /// Windows `ReadDirectoryChangesW`.
    Windows,
    /// Tree-walk diffing; snapshots only.
    BruteForce,
    /// First available of the platform's preference order.
    Default,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::FsEvents => "fs-events",
            BackendKind::Watchman => "watchman",
            BackendKind::Inotify => "inotify",
            BackendKind::Windows => "windows",
            BackendKind::BruteForce => "brute-force",
            BackendKind::Default => "default",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw {
            "fs-events" => Ok(BackendKind::FsEvents),
            "watchman" => Ok(BackendKind::Watchman),
            "inotify" => Ok(BackendKind::Inotify),
            "windows" => Ok(BackendKind::Windows),
            "brute-force" => Ok(BackendKind::BruteForce),
            "default" => Ok(BackendKind::Default),
            other => Err(Error::config(format!("unknown backend {other:?}"))),
        }
    }
}

/// State common to every backend: the subscription set, the startup
/// handshake, and the shutdown flags.
pub(crate) struct BackendCore {
    kind: BackendKind,
    subscriptions: Mutex<Vec<Arc<Watcher>>>,
    started: Signal,
    startup_error: Mutex<Option<Error>>,
    running: AtomicBool,
    /// Armed by worker loops that need teardown to wait for loop exit.
    pub(crate) ended: Signal,
}

impl BackendCore {
    pub fn new(kind: BackendKind) -> Self {
        Self {
            kind,
            subscriptions: Mutex::new(Vec::new()),
            started: Signal::new(),
            startup_error: Mutex::new(None),
            running: AtomicBool::new(true),
            ended: Signal::new(),
        }
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    /// Mark the worker as ready. Must be called exactly once per start.
    pub fn notify_started(&self) {
        tracing::debug!(backend = self.kind.as_str(), "backend started");
        self.started.notify();
    }

    /// Abort startup: record the error and release anyone waiting on the
    /// handshake.
    pub fn fail_start(&self, error: Error) {
        *self.startup_error.lock().unwrap() = Some(error);
        self.started.notify();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Snapshot of the currently subscribed watchers.
    pub fn watchers(&self) -> Vec<Arc<Watcher>> {
        self.subscriptions.lock().unwrap().clone()
    }
}

/// One event-source implementation. Public operations go through the free
/// functions of this module, which own the shared subscription bookkeeping;
/// implementations provide the protocol.
pub(crate) trait Backend: Send + Sync {
    fn core(&self) -> &BackendCore;

    /// Worker thread body. Must call `core().notify_started()` once ready,
    /// or `core().fail_start(..)` and return on a fatal setup failure.
    fn run(self: Arc<Self>);

    /// Wake the worker loop so it notices `core().is_running() == false`.
    fn wake(&self) {}

    fn subscribe(&self, watcher: &Arc<Watcher>) -> Result<()>;

    fn unsubscribe(&self, watcher: &Arc<Watcher>) -> Result<()>;

    fn write_snapshot(&self, watcher: &Arc<Watcher>, snapshot_path: &Path) -> Result<()>;

    fn get_events_since(&self, watcher: &Arc<Watcher>, snapshot_path: &Path) -> Result<()>;
}

struct SharedBackend {
    backend: Arc<dyn Backend>,
    thread: Option<JoinHandle<()>>,
}

fn registry() -> &'static Mutex<HashMap<BackendKind, SharedBackend>> {
    static REGISTRY: OnceLock<Mutex<HashMap<BackendKind, SharedBackend>>> = OnceLock::new();
    REGISTRY.get_or_init(Default::default)
}

/// Resolve `default` (and kinds unsupported on this platform) to a concrete
/// backend, in the documented preference order.
fn resolve(kind: BackendKind) -> BackendKind {
    match kind {
        #[cfg(target_os = "macos")]
        BackendKind::FsEvents => BackendKind::FsEvents,
        #[cfg(unix)]
        BackendKind::Watchman if watchman::WatchmanBackend::available() => BackendKind::Watchman,
        #[cfg(target_os = "linux")]
        BackendKind::Inotify => BackendKind::Inotify,
        #[cfg(windows)]
        BackendKind::Windows => BackendKind::Windows,
        BackendKind::BruteForce => BackendKind::BruteForce,
        _ => resolve_default(),
    }
}

fn resolve_default() -> BackendKind {
    #[cfg(target_os = "macos")]
    {
        return BackendKind::FsEvents;
    }
    #[cfg(all(unix, not(target_os = "macos")))]
    {
        if watchman::WatchmanBackend::available() {
            return BackendKind::Watchman;
        }
    }
    #[cfg(windows)]
    {
        return BackendKind::Windows;
    }
    #[cfg(target_os = "linux")]
    {
        return BackendKind::Inotify;
    }
    #[allow(unreachable_code)]
    BackendKind::BruteForce
}

fn instantiate(kind: BackendKind) -> Result<Arc<dyn Backend>> {
    match kind {
        BackendKind::BruteForce => Ok(Arc::new(brute_force::BruteForceBackend::new())),
        #[cfg(target_os = "linux")]
        BackendKind::Inotify => Ok(Arc::new(inotify::InotifyBackend::new()?)),
        #[cfg(target_os = "macos")]
        BackendKind::FsEvents => Ok(Arc::new(fsevents::FsEventsBackend::new())),
        #[cfg(unix)]
        BackendKind::Watchman => Ok(Arc::new(watchman::WatchmanBackend::new())),
        #[cfg(windows)]
        BackendKind::Windows => Ok(Arc::new(windows::WindowsBackend::new())),
        other => Err(Error::config(format!(
            "backend {other} is not supported on this platform"
        ))),
    }
}

/// Fetch the shared backend of this kind, starting its worker thread and
/// completing the startup handshake on first use.
pub(crate) fn get_shared(kind: BackendKind) -> Result<Arc<dyn Backend>> {
    let kind = resolve(kind);

    if let Some(shared) = registry().lock().unwrap().get(&kind) {
        return Ok(Arc::clone(&shared.backend));
    }

    // Construct and handshake outside the registry lock; it is a leaf lock
    // and the handshake blocks on the worker thread.
    let backend = instantiate(kind)?;
    let runner = Arc::clone(&backend);
    let thread = thread::Builder::new()
        .name(format!("vigil-{kind}"))
        .spawn(move || runner.run())
        .map_err(|err| Error::backend(format!("failed to spawn backend thread: {err}")))?;

    backend.core().started.wait();
    if let Some(error) = backend.core().startup_error.lock().unwrap().take() {
        let _ = thread.join();
        return Err(error);
    }

    let mut entries = registry().lock().unwrap();
    if let Some(existing) = entries.get(&kind) {
        // Lost the creation race: keep the winner, retire ours.
        let existing = Arc::clone(&existing.backend);
        drop(entries);
        shutdown(&backend, Some(thread));
        return Ok(existing);
    }
    entries.insert(
        kind,
        SharedBackend {
            backend: Arc::clone(&backend),
            thread: Some(thread),
        },
    );
    Ok(backend)
}

/// Subscribe `watcher`. On a fresh insertion the backend-specific subscribe
/// runs while the subscription set is locked; failure rolls the insertion
/// back and destroys the watcher.
pub(crate) fn watch(backend: &Arc<dyn Backend>, watcher: &Arc<Watcher>) -> Result<()> {
    let core = backend.core();
    let mut subscriptions = core.subscriptions.lock().unwrap();
    if subscriptions
        .iter()
        .any(|subscribed| Arc::ptr_eq(subscribed, watcher))
    {
        return Ok(());
    }
    subscriptions.push(Arc::clone(watcher));

    match backend.subscribe(watcher) {
        Ok(()) => Ok(()),
        Err(error) => {
            subscriptions.retain(|subscribed| !Arc::ptr_eq(subscribed, watcher));
            drop(subscriptions);
            watcher.destroy();
            Err(error)
        }
    }
}

/// Unsubscribe `watcher`. When the subscription set empties, the backend
/// removes itself from the registry and its thread is joined.
pub(crate) fn unwatch(backend: &Arc<dyn Backend>, watcher: &Arc<Watcher>) -> Result<()> {
    let core = backend.core();
    let mut subscriptions = core.subscriptions.lock().unwrap();
    let before = subscriptions.len();
    subscriptions.retain(|subscribed| !Arc::ptr_eq(subscribed, watcher));

    let mut result = Ok(());
    if subscriptions.len() < before {
        result = backend.unsubscribe(watcher);
    }
    let empty = subscriptions.is_empty();
    drop(subscriptions);

    if empty {
        remove_shared(backend);
    }
    result
}

/// Route a recoverable per-watcher failure from a worker thread: deliver it
/// through the watcher's error slot and drop the subscription.
pub(crate) fn handle_watcher_error(backend: &Arc<dyn Backend>, watcher: &Arc<Watcher>, error: Error) {
    tracing::warn!(
        backend = backend.core().kind().as_str(),
        dir = %watcher.dir().display(),
        %error,
        "watcher error"
    );
    watcher.notify_error(error);
    let _ = unwatch(backend, watcher);
}

fn remove_shared(backend: &Arc<dyn Backend>) {
    let entry = {
        let mut entries = registry().lock().unwrap();
        let kind = backend.core().kind();
        match entries.get(&kind) {
            Some(shared) if Arc::ptr_eq(&shared.backend, backend) => entries.remove(&kind),
            _ => None,
        }
    };
    if let Some(mut shared) = entry {
        shutdown(backend, shared.thread.take());
    }
}

fn shutdown(backend: &Arc<dyn Backend>, thread: Option<JoinHandle<()>>) {
    backend.core().stop();
    backend.wake();
    if let Some(thread) = thread {
        // The teardown may run on the worker itself (error path); joining
        // your own thread deadlocks, and the loop exits on its own.
        if thread.thread().id() != std::thread::current().id() {
            let _ = thread.join();
        }
    }
    tracing::debug!(backend = backend.core().kind().as_str(), "backend shut down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::path::PathBuf;

    #[test]
    fn test_backend_kind_round_trips() {
        for kind in [
            BackendKind::FsEvents,
            BackendKind::Watchman,
            BackendKind::Inotify,
            BackendKind::Windows,
            BackendKind::BruteForce,
            BackendKind::Default,
        ] {
            assert_eq!(kind.as_str().parse::<BackendKind>().unwrap(), kind);
        }
        assert!("kqueue".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_brute_force_is_shared_and_refuses_subscriptions() {
        let first = get_shared(BackendKind::BruteForce).unwrap();
        let second = get_shared(BackendKind::BruteForce).unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let watcher = Watcher::get_shared(
            &PathBuf::from("/backend-test/brute"),
            &BTreeSet::new(),
            &[],
        );
        let err = watch(&first, &watcher).unwrap_err();
        assert_eq!(err, Error::Unsupported("live subscriptions"));
        Watcher::release(&watcher);
    }
}
