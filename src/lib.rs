//! vigil: cross-platform recursive filesystem change notifier.
//!
//! Watches a directory tree and delivers a debounced, coalesced stream of
//! create/update/delete/rename events for everything beneath it, or captures
//! an opaque snapshot of the tree and later computes every change since.
//! One stable event and subscription model fronts four very different
//! native sources: inotify on Linux, FSEvents on macOS,
//! `ReadDirectoryChangesW` on Windows, an external Watchman daemon, plus a
//! brute-force tree-diff fallback for snapshots anywhere.
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! let callback: vigil::Callback = Arc::new(|batch| match batch {
//!     Ok(events) => {
//!         for event in events {
//!             println!("{} {}", event.event_type(), event.path.display());
//!         }
//!     }
//!     Err(err) => eprintln!("watch error: {err}"),
//! });
//!
//! let options = vigil::Options::default();
//! vigil::subscribe(Path::new("/tmp/project"), &callback, &options).unwrap();
//! // ... later ...
//! vigil::unsubscribe(Path::new("/tmp/project"), &callback, &options).unwrap();
//! ```

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

mod backend;
mod debounce;
mod error;
mod event;
mod glob;
mod signal;
mod tree;
mod watcher;

pub use backend::BackendKind;
pub use error::{Error, Result};
pub use event::{Event, EventList, EventType, Kind, FAKE_FILEID, FAKE_INO};
pub use glob::Glob;
pub use signal::{Signal, WaitResult};
pub use tree::{DirEntry, DirTree};
pub use watcher::Callback;

use watcher::Watcher;

impl Default for BackendKind {
    fn default() -> Self {
        BackendKind::Default
    }
}

/// Options accepted by every public operation.
#[derive(Debug, Clone, Default)]
pub struct Options {
    /// Which event-source implementation to use.
    pub backend: BackendKind,
    /// Absolute path prefixes to ignore: a path equal to or strictly under
    /// one of these never produces an event.
    pub ignore_paths: Vec<PathBuf>,
    /// Regex strings to ignore: a path fully matching any never produces an
    /// event.
    pub ignore_globs: Vec<String>,
}

/// Capture the current state of `dir` into `snapshot_path`.
pub fn write_snapshot(dir: &Path, snapshot_path: &Path, options: &Options) -> Result<()> {
    validate_dir(dir)?;
    let (ignore_paths, ignore_globs) = compile_ignores(options)?;

    let watcher = Watcher::get_shared(dir, &ignore_paths, &ignore_globs);
    let result = backend::get_shared(options.backend)
        .and_then(|backend| backend.write_snapshot(&watcher, snapshot_path));
    Watcher::release(&watcher);
    result
}

/// Compute every change to `dir` since the snapshot at `snapshot_path`.
pub fn get_events_since(
    dir: &Path,
    snapshot_path: &Path,
    options: &Options,
) -> Result<Vec<Event>> {
    validate_dir(dir)?;
    let (ignore_paths, ignore_globs) = compile_ignores(options)?;

    let watcher = Watcher::get_shared(dir, &ignore_paths, &ignore_globs);
    let result = backend::get_shared(options.backend)
        .and_then(|backend| backend.get_events_since(&watcher, snapshot_path));
    let events = watcher.events.take();
    Watcher::release(&watcher);
    result.map(|()| events)
}

/// Register `callback` for batched change events under `dir` until
/// [`unsubscribe`]. Registering a callback that is already subscribed with
/// the same options is a no-op.
pub fn subscribe(dir: &Path, callback: &Callback, options: &Options) -> Result<()> {
    validate_dir(dir)?;
    let (ignore_paths, ignore_globs) = compile_ignores(options)?;

    let watcher = Watcher::get_shared(dir, &ignore_paths, &ignore_globs);
    if watcher.watch(callback) {
        let shared = match backend::get_shared(options.backend) {
            Ok(shared) => shared,
            Err(error) => {
                watcher.destroy();
                Watcher::release(&watcher);
                return Err(error);
            }
        };
        if let Err(error) = backend::watch(&shared, &watcher) {
            Watcher::release(&watcher);
            return Err(error);
        }
        watcher.set_backend(shared);
    }
    Ok(())
}

/// Remove a callback registered by [`subscribe`]. Unsubscribing a callback
/// that is not registered is a no-op.
pub fn unsubscribe(dir: &Path, callback: &Callback, options: &Options) -> Result<()> {
    let (ignore_paths, ignore_globs) = compile_ignores(options)?;
    let Some(watcher) = Watcher::find_shared(dir, &ignore_paths, &ignore_globs) else {
        return Ok(());
    };

    let mut result = Ok(());
    if watcher.unwatch(callback) {
        if let Some(shared) = watcher.take_backend() {
            result = backend::unwatch(&shared, &watcher);
        }
        Watcher::release(&watcher);
    }
    result
}

fn validate_dir(dir: &Path) -> Result<()> {
    let meta = std::fs::metadata(dir)
        .map_err(|_| Error::config(format!("directory does not exist: {}", dir.display())))?;
    if !meta.is_dir() {
        return Err(Error::config(format!(
            "watched path is not a directory: {}",
            dir.display()
        )));
    }
    Ok(())
}

fn compile_ignores(options: &Options) -> Result<(BTreeSet<PathBuf>, Vec<Glob>)> {
    let ignore_globs = options
        .ignore_globs
        .iter()
        .map(|raw| Glob::new(raw))
        .collect::<Result<Vec<_>>>()?;
    let ignore_paths = options.ignore_paths.iter().cloned().collect();
    Ok((ignore_paths, ignore_globs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_missing_directory_is_config_error() {
        let err = write_snapshot(
            Path::new("/vigil-test/definitely-missing"),
            Path::new("/tmp/unused.snapshot"),
            &Options::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_non_directory_root_is_config_error() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let err = write_snapshot(
            file.path(),
            Path::new("/tmp/unused.snapshot"),
            &Options::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_bad_ignore_glob_is_config_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let callback: Callback = Arc::new(|_| {});
        let options = Options {
            ignore_globs: vec!["[unclosed".to_string()],
            ..Options::default()
        };
        let err = subscribe(dir.path(), &callback, &options).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_unsubscribe_unknown_watcher_is_noop() {
        let callback: Callback = Arc::new(|_| {});
        unsubscribe(
            Path::new("/vigil-test/never-subscribed"),
            &callback,
            &Options::default(),
        )
        .unwrap();
    }
}
