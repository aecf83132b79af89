//! Tree-walk backend: point-in-time snapshots and diffs, no live events.
//!
//! Also the substrate for the kernel backends on Linux and Windows, which
//! reuse the walker to build their initial mirror and the snapshot
//! read/write/diff plumbing for `writeSnapshot` / `getEventsSince`.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use walkdir::WalkDir;

use crate::backend::{Backend, BackendCore, BackendKind};
use crate::error::{Error, Result};
use crate::event::{Kind, FAKE_FILEID};
use crate::tree::DirTree;
use crate::watcher::Watcher;

pub(crate) struct BruteForceBackend {
    core: BackendCore,
}

impl BruteForceBackend {
    pub fn new() -> Self {
        Self {
            core: BackendCore::new(BackendKind::BruteForce),
        }
    }
}

impl Backend for BruteForceBackend {
    fn core(&self) -> &BackendCore {
        &self.core
    }

    fn run(self: Arc<Self>) {
        // No OS event source to pump; the worker only exists to satisfy the
        // lifecycle handshake.
        self.core.notify_started();
    }

    fn subscribe(&self, _watcher: &Arc<Watcher>) -> Result<()> {
        Err(Error::Unsupported("live subscriptions"))
    }

    fn unsubscribe(&self, _watcher: &Arc<Watcher>) -> Result<()> {
        Err(Error::Unsupported("live subscriptions"))
    }

    fn write_snapshot(&self, watcher: &Arc<Watcher>, snapshot_path: &Path) -> Result<()> {
        write_snapshot(watcher, snapshot_path)
    }

    fn get_events_since(&self, watcher: &Arc<Watcher>, snapshot_path: &Path) -> Result<()> {
        events_since(watcher, snapshot_path)
    }
}

/// Capture the watcher's current tree into `snapshot_path`.
pub(crate) fn write_snapshot(watcher: &Arc<Watcher>, snapshot_path: &Path) -> Result<()> {
    let tree = get_tree(watcher)?;
    let file = File::create(snapshot_path).map_err(|err| Error::io(snapshot_path, err))?;
    let mut out = BufWriter::new(file);
    tree.write(&mut out)
        .and_then(|()| out.flush())
        .map_err(|err| Error::io(snapshot_path, err))
}

/// Diff the state captured in `snapshot_path` against the current tree,
/// appending the changes to the watcher's event list.
pub(crate) fn events_since(watcher: &Arc<Watcher>, snapshot_path: &Path) -> Result<()> {
    let file = File::open(snapshot_path).map_err(|err| Error::io(snapshot_path, err))?;
    let snapshot = DirTree::read(watcher.dir(), &mut BufReader::new(file))
        .map_err(|err| Error::io(snapshot_path, err))?;

    let live = get_tree(watcher)?;
    live.get_changes(&snapshot, &watcher.events);
    Ok(())
}

/// Obtain the shared tree for the watcher's root, walking the filesystem if
/// it has not been fully populated. A live backend keeping the mirror
/// current satisfies `is_complete` and skips the walk.
pub(crate) fn get_tree(watcher: &Arc<Watcher>) -> Result<Arc<DirTree>> {
    let tree = DirTree::get_cached(watcher.dir());
    if !tree.is_complete() {
        read_tree(watcher, &tree)?;
        tree.set_complete();
    }
    Ok(tree)
}

/// Recursive physical walk of the watcher's directory into `tree`.
///
/// Symlinks are recorded but never followed. Entries matching the watcher's
/// ignore sets are skipped along with everything beneath them. An
/// unreadable subtree (EACCES) is skipped; any other walk failure aborts.
pub(crate) fn read_tree(watcher: &Arc<Watcher>, tree: &Arc<DirTree>) -> Result<()> {
    let walker = WalkDir::new(watcher.dir())
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| !watcher.is_ignored(entry.path()));

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) if is_permission_denied(&err) => {
                tracing::warn!(path = ?err.path(), "skipping unreadable subtree");
                continue;
            }
            Err(err) => {
                let path = err
                    .path()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| watcher.dir().to_path_buf());
                return Err(Error::io(&path, err.into()));
            }
        };

        let meta = match entry.metadata() {
            Ok(meta) => meta,
            Err(err) if is_permission_denied(&err) => continue,
            Err(err) => return Err(Error::io(entry.path(), err.into())),
        };

        let kind = if entry.file_type().is_dir() {
            Kind::Directory
        } else {
            Kind::File
        };
        let file_id = file_identity(entry.path());
        tree.add(entry.path(), inode(&meta), mtime_nanos(&meta), kind, &file_id);
    }
    Ok(())
}

fn is_permission_denied(err: &walkdir::Error) -> bool {
    err.io_error()
        .map(|io| io.kind() == std::io::ErrorKind::PermissionDenied)
        .unwrap_or(false)
}

/// Modification time in nanoseconds since the epoch; zero when the platform
/// cannot say.
pub(crate) fn mtime_nanos(meta: &std::fs::Metadata) -> u64 {
    meta.modified()
        .ok()
        .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
        .map(|duration| duration.as_nanos() as u64)
        .unwrap_or(0)
}

#[cfg(unix)]
pub(crate) fn inode(meta: &std::fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    meta.ino()
}

#[cfg(not(unix))]
pub(crate) fn inode(_meta: &std::fs::Metadata) -> u64 {
    crate::event::FAKE_INO
}

#[cfg(windows)]
fn file_identity(path: &Path) -> String {
    crate::backend::windows::file_id(path).unwrap_or_else(|| FAKE_FILEID.to_string())
}

#[cfg(not(windows))]
fn file_identity(_path: &Path) -> String {
    FAKE_FILEID.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::FAKE_INO;
    use std::collections::BTreeSet;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_read_tree_records_files_and_directories() {
        let fixture = TempDir::new().unwrap();
        let root = fixture.path();
        fs::create_dir(root.join("sub")).unwrap();
        fs::write(root.join("sub/a.txt"), b"a").unwrap();
        fs::write(root.join("b.txt"), b"b").unwrap();

        let watcher = Watcher::get_shared(root, &BTreeSet::new(), &[]);
        let tree = Arc::new(DirTree::new(root));
        read_tree(&watcher, &tree).unwrap();

        assert_eq!(tree.len(), 4);
        assert_eq!(tree.find(root).unwrap().kind, Kind::Directory);
        assert_eq!(tree.find(&root.join("sub")).unwrap().kind, Kind::Directory);
        let file = tree.find(&root.join("sub/a.txt")).unwrap();
        assert_eq!(file.kind, Kind::File);
        assert_ne!(file.ino, FAKE_INO);
        assert_ne!(file.mtime, 0);

        Watcher::release(&watcher);
    }

    #[test]
    fn test_read_tree_skips_ignored_subtrees() {
        let fixture = TempDir::new().unwrap();
        let root = fixture.path();
        fs::create_dir(root.join("skip")).unwrap();
        fs::write(root.join("skip/inner.txt"), b"x").unwrap();
        fs::write(root.join("kept.txt"), b"y").unwrap();

        let ignores: BTreeSet<_> = [root.join("skip")].into();
        let watcher = Watcher::get_shared(root, &ignores, &[]);
        let tree = Arc::new(DirTree::new(root));
        read_tree(&watcher, &tree).unwrap();

        assert!(tree.find(&root.join("skip")).is_none());
        assert!(tree.find(&root.join("skip/inner.txt")).is_none());
        assert!(tree.find(&root.join("kept.txt")).is_some());

        Watcher::release(&watcher);
    }

    #[cfg(unix)]
    #[test]
    fn test_read_tree_does_not_follow_symlinks() {
        let fixture = TempDir::new().unwrap();
        let root = fixture.path();
        fs::create_dir(root.join("real")).unwrap();
        fs::write(root.join("real/inner.txt"), b"x").unwrap();
        std::os::unix::fs::symlink(root.join("real"), root.join("link")).unwrap();

        let watcher = Watcher::get_shared(root, &BTreeSet::new(), &[]);
        let tree = Arc::new(DirTree::new(root));
        read_tree(&watcher, &tree).unwrap();

        // The link itself is recorded as a non-directory; nothing beneath it.
        assert_eq!(tree.find(&root.join("link")).unwrap().kind, Kind::File);
        assert!(tree.find(&root.join("link/inner.txt")).is_none());

        Watcher::release(&watcher);
    }
}
