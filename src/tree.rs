//! In-memory mirror of a directory subtree.
//!
//! A [`DirTree`] serves two masters: live backends keep one current while
//! decoding OS events (to disambiguate coalesced notifications and detect
//! renames), and the snapshot machinery serializes one to disk and diffs it
//! against a later state. Both views share the same structure through the
//! process-wide cache, so a watcher and a snapshot of the same root never
//! disagree about what the tree looked like.
//!
//! The serialized form is line-oriented and self-describing: an entry count,
//! then one length-prefixed record per entry. Readers tolerate records whose
//! trailing identifier fields are missing and substitute sentinels, which
//! keeps old snapshot files loadable.

use std::collections::{BTreeMap, HashMap};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use crate::event::{EventList, Kind, FAKE_FILEID, FAKE_INO};

/// One mirrored node. Children are located by path prefix in the enclosing
/// tree; an entry owns nothing but its own identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Absolute path of the node.
    pub path: PathBuf,
    /// Inode number, or [`FAKE_INO`] when unavailable.
    pub ino: u64,
    /// Modification time in nanoseconds since the epoch where the platform
    /// provides it, else whole seconds scaled up.
    pub mtime: u64,
    pub kind: Kind,
    /// Per-volume stable identifier, or [`FAKE_FILEID`].
    pub file_id: String,
}

impl DirEntry {
    fn write(&self, out: &mut impl Write) -> io::Result<()> {
        let bytes = path_bytes(&self.path);
        write!(out, "{}", bytes.len())?;
        out.write_all(&bytes)?;
        writeln!(
            out,
            "{} {} {} {} ",
            self.mtime,
            self.kind.to_digit(),
            self.ino,
            self.file_id
        )
    }
}

#[derive(Debug, Default)]
struct TreeInner {
    entries: BTreeMap<PathBuf, DirEntry>,
    is_complete: bool,
}

/// Mirror of the subtree rooted at `root`. All operations take the tree's
/// own lock; when two trees are involved (diffing) the live tree is locked
/// before the snapshot.
#[derive(Debug)]
pub struct DirTree {
    root: PathBuf,
    inner: Mutex<TreeInner>,
}

fn tree_cache() -> &'static Mutex<HashMap<PathBuf, Weak<DirTree>>> {
    static CACHE: OnceLock<Mutex<HashMap<PathBuf, Weak<DirTree>>>> = OnceLock::new();
    CACHE.get_or_init(Default::default)
}

impl DirTree {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            inner: Mutex::new(TreeInner::default()),
        }
    }

    /// Fetch the shared tree for `root`, creating an empty incomplete one if
    /// no live reference exists. Entries whose last strong reference is gone
    /// are pruned on the way.
    pub fn get_cached(root: &Path) -> Arc<DirTree> {
        let mut cache = tree_cache().lock().unwrap();
        cache.retain(|_, weak| weak.strong_count() > 0);
        if let Some(tree) = cache.get(root).and_then(Weak::upgrade) {
            return tree;
        }
        let tree = Arc::new(DirTree::new(root));
        cache.insert(root.to_path_buf(), Arc::downgrade(&tree));
        tree
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether the tree has been fully populated from disk.
    pub fn is_complete(&self) -> bool {
        self.inner.lock().unwrap().is_complete
    }

    pub fn set_complete(&self) {
        self.inner.lock().unwrap().is_complete = true;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().entries.is_empty()
    }

    /// Insert an entry. Inserting a path that already exists keeps the
    /// existing entry untouched. Returns the entry now present.
    pub fn add(&self, path: &Path, ino: u64, mtime: u64, kind: Kind, file_id: &str) -> DirEntry {
        let mut inner = self.inner.lock().unwrap();
        inner
            .entries
            .entry(path.to_path_buf())
            .or_insert_with(|| DirEntry {
                path: path.to_path_buf(),
                ino,
                mtime,
                kind,
                file_id: file_id.to_string(),
            })
            .clone()
    }

    /// Update a present entry: `mtime` unconditionally, identifiers only
    /// when the supplied value is not the sentinel. Returns `None` when the
    /// path is not mirrored.
    pub fn update(&self, path: &Path, ino: u64, mtime: u64, file_id: &str) -> Option<DirEntry> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.entries.get_mut(path)?;
        entry.mtime = mtime;
        if ino != FAKE_INO {
            entry.ino = ino;
        }
        if file_id != FAKE_FILEID {
            entry.file_id = file_id.to_string();
        }
        Some(entry.clone())
    }

    /// Remove an entry. Removing a directory removes every entry strictly
    /// beneath it in the same critical section.
    pub fn remove(&self, path: &Path) {
        let mut inner = self.inner.lock().unwrap();
        let is_dir = inner
            .entries
            .get(path)
            .map(|entry| entry.kind == Kind::Directory)
            .unwrap_or(false);
        if is_dir {
            let doomed: Vec<PathBuf> = inner
                .entries
                .keys()
                .filter(|key| key.as_path() != path && key.starts_with(path))
                .cloned()
                .collect();
            for key in doomed {
                inner.entries.remove(&key);
            }
        }
        inner.entries.remove(path);
    }

    /// Move `from` (and its subtree when it is a directory) to `to`,
    /// preserving entry metadata. Used by backends that learn about renames
    /// directly from the OS.
    pub fn rename(&self, from: &Path, to: &Path) {
        let mut inner = self.inner.lock().unwrap();
        let is_dir = inner
            .entries
            .get(from)
            .map(|entry| entry.kind == Kind::Directory)
            .unwrap_or(false);
        rekey(&mut inner.entries, from, to, is_dir);
    }

    pub fn find(&self, path: &Path) -> Option<DirEntry> {
        self.inner.lock().unwrap().entries.get(path).cloned()
    }

    /// Linear scan by inode number.
    pub fn find_by_ino(&self, ino: u64) -> Option<DirEntry> {
        let inner = self.inner.lock().unwrap();
        inner.entries.values().find(|entry| entry.ino == ino).cloned()
    }

    /// Linear scan by per-volume file identifier.
    pub fn find_by_file_id(&self, file_id: &str) -> Option<DirEntry> {
        let inner = self.inner.lock().unwrap();
        inner
            .entries
            .values()
            .find(|entry| entry.file_id == file_id)
            .cloned()
    }

    /// Snapshot of all directory entries, for backends that install one
    /// kernel watch per directory.
    pub fn directories(&self) -> Vec<DirEntry> {
        let inner = self.inner.lock().unwrap();
        inner
            .entries
            .values()
            .filter(|entry| entry.kind == Kind::Directory)
            .cloned()
            .collect()
    }

    /// Serialize to the snapshot format: `count\n` then one record per entry
    /// in path order.
    pub fn write(&self, out: &mut impl Write) -> io::Result<()> {
        let inner = self.inner.lock().unwrap();
        writeln!(out, "{}", inner.entries.len())?;
        for entry in inner.entries.values() {
            entry.write(out)?;
        }
        Ok(())
    }

    /// Deserialize a snapshot written by [`DirTree::write`]. Records missing
    /// trailing `ino`/`fileId` fields get sentinels, so snapshots from
    /// older versions still load.
    pub fn read(root: &Path, input: &mut impl Read) -> io::Result<DirTree> {
        let mut bytes = Vec::new();
        input.read_to_end(&mut bytes)?;
        let mut cursor = Cursor { bytes: &bytes, pos: 0 };

        let count = cursor.read_number()?;
        let mut entries = BTreeMap::new();
        for _ in 0..count {
            let len = cursor.read_number()? as usize;
            let path = bytes_to_path(cursor.read_exact(len)?);
            let rest = cursor.read_line();
            let mut fields = rest.split_whitespace();

            let mtime = fields
                .next()
                .and_then(|field| field.parse::<u64>().ok())
                .ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidData, "snapshot entry missing mtime")
                })?;
            let kind = fields
                .next()
                .and_then(|field| field.parse::<u64>().ok())
                .map(Kind::from_digit)
                .unwrap_or(Kind::Unknown);
            let ino = fields
                .next()
                .and_then(|field| field.parse::<u64>().ok())
                .unwrap_or(FAKE_INO);
            let file_id = fields.next().unwrap_or(FAKE_FILEID).to_string();

            entries.insert(
                path.clone(),
                DirEntry {
                    path,
                    ino,
                    mtime,
                    kind,
                    file_id,
                },
            );
        }

        Ok(DirTree {
            root: root.to_path_buf(),
            inner: Mutex::new(TreeInner {
                entries,
                is_complete: true,
            }),
        })
    }

    /// Diff `snapshot` (the earlier state) against `self` (the current
    /// state), appending the changes to `events`. Both trees stay locked for
    /// the duration.
    ///
    /// When entries carry identifiers, an identity-based pass runs first so
    /// renames are recognized and reported as such; the path-based pass then
    /// covers everything else. Without identifiers only the path-based pass
    /// runs and a rename degrades to a delete plus a create.
    pub fn get_changes(&self, snapshot: &DirTree, events: &EventList) {
        let live = self.inner.lock().unwrap();
        let mut snap = snapshot.inner.lock().unwrap();

        // Identity pass: removals first, from the snapshot's perspective.
        for entry in snap.entries.values() {
            if !has_identity(entry) {
                continue;
            }
            if find_matching(&live.entries, entry).is_none() {
                events.remove(&entry.path, entry.kind, entry.ino, &entry.file_id);
            }
        }

        // Identity pass: kind changes, renames, and content updates from the
        // live perspective. A rename re-keys the snapshot on the spot so the
        // rest of this pass (and the path pass) sees the renamed directory's
        // descendants under their current names and leaves them alone.
        for entry in live.entries.values() {
            if !has_identity(entry) {
                continue;
            }
            let Some(prior) = find_matching(&snap.entries, entry).cloned() else {
                continue;
            };
            if prior.kind != entry.kind {
                events.remove(&prior.path, prior.kind, prior.ino, &prior.file_id);
                events.create(&entry.path, entry.kind, entry.ino, &entry.file_id);
            } else if prior.path != entry.path {
                events.create(&prior.path, prior.kind, prior.ino, &prior.file_id);
                events.rename(&prior.path, &entry.path, entry.kind, entry.ino, &entry.file_id);
                rekey(
                    &mut snap.entries,
                    &prior.path,
                    &entry.path,
                    entry.kind == Kind::Directory,
                );
            } else if entry.kind == Kind::File && prior.mtime != entry.mtime {
                events.update(&entry.path, entry.kind, entry.ino, &entry.file_id);
            }
        }

        // Path pass, always: covers identifier-less entries and everything
        // the identity pass left alone. Duplicates coalesce in the list.
        for (path, entry) in snap.entries.iter() {
            if !live.entries.contains_key(path) {
                events.remove(path, entry.kind, entry.ino, &entry.file_id);
            }
        }
        for (path, entry) in live.entries.iter() {
            match snap.entries.get(path) {
                None => events.create(path, entry.kind, entry.ino, &entry.file_id),
                Some(prior) => {
                    if prior.mtime != entry.mtime
                        && prior.kind != Kind::Directory
                        && entry.kind != Kind::Directory
                    {
                        events.update(path, entry.kind, entry.ino, &entry.file_id);
                    }
                }
            }
        }
    }
}

fn has_identity(entry: &DirEntry) -> bool {
    entry.file_id != FAKE_FILEID || entry.ino != FAKE_INO
}

/// Find the entry matching `probe` by fileId when present, else by inode.
fn find_matching<'a>(
    entries: &'a BTreeMap<PathBuf, DirEntry>,
    probe: &DirEntry,
) -> Option<&'a DirEntry> {
    if probe.file_id != FAKE_FILEID {
        entries.values().find(|entry| entry.file_id == probe.file_id)
    } else if probe.ino != FAKE_INO {
        entries.values().find(|entry| entry.ino == probe.ino)
    } else {
        None
    }
}

/// Move an entry from `old` to `new`, and all entries beneath it when the
/// renamed entry is a directory.
fn rekey(entries: &mut BTreeMap<PathBuf, DirEntry>, old: &Path, new: &Path, recursive: bool) {
    if let Some(mut entry) = entries.remove(old) {
        entry.path = new.to_path_buf();
        entries.insert(new.to_path_buf(), entry);
    }
    if !recursive {
        return;
    }
    let descendants: Vec<PathBuf> = entries
        .keys()
        .filter(|key| key.as_path() != new && key.starts_with(old))
        .cloned()
        .collect();
    for key in descendants {
        if let Some(mut entry) = entries.remove(&key) {
            if let Ok(suffix) = key.strip_prefix(old) {
                entry.path = new.join(suffix);
                entries.insert(entry.path.clone(), entry);
            }
        }
    }
}

#[cfg(unix)]
fn path_bytes(path: &Path) -> Vec<u8> {
    use std::os::unix::ffi::OsStrExt;
    path.as_os_str().as_bytes().to_vec()
}

#[cfg(not(unix))]
fn path_bytes(path: &Path) -> Vec<u8> {
    path.to_string_lossy().into_owned().into_bytes()
}

#[cfg(unix)]
fn bytes_to_path(bytes: &[u8]) -> PathBuf {
    use std::os::unix::ffi::OsStrExt;
    PathBuf::from(std::ffi::OsStr::from_bytes(bytes))
}

#[cfg(not(unix))]
fn bytes_to_path(bytes: &[u8]) -> PathBuf {
    PathBuf::from(String::from_utf8_lossy(bytes).into_owned())
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn skip_whitespace(&mut self) {
        while self.pos < self.bytes.len() && self.bytes[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
    }

    fn read_number(&mut self) -> io::Result<u64> {
        self.skip_whitespace();
        let start = self.pos;
        while self.pos < self.bytes.len() && self.bytes[self.pos].is_ascii_digit() {
            self.pos += 1;
        }
        if start == self.pos {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "malformed snapshot: expected a number",
            ));
        }
        std::str::from_utf8(&self.bytes[start..self.pos])
            .ok()
            .and_then(|digits| digits.parse().ok())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "malformed snapshot length"))
    }

    fn read_exact(&mut self, len: usize) -> io::Result<&'a [u8]> {
        if self.pos + len > self.bytes.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "truncated snapshot entry",
            ));
        }
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn read_line(&mut self) -> String {
        let start = self.pos;
        while self.pos < self.bytes.len() && self.bytes[self.pos] != b'\n' {
            self.pos += 1;
        }
        let line = String::from_utf8_lossy(&self.bytes[start..self.pos]).into_owned();
        if self.pos < self.bytes.len() {
            self.pos += 1;
        }
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;

    fn entry_count(tree: &DirTree) -> usize {
        tree.len()
    }

    #[test]
    fn test_add_is_noop_when_present() {
        let tree = DirTree::new(Path::new("/r"));
        tree.add(Path::new("/r/a"), 1, 100, Kind::File, FAKE_FILEID);
        tree.add(Path::new("/r/a"), 2, 200, Kind::Directory, "0xbeef");

        let entry = tree.find(Path::new("/r/a")).unwrap();
        assert_eq!(entry.ino, 1);
        assert_eq!(entry.mtime, 100);
        assert_eq!(entry.kind, Kind::File);
    }

    #[test]
    fn test_update_respects_sentinels() {
        let tree = DirTree::new(Path::new("/r"));
        tree.add(Path::new("/r/a"), 7, 100, Kind::File, "0xaa");
        tree.update(Path::new("/r/a"), FAKE_INO, 300, FAKE_FILEID);

        let entry = tree.find(Path::new("/r/a")).unwrap();
        assert_eq!(entry.mtime, 300);
        assert_eq!(entry.ino, 7);
        assert_eq!(entry.file_id, "0xaa");

        assert!(tree.update(Path::new("/r/missing"), 1, 1, FAKE_FILEID).is_none());
    }

    #[test]
    fn test_remove_directory_is_recursive() {
        let tree = DirTree::new(Path::new("/r"));
        tree.add(Path::new("/r/a"), 1, 1, Kind::Directory, FAKE_FILEID);
        tree.add(Path::new("/r/a/b"), 2, 1, Kind::Directory, FAKE_FILEID);
        tree.add(Path::new("/r/a/b/c.txt"), 3, 1, Kind::File, FAKE_FILEID);
        tree.add(Path::new("/r/ab.txt"), 4, 1, Kind::File, FAKE_FILEID);

        tree.remove(Path::new("/r/a"));

        assert!(tree.find(Path::new("/r/a")).is_none());
        assert!(tree.find(Path::new("/r/a/b")).is_none());
        assert!(tree.find(Path::new("/r/a/b/c.txt")).is_none());
        // Sibling with a common string prefix survives.
        assert!(tree.find(Path::new("/r/ab.txt")).is_some());
    }

    #[test]
    fn test_serialization_round_trip() {
        let tree = DirTree::new(Path::new("/r"));
        tree.add(Path::new("/r"), 10, 1111, Kind::Directory, FAKE_FILEID);
        tree.add(Path::new("/r/with space.txt"), 11, 2222, Kind::File, "0x1f");
        tree.add(Path::new("/r/plain"), 12, 3333, Kind::File, FAKE_FILEID);

        let mut buf = Vec::new();
        tree.write(&mut buf).unwrap();

        let restored = DirTree::read(Path::new("/r"), &mut buf.as_slice()).unwrap();
        assert_eq!(entry_count(&restored), 3);
        assert!(restored.is_complete());

        let spaced = restored.find(Path::new("/r/with space.txt")).unwrap();
        assert_eq!(spaced.ino, 11);
        assert_eq!(spaced.mtime, 2222);
        assert_eq!(spaced.kind, Kind::File);
        assert_eq!(spaced.file_id, "0x1f");
    }

    #[test]
    fn test_read_tolerates_missing_trailing_fields() {
        // Old snapshots carried only mtime and kind.
        let payload = b"1\n7/r/a.rs1234 0\n";
        let tree = DirTree::read(Path::new("/r"), &mut payload.as_slice()).unwrap();

        let entry = tree.find(Path::new("/r/a.rs")).unwrap();
        assert_eq!(entry.mtime, 1234);
        assert_eq!(entry.kind, Kind::File);
        assert_eq!(entry.ino, FAKE_INO);
        assert_eq!(entry.file_id, FAKE_FILEID);
    }

    #[test]
    fn test_get_changes_by_path() {
        let snapshot = DirTree::new(Path::new("/r"));
        snapshot.add(Path::new("/r/kept.txt"), FAKE_INO, 100, Kind::File, FAKE_FILEID);
        snapshot.add(Path::new("/r/gone.txt"), FAKE_INO, 100, Kind::File, FAKE_FILEID);
        snapshot.add(Path::new("/r/touched.txt"), FAKE_INO, 100, Kind::File, FAKE_FILEID);

        let live = DirTree::new(Path::new("/r"));
        live.add(Path::new("/r/kept.txt"), FAKE_INO, 100, Kind::File, FAKE_FILEID);
        live.add(Path::new("/r/touched.txt"), FAKE_INO, 200, Kind::File, FAKE_FILEID);
        live.add(Path::new("/r/fresh.txt"), FAKE_INO, 300, Kind::File, FAKE_FILEID);

        let events = EventList::new();
        live.get_changes(&snapshot, &events);

        let events = events.take();
        assert_eq!(events.len(), 3);
        let by_path = |p: &str| {
            events
                .iter()
                .find(|event| event.path == Path::new(p))
                .unwrap()
                .event_type()
        };
        assert_eq!(by_path("/r/gone.txt"), EventType::Delete);
        assert_eq!(by_path("/r/touched.txt"), EventType::Update);
        assert_eq!(by_path("/r/fresh.txt"), EventType::Create);
    }

    #[test]
    fn test_get_changes_detects_directory_rename_by_identity() {
        let snapshot = DirTree::new(Path::new("/r"));
        snapshot.add(Path::new("/r/dir"), 5, 100, Kind::Directory, FAKE_FILEID);
        snapshot.add(Path::new("/r/dir/file"), 6, 100, Kind::File, FAKE_FILEID);

        let live = DirTree::new(Path::new("/r"));
        live.add(Path::new("/r/dir2"), 5, 100, Kind::Directory, FAKE_FILEID);
        live.add(Path::new("/r/dir2/file"), 6, 100, Kind::File, FAKE_FILEID);

        let events = EventList::new();
        live.get_changes(&snapshot, &events);
        let events = events.take();

        // One create for the old path and one linked rename; the descendant
        // keeps its identity and stays silent.
        let rename = events
            .iter()
            .find(|event| event.event_type() == EventType::Rename)
            .unwrap();
        assert_eq!(rename.path_from.as_deref(), Some(Path::new("/r/dir")));
        assert_eq!(rename.path_to.as_deref(), Some(Path::new("/r/dir2")));

        let create = events
            .iter()
            .find(|event| event.event_type() == EventType::Create)
            .unwrap();
        assert_eq!(create.path, Path::new("/r/dir"));

        assert!(!events.iter().any(|event| event.path == Path::new("/r/dir/file")
            || event.path == Path::new("/r/dir2/file")));
    }

    #[test]
    fn test_get_changes_rename_without_identity_degrades() {
        let snapshot = DirTree::new(Path::new("/r"));
        snapshot.add(Path::new("/r/dir"), FAKE_INO, 100, Kind::Directory, FAKE_FILEID);
        snapshot.add(Path::new("/r/dir/file"), FAKE_INO, 100, Kind::File, FAKE_FILEID);

        let live = DirTree::new(Path::new("/r"));
        live.add(Path::new("/r/dir2"), FAKE_INO, 100, Kind::Directory, FAKE_FILEID);
        live.add(Path::new("/r/dir2/file"), FAKE_INO, 100, Kind::File, FAKE_FILEID);

        let events = EventList::new();
        live.get_changes(&snapshot, &events);
        let events = events.take();

        assert_eq!(events.len(), 4);
        let removes = events
            .iter()
            .filter(|event| event.event_type() == EventType::Delete)
            .count();
        let creates = events
            .iter()
            .filter(|event| event.event_type() == EventType::Create)
            .count();
        assert_eq!(removes, 2);
        assert_eq!(creates, 2);
    }

    #[test]
    fn test_get_changes_replaced_file_is_update() {
        // Same path, different inode and mtime: the identity pass emits a
        // remove and a create which the list coalesces into an update.
        let snapshot = DirTree::new(Path::new("/r"));
        snapshot.add(Path::new("/r/a.txt"), 1, 100, Kind::File, FAKE_FILEID);

        let live = DirTree::new(Path::new("/r"));
        live.add(Path::new("/r/a.txt"), 2, 200, Kind::File, FAKE_FILEID);

        let events = EventList::new();
        live.get_changes(&snapshot, &events);
        let events = events.take();

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type(), EventType::Update);
    }

    #[test]
    fn test_cache_shares_and_expires() {
        let root = PathBuf::from("/cache-test-root");
        let first = DirTree::get_cached(&root);
        let second = DirTree::get_cached(&root);
        assert!(Arc::ptr_eq(&first, &second));

        first.add(Path::new("/cache-test-root/x"), 1, 1, Kind::File, FAKE_FILEID);
        assert_eq!(second.len(), 1);

        drop(first);
        drop(second);
        let fresh = DirTree::get_cached(&root);
        assert!(fresh.is_empty());
    }
}
