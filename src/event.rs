//! Change events and the per-watcher coalescing buffer.
//!
//! Backends append raw create/update/remove/rename notifications as they
//! decode OS events; the [`EventList`] coalesces them per path so that one
//! burst of kernel activity collapses into the minimal set of logical
//! changes. The coalescing rules are the contract:
//!
//! - create on a deleted entry becomes a plain update (rapid delete+create
//!   of a pre-existing file is a modification, not a churn pair);
//! - remove on a freshly created entry erases it (create+delete collapses
//!   to nothing);
//! - a rename links two entries through `path_from`/`path_to`;
//! - identifiers on an already-present event are only overwritten by
//!   non-sentinel values.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::ser::{Serialize, SerializeStruct, Serializer};

/// Sentinel inode number for platforms or paths without one.
pub const FAKE_INO: u64 = 0;

/// Sentinel per-volume file identifier.
pub const FAKE_FILEID: &str = "";

/// What a path points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    File,
    Directory,
    Unknown,
}

impl Kind {
    /// Digit used in the snapshot file format.
    pub(crate) fn to_digit(self) -> u8 {
        match self {
            Kind::File => 0,
            Kind::Directory => 1,
            Kind::Unknown => 2,
        }
    }

    pub(crate) fn from_digit(digit: u64) -> Kind {
        match digit {
            0 => Kind::File,
            1 => Kind::Directory,
            _ => Kind::Unknown,
        }
    }
}

/// The externally visible event classification, derived from the flags and
/// rename links of an [`Event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Create,
    Update,
    Delete,
    Rename,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Create => "create",
            EventType::Update => "update",
            EventType::Delete => "delete",
            EventType::Rename => "rename",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One coalesced filesystem change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Absolute path the change happened at.
    pub path: PathBuf,
    /// File or directory, when known.
    pub kind: Kind,
    /// Inode number, or [`FAKE_INO`].
    pub ino: u64,
    /// Per-volume stable identifier, or [`FAKE_FILEID`].
    pub file_id: String,
    /// Source path of a rename this event is linked to.
    pub path_from: Option<PathBuf>,
    /// Destination path of a rename this event is linked to.
    pub path_to: Option<PathBuf>,
    is_created: bool,
    is_deleted: bool,
}

impl Event {
    fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            kind: Kind::Unknown,
            ino: FAKE_INO,
            file_id: FAKE_FILEID.to_string(),
            path_from: None,
            path_to: None,
            is_created: false,
            is_deleted: false,
        }
    }

    /// Derive the external event type.
    pub fn event_type(&self) -> EventType {
        if self.path_from.is_some() && self.path_to.is_some() {
            EventType::Rename
        } else if self.is_created {
            EventType::Create
        } else if self.is_deleted {
            EventType::Delete
        } else {
            EventType::Update
        }
    }

    /// Overwrite identifiers with non-sentinel values only.
    fn merge_identity(&mut self, kind: Kind, ino: u64, file_id: &str) {
        if kind != Kind::Unknown {
            self.kind = kind;
        }
        if ino != FAKE_INO {
            self.ino = ino;
        }
        if file_id != FAKE_FILEID {
            self.file_id = file_id.to_string();
        }
    }
}

impl Serialize for Event {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut fields = 2;
        if self.kind != Kind::Unknown {
            fields += 1;
        }
        if self.ino != FAKE_INO {
            fields += 1;
        }
        if self.file_id != FAKE_FILEID {
            fields += 1;
        }
        if self.path_from.is_some() {
            fields += 1;
        }
        if self.path_to.is_some() {
            fields += 1;
        }

        let mut state = serializer.serialize_struct("Event", fields)?;
        state.serialize_field("path", &self.path.to_string_lossy())?;
        state.serialize_field("type", self.event_type().as_str())?;
        if self.kind != Kind::Unknown {
            state.serialize_field("kind", &self.kind)?;
        }
        if self.ino != FAKE_INO {
            state.serialize_field("ino", &self.ino.to_string())?;
        }
        if self.file_id != FAKE_FILEID {
            state.serialize_field("fileId", &self.file_id)?;
        }
        if let Some(from) = &self.path_from {
            state.serialize_field("pathFrom", &from.to_string_lossy())?;
        }
        if let Some(to) = &self.path_to {
            state.serialize_field("pathTo", &to.to_string_lossy())?;
        }
        state.end()
    }
}

/// Per-watcher event buffer. All operations take the list's lock.
#[derive(Debug, Default)]
pub struct EventList {
    events: Mutex<BTreeMap<PathBuf, Event>>,
}

impl EventList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a creation at `path`.
    pub fn create(&self, path: &Path, kind: Kind, ino: u64, file_id: &str) {
        let mut events = self.events.lock().unwrap();
        let event = events.entry(path.to_path_buf()).or_insert_with(|| Event::new(path));
        if event.is_deleted {
            // Assume update when a path is rapidly removed and re-created.
            event.is_deleted = false;
        } else {
            event.is_created = true;
        }
        event.merge_identity(kind, ino, file_id);
    }

    /// Record a modification at `path`.
    pub fn update(&self, path: &Path, kind: Kind, ino: u64, file_id: &str) {
        let mut events = self.events.lock().unwrap();
        let event = events.entry(path.to_path_buf()).or_insert_with(|| Event::new(path));
        event.merge_identity(kind, ino, file_id);
    }

    /// Record a removal at `path`.
    pub fn remove(&self, path: &Path, kind: Kind, ino: u64, file_id: &str) {
        let mut events = self.events.lock().unwrap();
        match events.get_mut(path) {
            Some(event) if event.is_created => {
                // Created and deleted inside one window: nothing happened.
                events.remove(path);
            }
            Some(event) => {
                event.is_deleted = true;
                event.merge_identity(kind, ino, file_id);
            }
            None => {
                let mut event = Event::new(path);
                event.is_deleted = true;
                event.merge_identity(kind, ino, file_id);
                events.insert(path.to_path_buf(), event);
            }
        }
    }

    /// Record a rename from `from` to `to`: two linked entries.
    pub fn rename(&self, from: &Path, to: &Path, kind: Kind, ino: u64, file_id: &str) {
        let mut events = self.events.lock().unwrap();

        let source = events.entry(from.to_path_buf()).or_insert_with(|| Event::new(from));
        source.path_to = Some(to.to_path_buf());

        let target = events.entry(to.to_path_buf()).or_insert_with(|| Event::new(to));
        target.path_from = Some(from.to_path_buf());
        target.path_to = Some(to.to_path_buf());
        target.merge_identity(kind, ino, file_id);
    }

    /// Number of buffered entries, including ones that will be suppressed.
    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().unwrap().is_empty()
    }

    /// Copy out the visible events. Entries marked both created and deleted
    /// are suppressed at read time.
    pub fn get_events(&self) -> Vec<Event> {
        let events = self.events.lock().unwrap();
        events
            .values()
            .filter(|event| !(event.is_created && event.is_deleted))
            .cloned()
            .collect()
    }

    /// Extract the visible events and clear the buffer atomically.
    pub fn take(&self) -> Vec<Event> {
        let mut events = self.events.lock().unwrap();
        let taken = std::mem::take(&mut *events);
        taken
            .into_values()
            .filter(|event| !(event.is_created && event.is_deleted))
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }
}
