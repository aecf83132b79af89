//! Snapshot / diff scenarios against the brute-force backend.
//!
//! Snapshot files are written outside the watched directory so the snapshot
//! itself never shows up in the diff.

use std::fs;
use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::Duration;

use anyhow::Result;
use tempfile::TempDir;

use vigil::{BackendKind, Event, EventType, Kind, Options};

fn brute_force() -> Options {
    Options {
        backend: BackendKind::BruteForce,
        ..Options::default()
    }
}

fn snapshot_file(holder: &TempDir) -> PathBuf {
    holder.path().join("state.snapshot")
}

fn event_for<'a>(events: &'a [Event], path: &Path) -> &'a Event {
    events
        .iter()
        .find(|event| event.path == path)
        .unwrap_or_else(|| panic!("no event for {}", path.display()))
}

/// Coarse-timestamp filesystems need the mtime to actually move.
fn let_mtime_advance() {
    sleep(Duration::from_millis(1100));
}

#[test]
fn test_create_file_since_snapshot() -> Result<()> {
    let dir = TempDir::new()?;
    let holder = TempDir::new()?;
    let snapshot = snapshot_file(&holder);

    vigil::write_snapshot(dir.path(), &snapshot, &brute_force())?;
    fs::write(dir.path().join("a.txt"), b"hello")?;

    let events = vigil::get_events_since(dir.path(), &snapshot, &brute_force())?;
    assert_eq!(events.len(), 1);
    let event = event_for(&events, &dir.path().join("a.txt"));
    assert_eq!(event.event_type(), EventType::Create);
    assert_eq!(event.kind, Kind::File);
    Ok(())
}

#[test]
fn test_update_file_since_snapshot() -> Result<()> {
    let dir = TempDir::new()?;
    let holder = TempDir::new()?;
    let snapshot = snapshot_file(&holder);

    let target = dir.path().join("a.txt");
    fs::write(&target, b"before")?;
    vigil::write_snapshot(dir.path(), &snapshot, &brute_force())?;

    let_mtime_advance();
    fs::write(&target, b"after")?;

    let events = vigil::get_events_since(dir.path(), &snapshot, &brute_force())?;
    assert_eq!(events.len(), 1);
    assert_eq!(event_for(&events, &target).event_type(), EventType::Update);
    Ok(())
}

#[test]
fn test_delete_file_since_snapshot() -> Result<()> {
    let dir = TempDir::new()?;
    let holder = TempDir::new()?;
    let snapshot = snapshot_file(&holder);

    let target = dir.path().join("doomed.txt");
    fs::write(&target, b"x")?;
    vigil::write_snapshot(dir.path(), &snapshot, &brute_force())?;
    fs::remove_file(&target)?;

    let events = vigil::get_events_since(dir.path(), &snapshot, &brute_force())?;
    assert_eq!(events.len(), 1);
    assert_eq!(event_for(&events, &target).event_type(), EventType::Delete);
    Ok(())
}

#[cfg(unix)]
#[test]
fn test_directory_rename_is_reported_as_rename() -> Result<()> {
    let dir = TempDir::new()?;
    let holder = TempDir::new()?;
    let snapshot = snapshot_file(&holder);

    let old_dir = dir.path().join("dir");
    let new_dir = dir.path().join("dir2");
    fs::create_dir(&old_dir)?;
    fs::write(old_dir.join("file"), b"x")?;
    vigil::write_snapshot(dir.path(), &snapshot, &brute_force())?;

    fs::rename(&old_dir, &new_dir)?;

    let events = vigil::get_events_since(dir.path(), &snapshot, &brute_force())?;

    // Inode identity survives the rename: one create for the old path, one
    // linked rename, and nothing at all for the untouched descendant.
    assert_eq!(events.len(), 2);
    let rename = events
        .iter()
        .find(|event| event.event_type() == EventType::Rename)
        .expect("rename event");
    assert_eq!(rename.path_from.as_deref(), Some(old_dir.as_path()));
    assert_eq!(rename.path_to.as_deref(), Some(new_dir.as_path()));

    let create = events
        .iter()
        .find(|event| event.event_type() == EventType::Create)
        .expect("create event");
    assert_eq!(create.path, old_dir);

    assert!(!events.iter().any(|event| event.path.starts_with(&new_dir)
        && event.path != new_dir));
    Ok(())
}

#[test]
fn test_recursive_delete_reports_every_entry() -> Result<()> {
    let dir = TempDir::new()?;
    let holder = TempDir::new()?;
    let snapshot = snapshot_file(&holder);

    let sub = dir.path().join("a");
    fs::create_dir(&sub)?;
    fs::write(sub.join("b.txt"), b"x")?;
    vigil::write_snapshot(dir.path(), &snapshot, &brute_force())?;

    fs::remove_dir_all(&sub)?;

    let events = vigil::get_events_since(dir.path(), &snapshot, &brute_force())?;
    assert_eq!(events.len(), 2);
    assert_eq!(event_for(&events, &sub).event_type(), EventType::Delete);
    assert_eq!(
        event_for(&events, &sub.join("b.txt")).event_type(),
        EventType::Delete
    );
    Ok(())
}

#[test]
fn test_ignore_globs_filter_the_diff() -> Result<()> {
    let dir = TempDir::new()?;
    let holder = TempDir::new()?;
    let snapshot = snapshot_file(&holder);

    let options = Options {
        backend: BackendKind::BruteForce,
        ignore_globs: vec![r"^.*\.tmp$".to_string()],
        ..Options::default()
    };

    vigil::write_snapshot(dir.path(), &snapshot, &options)?;
    fs::write(dir.path().join("x.tmp"), b"scratch")?;
    fs::write(dir.path().join("x.txt"), b"real")?;

    let events = vigil::get_events_since(dir.path(), &snapshot, &options)?;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].path, dir.path().join("x.txt"));
    assert_eq!(events[0].event_type(), EventType::Create);
    Ok(())
}

#[test]
fn test_ignore_paths_filter_the_diff() -> Result<()> {
    let dir = TempDir::new()?;
    let holder = TempDir::new()?;
    let snapshot = snapshot_file(&holder);

    let skipped = dir.path().join("build");
    fs::create_dir(&skipped)?;

    let options = Options {
        backend: BackendKind::BruteForce,
        ignore_paths: vec![skipped.clone()],
        ..Options::default()
    };

    vigil::write_snapshot(dir.path(), &snapshot, &options)?;
    fs::write(skipped.join("artifact.o"), b"obj")?;
    fs::write(dir.path().join("source.rs"), b"fn main() {}")?;

    let events = vigil::get_events_since(dir.path(), &snapshot, &options)?;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].path, dir.path().join("source.rs"));
    Ok(())
}

#[test]
fn test_missing_snapshot_file_is_an_error() {
    let dir = TempDir::new().unwrap();
    let err = vigil::get_events_since(
        dir.path(),
        &dir.path().join("never-written.snapshot"),
        &brute_force(),
    )
    .unwrap_err();
    assert!(matches!(err, vigil::Error::Io { .. }));
}

#[test]
fn test_unchanged_tree_diffs_to_nothing() -> Result<()> {
    let dir = TempDir::new()?;
    let holder = TempDir::new()?;
    let snapshot = snapshot_file(&holder);

    fs::create_dir(dir.path().join("sub"))?;
    fs::write(dir.path().join("sub/a.txt"), b"stable")?;
    vigil::write_snapshot(dir.path(), &snapshot, &brute_force())?;

    let events = vigil::get_events_since(dir.path(), &snapshot, &brute_force())?;
    assert!(events.is_empty(), "unexpected events: {events:?}");
    Ok(())
}

#[test]
fn test_mixed_changes_round_trip() -> Result<()> {
    let dir = TempDir::new()?;
    let holder = TempDir::new()?;
    let snapshot = snapshot_file(&holder);

    let kept = dir.path().join("kept.txt");
    let touched = dir.path().join("touched.txt");
    let doomed = dir.path().join("doomed.txt");
    fs::write(&kept, b"kept")?;
    fs::write(&touched, b"v1")?;
    fs::write(&doomed, b"bye")?;
    vigil::write_snapshot(dir.path(), &snapshot, &brute_force())?;

    let_mtime_advance();
    fs::write(&touched, b"v2")?;
    fs::remove_file(&doomed)?;
    let fresh = dir.path().join("fresh.txt");
    fs::write(&fresh, b"new")?;

    let events = vigil::get_events_since(dir.path(), &snapshot, &brute_force())?;
    assert_eq!(events.len(), 3);
    assert_eq!(event_for(&events, &touched).event_type(), EventType::Update);
    assert_eq!(event_for(&events, &doomed).event_type(), EventType::Delete);
    assert_eq!(event_for(&events, &fresh).event_type(), EventType::Create);
    assert!(!events.iter().any(|event| event.path == kept));
    Ok(())
}
