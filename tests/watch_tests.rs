//! Live subscription scenarios against the inotify backend.
#![cfg(target_os = "linux")]

use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread::sleep;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use vigil::{BackendKind, Callback, Error, Event, EventType, Kind, Options};

fn inotify() -> Options {
    Options {
        backend: BackendKind::Inotify,
        ..Options::default()
    }
}

/// Collects every delivered batch for later assertions.
#[derive(Default)]
struct Recorder {
    batches: Mutex<Vec<Result<Vec<Event>, Error>>>,
}

impl Recorder {
    fn callback(self: &Arc<Self>) -> Callback {
        let recorder = Arc::clone(self);
        Arc::new(move |batch| {
            recorder.batches.lock().unwrap().push(batch);
        })
    }

    fn batch_count(&self) -> usize {
        self.batches.lock().unwrap().len()
    }

    fn events(&self) -> Vec<Event> {
        self.batches
            .lock()
            .unwrap()
            .iter()
            .filter_map(|batch| batch.as_ref().ok())
            .flatten()
            .cloned()
            .collect()
    }

    /// Poll until at least `want` events have been delivered. The debouncer
    /// holds batches for 500 ms, so this waits well past one window.
    fn wait_for_events(&self, want: usize, timeout_ms: u64) -> Vec<Event> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            let events = self.events();
            if events.len() >= want {
                return events;
            }
            if Instant::now() >= deadline {
                panic!(
                    "timed out waiting for {want} events; got {}: {events:?}",
                    events.len()
                );
            }
            sleep(Duration::from_millis(50));
        }
    }
}

fn event_for<'a>(events: &'a [Event], path: &Path) -> &'a Event {
    events
        .iter()
        .find(|event| event.path == path)
        .unwrap_or_else(|| panic!("no event for {}", path.display()))
}

#[test]
fn test_create_file_event() {
    let dir = TempDir::new().unwrap();
    let recorder = Arc::new(Recorder::default());
    let callback = recorder.callback();
    vigil::subscribe(dir.path(), &callback, &inotify()).unwrap();
    sleep(Duration::from_millis(100));

    let target = dir.path().join("a.txt");
    fs::write(&target, b"hello").unwrap();

    let events = recorder.wait_for_events(1, 3000);
    let event = event_for(&events, &target);
    assert_eq!(event.event_type(), EventType::Create);
    assert_eq!(event.kind, Kind::File);

    vigil::unsubscribe(dir.path(), &callback, &inotify()).unwrap();
}

#[test]
fn test_ignored_glob_produces_no_event() {
    let dir = TempDir::new().unwrap();
    let options = Options {
        backend: BackendKind::Inotify,
        ignore_globs: vec![r"^.*\.tmp$".to_string()],
        ..Options::default()
    };

    let recorder = Arc::new(Recorder::default());
    let callback = recorder.callback();
    vigil::subscribe(dir.path(), &callback, &options).unwrap();
    sleep(Duration::from_millis(100));

    fs::write(dir.path().join("x.tmp"), b"scratch").unwrap();
    fs::write(dir.path().join("x.txt"), b"real").unwrap();

    let events = recorder.wait_for_events(1, 3000);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].path, dir.path().join("x.txt"));

    vigil::unsubscribe(dir.path(), &callback, &options).unwrap();
}

#[test]
fn test_rapid_delete_and_recreate_is_an_update() {
    let dir = TempDir::new().unwrap();
    let target = dir.path().join("a.txt");
    fs::write(&target, b"original").unwrap();

    let recorder = Arc::new(Recorder::default());
    let callback = recorder.callback();
    vigil::subscribe(dir.path(), &callback, &inotify()).unwrap();
    sleep(Duration::from_millis(100));

    fs::remove_file(&target).unwrap();
    sleep(Duration::from_millis(50));
    fs::write(&target, b"recreated").unwrap();

    let events = recorder.wait_for_events(1, 3000);
    assert_eq!(events.len(), 1);
    assert_eq!(event_for(&events, &target).event_type(), EventType::Update);

    vigil::unsubscribe(dir.path(), &callback, &inotify()).unwrap();
}

#[test]
fn test_recursive_delete_reports_every_entry() {
    let dir = TempDir::new().unwrap();
    let sub = dir.path().join("a");
    fs::create_dir(&sub).unwrap();
    fs::write(sub.join("b.txt"), b"x").unwrap();

    let recorder = Arc::new(Recorder::default());
    let callback = recorder.callback();
    vigil::subscribe(dir.path(), &callback, &inotify()).unwrap();
    sleep(Duration::from_millis(100));

    fs::remove_dir_all(&sub).unwrap();

    let events = recorder.wait_for_events(2, 3000);
    assert_eq!(event_for(&events, &sub).event_type(), EventType::Delete);
    assert_eq!(
        event_for(&events, &sub.join("b.txt")).event_type(),
        EventType::Delete
    );

    vigil::unsubscribe(dir.path(), &callback, &inotify()).unwrap();
}

#[test]
fn test_new_directories_are_watched() {
    let dir = TempDir::new().unwrap();
    let recorder = Arc::new(Recorder::default());
    let callback = recorder.callback();
    vigil::subscribe(dir.path(), &callback, &inotify()).unwrap();
    sleep(Duration::from_millis(100));

    let sub = dir.path().join("fresh");
    fs::create_dir(&sub).unwrap();
    // Give the backend a moment to install the new watch.
    sleep(Duration::from_millis(300));
    fs::write(sub.join("inner.txt"), b"x").unwrap();

    let events = recorder.wait_for_events(2, 4000);
    assert_eq!(event_for(&events, &sub).event_type(), EventType::Create);
    assert_eq!(event_for(&events, &sub).kind, Kind::Directory);
    assert_eq!(
        event_for(&events, &sub.join("inner.txt")).event_type(),
        EventType::Create
    );

    vigil::unsubscribe(dir.path(), &callback, &inotify()).unwrap();
}

#[test]
fn test_burst_is_delivered_as_one_batch() {
    let dir = TempDir::new().unwrap();
    let recorder = Arc::new(Recorder::default());
    let callback = recorder.callback();
    vigil::subscribe(dir.path(), &callback, &inotify()).unwrap();
    sleep(Duration::from_millis(100));

    for index in 0..5 {
        fs::write(dir.path().join(format!("file-{index}.txt")), b"x").unwrap();
    }

    let events = recorder.wait_for_events(5, 3000);
    assert_eq!(events.len(), 5);
    assert_eq!(recorder.batch_count(), 1);

    vigil::unsubscribe(dir.path(), &callback, &inotify()).unwrap();
}

#[test]
fn test_subscribe_is_idempotent_per_callback() {
    let dir = TempDir::new().unwrap();
    let recorder = Arc::new(Recorder::default());
    let callback = recorder.callback();
    vigil::subscribe(dir.path(), &callback, &inotify()).unwrap();
    vigil::subscribe(dir.path(), &callback, &inotify()).unwrap();
    sleep(Duration::from_millis(100));

    fs::write(dir.path().join("once.txt"), b"x").unwrap();
    recorder.wait_for_events(1, 3000);
    // Registered once, delivered once.
    assert_eq!(recorder.batch_count(), 1);

    vigil::unsubscribe(dir.path(), &callback, &inotify()).unwrap();
    // A second unsubscribe is a no-op.
    vigil::unsubscribe(dir.path(), &callback, &inotify()).unwrap();
}

#[test]
fn test_unsubscribe_stops_delivery() {
    let dir = TempDir::new().unwrap();
    let recorder = Arc::new(Recorder::default());
    let callback = recorder.callback();
    vigil::subscribe(dir.path(), &callback, &inotify()).unwrap();
    sleep(Duration::from_millis(100));

    fs::write(dir.path().join("seen.txt"), b"x").unwrap();
    recorder.wait_for_events(1, 3000);

    vigil::unsubscribe(dir.path(), &callback, &inotify()).unwrap();
    let batches_before = recorder.batch_count();

    fs::write(dir.path().join("unseen.txt"), b"x").unwrap();
    sleep(Duration::from_millis(900));
    assert_eq!(recorder.batch_count(), batches_before);
}

#[test]
fn test_two_callbacks_share_one_watcher() {
    let dir = TempDir::new().unwrap();
    let first = Arc::new(Recorder::default());
    let second = Arc::new(Recorder::default());
    let first_cb = first.callback();
    let second_cb = second.callback();

    vigil::subscribe(dir.path(), &first_cb, &inotify()).unwrap();
    vigil::subscribe(dir.path(), &second_cb, &inotify()).unwrap();
    sleep(Duration::from_millis(100));

    let target = dir.path().join("shared.txt");
    fs::write(&target, b"x").unwrap();

    first.wait_for_events(1, 3000);
    second.wait_for_events(1, 3000);

    vigil::unsubscribe(dir.path(), &first_cb, &inotify()).unwrap();
    vigil::unsubscribe(dir.path(), &second_cb, &inotify()).unwrap();
}
