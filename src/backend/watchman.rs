//! Watchman backend: delegate watching to the external daemon.
//!
//! One persistent socket, one reader thread. Requests are serialized: a
//! caller takes the request lock, writes a PDU, and parks on the response
//! signal; the reader thread routes subscription pushes to their watcher
//! and everything else back to the parked caller. PDUs are JSON values,
//! one per line in each direction.

use std::collections::HashMap;
use std::env;
use std::io::{BufRead, BufReader, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};

use crate::backend::{Backend, BackendCore, BackendKind};
use crate::error::{Error, Result};
use crate::event::{Kind, FAKE_FILEID, FAKE_INO};
use crate::signal::Signal;
use crate::watcher::Watcher;

/// Subscription name registered with the daemon; one per watched root.
const SUBSCRIPTION_NAME: &str = "vigil";

pub(crate) struct WatchmanBackend {
    core: BackendCore,
    sock: Mutex<Option<UnixStream>>,
    subscriptions: Mutex<HashMap<PathBuf, Arc<Watcher>>>,
    request_signal: Signal,
    response_signal: Signal,
    response: Mutex<Option<Value>>,
    /// Serializes request/response pairs across caller threads.
    request_lock: Mutex<()>,
}

impl WatchmanBackend {
    pub fn new() -> Self {
        Self {
            core: BackendCore::new(BackendKind::Watchman),
            sock: Mutex::new(None),
            subscriptions: Mutex::new(HashMap::new()),
            request_signal: Signal::new(),
            response_signal: Signal::new(),
            response: Mutex::new(None),
            request_lock: Mutex::new(()),
        }
    }

    /// Whether a daemon is reachable. Used by default-backend selection.
    pub fn available() -> bool {
        Self::sock_path()
            .and_then(|path| {
                UnixStream::connect(&path).map_err(|err| Error::io(&path, err))
            })
            .is_ok()
    }

    /// Socket path from `WATCHMAN_SOCK`, else by asking the watchman binary.
    fn sock_path() -> Result<PathBuf> {
        if let Ok(path) = env::var("WATCHMAN_SOCK") {
            if !path.is_empty() {
                return Ok(PathBuf::from(path));
            }
        }

        let output = Command::new("watchman")
            .args(["--output-encoding=json", "get-sockname"])
            .output()
            .map_err(|err| Error::backend(format!("failed to execute watchman: {err}")))?;
        if !output.status.success() {
            return Err(Error::backend("watchman get-sockname failed"));
        }
        let value: Value = serde_json::from_slice(&output.stdout)
            .map_err(|err| Error::backend(format!("bad get-sockname response: {err}")))?;
        value["sockname"]
            .as_str()
            .map(PathBuf::from)
            .ok_or_else(|| Error::backend("get-sockname response carries no sockname"))
    }

    fn connect() -> Result<UnixStream> {
        let path = Self::sock_path()?;
        UnixStream::connect(&path)
            .map_err(|err| Error::backend(format!("error connecting to watchman: {err}")))
    }

    /// Send one command and park until the reader routes its response back.
    fn request(&self, command: Value) -> Result<Value> {
        let _guard = self.request_lock.lock().unwrap();
        self.response_signal.reset();

        {
            let mut sock = self.sock.lock().unwrap();
            let sock = sock
                .as_mut()
                .ok_or_else(|| Error::backend("watchman socket is not connected"))?;
            let mut payload = serde_json::to_vec(&command)
                .map_err(|err| Error::backend(format!("failed to encode request: {err}")))?;
            payload.push(b'\n');
            sock.write_all(&payload)
                .map_err(|err| Error::backend(format!("watchman write error: {err}")))?;
        }

        self.request_signal.notify();
        self.response_signal.wait();
        self.response_signal.reset();

        let response = self
            .response
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| Error::backend("watchman connection closed"))?;
        if let Some(error) = response.get("error") {
            return Err(Error::backend(
                error.as_str().unwrap_or("unknown watchman error"),
            ));
        }
        Ok(response)
    }

    fn watch(&self, dir: &Path) -> Result<()> {
        self.request(json!(["watch", dir.to_string_lossy()]))?;
        Ok(())
    }

    fn clock(&self, dir: &Path) -> Result<String> {
        let response = self.request(json!(["clock", dir.to_string_lossy()]))?;
        response["clock"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| Error::backend("error reading clock from watchman"))
    }

    fn handle_subscription(&self, value: &Value) {
        let Some(root) = value["root"].as_str() else {
            return;
        };
        let watcher = {
            let subscriptions = self.subscriptions.lock().unwrap();
            subscriptions.get(Path::new(root)).cloned()
        };
        let Some(watcher) = watcher else { return };
        handle_files(&watcher, value);
        watcher.notify();
    }

    fn fail_all(&self, message: &str) {
        for watcher in self.core.watchers() {
            watcher.notify_error(Error::backend(message));
        }
    }
}

impl Backend for WatchmanBackend {
    fn core(&self) -> &BackendCore {
        &self.core
    }

    fn run(self: Arc<Self>) {
        let stream = match Self::connect() {
            Ok(stream) => stream,
            Err(error) => {
                self.core.fail_start(error);
                return;
            }
        };
        let reader_stream = match stream.try_clone() {
            Ok(clone) => clone,
            Err(err) => {
                self.core
                    .fail_start(Error::backend(format!("failed to clone socket: {err}")));
                return;
            }
        };
        *self.sock.lock().unwrap() = Some(stream);
        self.core.notify_started();

        let mut reader = BufReader::new(reader_stream);
        let mut failure = None;
        loop {
            if !self.core.is_running() {
                break;
            }
            // With nothing subscribed and no request in flight there is
            // nothing to read; park until a requester wakes us.
            if self.subscriptions.lock().unwrap().is_empty() {
                self.request_signal.wait();
                self.request_signal.reset();
                if !self.core.is_running() {
                    break;
                }
            }

            let mut line = String::new();
            match reader.read_line(&mut line) {
                Ok(0) => {
                    if self.core.is_running() {
                        failure = Some("watchman closed the connection".to_string());
                    }
                    break;
                }
                Ok(_) => {}
                Err(err) => {
                    if self.core.is_running() {
                        failure = Some(format!("watchman read error: {err}"));
                    }
                    break;
                }
            }

            let value: Value = match serde_json::from_str(line.trim()) {
                Ok(value) => value,
                Err(err) => {
                    tracing::warn!(%err, "discarding malformed watchman message");
                    continue;
                }
            };

            if value.get("subscription").is_some() {
                self.handle_subscription(&value);
            } else {
                *self.response.lock().unwrap() = Some(value);
                self.response_signal.notify();
            }
        }

        // Release any requester parked on a response before touching the
        // subscription set; a parked subscribe holds its lock.
        self.response_signal.notify();
        if let Some(message) = failure {
            tracing::warn!(%message, "watchman connection failed");
            self.fail_all(&message);
        }
        self.core.ended.notify();
    }

    fn wake(&self) {
        if let Some(sock) = self.sock.lock().unwrap().as_ref() {
            let _ = sock.shutdown(Shutdown::Both);
        }
        self.request_signal.notify();
    }

    fn subscribe(&self, watcher: &Arc<Watcher>) -> Result<()> {
        let dir = watcher.dir().to_path_buf();
        self.subscriptions
            .lock()
            .unwrap()
            .insert(dir.clone(), Arc::clone(watcher));

        let result: Result<()> = (|| {
            self.watch(&dir)?;
            let clock = self.clock(&dir)?;

            let mut opts = json!({
                "fields": ["name", "exists", "new"],
                "since": clock,
            });
            let ignored: Vec<Value> = watcher
                .ignore_paths()
                .iter()
                .filter_map(|path| path.strip_prefix(&dir).ok())
                .map(|rel| json!(["dirname", rel.to_string_lossy()]))
                .collect();
            if !ignored.is_empty() {
                let mut anyof = vec![Value::from("anyof")];
                anyof.extend(ignored);
                opts["expression"] = json!(["not", anyof]);
            }

            self.request(json!([
                "subscribe",
                dir.to_string_lossy(),
                SUBSCRIPTION_NAME,
                opts
            ]))?;
            Ok(())
        })();

        if result.is_err() {
            self.subscriptions.lock().unwrap().remove(&dir);
        }
        result
    }

    fn unsubscribe(&self, watcher: &Arc<Watcher>) -> Result<()> {
        let dir = watcher.dir().to_path_buf();
        self.subscriptions.lock().unwrap().remove(&dir);
        self.request(json!([
            "unsubscribe",
            dir.to_string_lossy(),
            SUBSCRIPTION_NAME
        ]))?;
        Ok(())
    }

    fn write_snapshot(&self, watcher: &Arc<Watcher>, snapshot_path: &Path) -> Result<()> {
        self.watch(watcher.dir())?;
        let clock = self.clock(watcher.dir())?;
        std::fs::write(snapshot_path, clock).map_err(|err| Error::io(snapshot_path, err))
    }

    fn get_events_since(&self, watcher: &Arc<Watcher>, snapshot_path: &Path) -> Result<()> {
        let clock = std::fs::read_to_string(snapshot_path)
            .map_err(|err| Error::io(snapshot_path, err))?;
        let response = self.request(json!([
            "since",
            watcher.dir().to_string_lossy(),
            clock.trim()
        ]))?;
        handle_files(watcher, &response);
        Ok(())
    }
}

/// Translate a `files` array into coalesced events. Names arrive relative
/// to the watched root and are absolutized against the watcher dir.
fn handle_files(watcher: &Arc<Watcher>, value: &Value) {
    let Some(files) = value["files"].as_array() else {
        tracing::warn!("watchman response carries no files array");
        return;
    };

    for file in files {
        let Some(name) = file["name"].as_str() else {
            continue;
        };
        let path = watcher.dir().join(name);
        if watcher.is_ignored(&path) {
            continue;
        }
        let is_new = file["new"].as_bool().unwrap_or(false);
        let exists = file["exists"].as_bool().unwrap_or(false);

        if is_new && exists {
            watcher.events.create(&path, Kind::Unknown, FAKE_INO, FAKE_FILEID);
        } else if exists {
            watcher.events.update(&path, Kind::Unknown, FAKE_INO, FAKE_FILEID);
        } else if !is_new {
            watcher.events.remove(&path, Kind::Unknown, FAKE_INO, FAKE_FILEID);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn test_handle_files_classification() {
        let dir = PathBuf::from("/watchman-test/root");
        let watcher = Watcher::get_shared(&dir, &BTreeSet::new(), &[]);

        let value = json!({
            "files": [
                { "name": "fresh.txt", "new": true, "exists": true },
                { "name": "touched.txt", "new": false, "exists": true },
                { "name": "gone.txt", "new": false, "exists": false },
            ]
        });
        handle_files(&watcher, &value);

        let events = watcher.events.take();
        assert_eq!(events.len(), 3);
        let type_of = |name: &str| {
            events
                .iter()
                .find(|event| event.path == dir.join(name))
                .unwrap()
                .event_type()
        };
        assert_eq!(type_of("fresh.txt").as_str(), "create");
        assert_eq!(type_of("touched.txt").as_str(), "update");
        assert_eq!(type_of("gone.txt").as_str(), "delete");

        Watcher::release(&watcher);
    }

    #[test]
    fn test_handle_files_respects_ignores() {
        let dir = PathBuf::from("/watchman-test/ignored");
        let globs = vec![crate::glob::Glob::new(r".*\.tmp").unwrap()];
        let watcher = Watcher::get_shared(&dir, &BTreeSet::new(), &globs);

        let value = json!({
            "files": [
                { "name": "scratch.tmp", "new": true, "exists": true },
                { "name": "kept.txt", "new": true, "exists": true },
            ]
        });
        handle_files(&watcher, &value);

        let events = watcher.events.take();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].path, dir.join("kept.txt"));

        Watcher::release(&watcher);
    }
}
