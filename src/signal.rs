//! One-shot / repeatable thread rendezvous.
//!
//! Used for the backend startup handshake, pairing synchronous requests with
//! responses on the watchman socket, and shutdown barriers. A signal carries
//! an "armed" flag so that a `notify` which races ahead of the corresponding
//! `wait` is not lost; the flag persists until `reset`.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Outcome of a bounded [`Signal::wait_for`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    /// The signal was notified before the timeout elapsed.
    Notified,
    /// The timeout elapsed without a notification.
    Timeout,
}

/// A rendezvous point between threads. Any number of threads may wait.
#[derive(Debug, Default)]
pub struct Signal {
    notified: Mutex<bool>,
    cond: Condvar,
}

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until notified. Returns immediately if the signal is armed.
    pub fn wait(&self) {
        let mut notified = self.notified.lock().unwrap();
        while !*notified {
            notified = self.cond.wait(notified).unwrap();
        }
    }

    /// Block until notified or until `timeout` elapses.
    pub fn wait_for(&self, timeout: Duration) -> WaitResult {
        let deadline = Instant::now() + timeout;
        let mut notified = self.notified.lock().unwrap();
        while !*notified {
            let now = Instant::now();
            if now >= deadline {
                return WaitResult::Timeout;
            }
            let (guard, _) = self.cond.wait_timeout(notified, deadline - now).unwrap();
            notified = guard;
        }
        WaitResult::Notified
    }

    /// Wake all waiters. The signal stays armed until [`Signal::reset`].
    pub fn notify(&self) {
        let mut notified = self.notified.lock().unwrap();
        *notified = true;
        self.cond.notify_all();
    }

    /// Clear the armed state.
    pub fn reset(&self) {
        let mut notified = self.notified.lock().unwrap();
        *notified = false;
    }
}
