//! Shared timer that batches change notifications.
//!
//! Raw OS events for one logical user action (a save, a refactor, a branch
//! switch) arrive in bursts over tens of milliseconds. The debouncer bounds
//! callback fan-out: the first trigger arms a 500 ms window, further
//! triggers inside the window are absorbed, and on expiry every registered
//! callback fires once, in registration order, on the debouncer's own
//! thread. Callbacks must not block; they may queue work elsewhere.

use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crate::signal::{Signal, WaitResult};

/// Width of the batching window. Fixed; not configurable.
const DEBOUNCE_WINDOW: Duration = Duration::from_millis(500);

/// How long the idle loop parks before re-checking whether the process still
/// holds a live reference to the shared instance.
const IDLE_POLL: Duration = Duration::from_millis(500);

struct Registration {
    id: u64,
    callback: Arc<dyn Fn() + Send + Sync>,
}

struct Inner {
    triggered: bool,
    callbacks: Vec<Registration>,
}

/// Single-threaded trailing batcher. One instance is shared process-wide
/// through a weak registry; its thread exits on its own once the last
/// strong reference is gone.
pub(crate) struct Debouncer {
    inner: Mutex<Inner>,
    wait_signal: Signal,
}

impl Debouncer {
    /// Fetch the process-wide instance, creating it (and its thread) if no
    /// live reference exists.
    pub fn get_shared() -> Arc<Debouncer> {
        static SHARED: OnceLock<Mutex<Weak<Debouncer>>> = OnceLock::new();
        let registry = SHARED.get_or_init(Default::default);

        let mut slot = registry.lock().unwrap();
        if let Some(debouncer) = slot.upgrade() {
            return debouncer;
        }
        let debouncer = Debouncer::create();
        *slot = Arc::downgrade(&debouncer);
        debouncer
    }

    fn create() -> Arc<Debouncer> {
        let debouncer = Arc::new(Debouncer {
            inner: Mutex::new(Inner {
                triggered: false,
                callbacks: Vec::new(),
            }),
            wait_signal: Signal::new(),
        });

        let weak = Arc::downgrade(&debouncer);
        thread::Builder::new()
            .name("vigil-debounce".to_string())
            .spawn(move || run(weak))
            .expect("failed to spawn debounce thread");

        debouncer
    }

    /// Register a callback. Callbacks fire in registration order.
    pub fn add(&self, id: u64, callback: Arc<dyn Fn() + Send + Sync>) {
        let mut inner = self.inner.lock().unwrap();
        inner.callbacks.push(Registration { id, callback });
    }

    /// Drop the callback registered under `id`. A no-op for unknown ids.
    pub fn remove(&self, id: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.callbacks.retain(|registration| registration.id != id);
    }

    /// Arm (or feed) the current window. Idempotent within a window.
    pub fn trigger(&self) {
        self.inner.lock().unwrap().triggered = true;
        self.wait_signal.notify();
    }

    fn is_triggered(&self) -> bool {
        self.inner.lock().unwrap().triggered
    }

    /// Park until the window deadline, absorbing trigger wakeups.
    fn sleep_window(&self) {
        let deadline = Instant::now() + DEBOUNCE_WINDOW;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            self.wait_signal.wait_for(deadline - now);
            self.wait_signal.reset();
        }
    }

    /// Invoke every registered callback once. The trigger flag is consumed
    /// first so that events arriving mid-delivery arm the next window.
    fn fire(&self) {
        let callbacks: Vec<Arc<dyn Fn() + Send + Sync>> = {
            let mut inner = self.inner.lock().unwrap();
            inner.triggered = false;
            inner
                .callbacks
                .iter()
                .map(|registration| Arc::clone(&registration.callback))
                .collect()
        };
        for callback in callbacks {
            callback();
        }
    }
}

fn run(weak: Weak<Debouncer>) {
    loop {
        // Re-acquire each cycle; when the last watcher lets go of the shared
        // instance the upgrade fails and the thread winds down.
        let Some(debouncer) = weak.upgrade() else {
            tracing::debug!("debounce thread exiting");
            break;
        };

        if !debouncer.is_triggered() {
            let waited = debouncer.wait_signal.wait_for(IDLE_POLL);
            debouncer.wait_signal.reset();
            if waited == WaitResult::Timeout {
                continue;
            }
        }

        debouncer.sleep_window();
        debouncer.fire();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_callback(counter: &Arc<AtomicUsize>) -> Arc<dyn Fn() + Send + Sync> {
        let counter = Arc::clone(counter);
        Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_burst_fires_once() {
        let debouncer = Debouncer::create();
        let counter = Arc::new(AtomicUsize::new(0));
        debouncer.add(1, counting_callback(&counter));

        debouncer.trigger();
        thread::sleep(Duration::from_millis(100));
        debouncer.trigger();
        thread::sleep(Duration::from_millis(900));

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_separate_windows_fire_separately() {
        let debouncer = Debouncer::create();
        let counter = Arc::new(AtomicUsize::new(0));
        debouncer.add(1, counting_callback(&counter));

        debouncer.trigger();
        thread::sleep(Duration::from_millis(800));
        debouncer.trigger();
        thread::sleep(Duration::from_millis(800));

        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_callbacks_fire_in_registration_order() {
        let debouncer = Debouncer::create();
        let order = Arc::new(Mutex::new(Vec::new()));
        for id in 0..3u64 {
            let order = Arc::clone(&order);
            debouncer.add(
                id,
                Arc::new(move || {
                    order.lock().unwrap().push(id);
                }),
            );
        }

        debouncer.trigger();
        thread::sleep(Duration::from_millis(800));

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_removed_callback_does_not_fire() {
        let debouncer = Debouncer::create();
        let counter = Arc::new(AtomicUsize::new(0));
        debouncer.add(1, counting_callback(&counter));
        debouncer.remove(1);

        debouncer.trigger();
        thread::sleep(Duration::from_millis(800));

        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
