// The timer contract: consumed by the task engine to delay resumption, and
// by `dispatch` to implement `enqueue_delayed`. Only the contract is in
// scope for embedding against a real reactor; `MainLoopTimer` is a working
// standalone implementation so the crate is runnable without one.

use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

/// A one-shot, restartable delay. The callback returns `true` to be
/// rescheduled for another `interval`, `false` to stop.
///
/// `Sync` as well as `Send`: a task's `Timer` lives inside its `Shared`
/// state, which is stored behind `Arc<dyn Any + Send + Sync>` in the policy
/// registry (`PassLast` hands a whole `Task` to the next caller).
pub trait Timer: Send + Sync {
    fn start(&self, interval: Duration, callback: Box<dyn FnMut() -> bool + Send>);
    fn stop(&self);
    fn is_active(&self) -> bool;
}

struct Inner {
    generation: u64,
    active: bool,
}

/// A timer backed by a dedicated condvar-driven thread, started lazily on
/// first use and torn down when stopped.
///
/// This is the concrete default the crate ships so that `spawn_task` and
/// `dispatch::enqueue_delayed` work out of the box; an embedder with a real
/// event-loop reactor should implement [`Timer`] against it instead.
pub struct MainLoopTimer {
    inner: Arc<Mutex<Inner>>,
    condvar: Arc<Condvar>,
}

impl MainLoopTimer {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                generation: 0,
                active: false,
            })),
            condvar: Arc::new(Condvar::new()),
        }
    }
}

impl Default for MainLoopTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl Timer for MainLoopTimer {
    fn start(&self, interval: Duration, mut callback: Box<dyn FnMut() -> bool + Send>) {
        let generation = {
            let mut guard = self.inner.lock().unwrap();
            guard.generation += 1;
            guard.active = true;
            guard.generation
        };

        let inner = Arc::clone(&self.inner);
        let condvar = Arc::clone(&self.condvar);
        thread::spawn(move || {
            // Whatever happens to the loop below (return, or the callback
            // panicking), a timer that stops running must be marked
            // inactive so `is_active()` doesn't lie to a caller deciding
            // whether to restart it.
            let inner = scopeguard::guard(inner, |inner| {
                let mut guard = inner.lock().unwrap();
                if guard.generation == generation {
                    guard.active = false;
                }
                condvar.notify_all();
            });

            loop {
                if interval > Duration::ZERO {
                    thread::sleep(interval);
                }
                {
                    let guard = inner.lock().unwrap();
                    if guard.generation != generation || !guard.active {
                        return;
                    }
                }
                if !callback() {
                    return;
                }
            }
        });
    }

    fn stop(&self) {
        let mut guard = self.inner.lock().unwrap();
        guard.generation += 1;
        guard.active = false;
        self.condvar.notify_all();
    }

    fn is_active(&self) -> bool {
        self.inner.lock().unwrap().active
    }
}
