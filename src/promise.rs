// The `InProgress` promise: the only async vocabulary the rest of the crate
// uses. Tasks, worker results, timeouts, and cross-thread calls all surface
// as an `InProgress<T, E>`.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::dispatch;
use crate::error::Error;
use crate::timer::{MainLoopTimer, Timer};

type ValueObserver<T> = Box<dyn FnOnce(T) + Send>;

enum Outcome<T, E> {
    Finished(T),
    Failed(E),
}

struct Pending<T, E> {
    value_observers: Vec<ValueObserver<T>>,
    error_observers: Vec<ValueObserver<E>>,
}

enum State<T, E> {
    Pending(Pending<T, E>),
    Settled {
        outcome: Outcome<T, E>,
        /// Cleared the first time an error observer sees a `Failed` outcome.
        unhandled: bool,
    },
}

struct Inner<T, E> {
    state: Mutex<State<T, E>>,
    condvar: Condvar,
}

/// A single-assignment cell carrying a value or an error, with observers,
/// blocking wait, and timeout support.
///
/// Source term: `InProgress`. See spec §3/§4.1.
pub struct InProgress<T, E = Error> {
    inner: Arc<Inner<T, E>>,
}

impl<T, E> Clone for InProgress<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, E> fmt::Debug for InProgress<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let settled = matches!(&*self.inner.state.lock().unwrap(), State::Settled { .. });
        f.debug_struct("InProgress")
            .field("finished", &settled)
            .finish()
    }
}

/// Opaque handle returned by `observe_*`.
///
/// Removing an in-flight observer is a niche operation that the system this
/// runtime is modeled on rarely exercises; `dispose()` is a deliberate no-op
/// today so call sites can be written against the final API shape.
pub struct Disposer {
    _private: (),
}

impl Disposer {
    pub fn dispose(self) {}
}

impl<T, E> InProgress<T, E> {
    /// Creates a new, pending promise.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::Pending(Pending {
                    value_observers: Vec::new(),
                    error_observers: Vec::new(),
                })),
                condvar: Condvar::new(),
            }),
        }
    }

    /// Creates an already-`Finished` promise.
    pub fn finished(value: T) -> Self {
        let p = Self::new();
        p.finish(value)
            .expect("freshly created promise cannot already be settled");
        p
    }

    /// Creates an already-`Failed` promise.
    pub fn failed(error: E) -> Self {
        let p = Self::new();
        p.fail(error)
            .expect("freshly created promise cannot already be settled");
        p
    }

    /// True once the promise has reached a terminal state.
    pub fn is_finished(&self) -> bool {
        matches!(&*self.inner.state.lock().unwrap(), State::Settled { .. })
    }

    /// Transitions `Pending -> Finished(value)`. Fails with `AlreadySet` if
    /// already terminal.
    pub fn finish(&self, value: T) -> Result<(), Error> {
        let pending = {
            let mut guard = self.inner.state.lock().unwrap();
            if matches!(&*guard, State::Settled { .. }) {
                return Err(Error::AlreadySet);
            }
            let old = std::mem::replace(
                &mut *guard,
                State::Settled {
                    outcome: Outcome::Finished(value),
                    unhandled: false,
                },
            );
            self.inner.condvar.notify_all();
            match old {
                State::Pending(p) => p,
                State::Settled { .. } => unreachable!(),
            }
        };
        for observer in pending.value_observers {
            run_observer(observer, clone_value(self));
        }
        Ok(())
    }

    /// Transitions `Pending -> Failed(error)`. Fails with `AlreadySet` if
    /// already terminal. The failure starts out "unhandled"; registering an
    /// error observer (before or after the transition) clears that flag.
    pub fn fail(&self, error: E) -> Result<(), Error> {
        let pending = {
            let mut guard = self.inner.state.lock().unwrap();
            if matches!(&*guard, State::Settled { .. }) {
                return Err(Error::AlreadySet);
            }
            let old = std::mem::replace(
                &mut *guard,
                State::Settled {
                    outcome: Outcome::Failed(error),
                    unhandled: true,
                },
            );
            self.inner.condvar.notify_all();
            match old {
                State::Pending(p) => p,
                State::Settled { .. } => unreachable!(),
            }
        };
        let has_error_observers = !pending.error_observers.is_empty();
        if has_error_observers {
            let mut guard = self.inner.state.lock().unwrap();
            if let State::Settled { unhandled, .. } = &mut *guard {
                *unhandled = false;
            }
        }
        for observer in pending.error_observers {
            run_observer(observer, clone_error(self));
        }
        Ok(())
    }

    /// Registers a callback for the `Finished` channel. Fires synchronously
    /// with the stored value if already terminal.
    pub fn observe_value<F>(&self, cb: F) -> Disposer
    where
        F: FnOnce(T) + Send + 'static,
        T: Send + 'static,
    {
        let mut guard = self.inner.state.lock().unwrap();
        match &mut *guard {
            State::Pending(p) => {
                p.value_observers.push(Box::new(cb));
            }
            State::Settled { .. } => {
                drop(guard);
                if let Some(v) = clone_value(self) {
                    run_observer(Box::new(cb), Some(v));
                }
            }
        }
        Disposer { _private: () }
    }

    /// Registers a callback for the `Failed` channel. Fires synchronously
    /// with the stored error if already terminal, and marks the failure as
    /// handled.
    pub fn observe_error<F>(&self, cb: F) -> Disposer
    where
        F: FnOnce(E) + Send + 'static,
        E: Send + 'static,
    {
        let mut guard = self.inner.state.lock().unwrap();
        match &mut *guard {
            State::Pending(p) => {
                p.error_observers.push(Box::new(cb));
            }
            State::Settled { unhandled, .. } => {
                *unhandled = false;
                drop(guard);
                if let Some(e) = clone_error(self) {
                    run_observer(Box::new(cb), Some(e));
                }
            }
        }
        Disposer { _private: () }
    }

    /// Registers a callback invoked on either outcome.
    pub fn observe_both<FV, FE>(&self, on_value: FV, on_error: FE) -> Disposer
    where
        FV: FnOnce(T) + Send + 'static,
        FE: FnOnce(E) + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        self.observe_value(on_value).dispose();
        self.observe_error(on_error)
    }

    /// Blocks the calling thread until the promise is terminal, or until
    /// `timeout` elapses (returning `Err(NotReady)` on expiry).
    ///
    /// The main thread is the only thread that can ever drain the wake queue
    /// a worker-thread callback settles this promise through; if it's still
    /// pending, blocking the main thread here would deadlock forever, so
    /// this returns `Err(Deadlock)` immediately instead of parking.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<(), Error> {
        if dispatch::is_main_thread() {
            let settled = matches!(&*self.inner.state.lock().unwrap(), State::Settled { .. });
            if !settled {
                return Err(Error::Deadlock);
            }
        }
        let mut guard = self.inner.state.lock().unwrap();
        loop {
            if matches!(&*guard, State::Settled { .. }) {
                return Ok(());
            }
            match timeout {
                None => {
                    guard = self.inner.condvar.wait(guard).unwrap();
                }
                Some(d) => {
                    let (g, result) = self.inner.condvar.wait_timeout(guard, d).unwrap();
                    guard = g;
                    if result.timed_out() && !matches!(&*guard, State::Settled { .. }) {
                        return Err(Error::NotReady);
                    }
                }
            }
        }
    }

    /// Reads the stored value. `Err(NotReady)` while pending; `Ok(None)` if
    /// terminal but failed.
    pub fn result(&self) -> Result<Option<T>, Error>
    where
        T: Clone,
    {
        match &*self.inner.state.lock().unwrap() {
            State::Pending(_) => Err(Error::NotReady),
            State::Settled { outcome, .. } => Ok(match outcome {
                Outcome::Finished(v) => Some(v.clone()),
                Outcome::Failed(_) => None,
            }),
        }
    }

    /// Reads the stored error, analogous to [`InProgress::result`].
    pub fn error(&self) -> Result<Option<E>, Error>
    where
        E: Clone,
    {
        match &*self.inner.state.lock().unwrap() {
            State::Pending(_) => Err(Error::NotReady),
            State::Settled { outcome, .. } => Ok(match outcome {
                Outcome::Finished(_) => None,
                Outcome::Failed(e) => Some(e.clone()),
            }),
        }
    }

    /// Returns a new promise that mirrors this one, except that it settles
    /// early with `on_timeout()`'s result if `self` hasn't settled within
    /// `duration`. `self` itself is never mutated by a timeout firing — it
    /// may go on to settle normally afterwards, its outcome simply arrives
    /// too late for anyone waiting on the mirror instead.
    ///
    /// Source term: `timeout(d, on_timeout)`. See spec §4.1/§4.4, property 9.
    pub fn timeout<F>(&self, duration: Duration, on_timeout: F) -> InProgress<T, E>
    where
        T: Send + 'static,
        E: Send + 'static,
        F: FnOnce() -> E + Send + 'static,
    {
        let mirror = InProgress::new();
        let timer: Arc<dyn Timer> = Arc::new(MainLoopTimer::new());

        let mirror_value = mirror.clone();
        let timer_for_value = Arc::clone(&timer);
        self.observe_value(move |v| {
            timer_for_value.stop();
            let _ = mirror_value.finish(v);
        });

        let mirror_error = mirror.clone();
        let timer_for_error = Arc::clone(&timer);
        self.observe_error(move |e| {
            timer_for_error.stop();
            let _ = mirror_error.fail(e);
        });

        let mirror_timeout = mirror.clone();
        let on_timeout = Mutex::new(Some(on_timeout));
        timer.start(
            duration,
            Box::new(move || {
                if let Some(on_timeout) = on_timeout.lock().unwrap().take() {
                    let _ = mirror_timeout.fail(on_timeout());
                }
                false
            }),
        );

        mirror
    }
}

fn clone_value<T, E>(p: &InProgress<T, E>) -> Option<T>
where
    T: Clone,
{
    match &*p.inner.state.lock().unwrap() {
        State::Settled {
            outcome: Outcome::Finished(v),
            ..
        } => Some(v.clone()),
        _ => None,
    }
}

fn clone_error<T, E>(p: &InProgress<T, E>) -> Option<E>
where
    E: Clone,
{
    match &*p.inner.state.lock().unwrap() {
        State::Settled {
            outcome: Outcome::Failed(e),
            ..
        } => Some(e.clone()),
        _ => None,
    }
}

fn run_observer<V>(observer: ValueObserver<V>, value: Option<V>) {
    let Some(value) = value else { return };
    // Observer panics are isolated: logged, never propagated into the
    // promise state machine (spec §7, "Observer-raised errors").
    if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| observer(value))).is_err() {
        tracing::warn!("promise observer panicked; ignoring");
    }
}

impl<T, E> Default for InProgress<T, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> Drop for Inner<T, E> {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let State::Settled {
            outcome: Outcome::Failed(_),
            unhandled: true,
        } = state
        {
            tracing::error!("unhandled promise failure reclaimed with no exception observer");
        }
    }
}

/// A mutable `(current, total)` tuple attached to a promise for coarse
/// progress reporting, independent of the promise's terminal state.
#[derive(Debug, Clone)]
pub struct Progress {
    inner: Arc<Mutex<(u64, u64)>>,
}

impl Progress {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new((0, 0))),
        }
    }

    pub fn set(&self, current: u64, total: u64) {
        *self.inner.lock().unwrap() = (current, total);
    }

    pub fn get(&self) -> (u64, u64) {
        *self.inner.lock().unwrap()
    }
}

impl Default for Progress {
    fn default() -> Self {
        Self::new()
    }
}
