// The task engine: drives a step function to completion through repeated
// calls to `advance`, handling eager first advance, inline batching only
// when an awaited prerequisite is already terminal, suspension on a
// still-pending `Await`, and cancellation.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::dispatch;
use crate::driver::{AwaitHandle, Directive, Injected, StepFn};
use crate::error::Error;
use crate::policy::{Admission, Policy, PolicyKey, PolicyRegistry};
use crate::promise::{InProgress, Progress};
use crate::timer::Timer;

/// Type-erased handle kept in the process-wide live-task registry so a
/// self-keeping task (nothing else holds its `Task` handle) is not dropped
/// mid-advance.
trait LiveTask: Send + Sync {
    fn is_finished(&self) -> bool;
}

struct TaskState<T, E> {
    driver: Box<dyn StepFn<T, E>>,
    cancelled: bool,
}

struct Shared<T, E> {
    state: Mutex<TaskState<T, E>>,
    promise: InProgress<T, E>,
    progress: Progress,
    interval: Duration,
    timer: Box<dyn Timer>,
    /// Cancel hook for whatever this task is currently suspended on, set
    /// while an `Await` is pending and cleared once it settles. Invoked by
    /// `Task::cancel()` to propagate cancellation into a task-shaped
    /// prerequisite.
    current_await: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl<T, E> LiveTask for Shared<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    fn is_finished(&self) -> bool {
        self.promise.is_finished()
    }
}

static LIVE: Mutex<Vec<Arc<dyn LiveTask>>> = Mutex::new(Vec::new());

fn register_live(task: Arc<dyn LiveTask>) {
    let mut live = LIVE.lock().unwrap();
    live.retain(|t| !t.is_finished());
    live.push(task);
}

/// A running step function, observable through the promise it settles.
///
/// `Task` is a promise to the outside world: `observe_value`, `wait`, and
/// friends are reached through [`Task::promise`]; cancellation and
/// progress reporting are the additional surface a plain `InProgress`
/// doesn't have.
pub struct Task<T, E = Error> {
    shared: Arc<Shared<T, E>>,
}

impl<T, E> Clone for Task<T, E> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T, E> Task<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + From<Error> + 'static,
{
    /// The promise this task settles when its driver reaches `Done`/`Raised`.
    pub fn promise(&self) -> &InProgress<T, E> {
        &self.shared.promise
    }

    /// The `(current, total)` progress sub-handle for this task.
    pub fn progress(&self) -> &Progress {
        &self.shared.progress
    }

    /// Requests cancellation. The driver's `close()` hook runs (its return
    /// value is logged as `Error::CloseIgnored` if it reports it didn't
    /// honor the request), cancellation propagates into whatever this task
    /// is currently awaiting if that prerequisite is itself a task, and the
    /// promise settles with `Error::Cancelled` regardless of how `close()`
    /// reported.
    pub fn cancel(&self) {
        let mut state = self.shared.state.lock().unwrap();
        if state.cancelled || self.shared.promise.is_finished() {
            return;
        }
        state.cancelled = true;

        if let Some(cancel) = self.shared.current_await.lock().unwrap().take() {
            cancel();
        }

        let name = state.driver.name().to_string();
        let closed_cleanly = state.driver.close();
        drop(state);

        if !closed_cleanly {
            let diagnostic = Error::CloseIgnored { name };
            tracing::warn!("{diagnostic}");
        }

        let _ = self.shared.promise.fail(Error::Cancelled.into());
    }

    /// Wraps this task's promise with a timeout: if it hasn't settled
    /// within `duration`, the returned promise fails with `Error::TimedOut`
    /// and this task is cancelled (spec scenario S9, self-cancelling tasks).
    pub fn timeout(&self, duration: Duration) -> InProgress<T, E> {
        let task_for_timeout = self.clone();
        self.shared.promise.timeout(duration, move || {
            task_for_timeout.cancel();
            Error::TimedOut.into()
        })
    }
}

/// Converts a task into an `Await` prerequisite: cancelling the new task
/// that awaits it propagates into this one.
impl<T, E> From<Task<T, E>> for AwaitHandle<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + From<Error> + 'static,
{
    fn from(task: Task<T, E>) -> Self {
        let promise = task.shared.promise.clone();
        let cancel_target = task.clone();
        Self {
            promise,
            cancel: Some(Box::new(move || cancel_target.cancel())),
        }
    }
}

/// Options controlling how a spawned task is driven and coordinated.
#[derive(Clone)]
pub struct SpawnOptions {
    /// Minimum delay between a promise settling and the task resuming,
    /// applied through the `Timer` contract rather than advancing inline.
    pub interval: Duration,
    /// Coordination policy against other calls sharing `policy_key`.
    pub policy: Policy,
    /// Present iff `policy != Policy::None`.
    pub policy_key: Option<PolicyKey>,
}

impl Default for SpawnOptions {
    fn default() -> Self {
        Self {
            interval: crate::builder::RuntimeConfig::current().resumption_interval,
            policy: Policy::None,
            policy_key: None,
        }
    }
}

static POLICIES: Mutex<Option<Arc<PolicyRegistry>>> = Mutex::new(None);

fn policy_registry() -> Arc<PolicyRegistry> {
    let mut slot = POLICIES.lock().unwrap();
    slot.get_or_insert_with(|| Arc::new(PolicyRegistry::new())).clone()
}

/// Spawns a step function as a task: advances it eagerly once, then keeps
/// advancing inline only while an awaited prerequisite is already terminal,
/// suspending otherwise and resuming (after `opts.interval` and one
/// main-loop hop) once it settles.
///
/// `make_driver` receives the most recently spawned still-live task for
/// `opts.policy_key` when `opts.policy` is `Policy::PassLast`, so the new
/// driver can sequence itself against its predecessor explicitly (the
/// registry never cancels it automatically). For every other policy it is
/// always called with `None`.
pub fn spawn_task<T, E>(
    make_driver: impl FnOnce(Option<Task<T, E>>) -> Box<dyn StepFn<T, E>>,
    timer: Box<dyn Timer>,
    opts: SpawnOptions,
) -> Task<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + From<Error> + 'static,
{
    let last_for_driver = if opts.policy == Policy::PassLast {
        opts.policy_key
            .as_ref()
            .and_then(|key| policy_registry().take_last::<Task<T, E>>(key))
    } else {
        None
    };
    let driver = make_driver(last_for_driver);

    let shared = Arc::new(Shared {
        state: Mutex::new(TaskState {
            driver,
            cancelled: false,
        }),
        promise: InProgress::new(),
        progress: Progress::new(),
        interval: opts.interval,
        timer,
        current_await: Mutex::new(None),
    });

    if let (Policy::Synchronized, Some(key)) = (opts.policy, opts.policy_key.clone()) {
        let registry = policy_registry();
        let promise_for_policy = shared.promise.clone();
        match registry.admit(key.clone(), Policy::Synchronized, promise_for_policy) {
            Admission::Queued => {
                let shared_for_wait = Arc::clone(&shared);
                let key_for_wait = key.clone();
                registry.enqueue(
                    &key,
                    Box::new(move || {
                        register_live(shared_for_wait.clone() as Arc<dyn LiveTask>);
                        advance_loop(shared_for_wait, Injected::None, Some(key_for_wait));
                    }),
                );
                return Task { shared };
            }
            Admission::Proceed => {}
            Admission::UseExisting(_) => unreachable!("Synchronized never returns UseExisting"),
        }
    } else if let (Policy::Singleton, Some(key)) = (opts.policy, opts.policy_key.clone()) {
        let registry = policy_registry();
        let promise_for_policy = shared.promise.clone();
        if let Admission::UseExisting(existing) = registry.admit(key, Policy::Singleton, promise_for_policy) {
            return Task {
                shared: Arc::new(Shared {
                    state: Mutex::new(TaskState {
                        driver: Box::new(crate::driver::FromClosure::new(|_: Injected<T, E>| {
                            Directive::ContinueNow
                        })),
                        cancelled: true,
                    }),
                    promise: existing,
                    progress: Progress::new(),
                    interval: Duration::ZERO,
                    timer: Box::new(crate::timer::MainLoopTimer::new()),
                    current_await: Mutex::new(None),
                }),
            };
        }
    } else if let (Policy::PassLast, Some(key)) = (opts.policy, opts.policy_key.clone()) {
        policy_registry().set_last(key, Task { shared: Arc::clone(&shared) });
    }

    register_live(Arc::clone(&shared) as Arc<dyn LiveTask>);
    let key = opts.policy_key.clone();
    advance_loop(Arc::clone(&shared), Injected::None, key);
    Task { shared }
}

fn advance_loop<T, E>(shared: Arc<Shared<T, E>>, mut injected: Injected<T, E>, policy_key: Option<PolicyKey>)
where
    T: Clone + Send + 'static,
    E: Clone + Send + From<Error> + 'static,
{
    loop {
        let directive = {
            let mut state = shared.state.lock().unwrap();
            if state.cancelled {
                return;
            }
            state.driver.advance(injected)
        };

        match directive {
            Directive::ContinueNow => {
                // Always hops through the task's own timer and the
                // main-loop wake queue, even with a zero interval: three
                // `ContinueNow`s mean three hops, never an inline busy loop
                // (spec scenario S2).
                let shared_resume = Arc::clone(&shared);
                let key_resume = policy_key.clone();
                schedule_resume(&shared, move || {
                    advance_loop(shared_resume, Injected::None, key_resume)
                });
                return;
            }
            Directive::Done(value) => {
                let _ = shared.promise.finish(value);
                if let Some(key) = policy_key {
                    policy_registry().release(&key);
                }
                return;
            }
            Directive::Raised(error) => {
                let _ = shared.promise.fail(error);
                if let Some(key) = policy_key {
                    policy_registry().release(&key);
                }
                return;
            }
            Directive::Await(handle) => {
                let AwaitHandle { promise: awaited, cancel } = handle;

                if awaited.is_finished() {
                    // Already-terminal prerequisite: nothing to wait on, so
                    // batch inline with no main-loop hop.
                    injected = match awaited.result().expect("checked is_finished above") {
                        Some(value) => Injected::Value(value),
                        None => Injected::Error(
                            awaited
                                .error()
                                .expect("checked is_finished above")
                                .expect("settled but neither finished nor failed"),
                        ),
                    };
                    continue;
                }

                *shared.current_await.lock().unwrap() = cancel;

                let shared_value = Arc::clone(&shared);
                let shared_error = Arc::clone(&shared);
                let key_value = policy_key.clone();
                let key_error = policy_key.clone();

                awaited.observe_value(move |value| {
                    *shared_value.current_await.lock().unwrap() = None;
                    let shared_resume = Arc::clone(&shared_value);
                    schedule_resume(&shared_value, move || {
                        advance_loop(shared_resume, Injected::Value(value), key_value)
                    });
                });
                awaited.observe_error(move |error| {
                    *shared_error.current_await.lock().unwrap() = None;
                    let shared_resume = Arc::clone(&shared_error);
                    schedule_resume(&shared_error, move || {
                        advance_loop(shared_resume, Injected::Error(error), key_error)
                    });
                });
                return;
            }
        }
    }
}

/// Resumes a task after its awaited promise settles (or after a
/// `ContinueNow`), via the task's own `Timer` (honoring `interval`)
/// followed by one hop through the main-loop wake queue, so a task never
/// re-enters its driver synchronously from inside the promise observer
/// callback that woke it.
fn schedule_resume<T, E>(shared: &Shared<T, E>, resume: impl FnOnce() + Send + 'static) {
    let resume = Mutex::new(Some(Box::new(resume) as Box<dyn FnOnce() + Send>));
    shared.timer.start(
        shared.interval,
        Box::new(move || {
            if let Some(resume) = resume.lock().unwrap().take() {
                dispatch::enqueue(resume);
            }
            false
        }),
    );
}
