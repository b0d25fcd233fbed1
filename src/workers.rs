// Worker abstractions bridging callables onto the main thread, a one-shot
// OS thread, or a dedicated named thread pool, all settling an `InProgress`
// promise exactly like a task would.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread::{self, JoinHandle};

use crate::builder::RuntimeConfig;
use crate::dispatch;
use crate::error::Error;
use crate::promise::{InProgress, Progress};

/// Runs `body` on the main thread. If the caller is already on the main
/// thread this calls `body` inline and returns an already-settled promise
/// (the fast path); otherwise it is queued through `dispatch::enqueue`.
pub fn run_on_main<F, R>(body: F) -> InProgress<R, Error>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    let promise = InProgress::new();
    if dispatch::is_main_thread() {
        let _ = promise.finish(body());
    } else {
        let promise2 = promise.clone();
        dispatch::enqueue(Box::new(move || {
            let _ = promise2.finish(body());
        }));
    }
    promise
}

/// Spawns `body` on a dedicated, one-shot OS thread.
///
/// Source term: `ThreadCallback` / `wait_on_exit`.
pub struct ThreadCallback;

static JOINABLE: OnceLock<Mutex<Vec<JoinHandle<()>>>> = OnceLock::new();

fn joinable() -> &'static Mutex<Vec<JoinHandle<()>>> {
    JOINABLE.get_or_init(|| Mutex::new(Vec::new()))
}

impl ThreadCallback {
    /// Spawns `body` on its own thread. When `wait_on_exit` is true the
    /// thread is tracked so [`join_all_wait_on_exit`] can block on it
    /// during an orderly shutdown; when false the thread runs and detaches
    /// independently of process shutdown, matching a daemon thread.
    pub fn spawn<F, R>(body: F, wait_on_exit: bool) -> InProgress<R, Error>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let promise = InProgress::new();
        let promise2 = promise.clone();
        let handle = thread::spawn(move || {
            match std::panic::catch_unwind(std::panic::AssertUnwindSafe(body)) {
                Ok(value) => {
                    let _ = promise2.finish(value);
                }
                Err(_) => {
                    tracing::warn!("one-shot worker thread panicked");
                    let _ = promise2.fail(Error::HostFatal("worker thread panicked".to_string()));
                }
            }
        });
        if wait_on_exit {
            let mut guard = joinable().lock().unwrap();
            guard.retain(|h| !h.is_finished());
            guard.push(handle);
        }
        promise
    }
}

/// Blocks on every thread spawned with `wait_on_exit = true` so far.
pub fn join_all_wait_on_exit() {
    let handles: Vec<_> = joinable().lock().unwrap().drain(..).collect();
    for handle in handles {
        let _ = handle.join();
    }
}

struct PendingJob {
    priority: i32,
    seq: u64,
    run: Box<dyn FnOnce() + Send>,
}

impl PartialEq for PendingJob {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for PendingJob {}

impl PartialOrd for PendingJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PendingJob {
    fn cmp(&self, other: &Self) -> Ordering {
        // `BinaryHeap` is a max-heap: higher priority pops first. Within
        // equal priority, the lower (earlier) sequence number must pop
        // first, so that comparison is inverted.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct PoolState {
    jobs: BinaryHeap<PendingJob>,
    next_seq: u64,
    shutdown: bool,
}

/// A dedicated pool of threads all sharing one name, draining a single
/// priority-ordered job list with a stable (FIFO) tie-break within equal
/// priority.
///
/// Source term: `NamedThreadCallback` / `_JobServer`.
pub struct NamedThreadPool {
    name: String,
    state: Mutex<PoolState>,
    condvar: Condvar,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl NamedThreadPool {
    fn new(name: String, thread_count: usize) -> Arc<Self> {
        let pool = Arc::new(Self {
            name,
            state: Mutex::new(PoolState {
                jobs: BinaryHeap::new(),
                next_seq: 0,
                shutdown: false,
            }),
            condvar: Condvar::new(),
            threads: Mutex::new(Vec::new()),
        });
        let mut handles = Vec::with_capacity(thread_count.max(1));
        for _ in 0..thread_count.max(1) {
            let pool = Arc::clone(&pool);
            handles.push(thread::spawn(move || pool.worker_loop()));
        }
        *pool.threads.lock().unwrap() = handles;
        pool
    }

    fn worker_loop(self: Arc<Self>) {
        loop {
            let job = {
                let mut state = self.state.lock().unwrap();
                loop {
                    if let Some(job) = state.jobs.pop() {
                        break Some(job);
                    }
                    if state.shutdown {
                        break None;
                    }
                    state = self.condvar.wait(state).unwrap();
                }
            };
            match job {
                Some(job) => (job.run)(),
                None => return,
            }
        }
    }

    /// Queues `run` at `priority` (higher runs sooner).
    pub fn submit<F>(&self, priority: i32, run: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.state.lock().unwrap();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.jobs.push(PendingJob {
            priority,
            seq,
            run: Box::new(run),
        });
        self.condvar.notify_one();
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stops this pool: sets its `shutdown` flag, wakes every worker so it
    /// can observe it, and blocks until each worker thread has exited.
    /// Already-queued jobs still run before their worker notices shutdown;
    /// nothing new can be submitted usefully afterward since the pool is
    /// removed from the process-wide registry by [`shutdown`].
    pub fn shutdown(&self) {
        {
            let mut state = self.state.lock().unwrap();
            state.shutdown = true;
        }
        self.condvar.notify_all();
        let handles: Vec<_> = self.threads.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
    }
}

static POOLS: OnceLock<Mutex<HashMap<String, Arc<NamedThreadPool>>>> = OnceLock::new();

fn pools() -> &'static Mutex<HashMap<String, Arc<NamedThreadPool>>> {
    POOLS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Returns the process-wide named pool `name`, creating it with
/// `default_thread_count` threads if it doesn't exist yet.
pub fn named_pool(name: &str, default_thread_count: usize) -> Arc<NamedThreadPool> {
    let mut guard = pools().lock().unwrap();
    Arc::clone(
        guard
            .entry(name.to_string())
            .or_insert_with(|| NamedThreadPool::new(name.to_string(), default_thread_count)),
    )
}

/// Stops every registered named pool and blocks until each has joined all
/// of its worker threads, then clears the registry. Intended for an
/// orderly host shutdown (spec §6, `shutdown()`).
pub fn shutdown() {
    let drained: Vec<Arc<NamedThreadPool>> = pools().lock().unwrap().drain().map(|(_, pool)| pool).collect();
    for pool in drained {
        pool.shutdown();
    }
}

/// Where a callable passed to [`run_in_thread`] should execute.
pub enum Target {
    MainThread,
    Thread {
        wait_on_exit: bool,
    },
    NamedPool {
        name: String,
        priority: i32,
        /// Thread count to create the pool with if it doesn't exist yet.
        /// `None` falls back to `RuntimeConfig::current().default_pool_thread_count`.
        default_thread_count: Option<usize>,
    },
}

/// Dispatches `body` according to `target`, settling the returned promise
/// with its result (or `Error::HostFatal` if it panics).
pub fn run_in_thread<F, R>(target: Target, body: F) -> InProgress<R, Error>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    match target {
        Target::MainThread => run_on_main(body),
        Target::Thread { wait_on_exit } => ThreadCallback::spawn(body, wait_on_exit),
        Target::NamedPool {
            name,
            priority,
            default_thread_count,
        } => {
            let count =
                default_thread_count.unwrap_or_else(|| RuntimeConfig::current().default_pool_thread_count);
            let pool = named_pool(&name, count);
            let promise = InProgress::new();
            let promise2 = promise.clone();
            pool.submit(priority, move || {
                match std::panic::catch_unwind(std::panic::AssertUnwindSafe(body)) {
                    Ok(value) => {
                        let _ = promise2.finish(value);
                    }
                    Err(_) => {
                        tracing::warn!("named pool job panicked");
                        let _ = promise2
                            .fail(Error::HostFatal("named pool job panicked".to_string()));
                    }
                }
            });
            promise
        }
    }
}

/// Synchronous variant of [`run_in_thread`]: on `Target::MainThread` while
/// already on the main thread, calls `body` inline with no promise
/// plumbing at all; otherwise submits to `target` and blocks the calling
/// thread until it settles, returning the plain value.
pub fn call_in_thread<F, R>(target: Target, body: F) -> Result<R, Error>
where
    F: FnOnce() -> R + Send + 'static,
    R: Clone + Send + 'static,
{
    if matches!(target, Target::MainThread) && dispatch::is_main_thread() {
        return Ok(body());
    }
    let promise = run_in_thread(target, body);
    promise.wait(None)?;
    settled_value(&promise)
}

/// Progress-carrying variant of [`run_in_thread`]: `body` receives a fresh
/// [`Progress`] handle it can report `(current, total)` through. `InProgress`
/// itself carries no progress field, so the handle is returned alongside
/// the settling promise rather than attached to it.
pub fn run_in_thread_with_progress<F, R>(target: Target, body: F) -> (InProgress<R, Error>, Progress)
where
    F: FnOnce(Progress) -> R + Send + 'static,
    R: Send + 'static,
{
    let progress = Progress::new();
    let progress_for_body = progress.clone();
    let promise = run_in_thread(target, move || body(progress_for_body));
    (promise, progress)
}

/// The synchronous counterpart of [`run_in_thread_with_progress`]: blocks
/// until the job settles and returns the plain value, with the `Progress`
/// handle available to poll from another thread while waiting.
pub fn call_in_thread_with_progress<F, R>(target: Target, body: F) -> (Result<R, Error>, Progress)
where
    F: FnOnce(Progress) -> R + Send + 'static,
    R: Clone + Send + 'static,
{
    let (promise, progress) = run_in_thread_with_progress(target, body);
    let result = promise.wait(None).and_then(|()| settled_value(&promise));
    (result, progress)
}

fn settled_value<R: Clone>(promise: &InProgress<R, Error>) -> Result<R, Error> {
    match promise.result()? {
        Some(value) => Ok(value),
        None => Err(promise
            .error()?
            .unwrap_or_else(|| Error::HostFatal("worker failed with no recorded error".to_string()))),
    }
}
