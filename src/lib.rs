//! A single-threaded, cooperative task runtime: step functions driven by a
//! small generator-like `Directive` contract, a universal `InProgress`
//! promise, coordination policies for repeated calls, and a main-thread
//! wake pipe bridging worker threads back onto the loop that owns them.

pub mod builder;
pub mod dispatch;
pub mod driver;
pub mod error;
pub mod policy;
pub mod promise;
pub mod sync;
pub mod task;
pub mod timer;
pub mod workers;

pub use builder::{RuntimeBuilder, RuntimeConfig};
pub use dispatch::{drain, enqueue, enqueue_delayed, install_main_thread, is_main_thread, wakeup};
pub use driver::{AwaitHandle, Directive, FromClosure, FromClosureWithClose, Injected, StepFn};
pub use error::{Error, Result};
pub use policy::Policy;
pub use promise::{InProgress, Progress};
pub use sync::{lock_wrap, Synchronized};
pub use task::{spawn_task, SpawnOptions, Task};
pub use timer::{MainLoopTimer, Timer};
pub use workers::{
    call_in_thread, call_in_thread_with_progress, join_all_wait_on_exit, named_pool,
    run_in_thread, run_in_thread_with_progress, run_on_main, shutdown, NamedThreadPool, Target,
    ThreadCallback,
};
