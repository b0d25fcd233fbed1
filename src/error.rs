// Error taxonomy for the stepwise runtime.

use thiserror::Error;

/// A specialized `Result` type for stepwise runtime operations that return an
/// [`Error`][enum@Error] on failure.
pub type Result<T> = std::result::Result<T, Error>;

/// An error originating in the stepwise runtime.
///
/// This is an umbrella type for every failure kind the runtime can surface:
/// programming errors (e.g. reading a pending promise) as well as
/// operational ones (e.g. a task being cancelled). Future versions may add
/// additional variants.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum Error {
    /// The result or error of a promise was requested before it reached a
    /// terminal state.
    #[error("promise has not finished yet")]
    NotReady,

    /// A second attempt was made to settle an already-terminal promise.
    #[error("promise was already settled")]
    AlreadySet,

    /// A promise did not reach a terminal state within its configured
    /// timeout.
    #[error("promise timed out")]
    TimedOut,

    /// A task was aborted via `cancel()`.
    #[error("task was cancelled")]
    Cancelled,

    /// A step function did not honour `close()`; the task was finalized
    /// anyway and this is downgraded to a logged warning at the call site.
    #[error("step function \"{name}\" ignored close()")]
    CloseIgnored {
        /// Name of the offending step function, for diagnostics.
        name: String,
    },

    /// A callable that was expected to produce a [`Directive`][crate::Directive]-driven
    /// value (a driver) did not.
    #[error("expected a driver, found a plain value")]
    InvalidTarget,

    /// The main thread attempted to block on a promise that can only be
    /// resolved by re-entering the main loop.
    #[error("cannot wait on the main thread for a promise with no reentry path")]
    Deadlock,

    /// A fatal host signal (interrupt/exit-equivalent) was observed during a
    /// task advance or queue drain.
    #[error("a fatal host signal was observed: {0}")]
    HostFatal(String),

    /// An I/O error surfaced from the wake pipe or a worker thread.
    #[error("I/O error: {0}")]
    Io(std::sync::Arc<std::io::Error>),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io(std::sync::Arc::new(err))
    }
}
