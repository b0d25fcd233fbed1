// The step-function driver: the generator-like contract a `Task` advances.
//
// Rust has no native generators, so a step function is modeled as a small
// tagged-variant state machine (`Directive`) that a driver returns from each
// call to `advance`. This mirrors the shape of a coroutine's `send`/`throw`
// protocol without needing unsafe generator transmutation.

use crate::promise::InProgress;

/// What a step function is suspended on. Carries the awaited promise plus,
/// when the prerequisite is itself a task, a hook that propagates
/// cancellation into it; a bare `InProgress` has nothing to propagate into
/// and converts with an empty hook.
pub struct AwaitHandle<T, E> {
    pub(crate) promise: InProgress<T, E>,
    pub(crate) cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl<T, E> AwaitHandle<T, E> {
    /// The promise this handle suspends on.
    pub fn promise(&self) -> &InProgress<T, E> {
        &self.promise
    }
}

impl<T, E> From<InProgress<T, E>> for AwaitHandle<T, E> {
    fn from(promise: InProgress<T, E>) -> Self {
        Self {
            promise,
            cancel: None,
        }
    }
}

/// What a step function wants to happen next.
pub enum Directive<T, E> {
    /// Call `advance` again immediately, with no injected value. Unlike
    /// `Await` on an already-terminal promise, this always hops through the
    /// owning task's timer before the next call (see spec scenario S2).
    ContinueNow,
    /// Suspend until the handle's promise settles; its outcome is injected
    /// into the next `advance` call.
    Await(AwaitHandle<T, E>),
    /// The step function is finished; settle the owning task with `value`.
    Done(T),
    /// The step function failed; settle the owning task with `error`.
    Raised(E),
}

/// What is handed back into a step function on the call following an
/// `Await` directive.
pub enum Injected<T, E> {
    /// First call, or the step function issued `ContinueNow`.
    None,
    /// The awaited promise finished with this value.
    Value(T),
    /// The awaited promise failed with this error.
    Error(E),
}

/// The driver contract a `Task` advances until it reaches `Done`/`Raised`.
///
/// Source term: step function. See spec §3/§4.3.
pub trait StepFn<T, E>: Send {
    /// Advances the step function by one step, given whatever was injected
    /// from a previously awaited promise.
    fn advance(&mut self, injected: Injected<T, E>) -> Directive<T, E>;

    /// Called instead of `advance` when the owning task is cancelled.
    /// Returns whether the step function actually honored the request; the
    /// default implementation does nothing and reports success. A driver
    /// that can't release its resources synchronously should return `false`
    /// so the caller can log `Error::CloseIgnored` instead of pretending the
    /// cleanup happened — the task still settles with `Cancelled` either way.
    fn close(&mut self) -> bool {
        true
    }

    /// A human-readable name for diagnostics (`CloseIgnored`, tracing
    /// spans). The default is deliberately uninformative; named step
    /// functions should override it.
    fn name(&self) -> &str {
        "<anonymous step function>"
    }
}

/// Adapts a plain `FnMut(Injected<T, E>) -> Directive<T, E>` closure into a
/// [`StepFn`], for step functions with nothing to clean up on `close`.
pub struct FromClosure<F> {
    step: F,
}

impl<F> FromClosure<F> {
    pub fn new(step: F) -> Self {
        Self { step }
    }
}

impl<F, T, E> StepFn<T, E> for FromClosure<F>
where
    F: FnMut(Injected<T, E>) -> Directive<T, E> + Send,
{
    fn advance(&mut self, injected: Injected<T, E>) -> Directive<T, E> {
        (self.step)(injected)
    }
}

/// Adapts a step closure together with an explicit close hook that reports
/// whether it actually closed.
pub struct FromClosureWithClose<F, C> {
    step: F,
    on_close: C,
}

impl<F, C> FromClosureWithClose<F, C> {
    pub fn new(step: F, on_close: C) -> Self {
        Self { step, on_close }
    }
}

impl<F, C, T, E> StepFn<T, E> for FromClosureWithClose<F, C>
where
    F: FnMut(Injected<T, E>) -> Directive<T, E> + Send,
    C: FnMut() -> bool + Send,
{
    fn advance(&mut self, injected: Injected<T, E>) -> Directive<T, E> {
        (self.step)(injected)
    }

    fn close(&mut self) -> bool {
        (self.on_close)()
    }
}
