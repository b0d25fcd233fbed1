// Cancellation: `close()` runs, the driver stops advancing, the promise
// settles with `Error::Cancelled`, and a resisting `close()` is logged
// rather than allowed to block finalization.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use stepwise_rt::driver::StepFn;
use stepwise_rt::{spawn_task, Directive, Error, Injected, MainLoopTimer, SpawnOptions};

struct CountingDriver {
    advances: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
}

impl StepFn<(), Error> for CountingDriver {
    fn advance(&mut self, _injected: Injected<(), Error>) -> Directive<(), Error> {
        self.advances.fetch_add(1, Ordering::SeqCst);
        // Never settles on its own; only cancellation ends it.
        Directive::Await(stepwise_rt::InProgress::new().into())
    }

    fn close(&mut self) -> bool {
        self.closed.store(true, Ordering::SeqCst);
        true
    }
}

/// A driver whose `close()` reports that it didn't actually honor the
/// cancellation request, exercising `Error::CloseIgnored`.
struct ResistingDriver {
    close_attempts: Arc<AtomicUsize>,
}

impl StepFn<(), Error> for ResistingDriver {
    fn advance(&mut self, _injected: Injected<(), Error>) -> Directive<(), Error> {
        Directive::Await(stepwise_rt::InProgress::new().into())
    }

    fn close(&mut self) -> bool {
        self.close_attempts.fetch_add(1, Ordering::SeqCst);
        false
    }

    fn name(&self) -> &str {
        "resisting-driver"
    }
}

#[test]
fn cancel_runs_close_and_fails_with_cancelled() {
    let advances = Arc::new(AtomicUsize::new(0));
    let closed = Arc::new(AtomicBool::new(false));

    let driver = CountingDriver {
        advances: Arc::clone(&advances),
        closed: Arc::clone(&closed),
    };

    let task = spawn_task(
        move |_| Box::new(driver),
        Box::new(MainLoopTimer::new()),
        SpawnOptions::default(),
    );

    assert_eq!(advances.load(Ordering::SeqCst), 1);
    assert!(!task.promise().is_finished());

    task.cancel();

    assert!(closed.load(Ordering::SeqCst));
    assert!(task.promise().is_finished());
    assert!(matches!(task.promise().error().unwrap(), Some(Error::Cancelled)));
}

#[test]
fn cancel_is_idempotent() {
    let advances = Arc::new(AtomicUsize::new(0));
    let closed = Arc::new(AtomicBool::new(false));
    let driver = CountingDriver {
        advances: Arc::clone(&advances),
        closed: Arc::clone(&closed),
    };
    let task = spawn_task(
        move |_| Box::new(driver),
        Box::new(MainLoopTimer::new()),
        SpawnOptions::default(),
    );

    task.cancel();
    task.cancel();
    assert!(task.promise().is_finished());
}

#[test]
fn cancel_still_settles_when_close_is_ignored() {
    let close_attempts = Arc::new(AtomicUsize::new(0));
    let driver = ResistingDriver {
        close_attempts: Arc::clone(&close_attempts),
    };
    let task = spawn_task(
        move |_| Box::new(driver),
        Box::new(MainLoopTimer::new()),
        SpawnOptions::default(),
    );

    task.cancel();

    assert_eq!(close_attempts.load(Ordering::SeqCst), 1);
    assert!(task.promise().is_finished());
    assert!(matches!(task.promise().error().unwrap(), Some(Error::Cancelled)));
}

#[test]
fn cancel_propagates_into_a_task_shaped_prerequisite() {
    let prereq_advances = Arc::new(AtomicUsize::new(0));
    let prereq_closed = Arc::new(AtomicBool::new(false));
    let prereq_driver = CountingDriver {
        advances: Arc::clone(&prereq_advances),
        closed: Arc::clone(&prereq_closed),
    };
    let prereq = spawn_task(
        move |_| Box::new(prereq_driver),
        Box::new(MainLoopTimer::new()),
        SpawnOptions::default(),
    );

    let mut prereq_for_driver = Some(prereq.clone());
    let driver = stepwise_rt::FromClosure::new(move |injected: Injected<(), Error>| match injected {
        Injected::None => Directive::Await(prereq_for_driver.take().unwrap().into()),
        Injected::Value(v) => Directive::Done(v),
        Injected::Error(e) => Directive::Raised(e),
        _ => Directive::ContinueNow,
    });
    let outer = spawn_task(
        move |_| Box::new(driver),
        Box::new(MainLoopTimer::new()),
        SpawnOptions::default(),
    );

    outer.cancel();

    assert!(prereq_closed.load(Ordering::SeqCst));
    assert!(prereq.promise().is_finished());
    assert!(matches!(prereq.promise().error().unwrap(), Some(Error::Cancelled)));
}
