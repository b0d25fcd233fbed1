// Basic task-engine properties: eager first advance, inline batching only
// while an awaited prerequisite is already terminal, ContinueNow always
// hopping through the main loop, and settling through to a promise.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use stepwise_rt::{
    dispatch, spawn_task, Directive, Error, FromClosure, Injected, MainLoopTimer, SpawnOptions,
};

fn drain_until<F: Fn() -> bool>(done: F) {
    dispatch::install_main_thread();
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while !done() {
        assert!(std::time::Instant::now() < deadline, "task engine test timed out");
        dispatch::block_until_woken(Some(Duration::from_millis(20))).ok();
        dispatch::drain();
    }
}

#[test]
fn spawn_advances_eagerly_before_returning() {
    let advanced = Arc::new(AtomicUsize::new(0));
    let advanced2 = Arc::clone(&advanced);
    let driver = FromClosure::new(move |_: Injected<(), Error>| {
        advanced2.fetch_add(1, Ordering::SeqCst);
        Directive::Done(())
    });

    let task = spawn_task(
        move |_| Box::new(driver),
        Box::new(MainLoopTimer::new()),
        SpawnOptions::default(),
    );

    assert_eq!(advanced.load(Ordering::SeqCst), 1);
    assert!(task.promise().is_finished());
}

#[test]
fn continue_now_always_hops_through_the_main_loop() {
    let calls = Arc::new(AtomicUsize::new(0));
    let calls2 = Arc::clone(&calls);
    let driver = FromClosure::new(move |_: Injected<i32, Error>| {
        let n = calls2.fetch_add(1, Ordering::SeqCst) + 1;
        if n < 3 {
            Directive::ContinueNow
        } else {
            Directive::Done(n)
        }
    });

    let task = spawn_task(
        move |_| Box::new(driver),
        Box::new(MainLoopTimer::new()),
        SpawnOptions::default(),
    );

    // The very first advance happens eagerly inside `spawn_task`; each
    // subsequent `ContinueNow` must hop back through the timer and the
    // main-loop wake queue rather than looping inline (spec scenario S2).
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    drain_until(|| task.promise().is_finished());
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(task.promise().result().unwrap(), Some(3));
}

#[test]
fn await_suspends_and_resumes_after_promise_settles() {
    let worker_ran = Arc::new(AtomicUsize::new(0));
    let worker_ran2 = Arc::clone(&worker_ran);
    let mut waiting = false;

    let driver = FromClosure::new(move |injected: Injected<i32, Error>| match injected {
        Injected::None if !waiting => {
            waiting = true;
            let promise = stepwise_rt::InProgress::new();
            let promise2 = promise.clone();
            let worker_ran3 = Arc::clone(&worker_ran2);
            std::thread::spawn(move || {
                worker_ran3.fetch_add(1, Ordering::SeqCst);
                let _ = promise2.finish(99);
            });
            Directive::Await(promise.into())
        }
        Injected::Value(v) => Directive::Done(v),
        Injected::Error(e) => Directive::Raised(e),
        _ => Directive::ContinueNow,
    });

    let task = spawn_task(
        move |_| Box::new(driver),
        Box::new(MainLoopTimer::new()),
        SpawnOptions::default(),
    );

    drain_until(|| task.promise().is_finished());
    assert_eq!(task.promise().result().unwrap(), Some(99));
    assert_eq!(worker_ran.load(Ordering::SeqCst), 1);
}

#[test]
fn already_terminal_await_batches_inline() {
    let hops = Arc::new(AtomicUsize::new(0));
    let hops2 = Arc::clone(&hops);

    // The prerequisite is finished before the driver ever asks for it, so
    // the whole chain should resolve during the eager first advance with
    // no main-loop hop at all.
    let driver = FromClosure::new(move |injected: Injected<i32, Error>| match injected {
        Injected::None => {
            hops2.fetch_add(1, Ordering::SeqCst);
            Directive::Await(stepwise_rt::InProgress::finished(1).into())
        }
        Injected::Value(v) => Directive::Done(v),
        Injected::Error(e) => Directive::Raised(e),
        _ => Directive::ContinueNow,
    });

    let task = spawn_task(
        move |_| Box::new(driver),
        Box::new(MainLoopTimer::new()),
        SpawnOptions::default(),
    );

    assert!(task.promise().is_finished());
    assert_eq!(task.promise().result().unwrap(), Some(1));
    assert_eq!(hops.load(Ordering::SeqCst), 1);
}

#[test]
fn raised_directive_fails_the_promise() {
    let driver = FromClosure::new(|_: Injected<(), Error>| Directive::Raised(Error::HostFatal("boom".to_string())));
    let task = spawn_task(
        move |_| Box::new(driver),
        Box::new(MainLoopTimer::new()),
        SpawnOptions::default(),
    );
    assert!(matches!(task.promise().error().unwrap(), Some(Error::HostFatal(_))));
}
