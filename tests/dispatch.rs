// The main-thread wake pipe and worker abstractions: main-thread fast
// path, cross-thread enqueue/drain, named pool priority ordering, and
// `ThreadCallback`'s `wait_on_exit` flag.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use stepwise_rt::{dispatch, workers, run_in_thread, run_on_main, Error, Target, ThreadCallback};
use stepwise_rt::workers::join_all_wait_on_exit;

#[test]
fn run_on_main_settles_inline_on_main_thread() {
    dispatch::install_main_thread();
    let promise = run_on_main(|| 5);
    assert!(promise.is_finished());
    assert_eq!(promise.result().unwrap(), Some(5));
}

#[test]
fn worker_thread_result_crosses_back_through_dispatch() {
    dispatch::install_main_thread();
    let promise = run_in_thread(Target::Thread { wait_on_exit: true }, || 2 + 2);
    // The main thread can't block on a worker result directly (that's
    // exactly the Deadlock case `wait()` now refuses up front); wait from a
    // plain thread instead, the way an embedder's own worker would.
    let promise2 = promise.clone();
    std::thread::spawn(move || promise2.wait(Some(Duration::from_secs(1))).unwrap())
        .join()
        .unwrap();
    assert_eq!(promise.result().unwrap(), Some(4));
    join_all_wait_on_exit();
}

#[test]
fn thread_callback_reports_panics_as_host_fatal() {
    let promise: stepwise_rt::InProgress<(), Error> = ThreadCallback::spawn(|| panic!("nope"), true);
    promise.wait(Some(Duration::from_secs(1))).unwrap();
    assert!(matches!(promise.error().unwrap(), Some(Error::HostFatal(_))));
    join_all_wait_on_exit();
}

#[test]
fn is_main_thread_is_false_on_a_worker() {
    dispatch::install_main_thread();
    let seen_from_worker = std::thread::spawn(dispatch::is_main_thread).join().unwrap();
    assert!(!seen_from_worker);
    assert!(dispatch::is_main_thread());
}

#[test]
fn named_pool_preserves_fifo_order_within_equal_priority() {
    let pool = workers::named_pool("dispatch-test-pool", 1);
    let order = Arc::new(std::sync::Mutex::new(Vec::new()));
    let count = Arc::new(AtomicUsize::new(0));
    for i in 0..5 {
        let order = Arc::clone(&order);
        let count = Arc::clone(&count);
        pool.submit(0, move || {
            order.lock().unwrap().push(i);
            count.fetch_add(1, Ordering::SeqCst);
        });
    }
    let deadline = std::time::Instant::now() + Duration::from_secs(1);
    while count.load(Ordering::SeqCst) < 5 {
        assert!(std::time::Instant::now() < deadline, "named pool jobs never finished");
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
}
