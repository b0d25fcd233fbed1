// A step function that waits on one worker thread call and returns its
// result, driven to completion on the main thread.

use std::time::Duration;

use stepwise_rt::{
    dispatch, run_in_thread, spawn_task, Directive, FromClosure, Injected, SpawnOptions, Target,
};

fn main() {
    dispatch::install_main_thread();

    let mut waiting = false;
    let driver = FromClosure::new(move |injected: Injected<i32, stepwise_rt::Error>| {
        if !waiting {
            waiting = true;
            let work = run_in_thread(Target::Thread { wait_on_exit: false }, || {
                println!("computing on a worker thread...");
                41 + 1
            });
            return Directive::Await(work.into());
        }
        match injected {
            Injected::Value(v) => Directive::Done(v),
            Injected::Error(e) => Directive::Raised(e),
            Injected::None => Directive::ContinueNow,
        }
    });

    let task = spawn_task(
        move |_| Box::new(driver),
        Box::new(stepwise_rt::MainLoopTimer::new()),
        SpawnOptions::default(),
    );

    while !task.promise().is_finished() {
        dispatch::block_until_woken(Some(Duration::from_millis(50))).ok();
        dispatch::drain();
    }

    println!("result: {:?}", task.promise().result().unwrap());
}
