// Two calls for the same singleton key collapse into one in-flight task;
// the second caller is handed the first caller's promise instead of
// spawning a redundant worker call.

use std::time::Duration;

use stepwise_rt::{
    dispatch, run_in_thread, spawn_task, Directive, FromClosure, Injected, Policy, SpawnOptions,
    Target,
};

fn make_driver() -> FromClosure<impl FnMut(Injected<&'static str, stepwise_rt::Error>) -> Directive<&'static str, stepwise_rt::Error>> {
    let mut waiting = false;
    FromClosure::new(move |injected| {
        if !waiting {
            waiting = true;
            let work = run_in_thread(Target::Thread { wait_on_exit: false }, || {
                std::thread::sleep(Duration::from_millis(20));
                "refreshed"
            });
            return Directive::Await(work.into());
        }
        match injected {
            Injected::Value(v) => Directive::Done(v),
            Injected::Error(e) => Directive::Raised(e),
            Injected::None => Directive::ContinueNow,
        }
    })
}

fn main() {
    dispatch::install_main_thread();

    let opts = SpawnOptions {
        interval: Duration::ZERO,
        policy: Policy::Singleton,
        policy_key: Some(("refresh_cache", "shared".to_string())),
    };

    let first = spawn_task(
        move |_| Box::new(make_driver()),
        Box::new(stepwise_rt::MainLoopTimer::new()),
        opts.clone(),
    );
    let second = spawn_task(
        move |_| Box::new(make_driver()),
        Box::new(stepwise_rt::MainLoopTimer::new()),
        opts,
    );

    while !first.promise().is_finished() || !second.promise().is_finished() {
        dispatch::block_until_woken(Some(Duration::from_millis(50))).ok();
        dispatch::drain();
    }

    println!("first:  {:?}", first.promise().result().unwrap());
    println!("second: {:?}", second.promise().result().unwrap());
}
