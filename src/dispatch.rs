// The main-thread wake pipe: a self-pipe bridging worker threads back onto
// whichever thread called `install_main_thread()`. Workers enqueue a job;
// the main thread's event loop (or, standalone, `drain()`) wakes from a
// blocking read on the pipe and runs every queued job in FIFO order.

use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::sync::{Mutex, OnceLock};
use std::thread::ThreadId;
use std::time::Duration;

use crate::builder::RuntimeConfig;
use crate::error::Error;
use crate::timer::{MainLoopTimer, Timer};

type Job = Box<dyn FnOnce() + Send>;

struct Pipe {
    read_fd: RawFd,
    write_fd: RawFd,
}

impl Drop for Pipe {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}

fn set_nonblocking(fd: RawFd) {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
    }
}

fn create_pipe() -> Pipe {
    let mut fds: [RawFd; 2] = [0; 2];
    let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
    assert_eq!(rc, 0, "failed to create the wake pipe");
    set_nonblocking(fds[0]);
    set_nonblocking(fds[1]);
    Pipe {
        read_fd: fds[0],
        write_fd: fds[1],
    }
}

struct State {
    main_thread: Mutex<Option<ThreadId>>,
    queue: Mutex<VecDeque<Job>>,
    pipe: Mutex<Option<Pipe>>,
}

static STATE: OnceLock<State> = OnceLock::new();

fn state() -> &'static State {
    STATE.get_or_init(|| State {
        main_thread: Mutex::new(None),
        queue: Mutex::new(VecDeque::new()),
        pipe: Mutex::new(None),
    })
}

/// Registers the calling thread as the main loop thread and creates the
/// wake pipe, if it does not already exist.
///
/// Source term: `create_thread_notifier_pipe` / notifier setup.
pub fn install_main_thread() {
    *state().main_thread.lock().unwrap() = Some(std::thread::current().id());
    ensure_pipe();
}

fn ensure_pipe() {
    let mut guard = state().pipe.lock().unwrap();
    if guard.is_none() {
        *guard = Some(create_pipe());
    }
}

/// True if the calling thread is the registered main loop thread. False if
/// no thread has registered yet.
pub fn is_main_thread() -> bool {
    match *state().main_thread.lock().unwrap() {
        Some(id) => id == std::thread::current().id(),
        None => false,
    }
}

/// Queues `job` to run on the main thread and wakes it if it's blocked
/// reading the pipe.
pub fn enqueue(job: Job) {
    state().queue.lock().unwrap().push_back(job);
    wakeup();
}

/// Queues `job` to run on the main thread after `delay`. A zero delay
/// enqueues immediately without going through the timer thread.
pub fn enqueue_delayed(delay: Duration, job: Job) {
    if delay.is_zero() {
        enqueue(job);
        return;
    }
    let timer = MainLoopTimer::new();
    let job = Mutex::new(Some(job));
    timer.start(
        delay,
        Box::new(move || {
            if let Some(job) = job.lock().unwrap().take() {
                enqueue(job);
            }
            false
        }),
    );
}

/// Writes a single byte to the wake pipe, unblocking a thread parked in
/// `drain()`'s read. Safe to call with no pipe installed yet (no-op).
///
/// Source term: `wakeup()`.
pub fn wakeup() {
    let guard = state().pipe.lock().unwrap();
    if let Some(pipe) = guard.as_ref() {
        let byte: u8 = 1;
        unsafe {
            libc::write(pipe.write_fd, &byte as *const u8 as *const _, 1);
        }
    }
}

/// Drains every job queued so far and runs each to completion, in FIFO
/// order. Returns the number of jobs run. Intended to be called from the
/// main loop once per wake.
pub fn drain() -> usize {
    {
        let guard = state().pipe.lock().unwrap();
        if let Some(pipe) = guard.as_ref() {
            let mut buf = vec![0_u8; RuntimeConfig::current().wake_pipe_chunk_size];
            unsafe {
                while libc::read(pipe.read_fd, buf.as_mut_ptr() as *mut _, buf.len()) > 0 {}
            }
        }
    }

    let jobs: Vec<Job> = state().queue.lock().unwrap().drain(..).collect();
    let n = jobs.len();
    for job in jobs {
        job();
    }
    n
}

/// Recreates the wake pipe, closing the old file descriptors first. Needed
/// after `fork()` without `exec()`, where the child inherits fds that no
/// longer mean anything in its own process. When `purge` is true, any jobs
/// already queued (from the parent, before the fork) are dropped instead of
/// carried over.
pub fn recreate(purge: bool) {
    {
        let mut guard = state().pipe.lock().unwrap();
        *guard = Some(create_pipe());
    }
    if purge {
        state().queue.lock().unwrap().clear();
    }
}

/// Blocks the calling thread (expected to be the main thread) on the wake
/// pipe becoming readable, for embedders with no event loop of their own.
/// Returns `Error::HostFatal` if the pipe was never installed.
pub fn block_until_woken(timeout: Option<Duration>) -> Result<(), Error> {
    let fd = {
        let guard = state().pipe.lock().unwrap();
        guard.as_ref().map(|p| p.read_fd)
    };
    let Some(fd) = fd else {
        return Err(Error::HostFatal("wake pipe not installed".to_string()));
    };

    let mut pollfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let timeout_ms = timeout.map(|d| d.as_millis() as i32).unwrap_or(-1);
    let rc = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
    if rc < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn drain_runs_queued_jobs_in_order() {
        install_main_thread();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = Arc::clone(&order);
            enqueue(Box::new(move || order.lock().unwrap().push(i)));
        }
        drain();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn is_main_thread_reflects_installer() {
        install_main_thread();
        assert!(is_main_thread());
        let other = std::thread::spawn(is_main_thread).join().unwrap();
        assert!(!other);
    }

    #[test]
    fn enqueue_from_worker_thread_wakes_drain() {
        install_main_thread();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = Arc::clone(&ran);
        let handle = std::thread::spawn(move || {
            enqueue(Box::new(move || {
                ran2.fetch_add(1, Ordering::SeqCst);
            }));
        });
        handle.join().unwrap();
        drain();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
