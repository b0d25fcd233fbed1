// A re-entrant scoped lock usable both as an explicit guard and wrapped
// around a callable, matching `thread.py`'s `synchronized` helper: the same
// thread can re-enter a lock it already holds without deadlocking itself.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use parking_lot::{ReentrantMutex, ReentrantMutexGuard};

/// A re-entrant lock. `enter()` blocks only against other threads; the
/// thread already holding the lock can call `enter()` again freely.
pub struct Synchronized {
    mutex: ReentrantMutex<()>,
}

impl Synchronized {
    pub fn new() -> Self {
        Self {
            mutex: ReentrantMutex::new(()),
        }
    }

    /// Acquires the lock for the returned guard's lifetime.
    pub fn enter(&self) -> SynchronizedGuard<'_> {
        SynchronizedGuard {
            _guard: self.mutex.lock(),
        }
    }

    /// Runs `body` with the lock held.
    pub fn with_lock<F, R>(&self, body: F) -> R
    where
        F: FnOnce() -> R,
    {
        let _guard = self.enter();
        body()
    }
}

impl Default for Synchronized {
    fn default() -> Self {
        Self::new()
    }
}

pub struct SynchronizedGuard<'a> {
    _guard: ReentrantMutexGuard<'a, ()>,
}

static KEYED_LOCKS: OnceLock<std::sync::Mutex<HashMap<String, Arc<Synchronized>>>> =
    OnceLock::new();

fn keyed_locks() -> &'static std::sync::Mutex<HashMap<String, Arc<Synchronized>>> {
    KEYED_LOCKS.get_or_init(|| std::sync::Mutex::new(HashMap::new()))
}

/// Returns the process-wide lock registered under `key`, creating it if
/// necessary. Used to back `lock_wrap`-style decoration where the lock is
/// selected by an argument key rather than passed explicitly.
pub fn lock_for_key(key: &str) -> Arc<Synchronized> {
    let mut guard = keyed_locks().lock().unwrap();
    Arc::clone(
        guard
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Synchronized::new())),
    )
}

/// Wraps `body` so it runs under the lock registered for `key`.
///
/// Source term: function-decorator form of `synchronized`.
pub fn lock_wrap<F, R>(key: &str, body: F) -> R
where
    F: FnOnce() -> R,
{
    lock_for_key(key).with_lock(body)
}
