// Runtime configuration: the handful of knobs the task engine, wake pipe,
// and worker pools need before anything is spawned. Purely in-process, no
// file-based config format, matching the teacher's builder.

use std::sync::{Mutex, OnceLock};
use std::time::Duration;

/// Builds a [`RuntimeConfig`] with sensible defaults, overridable one field
/// at a time.
#[derive(Debug, Clone)]
pub struct RuntimeBuilder {
    resumption_interval: Duration,
    wake_pipe_chunk_size: usize,
    default_pool_thread_count: usize,
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        Self {
            resumption_interval: Duration::ZERO,
            wake_pipe_chunk_size: 64,
            default_pool_thread_count: 1,
        }
    }

    /// Minimum delay applied between a task's awaited promise settling and
    /// the task resuming, when the task itself didn't ask for a longer one.
    pub fn resumption_interval(mut self, interval: Duration) -> Self {
        self.resumption_interval = interval;
        self
    }

    /// Bytes read per `libc::read` call while draining the wake pipe.
    pub fn wake_pipe_chunk_size(mut self, size: usize) -> Self {
        assert!(size > 0, "wake pipe chunk size must be positive");
        self.wake_pipe_chunk_size = size;
        self
    }

    /// Thread count used the first time a named pool is created with no
    /// explicit count of its own.
    pub fn default_pool_thread_count(mut self, count: usize) -> Self {
        assert!(count > 0, "a pool needs at least one thread");
        self.default_pool_thread_count = count;
        self
    }

    pub fn build(self) -> RuntimeConfig {
        RuntimeConfig {
            resumption_interval: self.resumption_interval,
            wake_pipe_chunk_size: self.wake_pipe_chunk_size,
            default_pool_thread_count: self.default_pool_thread_count,
        }
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolved runtime configuration. Cheap to clone and pass around; nothing
/// here is global state on its own, it just supplies defaults to the
/// functions in `task`, `dispatch`, and `workers` that need them.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub resumption_interval: Duration,
    pub wake_pipe_chunk_size: usize,
    pub default_pool_thread_count: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeBuilder::new().build()
    }
}

static GLOBAL: OnceLock<Mutex<RuntimeConfig>> = OnceLock::new();

fn global_cell() -> &'static Mutex<RuntimeConfig> {
    GLOBAL.get_or_init(|| Mutex::new(RuntimeConfig::default()))
}

impl RuntimeConfig {
    /// Installs this configuration as the process-wide default that
    /// `dispatch`, `workers`, and `task` fall back to wherever a caller
    /// didn't supply an explicit override of its own. Building a
    /// `RuntimeConfig` does not install it by itself; call this explicitly
    /// once, during startup.
    pub fn install(self) {
        *global_cell().lock().unwrap() = self;
    }

    /// The currently installed configuration, or the default if nothing has
    /// been installed yet.
    pub fn current() -> Self {
        global_cell().lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_apply() {
        let config = RuntimeBuilder::new()
            .resumption_interval(Duration::from_millis(10))
            .wake_pipe_chunk_size(128)
            .default_pool_thread_count(4)
            .build();
        assert_eq!(config.resumption_interval, Duration::from_millis(10));
        assert_eq!(config.wake_pipe_chunk_size, 128);
        assert_eq!(config.default_pool_thread_count, 4);
    }

    #[test]
    #[should_panic(expected = "at least one thread")]
    fn zero_thread_count_panics() {
        RuntimeBuilder::new().default_pool_thread_count(0);
    }

    #[test]
    fn installed_config_becomes_current() {
        RuntimeBuilder::new()
            .wake_pipe_chunk_size(256)
            .resumption_interval(Duration::from_millis(3))
            .build()
            .install();
        let current = RuntimeConfig::current();
        assert_eq!(current.wake_pipe_chunk_size, 256);
        assert_eq!(current.resumption_interval, Duration::from_millis(3));
    }
}
