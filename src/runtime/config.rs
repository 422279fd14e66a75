//! Runtime configuration types.
//!
//! These types hold the concrete values that drive runtime behavior. In most
//! cases you should use [`RuntimeBuilder`](super::builder::RuntimeBuilder) to
//! construct a runtime rather than creating a [`RuntimeConfig`] directly.
//!
//! # Defaults
//!
//! | Field | Default |
//! |-------|---------|
//! | `worker_threads` | available CPU parallelism |
//! | `thread_stack_size` | 2 MiB |
//! | `thread_name_prefix` | `"effectum-worker"` |
//! | `max_ops_before_yield` | 2048 |

use std::sync::Arc;

/// Default worker thread stack size.
pub const DEFAULT_THREAD_STACK_SIZE: usize = 2 * 1024 * 1024;
/// Default worker thread name prefix.
pub const DEFAULT_THREAD_NAME_PREFIX: &str = "effectum-worker";
/// Default number of instructions a fiber runs before yielding its thread.
pub const DEFAULT_MAX_OPS_BEFORE_YIELD: usize = 2048;

/// Callback run on runtime-owned threads.
pub type ThreadCallback = Arc<dyn Fn() + Send + Sync>;

/// Runtime configuration.
#[derive(Clone)]
pub struct RuntimeConfig {
    /// Number of worker threads (default: available parallelism).
    pub worker_threads: usize,
    /// Stack size per worker thread (default: 2MB).
    pub thread_stack_size: usize,
    /// Name prefix for worker threads.
    pub thread_name_prefix: String,
    /// Instructions a fiber may execute before it is re-enqueued behind the
    /// other runnable fibers.
    pub max_ops_before_yield: usize,
    /// Callback executed when a worker thread starts.
    pub on_thread_start: Option<ThreadCallback>,
    /// Callback executed when a worker thread stops.
    pub on_thread_stop: Option<ThreadCallback>,
}

impl std::fmt::Debug for RuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeConfig")
            .field("worker_threads", &self.worker_threads)
            .field("thread_stack_size", &self.thread_stack_size)
            .field("thread_name_prefix", &self.thread_name_prefix)
            .field("max_ops_before_yield", &self.max_ops_before_yield)
            .field("on_thread_start", &self.on_thread_start.is_some())
            .field("on_thread_stop", &self.on_thread_stop.is_some())
            .finish()
    }
}

impl RuntimeConfig {
    /// Normalize configuration values to safe defaults.
    pub fn normalize(&mut self) {
        if self.worker_threads == 0 {
            self.worker_threads = 1;
        }
        if self.thread_stack_size == 0 {
            self.thread_stack_size = DEFAULT_THREAD_STACK_SIZE;
        }
        if self.max_ops_before_yield == 0 {
            self.max_ops_before_yield = 1;
        }
        if self.thread_name_prefix.is_empty() {
            self.thread_name_prefix = DEFAULT_THREAD_NAME_PREFIX.to_string();
        }
    }

    pub(crate) fn default_worker_threads() -> usize {
        std::thread::available_parallelism()
            .map_or(1, std::num::NonZeroUsize::get)
            .max(1)
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_threads: Self::default_worker_threads(),
            thread_stack_size: DEFAULT_THREAD_STACK_SIZE,
            thread_name_prefix: DEFAULT_THREAD_NAME_PREFIX.to_string(),
            max_ops_before_yield: DEFAULT_MAX_OPS_BEFORE_YIELD,
            on_thread_start: None,
            on_thread_stop: None,
        }
    }
}
