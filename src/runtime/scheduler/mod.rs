//! Fiber scheduling.
//!
//! A scheduler receives fibers that have work to do and arranges for
//! [`FiberCell::run_slice`] to be called on some thread. Two
//! implementations exist:
//!
//! - [`worker::WorkerPool`]: a fixed pool of OS threads sharing a global
//!   FIFO injection queue.
//! - [`current_thread::CurrentThread`]: a queue drained by the thread that
//!   called `Runtime::run_sync`, which forwards to the pool once detached.

pub(crate) mod current_thread;
pub(crate) mod global_queue;
pub(crate) mod worker;

use crate::fiber::cell::FiberCell;
use std::sync::Arc;

/// Something that can run fiber slices.
pub(crate) trait Scheduler: Send + Sync {
    /// Enqueues a runnable fiber. Called at most once per idle-to-runnable
    /// transition of the fiber.
    fn schedule(&self, fiber: Arc<FiberCell>);
}
