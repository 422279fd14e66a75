//! Scheduler driven by the thread calling `Runtime::run_sync`.

use super::worker::WorkerPool;
use super::Scheduler;
use crate::fiber::cell::FiberCell;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Default)]
struct Queue {
    ready: VecDeque<Arc<FiberCell>>,
    detached: bool,
}

/// Run queue owned by a synchronous caller.
///
/// While attached, scheduled fibers wait in a local queue that the caller
/// drains. Once the caller gives up (the root fiber suspended on something
/// only another thread can complete), the queue is detached: pending fibers
/// move to the pool and later schedules go straight there.
pub(crate) struct CurrentThread {
    queue: Mutex<Queue>,
    pool: Arc<WorkerPool>,
}

impl CurrentThread {
    pub(crate) fn new(pool: Arc<WorkerPool>) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(Queue::default()),
            pool,
        })
    }

    /// Takes the next runnable fiber, if any.
    pub(crate) fn next(&self) -> Option<Arc<FiberCell>> {
        self.queue.lock().ready.pop_front()
    }

    /// Hands all pending and future work to the pool.
    pub(crate) fn detach(&self) {
        let pending = {
            let mut queue = self.queue.lock();
            queue.detached = true;
            std::mem::take(&mut queue.ready)
        };
        for fiber in pending {
            self.pool.schedule(fiber);
        }
    }
}

impl Scheduler for CurrentThread {
    fn schedule(&self, fiber: Arc<FiberCell>) {
        let mut queue = self.queue.lock();
        if queue.detached {
            drop(queue);
            self.pool.schedule(fiber);
        } else {
            queue.ready.push_back(fiber);
        }
    }
}
