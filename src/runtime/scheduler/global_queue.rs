//! Global injection queue.
//!
//! A thread-safe unbounded FIFO for runnable fibers, shared by every worker
//! of a pool.

use crossbeam_queue::SegQueue;

/// A global run queue.
#[derive(Debug)]
pub(crate) struct GlobalQueue<T> {
    inner: SegQueue<T>,
}

impl<T> Default for GlobalQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> GlobalQueue<T> {
    #[must_use]
    pub(crate) fn new() -> Self {
        Self {
            inner: SegQueue::new(),
        }
    }

    pub(crate) fn push(&self, item: T) {
        self.inner.push(item);
    }

    pub(crate) fn pop(&self) -> Option<T> {
        self.inner.pop()
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
