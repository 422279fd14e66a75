//! Timer heap and the thread that drives it.
//!
//! [`TimerHeap`] is a min-heap of deadlines keyed by registration. Cancelled
//! entries stay in the heap and are skipped when they surface, until they
//! outnumber the live ones and the heap is rebuilt.
//! [`TimerDriver`] owns a heap of resume handles and a thread that sleeps
//! until the earliest deadline, then resumes the fibers whose sleep ended.

use crate::effect::instr::Instr;
use crate::error::BuildError;
use crate::fiber::cell::ResumeHandle;
use crate::tracing_compat::{debug, trace};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// Heaps smaller than this are never compacted.
const COMPACT_MIN_ENTRIES: usize = 64;

/// A timer entry in the heap.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
struct TimerEntry {
    deadline: Instant,
    key: u64,
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for min-heap (earliest deadline first)
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.key.cmp(&self.key))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A min-heap of timers ordered by deadline, then registration order.
#[derive(Debug)]
pub(crate) struct TimerHeap<T> {
    heap: BinaryHeap<TimerEntry>,
    pending: HashMap<u64, T>,
    next_key: u64,
}

impl<T> Default for TimerHeap<T> {
    fn default() -> Self {
        Self {
            heap: BinaryHeap::new(),
            pending: HashMap::new(),
            next_key: 0,
        }
    }
}

impl<T> TimerHeap<T> {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Number of live (not cancelled, not fired) timers.
    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Registers `item` to fire at `deadline`. Returns the cancellation key.
    pub(crate) fn insert(&mut self, deadline: Instant, item: T) -> u64 {
        let key = self.next_key;
        self.next_key += 1;
        self.heap.push(TimerEntry { deadline, key });
        self.pending.insert(key, item);
        key
    }

    /// Removes a timer. Returns the item if it had not fired yet.
    pub(crate) fn cancel(&mut self, key: u64) -> Option<T> {
        let removed = self.pending.remove(&key);
        if self.heap.len() >= COMPACT_MIN_ENTRIES && self.heap.len() > 2 * self.pending.len() {
            let live = &self.pending;
            self.heap.retain(|entry| live.contains_key(&entry.key));
        }
        removed
    }

    #[cfg(test)]
    fn heap_entries(&self) -> usize {
        self.heap.len()
    }

    /// The earliest live deadline.
    pub(crate) fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(entry) = self.heap.peek() {
            if self.pending.contains_key(&entry.key) {
                return Some(entry.deadline);
            }
            self.heap.pop();
        }
        None
    }

    /// Removes and returns every item whose deadline is at or before `now`,
    /// earliest first.
    pub(crate) fn pop_expired(&mut self, now: Instant) -> Vec<T> {
        let mut expired = Vec::new();
        while let Some(entry) = self.heap.peek() {
            if entry.deadline > now {
                break;
            }
            let key = entry.key;
            self.heap.pop();
            if let Some(item) = self.pending.remove(&key) {
                expired.push(item);
            }
        }
        expired
    }
}

struct DriverState {
    timers: TimerHeap<ResumeHandle>,
    shutdown: bool,
}

struct DriverShared {
    state: Mutex<DriverState>,
    cvar: Condvar,
}

/// Background thread resuming sleeping fibers.
pub(crate) struct TimerDriver {
    shared: Arc<DriverShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TimerDriver {
    pub(crate) fn start(thread_name_prefix: &str) -> Result<Self, BuildError> {
        let shared = Arc::new(DriverShared {
            state: Mutex::new(DriverState {
                timers: TimerHeap::new(),
                shutdown: false,
            }),
            cvar: Condvar::new(),
        });
        let name = format!("{thread_name_prefix}-timer");
        let driver = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || drive(&driver))
            .map_err(|e| BuildError::Spawn {
                name,
                reason: e.to_string(),
            })?;
        Ok(Self {
            shared,
            thread: Mutex::new(Some(handle)),
        })
    }

    /// Resumes `handle` with unit once `deadline` has passed.
    pub(crate) fn schedule(&self, deadline: Instant, handle: ResumeHandle) -> u64 {
        trace!(fiber = %handle.fiber_id(), "timer registered");
        let key = self.shared.state.lock().timers.insert(deadline, handle);
        self.shared.cvar.notify_one();
        key
    }

    pub(crate) fn cancel(&self, key: u64) {
        let removed = self.shared.state.lock().timers.cancel(key);
        if removed.is_some() {
            trace!(key, "timer cancelled");
        }
    }

    pub(crate) fn pending(&self) -> usize {
        self.shared.state.lock().timers.len()
    }

    /// Stops the driver thread. Pending timers never fire.
    pub(crate) fn shutdown(&self) {
        let dropped = {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            std::mem::take(&mut state.timers)
        };
        self.shared.cvar.notify_all();
        drop(dropped);
        if let Some(handle) = self.thread.lock().take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

fn drive(shared: &DriverShared) {
    debug!("timer driver started");
    let mut state = shared.state.lock();
    loop {
        if state.shutdown {
            break;
        }
        let due = state.timers.pop_expired(Instant::now());
        if !due.is_empty() {
            MutexGuard::unlocked(&mut state, || {
                for handle in due {
                    trace!(fiber = %handle.fiber_id(), "timer fired");
                    handle.resume(Instr::unit());
                }
            });
            continue;
        }
        match state.timers.next_deadline() {
            Some(deadline) => {
                shared.cvar.wait_until(&mut state, deadline);
            }
            None => shared.cvar.wait(&mut state),
        }
    }
    debug!("timer driver stopped");
}
