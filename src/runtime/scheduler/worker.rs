//! Worker thread pool.

use super::global_queue::GlobalQueue;
use super::Scheduler;
use crate::error::BuildError;
use crate::fiber::cell::FiberCell;
use crate::runtime::config::RuntimeConfig;
use crate::tracing_compat::{debug, trace};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

/// Identifier for a pool worker.
pub(crate) type WorkerId = usize;

/// A fixed set of OS threads draining a shared run queue.
pub(crate) struct WorkerPool {
    queue: GlobalQueue<Arc<FiberCell>>,
    parker: Parker,
    shutdown: AtomicBool,
    threads: Mutex<Vec<(ThreadId, JoinHandle<()>)>>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("queued", &self.queue.len())
            .field("shutdown", &self.shutdown.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    /// Spawns `config.worker_threads` workers.
    pub(crate) fn start(config: &RuntimeConfig) -> Result<Arc<Self>, BuildError> {
        let pool = Arc::new(Self {
            queue: GlobalQueue::new(),
            parker: Parker::new(),
            shutdown: AtomicBool::new(false),
            threads: Mutex::new(Vec::with_capacity(config.worker_threads)),
        });
        for id in 0..config.worker_threads {
            let name = format!("{}-{id}", config.thread_name_prefix);
            let worker = Arc::clone(&pool);
            let on_start = config.on_thread_start.clone();
            let on_stop = config.on_thread_stop.clone();
            let spawned = thread::Builder::new()
                .name(name.clone())
                .stack_size(config.thread_stack_size)
                .spawn(move || {
                    if let Some(callback) = on_start {
                        callback();
                    }
                    worker.run_worker(id);
                    if let Some(callback) = on_stop {
                        callback();
                    }
                });
            match spawned {
                Ok(handle) => pool.threads.lock().push((handle.thread().id(), handle)),
                Err(e) => {
                    pool.shutdown();
                    return Err(BuildError::Spawn {
                        name,
                        reason: e.to_string(),
                    });
                }
            }
        }
        Ok(pool)
    }

    fn run_worker(&self, id: WorkerId) {
        debug!(worker_id = id, "worker started");
        while !self.shutdown.load(Ordering::Acquire) {
            if let Some(fiber) = self.queue.pop() {
                trace!(worker_id = id, fiber = %fiber.id(), "running fiber slice");
                fiber.run_slice();
                continue;
            }
            self.parker.park();
        }
        debug!(worker_id = id, "worker stopped");
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Stops all workers and joins them. Queued fibers are left unrun.
    ///
    /// When called from one of the pool's own threads, that thread is
    /// detached instead of joined.
    pub(crate) fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.parker.close();
        let current = thread::current().id();
        let threads = std::mem::take(&mut *self.threads.lock());
        for (id, handle) in threads {
            if id != current {
                let _ = handle.join();
            }
        }
        while self.queue.pop().is_some() {}
    }
}

impl Scheduler for WorkerPool {
    fn schedule(&self, fiber: Arc<FiberCell>) {
        if self.is_shutdown() {
            trace!(fiber = %fiber.id(), "pool shut down; dropping runnable fiber");
            return;
        }
        self.queue.push(fiber);
        self.parker.unpark();
    }
}

#[derive(Debug, Default)]
struct ParkState {
    permits: usize,
    closed: bool,
}

/// Counting parker for idle workers. Each `unpark` lets exactly one `park`
/// return, whether the parked call came before or after it.
#[derive(Debug, Default)]
pub(crate) struct Parker {
    state: Mutex<ParkState>,
    cvar: Condvar,
}

impl Parker {
    #[must_use]
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Parks the current thread until a permit is available or the parker
    /// is closed.
    pub(crate) fn park(&self) {
        let mut state = self.state.lock();
        while state.permits == 0 && !state.closed {
            self.cvar.wait(&mut state);
        }
        state.permits = state.permits.saturating_sub(1);
    }

    pub(crate) fn unpark(&self) {
        self.state.lock().permits += 1;
        self.cvar.notify_one();
    }

    /// Releases every parked thread, now and in the future.
    pub(crate) fn close(&self) {
        self.state.lock().closed = true;
        self.cvar.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn unpark_before_park_is_not_lost() {
        let parker = Parker::new();
        parker.unpark();
        parker.park();
    }

    #[test]
    fn close_releases_parked_thread() {
        let parker = Arc::new(Parker::new());
        let p = Arc::clone(&parker);
        let handle = thread::spawn(move || p.park());
        thread::sleep(Duration::from_millis(20));
        parker.close();
        handle.join().expect("parked thread should be released");
    }

    #[test]
    fn pool_runs_thread_callbacks() {
        let started = Arc::new(AtomicUsize::new(0));
        let stopped = Arc::new(AtomicUsize::new(0));
        let mut config = RuntimeConfig {
            worker_threads: 3,
            ..RuntimeConfig::default()
        };
        let s = Arc::clone(&started);
        config.on_thread_start = Some(Arc::new(move || {
            s.fetch_add(1, Ordering::SeqCst);
        }));
        let t = Arc::clone(&stopped);
        config.on_thread_stop = Some(Arc::new(move || {
            t.fetch_add(1, Ordering::SeqCst);
        }));

        let pool = WorkerPool::start(&config).expect("pool should start");
        pool.shutdown();

        assert_eq!(started.load(Ordering::SeqCst), 3);
        assert_eq!(stopped.load(Ordering::SeqCst), 3);
        assert!(pool.is_shutdown());
    }
}
