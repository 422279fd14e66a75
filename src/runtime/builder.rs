//! Runtime builder and handles.

use crate::effect::Effect;
use crate::error::{BuildError, Error, ErrorKind, FiberFailure};
use crate::fiber::cell::FiberCell;
use crate::fiber::{typed_exit, ErasedExit, Fiber};
use crate::fiber_ref::{FiberRef, FiberRefs};
use crate::runtime::config::RuntimeConfig;
use crate::runtime::env_config;
use crate::runtime::fiber_table::FiberTable;
use crate::runtime::scheduler::current_thread::CurrentThread;
use crate::runtime::scheduler::worker::WorkerPool;
use crate::runtime::scheduler::Scheduler;
use crate::runtime::timer::TimerDriver;
use crate::scope::Scope;
use crate::tracing_compat::debug;
use crate::types::{Cause, Defect, Exit, FiberId, Value};
use parking_lot::{Condvar, Mutex};
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};
use std::thread::Thread;

/// Builder for constructing a runtime with custom configuration.
///
/// Every setter consumes the builder, so the last call in a chain wins.
/// Chaining `from_toml_*` first, then [`with_env_overrides`], then explicit
/// setters yields the documented precedence: programmatic values override
/// environment variables, which override the config file, which overrides
/// the defaults.
///
/// [`with_env_overrides`]: RuntimeBuilder::with_env_overrides
#[derive(Clone)]
pub struct RuntimeBuilder {
    config: RuntimeConfig,
}

impl RuntimeBuilder {
    /// Create a new builder with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: RuntimeConfig::default(),
        }
    }

    /// Set the number of worker threads.
    #[must_use]
    pub fn worker_threads(mut self, n: usize) -> Self {
        self.config.worker_threads = n;
        self
    }

    /// Set the worker thread stack size.
    #[must_use]
    pub fn thread_stack_size(mut self, size: usize) -> Self {
        self.config.thread_stack_size = size;
        self
    }

    /// Set the worker thread name prefix.
    #[must_use]
    pub fn thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.thread_name_prefix = prefix.into();
        self
    }

    /// Set how many instructions a fiber runs before yielding its thread.
    #[must_use]
    pub fn max_ops_before_yield(mut self, ops: usize) -> Self {
        self.config.max_ops_before_yield = ops;
        self
    }

    /// Register a callback to run when a worker thread starts.
    #[must_use]
    pub fn on_thread_start<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.config.on_thread_start = Some(Arc::new(f));
        self
    }

    /// Register a callback to run when a worker thread stops.
    #[must_use]
    pub fn on_thread_stop<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.config.on_thread_stop = Some(Arc::new(f));
        self
    }

    /// The configuration this builder would build with.
    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Build a runtime from this configuration.
    pub fn build(self) -> Result<Runtime, BuildError> {
        Runtime::with_config(self.config)
    }

    /// Runtime with a single worker thread.
    #[must_use]
    pub fn current_thread() -> Self {
        Self::new().worker_threads(1)
    }

    /// Multi-threaded runtime with defaults.
    #[must_use]
    pub fn multi_thread() -> Self {
        Self::new()
    }

    /// Builder seeded from the `EFFECTUM_*` environment variables.
    pub fn from_env() -> Result<Self, BuildError> {
        Self::new().with_env_overrides()
    }

    /// Applies the `EFFECTUM_*` environment variables that are set.
    pub fn with_env_overrides(mut self) -> Result<Self, BuildError> {
        env_config::apply_env_overrides(&mut self.config)?;
        Ok(self)
    }

    /// Builder seeded from a TOML document.
    #[cfg(feature = "config-file")]
    pub fn from_toml_str(toml: &str) -> Result<Self, BuildError> {
        let parsed = env_config::parse_toml_str(toml)?;
        let mut builder = Self::new();
        env_config::apply_toml_config(&mut builder.config, &parsed);
        Ok(builder)
    }

    /// Builder seeded from a TOML file.
    #[cfg(feature = "config-file")]
    pub fn from_toml(path: impl AsRef<std::path::Path>) -> Result<Self, BuildError> {
        let parsed = env_config::parse_toml_file(path.as_ref())?;
        let mut builder = Self::new();
        env_config::apply_toml_config(&mut builder.config, &parsed);
        Ok(builder)
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Runtime instance created from a [`RuntimeBuilder`].
///
/// Owns the worker pool, the timer driver and the table of live fibers.
/// Dropping the runtime stops its threads; fibers that have not finished by
/// then complete with a defect of kind [`ErrorKind::RuntimeShutdown`].
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.inner.config)
            .field("fibers", &self.inner.fibers.len())
            .field("pending_timers", &self.inner.timer.pending())
            .finish_non_exhaustive()
    }
}

impl Runtime {
    /// Construct a runtime from the given configuration.
    pub fn with_config(mut config: RuntimeConfig) -> Result<Self, BuildError> {
        config.normalize();
        let pool = WorkerPool::start(&config)?;
        let timer = match TimerDriver::start(&config.thread_name_prefix) {
            Ok(timer) => timer,
            Err(e) => {
                pool.shutdown();
                return Err(e);
            }
        };
        debug!(
            worker_threads = config.worker_threads,
            max_ops_before_yield = config.max_ops_before_yield,
            "runtime started"
        );
        Ok(Self {
            inner: Arc::new(RuntimeInner {
                config,
                pool,
                timer,
                fibers: FiberTable::new(),
                current_scope: FiberRef::new(None),
                shut_down: AtomicBool::new(false),
            }),
        })
    }

    /// Returns a reference to the runtime configuration.
    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// Starts `effect` on the worker pool and returns a handle to it.
    pub fn run_fork<A: Value, E: Value>(&self, effect: Effect<A, E>) -> RuntimeFiber<A, E> {
        let pool: Arc<dyn Scheduler> = self.inner.pool.clone();
        let cell = self.inner.root_fiber(pool, effect);
        cell.start();
        RuntimeFiber::new(cell)
    }

    /// Starts `effect` on the worker pool and returns a future of its exit.
    pub fn run_future<A: Value, E: Value>(&self, effect: Effect<A, E>) -> ExitFuture<A, E> {
        self.run_fork(effect).into_future()
    }

    /// Runs `effect` on the calling thread and returns its exit.
    ///
    /// If the root fiber suspends on something only another thread can
    /// complete (a timer, a callback, a transaction waiting for a commit),
    /// the call returns a defect of kind [`ErrorKind::AsyncRequired`] and
    /// the remaining work continues on the worker pool.
    pub fn run_sync_exit<A: Value, E: Value>(&self, effect: Effect<A, E>) -> Exit<A, E> {
        let local = CurrentThread::new(Arc::clone(&self.inner.pool));
        let scheduler: Arc<dyn Scheduler> = local.clone();
        let cell = self.inner.root_fiber(scheduler, effect);
        cell.start();
        // Fibers the root leaves behind (daemons, scope-forked fibers) must
        // not hold the caller once the root is done.
        while !cell.is_done() {
            let Some(fiber) = local.next() else { break };
            fiber.run_slice();
        }
        local.detach();
        if let Some(exit) = cell.exit() {
            return typed_exit(exit);
        }
        debug!(fiber = %cell.id(), "run_sync root fiber suspended; handing off to pool");
        let error = Error::new(ErrorKind::AsyncRequired)
            .with_message("run_sync cannot complete an effect that suspends");
        Exit::die(Defect::from_error(&error))
    }

    /// Runs `effect` on the calling thread, returning its value or the full
    /// cause of its failure.
    pub fn run_sync<A: Value, E: Value>(&self, effect: Effect<A, E>) -> Result<A, FiberFailure<E>> {
        self.run_sync_exit(effect)
            .into_result()
            .map_err(FiberFailure::new)
    }

    /// Runs `effect` inside a fresh root scope that is closed with the
    /// effect's exit, blocking until both finish.
    pub fn run_scoped<A: Value, E: Value>(&self, effect: Effect<A, E>) -> Exit<A, E> {
        self.run_fork(Scope::root().use_(effect)).wait()
    }

    /// Drives a future to completion on the calling thread.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        run_future_on_thread(future)
    }

    /// Number of fibers that have started and not finished.
    #[must_use]
    pub fn fiber_count(&self) -> usize {
        self.inner.fibers.len()
    }

    /// Ids of the live fibers, oldest first.
    #[must_use]
    pub fn fiber_ids(&self) -> Vec<FiberId> {
        self.inner.fibers.ids()
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

pub(crate) struct RuntimeInner {
    pub(crate) config: RuntimeConfig,
    pub(crate) pool: Arc<WorkerPool>,
    pub(crate) timer: TimerDriver,
    pub(crate) fibers: FiberTable,
    /// The scope scoped operations register with.
    pub(crate) current_scope: FiberRef<Option<Scope>>,
    shut_down: AtomicBool,
}

impl RuntimeInner {
    fn root_fiber<A: Value, E: Value>(
        self: &Arc<Self>,
        scheduler: Arc<dyn Scheduler>,
        effect: Effect<A, E>,
    ) -> Arc<FiberCell> {
        FiberCell::new(
            FiberId::next(),
            Arc::clone(self),
            scheduler,
            FiberRefs::default(),
            effect.into_instr(),
            true,
        )
    }

    fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(live_fibers = self.fibers.len(), "runtime shutting down");
        self.pool.shutdown();
        self.timer.shutdown();
        let error = Error::new(ErrorKind::RuntimeShutdown)
            .with_message("runtime dropped before the fiber finished");
        for fiber in self.fibers.drain() {
            fiber.abort(Cause::die(Defect::from_error(&error)));
        }
    }
}

/// Host-side handle to a fiber started with [`Runtime::run_fork`].
pub struct RuntimeFiber<A, E> {
    cell: Arc<FiberCell>,
    _marker: PhantomData<fn() -> (A, E)>,
}

impl<A, E> std::fmt::Debug for RuntimeFiber<A, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeFiber")
            .field("id", &self.cell.id())
            .field("status", &self.cell.status())
            .finish()
    }
}

impl<A: Value, E: Value> RuntimeFiber<A, E> {
    fn new(cell: Arc<FiberCell>) -> Self {
        Self {
            cell,
            _marker: PhantomData,
        }
    }

    /// The fiber's id.
    #[must_use]
    pub fn id(&self) -> FiberId {
        self.cell.id()
    }

    /// A fiber handle usable from inside other effects.
    #[must_use]
    pub fn fiber(&self) -> Fiber<A, E> {
        Fiber::from_cell(Arc::clone(&self.cell))
    }

    /// The exit, if the fiber has finished.
    #[must_use]
    pub fn try_exit(&self) -> Option<Exit<A, E>> {
        self.cell.exit().map(typed_exit)
    }

    /// Blocks the calling thread until the fiber finishes.
    ///
    /// Must not be called from a fiber running on the same runtime's pool
    /// when that pool has a single worker.
    pub fn wait(&self) -> Exit<A, E> {
        let slot = Arc::new((Mutex::new(None::<ErasedExit>), Condvar::new()));
        let observer = Arc::clone(&slot);
        self.cell.add_observer(Box::new(move |exit| {
            *observer.0.lock() = Some(exit.clone());
            observer.1.notify_all();
        }));
        let (lock, cvar) = &*slot;
        let mut guard = lock.lock();
        loop {
            if let Some(exit) = guard.take() {
                return typed_exit(exit);
            }
            cvar.wait(&mut guard);
        }
    }

    /// Interrupts the fiber from outside any fiber and waits for it to
    /// finish running its finalizers.
    pub fn interrupt(&self) -> Exit<A, E> {
        self.cell.interrupt_as(FiberId::NONE);
        self.wait()
    }

    /// Converts the handle into a future of the fiber's exit.
    #[must_use]
    pub fn into_future(self) -> ExitFuture<A, E> {
        let state = Arc::new(Mutex::new(JoinState::<A, E> {
            exit: None,
            waker: None,
        }));
        let observer = Arc::clone(&state);
        self.cell.add_observer(Box::new(move |exit| {
            let waker = {
                let mut guard = observer.lock();
                guard.exit = Some(typed_exit(exit.clone()));
                guard.waker.take()
            };
            if let Some(waker) = waker {
                waker.wake();
            }
        }));
        ExitFuture { state }
    }
}

struct JoinState<A, E> {
    exit: Option<Exit<A, E>>,
    waker: Option<Waker>,
}

/// Future returned by [`Runtime::run_future`] and
/// [`RuntimeFiber::into_future`].
pub struct ExitFuture<A, E> {
    state: Arc<Mutex<JoinState<A, E>>>,
}

impl<A, E> ExitFuture<A, E> {
    /// Returns true if the fiber has completed.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.state.lock().exit.is_some()
    }
}

impl<A, E> Future for ExitFuture<A, E> {
    type Output = Exit<A, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut guard = self.state.lock();
        guard.exit.take().map_or_else(
            || {
                guard.waker = Some(cx.waker().clone());
                Poll::Pending
            },
            Poll::Ready,
        )
    }
}

struct ThreadWaker {
    thread: Thread,
}

impl Wake for ThreadWaker {
    fn wake(self: Arc<Self>) {
        self.thread.unpark();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.thread.unpark();
    }
}

fn run_future_on_thread<F: Future>(future: F) -> F::Output {
    let waker = Waker::from(Arc::new(ThreadWaker {
        thread: std::thread::current(),
    }));
    let mut cx = Context::from_waker(&waker);
    let mut future = std::pin::pin!(future);
    loop {
        match future.as_mut().poll(&mut cx) {
            Poll::Ready(output) => return output,
            Poll::Pending => std::thread::park(),
        }
    }
}
