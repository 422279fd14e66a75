//! Shared state of a running fiber.
//!
//! A fiber is split in two halves. [`RunState`] (continuation stack, flag
//! stack, fiber refs) is touched only by the thread currently executing the
//! fiber's slice. `Shared` (status, pending resumption, interrupt requests,
//! exit, observers) is the handoff point for other threads: callbacks that
//! resume the fiber, interrupters and joiners.
//!
//! Scheduling protocol: a fiber sits in at most one run queue (`queued`) and
//! is executed by at most one thread (`running`). Whoever transitions a
//! fiber from "idle" to "has work" enqueues it exactly once.

use super::run_loop::{self, SliceEnd};
use crate::effect::instr::{Cont, FailCont, Instr};
use crate::fiber_ref::FiberRefs;
use crate::runtime::scheduler::Scheduler;
use crate::runtime::RuntimeInner;
use crate::tracing_compat::{debug, trace};
use crate::types::{AnyValue, BlockingOn, Cause, Exit, FiberId, FiberStatus};
use parking_lot::Mutex;
use smallvec::{smallvec, SmallVec};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub(crate) type ErasedExit = Exit<AnyValue, AnyValue>;
pub(crate) type Observer = Box<dyn FnOnce(&ErasedExit) + Send>;

/// Work delivered to a suspended fiber.
pub(crate) enum Resumption {
    /// Continue with this instruction.
    Effect(Arc<Instr>),
    /// The fiber was interrupted while parked interruptibly.
    Interrupt,
}

/// The next thing the run loop will process.
pub(crate) enum Step {
    Instr(Arc<Instr>),
    Value(AnyValue),
    Failure(Cause<AnyValue>),
}

/// A continuation stack frame.
pub(crate) enum Frame {
    FlatMap(Cont),
    Fold { on_failure: FailCont, on_success: Cont },
    /// Pops the interruptible flag pushed by `SetInterruptible`.
    RestoreInterruptible,
}

pub(crate) struct RunState {
    pub(crate) step: Option<Step>,
    pub(crate) stack: Vec<Frame>,
    pub(crate) interruptible: SmallVec<[bool; 8]>,
    pub(crate) refs: FiberRefs,
    pub(crate) children: BTreeSet<FiberId>,
    pub(crate) canceler: Option<Arc<Instr>>,
    pub(crate) children_drained: bool,
}

impl RunState {
    pub(crate) fn is_interruptible(&self) -> bool {
        self.interruptible.last().copied().unwrap_or(true)
    }
}

struct Shared {
    status: FiberStatus,
    running: bool,
    queued: bool,
    epoch: u64,
    resume: Option<Resumption>,
    interruptors: Cause<AnyValue>,
    exit: Option<ErasedExit>,
    final_refs: Option<FiberRefs>,
    observers: Vec<(u64, Observer)>,
    next_observer: u64,
}

impl Shared {
    /// Marks the fiber runnable. Returns true if the caller must enqueue it.
    fn make_runnable(&mut self) -> bool {
        if self.running || self.queued {
            return false;
        }
        self.queued = true;
        true
    }
}

pub(crate) struct FiberCell {
    id: FiberId,
    runtime: Arc<RuntimeInner>,
    scheduler: Arc<dyn Scheduler>,
    interrupted: AtomicBool,
    shared: Mutex<Shared>,
    run: Mutex<RunState>,
}

impl FiberCell {
    pub(crate) fn new(
        id: FiberId,
        runtime: Arc<RuntimeInner>,
        scheduler: Arc<dyn Scheduler>,
        refs: FiberRefs,
        effect: Arc<Instr>,
        interruptible: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            runtime,
            scheduler,
            interrupted: AtomicBool::new(false),
            shared: Mutex::new(Shared {
                status: FiberStatus::Running,
                running: false,
                queued: false,
                epoch: 0,
                resume: None,
                interruptors: Cause::Empty,
                exit: None,
                final_refs: None,
                observers: Vec::new(),
                next_observer: 0,
            }),
            run: Mutex::new(RunState {
                step: Some(Step::Instr(effect)),
                stack: Vec::new(),
                interruptible: smallvec![interruptible],
                refs,
                children: BTreeSet::new(),
                canceler: None,
                children_drained: false,
            }),
        })
    }

    pub(crate) fn id(&self) -> FiberId {
        self.id
    }

    pub(crate) fn runtime(&self) -> &Arc<RuntimeInner> {
        &self.runtime
    }

    pub(crate) fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.scheduler
    }

    /// Registers the fiber with the runtime and enqueues its first slice.
    pub(crate) fn start(self: &Arc<Self>) {
        self.runtime.fibers.insert(Arc::clone(self));
        debug!(fiber = %self.id, "fiber spawned");
        if self.shared.lock().make_runnable() {
            self.scheduler.schedule(Arc::clone(self));
        }
    }

    pub(crate) fn status(&self) -> FiberStatus {
        self.shared.lock().status
    }

    pub(crate) fn is_done(&self) -> bool {
        self.shared.lock().exit.is_some()
    }

    pub(crate) fn exit(&self) -> Option<ErasedExit> {
        self.shared.lock().exit.clone()
    }

    /// The fiber refs the fiber held when it finished.
    pub(crate) fn final_refs(&self) -> Option<FiberRefs> {
        self.shared.lock().final_refs.clone()
    }

    pub(crate) fn is_interrupt_pending(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    pub(crate) fn interrupt_cause(&self) -> Cause<AnyValue> {
        self.shared.lock().interruptors.clone()
    }

    /// Requests interruption on behalf of `by`.
    ///
    /// A fiber parked interruptibly is woken immediately; otherwise the
    /// request is delivered at its next interruptible checkpoint.
    pub(crate) fn interrupt_as(self: &Arc<Self>, by: FiberId) {
        let mut shared = self.shared.lock();
        if shared.exit.is_some() {
            return;
        }
        let previous = std::mem::replace(&mut shared.interruptors, Cause::Empty);
        shared.interruptors = previous.then(Cause::Interrupt(by));
        self.interrupted.store(true, Ordering::Release);
        debug!(fiber = %self.id, by = %by, "interrupt requested");
        let parked_interruptibly = matches!(
            shared.status,
            FiberStatus::Suspended {
                interruptible: true,
                ..
            }
        );
        if parked_interruptibly && shared.resume.is_none() {
            shared.epoch += 1;
            shared.resume = Some(Resumption::Interrupt);
            shared.status = FiberStatus::Running;
            if shared.make_runnable() {
                drop(shared);
                self.scheduler.schedule(Arc::clone(self));
            }
        }
    }

    /// Registers a completion observer. If the fiber already finished the
    /// observer runs immediately and `None` is returned.
    pub(crate) fn add_observer(&self, observer: Observer) -> Option<u64> {
        let mut shared = self.shared.lock();
        if let Some(exit) = shared.exit.clone() {
            drop(shared);
            observer(&exit);
            return None;
        }
        let key = shared.next_observer;
        shared.next_observer += 1;
        shared.observers.push((key, observer));
        Some(key)
    }

    pub(crate) fn remove_observer(&self, key: u64) {
        self.shared.lock().observers.retain(|(k, _)| *k != key);
    }

    /// Delivers the result of an async boundary. Stale or duplicate
    /// deliveries are ignored.
    fn resume(self: &Arc<Self>, epoch: u64, instr: Arc<Instr>) {
        let mut shared = self.shared.lock();
        let waiting = shared.epoch == epoch
            && shared.resume.is_none()
            && matches!(shared.status, FiberStatus::Suspended { .. });
        if !waiting {
            trace!(fiber = %self.id, epoch, "ignoring stale resume");
            return;
        }
        shared.resume = Some(Resumption::Effect(instr));
        shared.status = FiberStatus::Running;
        if shared.make_runnable() {
            drop(shared);
            self.scheduler.schedule(Arc::clone(self));
        }
    }

    /// Enters an async boundary. Returns the suspension epoch, or `None` if
    /// an interrupt must be delivered instead of suspending.
    pub(crate) fn begin_suspend(&self, blocking_on: BlockingOn, interruptible: bool) -> Option<u64> {
        let mut shared = self.shared.lock();
        if interruptible && self.interrupted.load(Ordering::Acquire) {
            return None;
        }
        shared.epoch += 1;
        shared.status = FiberStatus::Suspended {
            blocking_on,
            interruptible,
        };
        Some(shared.epoch)
    }

    /// Leaves the registration phase of an async boundary. Returns a
    /// resumption that arrived during registration, or parks the fiber.
    pub(crate) fn finish_suspend(&self) -> Option<Resumption> {
        let mut shared = self.shared.lock();
        if let Some(resumption) = shared.resume.take() {
            shared.status = FiberStatus::Running;
            return Some(resumption);
        }
        shared.running = false;
        None
    }

    /// Backs out of an async boundary whose registration failed. Any handle
    /// handed out during registration becomes stale.
    pub(crate) fn abandon_suspend(&self) {
        let mut shared = self.shared.lock();
        shared.epoch += 1;
        shared.status = FiberStatus::Running;
        shared.resume = None;
    }

    /// Executes one slice of the fiber on the calling thread.
    pub(crate) fn run_slice(self: &Arc<Self>) {
        let pending = {
            let mut shared = self.shared.lock();
            shared.queued = false;
            if shared.exit.is_some() || shared.running {
                return;
            }
            shared.running = true;
            shared.resume.take()
        };

        let mut run = self.run.lock();
        if let Some(resumption) = pending {
            let step = run_loop::resumption_step(self, &mut run, resumption);
            run.step = Some(step);
        }
        match run_loop::drive(self, &mut run) {
            SliceEnd::Yielded => {
                drop(run);
                let mut shared = self.shared.lock();
                shared.running = false;
                if shared.make_runnable() {
                    drop(shared);
                    self.scheduler.schedule(Arc::clone(self));
                }
            }
            SliceEnd::Suspended => {}
            SliceEnd::Done(exit) => {
                let refs = std::mem::take(&mut run.refs);
                drop(run);
                self.publish(exit, refs);
            }
        }
    }

    /// Completes a fiber that will never run again, without unwinding its
    /// stack. Used when the runtime shuts down with fibers still parked.
    pub(crate) fn abort(&self, cause: Cause<AnyValue>) {
        let refs = self.run.try_lock().map(|mut run| std::mem::take(&mut run.refs));
        self.publish(Exit::Failure(cause), refs.unwrap_or_default());
    }

    fn publish(&self, exit: ErasedExit, refs: FiberRefs) {
        let observers = {
            let mut shared = self.shared.lock();
            if shared.exit.is_some() {
                return;
            }
            shared.status = FiberStatus::Done;
            shared.exit = Some(exit.clone());
            shared.final_refs = Some(refs);
            shared.running = false;
            shared.resume = None;
            std::mem::take(&mut shared.observers)
        };
        self.runtime.fibers.remove(self.id);
        debug!(
            fiber = %self.id,
            success = exit.is_success(),
            interrupted = exit.is_interrupted(),
            "fiber completed"
        );
        for (_, observer) in observers {
            observer(&exit);
        }
    }
}

/// One-shot capability to resume a fiber suspended at an async boundary.
///
/// Consuming `self` makes a second resumption through the same handle
/// impossible; handles left over from an earlier suspension are ignored.
pub(crate) struct ResumeHandle {
    cell: Arc<FiberCell>,
    epoch: u64,
}

impl ResumeHandle {
    pub(crate) fn new(cell: Arc<FiberCell>, epoch: u64) -> Self {
        Self { cell, epoch }
    }

    pub(crate) fn fiber_id(&self) -> FiberId {
        self.cell.id
    }

    pub(crate) fn resume(self, instr: Arc<Instr>) {
        self.cell.resume(self.epoch, instr);
    }
}
