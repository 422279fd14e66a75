//! The trampolined interpreter.
//!
//! `drive` advances one fiber for at most `max_ops_before_yield` steps. The
//! continuation stack lives in [`RunState`], so arbitrarily deep sequencing
//! never grows the native stack.

use super::cell::{ErasedExit, FiberCell, Frame, Resumption, ResumeHandle, RunState, Step};
use super::await_exit_instr;
use crate::effect::instr::{guard, guard_value, FiberContext, ForkTarget, Instr, RegisterFn};
use crate::scope::Scope;
use crate::tracing_compat::trace;
use crate::types::{erase, AnyValue, BlockingOn, Cause, Defect, Exit, FiberId};
use std::sync::Arc;

/// Forked children are pruned from the parent's set once it grows past this.
const CHILD_PRUNE_THRESHOLD: usize = 64;

pub(crate) enum SliceEnd {
    /// Budget exhausted or explicit yield; the fiber must be re-enqueued.
    Yielded,
    /// Parked at an async boundary.
    Suspended,
    /// Finished with the given exit.
    Done(ErasedExit),
}

enum Eval {
    Next(Step),
    Yield,
    Suspended,
}

pub(crate) fn drive(cell: &Arc<FiberCell>, run: &mut RunState) -> SliceEnd {
    let budget = cell.runtime().config.max_ops_before_yield;
    let mut ops = 0_usize;
    loop {
        let mut step = run.step.take().unwrap_or_else(|| {
            Step::Failure(Cause::Die(Defect::new("fiber resumed without a step")))
        });
        if !matches!(step, Step::Failure(_)) && run.is_interruptible() && cell.is_interrupt_pending()
        {
            trace!(fiber = %cell.id(), "delivering interrupt");
            step = Step::Failure(cell.interrupt_cause());
        }
        if ops >= budget {
            run.step = Some(step);
            return SliceEnd::Yielded;
        }
        ops += 1;

        let next = match step {
            Step::Value(value) => match run.stack.pop() {
                None => match finish(cell, run, Exit::Success(value)) {
                    Some(end) => return end,
                    None => continue,
                },
                Some(Frame::FlatMap(cont)) => Step::Instr(guard(|| cont(value))),
                Some(Frame::Fold { on_success, .. }) => Step::Instr(guard(|| on_success(value))),
                Some(Frame::RestoreInterruptible) => {
                    run.interruptible.pop();
                    Step::Value(value)
                }
            },
            Step::Failure(cause) => match unwind(cell, run, cause) {
                Ok(step) => step,
                Err(cause) => match finish(cell, run, Exit::Failure(cause)) {
                    Some(end) => return end,
                    None => continue,
                },
            },
            Step::Instr(instr) => match eval(cell, run, &instr) {
                Eval::Next(step) => step,
                Eval::Yield => {
                    run.step = Some(Step::Value(erase(())));
                    return SliceEnd::Yielded;
                }
                Eval::Suspended => return SliceEnd::Suspended,
            },
        };
        run.step = Some(next);
    }
}

fn eval(cell: &Arc<FiberCell>, run: &mut RunState, instr: &Arc<Instr>) -> Eval {
    let step = match &**instr {
        Instr::Succeed(value) => Step::Value(Arc::clone(value)),
        Instr::Fail(cause) => Step::Failure(cause.clone()),
        Instr::Sync(f) => match guard_value(|| f()) {
            Ok(Ok(value)) => Step::Value(value),
            Ok(Err(cause)) | Err(cause) => Step::Failure(cause),
        },
        Instr::FlatMap { first, cont } => {
            run.stack.push(Frame::FlatMap(Arc::clone(cont)));
            Step::Instr(Arc::clone(first))
        }
        Instr::Fold {
            first,
            on_failure,
            on_success,
        } => {
            run.stack.push(Frame::Fold {
                on_failure: Arc::clone(on_failure),
                on_success: Arc::clone(on_success),
            });
            Step::Instr(Arc::clone(first))
        }
        Instr::SetInterruptible {
            effect,
            interruptible,
        } => {
            run.interruptible.push(*interruptible);
            run.stack.push(Frame::RestoreInterruptible);
            Step::Instr(Arc::clone(effect))
        }
        Instr::Yield => return Eval::Yield,
        Instr::UpdateFiberRefs(f) => {
            let id = cell.id();
            match guard_value(|| f(id, &mut run.refs)) {
                Ok(value) => Step::Value(value),
                Err(cause) => Step::Failure(cause),
            }
        }
        Instr::WithFiber(f) => {
            let ctx = FiberContext {
                cell,
                interruptible: run.is_interruptible(),
                refs: &run.refs,
            };
            Step::Instr(guard(|| f(&ctx)))
        }
        Instr::Fork { effect, target } => match guard_value(|| fork(cell, run, effect, target)) {
            Ok(child) => Step::Value(child),
            Err(cause) => Step::Failure(cause),
        },
        Instr::Async {
            register,
            blocking_on,
        } => return suspend(cell, run, register, *blocking_on),
    };
    Eval::Next(step)
}

/// Pops frames until a failure handler accepts the cause. Returns the cause
/// back when the stack is exhausted.
fn unwind(
    cell: &Arc<FiberCell>,
    run: &mut RunState,
    mut cause: Cause<AnyValue>,
) -> Result<Step, Cause<AnyValue>> {
    loop {
        match run.stack.pop() {
            None => return Err(cause),
            Some(Frame::FlatMap(_)) => {}
            Some(Frame::RestoreInterruptible) => {
                run.interruptible.pop();
            }
            Some(Frame::Fold { on_failure, .. }) => {
                if run.is_interruptible() && cell.is_interrupt_pending() {
                    // Handlers are skipped while an interrupt is being
                    // delivered; the interruption joins the cause.
                    if !cause.is_interrupted() {
                        cause = cause.then(cell.interrupt_cause());
                    }
                    continue;
                }
                return Ok(Step::Instr(guard(|| on_failure(cause))));
            }
        }
    }
}

/// Handles an empty continuation stack. Still-running children are
/// interrupted and awaited before the exit is published.
fn finish(cell: &Arc<FiberCell>, run: &mut RunState, exit: ErasedExit) -> Option<SliceEnd> {
    if !run.children_drained {
        run.children_drained = true;
        let fibers = &cell.runtime().fibers;
        let live: Vec<Arc<FiberCell>> = std::mem::take(&mut run.children)
            .into_iter()
            .filter_map(|id| fibers.get(id))
            .filter(|child| !child.is_done())
            .collect();
        if !live.is_empty() {
            trace!(fiber = %cell.id(), children = live.len(), "interrupting children");
            let by = cell.id();
            let mut drain = Instr::unit();
            for child in live {
                drain = Instr::then(drain, interrupt_and_await(by, child));
            }
            let drain = Instr::then(drain, instr_from_exit(exit));
            run.step = Some(Step::Instr(Instr::set_interruptible(drain, false)));
            return None;
        }
    }
    Some(SliceEnd::Done(exit))
}

pub(crate) fn instr_from_exit(exit: ErasedExit) -> Arc<Instr> {
    match exit {
        Exit::Success(value) => Instr::succeed(value),
        Exit::Failure(cause) => Instr::fail_cause(cause),
    }
}

/// Interrupts `target` on behalf of `by` and waits for it to finish.
pub(crate) fn interrupt_and_await(by: FiberId, target: Arc<FiberCell>) -> Arc<Instr> {
    let requester = Arc::clone(&target);
    let request = Instr::sync(move || {
        requester.interrupt_as(by);
        erase(())
    });
    Instr::then(request, await_exit_instr(target))
}

fn fork(
    cell: &Arc<FiberCell>,
    run: &mut RunState,
    effect: &Arc<Instr>,
    target: &ForkTarget,
) -> AnyValue {
    let runtime = cell.runtime();
    let child_id = FiberId::next();
    let child = FiberCell::new(
        child_id,
        Arc::clone(runtime),
        Arc::clone(cell.scheduler()),
        run.refs.fork_as(child_id),
        Arc::clone(effect),
        run.is_interruptible(),
    );
    match target {
        ForkTarget::Child => {
            if run.children.len() >= CHILD_PRUNE_THRESHOLD {
                run.children.retain(|id| runtime.fibers.contains(*id));
            }
            run.children.insert(child_id);
        }
        ForkTarget::Daemon => {}
        ForkTarget::Scope(scope) => supervise_in_scope(scope, &child, cell.id()),
    }
    trace!(parent = %cell.id(), child = %child_id, "forking fiber");
    child.start();
    erase(child)
}

/// Ties the child's lifetime to `scope`: closing the scope interrupts the
/// child, and the child's completion unregisters that finalizer.
fn supervise_in_scope(scope: &Scope, child: &Arc<FiberCell>, parent: FiberId) {
    let target = Arc::clone(child);
    let registered =
        scope.register_raw(Box::new(move |_exit| interrupt_and_await(parent, target)));
    match registered {
        Ok(key) => {
            let scope = scope.clone();
            child.add_observer(Box::new(move |_| scope.remove_finalizer(key)));
        }
        Err(_) => child.interrupt_as(parent),
    }
}

fn suspend(
    cell: &Arc<FiberCell>,
    run: &mut RunState,
    register: &RegisterFn,
    blocking_on: BlockingOn,
) -> Eval {
    let interruptible = run.is_interruptible();
    let Some(epoch) = cell.begin_suspend(blocking_on, interruptible) else {
        return Eval::Next(Step::Failure(cell.interrupt_cause()));
    };
    let handle = ResumeHandle::new(Arc::clone(cell), epoch);
    match guard_value(|| register(handle)) {
        Ok(canceler) => run.canceler = canceler,
        Err(cause) => {
            cell.abandon_suspend();
            return Eval::Next(Step::Failure(cause));
        }
    }
    match cell.finish_suspend() {
        Some(resumption) => Eval::Next(resumption_step(cell, run, resumption)),
        None => {
            trace!(fiber = %cell.id(), blocking_on = ?blocking_on, "fiber suspended");
            Eval::Suspended
        }
    }
}

/// Converts a delivered resumption into the next step. An interrupt runs the
/// canceler of the abandoned async boundary, uninterruptibly, first.
pub(crate) fn resumption_step(
    cell: &Arc<FiberCell>,
    run: &mut RunState,
    resumption: Resumption,
) -> Step {
    let canceler = run.canceler.take();
    match resumption {
        Resumption::Effect(instr) => Step::Instr(instr),
        Resumption::Interrupt => {
            let cause = cell.interrupt_cause();
            match canceler {
                Some(canceler) => {
                    let on_failure = cause.clone();
                    let cancel = Instr::fold(
                        canceler,
                        move |_| Instr::fail_cause(on_failure.clone()),
                        move |_| Instr::fail_cause(cause.clone()),
                    );
                    Step::Instr(Instr::set_interruptible(cancel, false))
                }
                None => Step::Failure(cause),
            }
        }
    }
}
