//! Running transactions on fibers.
//!
//! An attempt runs the body against a fresh journal. A consistent result is
//! committed; an attempt that saw a concurrent commit is rerun. An explicit
//! `retry` parks the fiber on every cell it read until one of them is
//! written by another commit.

use super::journal::Journal;
use super::{Stm, StmError};
use crate::effect::instr::{guard_value, Instr};
use crate::fiber::cell::ResumeHandle;
use crate::tracing_compat::trace;
use crate::types::{erase, BlockingOn, Cause, Value};
use parking_lot::Mutex;
use std::sync::Arc;

/// Attempts rerun back to back before the fiber yields to others.
const ATTEMPTS_BEFORE_YIELD: usize = 16;

enum WaiterState {
    Idle,
    Parked(ResumeHandle),
    Woken,
    Cancelled,
}

/// A fiber parked in `retry`. Waking is idempotent; only the first wake
/// resumes the fiber, and a cancelled waiter is never resumed.
pub(crate) struct Waiter {
    state: Mutex<WaiterState>,
}

impl Waiter {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(WaiterState::Idle),
        })
    }

    fn park(&self, handle: ResumeHandle) {
        *self.state.lock() = WaiterState::Parked(handle);
    }

    pub(crate) fn wake(&self) {
        let handle = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, WaiterState::Woken) {
                WaiterState::Parked(handle) => Some(handle),
                other => {
                    *state = other;
                    None
                }
            }
        };
        if let Some(handle) = handle {
            trace!(fiber = %handle.fiber_id(), "waking transaction");
            handle.resume(Instr::unit());
        }
    }

    fn cancel(&self) {
        *self.state.lock() = WaiterState::Cancelled;
    }
}

enum Attempt {
    Done(Arc<Instr>),
    Rerun,
    Wait(Journal),
}

/// Builds the instruction that commits `stm`, rerunning it as needed.
pub(crate) fn commit_instr<A: Value, E: Value>(stm: Stm<A, E>) -> Arc<Instr> {
    Instr::with_fiber(move |ctx| {
        for _ in 0..ATTEMPTS_BEFORE_YIELD {
            match attempt(&stm) {
                Attempt::Done(instr) => return instr,
                Attempt::Rerun => {
                    trace!(fiber = %ctx.id(), "transaction conflict, rerunning");
                }
                Attempt::Wait(journal) => {
                    trace!(fiber = %ctx.id(), cells = journal.len(), "transaction retry");
                    return Instr::then(wait_for_change(journal), commit_instr(stm.clone()));
                }
            }
        }
        Instr::then(Arc::new(Instr::Yield), commit_instr(stm.clone()))
    })
}

fn attempt<A: Value, E: Value>(stm: &Stm<A, E>) -> Attempt {
    let mut journal = Journal::default();
    let outcome = guard_value(|| (stm.run)(&mut journal));
    // Anything other than a successful commit is only meaningful if the
    // attempt saw a consistent snapshot.
    let failed = |cause: Cause<_>| {
        if journal.is_valid() {
            Attempt::Done(Instr::fail_cause(cause))
        } else {
            Attempt::Rerun
        }
    };
    match outcome {
        Ok(Ok(value)) => match journal.commit() {
            Ok(waiters) => {
                for waiter in waiters {
                    waiter.wake();
                }
                Attempt::Done(Instr::succeed(erase(value)))
            }
            Err(_) => Attempt::Rerun,
        },
        Ok(Err(StmError::Fail(error))) => failed(Cause::Fail(erase(error))),
        Ok(Err(StmError::Die(defect))) => failed(Cause::Die(defect)),
        Err(panic) => failed(panic),
        Ok(Err(StmError::Conflict)) => Attempt::Rerun,
        Ok(Err(StmError::Retry)) => {
            if journal.is_valid() {
                Attempt::Wait(journal)
            } else {
                Attempt::Rerun
            }
        }
    }
}

/// Suspends until a cell read by `journal` is committed by someone else.
/// With nothing read, only interruption ends the wait. However the wait
/// ends, the waiter is removed from every cell it was parked on.
fn wait_for_change(journal: Journal) -> Arc<Instr> {
    let journal = Arc::new(journal);
    let waiter = Waiter::new();
    let parked = {
        let journal = Arc::clone(&journal);
        let waiter = Arc::clone(&waiter);
        Instr::async_on(BlockingOn::Transaction, move |handle| {
            waiter.park(handle);
            if !journal.park(&waiter) {
                journal.unpark(&waiter);
                waiter.wake();
                return None;
            }
            let journal = Arc::clone(&journal);
            let waiter = Arc::clone(&waiter);
            Some(Instr::sync(move || {
                waiter.cancel();
                journal.unpark(&waiter);
                erase(())
            }))
        })
    };
    let unpark = Instr::sync(move || {
        journal.unpark(&waiter);
        erase(())
    });
    Instr::with_fiber(move |ctx| {
        let waiting = Instr::set_interruptible(Arc::clone(&parked), ctx.interruptible);
        let on_failure = Arc::clone(&unpark);
        let on_success = Arc::clone(&unpark);
        let guarded = Instr::fold(
            waiting,
            move |cause| Instr::then(Arc::clone(&on_failure), Instr::fail_cause(cause)),
            move |_| Arc::clone(&on_success),
        );
        Instr::set_interruptible(guarded, false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stm::TRef;
    use crate::test_utils::{init_test_logging, test_runtime};
    use crate::{assert_with_log, test_complete, test_phase};

    #[test]
    fn woken_waiter_leaves_every_read_cell() {
        init_test_logging();
        test_phase!("woken_waiter_leaves_every_read_cell");
        let runtime = test_runtime();
        let quiet = TRef::new(0_u8);
        let counter = TRef::new(0_u32);

        let wait_for_ten = quiet
            .get()
            .zip(counter.get())
            .flat_map(|(_, n)| Stm::check(n >= 10));
        let waiter = runtime.run_fork(wait_for_ten.commit());
        for _ in 0..10 {
            std::thread::sleep(std::time::Duration::from_millis(1));
            let bump = runtime.run_fork(counter.update(|n| n + 1).commit()).wait();
            assert!(bump.is_success());
        }
        assert!(waiter.wait().is_success());

        let left = quiet.waiter_count();
        assert_with_log!(left == 0, "no waiter left on the unwritten cell", 0, left);
        assert_eq!(counter.waiter_count(), 0);
        test_complete!("woken_waiter_leaves_every_read_cell");
    }

    #[test]
    fn interrupted_waiter_leaves_every_read_cell() {
        init_test_logging();
        test_phase!("interrupted_waiter_leaves_every_read_cell");
        let runtime = test_runtime();
        let cell = TRef::new(false);

        let blocked = cell.get().flat_map(Stm::check).commit();
        let fiber = runtime.run_fork(blocked);
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert_eq!(cell.waiter_count(), 1);
        assert!(fiber.interrupt().is_interrupted());
        assert_eq!(cell.waiter_count(), 0);
        test_complete!("interrupted_waiter_leaves_every_read_cell");
    }
}
