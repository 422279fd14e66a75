//! Fibers: lightweight, independently interruptible units of execution.
//!
//! A [`Fiber`] handle is obtained by forking an effect. Handles are cheap to
//! clone; the fiber itself lives until it finishes, independently of how
//! many handles exist.

pub(crate) mod cell;
pub(crate) mod run_loop;

pub(crate) use cell::ErasedExit;

use crate::effect::instr::Instr;
use crate::effect::Effect;
use crate::types::{erase, unerase, BlockingOn, Exit, FiberId, FiberStatus, Value};
use cell::FiberCell;
use std::convert::Infallible;
use std::marker::PhantomData;
use std::sync::Arc;

/// Handle to a forked fiber producing `A` or failing with `E`.
pub struct Fiber<A, E> {
    cell: Arc<FiberCell>,
    _marker: PhantomData<fn() -> (A, E)>,
}

impl<A, E> Clone for Fiber<A, E> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
            _marker: PhantomData,
        }
    }
}

impl<A, E> std::fmt::Debug for Fiber<A, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.cell.id())
            .field("status", &self.cell.status())
            .finish()
    }
}

impl<A: Value, E: Value> Fiber<A, E> {
    pub(crate) fn from_cell(cell: Arc<FiberCell>) -> Self {
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

    /// A snapshot of the fiber's status.
    #[must_use]
    pub fn status(&self) -> FiberStatus {
        self.cell.status()
    }

    /// Waits for the fiber to finish and returns its exit.
    #[must_use]
    pub fn await_exit(&self) -> Effect<Exit<A, E>, Infallible> {
        Effect::from_instr(typed_exit_instr::<A, E>(await_exit_instr(Arc::clone(
            &self.cell,
        ))))
    }

    /// Waits for the fiber, then succeeds or fails like it did. On success
    /// the fiber's refs are merged into the caller's.
    #[must_use]
    pub fn join(&self) -> Effect<A, E> {
        let cell = Arc::clone(&self.cell);
        Effect::from_instr(Instr::flat_map(
            await_exit_instr(Arc::clone(&self.cell)),
            move |v| match unerase::<ErasedExit>(v) {
                Exit::Success(value) => {
                    Instr::then(inherit_refs_instr(Arc::clone(&cell)), Instr::succeed(value))
                }
                Exit::Failure(cause) => Instr::fail_cause(cause),
            },
        ))
    }

    /// Interrupts the fiber on behalf of the caller and waits for it to
    /// finish.
    #[must_use]
    pub fn interrupt(&self) -> Effect<Exit<A, E>, Infallible> {
        let cell = Arc::clone(&self.cell);
        Effect::from_instr(typed_exit_instr::<A, E>(Instr::with_fiber(move |ctx| {
            run_loop::interrupt_and_await(ctx.id(), Arc::clone(&cell))
        })))
    }

    /// Interrupts the fiber on behalf of `by` and waits for it to finish.
    #[must_use]
    pub fn interrupt_as(&self, by: FiberId) -> Effect<Exit<A, E>, Infallible> {
        Effect::from_instr(typed_exit_instr::<A, E>(run_loop::interrupt_and_await(
            by,
            Arc::clone(&self.cell),
        )))
    }

    /// Requests interruption without waiting.
    #[must_use]
    pub fn interrupt_fork(&self) -> Effect<(), Infallible> {
        let cell = Arc::clone(&self.cell);
        Effect::from_instr(Instr::with_fiber(move |ctx| {
            cell.interrupt_as(ctx.id());
            Instr::unit()
        }))
    }

    /// Returns the exit if the fiber already finished.
    #[must_use]
    pub fn poll(&self) -> Effect<Option<Exit<A, E>>, Infallible> {
        let cell = Arc::clone(&self.cell);
        Effect::sync(move || cell.exit().map(typed_exit::<A, E>))
    }

    /// Merges the refs of a finished fiber into the caller's. Does nothing
    /// while the fiber is still running.
    #[must_use]
    pub fn inherit_all(&self) -> Effect<(), Infallible> {
        Effect::from_instr(inherit_refs_instr(Arc::clone(&self.cell)))
    }
}

pub(crate) fn typed_exit<A: Value, E: Value>(exit: ErasedExit) -> Exit<A, E> {
    exit.map(unerase::<A>).map_err(unerase::<E>)
}

fn typed_exit_instr<A: Value, E: Value>(erased: Arc<Instr>) -> Arc<Instr> {
    Instr::flat_map(erased, |v| {
        Instr::succeed(erase(typed_exit::<A, E>(unerase::<ErasedExit>(v))))
    })
}

/// Suspends until `target` finishes, producing its erased exit.
pub(crate) fn await_exit_instr(target: Arc<FiberCell>) -> Arc<Instr> {
    let blocking_on = BlockingOn::Fiber(target.id());
    Instr::async_on(blocking_on, move |handle| {
        let key = target.add_observer(Box::new(move |exit| {
            handle.resume(Instr::succeed(erase(exit.clone())));
        }));
        key.map(|key| {
            let target = Arc::clone(&target);
            Instr::sync(move || {
                target.remove_observer(key);
                erase(())
            })
        })
    })
}

/// Waits until either fiber finishes, producing the index of the first.
pub(crate) fn await_first_instr(cells: [Arc<FiberCell>; 2]) -> Arc<Instr> {
    let blocking_on = BlockingOn::Fiber(cells[0].id());
    Instr::async_on(blocking_on, move |handle| {
        let slot = Arc::new(parking_lot::Mutex::new(Some(handle)));
        let mut keys = Vec::with_capacity(cells.len());
        for (index, cell) in cells.iter().enumerate() {
            let slot = Arc::clone(&slot);
            let key = cell.add_observer(Box::new(move |_| {
                let handle = slot.lock().take();
                if let Some(handle) = handle {
                    handle.resume(Instr::succeed(erase(index)));
                }
            }));
            keys.push((Arc::clone(cell), key));
        }
        Some(Instr::sync(move || {
            for (cell, key) in &keys {
                if let Some(key) = key {
                    cell.remove_observer(*key);
                }
            }
            erase(())
        }))
    })
}

/// Joins the final refs of `child` into the running fiber's refs.
pub(crate) fn inherit_refs_instr(child: Arc<FiberCell>) -> Arc<Instr> {
    Instr::update_refs(move |id, refs| {
        if let Some(child_refs) = child.final_refs() {
            refs.join_as(id, &child_refs);
        }
        erase(())
    })
}
