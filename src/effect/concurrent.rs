//! Forking and concurrent composition.
//!
//! Both `zip_par` and `race` fork their operands as children of the calling
//! fiber and settle on whichever finishes first. Concurrent failures are
//! combined with [`Cause::both`], so neither side's failure is lost.

use super::instr::{ForkTarget, Instr};
use super::Effect;
use crate::error::{Error, ErrorKind};
use crate::fiber::cell::FiberCell;
use crate::fiber::run_loop::interrupt_and_await;
use crate::fiber::{await_exit_instr, await_first_instr, inherit_refs_instr, ErasedExit, Fiber};
use crate::scope::{current_scope, Scope};
use crate::types::{erase, unerase, AnyValue, Cause, Defect, Exit, FiberId, Value};
use std::convert::Infallible;
use std::sync::Arc;

type Settle = fn(FiberId, [Arc<FiberCell>; 2], usize) -> Arc<Instr>;

fn fork_instr(effect: Arc<Instr>, target: ForkTarget) -> Arc<Instr> {
    Arc::new(Instr::Fork { effect, target })
}

impl<A: Value, E: Value> Effect<A, E> {
    /// Starts the effect on a new child fiber.
    ///
    /// When the calling fiber finishes, still-running children are
    /// interrupted and awaited before its exit is published.
    #[must_use]
    pub fn fork(self) -> Effect<Fiber<A, E>, Infallible> {
        self.fork_with(ForkTarget::Child)
    }

    /// Starts the effect on a fiber that nobody supervises.
    #[must_use]
    pub fn fork_daemon(self) -> Effect<Fiber<A, E>, Infallible> {
        self.fork_with(ForkTarget::Daemon)
    }

    /// Starts the effect on a fiber that is interrupted when `scope` closes.
    #[must_use]
    pub fn fork_in(self, scope: &Scope) -> Effect<Fiber<A, E>, Infallible> {
        self.fork_with(ForkTarget::Scope(scope.clone()))
    }

    /// Starts the effect on a fiber supervised by the enclosing scope. Dies
    /// if there is none.
    #[must_use]
    pub fn fork_scoped(self) -> Effect<Fiber<A, E>, Infallible> {
        let effect = self.into_instr();
        Effect::from_instr(Instr::with_fiber(move |ctx| match current_scope(ctx) {
            Some(scope) => typed_fork::<A, E>(Arc::clone(&effect), ForkTarget::Scope(scope)),
            None => Instr::die(Defect::from_error(
                &Error::new(ErrorKind::NoEnclosingScope).with_message("fork_scoped"),
            )),
        }))
    }

    fn fork_with(self, target: ForkTarget) -> Effect<Fiber<A, E>, Infallible> {
        Effect::from_instr(typed_fork::<A, E>(self.into_instr(), target))
    }

    /// Runs both effects concurrently and pairs their results.
    ///
    /// If one fails the other is interrupted; if both fail the causes are
    /// combined in parallel.
    #[must_use]
    pub fn zip_par<B: Value>(self, that: Effect<B, E>) -> Effect<(A, B), E> {
        Effect::from_instr(race_pair(
            self.into_instr(),
            that.into_instr(),
            settle_zip::<A, B>,
        ))
    }

    /// Runs both effects concurrently; the first success wins and the loser
    /// is interrupted. Fails only if both fail.
    #[must_use]
    pub fn race(self, that: Self) -> Self {
        Self::from_instr(race_pair(self.into_instr(), that.into_instr(), settle_race))
    }
}

impl<B: Value, E: Value> Effect<Vec<B>, E> {
    /// Runs all effects concurrently, preserving input order in the result.
    #[must_use]
    pub fn all_par(mut effects: Vec<Effect<B, E>>) -> Self {
        match effects.len() {
            0 => Self::succeed(Vec::new()),
            1 => match effects.pop() {
                Some(effect) => effect.map(|b| vec![b]),
                None => Self::succeed(Vec::new()),
            },
            n => {
                let right = effects.split_off(n / 2);
                Self::all_par(effects)
                    .zip_par(Self::all_par(right))
                    .map(|(mut left, right)| {
                        left.extend(right);
                        left
                    })
            }
        }
    }

    /// Runs `f` on every item concurrently.
    #[must_use]
    pub fn for_each_par<T, I, F>(items: I, f: F) -> Self
    where
        T: Value,
        I: IntoIterator<Item = T>,
        F: Fn(T) -> Effect<B, E>,
    {
        Self::all_par(items.into_iter().map(f).collect())
    }
}

fn typed_fork<A: Value, E: Value>(effect: Arc<Instr>, target: ForkTarget) -> Arc<Instr> {
    Instr::flat_map(fork_instr(effect, target), |v| {
        Instr::succeed(erase(Fiber::<A, E>::from_cell(unerase::<Arc<FiberCell>>(v))))
    })
}

/// Forks both operands as children, waits for the first to finish and lets
/// `settle` decide. The operands keep the caller's interruptibility; the
/// bookkeeping around them does not, so an interrupted caller always stops
/// both children before unwinding further.
fn race_pair(left: Arc<Instr>, right: Arc<Instr>, settle: Settle) -> Arc<Instr> {
    Instr::with_fiber(move |ctx| {
        let by = ctx.id();
        let restore = ctx.interruptible;
        let left = Instr::set_interruptible(Arc::clone(&left), restore);
        let right = Instr::set_interruptible(Arc::clone(&right), restore);
        let forked = Instr::flat_map(fork_instr(left, ForkTarget::Child), move |lv| {
            Instr::flat_map(fork_instr(Arc::clone(&right), ForkTarget::Child), {
                let lv = Arc::clone(&lv);
                move |rv| {
                    let cells = [
                        unerase::<Arc<FiberCell>>(Arc::clone(&lv)),
                        unerase::<Arc<FiberCell>>(rv),
                    ];
                    supervise_pair(by, cells, restore, settle)
                }
            })
        });
        Instr::set_interruptible(forked, false)
    })
}

fn supervise_pair(
    by: FiberId,
    cells: [Arc<FiberCell>; 2],
    restore: bool,
    settle: Settle,
) -> Arc<Instr> {
    let settling = cells.clone();
    let waiting = Instr::flat_map(await_first_instr(cells.clone()), move |index| {
        settle(by, settling.clone(), unerase::<usize>(index))
    });
    Instr::fold(
        Instr::set_interruptible(waiting, restore),
        move |cause| {
            let [left, right] = cells.clone();
            let stop = Instr::then(
                interrupt_and_await(by, left),
                interrupt_and_await(by, right),
            );
            Instr::then(stop, Instr::fail_cause(cause))
        },
        Instr::succeed,
    )
}

fn ordered(cells: [Arc<FiberCell>; 2], first: usize) -> (Arc<FiberCell>, Arc<FiberCell>) {
    let [left, right] = cells;
    if first == 0 {
        (left, right)
    } else {
        (right, left)
    }
}

fn missing_exit() -> Arc<Instr> {
    Instr::die(Defect::from_error(
        &Error::new(ErrorKind::Internal).with_message("completed fiber has no exit"),
    ))
}

fn cause_of(exit: Option<ErasedExit>) -> Cause<AnyValue> {
    match exit {
        Some(Exit::Failure(cause)) => cause,
        Some(Exit::Success(_)) | None => Cause::Empty,
    }
}

/// Adds the loser's cause to the winner's unless the loser merely
/// observed the interruption it was sent.
fn merge_loser(first: Cause<AnyValue>, loser: ErasedExit) -> Cause<AnyValue> {
    match loser {
        Exit::Failure(cause) if !cause.is_interrupted_only() => first.both(cause),
        _ => first,
    }
}

fn settle_zip<A: Value, B: Value>(by: FiberId, cells: [Arc<FiberCell>; 2], first: usize) -> Arc<Instr> {
    let (winner, other) = ordered(cells.clone(), first);
    match winner.exit() {
        Some(Exit::Failure(cause)) => Instr::flat_map(interrupt_and_await(by, other), move |v| {
            Instr::fail_cause(merge_loser(cause.clone(), unerase::<ErasedExit>(v)))
        }),
        Some(Exit::Success(_)) => Instr::flat_map(await_exit_instr(other), move |_| {
            let [left, right] = cells.clone();
            match (left.exit(), right.exit()) {
                (Some(Exit::Success(a)), Some(Exit::Success(b))) => {
                    let pair = erase((unerase::<A>(a), unerase::<B>(b)));
                    Instr::then(
                        Instr::then(inherit_refs_instr(left), inherit_refs_instr(right)),
                        Instr::succeed(pair),
                    )
                }
                (l, r) => {
                    let cause = cause_of(l).both(cause_of(r));
                    if cause.is_empty() {
                        missing_exit()
                    } else {
                        Instr::fail_cause(cause)
                    }
                }
            }
        }),
        None => missing_exit(),
    }
}

fn settle_race(by: FiberId, cells: [Arc<FiberCell>; 2], first: usize) -> Arc<Instr> {
    let (winner, other) = ordered(cells, first);
    match winner.exit() {
        Some(Exit::Success(value)) => Instr::then(
            interrupt_and_await(by, other),
            Instr::then(inherit_refs_instr(winner), Instr::succeed(value)),
        ),
        Some(Exit::Failure(cause)) => {
            let loser = Arc::clone(&other);
            Instr::flat_map(await_exit_instr(other), move |v| {
                match unerase::<ErasedExit>(v) {
                    Exit::Success(value) => Instr::then(
                        inherit_refs_instr(Arc::clone(&loser)),
                        Instr::succeed(value),
                    ),
                    Exit::Failure(second) => Instr::fail_cause(cause.clone().both(second)),
                }
            })
        }
        None => missing_exit(),
    }
}
