//! Software transactional memory.
//!
//! A [`Stm<A, E>`] describes a transaction over [`TRef`] cells. Committing
//! it with [`Stm::commit`] yields an [`Effect`] that runs the body
//! optimistically against a private [`Journal`] and publishes its writes
//! atomically. Transactions compose: everything combined into one `Stm`
//! commits or retries as a unit.
//!
//! Typed failures abort the transaction without publishing anything. Only
//! conflicts with concurrent commits cause an automatic rerun; an explicit
//! [`Stm::retry`] parks the fiber until one of the cells it read changes.
//!
//! ```rust,ignore
//! let balance = TRef::new(100_u64);
//! let withdraw = |amount: u64| {
//!     let balance = balance.clone();
//!     balance.get().flat_map(move |b| {
//!         Stm::check(b >= amount).and_then(balance.set(b - amount))
//!     })
//! };
//! runtime.run_sync(withdraw(30).commit());
//! ```

mod commit;
mod journal;
mod tref;

pub use journal::{Conflict, Journal};
pub use tref::TRef;

use crate::effect::Effect;
use crate::types::{Defect, Value};
use core::fmt;
use std::convert::Infallible;
use std::sync::Arc;

/// Why a transaction attempt did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StmError<E> {
    /// A typed failure; aborts the transaction.
    Fail(E),
    /// Wait until a cell read so far changes, then rerun.
    Retry,
    /// A defect; aborts the transaction.
    Die(Defect),
    /// The journal became inconsistent; rerun immediately.
    Conflict,
}

impl<E> From<Conflict> for StmError<E> {
    fn from(_: Conflict) -> Self {
        Self::Conflict
    }
}

type Body<A, E> = Arc<dyn Fn(&mut Journal) -> Result<A, StmError<E>> + Send + Sync>;

/// A transaction producing `A` or failing with `E`.
pub struct Stm<A, E = Infallible> {
    run: Body<A, E>,
}

impl<A, E> Clone for Stm<A, E> {
    fn clone(&self) -> Self {
        Self {
            run: Arc::clone(&self.run),
        }
    }
}

impl<A, E> fmt::Debug for Stm<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stm").finish_non_exhaustive()
    }
}

impl<E: Value> Stm<(), E> {
    /// Retries unless `condition` holds.
    #[must_use]
    pub fn check(condition: bool) -> Self {
        Self::new(move |_| {
            if condition {
                Ok(())
            } else {
                Err(StmError::Retry)
            }
        })
    }
}

impl<A: Value> Stm<A, Infallible> {
    /// Lifts a transaction that cannot fail into any error type.
    #[must_use]
    pub fn widen<E2: Value>(self) -> Stm<A, E2> {
        Stm::new(move |journal| match (self.run)(journal) {
            Ok(value) => Ok(value),
            Err(StmError::Fail(never)) => match never {},
            Err(StmError::Retry) => Err(StmError::Retry),
            Err(StmError::Die(defect)) => Err(StmError::Die(defect)),
            Err(StmError::Conflict) => Err(StmError::Conflict),
        })
    }
}

impl<A: Value, E: Value> Stm<A, E> {
    /// A transaction running `body` against the journal.
    #[must_use]
    pub fn new<F>(body: F) -> Self
    where
        F: Fn(&mut Journal) -> Result<A, StmError<E>> + Send + Sync + 'static,
    {
        Self {
            run: Arc::new(body),
        }
    }

    /// A transaction producing `value`.
    #[must_use]
    pub fn succeed(value: A) -> Self {
        Self::new(move |_| Ok(value.clone()))
    }

    /// A transaction failing with `error`.
    #[must_use]
    pub fn fail(error: E) -> Self {
        Self::new(move |_| Err(StmError::Fail(error.clone())))
    }

    /// A transaction dying with `defect`.
    #[must_use]
    pub fn die(defect: Defect) -> Self {
        Self::new(move |_| Err(StmError::Die(defect.clone())))
    }

    /// Abandons the attempt and waits for a cell read so far to change.
    #[must_use]
    pub fn retry() -> Self {
        Self::new(|_| Err(StmError::Retry))
    }

    /// Builds the transaction lazily on every attempt.
    #[must_use]
    pub fn suspend<F>(f: F) -> Self
    where
        F: Fn() -> Self + Send + Sync + 'static,
    {
        Self::new(move |journal| (f().run)(journal))
    }

    /// Transforms the result.
    #[must_use]
    pub fn map<B: Value, F>(self, f: F) -> Stm<B, E>
    where
        F: Fn(A) -> B + Send + Sync + 'static,
    {
        Stm::new(move |journal| (self.run)(journal).map(&f))
    }

    /// Sequences another transaction built from the result.
    #[must_use]
    pub fn flat_map<B: Value, F>(self, f: F) -> Stm<B, E>
    where
        F: Fn(A) -> Stm<B, E> + Send + Sync + 'static,
    {
        Stm::new(move |journal| {
            let a = (self.run)(journal)?;
            (f(a).run)(journal)
        })
    }

    /// Runs `that` after `self`, keeping the result of `that`.
    #[must_use]
    pub fn and_then<B: Value>(self, that: Stm<B, E>) -> Stm<B, E> {
        Stm::new(move |journal| {
            (self.run)(journal)?;
            (that.run)(journal)
        })
    }

    /// Runs both transactions, pairing their results.
    #[must_use]
    pub fn zip<B: Value>(self, that: Stm<B, E>) -> Stm<(A, B), E> {
        self.zip_with(that, |a, b| (a, b))
    }

    /// Runs both transactions, combining their results with `f`.
    #[must_use]
    pub fn zip_with<B: Value, C: Value, F>(self, that: Stm<B, E>, f: F) -> Stm<C, E>
    where
        F: Fn(A, B) -> C + Send + Sync + 'static,
    {
        Stm::new(move |journal| {
            let a = (self.run)(journal)?;
            let b = (that.run)(journal)?;
            Ok(f(a, b))
        })
    }

    /// Transforms the typed failure.
    #[must_use]
    pub fn map_err<E2: Value, F>(self, f: F) -> Stm<A, E2>
    where
        F: Fn(E) -> E2 + Send + Sync + 'static,
    {
        Stm::new(move |journal| {
            (self.run)(journal).map_err(|error| match error {
                StmError::Fail(e) => StmError::Fail(f(e)),
                StmError::Retry => StmError::Retry,
                StmError::Die(defect) => StmError::Die(defect),
                StmError::Conflict => StmError::Conflict,
            })
        })
    }

    /// Recovers from a typed failure. Writes made by the failed transaction
    /// are rolled back before `f` runs.
    #[must_use]
    pub fn catch_all<E2: Value, F>(self, f: F) -> Stm<A, E2>
    where
        F: Fn(E) -> Stm<A, E2> + Send + Sync + 'static,
    {
        Stm::new(move |journal| {
            let checkpoint = journal.checkpoint();
            match (self.run)(journal) {
                Ok(value) => Ok(value),
                Err(StmError::Fail(e)) => {
                    journal.rollback(checkpoint);
                    (f(e).run)(journal)
                }
                Err(StmError::Retry) => Err(StmError::Retry),
                Err(StmError::Die(defect)) => Err(StmError::Die(defect)),
                Err(StmError::Conflict) => Err(StmError::Conflict),
            }
        })
    }

    /// Runs `that` if `self` retries. Typed failures are not caught. The
    /// alternative starts from `self`'s journal with its writes rolled back
    /// but its reads kept, so if both retry the fiber waits on the union of
    /// their reads.
    #[must_use]
    pub fn or_else(self, that: Self) -> Self {
        Self::new(move |journal| {
            let checkpoint = journal.checkpoint();
            match (self.run)(journal) {
                Err(StmError::Retry) => {
                    journal.rollback(checkpoint);
                    (that.run)(journal)
                }
                other => other,
            }
        })
    }

    /// An effect running the transaction to completion.
    #[must_use]
    pub fn commit(self) -> Effect<A, E> {
        Effect::from_instr(commit::commit_instr(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run<A: Value, E: Value>(stm: &Stm<A, E>) -> (Result<A, StmError<E>>, Journal) {
        let mut journal = Journal::default();
        let out = (stm.run)(&mut journal);
        (out, journal)
    }

    #[test]
    fn writes_stay_in_the_journal_until_commit() {
        let r = TRef::new(1_i32);
        let stm = r.update(|n| n + 1).and_then(r.get());
        let (out, journal) = run(&stm);
        assert_eq!(out, Ok(2));
        assert_eq!(r.load(), 1);
        assert!(journal.commit().is_ok());
        assert_eq!(r.load(), 2);
    }

    #[test]
    fn or_else_runs_alternative_only_on_retry() {
        let first: Stm<i32, String> = Stm::retry();
        let (out, _) = run(&first.or_else(Stm::succeed(2)));
        assert_eq!(out, Ok(2));

        let failing: Stm<i32, String> = Stm::fail("no".into());
        let (out, _) = run(&failing.or_else(Stm::succeed(2)));
        assert_eq!(out, Err(StmError::Fail("no".to_string())));
    }

    #[test]
    fn or_else_rolls_back_the_retried_branch() {
        let r = TRef::new(0_i32);
        let branch = r.set(5).and_then(Stm::retry());
        let stm = branch.or_else(r.get());
        let (out, journal) = run(&stm);
        assert_eq!(out, Ok(0));
        assert_eq!(journal.len(), 1);
    }

    #[test]
    fn catch_all_discards_writes_of_failed_branch() {
        let r = TRef::new(0_i32);
        let failing = r.set(9).widen::<String>().and_then(Stm::fail("bad".to_string()));
        let stm = failing.catch_all(|_e| Stm::<i32, String>::succeed(1));
        let (out, journal) = run(&stm.zip(r.get().widen()));
        assert_eq!(out, Ok((1, 0)));
        assert!(journal.commit().is_ok());
        assert_eq!(r.load(), 0);
    }

    #[test]
    fn check_retries_on_false() {
        let (out, _) = run(&Stm::<(), String>::check(false));
        assert_eq!(out, Err(StmError::Retry));
        let (out, _) = run(&Stm::<(), String>::check(true));
        assert_eq!(out, Ok(()));
    }
}
