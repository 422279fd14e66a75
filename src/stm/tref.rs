//! Transactional cells.

use super::commit::Waiter;
use super::journal::{Conflict, Journal};
use super::Stm;
use crate::types::{erase, unerase, AnyValue, TRefId, Value};
use core::fmt;
use parking_lot::Mutex;
use std::marker::PhantomData;
use std::sync::Arc;

/// Committed state of a cell.
pub(crate) struct Versioned {
    pub(crate) version: u64,
    pub(crate) value: AnyValue,
    /// Fibers parked in `retry` after reading this cell.
    pub(crate) waiters: Vec<Arc<Waiter>>,
}

pub(crate) struct TRefCell {
    pub(crate) id: TRefId,
    pub(crate) state: Mutex<Versioned>,
}

impl TRefCell {
    fn new(value: AnyValue) -> Arc<Self> {
        Arc::new(Self {
            id: TRefId::next(),
            state: Mutex::new(Versioned {
                version: 0,
                value,
                waiters: Vec::new(),
            }),
        })
    }

    pub(crate) fn snapshot(&self) -> (u64, AnyValue) {
        let state = self.state.lock();
        (state.version, Arc::clone(&state.value))
    }

    pub(crate) fn version(&self) -> u64 {
        self.state.lock().version
    }
}

/// A mutable cell that is only read and written inside transactions.
pub struct TRef<A> {
    cell: Arc<TRefCell>,
    _marker: PhantomData<fn() -> A>,
}

impl<A> TRef<A> {
    #[cfg(test)]
    pub(crate) fn waiter_count(&self) -> usize {
        self.cell.state.lock().waiters.len()
    }
}

impl<A> Clone for TRef<A> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
            _marker: PhantomData,
        }
    }
}

impl<A> fmt::Debug for TRef<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TRef")
            .field("id", &self.cell.id)
            .field("version", &self.cell.version())
            .finish()
    }
}

impl<A> PartialEq for TRef<A> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }
}

impl<A> Eq for TRef<A> {}

impl<A: Value> TRef<A> {
    /// Creates a cell outside of any transaction.
    #[must_use]
    pub fn new(value: A) -> Self {
        Self {
            cell: TRefCell::new(erase(value)),
            _marker: PhantomData,
        }
    }

    /// Creates a cell as part of a transaction.
    #[must_use]
    pub fn make(value: A) -> Stm<Self> {
        Stm::new(move |_| Ok(Self::new(value.clone())))
    }

    /// The cell's id. Commits lock cells in id order.
    #[must_use]
    pub fn id(&self) -> TRefId {
        self.cell.id
    }

    /// The last committed value, read outside of any transaction.
    #[must_use]
    pub fn load(&self) -> A {
        unerase(self.cell.snapshot().1)
    }

    /// Reads the value through `journal`. Fails with [`Conflict`] if the
    /// journal no longer describes a consistent snapshot.
    pub fn read(&self, journal: &mut Journal) -> Result<A, Conflict> {
        journal.read(&self.cell).map(unerase::<A>)
    }

    /// Buffers a write in `journal`.
    pub fn write(&self, journal: &mut Journal, value: A) {
        journal.write(&self.cell, erase(value));
    }

    /// Reads, applies `f` and writes back, returning the new value.
    pub fn read_update<F>(&self, journal: &mut Journal, f: F) -> Result<A, Conflict>
    where
        F: FnOnce(A) -> A,
    {
        let next = f(self.read(journal)?);
        self.write(journal, next.clone());
        Ok(next)
    }

    /// Reads the value.
    #[must_use]
    pub fn get(&self) -> Stm<A> {
        let this = self.clone();
        Stm::new(move |journal| Ok(this.read(journal)?))
    }

    /// Replaces the value.
    #[must_use]
    pub fn set(&self, value: A) -> Stm<()> {
        let this = self.clone();
        Stm::new(move |journal| {
            this.write(journal, value.clone());
            Ok(())
        })
    }

    /// Applies `f` to the value.
    #[must_use]
    pub fn update<F>(&self, f: F) -> Stm<()>
    where
        F: Fn(A) -> A + Send + Sync + 'static,
    {
        self.modify(move |a| ((), f(a)))
    }

    /// Replaces the value with the second half of `f`'s result and returns
    /// the first half.
    #[must_use]
    pub fn modify<B: Value, F>(&self, f: F) -> Stm<B>
    where
        F: Fn(A) -> (B, A) + Send + Sync + 'static,
    {
        let this = self.clone();
        Stm::new(move |journal| {
            let (out, next) = f(this.read(journal)?);
            this.write(journal, next);
            Ok(out)
        })
    }

    /// Replaces the value, returning the previous one.
    #[must_use]
    pub fn get_and_set(&self, value: A) -> Stm<A> {
        self.modify(move |old| (old, value.clone()))
    }
}
