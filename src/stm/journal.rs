//! Transaction-private buffers of cell accesses.
//!
//! The first access to a cell records the committed `(version, value)` pair;
//! later accesses in the same attempt hit the journal. Commit validates the
//! recorded versions against the cells and publishes dirty entries.

use super::commit::Waiter;
use super::tref::TRefCell;
use crate::types::{AnyValue, TRefId};
use core::fmt;
use std::collections::BTreeMap;
use std::sync::Arc;

/// The journal no longer matches the committed state; the attempt must be
/// rerun.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conflict;

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("transaction observed a concurrent commit")
    }
}

impl std::error::Error for Conflict {}

#[derive(Clone)]
struct Entry {
    cell: Arc<TRefCell>,
    expected: u64,
    /// The committed value at first access.
    original: AnyValue,
    value: AnyValue,
    dirty: bool,
}

/// Accesses made by one transaction attempt.
#[derive(Default)]
pub struct Journal {
    entries: BTreeMap<TRefId, Entry>,
}

/// A saved journal state, used to roll back the writes of a failed branch.
pub(crate) struct Checkpoint {
    entries: BTreeMap<TRefId, Entry>,
}

impl fmt::Debug for Journal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Journal")
            .field("cells", &self.entries.len())
            .field("dirty", &self.entries.values().filter(|e| e.dirty).count())
            .finish()
    }
}

impl Journal {
    /// The number of cells accessed so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no cell has been accessed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn read(&mut self, cell: &Arc<TRefCell>) -> Result<AnyValue, Conflict> {
        if let Some(entry) = self.entries.get(&cell.id) {
            return Ok(Arc::clone(&entry.value));
        }
        let (version, value) = cell.snapshot();
        // Every new read revalidates what was read before, so the body
        // never sees a mix of two committed states.
        if !self.is_valid() {
            return Err(Conflict);
        }
        self.entries.insert(
            cell.id,
            Entry {
                cell: Arc::clone(cell),
                expected: version,
                original: Arc::clone(&value),
                value: Arc::clone(&value),
                dirty: false,
            },
        );
        Ok(value)
    }

    pub(crate) fn write(&mut self, cell: &Arc<TRefCell>, value: AnyValue) {
        if let Some(entry) = self.entries.get_mut(&cell.id) {
            entry.value = value;
            entry.dirty = true;
            return;
        }
        let (version, original) = cell.snapshot();
        self.entries.insert(
            cell.id,
            Entry {
                cell: Arc::clone(cell),
                expected: version,
                original,
                value,
                dirty: true,
            },
        );
    }

    /// Returns true if no accessed cell was committed since it was recorded.
    pub(crate) fn is_valid(&self) -> bool {
        self.entries
            .values()
            .all(|entry| entry.cell.version() == entry.expected)
    }

    pub(crate) fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            entries: self.entries.clone(),
        }
    }

    /// Discards writes made since `checkpoint`. Cells first accessed after
    /// the checkpoint stay in the journal as reads so that a later retry
    /// still waits on them.
    pub(crate) fn rollback(&mut self, checkpoint: Checkpoint) {
        let mut saved = checkpoint.entries;
        for (id, entry) in &mut self.entries {
            match saved.remove(id) {
                Some(before) => *entry = before,
                None => {
                    entry.value = Arc::clone(&entry.original);
                    entry.dirty = false;
                }
            }
        }
    }

    /// Atomically validates and publishes the journal. Cells are locked in
    /// id order. Returns the waiters to wake, or [`Conflict`] if any cell
    /// moved on since it was recorded.
    pub(crate) fn commit(&self) -> Result<Vec<Arc<Waiter>>, Conflict> {
        let mut locked: Vec<_> = self
            .entries
            .values()
            .map(|entry| (entry, entry.cell.state.lock()))
            .collect();
        if locked
            .iter()
            .any(|(entry, state)| state.version != entry.expected)
        {
            return Err(Conflict);
        }
        let mut woken = Vec::new();
        for (entry, state) in locked.iter_mut().filter(|(entry, _)| entry.dirty) {
            state.version += 1;
            state.value = Arc::clone(&entry.value);
            woken.append(&mut state.waiters);
        }
        Ok(woken)
    }

    /// Parks `waiter` on every accessed cell. Returns false if one of them
    /// was committed since it was recorded, in which case the transaction
    /// should rerun instead of waiting.
    pub(crate) fn park(&self, waiter: &Arc<Waiter>) -> bool {
        for entry in self.entries.values() {
            let mut state = entry.cell.state.lock();
            if state.version != entry.expected {
                return false;
            }
            state.waiters.push(Arc::clone(waiter));
        }
        true
    }

    /// Removes `waiter` from every accessed cell.
    pub(crate) fn unpark(&self, waiter: &Arc<Waiter>) {
        for entry in self.entries.values() {
            entry
                .cell
                .state
                .lock()
                .waiters
                .retain(|w| !Arc::ptr_eq(w, waiter));
        }
    }
}
