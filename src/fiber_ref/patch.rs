//! Structural differences between two [`FiberRefs`] snapshots.

use super::refs::{FiberRefs, RefCore};
use crate::types::{AnyValue, FiberId};
use std::sync::Arc;

#[derive(Clone)]
enum Op {
    Empty,
    Add(Arc<RefCore>, AnyValue),
    Remove(Arc<RefCore>),
    Update(Arc<RefCore>, AnyValue),
    AndThen(Box<Op>, Box<Op>),
}

/// The changes taking one snapshot of fiber refs to another.
///
/// Patches form a monoid under [`FiberRefsPatch::combine`] with
/// [`FiberRefsPatch::empty`] as identity and can be replayed onto any
/// snapshot with [`FiberRefsPatch::apply`].
#[derive(Clone)]
pub struct FiberRefsPatch {
    op: Op,
}

impl std::fmt::Debug for FiberRefsPatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fn describe(op: &Op, out: &mut Vec<String>) {
            match op {
                Op::Empty => {}
                Op::Add(core, _) => out.push(format!("add {}", core.id)),
                Op::Remove(core) => out.push(format!("remove {}", core.id)),
                Op::Update(core, _) => out.push(format!("update {}", core.id)),
                Op::AndThen(first, second) => {
                    describe(first, out);
                    describe(second, out);
                }
            }
        }
        let mut ops = Vec::new();
        describe(&self.op, &mut ops);
        f.debug_tuple("FiberRefsPatch").field(&ops).finish()
    }
}

impl Default for FiberRefsPatch {
    fn default() -> Self {
        Self::empty()
    }
}

impl FiberRefsPatch {
    /// The patch that changes nothing.
    #[must_use]
    pub const fn empty() -> Self {
        Self { op: Op::Empty }
    }

    /// Returns true if applying the patch changes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!(self.op, Op::Empty)
    }

    /// Computes the patch taking `old` to `new`. Refs whose value is shared
    /// between both snapshots produce no operation.
    #[must_use]
    pub fn diff(old: &FiberRefs, new: &FiberRefs) -> Self {
        let mut patch = Self::empty();
        for core in new.cores() {
            let Some(new_value) = new.lookup(core.id) else {
                continue;
            };
            let op = match old.lookup(core.id) {
                Some(old_value) if Arc::ptr_eq(old_value, new_value) => continue,
                Some(old_value) => Op::Update(Arc::clone(core), core.differ.diff(old_value, new_value)),
                None => Op::Add(Arc::clone(core), Arc::clone(new_value)),
            };
            patch = patch.combine(Self { op });
        }
        for core in old.cores() {
            if new.core(core.id).is_none() {
                patch = patch.combine(Self {
                    op: Op::Remove(Arc::clone(core)),
                });
            }
        }
        patch
    }

    /// A patch applying `self` and then `that`. Consecutive updates of the
    /// same ref are folded into one through the ref's differ.
    #[must_use]
    pub fn combine(self, that: Self) -> Self {
        let op = match (self.op, that.op) {
            (Op::Empty, op) | (op, Op::Empty) => op,
            (first, second) => sequence(first, second),
        };
        Self { op }
    }

    /// Replays the patch onto `refs`, writing as `fiber`.
    ///
    /// An update whose ref is absent from `refs` is applied to the ref's
    /// initial value.
    pub fn apply(&self, fiber: FiberId, refs: &mut FiberRefs) {
        let mut pending: Vec<&Op> = vec![&self.op];
        while let Some(op) = pending.pop() {
            match op {
                Op::Empty => {}
                Op::Add(core, value) => refs.update_as(fiber, core, Arc::clone(value)),
                Op::Remove(core) => refs.delete(core.id),
                Op::Update(core, delta) => {
                    let current = refs.get_erased(core);
                    let next = core.differ.patch(delta, &current);
                    refs.update_as(fiber, core, next);
                }
                Op::AndThen(first, second) => {
                    pending.push(second);
                    pending.push(first);
                }
            }
        }
    }
}

fn sequence(first: Op, second: Op) -> Op {
    match (first, second) {
        (Op::Update(core, earlier), Op::Update(other, later)) if core.id == other.id => {
            let delta = core.differ.combine(&earlier, &later);
            Op::Update(core, delta)
        }
        (Op::AndThen(head, last), second @ Op::Update(..)) => {
            Op::AndThen(head, Box::new(sequence(*last, second)))
        }
        (first, second) => Op::AndThen(Box::new(first), Box::new(second)),
    }
}
