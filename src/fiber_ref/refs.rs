//! The per-fiber store of fiber ref values.

use super::differ::ErasedDiffer;
use super::FiberRef;
use crate::types::{AnyValue, FiberId, FiberRefId, Value};
use core::fmt;
use std::collections::BTreeMap;
use std::sync::Arc;

pub(crate) type ForkFn = Arc<dyn Fn(&AnyValue) -> AnyValue + Send + Sync>;
pub(crate) type JoinFn = Arc<dyn Fn(&AnyValue, &AnyValue) -> AnyValue + Send + Sync>;

/// Identity and behaviour of one fiber ref, shared by every store holding it.
pub(crate) struct RefCore {
    pub(crate) id: FiberRefId,
    pub(crate) initial: AnyValue,
    /// `None` means the identity transform: forked children share the
    /// parent's layer until they write.
    pub(crate) fork: Option<ForkFn>,
    pub(crate) join: Option<JoinFn>,
    pub(crate) differ: Arc<dyn ErasedDiffer>,
}

/// A value written by `fiber`.
#[derive(Clone)]
struct Layer {
    fiber: FiberId,
    value: AnyValue,
}

#[derive(Clone)]
struct Entry {
    core: Arc<RefCore>,
    /// Oldest layer first. Layers are ordered by fiber id because a fiber
    /// only ever inherits layers from fibers created before it.
    stack: Vec<Layer>,
}

impl Entry {
    fn head(&self) -> Option<&Layer> {
        self.stack.last()
    }
}

/// A snapshot of all fiber ref values visible to a fiber.
///
/// Refs that were never written are absent; reading them yields their
/// initial value.
#[derive(Clone, Default)]
pub struct FiberRefs {
    entries: BTreeMap<FiberRefId, Entry>,
}

impl fmt::Debug for FiberRefs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.entries.keys()).finish()
    }
}

impl FiberRefs {
    /// The number of refs with a value in this snapshot.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no ref has been written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Ids of the refs present in this snapshot.
    pub fn ref_ids(&self) -> impl Iterator<Item = FiberRefId> + '_ {
        self.entries.keys().copied()
    }

    /// The value of `fiber_ref`, or its initial value if absent.
    #[must_use]
    pub fn get<A: Value>(&self, fiber_ref: &FiberRef<A>) -> A {
        crate::types::unerase(self.get_erased(fiber_ref.core()))
    }

    /// The value of `fiber_ref` if this snapshot holds one.
    #[must_use]
    pub fn get_explicit<A: Value>(&self, fiber_ref: &FiberRef<A>) -> Option<A> {
        self.lookup(fiber_ref.core().id)
            .map(|v| crate::types::unerase(Arc::clone(v)))
    }

    pub(crate) fn lookup(&self, id: FiberRefId) -> Option<&AnyValue> {
        self.entries
            .get(&id)
            .and_then(Entry::head)
            .map(|layer| &layer.value)
    }

    pub(crate) fn get_erased(&self, core: &RefCore) -> AnyValue {
        self.lookup(core.id)
            .map_or_else(|| Arc::clone(&core.initial), Arc::clone)
    }

    pub(crate) fn core(&self, id: FiberRefId) -> Option<&Arc<RefCore>> {
        self.entries.get(&id).map(|entry| &entry.core)
    }

    pub(crate) fn cores(&self) -> impl Iterator<Item = &Arc<RefCore>> + '_ {
        self.entries.values().map(|entry| &entry.core)
    }

    /// Writes `value` as `fiber`. The fiber's own layer is replaced in place;
    /// an inherited layer is shadowed by a new one.
    pub(crate) fn update_as(&mut self, fiber: FiberId, core: &Arc<RefCore>, value: AnyValue) {
        let entry = self.entries.entry(core.id).or_insert_with(|| Entry {
            core: Arc::clone(core),
            stack: Vec::new(),
        });
        match entry.stack.last_mut() {
            Some(head) if head.fiber == fiber => head.value = value,
            _ => entry.stack.push(Layer { fiber, value }),
        }
    }

    pub(crate) fn delete(&mut self, id: FiberRefId) {
        self.entries.remove(&id);
    }

    /// The snapshot a child starts with: every ref's fork transform applied
    /// to the parent's current value.
    pub(crate) fn fork_as(&self, child: FiberId) -> Self {
        let mut forked = self.clone();
        for entry in forked.entries.values_mut() {
            let Some(fork) = entry.core.fork.clone() else {
                continue;
            };
            let Some(current) = entry.head().map(|layer| Arc::clone(&layer.value)) else {
                continue;
            };
            entry.stack.push(Layer {
                fiber: child,
                value: fork(&current),
            });
        }
        forked
    }

    /// Merges the final refs of a child into this snapshot, owned by
    /// `fiber`. For each ref the child changed since it diverged, the
    /// child's delta is replayed onto the current value and then combined
    /// with the ref's join function.
    pub(crate) fn join_as(&mut self, fiber: FiberId, child: &Self) {
        for (id, child_entry) in &child.entries {
            let Some(child_head) = child_entry.head() else {
                continue;
            };
            if child_head.fiber == fiber {
                continue;
            }
            let core = &child_entry.core;
            let parent_stack = self.entries.get(id).map_or(&[][..], |e| &e.stack[..]);
            let (ancestor, modified) = find_ancestor(core, parent_stack, &child_entry.stack);
            if !modified {
                continue;
            }
            let patch = core.differ.diff(&ancestor, &child_head.value);
            let old = self.get_erased(core);
            let patched = core.differ.patch(&patch, &old);
            let new = match &core.join {
                Some(join) => join(&old, &patched),
                None => patched,
            };
            self.update_as(fiber, core, new);
        }
    }
}

/// Finds the value the child inherited from the latest layer both stacks
/// share, and whether the child has layers of its own above it.
fn find_ancestor(core: &RefCore, parent: &[Layer], child: &[Layer]) -> (AnyValue, bool) {
    let mut p = parent.len();
    let mut c = child.len();
    let mut modified = false;
    while p > 0 && c > 0 {
        let parent_fiber = parent[p - 1].fiber;
        let child_layer = &child[c - 1];
        match parent_fiber.cmp(&child_layer.fiber) {
            std::cmp::Ordering::Less => {
                c -= 1;
                modified = true;
            }
            std::cmp::Ordering::Greater => p -= 1,
            std::cmp::Ordering::Equal => return (Arc::clone(&child_layer.value), modified),
        }
    }
    (Arc::clone(&core.initial), true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber_ref::{FiberRef, SumDiffer};

    fn fid(n: u64) -> FiberId {
        FiberId::new_for_test(n, 0)
    }

    #[test]
    fn absent_ref_reads_initial() {
        let r = FiberRef::new(5_i32);
        let refs = FiberRefs::default();
        assert_eq!(refs.get(&r), 5);
        assert_eq!(refs.get_explicit(&r), None);
    }

    #[test]
    fn own_layer_is_replaced_and_inherited_layer_shadowed() {
        let r = FiberRef::new(0_i32);
        let mut refs = FiberRefs::default();
        refs.update_as(fid(1), r.core(), crate::types::erase(1));
        refs.update_as(fid(1), r.core(), crate::types::erase(2));
        let mut child = refs.fork_as(fid(2));
        child.update_as(fid(2), r.core(), crate::types::erase(3));
        assert_eq!(refs.get(&r), 2);
        assert_eq!(child.get(&r), 3);
        assert_eq!(child.entries[&r.core().id].stack.len(), 2);
    }

    #[test]
    fn fork_applies_transform() {
        let r = FiberRef::make(10_i32, |v: &i32| v + 1, |_old: &i32, new: &i32| *new);
        let mut refs = FiberRefs::default();
        refs.update_as(fid(1), r.core(), crate::types::erase(10));
        let child = refs.fork_as(fid(2));
        assert_eq!(child.get(&r), 11);
        assert_eq!(refs.get(&r), 10);
    }

    #[test]
    fn join_skips_refs_the_child_never_wrote() {
        let r = FiberRef::new(0_i32);
        let mut parent = FiberRefs::default();
        parent.update_as(fid(1), r.core(), crate::types::erase(1));
        let child = parent.fork_as(fid(2));
        parent.update_as(fid(1), r.core(), crate::types::erase(7));
        parent.join_as(fid(1), &child);
        assert_eq!(parent.get(&r), 7);
    }

    #[test]
    fn join_replays_child_delta_onto_parent() {
        let r = FiberRef::with_differ(0_i64, SumDiffer);
        let mut parent = FiberRefs::default();
        parent.update_as(fid(1), r.core(), crate::types::erase(10_i64));
        let mut left = parent.fork_as(fid(2));
        let mut right = parent.fork_as(fid(3));
        left.update_as(fid(2), r.core(), crate::types::erase(13_i64));
        right.update_as(fid(3), r.core(), crate::types::erase(15_i64));
        parent.join_as(fid(1), &left);
        parent.join_as(fid(1), &right);
        assert_eq!(parent.get(&r), 18);
    }

    #[test]
    fn join_of_ref_created_by_child_starts_from_initial() {
        let r = FiberRef::with_differ(100_i64, SumDiffer);
        let mut parent = FiberRefs::default();
        let mut child = parent.fork_as(fid(2));
        child.update_as(fid(2), r.core(), crate::types::erase(104_i64));
        parent.join_as(fid(1), &child);
        assert_eq!(parent.get(&r), 104);
    }
}
