//! Patch algebras for fiber ref values.
//!
//! A [`Differ`] describes how the change between two values of a fiber ref
//! is captured as a patch, how patches compose, and how a patch is replayed
//! onto a value. Joining a child fiber replays the child's patch onto the
//! parent's current value instead of overwriting it.

use crate::types::{erase, unerase, unerase_ref, AnyValue, Value};
use std::marker::PhantomData;
use std::ops::{Add, Sub};

/// Describes changes to values of type `A`.
///
/// Implementations must satisfy `patch(&diff(old, new), old) == new` and
/// `combine` must be associative with `empty()` as its identity.
pub trait Differ<A>: Send + Sync + 'static {
    /// The change between two values.
    type Patch: Value;

    /// The patch that changes nothing.
    fn empty(&self) -> Self::Patch;

    /// Computes the patch taking `old` to `new`.
    fn diff(&self, old: &A, new: &A) -> Self::Patch;

    /// A patch applying `first` and then `second`.
    fn combine(&self, first: Self::Patch, second: Self::Patch) -> Self::Patch;

    /// Applies `patch` to `old`.
    fn patch(&self, patch: &Self::Patch, old: &A) -> A;
}

/// Last write wins. The default for fiber refs.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReplaceDiffer;

impl<A: Value> Differ<A> for ReplaceDiffer {
    type Patch = Option<A>;

    fn empty(&self) -> Option<A> {
        None
    }

    fn diff(&self, _old: &A, new: &A) -> Option<A> {
        Some(new.clone())
    }

    fn combine(&self, first: Option<A>, second: Option<A>) -> Option<A> {
        second.or(first)
    }

    fn patch(&self, patch: &Option<A>, old: &A) -> A {
        patch.as_ref().unwrap_or(old).clone()
    }
}

/// Records additive deltas. Patches from concurrent children commute, so
/// counters forked into several fibers add up when joined.
#[derive(Debug, Clone, Copy, Default)]
pub struct SumDiffer;

impl<A> Differ<A> for SumDiffer
where
    A: Value + Default + Add<Output = A> + Sub<Output = A>,
{
    type Patch = A;

    fn empty(&self) -> A {
        A::default()
    }

    fn diff(&self, old: &A, new: &A) -> A {
        new.clone() - old.clone()
    }

    fn combine(&self, first: A, second: A) -> A {
        first + second
    }

    fn patch(&self, patch: &A, old: &A) -> A {
        old.clone() + patch.clone()
    }
}

/// A differ working on erased values, stored in a fiber ref's core.
pub(crate) trait ErasedDiffer: Send + Sync {
    fn diff(&self, old: &AnyValue, new: &AnyValue) -> AnyValue;
    fn combine(&self, first: &AnyValue, second: &AnyValue) -> AnyValue;
    fn patch(&self, patch: &AnyValue, old: &AnyValue) -> AnyValue;
}

pub(crate) struct Erased<A, D> {
    differ: D,
    _marker: PhantomData<fn() -> A>,
}

impl<A, D> Erased<A, D> {
    pub(crate) fn new(differ: D) -> Self {
        Self {
            differ,
            _marker: PhantomData,
        }
    }
}

impl<A: Value, D: Differ<A>> ErasedDiffer for Erased<A, D> {
    fn diff(&self, old: &AnyValue, new: &AnyValue) -> AnyValue {
        erase(
            self.differ
                .diff(unerase_ref::<A>(old), unerase_ref::<A>(new)),
        )
    }

    fn combine(&self, first: &AnyValue, second: &AnyValue) -> AnyValue {
        let first = unerase::<D::Patch>(first.clone());
        let second = unerase::<D::Patch>(second.clone());
        erase(self.differ.combine(first, second))
    }

    fn patch(&self, patch: &AnyValue, old: &AnyValue) -> AnyValue {
        erase(
            self.differ
                .patch(unerase_ref::<D::Patch>(patch), unerase_ref::<A>(old)),
        )
    }
}
