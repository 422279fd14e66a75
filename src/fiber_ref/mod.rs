//! Fiber-local, inheritable state.
//!
//! A [`FiberRef`] is a key into the [`FiberRefs`] snapshot carried by every
//! fiber. Forking copies the snapshot (after each ref's fork transform) so
//! parent and child evolve independently; joining replays the child's
//! changes onto the parent through the ref's [`Differ`].
//!
//! ```rust,ignore
//! let counter = FiberRef::with_differ(0_i64, SumDiffer);
//! let bump = counter.update(|n| n + 1);
//! let program = bump.clone().zip_par(bump).and_then(counter.get());
//! // both children's increments are replayed onto the parent: 2
//! ```

mod differ;
mod patch;
mod refs;

pub use differ::{Differ, ReplaceDiffer, SumDiffer};
pub use patch::FiberRefsPatch;
pub use refs::FiberRefs;

pub(crate) use refs::RefCore;

use crate::effect::instr::Instr;
use crate::effect::Effect;
use crate::types::{erase, unerase, unerase_ref, FiberRefId, Value};
use differ::Erased;
use std::convert::Infallible;
use std::marker::PhantomData;
use std::sync::Arc;

/// A typed key into every fiber's [`FiberRefs`].
pub struct FiberRef<A> {
    core: Arc<RefCore>,
    _marker: PhantomData<fn() -> A>,
}

impl<A> Clone for FiberRef<A> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            _marker: PhantomData,
        }
    }
}

impl<A> std::fmt::Debug for FiberRef<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("FiberRef").field(&self.core.id).finish()
    }
}

impl<A: Value> FiberRef<A> {
    /// A ref whose children inherit the parent's value unchanged and whose
    /// joins keep the child's last write.
    #[must_use]
    pub fn new(initial: A) -> Self {
        Self::with_differ(initial, ReplaceDiffer)
    }

    /// A ref with a custom fork transform and join rule. `join` receives the
    /// parent's value and the patched child value.
    #[must_use]
    pub fn make<F, J>(initial: A, fork: F, join: J) -> Self
    where
        F: Fn(&A) -> A + Send + Sync + 'static,
        J: Fn(&A, &A) -> A + Send + Sync + 'static,
    {
        Self::from_core(RefCore {
            id: FiberRefId::next(),
            initial: erase(initial),
            fork: Some(Arc::new(move |v| erase(fork(unerase_ref::<A>(v))))),
            join: Some(Arc::new(move |old, new| {
                erase(join(unerase_ref::<A>(old), unerase_ref::<A>(new)))
            })),
            differ: Arc::new(Erased::<A, _>::new(ReplaceDiffer)),
        })
    }

    /// A ref whose joins go through `differ`.
    #[must_use]
    pub fn with_differ<D: Differ<A>>(initial: A, differ: D) -> Self {
        Self::from_core(RefCore {
            id: FiberRefId::next(),
            initial: erase(initial),
            fork: None,
            join: None,
            differ: Arc::new(Erased::<A, D>::new(differ)),
        })
    }

    fn from_core(core: RefCore) -> Self {
        Self {
            core: Arc::new(core),
            _marker: PhantomData,
        }
    }

    pub(crate) fn core(&self) -> &Arc<RefCore> {
        &self.core
    }

    /// The ref's identity.
    #[must_use]
    pub fn id(&self) -> FiberRefId {
        self.core.id
    }

    /// The value seen by fibers that never wrote the ref.
    #[must_use]
    pub fn initial(&self) -> A {
        unerase(Arc::clone(&self.core.initial))
    }

    /// Reads the calling fiber's value.
    #[must_use]
    pub fn get(&self) -> Effect<A, Infallible> {
        let core = Arc::clone(&self.core);
        Effect::from_instr(Instr::update_refs(move |_, refs| refs.get_erased(&core)))
    }

    /// Replaces the calling fiber's value.
    #[must_use]
    pub fn set(&self, value: A) -> Effect<(), Infallible> {
        self.modify(move |_| ((), value.clone()))
    }

    /// Applies `f` to the calling fiber's value.
    #[must_use]
    pub fn update<F>(&self, f: F) -> Effect<(), Infallible>
    where
        F: Fn(A) -> A + Send + Sync + 'static,
    {
        self.modify(move |a| ((), f(a)))
    }

    /// Replaces the value with the second half of `f`'s result and returns
    /// the first half.
    #[must_use]
    pub fn modify<B: Value, F>(&self, f: F) -> Effect<B, Infallible>
    where
        F: Fn(A) -> (B, A) + Send + Sync + 'static,
    {
        let core = Arc::clone(&self.core);
        Effect::from_instr(Instr::update_refs(move |fiber, refs| {
            let (out, next) = f(unerase::<A>(refs.get_erased(&core)));
            refs.update_as(fiber, &core, erase(next));
            erase(out)
        }))
    }

    /// Replaces the value, returning the previous one.
    #[must_use]
    pub fn get_and_set(&self, value: A) -> Effect<A, Infallible> {
        self.modify(move |old| (old, value.clone()))
    }

    /// Restores the initial value.
    #[must_use]
    pub fn reset(&self) -> Effect<(), Infallible> {
        let core = Arc::clone(&self.core);
        Effect::from_instr(Instr::update_refs(move |fiber, refs| {
            refs.update_as(fiber, &core, Arc::clone(&core.initial));
            erase(())
        }))
    }

    /// Runs `effect` with the ref set to `value`, restoring the previous
    /// value afterwards whatever the outcome.
    #[must_use]
    pub fn locally<B: Value, E: Value>(&self, value: A, effect: Effect<B, E>) -> Effect<B, E> {
        let fiber_ref = self.clone();
        self.get().widen::<E>().flat_map(move |old| {
            fiber_ref
                .set(value.clone())
                .widen::<E>()
                .and_then(effect.clone())
                .ensuring(fiber_ref.set(old))
        })
    }
}

impl Effect<FiberRefs, Infallible> {
    /// A snapshot of the calling fiber's refs.
    #[must_use]
    pub fn fiber_refs() -> Self {
        Self::from_instr(Instr::update_refs(|_, refs| erase(refs.clone())))
    }
}

impl Effect<(), Infallible> {
    /// Replaces the calling fiber's refs wholesale.
    #[must_use]
    pub fn set_fiber_refs(refs: FiberRefs) -> Self {
        Self::from_instr(Instr::update_refs(move |_, current| {
            *current = refs.clone();
            erase(())
        }))
    }

    /// Replays `patch` onto the calling fiber's refs.
    #[must_use]
    pub fn patch_fiber_refs(patch: FiberRefsPatch) -> Self {
        Self::from_instr(Instr::update_refs(move |fiber, refs| {
            patch.apply(fiber, refs);
            erase(())
        }))
    }
}

impl<A: Value, E: Value> Effect<A, E> {
    /// Runs the effect and also returns the changes it made to the calling
    /// fiber's refs.
    #[must_use]
    pub fn diff_fiber_refs(self) -> Effect<(FiberRefsPatch, A), E> {
        Effect::fiber_refs().widen::<E>().flat_map(move |before| {
            let before = Arc::new(before);
            self.clone().flat_map(move |value| {
                let before = Arc::clone(&before);
                Effect::fiber_refs()
                    .widen::<E>()
                    .map(move |after| (FiberRefsPatch::diff(&before, &after), value.clone()))
            })
        })
    }
}
