//! The erased instruction tree interpreted by the run loop.
//!
//! [`Effect`](super::Effect) is a typed facade over an `Arc<Instr>`. The
//! interpreter only ever sees erased values ([`AnyValue`]) and erased causes,
//! which keeps the dispatch in `fiber::run_loop` a single flat `match`.

use crate::fiber::cell::{FiberCell, ResumeHandle};
use crate::fiber_ref::FiberRefs;
use crate::runtime::RuntimeInner;
use crate::scope::Scope;
use crate::types::{erase, AnyValue, BlockingOn, Cause, Defect, FiberId};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

pub(crate) type Cont = Arc<dyn Fn(AnyValue) -> Arc<Instr> + Send + Sync>;
pub(crate) type FailCont = Arc<dyn Fn(Cause<AnyValue>) -> Arc<Instr> + Send + Sync>;
pub(crate) type SyncFn = Arc<dyn Fn() -> Result<AnyValue, Cause<AnyValue>> + Send + Sync>;
pub(crate) type RegisterFn = Arc<dyn Fn(ResumeHandle) -> Option<Arc<Instr>> + Send + Sync>;
pub(crate) type RefsFn = Arc<dyn Fn(FiberId, &mut FiberRefs) -> AnyValue + Send + Sync>;
pub(crate) type WithFiberFn = Arc<dyn Fn(&FiberContext<'_>) -> Arc<Instr> + Send + Sync>;

/// Where a forked fiber is supervised.
#[derive(Clone)]
pub(crate) enum ForkTarget {
    /// Owned by the forking fiber: interrupted and awaited when it finishes.
    Child,
    /// Not supervised by anyone.
    Daemon,
    /// Interrupted when the scope closes.
    Scope(Scope),
}

pub(crate) enum Instr {
    Succeed(AnyValue),
    Fail(Cause<AnyValue>),
    /// Runs a side effect. Panics become defects.
    Sync(SyncFn),
    /// Suspends until the registered callback resumes the fiber. The
    /// callback may hand back a canceler that runs if the fiber is
    /// interrupted while parked.
    Async {
        register: RegisterFn,
        blocking_on: BlockingOn,
    },
    FlatMap {
        first: Arc<Instr>,
        cont: Cont,
    },
    Fold {
        first: Arc<Instr>,
        on_failure: FailCont,
        on_success: Cont,
    },
    Fork {
        effect: Arc<Instr>,
        target: ForkTarget,
    },
    Yield,
    SetInterruptible {
        effect: Arc<Instr>,
        interruptible: bool,
    },
    UpdateFiberRefs(RefsFn),
    /// Builds the next instruction from the state of the running fiber.
    WithFiber(WithFiberFn),
}

impl Instr {
    pub(crate) fn succeed(value: AnyValue) -> Arc<Self> {
        Arc::new(Self::Succeed(value))
    }

    pub(crate) fn unit() -> Arc<Self> {
        Self::succeed(erase(()))
    }

    pub(crate) fn fail_cause(cause: Cause<AnyValue>) -> Arc<Self> {
        Arc::new(Self::Fail(cause))
    }

    pub(crate) fn die(defect: Defect) -> Arc<Self> {
        Self::fail_cause(Cause::Die(defect))
    }

    pub(crate) fn sync(f: impl Fn() -> AnyValue + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self::Sync(Arc::new(move || Ok(f()))))
    }

    pub(crate) fn flat_map(
        first: Arc<Self>,
        cont: impl Fn(AnyValue) -> Arc<Self> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self::FlatMap {
            first,
            cont: Arc::new(cont),
        })
    }

    pub(crate) fn fold(
        first: Arc<Self>,
        on_failure: impl Fn(Cause<AnyValue>) -> Arc<Self> + Send + Sync + 'static,
        on_success: impl Fn(AnyValue) -> Arc<Self> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self::Fold {
            first,
            on_failure: Arc::new(on_failure),
            on_success: Arc::new(on_success),
        })
    }

    /// Runs `first`, then `second`, keeping the result of `second`.
    pub(crate) fn then(first: Arc<Self>, second: Arc<Self>) -> Arc<Self> {
        Self::flat_map(first, move |_| Arc::clone(&second))
    }

    pub(crate) fn set_interruptible(effect: Arc<Self>, interruptible: bool) -> Arc<Self> {
        Arc::new(Self::SetInterruptible {
            effect,
            interruptible,
        })
    }

    pub(crate) fn with_fiber(
        f: impl Fn(&FiberContext<'_>) -> Arc<Self> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self::WithFiber(Arc::new(f)))
    }

    pub(crate) fn async_on(
        blocking_on: BlockingOn,
        register: impl Fn(ResumeHandle) -> Option<Arc<Self>> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self::Async {
            register: Arc::new(register),
            blocking_on,
        })
    }

    pub(crate) fn update_refs(
        f: impl Fn(FiberId, &mut FiberRefs) -> AnyValue + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self::UpdateFiberRefs(Arc::new(f)))
    }
}

/// Read-only view of the running fiber handed to `WithFiber` instructions.
pub(crate) struct FiberContext<'a> {
    pub(crate) cell: &'a Arc<FiberCell>,
    pub(crate) interruptible: bool,
    pub(crate) refs: &'a FiberRefs,
}

impl FiberContext<'_> {
    pub(crate) fn id(&self) -> FiberId {
        self.cell.id()
    }

    pub(crate) fn runtime(&self) -> &Arc<RuntimeInner> {
        self.cell.runtime()
    }
}

/// Calls user code, turning a panic into a failed instruction.
pub(crate) fn guard(f: impl FnOnce() -> Arc<Instr>) -> Arc<Instr> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(instr) => instr,
        Err(payload) => Instr::die(Defect::from_panic(payload.as_ref())),
    }
}

/// Calls user code producing a plain value, turning a panic into a cause.
pub(crate) fn guard_value<T>(f: impl FnOnce() -> T) -> Result<T, Cause<AnyValue>> {
    catch_unwind(AssertUnwindSafe(f))
        .map_err(|payload| Cause::Die(Defect::from_panic(payload.as_ref())))
}
