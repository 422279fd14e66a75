//! Lazily described computations.
//!
//! An [`Effect<A, E>`] is an immutable description of a computation that may
//! succeed with an `A`, fail with a typed `E`, die with a [`Defect`] or be
//! interrupted. Nothing happens until a [`Runtime`](crate::runtime::Runtime)
//! interprets it; the same value can be run any number of times.
//!
//! ```rust,ignore
//! use effectum::{Effect, RuntimeBuilder};
//!
//! let program: Effect<i32, String> = Effect::succeed(20)
//!     .map(|n| n + 1)
//!     .flat_map(|n| if n > 0 { Effect::succeed(n * 2) } else { Effect::fail("negative".into()) });
//!
//! let runtime = RuntimeBuilder::current_thread().build()?;
//! assert_eq!(runtime.run_sync(program).ok(), Some(42));
//! ```

mod concurrent;
pub(crate) mod instr;

use crate::fiber::cell::ResumeHandle;
use crate::fiber::{typed_exit, ErasedExit};
use crate::fiber::run_loop::instr_from_exit;
use crate::types::{erase, unerase, BlockingOn, Cause, Defect, Exit, FiberId, Value};
use core::fmt;
use instr::Instr;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::convert::Infallible;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A description of a computation producing `A` or failing with `E`.
pub struct Effect<A, E = Infallible> {
    instr: Arc<Instr>,
    _marker: PhantomData<fn() -> (A, E)>,
}

impl<A, E> Clone for Effect<A, E> {
    fn clone(&self) -> Self {
        Self {
            instr: Arc::clone(&self.instr),
            _marker: PhantomData,
        }
    }
}

impl<A, E> fmt::Debug for Effect<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Effect").finish_non_exhaustive()
    }
}

impl<A, E> Effect<A, E> {
    pub(crate) fn from_instr(instr: Arc<Instr>) -> Self {
        Self {
            instr,
            _marker: PhantomData,
        }
    }

    pub(crate) fn into_instr(self) -> Arc<Instr> {
        self.instr
    }
}

/// Re-enables the interruptibility that was in effect outside an
/// [`Effect::uninterruptible_mask`] region.
#[derive(Debug, Clone, Copy)]
pub struct Restore {
    interruptible: bool,
}

impl Restore {
    /// Runs `effect` with the interruptibility captured by the mask.
    #[must_use]
    pub fn apply<A, E>(&self, effect: Effect<A, E>) -> Effect<A, E> {
        Effect::from_instr(Instr::set_interruptible(
            effect.into_instr(),
            self.interruptible,
        ))
    }
}

/// One-shot callback that resumes a fiber suspended in [`Effect::async_`].
///
/// Resuming consumes the handle; a handle from an earlier suspension that
/// was abandoned (for example by interruption) is silently ignored.
pub struct Resume<A, E> {
    handle: ResumeHandle,
    _marker: PhantomData<fn() -> (A, E)>,
}

impl<A: Value, E: Value> Resume<A, E> {
    /// The fiber this handle resumes.
    #[must_use]
    pub fn fiber_id(&self) -> FiberId {
        self.handle.fiber_id()
    }

    /// Continues the fiber with `effect`.
    pub fn resume(self, effect: Effect<A, E>) {
        self.handle.resume(effect.into_instr());
    }

    /// Continues the fiber with a value.
    pub fn succeed(self, value: A) {
        self.handle.resume(Instr::succeed(erase(value)));
    }

    /// Continues the fiber with a typed failure.
    pub fn fail(self, error: E) {
        self.handle
            .resume(Instr::fail_cause(Cause::Fail(erase(error))));
    }

    /// Continues the fiber with a defect.
    pub fn die(self, defect: Defect) {
        self.handle.resume(Instr::die(defect));
    }

    /// Continues the fiber with an exit.
    pub fn complete(self, exit: Exit<A, E>) {
        self.resume(Effect::from_exit(exit));
    }
}

impl Effect<(), Infallible> {
    /// An effect that succeeds with `()`.
    #[must_use]
    pub fn unit() -> Self {
        Self::from_instr(Instr::unit())
    }

    /// Hands the execution thread to other runnable fibers.
    #[must_use]
    pub fn yield_now() -> Self {
        Self::from_instr(Arc::new(Instr::Yield))
    }

    /// Suspends the fiber for `duration` without blocking a thread.
    #[must_use]
    pub fn sleep(duration: Duration) -> Self {
        Self::from_instr(Instr::with_fiber(move |ctx| {
            let runtime = Arc::clone(ctx.runtime());
            Instr::async_on(BlockingOn::Sleep, move |handle| {
                // An unrepresentable deadline never fires.
                let deadline = Instant::now().checked_add(duration)?;
                let key = runtime.timer.schedule(deadline, handle);
                let canceler = Arc::clone(&runtime);
                Some(Instr::sync(move || {
                    canceler.timer.cancel(key);
                    erase(())
                }))
            })
        }))
    }

    /// Requests interruption of the calling fiber. The request is delivered
    /// at the next interruptible checkpoint.
    #[must_use]
    pub fn interrupt() -> Self {
        Self::from_instr(Instr::with_fiber(|ctx| {
            ctx.cell.interrupt_as(ctx.id());
            Instr::unit()
        }))
    }
}

impl Effect<FiberId, Infallible> {
    /// The id of the fiber running the effect.
    #[must_use]
    pub fn fiber_id() -> Self {
        Self::from_instr(Instr::with_fiber(|ctx| Instr::succeed(erase(ctx.id()))))
    }
}

impl<A: Value> Effect<A, Infallible> {
    /// Lifts an effect that cannot fail into any error type.
    #[must_use]
    pub fn widen<E2: Value>(self) -> Effect<A, E2> {
        Effect::from_instr(self.instr)
    }
}

impl<A: Value, E: Value> Effect<A, E> {
    // ------------------------------------------------------------------
    // Constructors
    // ------------------------------------------------------------------

    /// Succeeds with `value`.
    #[must_use]
    pub fn succeed(value: A) -> Self {
        Self::from_instr(Instr::succeed(erase(value)))
    }

    /// Fails with a typed error.
    #[must_use]
    pub fn fail(error: E) -> Self {
        Self::from_instr(Instr::fail_cause(Cause::Fail(erase(error))))
    }

    /// Fails with an arbitrary cause.
    #[must_use]
    pub fn fail_cause(cause: Cause<E>) -> Self {
        Self::from_instr(Instr::fail_cause(cause.map(erase)))
    }

    /// Dies with a defect.
    #[must_use]
    pub fn die(defect: Defect) -> Self {
        Self::from_instr(Instr::die(defect))
    }

    /// Dies with a defect carrying `message`.
    #[must_use]
    pub fn die_message(message: impl Into<String>) -> Self {
        Self::die(Defect::new(message))
    }

    /// Succeeds or fails according to `exit`.
    #[must_use]
    pub fn from_exit(exit: Exit<A, E>) -> Self {
        match exit {
            Exit::Success(a) => Self::succeed(a),
            Exit::Failure(cause) => Self::fail_cause(cause),
        }
    }

    /// Succeeds or fails according to `result`.
    #[must_use]
    pub fn from_result(result: Result<A, E>) -> Self {
        Self::from_exit(result.into())
    }

    /// Runs a side effect. A panic becomes a defect.
    #[must_use]
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn() -> A + Send + Sync + 'static,
    {
        Self::from_instr(Instr::sync(move || erase(f())))
    }

    /// Runs a fallible side effect.
    #[must_use]
    pub fn try_sync<F>(f: F) -> Self
    where
        F: Fn() -> Result<A, E> + Send + Sync + 'static,
    {
        Self::from_instr(Arc::new(Instr::Sync(Arc::new(move || {
            f().map(erase).map_err(|e| Cause::Fail(erase(e)))
        }))))
    }

    /// Builds the effect lazily, each time it runs.
    #[must_use]
    pub fn suspend<F>(f: F) -> Self
    where
        F: Fn() -> Self + Send + Sync + 'static,
    {
        Self::from_instr(Instr::with_fiber(move |_| f().instr))
    }

    /// Suspends until `register`'s callback is invoked.
    ///
    /// `register` may return a canceler, run uninterruptibly if the fiber is
    /// interrupted while waiting.
    #[must_use]
    pub fn async_<F>(register: F) -> Self
    where
        F: Fn(Resume<A, E>) -> Option<Effect<(), Infallible>> + Send + Sync + 'static,
    {
        Self::async_blocking_on(BlockingOn::Callback, register)
    }

    /// Like [`Effect::async_`], recording what the fiber waits for.
    #[must_use]
    pub fn async_blocking_on<F>(blocking_on: BlockingOn, register: F) -> Self
    where
        F: Fn(Resume<A, E>) -> Option<Effect<(), Infallible>> + Send + Sync + 'static,
    {
        Self::from_instr(Instr::async_on(blocking_on, move |handle| {
            register(Resume {
                handle,
                _marker: PhantomData,
            })
            .map(Effect::into_instr)
        }))
    }

    /// Never completes. Only interruption ends it.
    #[must_use]
    pub fn never() -> Self {
        Self::from_instr(Instr::async_on(BlockingOn::Callback, |_| None))
    }

    // ------------------------------------------------------------------
    // Sequencing
    // ------------------------------------------------------------------

    /// Transforms the success value.
    #[must_use]
    pub fn map<B: Value, F>(self, f: F) -> Effect<B, E>
    where
        F: Fn(A) -> B + Send + Sync + 'static,
    {
        Effect::from_instr(Instr::flat_map(self.instr, move |v| {
            Instr::succeed(erase(f(unerase(v))))
        }))
    }

    /// Feeds the success value into the next effect.
    #[must_use]
    pub fn flat_map<B: Value, F>(self, f: F) -> Effect<B, E>
    where
        F: Fn(A) -> Effect<B, E> + Send + Sync + 'static,
    {
        Effect::from_instr(Instr::flat_map(self.instr, move |v| f(unerase(v)).instr))
    }

    /// Runs `that` after `self`, keeping the result of `that`.
    #[must_use]
    pub fn and_then<B: Value>(self, that: Effect<B, E>) -> Effect<B, E> {
        Effect::from_instr(Instr::then(self.instr, that.instr))
    }

    /// Runs `that` after `self`, keeping the result of `that`.
    #[must_use]
    pub fn zip_right<B: Value>(self, that: Effect<B, E>) -> Effect<B, E> {
        self.and_then(that)
    }

    /// Runs `that` after `self`, keeping the result of `self`.
    #[must_use]
    pub fn zip_left<B: Value>(self, that: Effect<B, E>) -> Self {
        self.flat_map(move |a| that.clone().as_(a))
    }

    /// Runs both in sequence, pairing the results.
    #[must_use]
    pub fn zip<B: Value>(self, that: Effect<B, E>) -> Effect<(A, B), E> {
        self.zip_with(that, |a, b| (a, b))
    }

    /// Runs both in sequence, combining the results with `f`.
    #[must_use]
    pub fn zip_with<B: Value, C: Value, F>(self, that: Effect<B, E>, f: F) -> Effect<C, E>
    where
        F: Fn(A, B) -> C + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        self.flat_map(move |a| {
            let f = Arc::clone(&f);
            that.clone().map(move |b| f(a.clone(), b))
        })
    }

    /// Replaces the success value.
    #[must_use]
    pub fn as_<B: Value>(self, value: B) -> Effect<B, E> {
        self.map(move |_| value.clone())
    }

    /// Discards the success value.
    #[must_use]
    pub fn as_unit(self) -> Effect<(), E> {
        self.map(|_| ())
    }

    /// Runs `f` on the success value for its effects, keeping the value.
    #[must_use]
    pub fn tap<F>(self, f: F) -> Self
    where
        F: Fn(&A) -> Effect<(), E> + Send + Sync + 'static,
    {
        self.flat_map(move |a| f(&a).as_(a))
    }

    /// Runs the effect `n` times in sequence.
    #[must_use]
    pub fn repeat_n(self, n: usize) -> Effect<(), E> {
        if n == 0 {
            return Effect::from_instr(Instr::unit());
        }
        let again = self.clone();
        self.flat_map(move |_| again.clone().repeat_n(n - 1))
    }

    // ------------------------------------------------------------------
    // Error channel
    // ------------------------------------------------------------------

    /// Transforms typed failures.
    #[must_use]
    pub fn map_err<E2: Value, F>(self, f: F) -> Effect<A, E2>
    where
        F: Fn(E) -> E2 + Send + Sync + 'static,
    {
        Effect::from_instr(Instr::fold(
            self.instr,
            move |cause| Instr::fail_cause(cause.map(|e| erase(f(unerase::<E>(e))))),
            Instr::succeed,
        ))
    }

    /// Recovers from the first typed failure. Defects and interruptions pass
    /// through.
    #[must_use]
    pub fn catch_all<E2: Value, F>(self, f: F) -> Effect<A, E2>
    where
        F: Fn(E) -> Effect<A, E2> + Send + Sync + 'static,
    {
        Effect::from_instr(Instr::fold(
            self.instr,
            move |cause| match cause.failure_or_cause() {
                Ok(error) => f(unerase(error)).instr,
                Err(cause) => Instr::fail_cause(cause),
            },
            Instr::succeed,
        ))
    }

    /// Recovers from any cause.
    #[must_use]
    pub fn catch_all_cause<E2: Value, F>(self, f: F) -> Effect<A, E2>
    where
        F: Fn(Cause<E>) -> Effect<A, E2> + Send + Sync + 'static,
    {
        Effect::from_instr(Instr::fold(
            self.instr,
            move |cause| f(cause.map(unerase)).instr,
            Instr::succeed,
        ))
    }

    /// Recovers from the first defect. Typed failures and interruptions pass
    /// through.
    #[must_use]
    pub fn catch_all_defect<F>(self, f: F) -> Self
    where
        F: Fn(Defect) -> Self + Send + Sync + 'static,
    {
        Self::from_instr(Instr::fold(
            self.instr,
            move |cause| match cause.first_defect().cloned() {
                Some(defect) => f(defect).instr,
                None => Instr::fail_cause(cause),
            },
            Instr::succeed,
        ))
    }

    /// Falls back to `that` on a typed failure.
    #[must_use]
    pub fn or_else<E2: Value>(self, that: Effect<A, E2>) -> Effect<A, E2> {
        self.catch_all(move |_| that.clone())
    }

    /// Turns typed failures into defects.
    #[must_use]
    pub fn or_die(self) -> Effect<A, Infallible>
    where
        E: fmt::Debug,
    {
        Effect::from_instr(Instr::fold(
            self.instr,
            |cause| {
                Instr::fail_cause(cause.squash_failures(|e| {
                    Defect::new(format!("{:?}", unerase::<E>(e)))
                }))
            },
            Instr::succeed,
        ))
    }

    /// Handles both typed failures and success. Defects and interruptions
    /// pass through.
    #[must_use]
    pub fn fold<B: Value, F, G>(self, on_failure: F, on_success: G) -> Effect<B, Infallible>
    where
        F: Fn(E) -> B + Send + Sync + 'static,
        G: Fn(A) -> B + Send + Sync + 'static,
    {
        Effect::from_instr(Instr::fold(
            self.instr,
            move |cause| match cause.failure_or_cause() {
                Ok(error) => Instr::succeed(erase(on_failure(unerase(error)))),
                Err(cause) => Instr::fail_cause(cause),
            },
            move |v| Instr::succeed(erase(on_success(unerase(v)))),
        ))
    }

    /// Handles the full cause or the success value.
    #[must_use]
    pub fn fold_cause<B: Value, E2: Value, F, G>(self, on_failure: F, on_success: G) -> Effect<B, E2>
    where
        F: Fn(Cause<E>) -> Effect<B, E2> + Send + Sync + 'static,
        G: Fn(A) -> Effect<B, E2> + Send + Sync + 'static,
    {
        Effect::from_instr(Instr::fold(
            self.instr,
            move |cause| on_failure(cause.map(unerase)).instr,
            move |v| on_success(unerase(v)).instr,
        ))
    }

    /// Reifies the outcome as an [`Exit`] value.
    #[must_use]
    pub fn exit(self) -> Effect<Exit<A, E>, Infallible> {
        Effect::from_instr(Instr::fold(
            self.instr,
            |cause| Instr::succeed(erase(Exit::<A, E>::Failure(cause.map(unerase)))),
            |v| Instr::succeed(erase(Exit::<A, E>::Success(unerase(v)))),
        ))
    }

    // ------------------------------------------------------------------
    // Interruption and finalization
    // ------------------------------------------------------------------

    /// Runs the effect with interruption deferred until it finishes.
    #[must_use]
    pub fn uninterruptible(self) -> Self {
        Self::from_instr(Instr::set_interruptible(self.instr, false))
    }

    /// Runs the effect interruptibly, even inside an uninterruptible region.
    #[must_use]
    pub fn interruptible(self) -> Self {
        Self::from_instr(Instr::set_interruptible(self.instr, true))
    }

    /// Runs `f` uninterruptibly, handing it a [`Restore`] that re-enables the
    /// interruptibility in effect outside the mask.
    #[must_use]
    pub fn uninterruptible_mask<F>(f: F) -> Self
    where
        F: Fn(Restore) -> Self + Send + Sync + 'static,
    {
        Self::from_instr(Instr::with_fiber(move |ctx| {
            let restore = Restore {
                interruptible: ctx.interruptible,
            };
            Instr::set_interruptible(f(restore).instr, false)
        }))
    }

    /// Runs `f` with the exit of this effect, whatever it is. A failing
    /// finalizer's cause is appended to the original one.
    #[must_use]
    pub fn on_exit<F>(self, f: F) -> Self
    where
        F: Fn(&Exit<A, E>) -> Effect<(), Infallible> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let body = self.instr;
        Self::from_instr(Instr::with_fiber(move |ctx| {
            let restored = Instr::set_interruptible(Arc::clone(&body), ctx.interruptible);
            let on_failure = Arc::clone(&f);
            let on_success = Arc::clone(&f);
            let guarded = Instr::fold(
                restored,
                move |cause| run_finalizer::<A, E>(&*on_failure, Exit::Failure(cause)),
                move |value| run_finalizer::<A, E>(&*on_success, Exit::Success(value)),
            );
            Instr::set_interruptible(guarded, false)
        }))
    }

    /// Runs `finalizer` after the effect, whatever its exit.
    #[must_use]
    pub fn ensuring(self, finalizer: Effect<(), Infallible>) -> Self {
        self.on_exit(move |_| finalizer.clone())
    }

    /// Runs `f` with the interrupting fibers if the effect is interrupted.
    #[must_use]
    pub fn on_interrupt<F>(self, f: F) -> Self
    where
        F: Fn(BTreeSet<FiberId>) -> Effect<(), Infallible> + Send + Sync + 'static,
    {
        self.on_exit(move |exit| match exit {
            Exit::Failure(cause) if cause.is_interrupted() => f(cause.interruptors()),
            _ => Effect::unit(),
        })
    }
}

impl<B: Value, E: Value> Effect<Vec<B>, E> {
    /// Runs `f` on each item in sequence, collecting the results.
    #[must_use]
    pub fn for_each<T, I, F>(items: I, f: F) -> Self
    where
        T: Value,
        I: IntoIterator<Item = T>,
        F: Fn(T) -> Effect<B, E> + Send + Sync + 'static,
    {
        let effects = items.into_iter().map(f).collect();
        Self::all(effects)
    }

    /// Runs the effects in sequence, collecting the results.
    #[must_use]
    pub fn all(effects: Vec<Effect<B, E>>) -> Self {
        let effects = Arc::new(effects);
        Self::suspend(move || {
            collect_from(Arc::clone(&effects), 0, Vec::with_capacity(effects.len()))
        })
    }
}

/// Runs `effects[index..]` in order, appending results to `out`.
fn collect_from<B: Value, E: Value>(
    effects: Arc<Vec<Effect<B, E>>>,
    index: usize,
    out: Vec<B>,
) -> Effect<Vec<B>, E> {
    let Some(effect) = effects.get(index).cloned() else {
        return Effect::succeed(out);
    };
    // A chain is built per run, so the accumulator is taken exactly once.
    let slot = Mutex::new(Some(out));
    effect.flat_map(move |b| {
        let mut next = slot.lock().take().unwrap_or_default();
        next.push(b);
        collect_from(Arc::clone(&effects), index + 1, next)
    })
}

/// Runs a user finalizer after the guarded effect finished with `exit`.
fn run_finalizer<A: Value, E: Value>(
    f: &(dyn Fn(&Exit<A, E>) -> Effect<(), Infallible> + Send + Sync),
    exit: ErasedExit,
) -> Arc<Instr> {
    let typed = typed_exit::<A, E>(exit.clone());
    let finalizer = instr::guard(|| f(&typed).instr);
    let original = exit.clone();
    Instr::fold(
        finalizer,
        move |cause| match &original {
            Exit::Success(_) => Instr::fail_cause(cause),
            Exit::Failure(first) => Instr::fail_cause(first.clone().then(cause)),
        },
        move |_| instr_from_exit(exit.clone()),
    )
}
