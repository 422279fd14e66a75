//! Hierarchical finalizer registries.
//!
//! A [`Scope`] collects release actions and runs them exactly once, most
//! recently added first, when it is closed. Scopes form a tree: a forked
//! scope is registered as a finalizer of its parent, so closing the parent
//! closes every child still open, and closing the child early detaches it.
//!
//! Fibers find their enclosing scope through a fiber ref owned by the
//! runtime; [`Effect::scoped`] and [`Scope::extend`] set it for a region.

use crate::effect::instr::{guard, FiberContext, Instr};
use crate::effect::Effect;
use crate::error::{Error, ErrorKind};
use crate::tracing_compat::{debug, trace};
use crate::types::{erase, AnyValue, Cause, Defect, Exit, ScopeId, Value};
use core::fmt;
use parking_lot::Mutex;
use std::convert::Infallible;
use std::sync::{Arc, Weak};

/// The exit a scope is closed with. Success values and typed errors are
/// erased; the shape of the cause (failure, defect, interruption) is kept.
pub type ScopeExit = Exit<(), ()>;

pub(crate) type RawFinalizer = Box<dyn FnOnce(&ScopeExit) -> Arc<Instr> + Send>;

enum State {
    Open {
        finalizers: Vec<(u64, RawFinalizer)>,
        next_key: u64,
    },
    Closed,
}

struct ScopeInner {
    id: ScopeId,
    /// Parent scope and the key of this scope's closer registered there.
    parent: Mutex<Option<(Weak<ScopeInner>, u64)>>,
    state: Mutex<State>,
}

/// A finalizer registry closed at most once.
#[derive(Clone)]
pub struct Scope {
    inner: Arc<ScopeInner>,
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("id", &self.inner.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl PartialEq for Scope {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Scope {}

/// Converts an exit into the form handed to scope finalizers.
#[must_use]
pub fn scope_exit<A, E: Clone>(exit: &Exit<A, E>) -> ScopeExit {
    match exit {
        Exit::Success(_) => Exit::Success(()),
        Exit::Failure(cause) => Exit::Failure(cause.clone().map(|_| ())),
    }
}

impl Scope {
    /// A fresh scope with no parent.
    #[must_use]
    pub fn root() -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                id: ScopeId::next(),
                parent: Mutex::new(None),
                state: Mutex::new(State::Open {
                    finalizers: Vec::new(),
                    next_key: 0,
                }),
            }),
        }
    }

    /// Creates a scope parented to the enclosing scope, or a root scope if
    /// there is none.
    #[must_use]
    pub fn make() -> Effect<Self, Infallible> {
        Effect::from_instr(Instr::with_fiber(|ctx| match current_scope(ctx) {
            Some(parent) => child_instr(&parent),
            None => Instr::succeed(erase(Self::root())),
        }))
    }

    /// Creates a child scope that is closed, with the parent's exit, when
    /// this scope closes. Dies if this scope is already closed.
    #[must_use]
    pub fn fork(&self) -> Effect<Self, Infallible> {
        let parent = self.clone();
        Effect::from_instr(Instr::with_fiber(move |_| child_instr(&parent)))
    }

    pub(crate) fn child(&self) -> Result<Self, Error> {
        let child = Self::root();
        let closer = child.clone();
        let key = self.register_raw(Box::new(move |exit| closer.close_instr(exit.clone())))?;
        *child.inner.parent.lock() = Some((Arc::downgrade(&self.inner), key));
        Ok(child)
    }

    /// The scope's id.
    #[must_use]
    pub fn id(&self) -> ScopeId {
        self.inner.id
    }

    /// Returns true once [`Scope::close`] started running.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(*self.inner.state.lock(), State::Closed)
    }

    /// The number of finalizers waiting for the scope to close.
    #[must_use]
    pub fn finalizer_count(&self) -> usize {
        match &*self.inner.state.lock() {
            State::Open { finalizers, .. } => finalizers.len(),
            State::Closed => 0,
        }
    }

    pub(crate) fn register_raw(&self, finalizer: RawFinalizer) -> Result<u64, Error> {
        let mut state = self.inner.state.lock();
        match &mut *state {
            State::Open {
                finalizers,
                next_key,
            } => {
                let key = *next_key;
                *next_key += 1;
                finalizers.push((key, finalizer));
                Ok(key)
            }
            State::Closed => Err(Error::new(ErrorKind::ScopeClosed)
                .with_message(format!("cannot add a finalizer to {}", self.inner.id))),
        }
    }

    pub(crate) fn remove_finalizer(&self, key: u64) {
        if let State::Open { finalizers, .. } = &mut *self.inner.state.lock() {
            finalizers.retain(|(k, _)| *k != key);
        }
    }

    /// Registers `finalizer` to run when the scope closes. Dies with
    /// [`ErrorKind::ScopeClosed`] if the scope is already closed.
    #[must_use]
    pub fn add_finalizer<F>(&self, finalizer: F) -> Effect<(), Infallible>
    where
        F: Fn(&ScopeExit) -> Effect<(), Infallible> + Send + Sync + 'static,
    {
        let scope = self.clone();
        let finalizer = Arc::new(finalizer);
        Effect::from_instr(Instr::with_fiber(move |_| {
            let f = Arc::clone(&finalizer);
            match scope.register_raw(Box::new(move |exit| f(exit).into_instr())) {
                Ok(_) => Instr::unit(),
                Err(error) => Instr::die(Defect::from_error(&error)),
            }
        }))
    }

    /// Closes the scope with `exit`, running every finalizer once in reverse
    /// registration order. Closing a closed scope does nothing. Failures of
    /// individual finalizers do not stop the others; they are combined
    /// sequentially into the resulting cause.
    #[must_use]
    pub fn close(&self, exit: ScopeExit) -> Effect<(), Infallible> {
        Effect::from_instr(self.close_instr(exit))
    }

    pub(crate) fn close_instr(&self, exit: ScopeExit) -> Arc<Instr> {
        let scope = self.clone();
        let closing = Instr::with_fiber(move |_| {
            let finalizers = {
                let mut state = scope.inner.state.lock();
                match std::mem::replace(&mut *state, State::Closed) {
                    State::Open { finalizers, .. } => finalizers,
                    State::Closed => return Instr::unit(),
                }
            };
            if let Some((parent, key)) = scope.inner.parent.lock().take() {
                if let Some(parent) = parent.upgrade() {
                    Self { inner: parent }.remove_finalizer(key);
                }
            }
            debug!(
                scope = %scope.inner.id,
                finalizers = finalizers.len(),
                success = exit.is_success(),
                "closing scope"
            );
            let steps: Vec<Arc<Instr>> = finalizers
                .into_iter()
                .rev()
                .map(|(_, finalizer)| guard(|| finalizer(&exit)))
                .collect();
            run_in_sequence(Arc::new(steps), 0, Cause::Empty)
        });
        Instr::set_interruptible(closing, false)
    }

    /// Runs `effect` with this scope as the enclosing scope, without closing
    /// it afterwards.
    #[must_use]
    pub fn extend<A: Value, E: Value>(&self, effect: Effect<A, E>) -> Effect<A, E> {
        let scope = self.clone();
        Effect::from_instr(Instr::with_fiber(move |ctx| {
            ctx.runtime()
                .current_scope
                .locally(Some(scope.clone()), effect.clone())
                .into_instr()
        }))
    }

    /// Runs `effect` in this scope and closes the scope with its exit.
    #[must_use]
    pub fn use_<A: Value, E: Value>(&self, effect: Effect<A, E>) -> Effect<A, E> {
        let scope = self.clone();
        self.extend(effect)
            .on_exit(move |exit| scope.close(scope_exit(exit)))
    }
}

fn child_instr(parent: &Scope) -> Arc<Instr> {
    match parent.child() {
        Ok(child) => {
            trace!(parent = %parent.id(), child = %child.id(), "scope forked");
            Instr::succeed(erase(child))
        }
        Err(error) => Instr::die(Defect::from_error(&error)),
    }
}

/// Runs `steps[index..]` one after another, each regardless of how the
/// previous ones ended, then fails with the accumulated cause if any.
fn run_in_sequence(steps: Arc<Vec<Arc<Instr>>>, index: usize, acc: Cause<AnyValue>) -> Arc<Instr> {
    let Some(step) = steps.get(index).cloned() else {
        return if acc.is_empty() {
            Instr::unit()
        } else {
            Instr::fail_cause(acc)
        };
    };
    let after_failure = Arc::clone(&steps);
    let acc_on_failure = acc.clone();
    Instr::fold(
        step,
        move |cause| {
            run_in_sequence(
                Arc::clone(&after_failure),
                index + 1,
                acc_on_failure.clone().then(cause),
            )
        },
        move |_| run_in_sequence(Arc::clone(&steps), index + 1, acc.clone()),
    )
}

/// The scope enclosing the running fiber, if any.
pub(crate) fn current_scope(ctx: &FiberContext<'_>) -> Option<Scope> {
    ctx.refs.get(&ctx.runtime().current_scope)
}

fn no_enclosing_scope(operation: &str) -> Arc<Instr> {
    Instr::die(Defect::from_error(
        &Error::new(ErrorKind::NoEnclosingScope).with_message(operation.to_string()),
    ))
}

impl Effect<Scope, Infallible> {
    /// The enclosing scope. Dies with [`ErrorKind::NoEnclosingScope`] if
    /// there is none.
    #[must_use]
    pub fn scope() -> Self {
        Self::from_instr(Instr::with_fiber(|ctx| match current_scope(ctx) {
            Some(scope) => Instr::succeed(erase(scope)),
            None => no_enclosing_scope("scope"),
        }))
    }
}

impl Effect<(), Infallible> {
    /// Registers `finalizer` with the enclosing scope.
    #[must_use]
    pub fn add_finalizer<F>(finalizer: F) -> Self
    where
        F: Fn(&ScopeExit) -> Self + Send + Sync + 'static,
    {
        let finalizer = Arc::new(finalizer);
        Self::from_instr(Instr::with_fiber(move |ctx| match current_scope(ctx) {
            Some(scope) => {
                let f = Arc::clone(&finalizer);
                scope.add_finalizer(move |exit| f(exit)).into_instr()
            }
            None => no_enclosing_scope("add_finalizer"),
        }))
    }
}

impl<A: Value, E: Value> Effect<A, E> {
    /// Runs the effect in a fresh scope that is closed with its exit.
    #[must_use]
    pub fn scoped(self) -> Self {
        Scope::make().widen::<E>().flat_map(move |scope| scope.use_(self.clone()))
    }

    /// Acquires a resource uninterruptibly and registers `release` with the
    /// enclosing scope. The release runs exactly once when that scope
    /// closes, whatever the exit. Dies if there is no enclosing scope.
    #[must_use]
    pub fn acquire_release<F>(acquire: Self, release: F) -> Self
    where
        F: Fn(A, &ScopeExit) -> Effect<(), Infallible> + Send + Sync + 'static,
    {
        let release = Arc::new(release);
        let acquire = acquire.into_instr();
        let body = Instr::with_fiber(move |ctx| {
            let Some(scope) = current_scope(ctx) else {
                return no_enclosing_scope("acquire_release");
            };
            let release = Arc::clone(&release);
            Instr::flat_map(Arc::clone(&acquire), move |resource| {
                let typed = crate::types::unerase::<A>(Arc::clone(&resource));
                let release = Arc::clone(&release);
                let register =
                    scope.add_finalizer(move |exit| release(typed.clone(), exit));
                Instr::then(register.into_instr(), Instr::succeed(resource))
            })
        });
        Self::from_instr(Instr::set_interruptible(body, false))
    }

    /// Acquires a resource uninterruptibly, uses it with the caller's
    /// interruptibility, and releases it whatever `use_` did.
    #[must_use]
    pub fn acquire_use_release<B, U, R>(acquire: Self, use_: U, release: R) -> Effect<B, E>
    where
        B: Value,
        U: Fn(A) -> Effect<B, E> + Send + Sync + 'static,
        R: Fn(A, &Exit<B, E>) -> Effect<(), Infallible> + Send + Sync + 'static,
    {
        let use_ = Arc::new(use_);
        let release = Arc::new(release);
        Effect::uninterruptible_mask(move |restore| {
            let use_ = Arc::clone(&use_);
            let release = Arc::clone(&release);
            acquire.clone().flat_map(move |resource: A| {
                let release = Arc::clone(&release);
                let held = resource.clone();
                restore
                    .apply(use_(resource))
                    .on_exit(move |exit| release(held.clone(), exit))
            })
        })
    }
}
