//! Effectum: a fiber runtime for lazily described effects.
//!
//! # Overview
//!
//! Programs are built as [`Effect`] values: immutable descriptions of
//! computations that may succeed, fail with a typed error, die with a
//! defect or be interrupted. A [`Runtime`] interprets them on lightweight
//! [`Fiber`]s multiplexed over a small pool of OS threads.
//!
//! # Core Guarantees
//!
//! - **Structured interruption**: interrupts are delivered only at
//!   interruptible checkpoints; uninterruptible regions and finalizers
//!   always run to completion
//! - **No orphan fibers**: a fiber's children are interrupted and awaited
//!   before the fiber's own exit is published
//! - **Full failure information**: every failure is a [`Cause`] tree that
//!   keeps concurrent and sequential failures, defects and interruptions
//! - **Scoped resources**: finalizers registered with a [`Scope`] run exactly
//!   once, in reverse order, with the scope's exit
//! - **Composable transactions**: [`Stm`] transactions over [`TRef`] cells
//!   commit atomically and retry until their read set changes
//!
//! # Module Structure
//!
//! - [`types`]: Core types (ids, causes, exits, fiber status)
//! - [`effect`]: The effect description and its combinators
//! - [`fiber`]: Fiber handles
//! - [`fiber_ref`]: Fiber-local references with fork/join semantics
//! - [`scope`]: Finalizer scopes and resource management
//! - [`stm`]: Software transactional memory
//! - [`runtime`]: Runtime builder, scheduler and host entry points
//! - [`error`]: Error types
//! - [`tracing_compat`]: Logging shim over `tracing`

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::module_inception)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::significant_drop_tightening)]

pub mod effect;
pub mod error;
pub mod fiber;
pub mod fiber_ref;
pub mod runtime;
pub mod scope;
pub mod stm;
pub mod tracing_compat;
pub mod types;

#[cfg(test)]
pub(crate) mod test_utils;

// Re-exports for convenient access to core types
pub use effect::{Effect, Restore, Resume};
pub use error::{BuildError, Error, ErrorKind, FiberFailure};
pub use fiber::Fiber;
pub use fiber_ref::{Differ, FiberRef, FiberRefs, FiberRefsPatch, ReplaceDiffer, SumDiffer};
pub use runtime::{ExitFuture, Runtime, RuntimeBuilder, RuntimeConfig, RuntimeFiber};
pub use scope::{Scope, ScopeExit};
pub use stm::{Conflict, Journal, Stm, StmError, TRef};
pub use types::{Cause, Defect, Exit, FiberId, FiberStatus, Value};
