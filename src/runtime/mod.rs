//! Runtime state and scheduling.
//!
//! This module contains the machinery that interprets effects:
//!
//! - [`config`]: Runtime configuration types
//! - [`builder`]: Runtime builder, the [`Runtime`] itself and host handles
//! - [`env_config`]: Environment variable and TOML configuration
//! - `scheduler`: Worker pool and the current-thread queue used by `run_sync`
//! - `timer`: Timer heap and driver thread resuming sleeping fibers
//! - `fiber_table`: Registry of live fibers
//!
//! # Runtime Builder
//!
//! The runtime is configured with a fluent, move-based builder API. Each
//! builder method consumes `self` and returns an updated builder, enabling
//! ergonomic chaining without borrowing hazards.
//!
//! ## Quick Start
//!
//! ```ignore
//! use effectum::{Effect, RuntimeBuilder};
//!
//! let runtime = RuntimeBuilder::new().build()?;
//! let exit = runtime.run_fork(Effect::<i32, String>::succeed(1)).wait();
//! ```
//!
//! ## Single Worker
//!
//! ```ignore
//! use effectum::RuntimeBuilder;
//!
//! let runtime = RuntimeBuilder::current_thread().build()?;
//! let value = runtime.run_sync(program)?;
//! ```
//!
//! ## Config File + Environment Overrides
//!
//! ```ignore
//! use effectum::RuntimeBuilder;
//!
//! // Requires the `config-file` feature.
//! let runtime = RuntimeBuilder::from_toml("config/runtime.toml")?
//!     .with_env_overrides()?
//!     .build()?;
//! ```
//!
//! # Error Handling
//!
//! ```ignore
//! use effectum::RuntimeBuilder;
//!
//! // Requires the `config-file` feature.
//! let result = RuntimeBuilder::from_toml_str("not valid {{{");
//! assert!(result.is_err());
//! ```
//!
//! # Configuration Reference (Defaults + Notes)
//!
//! - `worker_threads`: default = available parallelism (min 1).
//! - `thread_stack_size`: default = 2 MiB. Larger stack increases memory per worker.
//! - `thread_name_prefix`: default = `effectum-worker`. Improves diagnostics.
//! - `max_ops_before_yield`: default = 2048. Lower for fairness, higher for throughput.
//! - `on_thread_start/stop`: lifecycle hooks; keep work minimal to avoid jitter.

pub mod builder;
pub mod config;
pub mod env_config;
pub(crate) mod fiber_table;
pub(crate) mod scheduler;
pub(crate) mod timer;

pub use builder::{ExitFuture, Runtime, RuntimeBuilder, RuntimeFiber};
pub use config::RuntimeConfig;

pub(crate) use builder::RuntimeInner;
