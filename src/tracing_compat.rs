//! Logging shim used by the runtime internals.
//!
//! With the `tracing-integration` feature the macros below are re-exports of
//! the `tracing` crate. Without it they expand to nothing, so call sites cost
//! nothing in builds that do not collect logs.
//!
//! ```rust,ignore
//! use effectum::tracing_compat::{debug, trace};
//!
//! debug!(fiber = %id, "fiber spawned");
//! ```
//!
//! Enable forwarding in `Cargo.toml`:
//!
//! ```toml
//! effectum = { version = "0.1", features = ["tracing-integration"] }
//! ```

#[cfg(feature = "tracing-integration")]
pub use tracing::{debug, error, info, trace, warn};

#[cfg(not(feature = "tracing-integration"))]
mod noop {
    //! Expand-to-nothing stand-ins for the `tracing` event macros.

    /// No-op trace-level logging macro.
    #[macro_export]
    macro_rules! trace {
        ($($arg:tt)*) => {};
    }

    /// No-op debug-level logging macro.
    #[macro_export]
    macro_rules! debug {
        ($($arg:tt)*) => {};
    }

    /// No-op info-level logging macro.
    #[macro_export]
    macro_rules! info {
        ($($arg:tt)*) => {};
    }

    /// No-op warn-level logging macro.
    #[macro_export]
    macro_rules! warn {
        ($($arg:tt)*) => {};
    }

    /// No-op error-level logging macro.
    #[macro_export]
    macro_rules! error {
        ($($arg:tt)*) => {};
    }

    pub use crate::{debug, error, info, trace, warn};
}

#[cfg(not(feature = "tracing-integration"))]
pub use noop::*;

#[cfg(test)]
mod tests {
    use super::{debug, error, info, trace, warn};

    #[test]
    fn macros_accept_structured_fields() {
        let fiber = 7_u64;
        trace!(fiber, "trace event");
        debug!(fiber = %fiber, "debug event");
        info!(count = 3, "info event");
        warn!("warn event {}", fiber);
        error!(reason = ?"boom", "error event");
    }
}
