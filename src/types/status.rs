//! Observable fiber status.

use super::id::FiberId;
use core::fmt;

/// What a suspended fiber is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockingOn {
    /// An external callback registered through `Effect::async_`.
    Callback,
    /// Another fiber's exit.
    Fiber(FiberId),
    /// The timer driver.
    Sleep,
    /// A transactional commit on one of the cells in its read set.
    Transaction,
}

/// The lifecycle status of a fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FiberStatus {
    /// Queued or currently executing instructions.
    Running,
    /// Parked at an asynchronous boundary.
    Suspended {
        /// What the fiber waits for.
        blocking_on: BlockingOn,
        /// Whether an interrupt would be delivered immediately.
        interruptible: bool,
    },
    /// Finished; the exit is available.
    Done,
}

impl FiberStatus {
    /// Returns true once the fiber has finished.
    #[must_use]
    pub const fn is_done(&self) -> bool {
        matches!(self, Self::Done)
    }

    /// Returns true while the fiber is parked.
    #[must_use]
    pub const fn is_suspended(&self) -> bool {
        matches!(self, Self::Suspended { .. })
    }
}

impl fmt::Display for FiberStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => f.write_str("running"),
            Self::Suspended { blocking_on, .. } => write!(f, "suspended on {blocking_on:?}"),
            Self::Done => f.write_str("done"),
        }
    }
}
