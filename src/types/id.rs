//! Identifier types for runtime entities.
//!
//! Fibers, scopes, transactional cells and fiber refs are all identified by
//! process-wide monotonic counters. Fiber ids additionally carry their
//! creation timestamp so diagnostics can order them and report their age.

use core::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static FIBER_COUNTER: AtomicU64 = AtomicU64::new(1);
static SCOPE_COUNTER: AtomicU64 = AtomicU64::new(1);
static TREF_COUNTER: AtomicU64 = AtomicU64::new(1);
static FIBER_REF_COUNTER: AtomicU64 = AtomicU64::new(1);

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

/// A unique identifier for a fiber.
///
/// Ordering follows creation order: the sequence number is compared first.
/// [`FiberId::NONE`] stands for "no fiber", e.g. an interrupt requested by
/// the embedding host rather than by another fiber.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiberId {
    seq: u64,
    start_millis: u64,
}

impl FiberId {
    /// The id used for requests that do not originate from a fiber.
    pub const NONE: Self = Self {
        seq: 0,
        start_millis: 0,
    };

    /// Allocates a fresh fiber id stamped with the current wall-clock time.
    #[must_use]
    pub(crate) fn next() -> Self {
        Self {
            seq: FIBER_COUNTER.fetch_add(1, Ordering::Relaxed),
            start_millis: now_millis(),
        }
    }

    /// Creates a fiber id for testing purposes.
    #[doc(hidden)]
    #[must_use]
    pub const fn new_for_test(seq: u64, start_millis: u64) -> Self {
        Self { seq, start_millis }
    }

    /// Returns the monotonic sequence number.
    #[must_use]
    pub const fn seq(self) -> u64 {
        self.seq
    }

    /// Returns the creation time in milliseconds since the Unix epoch.
    #[must_use]
    pub const fn start_time_millis(self) -> u64 {
        self.start_millis
    }

    /// Returns true for [`FiberId::NONE`].
    #[must_use]
    pub const fn is_none(self) -> bool {
        self.seq == 0
    }
}

impl fmt::Debug for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FiberId(#{}@{})", self.seq, self.start_millis)
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "#none")
        } else {
            write!(f, "#{}", self.seq)
        }
    }
}

/// A unique identifier for a [`Scope`](crate::scope::Scope).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeId(u64);

impl ScopeId {
    pub(crate) fn next() -> Self {
        Self(SCOPE_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw counter value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ScopeId({})", self.0)
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S{}", self.0)
    }
}

/// A unique identifier for a transactional cell.
///
/// Commits lock cells in ascending id order, so the ordering is load-bearing.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TRefId(u64);

impl TRefId {
    pub(crate) fn next() -> Self {
        Self(TREF_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw counter value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for TRefId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TRefId({})", self.0)
    }
}

impl fmt::Display for TRefId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "R{}", self.0)
    }
}

/// A unique identifier for a [`FiberRef`](crate::fiber_ref::FiberRef).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiberRefId(u64);

impl FiberRefId {
    pub(crate) fn next() -> Self {
        Self(FIBER_REF_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw counter value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for FiberRefId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FiberRefId({})", self.0)
    }
}

impl fmt::Display for FiberRefId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "F{}", self.0)
    }
}
