//! The cause of a fiber failure.
//!
//! A [`Cause`] is a tree whose leaves are the three failure kinds the runtime
//! distinguishes (typed failures, defects and interruptions) and whose inner
//! nodes record how failures combined: one after another (`Sequential`, e.g.
//! a finalizer failing after the body failed) or side by side (`Parallel`,
//! e.g. two forked children failing concurrently).

use super::id::FiberId;
use crate::error::{Error, ErrorKind};
use core::fmt;
use smallvec::SmallVec;
use std::any::Any;
use std::collections::BTreeSet;

/// An unexpected failure that is not part of the declared error type.
///
/// Panics inside user closures are caught and become defects, as do runtime
/// usage errors (which additionally remember their [`ErrorKind`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Defect {
    message: String,
    kind: Option<ErrorKind>,
}

impl Defect {
    /// Creates a defect with the given message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: None,
        }
    }

    /// Creates a defect from a caught panic payload.
    #[must_use]
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "panic with non-string payload".to_string());
        Self::new(message)
    }

    /// Creates a defect describing a runtime error.
    #[must_use]
    pub fn from_error(error: &Error) -> Self {
        Self {
            message: error.to_string(),
            kind: Some(error.kind()),
        }
    }

    /// Returns the defect message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the runtime error kind, if the defect came from runtime misuse.
    #[must_use]
    pub const fn error_kind(&self) -> Option<ErrorKind> {
        self.kind
    }
}

impl From<Error> for Defect {
    fn from(error: Error) -> Self {
        Self::from_error(&error)
    }
}

impl fmt::Display for Defect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// A tree of failure causes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cause<E> {
    /// No failure. Identity for both combinators.
    Empty,
    /// A typed, expected failure.
    Fail(E),
    /// An unexpected defect.
    Die(Defect),
    /// Interruption requested by the given fiber.
    Interrupt(FiberId),
    /// The left cause happened before the right one.
    Sequential(Box<Cause<E>>, Box<Cause<E>>),
    /// Both causes happened concurrently.
    Parallel(Box<Cause<E>>, Box<Cause<E>>),
}

impl<E> Cause<E> {
    /// The empty cause.
    #[must_use]
    pub const fn empty() -> Self {
        Self::Empty
    }

    /// A typed failure.
    #[must_use]
    pub const fn fail(error: E) -> Self {
        Self::Fail(error)
    }

    /// A defect.
    #[must_use]
    pub const fn die(defect: Defect) -> Self {
        Self::Die(defect)
    }

    /// A defect with only a message.
    #[must_use]
    pub fn die_message(message: impl Into<String>) -> Self {
        Self::Die(Defect::new(message))
    }

    /// An interruption by `by`.
    #[must_use]
    pub const fn interrupt(by: FiberId) -> Self {
        Self::Interrupt(by)
    }

    /// Combines two causes sequentially. `Empty` on either side is dropped.
    #[must_use]
    pub fn then(self, that: Self) -> Self {
        match (self, that) {
            (Self::Empty, c) | (c, Self::Empty) => c,
            (a, b) => Self::Sequential(Box::new(a), Box::new(b)),
        }
    }

    /// Combines two causes in parallel. `Empty` on either side is dropped.
    #[must_use]
    pub fn both(self, that: Self) -> Self {
        match (self, that) {
            (Self::Empty, c) | (c, Self::Empty) => c,
            (a, b) => Self::Parallel(Box::new(a), Box::new(b)),
        }
    }

    /// Visits every node in left-to-right order.
    fn walk<'a>(&'a self, mut visit: impl FnMut(&'a Self)) {
        let mut stack: SmallVec<[&'a Self; 8]> = SmallVec::new();
        stack.push(self);
        while let Some(node) = stack.pop() {
            visit(node);
            if let Self::Sequential(left, right) | Self::Parallel(left, right) = node {
                stack.push(right);
                stack.push(left);
            }
        }
    }

    fn any(&self, mut pred: impl FnMut(&Self) -> bool) -> bool {
        let mut found = false;
        self.walk(|node| found = found || pred(node));
        found
    }

    /// Returns true if the tree contains no failure of any kind.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.any(|c| matches!(c, Self::Fail(_) | Self::Die(_) | Self::Interrupt(_)))
    }

    /// Returns true if the tree contains a typed failure.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        self.any(|c| matches!(c, Self::Fail(_)))
    }

    /// Returns true if the tree contains a defect.
    #[must_use]
    pub fn is_die(&self) -> bool {
        self.any(|c| matches!(c, Self::Die(_)))
    }

    /// Returns true if the tree contains an interruption.
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        self.any(|c| matches!(c, Self::Interrupt(_)))
    }

    /// Returns true if the tree contains interruptions and nothing else.
    #[must_use]
    pub fn is_interrupted_only(&self) -> bool {
        self.is_interrupted() && !self.is_failure() && !self.is_die()
    }

    /// Returns every typed failure, left to right.
    #[must_use]
    pub fn failures(&self) -> Vec<&E> {
        let mut out = Vec::new();
        self.walk(|c| {
            if let Self::Fail(e) = c {
                out.push(e);
            }
        });
        out
    }

    /// Returns every defect, left to right.
    #[must_use]
    pub fn defects(&self) -> Vec<&Defect> {
        let mut out = Vec::new();
        self.walk(|c| {
            if let Self::Die(d) = c {
                out.push(d);
            }
        });
        out
    }

    /// Returns the set of fibers that requested interruption.
    #[must_use]
    pub fn interruptors(&self) -> BTreeSet<FiberId> {
        let mut out = BTreeSet::new();
        self.walk(|c| {
            if let Self::Interrupt(id) = c {
                out.insert(*id);
            }
        });
        out
    }

    /// Returns the first typed failure, if any.
    #[must_use]
    pub fn first_failure(&self) -> Option<&E> {
        self.failures().into_iter().next()
    }

    /// Returns the first defect, if any.
    #[must_use]
    pub fn first_defect(&self) -> Option<&Defect> {
        self.defects().into_iter().next()
    }

    /// Extracts the first typed failure, or hands back the cause unchanged
    /// when it has none.
    pub fn failure_or_cause(self) -> Result<E, Self> {
        if !self.is_failure() {
            return Err(self);
        }
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            match node {
                Self::Fail(e) => return Ok(e),
                Self::Sequential(left, right) | Self::Parallel(left, right) => {
                    stack.push(*right);
                    stack.push(*left);
                }
                Self::Empty | Self::Die(_) | Self::Interrupt(_) => {}
            }
        }
        Err(Self::Empty)
    }

    /// Maps every typed failure.
    #[must_use]
    pub fn map<E2>(self, mut f: impl FnMut(E) -> E2) -> Cause<E2> {
        self.map_inner(&mut f)
    }

    fn map_inner<E2>(self, f: &mut impl FnMut(E) -> E2) -> Cause<E2> {
        match self {
            Self::Empty => Cause::Empty,
            Self::Fail(e) => Cause::Fail(f(e)),
            Self::Die(d) => Cause::Die(d),
            Self::Interrupt(id) => Cause::Interrupt(id),
            Self::Sequential(l, r) => {
                Cause::Sequential(Box::new(l.map_inner(f)), Box::new(r.map_inner(f)))
            }
            Self::Parallel(l, r) => {
                Cause::Parallel(Box::new(l.map_inner(f)), Box::new(r.map_inner(f)))
            }
        }
    }

    /// Turns every typed failure into a defect rendered with `render`.
    #[must_use]
    pub fn squash_failures<E2>(self, mut render: impl FnMut(E) -> Defect) -> Cause<E2> {
        self.squash_inner(&mut render)
    }

    fn squash_inner<E2>(self, render: &mut impl FnMut(E) -> Defect) -> Cause<E2> {
        match self {
            Self::Empty => Cause::Empty,
            Self::Fail(e) => Cause::Die(render(e)),
            Self::Die(d) => Cause::Die(d),
            Self::Interrupt(id) => Cause::Interrupt(id),
            Self::Sequential(l, r) => l.squash_inner(render).then(r.squash_inner(render)),
            Self::Parallel(l, r) => l.squash_inner(render).both(r.squash_inner(render)),
        }
    }

    /// Drops typed failures, keeping defects and interruptions.
    #[must_use]
    pub fn strip_failures(self) -> Self {
        match self {
            Self::Fail(_) | Self::Empty => Self::Empty,
            Self::Die(d) => Self::Die(d),
            Self::Interrupt(id) => Self::Interrupt(id),
            Self::Sequential(l, r) => l.strip_failures().then(r.strip_failures()),
            Self::Parallel(l, r) => l.strip_failures().both(r.strip_failures()),
        }
    }
}

impl<E: fmt::Debug> fmt::Display for Cause<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("Empty"),
            Self::Fail(e) => write!(f, "Fail({e:?})"),
            Self::Die(d) => write!(f, "Die({d})"),
            Self::Interrupt(id) => write!(f, "Interrupt({id})"),
            Self::Sequential(l, r) => write!(f, "Sequential({l}, {r})"),
            Self::Parallel(l, r) => write!(f, "Parallel({l}, {r})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn leaf() -> impl Strategy<Value = Cause<u8>> {
        prop_oneof![
            Just(Cause::Empty),
            any::<u8>().prop_map(Cause::Fail),
            "[a-z]{1,6}".prop_map(|s: String| Cause::die_message(s)),
            (1_u64..5).prop_map(|n| Cause::Interrupt(FiberId::new_for_test(n, 0))),
        ]
    }

    fn tree() -> impl Strategy<Value = Cause<u8>> {
        leaf().prop_recursive(4, 32, 2, |inner| {
            prop_oneof![
                (inner.clone(), inner.clone()).prop_map(|(a, b)| a.then(b)),
                (inner.clone(), inner).prop_map(|(a, b)| a.both(b)),
            ]
        })
    }

    #[test]
    fn empty_is_identity() {
        let c: Cause<&str> = Cause::fail("x");
        assert_eq!(c.clone().then(Cause::Empty), c);
        assert_eq!(Cause::Empty.both(c.clone()), c);
    }

    #[test]
    fn queries_see_nested_leaves() {
        let by = FiberId::new_for_test(9, 0);
        let c: Cause<&str> = Cause::fail("a")
            .then(Cause::die_message("boom"))
            .both(Cause::interrupt(by));
        assert!(c.is_failure());
        assert!(c.is_die());
        assert!(c.is_interrupted());
        assert!(!c.is_interrupted_only());
        assert_eq!(c.failures(), vec![&"a"]);
        assert_eq!(c.first_defect().map(Defect::message), Some("boom"));
        assert!(c.interruptors().contains(&by));
    }

    #[test]
    fn failure_or_cause_extracts_first() {
        let c: Cause<u8> = Cause::die_message("d").then(Cause::fail(1).both(Cause::fail(2)));
        assert_eq!(c.failure_or_cause(), Ok(1));
        let d: Cause<u8> = Cause::die_message("d");
        assert_eq!(d.clone().failure_or_cause(), Err(d));
    }

    #[test]
    fn display_renders_tree() {
        let c: Cause<&str> = Cause::fail("a").both(Cause::interrupt(FiberId::new_for_test(3, 0)));
        assert_eq!(c.to_string(), "Parallel(Fail(\"a\"), Interrupt(#3))");
    }

    #[test]
    fn panic_payloads_become_messages() {
        let payload: Box<dyn Any + Send> = Box::new("exploded");
        assert_eq!(Defect::from_panic(payload.as_ref()).message(), "exploded");
        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(Defect::from_panic(payload.as_ref()).message(), "owned");
        let defect = Defect::from(Error::new(ErrorKind::ScopeClosed));
        assert_eq!(defect.error_kind(), Some(ErrorKind::ScopeClosed));
    }

    proptest! {
        #[test]
        fn strip_failures_removes_all_failures(c in tree()) {
            let defects = c.defects().len();
            let stripped = c.clone().strip_failures();
            prop_assert!(!stripped.is_failure());
            prop_assert_eq!(stripped.defects().len(), defects);
            prop_assert_eq!(stripped.interruptors(), c.interruptors());
        }

        #[test]
        fn map_preserves_shape(c in tree()) {
            let mapped = c.clone().map(u16::from);
            prop_assert_eq!(mapped.failures().len(), c.failures().len());
            prop_assert_eq!(mapped.is_empty(), c.is_empty());
        }
    }
}
