//! The terminal result of a fiber.

use super::cause::{Cause, Defect};
use super::id::FiberId;

/// How a computation ended: with a value, or with a [`Cause`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exit<A, E> {
    /// The computation produced a value.
    Success(A),
    /// The computation failed, died or was interrupted.
    Failure(Cause<E>),
}

impl<A, E> Exit<A, E> {
    /// A successful exit.
    #[must_use]
    pub const fn succeed(value: A) -> Self {
        Self::Success(value)
    }

    /// A typed failure.
    #[must_use]
    pub const fn fail(error: E) -> Self {
        Self::Failure(Cause::Fail(error))
    }

    /// A failure with an arbitrary cause.
    #[must_use]
    pub const fn fail_cause(cause: Cause<E>) -> Self {
        Self::Failure(cause)
    }

    /// A defect.
    #[must_use]
    pub const fn die(defect: Defect) -> Self {
        Self::Failure(Cause::Die(defect))
    }

    /// An interruption by `by`.
    #[must_use]
    pub const fn interrupt(by: FiberId) -> Self {
        Self::Failure(Cause::Interrupt(by))
    }

    /// Returns true for `Success`.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Returns true for `Failure`.
    #[must_use]
    pub const fn is_failure(&self) -> bool {
        matches!(self, Self::Failure(_))
    }

    /// Returns true if the exit is a failure whose cause contains an
    /// interruption.
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Failure(c) if c.is_interrupted())
    }

    /// Returns the success value, if any.
    #[must_use]
    pub const fn value(&self) -> Option<&A> {
        match self {
            Self::Success(a) => Some(a),
            Self::Failure(_) => None,
        }
    }

    /// Returns the failure cause, if any.
    #[must_use]
    pub const fn cause(&self) -> Option<&Cause<E>> {
        match self {
            Self::Success(_) => None,
            Self::Failure(c) => Some(c),
        }
    }

    /// Maps the success value.
    #[must_use]
    pub fn map<B>(self, f: impl FnOnce(A) -> B) -> Exit<B, E> {
        match self {
            Self::Success(a) => Exit::Success(f(a)),
            Self::Failure(c) => Exit::Failure(c),
        }
    }

    /// Maps every typed failure in the cause.
    #[must_use]
    pub fn map_err<E2>(self, f: impl FnMut(E) -> E2) -> Exit<A, E2> {
        match self {
            Self::Success(a) => Exit::Success(a),
            Self::Failure(c) => Exit::Failure(c.map(f)),
        }
    }

    /// Discards the success value.
    #[must_use]
    pub fn as_unit(self) -> Exit<(), E> {
        self.map(|_| ())
    }

    /// Converts into a `Result` carrying the full cause on failure.
    pub fn into_result(self) -> Result<A, Cause<E>> {
        match self {
            Self::Success(a) => Ok(a),
            Self::Failure(c) => Err(c),
        }
    }

    /// Combines two exits whose computations ran one after another.
    ///
    /// Fails if either failed; both causes are kept in order.
    #[must_use]
    pub fn zip_sequential<B>(self, that: Exit<B, E>) -> Exit<(A, B), E> {
        match (self, that) {
            (Self::Success(a), Exit::Success(b)) => Exit::Success((a, b)),
            (Self::Failure(c), Exit::Success(_)) | (Self::Success(_), Exit::Failure(c)) => {
                Exit::Failure(c)
            }
            (Self::Failure(l), Exit::Failure(r)) => Exit::Failure(l.then(r)),
        }
    }
}

impl<A, E> From<Result<A, E>> for Exit<A, E> {
    fn from(result: Result<A, E>) -> Self {
        match result {
            Ok(a) => Self::Success(a),
            Err(e) => Self::fail(e),
        }
    }
}
