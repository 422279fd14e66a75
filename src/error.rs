//! Error types for the effect runtime.
//!
//! Three layers of errors exist and are never conflated:
//!
//! - **Typed failures** travel inside a [`Cause`] as `Cause::Fail(E)`; they
//!   belong to the user's error channel and are not defined here.
//! - **Runtime errors** ([`Error`]) describe misuse of the runtime itself,
//!   such as adding a finalizer to a closed scope. Inside a fiber they surface
//!   as defects (`Cause::Die`) that remember their [`ErrorKind`].
//! - **Build errors** ([`BuildError`]) report invalid configuration from the
//!   builder, the environment or a TOML file.
//!
//! At the host boundary [`FiberFailure`] wraps the full cause tree of a
//! failed `run_sync` call so nothing is swallowed.

use crate::types::Cause;
use core::fmt;

/// The kind of runtime error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    // === Scopes ===
    /// A finalizer was added to a scope that has already closed.
    ScopeClosed,
    /// A scoped operation ran without an enclosing scope.
    NoEnclosingScope,

    // === Host boundary ===
    /// `run_sync` was asked to run an effect that needs to suspend.
    AsyncRequired,
    /// The runtime was shut down while work was still pending.
    RuntimeShutdown,

    // === Configuration ===
    /// A configuration value was rejected.
    InvalidConfig,

    // === Internal ===
    /// Internal runtime invariant violated.
    Internal,
}

impl ErrorKind {
    /// Returns a short human readable description.
    #[must_use]
    pub const fn description(&self) -> &'static str {
        match self {
            Self::ScopeClosed => "scope is already closed",
            Self::NoEnclosingScope => "no enclosing scope",
            Self::AsyncRequired => "effect requires asynchronous suspension",
            Self::RuntimeShutdown => "runtime has shut down",
            Self::InvalidConfig => "invalid configuration",
            Self::Internal => "internal runtime error",
        }
    }
}

/// A runtime error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
}

impl Error {
    /// Creates a new error with the given kind.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
        }
    }

    /// Attaches a message to the error.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the error message, if any.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind.description())?;
        if let Some(msg) = &self.message {
            write!(f, ": {msg}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {}

/// Errors reported while assembling a runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BuildError {
    /// A value could not be parsed or violates a constraint.
    #[error("invalid value for {field}: {reason}")]
    InvalidValue {
        /// Variable or field name.
        field: String,
        /// Why the value was rejected.
        reason: String,
    },
    /// A configuration document could not be parsed.
    #[error("failed to parse config: {0}")]
    Parse(String),
    /// A configuration file could not be read.
    #[error("failed to read config file {path}: {reason}")]
    Io {
        /// Path that was read.
        path: String,
        /// Underlying I/O error, rendered.
        reason: String,
    },
    /// A worker or driver thread could not be spawned.
    #[error("failed to spawn runtime thread {name}: {reason}")]
    Spawn {
        /// Thread name.
        name: String,
        /// Underlying I/O error, rendered.
        reason: String,
    },
}

impl BuildError {
    /// The runtime error kind this build error maps to.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidValue { .. } | Self::Parse(_) | Self::Io { .. } => ErrorKind::InvalidConfig,
            Self::Spawn { .. } => ErrorKind::Internal,
        }
    }

    pub(crate) fn invalid_value(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

impl From<BuildError> for Error {
    fn from(error: BuildError) -> Self {
        Self::new(error.kind()).with_message(error.to_string())
    }
}

/// The failure of a fiber observed at the host boundary.
///
/// Carries the complete [`Cause`] tree: typed failures, defects and
/// interruptions are all preserved.
pub struct FiberFailure<E> {
    cause: Cause<E>,
}

impl<E> FiberFailure<E> {
    /// Wraps a cause.
    #[must_use]
    pub const fn new(cause: Cause<E>) -> Self {
        Self { cause }
    }

    /// Returns the cause tree.
    #[must_use]
    pub const fn cause(&self) -> &Cause<E> {
        &self.cause
    }

    /// Consumes the failure, returning the cause tree.
    #[must_use]
    pub fn into_cause(self) -> Cause<E> {
        self.cause
    }
}

impl<E: fmt::Debug> fmt::Debug for FiberFailure<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberFailure")
            .field("cause", &self.cause)
            .finish()
    }
}

impl<E: fmt::Debug> fmt::Display for FiberFailure<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fiber failed: {}", self.cause)
    }
}

impl<E: fmt::Debug> std::error::Error for FiberFailure<E> {}

/// Result alias for runtime-level operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;
