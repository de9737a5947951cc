//! Error types for the reconciler crate.

use std::fmt;
use std::time::Duration;

use labsync_remote::RemoteError;

/// Result type alias for reconciler operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Reconciler error types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The remote resource is absent.
    NotFound { resource: String },
    /// A lookup by name matched more than one resource.
    Ambiguous { resource: String, matches: usize },
    /// A polled resource entered a state outside its pending and target sets.
    UnexpectedState { state: String },
    /// The target state was not reached in time.
    Timeout { elapsed: Duration },
    /// Any other remote failure.
    Request { operation: String, reason: String },
    /// The stop signal fired.
    Cancelled,
    /// Declared configuration could not be turned into a typed desired state.
    InvalidDesiredState { kind: String, reason: String },
    /// No reconciler is registered for the kind.
    UnknownKind { kind: String },
    /// Reading or writing recorded state failed.
    StateStore { reason: String },
    /// Converting between typed and stored forms failed.
    Serialization { reason: String },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { resource } => {
                write!(f, "resource '{resource}' not found")
            }
            Self::Ambiguous { resource, matches } => {
                write!(f, "found {matches} matches for '{resource}', expected 1")
            }
            Self::UnexpectedState { state } => {
                write!(f, "unexpected state '{state}'")
            }
            Self::Timeout { elapsed } => {
                write!(f, "timed out after {}ms", elapsed.as_millis())
            }
            Self::Request { operation, reason } => {
                write!(f, "{operation} failed: {reason}")
            }
            Self::Cancelled => {
                write!(f, "operation cancelled")
            }
            Self::InvalidDesiredState { kind, reason } => {
                write!(f, "invalid {kind} configuration: {reason}")
            }
            Self::UnknownKind { kind } => {
                write!(f, "unknown resource kind '{kind}'")
            }
            Self::StateStore { reason } => {
                write!(f, "state store error: {reason}")
            }
            Self::Serialization { reason } => {
                write!(f, "serialization error: {reason}")
            }
        }
    }
}

impl std::error::Error for Error {}

impl Error {
    /// Create a not found error.
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    /// Create an ambiguous lookup error.
    pub fn ambiguous(resource: impl Into<String>, matches: usize) -> Self {
        Self::Ambiguous {
            resource: resource.into(),
            matches,
        }
    }

    /// Create an unexpected state error.
    pub fn unexpected_state(state: impl Into<String>) -> Self {
        Self::UnexpectedState {
            state: state.into(),
        }
    }

    /// Create a timeout error.
    #[must_use]
    pub const fn timeout(elapsed: Duration) -> Self {
        Self::Timeout { elapsed }
    }

    /// Create a request error.
    pub fn request(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Request {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid desired state error.
    pub fn invalid_desired(kind: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidDesiredState {
            kind: kind.into(),
            reason: reason.into(),
        }
    }

    /// Create an unknown kind error.
    pub fn unknown_kind(kind: impl Into<String>) -> Self {
        Self::UnknownKind { kind: kind.into() }
    }

    /// Create a state store error.
    pub fn state_store(reason: impl Into<String>) -> Self {
        Self::StateStore {
            reason: reason.into(),
        }
    }

    /// Create a serialization error.
    pub fn serialization(reason: impl Into<String>) -> Self {
        Self::Serialization {
            reason: reason.into(),
        }
    }

    /// Classify a remote failure: not-found stays distinguishable, the rest is opaque.
    pub fn remote(operation: impl Into<String>, err: RemoteError) -> Self {
        match err {
            RemoteError::NotFound { resource } => Self::NotFound { resource },
            other => Self::request(operation, other.to_string()),
        }
    }

    /// Check whether this is the not-found kind.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<labsync_core::Error> for Error {
    fn from(err: labsync_core::Error) -> Self {
        Self::state_store(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}
