//! Error types for remote service calls.

use thiserror::Error;

/// Result type for remote operations.
pub type Result<T> = std::result::Result<T, RemoteError>;

/// Errors returned by a [`crate::RemoteService`].
///
/// The only classification callers may rely on is [`RemoteError::is_not_found`];
/// everything else is opaque and carries a message.
#[derive(Error, Debug)]
pub enum RemoteError {
    /// The addressed resource does not exist (HTTP 404).
    #[error("resource not found: {resource}")]
    NotFound { resource: String },

    /// The service answered with a non-success status.
    #[error("request failed with status {status}: {message}")]
    Status { status: u16, message: String },

    /// The service answered with a body we could not interpret.
    #[error("invalid response: {reason}")]
    InvalidResponse { reason: String },

    /// Client configuration error.
    #[error("configuration error: {reason}")]
    ConfigError { reason: String },

    /// HTTP error from reqwest.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// URL parse error.
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RemoteError {
    /// Create a not found error.
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    /// Create a status error.
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            message: message.into(),
        }
    }

    /// Create an invalid response error.
    pub fn invalid_response(reason: impl Into<String>) -> Self {
        Self::InvalidResponse {
            reason: reason.into(),
        }
    }

    /// Create a config error.
    pub fn config_error(reason: impl Into<String>) -> Self {
        Self::ConfigError {
            reason: reason.into(),
        }
    }

    /// Check whether the addressed resource is absent.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_classification() {
        assert!(RemoteError::not_found("configurations/1").is_not_found());
        assert!(!RemoteError::status(500, "boom").is_not_found());
        assert!(!RemoteError::invalid_response("bad json").is_not_found());
    }

    #[test]
    fn test_status_display() {
        let err = RemoteError::status(422, "name taken");
        assert!(err.to_string().contains("422"));
        assert!(err.to_string().contains("name taken"));
    }
}
