//! Error taxonomy shared across the workspace.

use thiserror::Error;

/// A backend payload that does not fit the domain shapes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PayloadError {
    #[error("Payload is not a JSON object")]
    NotAnObject,
    #[error("Missing field: {0}")]
    MissingField(&'static str),
    #[error("Invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// Authentication failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("Invalid username or password")]
    InvalidCredentials,
    #[error("Network error: {0}")]
    NetworkError(String),
    #[error("Server error: {0}")]
    ServerError(String),
    /// The request was understood and refused, e.g. a taken username.
    #[error("Rejected: {0}")]
    Rejected(String),
}

/// Failure reported by the messaging backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("Backend unavailable: {0}")]
    Unavailable(String),
    #[error("Backend request timed out")]
    Timeout,
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Request rejected: {0}")]
    Rejected(String),
    #[error("Connection closed")]
    Closed,
}

impl BackendError {
    /// Whether retrying the same call later could succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout | Self::Closed)
    }
}

/// Failure to establish the messaging connection.
///
/// `Clone` so a single in-flight attempt can hand its result to every
/// overlapping caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("Transient connection failure: {0}")]
    Transient(String),
    #[error("Fatal connection failure: {0}")]
    Fatal(String),
}

impl From<BackendError> for ConnectionError {
    fn from(err: BackendError) -> Self {
        if err.is_transient() {
            Self::Transient(err.to_string())
        } else {
            Self::Fatal(err.to_string())
        }
    }
}

/// Channel or message listing failure. Stores keep their prior contents.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("Not connected")]
    NotConnected,
    #[error("Unknown channel: {0}")]
    UnknownChannel(String),
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),
    #[error("Invalid payload: {0}")]
    Payload(#[from] PayloadError),
}

/// Message submission failure. The caller's draft is left untouched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("Message text is empty")]
    Empty,
    #[error("No active channel")]
    NoActiveChannel,
    #[error("Not connected")]
    NotConnected,
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),
    #[error("Invalid payload: {0}")]
    Payload(#[from] PayloadError),
}

/// Inference relay failure. Logged by the relay task, never surfaced.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    #[error("Relay transport error: {0}")]
    Transport(String),
    #[error("Relay rejected with status {0}")]
    Status(u16),
}

/// Credential storage failure.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Corrupt credentials: {0}")]
    Corrupt(String),
    #[error("Storage error: {0}")]
    Internal(String),
}

/// Invalid or missing configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    Missing(&'static str),
    #[error("Invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}
