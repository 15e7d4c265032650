//! Plugin error model.
//!
//! Every fallible operation in the host returns [`PluginResult`]. Errors
//! carry an [`ErrorKind`] tag, a human-readable message, and an optional
//! underlying cause. Exceptions never cross component boundaries; user
//! callback failures are caught at the invocation site and converted to
//! [`ErrorKind::ExecutionFailed`] or [`ErrorKind::InternalError`].

use std::fmt;

use serde::{Deserialize, Serialize};

/// Classifies a [`PluginError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The referenced file does not exist or is not accessible.
    FileNotFound,
    /// The file exists but is not a well-formed plugin image.
    InvalidFormat,
    /// The native image could not be opened or instantiated.
    LoadFailed,
    /// A plugin with the same ID is already loaded or registered.
    AlreadyExists,
    /// The referenced plugin, service, or subscription is unknown.
    NotFound,
    /// The operation is not allowed in the current lifecycle state.
    InvalidState,
    /// A caller-supplied argument is malformed.
    InvalidArgument,
    /// The plugin does not implement the requested optional operation.
    OperationNotSupported,
    /// A timed operation exceeded its deadline.
    Timeout,
    /// A plugin command or handler failed.
    ExecutionFailed,
    /// Host or plugin configuration is invalid.
    ConfigurationError,
    /// A security policy rejected the operation.
    SecurityViolation,
    /// A network-facing collaborator failed.
    NetworkError,
    /// A timed operation was cancelled before completion.
    OperationCancelled,
    /// An unexpected internal failure.
    InternalError,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::FileNotFound => "file not found",
            Self::InvalidFormat => "invalid format",
            Self::LoadFailed => "load failed",
            Self::AlreadyExists => "already exists",
            Self::NotFound => "not found",
            Self::InvalidState => "invalid state",
            Self::InvalidArgument => "invalid argument",
            Self::OperationNotSupported => "operation not supported",
            Self::Timeout => "timeout",
            Self::ExecutionFailed => "execution failed",
            Self::ConfigurationError => "configuration error",
            Self::SecurityViolation => "security violation",
            Self::NetworkError => "network error",
            Self::OperationCancelled => "operation cancelled",
            Self::InternalError => "internal error",
        };
        f.write_str(name)
    }
}

/// Error returned from plugin host operations.
#[derive(Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct PluginError {
    kind: ErrorKind,
    message: String,
    #[source]
    cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl PluginError {
    /// Create an error with a kind and message.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: None,
        }
    }

    /// Attach an underlying cause.
    #[must_use]
    pub fn with_cause(mut self, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// The error classification tag.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The human-readable message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    // Convenience constructors for the common kinds.

    /// `FileNotFound` error for a path.
    pub fn file_not_found(path: impl fmt::Display) -> Self {
        Self::new(ErrorKind::FileNotFound, format!("no such file: {path}"))
    }

    /// `NotFound` error for a plugin or service identifier.
    pub fn not_found(what: impl fmt::Display) -> Self {
        Self::new(ErrorKind::NotFound, format!("unknown: {what}"))
    }

    /// `AlreadyExists` error for a plugin identifier.
    pub fn already_exists(id: impl fmt::Display) -> Self {
        Self::new(ErrorKind::AlreadyExists, format!("duplicate id: {id}"))
    }

    /// `InvalidState` error describing a rejected transition.
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidState, message)
    }

    /// `InvalidArgument` error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, message)
    }

    /// `InvalidFormat` error.
    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidFormat, message)
    }

    /// `LoadFailed` error.
    pub fn load_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::LoadFailed, message)
    }

    /// `Timeout` error.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    /// `OperationCancelled` error.
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::OperationCancelled, message)
    }

    /// `OperationNotSupported` error.
    pub fn unsupported(operation: impl fmt::Display) -> Self {
        Self::new(
            ErrorKind::OperationNotSupported,
            format!("not supported: {operation}"),
        )
    }

    /// `ExecutionFailed` error.
    pub fn execution_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ExecutionFailed, message)
    }

    /// `ConfigurationError` error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConfigurationError, message)
    }

    /// `SecurityViolation` error.
    pub fn security(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::SecurityViolation, message)
    }

    /// `InternalError` error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InternalError, message)
    }
}

impl From<std::io::Error> for PluginError {
    fn from(e: std::io::Error) -> Self {
        let kind = match e.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::FileNotFound,
            std::io::ErrorKind::TimedOut => ErrorKind::Timeout,
            _ => ErrorKind::LoadFailed,
        };
        Self::new(kind, e.to_string()).with_cause(e)
    }
}

impl From<serde_json::Error> for PluginError {
    fn from(e: serde_json::Error) -> Self {
        Self::new(ErrorKind::InvalidFormat, e.to_string()).with_cause(e)
    }
}

/// Result type for plugin host operations.
pub type PluginResult<T> = Result<T, PluginError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind_and_message() {
        let err = PluginError::not_found("p1");
        assert_eq!(err.to_string(), "not found: unknown: p1");
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn cause_is_preserved_as_source() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = PluginError::load_failed("cannot open image").with_cause(io);
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn io_not_found_maps_to_file_not_found() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: PluginError = io.into();
        assert_eq!(err.kind(), ErrorKind::FileNotFound);
    }

    #[test]
    fn kind_serde_is_snake_case() {
        let json = serde_json::to_string(&ErrorKind::OperationCancelled).unwrap();
        assert_eq!(json, "\"operation_cancelled\"");
        let back: ErrorKind = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ErrorKind::OperationCancelled);
    }
}
