//! Error types for the inference core.
//!
//! Every fallible operation returns [`Result`]. `Ok` is the absence of an
//! error; an `Err` carries an [`Error`] with a stable [`ErrorCode`] and a
//! human-readable message. The receiver owns the error value.

use std::fmt;
use std::io;
use std::result;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A specialized Result type for inference core operations.
pub type Result<T> = result::Result<T, Error>;

/// Error categories shared by every layer of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Uncategorized failure
    Unknown,
    /// Invariant violation inside the engine
    Internal,
    /// Unknown model, version or shared-memory handle
    NotFound,
    /// Malformed caller input
    InvalidArg,
    /// Resource exhaustion or server not ready
    Unavailable,
    /// Feature not implemented for this configuration
    Unsupported,
    /// Duplicate registration
    AlreadyExists,
}

impl ErrorCode {
    /// Stable string form of the code.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::Internal => "INTERNAL",
            Self::NotFound => "NOT_FOUND",
            Self::InvalidArg => "INVALID_ARG",
            Self::Unavailable => "UNAVAILABLE",
            Self::Unsupported => "UNSUPPORTED",
            Self::AlreadyExists => "ALREADY_EXISTS",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The error type for inference core operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct Error {
    code: ErrorCode,
    message: String,
}

impl Error {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unknown, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn invalid_arg(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidArg, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unavailable, message)
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unsupported, message)
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::AlreadyExists, message)
    }

    /// The error category.
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// String form of the error category.
    pub fn code_str(&self) -> &'static str {
        self.code.as_str()
    }

    /// The error message, without the code prefix.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        let code = match err.kind() {
            io::ErrorKind::NotFound => ErrorCode::NotFound,
            io::ErrorKind::AlreadyExists => ErrorCode::AlreadyExists,
            io::ErrorKind::InvalidInput => ErrorCode::InvalidArg,
            _ => ErrorCode::Internal,
        };
        Error::new(code, format!("I/O error: {}", err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::internal(format!("Serialization error: {}", err))
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::invalid_arg(format!("Configuration error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::not_found("unknown model 'resnet50'");
        assert_eq!(err.to_string(), "NOT_FOUND: unknown model 'resnet50'");
        assert_eq!(err.message(), "unknown model 'resnet50'");
        assert_eq!(err.code_str(), "NOT_FOUND");
    }

    #[test]
    fn test_io_error_conversion() {
        let err: Error = io::Error::new(io::ErrorKind::NotFound, "missing").into();
        assert_eq!(err.code(), ErrorCode::NotFound);

        let err: Error = io::Error::new(io::ErrorKind::PermissionDenied, "denied").into();
        assert_eq!(err.code(), ErrorCode::Internal);
    }

    #[test]
    fn test_config_error_conversion() {
        let err: Error = config::ConfigError::NotFound("server_id".to_string()).into();
        assert_eq!(err.code(), ErrorCode::InvalidArg);
    }

    #[test]
    fn test_code_strings() {
        let codes = [
            (ErrorCode::Unknown, "UNKNOWN"),
            (ErrorCode::Internal, "INTERNAL"),
            (ErrorCode::NotFound, "NOT_FOUND"),
            (ErrorCode::InvalidArg, "INVALID_ARG"),
            (ErrorCode::Unavailable, "UNAVAILABLE"),
            (ErrorCode::Unsupported, "UNSUPPORTED"),
            (ErrorCode::AlreadyExists, "ALREADY_EXISTS"),
        ];
        for (code, s) in codes {
            assert_eq!(Error::new(code, "x").code_str(), s);
        }
    }
}
