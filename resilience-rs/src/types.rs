//! # Standardized Error Types
//!
//! The failure taxonomy shared by the resilience primitives and the query
//! federation layer built on top of them.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A type alias for Result with the error type defaulting to our Error
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Field-less classification of an [`Error`].
///
/// Retry policies hold sets of these to decide which failures are worth
/// another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A circuit breaker rejected the call
    CircuitOpen,
    /// The operation exceeded its deadline
    Timeout,
    /// Every retry attempt failed
    RetryExhausted,
    /// Every degradation tier failed
    FallbackExhausted,
    /// Malformed correlation request
    Correlation,
    /// Transient backend failure (unreachable, overloaded)
    Unavailable,
    /// Permanent backend failure (malformed query or response)
    Backend,
    /// Invalid input
    Validation,
    /// Invalid configuration
    Configuration,
    /// Subsystem could not start
    Initialization,
    /// Bug or broken invariant
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::Timeout => "timeout",
            ErrorKind::RetryExhausted => "retry_exhausted",
            ErrorKind::FallbackExhausted => "fallback_exhausted",
            ErrorKind::Correlation => "correlation",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Backend => "backend",
            ErrorKind::Validation => "validation",
            ErrorKind::Configuration => "configuration",
            ErrorKind::Initialization => "initialization",
            ErrorKind::Internal => "internal",
        };
        f.write_str(name)
    }
}

/// Core error type for resilience-guarded operations
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// The named breaker is OPEN and rejected the call without running it
    #[error("circuit breaker '{name}' is open")]
    CircuitOpen {
        name: String,
        /// Time left until the breaker will admit a probe call
        retry_after: Option<Duration>,
    },

    #[error("operation '{operation}' timed out after {timeout:?}")]
    Timeout { operation: String, timeout: Duration },

    #[error("operation failed after {attempts} attempts: {last_error}")]
    RetryExhausted {
        attempts: u32,
        last_error: Box<Error>,
    },

    #[error("all fallback mechanisms exhausted for {service}/{operation}")]
    FallbackExhausted {
        service: String,
        operation: String,
        /// Messages of the failures seen on the way down the tiers
        causes: Vec<String>,
    },

    #[error("correlation error: {0}")]
    Correlation(String),

    #[error("backend '{backend}' failed: {message}")]
    Backend {
        backend: String,
        message: String,
        /// Whether the same call may succeed if repeated
        transient: bool,
    },

    #[error("validation error: {0}")]
    Validation(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("initialization error: {0}")]
    Initialization(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Transient backend failure
    pub fn unavailable(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Backend {
            backend: backend.into(),
            message: message.into(),
            transient: true,
        }
    }

    /// Permanent backend failure
    pub fn backend(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Backend {
            backend: backend.into(),
            message: message.into(),
            transient: false,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation(message.into())
    }

    pub fn correlation(message: impl Into<String>) -> Self {
        Error::Correlation(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Error::Internal(message.into())
    }

    /// Returns the classification used by retry policies
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::RetryExhausted { .. } => ErrorKind::RetryExhausted,
            Error::FallbackExhausted { .. } => ErrorKind::FallbackExhausted,
            Error::Correlation(_) => ErrorKind::Correlation,
            Error::Backend { transient: true, .. } => ErrorKind::Unavailable,
            Error::Backend { transient: false, .. } => ErrorKind::Backend,
            Error::Validation(_) => ErrorKind::Validation,
            Error::Configuration(_) => ErrorKind::Configuration,
            Error::Initialization(_) => ErrorKind::Initialization,
            Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Returns true if this error might go away on retry
    pub fn is_transient(&self) -> bool {
        matches!(self.kind(), ErrorKind::Timeout | ErrorKind::Unavailable)
    }

    /// Returns true for errors caused by the caller's input
    pub fn is_client_error(&self) -> bool {
        matches!(self.kind(), ErrorKind::Validation | ErrorKind::Correlation)
    }

    /// Innermost error, looking through retry wrappers
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::RetryExhausted { last_error, .. } => last_error.root_cause(),
            other => other,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Internal(format!("JSON error: {}", err))
    }
}
