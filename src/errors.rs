//! Error taxonomy for the harness.
//!
//! Fatal conditions (transport failures, address resolution, configuration) surface as
//! [`HarnessError`] and end the process. Malformed lease grants ([`ProtocolError`])
//! and backend failures are recoverable: they are logged, counted and absorbed by
//! the receive loop or the proxy task.

use std::fmt;
use thiserror::Error;

use crate::config::ConfigError;

/// Errors that terminate a client or frontend process.
#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("Failed to resolve address '{addr}': {reason}")]
    Resolve { addr: String, reason: String },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Handshake failed: {0}")]
    Handshake(String),
}

/// Malformed lease grants from the load balancer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Lease datagram is empty")]
    EmptyLease,

    #[error("Invalid frontend address '{0}'")]
    InvalidAddress(String),

    #[error("Invalid lease timestamp '{0}'")]
    InvalidTimestamp(String),
}

/// A failed call to the backend endpoint.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Backend request failed: {0}")]
    Request(#[from] reqwest::Error),
}

impl BackendError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            BackendError::Request(e) => ErrorCategory::from_reqwest_error(e),
        }
    }
}

/// Categories of backend failures, used as metric labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// HTTP 4xx errors (client errors)
    ClientError,

    /// HTTP 5xx errors (server errors)
    ServerError,

    /// Network connectivity errors (DNS, connection refused, etc.)
    NetworkError,

    /// Request timeout errors
    TimeoutError,

    /// Other/unknown errors
    OtherError,
}

impl ErrorCategory {
    /// Categorize an HTTP status code.
    ///
    /// Only 200 counts as success for the backend oracle, so every other code maps
    /// to a category.
    pub fn from_status_code(status_code: u16) -> Option<Self> {
        match status_code {
            200 => None,
            400..=499 => Some(ErrorCategory::ClientError),
            500..=599 => Some(ErrorCategory::ServerError),
            _ => Some(ErrorCategory::OtherError),
        }
    }

    /// Categorize a reqwest error.
    pub fn from_reqwest_error(error: &reqwest::Error) -> Self {
        if error.is_timeout() {
            ErrorCategory::TimeoutError
        } else if error.is_connect() || error.is_request() || error.is_body() {
            ErrorCategory::NetworkError
        } else {
            ErrorCategory::OtherError
        }
    }

    /// Get the Prometheus label for this error category.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorCategory::ClientError => "client_error",
            ErrorCategory::ServerError => "server_error",
            ErrorCategory::NetworkError => "network_error",
            ErrorCategory::TimeoutError => "timeout_error",
            ErrorCategory::OtherError => "other_error",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}
