//! Error types for object store, lock and service registry operations.
//!
//! Backend client errors are never exposed directly. Each adapter classifies
//! them into [`ObjdbError::Unavailable`] (worth retrying) or
//! [`ObjdbError::Backend`] (not worth retrying).

use std::io;
use thiserror::Error;

/// Result type alias for objdb operations.
pub type Result<T> = std::result::Result<T, ObjdbError>;

/// Errors that can occur while talking to the cluster store.
#[derive(Debug, Error)]
pub enum ObjdbError {
    /// Key or prefix is absent.
    #[error("Key not found: {key}")]
    NotFound {
        /// The missing key.
        key: String,
    },

    /// No plugin registered under the requested backend name.
    #[error("Unknown objdb plugin '{name}'")]
    UnknownPlugin {
        /// The requested backend name.
        name: String,
    },

    /// Store URL could not be parsed.
    #[error("Invalid store URL '{url}': {reason}")]
    InvalidUrl {
        /// The rejected URL.
        url: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Cluster unreachable or temporarily unable to serve the request.
    #[error("{backend} unavailable: {message}")]
    Unavailable {
        /// Backend name.
        backend: String,
        /// Error message.
        message: String,
    },

    /// Backend rejected the request.
    #[error("{backend} request failed: {message}")]
    Backend {
        /// Backend name.
        backend: String,
        /// Error message.
        message: String,
    },

    /// Session or lease no longer exists on the backend.
    #[error("Session '{session}' expired or not found")]
    SessionExpired {
        /// The expired session ID.
        session: String,
    },

    /// Malformed backend response.
    #[error("Protocol error: {message}")]
    Protocol {
        /// Error message.
        message: String,
    },

    /// A directory listing hit a leaf key.
    #[error("Key '{key}' is not a directory")]
    NotADirectory {
        /// The leaf key.
        key: String,
    },

    /// Stored value is not valid JSON for the requested type.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Deregistration of a service this process never registered.
    #[error("Service not found: {key}")]
    ServiceNotRegistered {
        /// The service key.
        key: String,
    },

    /// Operation on a lock that has been released or killed.
    #[error("Lock '{name}' has been released")]
    LockReleased {
        /// Lock name.
        name: String,
    },

    /// Acquire called on a lock that is already acquiring or held.
    #[error("Lock '{name}' is already active")]
    LockActive {
        /// Lock name.
        name: String,
    },

    /// File system error (config loading).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ObjdbError {
    /// Creates a not found error.
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Creates an unavailable error.
    pub fn unavailable(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Unavailable {
            backend: backend.into(),
            message: message.into(),
        }
    }

    /// Creates a non-retryable backend error.
    pub fn backend(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Backend {
            backend: backend.into(),
            message: message.into(),
        }
    }

    /// Creates a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Creates a session expired error.
    pub fn session_expired(session: impl Into<String>) -> Self {
        Self::SessionExpired {
            session: session.into(),
        }
    }

    /// Returns true if this error indicates a transient condition
    /// that may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ObjdbError::Unavailable { .. })
    }

    /// Returns true for configuration errors that should stop the process
    /// at startup.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ObjdbError::UnknownPlugin { .. } | ObjdbError::InvalidUrl { .. } | ObjdbError::Config(_)
        )
    }

    /// Returns true if the key or prefix was absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ObjdbError::NotFound { .. })
    }
}
