//! Error types for the bulk ingest system

use serde::Serialize;
use thiserror::Error;

/// Result type alias for ingest operations
pub type Result<T> = std::result::Result<T, Error>;

/// Bulk ingest errors
#[derive(Debug, Error)]
pub enum Error {
    /// Bad input: filename, extension, size, malformed request
    #[error("Validation error: {0}")]
    Validation(String),

    /// Batch/file quota exceeded
    #[error("Capacity exceeded: {message}")]
    Capacity {
        message: String,
        retry_after_secs: Option<u64>,
    },

    /// Rate limiter denied admission
    #[error("Rate limit exceeded for '{operation}', retry after {retry_after_secs}s")]
    RateLimited {
        operation: String,
        retry_after_secs: u64,
    },

    /// Hash mismatch on a chunk or assembled file
    #[error("Integrity error: {0}")]
    Integrity(String),

    /// Entity missing or owned by another tenant
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Compare-and-set transition lost to a concurrent writer
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Operation not allowed in the entity's current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Upload session expired past its TTL
    #[error("Upload session expired: {0}")]
    SessionExpired(String),

    /// Per-unit retry budget exhausted
    #[error("Retry limit exceeded: {0}")]
    RetryLimitExceeded(String),

    /// Temporary failure, safe to retry with backoff
    #[error("Transient error: {0}")]
    Transient(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Machine-readable error kind surfaced to the web layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ValidationError,
    CapacityExceeded,
    RateLimited,
    IntegrityError,
    NotFound,
    Conflict,
    InvalidState,
    SessionExpired,
    RetryLimitExceeded,
    TransientError,
    ConfigError,
    InternalError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ValidationError => "validation_error",
            ErrorKind::CapacityExceeded => "capacity_exceeded",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::IntegrityError => "integrity_error",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::InvalidState => "invalid_state",
            ErrorKind::SessionExpired => "session_expired",
            ErrorKind::RetryLimitExceeded => "retry_limit_exceeded",
            ErrorKind::TransientError => "transient_error",
            ErrorKind::ConfigError => "config_error",
            ErrorKind::InternalError => "internal_error",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a capacity error that waiting will not clear
    pub fn capacity(message: impl Into<String>) -> Self {
        Self::Capacity {
            message: message.into(),
            retry_after_secs: None,
        }
    }

    /// Create a capacity error that may clear after `retry_after_secs`
    pub fn capacity_with_retry(message: impl Into<String>, retry_after_secs: u64) -> Self {
        Self::Capacity {
            message: message.into(),
            retry_after_secs: Some(retry_after_secs),
        }
    }

    /// Create an integrity error
    pub fn integrity(message: impl Into<String>) -> Self {
        Self::Integrity(message.into())
    }

    /// Create a not-found error
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Create an invalid-state error
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState(message.into())
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Machine-readable kind
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) => ErrorKind::ValidationError,
            Error::Capacity { .. } => ErrorKind::CapacityExceeded,
            Error::RateLimited { .. } => ErrorKind::RateLimited,
            Error::Integrity(_) => ErrorKind::IntegrityError,
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::Conflict(_) => ErrorKind::Conflict,
            Error::InvalidState(_) => ErrorKind::InvalidState,
            Error::SessionExpired(_) => ErrorKind::SessionExpired,
            Error::RetryLimitExceeded(_) => ErrorKind::RetryLimitExceeded,
            Error::Transient(_) => ErrorKind::TransientError,
            Error::Config(_) => ErrorKind::ConfigError,
            Error::Io(_) | Error::Json(_) | Error::Database(_) | Error::Internal(_) => {
                ErrorKind::InternalError
            }
        }
    }

    /// Retry hint in seconds, if the caller may try again later
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Error::RateLimited { retry_after_secs, .. } => Some(*retry_after_secs),
            Error::Capacity { retry_after_secs, .. } => *retry_after_secs,
            _ => None,
        }
    }

    /// Whether the failure is worth retrying with backoff
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_) | Error::Io(_))
    }

    /// Human-readable summary safe to hand to the web layer.
    ///
    /// Storage and IO internals are replaced by a generic message.
    pub fn public_message(&self) -> String {
        match self {
            Error::Io(_) | Error::Json(_) | Error::Database(_) | Error::Internal(_) => {
                "An internal error occurred while processing the request".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}

/// Error payload handed to the excluded web layer
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl From<&Error> for ErrorResponse {
    fn from(err: &Error) -> Self {
        Self {
            kind: err.kind(),
            message: err.public_message(),
            retry_after: err.retry_after(),
        }
    }
}
