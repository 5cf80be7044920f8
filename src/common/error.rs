//! Error types for minicoord

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === Validation Errors ===
    #[error("Invalid options: {0}")]
    InvalidOptions(String),

    #[error("Bad value: {0}")]
    BadValue(String),

    // === Conflict Errors ===
    #[error("Conflicting operation in progress: {0}")]
    ConflictingOperationInProgress(String),

    // === Replication Errors ===
    #[error("Not writable primary: current primary is {0}")]
    NotWritablePrimary(String),

    #[error("Interrupted due to replication state change: {0}")]
    InterruptedDueToReplStateChange(String),

    #[error("Write concern failed: {0}")]
    WriteConcernFailed(String),

    // === Workload Errors ===
    #[error("Operation {key} failed: {reason}")]
    WorkloadFailed { key: String, reason: String },

    // === Storage Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    #[cfg(feature = "sled-backend")]
    #[error("Sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("State document corrupted: {0}")]
    DocumentCorrupted(String),

    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    #[error("Phase regression for {key}: {from} -> {to}")]
    PhaseRegression { key: String, from: String, to: String },

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Is this a retryable error?
    ///
    /// Retryable errors leave the durable state untouched or resumable; the
    /// caller is expected to reissue the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::NotWritablePrimary(_)
                | Error::InterruptedDueToReplStateChange(_)
                | Error::WriteConcernFailed(_)
                | Error::Timeout(_)
        )
    }

    /// Validation errors are raised before any durable state is touched.
    pub fn is_validation(&self) -> bool {
        matches!(self, Error::InvalidOptions(_) | Error::BadValue(_))
    }

    /// Stable error code name, reported alongside the message.
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidOptions(_) => "InvalidOptions",
            Error::BadValue(_) => "BadValue",
            Error::ConflictingOperationInProgress(_) => "ConflictingOperationInProgress",
            Error::NotWritablePrimary(_) => "NotWritablePrimary",
            Error::InterruptedDueToReplStateChange(_) => "InterruptedDueToReplStateChange",
            Error::WriteConcernFailed(_) => "WriteConcernFailed",
            Error::WorkloadFailed { .. } => "OperationFailed",
            Error::NotFound(_) => "NoSuchKey",
            Error::Timeout(_) => "ExceededTimeLimit",
            Error::DuplicateKey(_) => "DuplicateKey",
            Error::InvalidConfig(_) => "InvalidConfig",
            _ => "InternalError",
        }
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::InvalidOptions(_) | Error::BadValue(_) | Error::InvalidConfig(_) => {
                StatusCode::BAD_REQUEST
            }
            Error::ConflictingOperationInProgress(_) | Error::DuplicateKey(_) => {
                StatusCode::CONFLICT
            }
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::NotWritablePrimary(_)
            | Error::InterruptedDueToReplStateChange(_)
            | Error::WriteConcernFailed(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            Error::WorkloadFailed { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Other(e.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::NotWritablePrimary("node-2".into()).is_retryable());
        assert!(Error::InterruptedDueToReplStateChange("term 3".into()).is_retryable());
        assert!(!Error::ConflictingOperationInProgress("t".into()).is_retryable());
        assert!(!Error::BadValue("x".into()).is_retryable());
        assert!(Error::BadValue("x".into()).is_validation());
    }

    #[test]
    fn test_http_status_mapping() {
        use axum::http::StatusCode;
        assert_eq!(
            Error::ConflictingOperationInProgress("t".into()).to_http_status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            Error::InvalidOptions("tenantId".into()).to_http_status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::NotWritablePrimary("unknown".into()).to_http_status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
