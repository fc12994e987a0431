//! Error types for shoal
//!
//! This module defines the common error taxonomy used throughout the
//! cluster, and its mapping to HTTP status codes at the handler boundary.

use thiserror::Error;

/// Common result type for shoal operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for shoal
#[derive(Debug, Error)]
pub enum Error {
    // Object and bucket lookup
    #[error("object not found: {bucket}/{objname}")]
    NotFound { bucket: String, objname: String },

    #[error("bucket not found: {0}")]
    BucketNotFound(String),

    #[error("bucket already exists: {0}")]
    BucketExists(String),

    // Data integrity
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: String, actual: String },

    // Capacity
    #[error("out of space: {used_pct}% used")]
    OutOfSpace { used_pct: i32 },

    #[error("no available mountpaths")]
    NoMountpaths,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Intra-cluster stream
    #[error("protocol corrupt: {0}")]
    ProtocolCorrupt(String),

    #[error("stream terminated ({reason}), cannot send")]
    StreamTerminated { reason: String },

    #[error("stream stopped in flight")]
    StreamStopped,

    #[error("read ({got}) shorter than expected ({expected})")]
    ShortRead { got: i64, expected: i64 },

    // Request validation
    #[error("invalid request: {0}")]
    BadRequest(String),

    #[error("invalid provider: {0}")]
    InvalidProvider(String),

    #[error("invalid bucket properties: {0}")]
    InvalidBucketProps(String),

    #[error("cluster map out of sync: {0}")]
    SmapOutOfSync(String),

    // Network
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("remote responded {status}: {msg}")]
    Remote { status: u16, msg: String },

    // Setup
    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a bad-request error
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    /// Create a transient (retryable) error
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    /// Check if this error is worth retrying with backoff
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Check if this is a not-found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::BucketNotFound(_))
    }

    /// HTTP status code surfaced at the handler boundary
    #[must_use]
    pub fn http_status_code(&self) -> u16 {
        match self {
            Self::NotFound { .. } | Self::BucketNotFound(_) => 404,

            Self::BucketExists(_) => 409,

            Self::BadRequest(_)
            | Self::InvalidProvider(_)
            | Self::InvalidBucketProps(_)
            | Self::ProtocolCorrupt(_) => 400,

            Self::SmapOutOfSync(_) => 503,

            Self::OutOfSpace { .. } => 507,

            _ => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_http_status() {
        let err = Error::NotFound {
            bucket: "b".into(),
            objname: "o".into(),
        };
        assert_eq!(err.http_status_code(), 404);
        assert_eq!(Error::BucketExists("b".into()).http_status_code(), 409);
        assert_eq!(Error::bad_request("x").http_status_code(), 400);
        assert_eq!(Error::SmapOutOfSync("v3 < v5".into()).http_status_code(), 503);
        assert_eq!(Error::internal("x").http_status_code(), 500);
    }

    #[test]
    fn test_error_predicates() {
        assert!(Error::BucketNotFound("b".into()).is_not_found());
        assert!(Error::transient("connection refused").is_retryable());
        assert!(!Error::StreamStopped.is_retryable());
    }
}
