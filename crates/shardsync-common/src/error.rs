//! Error types for ShardSync
//!
//! One error type is shared by the storage, transport and replication
//! crates so failures can cross the wire and be classified on either side.

use crate::types::{ReplicationId, ShardId};
use thiserror::Error;

/// Common result type for ShardSync operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for ShardSync
#[derive(Debug, Error)]
pub enum Error {
    // Storage errors
    #[error("disk I/O error: {0}")]
    DiskIo(#[from] std::io::Error),

    #[error("checksum mismatch for {file}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        file: String,
        expected: String,
        actual: String,
    },

    #[error("length mismatch for {file}: expected {expected} bytes, got {actual}")]
    LengthMismatch {
        file: String,
        expected: u64,
        actual: u64,
    },

    #[error("file not found: {file} in shard {shard}")]
    FileNotFound { shard: String, file: String },

    #[error("shard not found: {0}")]
    ShardNotFound(String),

    #[error("storage error: {0}")]
    Storage(String),

    // Cache errors
    #[error("cache load failed for {key}: {reason}")]
    CacheLoad { key: String, reason: String },

    #[error("cache is closed")]
    CacheClosed,

    // Replication errors
    #[error("stale checkpoint for {shard}: received {received}, already at {current}")]
    StaleCheckpoint {
        shard: String,
        received: String,
        current: String,
    },

    #[error("replication {replication_id} failed: {reason}")]
    ReplicationFailed {
        replication_id: ReplicationId,
        reason: String,
    },

    #[error("replication {replication_id} cancelled: {reason}")]
    Cancelled {
        replication_id: ReplicationId,
        reason: String,
    },

    // Transport errors
    #[error("request rejected by admission control for action {action}: {reason}")]
    AdmissionRejected { action: String, reason: String },

    #[error("no handler registered for action: {0}")]
    UnknownAction(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("request timeout")]
    Timeout,

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    // Internal errors
    #[error("internal error: {0}")]
    Internal(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// An error received from a peer whose code this build does not know
    #[error("remote error (code {code}): {message}")]
    Remote { code: u16, message: String },
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a replication failure for the given attempt
    pub fn replication_failed(replication_id: ReplicationId, reason: impl Into<String>) -> Self {
        Self::ReplicationFailed {
            replication_id,
            reason: reason.into(),
        }
    }

    /// Create a cancellation for the given attempt
    pub fn cancelled(replication_id: ReplicationId, reason: impl Into<String>) -> Self {
        Self::Cancelled {
            replication_id,
            reason: reason.into(),
        }
    }

    /// Create a shard-not-found error
    pub fn shard_not_found(shard: &ShardId) -> Self {
        Self::ShardNotFound(shard.to_string())
    }

    /// Check if this is a transient error worth retrying with backoff
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout
                | Self::ServiceUnavailable(_)
                | Self::ConnectionFailed(_)
                | Self::AdmissionRejected { .. }
        )
    }

    /// Check if this error means the transferred data cannot be trusted
    #[must_use]
    pub fn is_integrity_failure(&self) -> bool {
        matches!(
            self,
            Self::ChecksumMismatch { .. } | Self::LengthMismatch { .. }
        )
    }

    /// Check if this error is a cancellation rather than a failure
    #[must_use]
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::FileNotFound { .. } | Self::ShardNotFound(_) | Self::UnknownAction(_)
        )
    }

    /// Stable numeric code used when this error crosses the wire
    #[must_use]
    pub fn wire_code(&self) -> u16 {
        match self {
            Self::InvalidArgument(_) => 400,
            Self::Protocol(_) | Self::Serialization(_) | Self::Deserialization(_) => 401,
            Self::FileNotFound { .. } => 404,
            Self::ShardNotFound(_) => 405,
            Self::UnknownAction(_) => 406,
            Self::StaleCheckpoint { .. } => 409,
            Self::Cancelled { .. } => 410,
            Self::ReplicationFailed { .. } => 420,
            Self::ChecksumMismatch { .. } => 422,
            Self::LengthMismatch { .. } => 423,
            Self::AdmissionRejected { .. } => 429,
            Self::CacheLoad { .. } => 440,
            Self::CacheClosed => 441,
            Self::Internal(_) | Self::Configuration(_) => 500,
            Self::DiskIo(_) | Self::Storage(_) => 507,
            Self::ServiceUnavailable(_) | Self::ConnectionFailed(_) => 503,
            Self::Timeout => 504,
            Self::Remote { code, .. } => *code,
        }
    }

    /// Rebuild an error from its wire code and rendered message.
    ///
    /// Structured fields do not survive the trip; the variant, and with it
    /// the retry/integrity/cancellation classification, does.
    #[must_use]
    pub fn from_wire(code: u16, message: String) -> Self {
        let unknown = ReplicationId::new(0);
        match code {
            400 => Self::InvalidArgument(message),
            401 => Self::Protocol(message),
            404 => Self::FileNotFound {
                shard: String::new(),
                file: message,
            },
            405 => Self::ShardNotFound(message),
            406 => Self::UnknownAction(message),
            409 => Self::StaleCheckpoint {
                shard: String::new(),
                received: message,
                current: String::new(),
            },
            410 => Self::Cancelled {
                replication_id: unknown,
                reason: message,
            },
            420 => Self::ReplicationFailed {
                replication_id: unknown,
                reason: message,
            },
            422 => Self::ChecksumMismatch {
                file: message,
                expected: String::new(),
                actual: String::new(),
            },
            423 => Self::LengthMismatch {
                file: message,
                expected: 0,
                actual: 0,
            },
            429 => Self::AdmissionRejected {
                action: String::new(),
                reason: message,
            },
            440 => Self::CacheLoad {
                key: String::new(),
                reason: message,
            },
            441 => Self::CacheClosed,
            500 => Self::Internal(message),
            503 => Self::ServiceUnavailable(message),
            504 => Self::Timeout,
            507 => Self::Storage(message),
            _ => Self::Remote { code, message },
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable() {
        assert!(Error::Timeout.is_retryable());
        assert!(Error::ConnectionFailed("reset".into()).is_retryable());
        assert!(
            Error::AdmissionRejected {
                action: "replication/getSegmentFiles".into(),
                reason: "busy".into()
            }
            .is_retryable()
        );
        assert!(
            !Error::ChecksumMismatch {
                file: "_0.cfs".into(),
                expected: "a".into(),
                actual: "b".into()
            }
            .is_retryable()
        );
        assert!(!Error::cancelled(ReplicationId::new(1), "newer checkpoint").is_retryable());
    }

    #[test]
    fn test_error_classification() {
        assert!(
            Error::LengthMismatch {
                file: "_0.si".into(),
                expected: 10,
                actual: 9
            }
            .is_integrity_failure()
        );
        assert!(Error::cancelled(ReplicationId::new(7), "x").is_cancellation());
        assert!(Error::ShardNotFound("[logs][0]".into()).is_not_found());
        assert!(!Error::Timeout.is_not_found());
    }

    #[test]
    fn test_wire_roundtrip_preserves_variant() {
        let errors = vec![
            Error::AdmissionRejected {
                action: "replication/getSegmentFiles".into(),
                reason: "too many in flight".into(),
            },
            Error::cancelled(ReplicationId::new(3), "superseded"),
            Error::ChecksumMismatch {
                file: "_1.cfs".into(),
                expected: "00".into(),
                actual: "11".into(),
            },
            Error::Timeout,
            Error::replication_failed(ReplicationId::new(4), "primary moved"),
        ];

        for err in errors {
            let code = err.wire_code();
            let rebuilt = Error::from_wire(code, err.to_string());
            assert_eq!(rebuilt.wire_code(), code);
            assert_eq!(rebuilt.is_retryable(), err.is_retryable());
            assert_eq!(rebuilt.is_integrity_failure(), err.is_integrity_failure());
            assert_eq!(rebuilt.is_cancellation(), err.is_cancellation());
        }
    }

    #[test]
    fn test_unknown_wire_code() {
        let err = Error::from_wire(999, "future error".into());
        assert!(matches!(err, Error::Remote { code: 999, .. }));
        assert_eq!(err.wire_code(), 999);
    }
}
