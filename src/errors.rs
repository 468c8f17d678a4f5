//! Error kinds at the component boundaries where callers branch on
//! retryability. Everything else uses `anyhow` at the edges.

use thiserror::Error;

/// Failures surfaced by the priority store to the ingestion worker.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Deadlock, connection reset, pool exhaustion. Worth a retry.
    #[error("transient store failure: {0}")]
    Transient(String),
    /// Constraint violations and schema-level failures. Retrying is useless.
    #[error("permanent store failure: {0}")]
    Permanent(String),
}

impl StoreError {
    pub fn retryable(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }

    /// Classify a diesel error. Serialization failures and broken
    /// connections retry; duplicate keys and the rest do not.
    pub fn from_diesel(err: diesel::result::Error) -> Self {
        use diesel::result::{DatabaseErrorKind, Error};

        match &err {
            Error::DatabaseError(DatabaseErrorKind::SerializationFailure, _) => {
                StoreError::Transient(err.to_string())
            }
            Error::DatabaseError(DatabaseErrorKind::ClosedConnection, _) => {
                StoreError::Transient(err.to_string())
            }
            Error::DatabaseError(DatabaseErrorKind::UniqueViolation, _) => {
                StoreError::Permanent(err.to_string())
            }
            _ => StoreError::Permanent(err.to_string()),
        }
    }
}

impl From<r2d2::Error> for StoreError {
    fn from(err: r2d2::Error) -> Self {
        // Pool checkout failures are load, not corruption
        StoreError::Transient(err.to_string())
    }
}

/// Failures surfaced by a webhook delivery attempt.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// 429 or 5xx from the subscriber, or a network-level failure.
    #[error("retryable delivery failure (status {status:?}): {message}")]
    Retryable {
        status: Option<u16>,
        message: String,
    },
    /// Any other 4xx, or an unusable callback URL.
    #[error("permanent delivery failure (status {status:?}): {message}")]
    Permanent {
        status: Option<u16>,
        message: String,
    },
}

impl DeliveryError {
    pub fn retryable(&self) -> bool {
        matches!(self, DeliveryError::Retryable { .. })
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            DeliveryError::Retryable { status, .. } | DeliveryError::Permanent { status, .. } => {
                *status
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_store_errors_retry() {
        assert!(StoreError::Transient("deadlock".into()).retryable());
        assert!(!StoreError::Permanent("unique violation".into()).retryable());
    }

    #[test]
    fn unique_violation_is_permanent() {
        let err = diesel::result::Error::DatabaseError(
            diesel::result::DatabaseErrorKind::UniqueViolation,
            Box::new("duplicate key".to_string()),
        );
        assert!(!StoreError::from_diesel(err).retryable());
    }

    #[test]
    fn closed_connection_is_transient() {
        let err = diesel::result::Error::DatabaseError(
            diesel::result::DatabaseErrorKind::ClosedConnection,
            Box::new("connection closed".to_string()),
        );
        assert!(StoreError::from_diesel(err).retryable());
    }

    #[test]
    fn delivery_retryability_follows_kind() {
        let retryable = DeliveryError::Retryable {
            status: Some(503),
            message: "service unavailable".into(),
        };
        assert!(retryable.retryable());
        assert_eq!(retryable.status(), Some(503));

        let permanent = DeliveryError::Permanent {
            status: Some(404),
            message: "gone".into(),
        };
        assert!(!permanent.retryable());
    }
}
