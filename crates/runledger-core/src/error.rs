//! Error types for runledger-core

use thiserror::Error;

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for runledger-core
#[derive(Error, Debug)]
pub enum Error {
    /// Storage errors (append log and indexed store)
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    /// Remote collector delivery errors
    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised by the append log and the indexed store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// A write was rejected at the boundary before touching storage.
    #[error("validation failure: {0}")]
    Validation(String),

    /// Lock or busy-timeout contention after the bounded wait elapsed.
    #[error("write contention: {0}")]
    Contention(String),

    /// Structural corruption detected in the indexed store.
    #[error("corruption detected: {details}")]
    Corruption { details: String },

    /// Schema migration could not be applied.
    #[error("migration failed: {0}")]
    Migration(String),

    /// Direct lookup for an id that does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Any other database-level failure.
    #[error("database error: {0}")]
    Database(String),
}

/// Errors raised while forwarding records to the remote collector.
#[derive(Error, Debug)]
pub enum DeliveryError {
    /// Collector could not be reached (connect/timeout).
    #[error("collector unreachable: {0}")]
    Unreachable(String),

    /// Collector answered with a non-success status.
    #[error("collector rejected delivery with status {status}")]
    Rejected { status: u16 },

    /// Retry ceiling reached for a run; it stays queryable locally.
    #[error("delivery attempts exhausted for {event_id} after {attempts} tries")]
    Exhausted { event_id: String, attempts: i64 },
}

/// Configuration-specific errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(code, ref msg) = err {
            match code.code {
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked => {
                    return StoreError::Contention(
                        msg.clone().unwrap_or_else(|| "database is locked".to_string()),
                    );
                }
                rusqlite::ErrorCode::DatabaseCorrupt | rusqlite::ErrorCode::NotADatabase => {
                    return StoreError::Corruption {
                        details: msg.clone().unwrap_or_else(|| "corrupt database".to_string()),
                    };
                }
                _ => {}
            }
        }
        StoreError::Database(err.to_string())
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Store(StoreError::from(err))
    }
}

/// Check if an error is retryable.
///
/// Contention and transport failures are transient; validation, corruption,
/// and structural errors are not.
#[must_use]
pub fn is_retryable(error: &Error) -> bool {
    match error {
        Error::Io(_) => true,
        Error::Store(e) => matches!(e, StoreError::Contention(_) | StoreError::Database(_)),
        Error::Delivery(e) => match e {
            DeliveryError::Unreachable(_) => true,
            // 5xx is worth another attempt; 4xx means the payload is bad.
            DeliveryError::Rejected { status } => *status >= 500,
            DeliveryError::Exhausted { .. } => false,
        },
        Error::Config(_) | Error::Json(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(is_retryable(&Error::Store(StoreError::Contention(
            "busy".into()
        ))));
        assert!(is_retryable(&Error::Delivery(DeliveryError::Unreachable(
            "refused".into()
        ))));
        assert!(is_retryable(&Error::Delivery(DeliveryError::Rejected {
            status: 503
        })));
        assert!(!is_retryable(&Error::Delivery(DeliveryError::Rejected {
            status: 422
        })));
        assert!(!is_retryable(&Error::Store(StoreError::Validation(
            "negative counter".into()
        ))));
        assert!(!is_retryable(&Error::Store(StoreError::Corruption {
            details: "bad page".into()
        })));
    }

    #[test]
    fn busy_maps_to_contention() {
        let sqlite_err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            Some("database is locked".to_string()),
        );
        let err = StoreError::from(sqlite_err);
        assert!(matches!(err, StoreError::Contention(_)));
    }

    #[test]
    fn error_display_includes_context() {
        let err = Error::Store(StoreError::NotFound("run-42".to_string()));
        assert!(err.to_string().contains("run-42"));

        let err = Error::Delivery(DeliveryError::Rejected { status: 500 });
        assert!(err.to_string().contains("500"));
    }
}
