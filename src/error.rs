use thiserror::Error;

/// Failures raised by the alert and aggregate stores.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),

    /// Contention, lock or I/O timeouts. Worth another attempt.
    #[error("transient store failure: {0}")]
    Transient(String),

    #[error("invalid record: {0}")]
    Validation(String),

    #[error("store failure: {0}")]
    Permanent(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

const TRANSIENT_SQLSTATES: [&str; 4] = [
    "40001", // serialization_failure
    "40P01", // deadlock_detected
    "55P03", // lock_not_available
    "57014", // query_canceled
];

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => StoreError::NotFound(err.to_string()),
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
                StoreError::Transient(err.to_string())
            }
            sqlx::Error::Database(db) => {
                let code = db.code();
                if code
                    .as_deref()
                    .is_some_and(|code| TRANSIENT_SQLSTATES.contains(&code))
                {
                    StoreError::Transient(err.to_string())
                } else {
                    StoreError::Permanent(err.to_string())
                }
            }
            _ => StoreError::Permanent(err.to_string()),
        }
    }
}

/// Cache backend faults. Never surfaced past the cache layer.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache backend unavailable: {0}")]
    Backend(#[from] redis::RedisError),
}
