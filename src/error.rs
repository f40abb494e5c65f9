//! Error types for the Meridian engine

use thiserror::Error;

/// Main error type for engine operations
#[derive(Error, Debug, Clone)]
pub enum EngineError {
    /// Persistent store error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Invalid channel or engine configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Connector I/O failure, transient; the destination queue retries these
    #[error("Transport error: {0}")]
    Transport(String),

    /// User script threw or exceeded its wall-clock budget
    #[error("Script error: {0}")]
    Script(String),

    /// Message id allocation failed after retries
    #[error("Sequence allocation failed: {0}")]
    Allocation(String),

    /// Stop/halt propagation; in-flight operations terminate with this
    #[error("Operation halted")]
    Halted,

    /// Channel is deployed in shadow mode and not promoted; source refuses input
    #[error("Channel is in shadow mode")]
    ShadowMode,

    /// Serialization / codec failure
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(String),

    /// Generic error with message
    #[error("{0}")]
    Generic(String),
}

/// Errors raised by the persistent store
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    /// Required tables could not be created, or schema drifted
    #[error("Schema error: {0}")]
    Schema(String),

    /// Foreign key or unique constraint violated
    #[error("Integrity error: {0}")]
    Integrity(String),

    /// Optimistic CAS version mismatch; caller may re-read and retry
    #[error("Version conflict: {0}")]
    Conflict(String),

    /// Underlying driver failure
    #[error("Driver error: {0}")]
    Driver(String),
}

/// Convenient Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// Whether a failed dispatch with this error should be retried.
    /// Transport and I/O failures are transient; anything else fails the
    /// attempt outright regardless of the retry budget.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Transport(_) | EngineError::Io(_))
    }
}

impl From<String> for EngineError {
    fn from(msg: String) -> Self {
        EngineError::Generic(msg)
    }
}

impl From<&str> for EngineError {
    fn from(msg: &str) -> Self {
        EngineError::Generic(msg.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Io(err.to_string())
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) => {
                // 23xxx is the SQL-state class for integrity violations
                if db.code().map(|c| c.starts_with("23")).unwrap_or(false) {
                    StoreError::Integrity(db.to_string())
                } else {
                    StoreError::Driver(db.to_string())
                }
            }
            _ => StoreError::Driver(err.to_string()),
        }
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        EngineError::Store(err.into())
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Driver(err.to_string())
    }
}

impl From<redis::RedisError> for EngineError {
    fn from(err: redis::RedisError) -> Self {
        EngineError::Store(StoreError::Driver(err.to_string()))
    }
}
