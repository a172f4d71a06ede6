use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Duplicate collection name or storage key: {0}")]
    DuplicateName(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl From<sqlx::Error> for StoreError {
    #[inline]
    fn from(err: sqlx::Error) -> Self {
        // A vanished chunk table means the collection was dropped out from
        // under this operation; surface that as NotFound, not corruption.
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.message().contains("no such table") {
                return StoreError::NotFound(db_err.message().to_string());
            }
        }
        StoreError::Storage(err.to_string())
    }
}

impl From<lancedb::Error> for StoreError {
    #[inline]
    fn from(err: lancedb::Error) -> Self {
        match err {
            lancedb::Error::TableNotFound { name } => {
                StoreError::NotFound(format!("vector table {name}"))
            }
            other => StoreError::Storage(other.to_string()),
        }
    }
}

impl StoreError {
    /// True when the underlying driver error is a uniqueness-constraint
    /// violation rather than a medium failure.
    #[inline]
    pub fn is_unique_violation(err: &sqlx::Error) -> bool {
        err.as_database_error()
            .is_some_and(|db_err| db_err.kind() == sqlx::error::ErrorKind::UniqueViolation)
    }
}

pub mod commands;
pub mod config;
pub mod database;
pub mod store;
