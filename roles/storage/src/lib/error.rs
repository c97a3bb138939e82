//! Error handling for the persistence gateway.

use std::fmt;

/// Errors that can occur during persistence operations.
#[derive(Debug)]
pub enum StorageError {
    /// Backend-specific error (database connection, query failure, etc.)
    BackendError(String),
    /// Data not found in storage
    NotFound(String),
    /// Invalid data format
    InvalidData(String),
    /// Configuration error
    ConfigError(String),
    /// Storage backend not available
    BackendUnavailable,
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::BackendError(msg) => write!(f, "Backend error: {}", msg),
            StorageError::NotFound(msg) => write!(f, "Not found: {}", msg),
            StorageError::InvalidData(msg) => write!(f, "Invalid data: {}", msg),
            StorageError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            StorageError::BackendUnavailable => write!(f, "Storage backend unavailable"),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<sqlx::Error> for StorageError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => StorageError::NotFound("row not found".to_string()),
            other => StorageError::BackendError(other.to_string()),
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;
