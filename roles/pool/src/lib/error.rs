//! Common error types for the pool daemon.

use thiserror::Error;

/// Main error type for pool operations.
#[derive(Error, Debug)]
pub enum PoolError {
    /// I/O errors from tokio or std
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors (fail-fast at startup)
    #[error("configuration error: {0}")]
    Config(String),

    /// Malformed or out-of-order stratum traffic; ends the connection
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Node RPC failures that feed the reconnect loop
    #[error("upstream unavailable: {0}")]
    Upstream(String),

    /// Database failures; the enclosing transaction has been rolled back
    #[error("persistence error: {0}")]
    Persistence(#[from] storage_kas::StorageError),

    /// Channel communication errors
    #[error("channel error: {0}")]
    Channel(String),

    /// Generic errors
    #[error("{0}")]
    Other(String),
}

impl<T> From<async_channel::SendError<T>> for PoolError {
    fn from(err: async_channel::SendError<T>) -> Self {
        PoolError::Channel(format!("failed to send: {}", err))
    }
}

/// Convenience type alias for Results using [`PoolError`].
pub type PoolResult<T> = Result<T, PoolError>;
