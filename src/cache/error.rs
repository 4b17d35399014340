//! Cache-specific error types

use thiserror::Error;

/// Cache operation errors
#[derive(Debug, Error)]
pub enum CacheError {
    /// Redis unavailable, network issues, pool exhaustion
    #[error("Cache connection error: {0}")]
    ConnectionError(String),
    #[error("Cache operation error: {0}")]
    OperationError(String),
}

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        CacheError::ConnectionError(err.to_string())
    }
}

impl From<bb8::RunError<redis::RedisError>> for CacheError {
    fn from(err: bb8::RunError<redis::RedisError>) -> Self {
        CacheError::ConnectionError(format!("Pool error: {}", err))
    }
}

/// Result type alias for cache operations
pub type CacheResult<T> = Result<T, CacheError>;
