//! Error types for Storegate.

use thiserror::Error;

/// Main error type for Storegate operations.
#[derive(Error, Debug)]
pub enum StoregateError {
    /// A quota rule denied the unit of work
    #[error("Rate limit exceeded for {key}. Retry after {retry_after_secs} seconds.")]
    QuotaExceeded {
        key: String,
        retry_after_secs: u64,
    },

    /// Every optimistic attempt lost the race to a concurrent writer
    #[error("Could not update {key} due to high contention after {attempts} attempts")]
    ContentionExhausted { key: String, attempts: u32 },

    /// The shared store could not be reached
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// The store answered, but with something we cannot use
    #[error("Store error: {0}")]
    Store(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoregateError {
    /// Status code a transport layer should answer with.
    ///
    /// Quota denials are the originator's problem (429). Contention and
    /// store failures are ours.
    pub fn status_code(&self) -> u16 {
        match self {
            StoregateError::QuotaExceeded { .. } => 429,
            StoregateError::StoreUnavailable(_) => 503,
            _ => 500,
        }
    }

    /// Whether the failure was caused by the server side rather than the request.
    pub fn is_server_error(&self) -> bool {
        self.status_code() >= 500
    }
}

impl From<redis::RedisError> for StoregateError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error()
            || err.is_connection_refusal()
            || err.is_connection_dropped()
            || err.is_timeout()
        {
            StoregateError::StoreUnavailable(err.to_string())
        } else {
            StoregateError::Store(err.to_string())
        }
    }
}

impl From<::config::ConfigError> for StoregateError {
    fn from(err: ::config::ConfigError) -> Self {
        StoregateError::Config(err.to_string())
    }
}

/// Result type alias for Storegate operations.
pub type Result<T> = std::result::Result<T, StoregateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        let quota = StoregateError::QuotaExceeded {
            key: "ip:10.0.0.1".to_string(),
            retry_after_secs: 12,
        };
        assert_eq!(quota.status_code(), 429);
        assert!(!quota.is_server_error());

        let contention = StoregateError::ContentionExhausted {
            key: "product:1:views".to_string(),
            attempts: 5,
        };
        assert_eq!(contention.status_code(), 500);
        assert!(contention.is_server_error());

        let unavailable = StoregateError::StoreUnavailable("connection refused".to_string());
        assert_eq!(unavailable.status_code(), 503);
    }

    #[test]
    fn test_quota_message_carries_retry_after() {
        let err = StoregateError::QuotaExceeded {
            key: "ip:10.0.0.1".to_string(),
            retry_after_secs: 42,
        };
        assert_eq!(
            err.to_string(),
            "Rate limit exceeded for ip:10.0.0.1. Retry after 42 seconds."
        );
    }

    #[test]
    fn test_redis_io_error_is_unavailable() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err: StoregateError = redis::RedisError::from(io).into();
        assert!(matches!(err, StoregateError::StoreUnavailable(_)));
    }

    #[test]
    fn test_redis_type_error_is_store_error() {
        let err: StoregateError =
            redis::RedisError::from((redis::ErrorKind::TypeError, "not an integer")).into();
        assert!(matches!(err, StoregateError::Store(_)));
    }
}
