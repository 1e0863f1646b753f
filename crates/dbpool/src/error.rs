//! Pool error types.

use std::time::Duration;

use thiserror::Error;

/// Errors returned by pool operations.
///
/// The generic parameter `E` is the factory's error type, so factory
/// failures surface to callers with their original cause attached.
#[derive(Debug, Error)]
pub enum PoolError<E> {
    /// No connection became available within the acquisition timeout.
    ///
    /// The pool is healthy but saturated. Callers may retry, back off, or
    /// surface a "system busy" response.
    #[error("timed out after {waited:?} waiting for a connection")]
    AcquireTimeout {
        /// How long the caller waited before giving up.
        waited: Duration,
    },

    /// The factory failed to create a new connection.
    #[error("failed to create a new connection")]
    ConnectionCreation(#[source] E),

    /// The pool has begun or completed shutdown.
    #[error("pool is closed")]
    PoolClosed,

    /// The pool configuration is invalid.
    #[error("invalid pool configuration: {0}")]
    Config(String),
}

impl<E> PoolError<E> {
    /// Whether the operation is worth retrying against the same pool.
    ///
    /// Timeouts and creation failures are transient; a closed pool or a
    /// rejected configuration is not.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::AcquireTimeout { .. } | Self::ConnectionCreation(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let timeout: PoolError<std::io::Error> = PoolError::AcquireTimeout {
            waited: Duration::from_millis(100),
        };
        assert!(timeout.is_retryable());

        let closed: PoolError<std::io::Error> = PoolError::PoolClosed;
        assert!(!closed.is_retryable());

        let config: PoolError<std::io::Error> = PoolError::Config("bad".into());
        assert!(!config.is_retryable());
    }
}
