//! Pool configuration.

use std::time::Duration;

use crate::error::PoolError;

/// Configuration for a connection pool.
///
/// All options have sensible defaults; use the fluent setters to override
/// individual values:
///
/// ```rust
/// use std::time::Duration;
/// use dbpool::PoolConfig;
///
/// let config = PoolConfig::new()
///     .min_connections(5)
///     .max_connections(20)
///     .idle_timeout(Duration::from_secs(300));
/// ```
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Minimum number of connections the pool keeps open.
    ///
    /// The pool creates this many connections on startup and the health
    /// task tops back up to this floor after evictions and failures.
    pub min_connections: u32,

    /// Maximum number of connections the pool will open.
    ///
    /// Once `active + idle` reaches this bound, further acquisitions queue
    /// up until a connection is returned or their timeout fires.
    pub max_connections: u32,

    /// How long an acquisition waits for a connection before giving up.
    pub acquire_timeout: Duration,

    /// Idle connections unused for longer than this are evicted by the
    /// health task (never below `min_connections`).
    pub idle_timeout: Duration,

    /// Interval between health task passes.
    pub health_check_interval: Duration,

    /// Probe idle connections for liveness during health passes.
    ///
    /// Connections that fail the probe are destroyed instead of recycled.
    pub validate_on_health_check: bool,

    /// How long `close` waits for checked-out connections to come back
    /// before abandoning them.
    pub close_grace: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 1,
            max_connections: 10,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(300),
            health_check_interval: Duration::from_secs(30),
            validate_on_health_check: false,
            close_grace: Duration::from_secs(10),
        }
    }
}

impl PoolConfig {
    /// Create a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the minimum number of connections.
    #[must_use]
    pub fn min_connections(mut self, count: u32) -> Self {
        self.min_connections = count;
        self
    }

    /// Set the maximum number of connections.
    #[must_use]
    pub fn max_connections(mut self, count: u32) -> Self {
        self.max_connections = count;
        self
    }

    /// Set the connection acquisition timeout.
    #[must_use]
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Set the idle connection timeout.
    #[must_use]
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set the interval between health task passes.
    #[must_use]
    pub fn health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    /// Enable or disable liveness probing of idle connections.
    #[must_use]
    pub fn validate_on_health_check(mut self, enabled: bool) -> Self {
        self.validate_on_health_check = enabled;
        self
    }

    /// Set the shutdown grace period for checked-out connections.
    #[must_use]
    pub fn close_grace(mut self, grace: Duration) -> Self {
        self.close_grace = grace;
        self
    }

    /// Validate the configuration.
    pub fn validate<E>(&self) -> Result<(), PoolError<E>> {
        if self.max_connections == 0 {
            return Err(PoolError::Config(
                "max_connections must be at least 1".into(),
            ));
        }
        if self.min_connections > self.max_connections {
            return Err(PoolError::Config(format!(
                "min_connections ({}) exceeds max_connections ({})",
                self.min_connections, self.max_connections
            )));
        }
        if self.health_check_interval.is_zero() {
            return Err(PoolError::Config(
                "health_check_interval must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type ValidateResult = Result<(), PoolError<std::io::Error>>;

    #[test]
    fn test_default_config() {
        let config = PoolConfig::default();
        assert_eq!(config.min_connections, 1);
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.acquire_timeout, Duration::from_secs(30));
        assert!(!config.validate_on_health_check);
    }

    #[test]
    fn test_fluent_setters() {
        let config = PoolConfig::new()
            .min_connections(5)
            .max_connections(50)
            .acquire_timeout(Duration::from_secs(5))
            .idle_timeout(Duration::from_secs(60))
            .health_check_interval(Duration::from_secs(15))
            .validate_on_health_check(true)
            .close_grace(Duration::from_secs(2));

        assert_eq!(config.min_connections, 5);
        assert_eq!(config.max_connections, 50);
        assert_eq!(config.acquire_timeout, Duration::from_secs(5));
        assert_eq!(config.idle_timeout, Duration::from_secs(60));
        assert_eq!(config.health_check_interval, Duration::from_secs(15));
        assert!(config.validate_on_health_check);
        assert_eq!(config.close_grace, Duration::from_secs(2));
    }

    #[test]
    fn test_validate_rejects_zero_max() {
        let result: ValidateResult = PoolConfig::new().max_connections(0).validate();
        assert!(matches!(result, Err(PoolError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_min_above_max() {
        let result: ValidateResult = PoolConfig::new()
            .min_connections(8)
            .max_connections(4)
            .validate();
        assert!(matches!(result, Err(PoolError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let result: ValidateResult = PoolConfig::new()
            .health_check_interval(Duration::ZERO)
            .validate();
        assert!(matches!(result, Err(PoolError::Config(_))));
    }

    #[test]
    fn test_validate_accepts_defaults() {
        let result: ValidateResult = PoolConfig::default().validate();
        assert!(result.is_ok());
    }
}
