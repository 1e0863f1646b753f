//! Connection lifecycle metadata.

use std::time::Duration;

use tokio::time::Instant;

/// Pool bookkeeping attached to every connection.
#[derive(Debug, Clone)]
pub struct ConnectionMetadata {
    /// Unique identifier, assigned at creation, never reused within a pool.
    pub id: u64,

    /// When the connection was created.
    pub created_at: Instant,

    /// When the connection last changed hands (checked out or returned).
    pub last_used_at: Instant,

    /// Number of times the connection has been checked out.
    pub usage_count: u64,
}

impl ConnectionMetadata {
    pub(crate) fn new(id: u64) -> Self {
        let now = Instant::now();
        Self {
            id,
            created_at: now,
            last_used_at: now,
            usage_count: 0,
        }
    }

    /// Time since the connection was created.
    #[must_use]
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Time since the connection last changed hands.
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_used_at.elapsed()
    }
}

/// A raw connection together with its pool metadata.
///
/// Lives in the idle registry when parked, travels inside a
/// [`PooledConnection`](crate::PooledConnection) while on loan.
pub(crate) struct PoolEntry<T> {
    pub(crate) raw: T,
    pub(crate) meta: ConnectionMetadata,
}

/// What a single health pass did.
#[derive(Debug, Clone, Copy, Default)]
pub struct HealthCheckReport {
    /// Idle connections evicted for exceeding the idle timeout.
    pub evicted: u32,

    /// Idle connections destroyed after failing the liveness probe.
    pub probe_failures: u32,

    /// Connections created to restore the minimum floor or serve waiters.
    pub created: u32,

    /// Cancelled waiters swept from the queue.
    pub swept_waiters: u32,
}

impl HealthCheckReport {
    /// Whether the pass changed anything.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.evicted == 0 && self.probe_failures == 0 && self.created == 0 && self.swept_waiters == 0
    }
}
