//! Test infrastructure for dbpool development.
//!
//! Provides [`MockFactory`], an in-memory [`ConnectionFactory`] with
//! controllable latency and failure injection, plus small helpers for
//! writing deterministic async pool tests. The pool integration test suite
//! lives in this crate's `tests/` directory, keeping `dbpool` itself free
//! of circular dev-dependencies.

#![warn(missing_docs)]
#![deny(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dbpool::ConnectionFactory;
use thiserror::Error;

/// Errors injected by [`MockFactory`].
#[derive(Debug, Error)]
pub enum MockError {
    /// An injected connection creation failure.
    #[error("injected create failure")]
    CreateFailed,

    /// An injected liveness probe failure.
    #[error("injected probe failure")]
    ProbeFailed,
}

/// An in-memory stand-in for a database connection.
#[derive(Debug)]
pub struct MockConnection {
    /// Serial number assigned by the factory, starting at 1.
    pub serial: u64,
}

/// A [`ConnectionFactory`] for tests.
///
/// Clones share the same counters and failure knobs, so tests can keep a
/// handle for assertions after moving a clone into the pool:
///
/// ```rust,ignore
/// let factory = MockFactory::new();
/// let pool = Pool::new(factory.clone(), config).await?;
/// // ...
/// assert_eq!(factory.created(), 2);
/// ```
#[derive(Clone)]
pub struct MockFactory {
    shared: Arc<MockShared>,
    create_delay: Duration,
}

#[derive(Default)]
struct MockShared {
    serial: AtomicU64,
    create_attempts: AtomicU64,
    created: AtomicU64,
    destroyed: AtomicU64,
    fail_next_creates: AtomicU64,
    fail_creates_after: AtomicU64,
    fail_probes: AtomicBool,
}

impl MockFactory {
    /// Create a factory that succeeds instantly.
    #[must_use]
    pub fn new() -> Self {
        let shared = MockShared {
            fail_creates_after: AtomicU64::new(u64::MAX),
            ..MockShared::default()
        };
        Self {
            shared: Arc::new(shared),
            create_delay: Duration::ZERO,
        }
    }

    /// Make every creation take `delay` of (virtual) time.
    #[must_use]
    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = delay;
        self
    }

    /// Fail the next `count` creation attempts.
    pub fn fail_next_creates(&self, count: u64) {
        self.shared.fail_next_creates.store(count, Ordering::Release);
    }

    /// Fail every creation attempt after the first `successes`.
    pub fn fail_creates_after(&self, successes: u64) {
        self.shared
            .fail_creates_after
            .store(successes, Ordering::Release);
    }

    /// Clear all creation failure injection.
    pub fn clear_create_failures(&self) {
        self.shared.fail_next_creates.store(0, Ordering::Release);
        self.shared
            .fail_creates_after
            .store(u64::MAX, Ordering::Release);
    }

    /// Fail (or stop failing) every liveness probe.
    pub fn fail_probes(&self, enabled: bool) {
        self.shared.fail_probes.store(enabled, Ordering::Release);
    }

    /// Total creation attempts, including injected failures.
    #[must_use]
    pub fn create_attempts(&self) -> u64 {
        self.shared.create_attempts.load(Ordering::Acquire)
    }

    /// Connections successfully created.
    #[must_use]
    pub fn created(&self) -> u64 {
        self.shared.created.load(Ordering::Acquire)
    }

    /// Connections destroyed.
    #[must_use]
    pub fn destroyed(&self) -> u64 {
        self.shared.destroyed.load(Ordering::Acquire)
    }

    /// Connections currently alive (created minus destroyed).
    #[must_use]
    pub fn live(&self) -> u64 {
        self.created().saturating_sub(self.destroyed())
    }

    fn take_injected_failure(&self) -> bool {
        let next_failed = self
            .shared
            .fail_next_creates
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if next_failed {
            return true;
        }
        let attempts = self.shared.create_attempts.load(Ordering::Acquire);
        attempts > self.shared.fail_creates_after.load(Ordering::Acquire)
    }
}

impl Default for MockFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConnectionFactory for MockFactory {
    type Connection = MockConnection;
    type Error = MockError;

    async fn create(&self) -> Result<MockConnection, MockError> {
        self.shared.create_attempts.fetch_add(1, Ordering::AcqRel);
        if !self.create_delay.is_zero() {
            tokio::time::sleep(self.create_delay).await;
        }
        if self.take_injected_failure() {
            tracing::debug!("mock factory failing create");
            return Err(MockError::CreateFailed);
        }
        self.shared.created.fetch_add(1, Ordering::AcqRel);
        let serial = self.shared.serial.fetch_add(1, Ordering::AcqRel) + 1;
        Ok(MockConnection { serial })
    }

    async fn destroy(&self, conn: MockConnection) -> Result<(), MockError> {
        tracing::debug!(serial = conn.serial, "mock factory destroying connection");
        self.shared.destroyed.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    async fn probe(&self, conn: &mut MockConnection) -> Result<(), MockError> {
        if self.shared.fail_probes.load(Ordering::Acquire) {
            tracing::debug!(serial = conn.serial, "mock factory failing probe");
            return Err(MockError::ProbeFailed);
        }
        Ok(())
    }
}

/// Yield the scheduler until `predicate` holds.
///
/// Lets spawned tasks make progress without advancing the (possibly
/// paused) clock; fails the test after a generous number of turns.
pub async fn wait_for(predicate: impl Fn() -> bool) {
    for _ in 0..1000 {
        if predicate() {
            return;
        }
        tokio::task::yield_now().await;
    }
    assert!(
        predicate(),
        "condition not reached within 1000 scheduler turns"
    );
}

/// Install a test-friendly tracing subscriber (idempotent).
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_factory_counts_and_failures() {
        let factory = MockFactory::new();

        let conn = factory.create().await.unwrap();
        assert_eq!(conn.serial, 1);
        assert_eq!(factory.created(), 1);
        assert_eq!(factory.create_attempts(), 1);

        factory.fail_next_creates(1);
        assert!(matches!(
            factory.create().await,
            Err(MockError::CreateFailed)
        ));
        assert_eq!(factory.created(), 1);
        assert_eq!(factory.create_attempts(), 2);

        factory.destroy(conn).await.unwrap();
        assert_eq!(factory.destroyed(), 1);
        assert_eq!(factory.live(), 0);
    }

    #[tokio::test]
    async fn test_mock_factory_fail_after() {
        let factory = MockFactory::new();
        factory.fail_creates_after(1);

        assert!(factory.create().await.is_ok());
        assert!(factory.create().await.is_err());
        assert!(factory.create().await.is_err());

        factory.clear_create_failures();
        assert!(factory.create().await.is_ok());
    }

    #[tokio::test]
    async fn test_mock_factory_probe_injection() {
        let factory = MockFactory::new();
        let mut conn = factory.create().await.unwrap();

        assert!(factory.probe(&mut conn).await.is_ok());
        factory.fail_probes(true);
        assert!(matches!(
            factory.probe(&mut conn).await,
            Err(MockError::ProbeFailed)
        ));
    }
}
