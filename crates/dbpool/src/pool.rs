//! Connection pool implementation.
//!
//! The pool owns three collections: the idle registry, the active set, and
//! the waiter queue. All three live behind one mutex that is never held
//! across an await; the only suspension points are factory creation (which
//! runs outside the lock) and waiting in the queue.

use std::collections::HashMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::factory::ConnectionFactory;
use crate::lifecycle::{ConnectionMetadata, HealthCheckReport, PoolEntry};
use crate::waiters::{WaitQueue, Waiter};

/// A bounded pool of reusable database connections.
///
/// Connections are created and destroyed through an injected
/// [`ConnectionFactory`]; the pool handles admission control, reuse,
/// FIFO-fair waiting under exhaustion, idle eviction, and shutdown.
///
/// The pool is cheap to clone; clones share the same state.
///
/// # Example
///
/// ```rust,ignore
/// use dbpool::{Pool, PoolConfig};
///
/// let pool = Pool::builder(factory)
///     .min_connections(5)
///     .max_connections(20)
///     .build()
///     .await?;
///
/// let conn = pool.get().await?;
/// // Use the connection...
/// // Returned to the pool when dropped.
///
/// pool.close().await;
/// ```
pub struct Pool<F: ConnectionFactory> {
    inner: Arc<PoolInner<F>>,
}

impl<F: ConnectionFactory> Clone for Pool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct PoolInner<F: ConnectionFactory> {
    /// The injected create/destroy/probe capability.
    factory: F,

    /// Pool configuration, fixed at construction.
    config: PoolConfig,

    /// Idle registry, active set, waiter queue, and slot reservations.
    /// Mutated only under this lock, never held across an await.
    state: Mutex<PoolState<F>>,

    /// Set once by `close`; checked on every acquisition path.
    closed: AtomicBool,

    /// Counter for generating connection ids.
    next_connection_id: AtomicU64,

    /// Counter for generating waiter ids.
    next_waiter_id: AtomicU64,

    /// Signalled when a loan comes back while the pool is draining.
    drained: Notify,

    /// When the pool was created.
    created_at: Instant,

    /// Pool metrics.
    metrics: Mutex<MetricsInner>,

    /// Health task handle, aborted on close.
    reaper: Mutex<Option<JoinHandle<()>>>,
}

struct PoolState<F: ConnectionFactory> {
    /// Connections available for reuse. Pushed and popped at the back, so
    /// reuse is most-recently-released first and the least-recently-used
    /// entries age toward the front.
    idle: Vec<PoolEntry<F::Connection>>,

    /// Loan bookkeeping for connections currently checked out, by id.
    active: HashMap<u64, LoanInfo>,

    /// Pending acquisitions, oldest first.
    waiters: WaitQueue<PooledConnection<F>>,

    /// Slots held for in-flight creations and health probes. Counted
    /// against `max_connections` so concurrent creations cannot overshoot.
    reserved: u32,
}

#[derive(Debug, Clone, Copy)]
struct LoanInfo {
    checked_out_at: Instant,
}

/// RAII hold on one reserved capacity slot.
///
/// Gives the slot back (and refills for anyone waiting on it) unless the
/// connection it was reserved for materialized, covering every early-exit
/// path including the owning future being dropped mid-create.
struct SlotReservation<F: ConnectionFactory> {
    inner: Arc<PoolInner<F>>,
    consumed: bool,
}

impl<F: ConnectionFactory> SlotReservation<F> {
    fn new(inner: Arc<PoolInner<F>>) -> Self {
        Self {
            inner,
            consumed: false,
        }
    }

    /// The slot was accounted for elsewhere; skip the give-back.
    fn consume(mut self) {
        self.consumed = true;
    }
}

impl<F: ConnectionFactory> Drop for SlotReservation<F> {
    fn drop(&mut self) {
        if self.consumed {
            return;
        }
        self.inner.state.lock().reserved -= 1;
        self.inner.spawn_refill();
    }
}

/// Idle connections pulled out for probing, each holding a reserved slot.
///
/// Anything left in the batch when it drops (probe loop abandoned) goes
/// straight back to the idle registry with its reservation released.
struct ProbeBatch<F: ConnectionFactory> {
    inner: Arc<PoolInner<F>>,
    entries: Vec<PoolEntry<F::Connection>>,
}

impl<F: ConnectionFactory> Drop for ProbeBatch<F> {
    fn drop(&mut self) {
        if self.entries.is_empty() {
            return;
        }
        let mut state = self.inner.state.lock();
        for entry in self.entries.drain(..) {
            state.reserved -= 1;
            state.idle.push(entry);
        }
    }
}

impl<F: ConnectionFactory> PoolState<F> {
    fn total(&self) -> u32 {
        self.idle.len() as u32 + self.active.len() as u32 + self.reserved
    }

    /// Pop the most recently released idle connection and mark it active.
    fn checkout_idle(&mut self) -> Option<PoolEntry<F::Connection>> {
        let mut entry = self.idle.pop()?;
        let now = Instant::now();
        entry.meta.usage_count += 1;
        entry.meta.last_used_at = now;
        self.active
            .insert(entry.meta.id, LoanInfo { checked_out_at: now });
        Some(entry)
    }
}

/// Internal metrics tracking.
#[derive(Debug, Default)]
struct MetricsInner {
    connections_created: u64,
    connections_closed: u64,
    connections_detached: u64,
    checkouts_successful: u64,
    checkouts_failed: u64,
    acquire_timeouts: u64,
    creation_failures: u64,
    invalid_releases: u64,
    idle_evictions: u64,
    health_checks_performed: u64,
    health_checks_failed: u64,
}

/// How a caller proceeds after the admission decision.
enum Plan<F: ConnectionFactory> {
    /// An idle connection was handed out synchronously.
    Ready(PoolEntry<F::Connection>),
    /// A capacity slot was reserved; create through the factory.
    Create,
    /// Pool exhausted; parked in the waiter queue.
    Wait {
        rx: oneshot::Receiver<PooledConnection<F>>,
        id: u64,
    },
}

impl<F: ConnectionFactory> Pool<F> {
    /// Create a new pool builder around the given factory.
    #[must_use]
    pub fn builder(factory: F) -> PoolBuilder<F> {
        PoolBuilder::new(factory)
    }

    /// Create a new pool with the given configuration.
    ///
    /// Eagerly creates `min_connections` connections so the first callers
    /// do not pay establishment latency; fails with
    /// [`PoolError::ConnectionCreation`] (unwinding anything it created)
    /// if the factory cannot satisfy the floor.
    pub async fn new(factory: F, config: PoolConfig) -> Result<Self, PoolError<F::Error>> {
        config.validate()?;

        let health_check_interval = config.health_check_interval;
        let inner = Arc::new(PoolInner {
            factory,
            config,
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                active: HashMap::new(),
                waiters: WaitQueue::new(),
                reserved: 0,
            }),
            closed: AtomicBool::new(false),
            next_connection_id: AtomicU64::new(1),
            next_waiter_id: AtomicU64::new(1),
            drained: Notify::new(),
            created_at: Instant::now(),
            metrics: Mutex::new(MetricsInner::default()),
            reaper: Mutex::new(None),
        });

        for _ in 0..inner.config.min_connections {
            match inner.factory.create().await {
                Ok(raw) => {
                    let entry = inner.new_entry(raw);
                    inner.metrics.lock().connections_created += 1;
                    inner.state.lock().idle.push(entry);
                }
                Err(e) => {
                    // Unwind the partial cold start before reporting.
                    let created: Vec<_> = inner.state.lock().idle.drain(..).collect();
                    for entry in created {
                        inner.destroy_entry(entry, "cold start unwind").await;
                    }
                    inner.metrics.lock().creation_failures += 1;
                    return Err(PoolError::ConnectionCreation(e));
                }
            }
        }

        let reaper = tokio::spawn(reaper_loop(Arc::downgrade(&inner), health_check_interval));
        *inner.reaper.lock() = Some(reaper);

        tracing::info!(
            min = inner.config.min_connections,
            max = inner.config.max_connections,
            "connection pool created"
        );

        Ok(Self { inner })
    }

    /// Get a connection from the pool.
    ///
    /// Returns an idle connection when one is available, creates a new one
    /// when capacity remains, and otherwise waits (FIFO behind earlier
    /// callers) until a connection is released or the configured
    /// [`acquire_timeout`](PoolConfig::acquire_timeout) fires.
    pub async fn get(&self) -> Result<PooledConnection<F>, PoolError<F::Error>> {
        self.get_with_timeout(self.inner.config.acquire_timeout)
            .await
    }

    /// Get a connection, overriding the configured acquisition timeout.
    pub async fn get_with_timeout(
        &self,
        timeout: Duration,
    ) -> Result<PooledConnection<F>, PoolError<F::Error>> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            inner.metrics.lock().checkouts_failed += 1;
            return Err(PoolError::PoolClosed);
        }
        let deadline = Instant::now() + timeout;

        let plan = {
            let mut state = inner.state.lock();
            // Re-check under the lock: a close that began after the check
            // above has already drained the queue, so enqueueing now would
            // strand the waiter.
            if inner.closed.load(Ordering::Acquire) {
                drop(state);
                inner.metrics.lock().checkouts_failed += 1;
                return Err(PoolError::PoolClosed);
            }
            if let Some(entry) = state.checkout_idle() {
                Plan::Ready(entry)
            } else if state.total() < inner.config.max_connections {
                state.reserved += 1;
                Plan::Create
            } else {
                let (tx, rx) = oneshot::channel();
                let id = inner.next_waiter_id.fetch_add(1, Ordering::Relaxed);
                state.waiters.push(Waiter {
                    id,
                    tx,
                    enqueued_at: Instant::now(),
                });
                Plan::Wait { rx, id }
            }
        };

        match plan {
            Plan::Ready(entry) => {
                inner.metrics.lock().checkouts_successful += 1;
                tracing::trace!(connection_id = entry.meta.id, "reusing idle connection");
                Ok(PooledConnection::new(entry, Arc::downgrade(inner)))
            }
            Plan::Create => inner.create_for_caller(timeout, deadline).await,
            Plan::Wait { rx, id } => inner.wait_for_connection(rx, id, timeout, deadline).await,
        }
    }

    /// Try to get a connection without waiting.
    ///
    /// Returns `Ok(None)` when no idle connection is immediately available;
    /// never creates a new connection.
    pub fn try_get(&self) -> Result<Option<PooledConnection<F>>, PoolError<F::Error>> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(PoolError::PoolClosed);
        }
        let entry = self.inner.state.lock().checkout_idle();
        Ok(entry.map(|entry| {
            self.inner.metrics.lock().checkouts_successful += 1;
            PooledConnection::new(entry, Arc::downgrade(&self.inner))
        }))
    }

    /// Run one health pass immediately and report what it did.
    ///
    /// Identical to a scheduled reaper tick: sweeps cancelled waiters,
    /// evicts idle connections past the idle timeout (never below the
    /// minimum floor), optionally probes the survivors, and tops the pool
    /// back up.
    pub async fn health_check(&self) -> HealthCheckReport {
        self.inner.run_health_pass().await
    }

    /// Get the current pool status.
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        let state = self.inner.state.lock();
        PoolStatus {
            idle: state.idle.len() as u32,
            in_use: state.active.len() as u32,
            waiting: state.waiters.len() as u32,
            total: state.total(),
            max: self.inner.config.max_connections,
        }
    }

    /// Get pool metrics.
    #[must_use]
    pub fn metrics(&self) -> PoolMetrics {
        let inner = self.inner.metrics.lock();
        PoolMetrics {
            connections_created: inner.connections_created,
            connections_closed: inner.connections_closed,
            connections_detached: inner.connections_detached,
            checkouts_successful: inner.checkouts_successful,
            checkouts_failed: inner.checkouts_failed,
            acquire_timeouts: inner.acquire_timeouts,
            creation_failures: inner.creation_failures,
            invalid_releases: inner.invalid_releases,
            idle_evictions: inner.idle_evictions,
            health_checks_performed: inner.health_checks_performed,
            health_checks_failed: inner.health_checks_failed,
            uptime: self.inner.created_at.elapsed(),
        }
    }

    /// Close the pool.
    ///
    /// Queued waiters are rejected with [`PoolError::PoolClosed`], idle
    /// connections are destroyed, and the call waits up to
    /// [`close_grace`](PoolConfig::close_grace) for checked-out connections
    /// to come back (destroying each as it returns). Loans still out when
    /// the grace period lapses are abandoned: their bookkeeping is dropped
    /// and a late-returning guard destroys its own connection.
    ///
    /// Idempotent; all subsequent `get` calls fail immediately.
    pub async fn close(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("closing connection pool");

        if let Some(reaper) = inner.reaper.lock().take() {
            reaper.abort();
        }

        let (waiters, idle) = {
            let mut state = inner.state.lock();
            let waiters = state.waiters.take_all();
            let idle = std::mem::take(&mut state.idle);
            (waiters, idle)
        };
        if !waiters.is_empty() {
            tracing::debug!(waiters = waiters.len(), "rejecting queued acquisitions");
        }
        // Dropping the senders resolves each waiter with PoolClosed.
        drop(waiters);

        for entry in idle {
            inner.destroy_entry(entry, "pool closing").await;
        }

        let deadline = Instant::now() + inner.config.close_grace;
        loop {
            let notified = inner.drained.notified();
            if inner.state.lock().active.is_empty() {
                break;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let abandoned = {
                    let mut state = inner.state.lock();
                    let n = state.active.len();
                    state.active.clear();
                    n
                };
                if abandoned > 0 {
                    tracing::warn!(
                        connections = abandoned,
                        "grace period elapsed, abandoning connections still on loan"
                    );
                }
                break;
            }
        }

        tracing::info!("connection pool closed");
    }

    /// Check if the pool is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Get the pool configuration.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }
}

impl<F: ConnectionFactory> fmt::Debug for Pool<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = self.status();
        f.debug_struct("Pool")
            .field("idle", &status.idle)
            .field("in_use", &status.in_use)
            .field("waiting", &status.waiting)
            .field("max", &status.max)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<F: ConnectionFactory> PoolInner<F> {
    fn new_entry(&self, raw: F::Connection) -> PoolEntry<F::Connection> {
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        PoolEntry {
            raw,
            meta: ConnectionMetadata::new(id),
        }
    }

    /// Create a connection for the caller that reserved a slot.
    ///
    /// The factory runs outside the state lock so slow establishment never
    /// blocks unrelated releases; the acquire deadline bounds it. The
    /// reservation is released on every non-success path, including the
    /// caller's future being dropped mid-create.
    async fn create_for_caller(
        self: &Arc<Self>,
        timeout: Duration,
        deadline: Instant,
    ) -> Result<PooledConnection<F>, PoolError<F::Error>> {
        let reservation = SlotReservation::new(Arc::clone(self));
        match tokio::time::timeout_at(deadline, self.factory.create()).await {
            Ok(Ok(raw)) => {
                let mut entry = self.new_entry(raw);
                let now = Instant::now();
                entry.meta.usage_count = 1;
                entry.meta.last_used_at = now;
                let admitted = {
                    let mut state = self.state.lock();
                    state.reserved -= 1;
                    if self.closed.load(Ordering::Acquire) {
                        false
                    } else {
                        state
                            .active
                            .insert(entry.meta.id, LoanInfo { checked_out_at: now });
                        true
                    }
                };
                reservation.consume();
                if !admitted {
                    self.metrics.lock().checkouts_failed += 1;
                    self.destroy_entry(entry, "pool closed during creation").await;
                    return Err(PoolError::PoolClosed);
                }
                {
                    let mut metrics = self.metrics.lock();
                    metrics.connections_created += 1;
                    metrics.checkouts_successful += 1;
                }
                tracing::debug!(connection_id = entry.meta.id, "created connection for caller");
                Ok(PooledConnection::new(entry, Arc::downgrade(self)))
            }
            Ok(Err(e)) => {
                drop(reservation);
                {
                    let mut metrics = self.metrics.lock();
                    metrics.checkouts_failed += 1;
                    metrics.creation_failures += 1;
                }
                tracing::warn!(error = %e, "connection creation failed");
                Err(PoolError::ConnectionCreation(e))
            }
            Err(_) => {
                drop(reservation);
                {
                    let mut metrics = self.metrics.lock();
                    metrics.checkouts_failed += 1;
                    metrics.acquire_timeouts += 1;
                }
                tracing::debug!(waited = ?timeout, "connection creation exceeded acquire deadline");
                Err(PoolError::AcquireTimeout { waited: timeout })
            }
        }
    }

    /// Park in the waiter queue until handed a connection, the deadline
    /// fires, or the pool closes.
    async fn wait_for_connection(
        self: &Arc<Self>,
        mut rx: oneshot::Receiver<PooledConnection<F>>,
        waiter_id: u64,
        timeout: Duration,
        deadline: Instant,
    ) -> Result<PooledConnection<F>, PoolError<F::Error>> {
        tracing::trace!(waiter_id, "pool exhausted, waiting for a connection");
        match tokio::time::timeout_at(deadline, &mut rx).await {
            Ok(Ok(conn)) => {
                self.metrics.lock().checkouts_successful += 1;
                Ok(conn)
            }
            Ok(Err(_)) => {
                // Sender dropped without a handoff: the pool drained the
                // queue during close.
                self.metrics.lock().checkouts_failed += 1;
                Err(PoolError::PoolClosed)
            }
            Err(_) => {
                // Deadline fired. Whoever mutates the queue first under the
                // lock wins: if the waiter is still queued the timeout
                // stands; if a release already dequeued it, the handoff
                // happened and is accepted.
                let still_queued = self.state.lock().waiters.remove(waiter_id);
                if still_queued {
                    {
                        let mut metrics = self.metrics.lock();
                        metrics.checkouts_failed += 1;
                        metrics.acquire_timeouts += 1;
                    }
                    tracing::debug!(waiter_id, waited = ?timeout, "acquire timed out");
                    return Err(PoolError::AcquireTimeout { waited: timeout });
                }
                match rx.try_recv() {
                    Ok(conn) => {
                        self.metrics.lock().checkouts_successful += 1;
                        Ok(conn)
                    }
                    Err(_) => {
                        self.metrics.lock().checkouts_failed += 1;
                        Err(PoolError::PoolClosed)
                    }
                }
            }
        }
    }

    /// Return a loaned connection to the pool.
    ///
    /// Runs synchronously (called from the guard's `Drop`); destruction of
    /// rejected connections is handed to a background task.
    fn return_connection(self: &Arc<Self>, entry: PoolEntry<F::Connection>, invalidated: bool) {
        let id = entry.meta.id;
        let loan = self.state.lock().active.remove(&id);
        let Some(loan) = loan else {
            // Not on loan as far as the pool knows: a return after close
            // abandoned it, or a double release. Reported, never thrown.
            self.metrics.lock().invalid_releases += 1;
            tracing::warn!(
                connection_id = id,
                "released a connection the pool does not consider active"
            );
            self.spawn_destroy(entry, "unknown release");
            return;
        };
        tracing::trace!(
            connection_id = id,
            held = ?loan.checked_out_at.elapsed(),
            "connection returned"
        );
        if self.closed.load(Ordering::Acquire) {
            self.spawn_destroy(entry, "pool closing");
            self.drained.notify_waiters();
            return;
        }
        if invalidated {
            tracing::debug!(connection_id = id, "destroying invalidated connection");
            self.spawn_destroy(entry, "invalidated by caller");
            self.spawn_refill();
            return;
        }
        if let Some(entry) = self.hand_off_or_park(entry, false) {
            // Pool closed between the membership check and the handoff.
            self.spawn_destroy(entry, "pool closing");
            self.drained.notify_waiters();
        }
    }

    /// Hand a connection to the oldest live waiter, bypassing the idle
    /// registry, or park it idle when nobody is waiting.
    ///
    /// `from_reserved` releases a reservation in the same critical section
    /// so the capacity accounting never transiently undercounts. Returns
    /// the entry when the pool closed meanwhile and the caller must destroy
    /// it.
    fn hand_off_or_park(
        self: &Arc<Self>,
        mut entry: PoolEntry<F::Connection>,
        from_reserved: bool,
    ) -> Option<PoolEntry<F::Connection>> {
        let mut state = self.state.lock();
        if from_reserved {
            state.reserved -= 1;
        }
        if self.closed.load(Ordering::Acquire) {
            return Some(entry);
        }
        let now = Instant::now();
        while let Some(waiter) = state.waiters.pop_oldest() {
            let id = entry.meta.id;
            entry.meta.usage_count += 1;
            entry.meta.last_used_at = now;
            state.active.insert(id, LoanInfo { checked_out_at: now });
            let guard = PooledConnection::new(entry, Arc::downgrade(self));
            match waiter.tx.send(guard) {
                Ok(()) => {
                    tracing::trace!(
                        connection_id = id,
                        waited = ?waiter.enqueued_at.elapsed(),
                        "handed connection to waiter"
                    );
                    return None;
                }
                Err(mut guard) => {
                    // Receiver gone: the caller was cancelled. Reclaim the
                    // entry without running the guard's return path and try
                    // the next waiter.
                    state.active.remove(&id);
                    let Some(mut returned) = guard.entry.take() else {
                        return None;
                    };
                    returned.meta.usage_count -= 1;
                    entry = returned;
                }
            }
        }
        entry.meta.last_used_at = now;
        state.idle.push(entry);
        None
    }

    /// Drop bookkeeping for a detached connection.
    fn forget_loan(self: &Arc<Self>, id: u64) {
        let removed = self.state.lock().active.remove(&id).is_some();
        if !removed {
            return;
        }
        tracing::debug!(connection_id = id, "connection detached from pool");
        self.metrics.lock().connections_detached += 1;
        if self.closed.load(Ordering::Acquire) {
            self.drained.notify_waiters();
        } else {
            self.spawn_refill();
        }
    }

    /// Schedule background creation when the pool owes connections: queued
    /// waiters with spare capacity, or a total below the minimum floor.
    ///
    /// No-op outside a tokio runtime; the reaper covers the debt on its
    /// next tick.
    fn spawn_refill(self: &Arc<Self>) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        {
            let mut state = self.state.lock();
            if self.closed.load(Ordering::Acquire) {
                return;
            }
            let total = state.total();
            let owed = !state.waiters.is_empty() || total < self.config.min_connections;
            if !owed || total >= self.config.max_connections {
                return;
            }
            state.reserved += 1;
        }
        let inner = Arc::clone(self);
        handle.spawn(async move {
            match inner.factory.create().await {
                Ok(raw) => {
                    let entry = inner.new_entry(raw);
                    inner.metrics.lock().connections_created += 1;
                    if let Some(entry) = inner.hand_off_or_park(entry, true) {
                        inner.destroy_entry(entry, "pool closing").await;
                    }
                }
                Err(e) => {
                    inner.state.lock().reserved -= 1;
                    inner.metrics.lock().creation_failures += 1;
                    tracing::warn!(
                        error = %e,
                        "background connection creation failed, retrying on next health pass"
                    );
                }
            }
        });
    }

    /// Destroy a connection without blocking the caller.
    ///
    /// Falls back to dropping the raw handle when no runtime is available;
    /// the factory teardown is then skipped.
    fn spawn_destroy(self: &Arc<Self>, entry: PoolEntry<F::Connection>, reason: &'static str) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let inner = Arc::clone(self);
                handle.spawn(async move {
                    inner.destroy_entry(entry, reason).await;
                });
            }
            Err(_) => {
                self.metrics.lock().connections_closed += 1;
                tracing::warn!(
                    connection_id = entry.meta.id,
                    reason,
                    "dropping connection without factory teardown (no async runtime)"
                );
            }
        }
    }

    /// Run factory teardown for a connection that has left the pool.
    ///
    /// Teardown failures are logged; the record has already left the
    /// bookkeeping, so a failing destroy never leaks a slot.
    async fn destroy_entry(&self, entry: PoolEntry<F::Connection>, reason: &'static str) {
        let id = entry.meta.id;
        tracing::debug!(connection_id = id, reason, "destroying connection");
        if let Err(e) = self.factory.destroy(entry.raw).await {
            tracing::warn!(connection_id = id, error = %e, "connection teardown failed");
        }
        self.metrics.lock().connections_closed += 1;
    }

    /// One reaper pass: sweep cancelled waiters, evict stale idle
    /// connections, probe the survivors, top back up.
    async fn run_health_pass(self: &Arc<Self>) -> HealthCheckReport {
        let mut report = HealthCheckReport::default();
        if self.closed.load(Ordering::Acquire) {
            return report;
        }
        self.metrics.lock().health_checks_performed += 1;

        let now = Instant::now();
        let expired = {
            let mut state = self.state.lock();
            report.swept_waiters = state.waiters.sweep_closed() as u32;
            let mut expired = Vec::new();
            let mut index = 0;
            while index < state.idle.len() {
                if state.total() <= self.config.min_connections {
                    break;
                }
                if now.duration_since(state.idle[index].meta.last_used_at)
                    > self.config.idle_timeout
                {
                    expired.push(state.idle.remove(index));
                } else {
                    index += 1;
                }
            }
            expired
        };
        for entry in expired {
            report.evicted += 1;
            self.metrics.lock().idle_evictions += 1;
            self.destroy_entry(entry, "idle timeout").await;
        }

        if self.config.validate_on_health_check {
            // Take the idle set out under reservations so concurrent
            // acquires neither reuse a connection mid-probe nor overshoot
            // capacity. Leftovers return to idle if the pass is abandoned.
            let mut batch = ProbeBatch {
                inner: Arc::clone(self),
                entries: {
                    let mut state = self.state.lock();
                    let taken = std::mem::take(&mut state.idle);
                    state.reserved += taken.len() as u32;
                    taken
                },
            };
            loop {
                let probe_result = match batch.entries.first_mut() {
                    Some(entry) => self.factory.probe(&mut entry.raw).await,
                    None => break,
                };
                let entry = batch.entries.remove(0);
                match probe_result {
                    Ok(()) => {
                        if let Some(entry) = self.hand_off_or_park(entry, true) {
                            self.destroy_entry(entry, "pool closing").await;
                        }
                    }
                    Err(e) => {
                        report.probe_failures += 1;
                        self.metrics.lock().health_checks_failed += 1;
                        tracing::warn!(
                            connection_id = entry.meta.id,
                            error = %e,
                            "idle connection failed liveness probe"
                        );
                        self.state.lock().reserved -= 1;
                        self.destroy_entry(entry, "failed liveness probe").await;
                    }
                }
            }
        }

        // Restore the minimum floor, and keep creating for queued waiters
        // while capacity remains. One failed creation aborts the pass; the
        // tick interval rate-limits retries against a down database.
        loop {
            let reservation = {
                let mut state = self.state.lock();
                let total = state.total();
                let below_floor = total < self.config.min_connections;
                let starving = !state.waiters.is_empty() && total < self.config.max_connections;
                if !self.closed.load(Ordering::Acquire) && (below_floor || starving) {
                    state.reserved += 1;
                    Some(SlotReservation::new(Arc::clone(self)))
                } else {
                    None
                }
            };
            let Some(reservation) = reservation else {
                break;
            };
            match self.factory.create().await {
                Ok(raw) => {
                    let entry = self.new_entry(raw);
                    self.metrics.lock().connections_created += 1;
                    report.created += 1;
                    let leftover = self.hand_off_or_park(entry, true);
                    reservation.consume();
                    if let Some(entry) = leftover {
                        self.destroy_entry(entry, "pool closing").await;
                        break;
                    }
                }
                Err(e) => {
                    drop(reservation);
                    self.metrics.lock().creation_failures += 1;
                    tracing::warn!(
                        error = %e,
                        "health pass could not create connection, retrying next tick"
                    );
                    break;
                }
            }
        }

        report
    }
}

impl<F: ConnectionFactory> Drop for PoolInner<F> {
    fn drop(&mut self) {
        if let Some(reaper) = self.reaper.get_mut().take() {
            reaper.abort();
        }
    }
}

/// Background reaper: evicts stale idle connections, probes liveness, and
/// keeps the pool at its minimum size. Holds only a weak reference so an
/// abandoned pool shuts its reaper down.
async fn reaper_loop<F: ConnectionFactory>(pool: Weak<PoolInner<F>>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately; skip it so passes start one
    // interval after pool creation.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(pool) = pool.upgrade() else {
            return;
        };
        if pool.closed.load(Ordering::Acquire) {
            return;
        }
        let report = pool.run_health_pass().await;
        if !report.is_noop() {
            tracing::debug!(
                evicted = report.evicted,
                probe_failures = report.probe_failures,
                created = report.created,
                swept_waiters = report.swept_waiters,
                "health pass complete"
            );
        }
    }
}

/// Builder for creating a connection pool.
///
/// # Example
///
/// ```rust,ignore
/// let pool = Pool::builder(factory)
///     .min_connections(5)
///     .max_connections(50)
///     .build()
///     .await?;
/// ```
pub struct PoolBuilder<F: ConnectionFactory> {
    factory: F,
    config: PoolConfig,
}

impl<F: ConnectionFactory> PoolBuilder<F> {
    /// Create a new pool builder with default settings.
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            config: PoolConfig::default(),
        }
    }

    /// Set the pool configuration wholesale.
    #[must_use]
    pub fn pool_config(mut self, config: PoolConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the minimum number of connections.
    #[must_use]
    pub fn min_connections(mut self, count: u32) -> Self {
        self.config.min_connections = count;
        self
    }

    /// Set the maximum number of connections.
    #[must_use]
    pub fn max_connections(mut self, count: u32) -> Self {
        self.config.max_connections = count;
        self
    }

    /// Set the connection acquisition timeout.
    #[must_use]
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.config.acquire_timeout = timeout;
        self
    }

    /// Set the idle connection timeout.
    #[must_use]
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    /// Set the interval between health task passes.
    #[must_use]
    pub fn health_check_interval(mut self, interval: Duration) -> Self {
        self.config.health_check_interval = interval;
        self
    }

    /// Enable or disable liveness probing of idle connections.
    #[must_use]
    pub fn validate_on_health_check(mut self, enabled: bool) -> Self {
        self.config.validate_on_health_check = enabled;
        self
    }

    /// Build the pool.
    pub async fn build(self) -> Result<Pool<F>, PoolError<F::Error>> {
        Pool::new(self.factory, self.config).await
    }
}

/// Status information about the pool.
#[derive(Debug, Clone, Copy)]
pub struct PoolStatus {
    /// Number of idle connections available for reuse.
    pub idle: u32,
    /// Number of connections currently checked out.
    pub in_use: u32,
    /// Number of acquisitions waiting for a connection.
    pub waiting: u32,
    /// Total connections (idle + in use + being created).
    pub total: u32,
    /// Maximum allowed connections.
    pub max: u32,
}

impl PoolStatus {
    /// Calculate the utilization percentage.
    #[must_use]
    pub fn utilization(&self) -> f64 {
        if self.max == 0 {
            return 0.0;
        }
        (self.in_use as f64 / self.max as f64) * 100.0
    }

    /// Check if the pool is at capacity.
    #[must_use]
    pub fn is_at_capacity(&self) -> bool {
        self.total >= self.max
    }
}

/// Metrics collected from the pool.
#[derive(Debug, Clone)]
pub struct PoolMetrics {
    /// Total connections created since pool start.
    pub connections_created: u64,
    /// Total connections destroyed since pool start.
    pub connections_closed: u64,
    /// Connections permanently removed via [`PooledConnection::detach`].
    pub connections_detached: u64,
    /// Successful connection checkouts.
    pub checkouts_successful: u64,
    /// Failed connection checkouts (timeouts, creation failures, closed).
    pub checkouts_failed: u64,
    /// Checkouts that failed specifically on the acquisition timeout.
    pub acquire_timeouts: u64,
    /// Factory creation failures (foreground and background).
    pub creation_failures: u64,
    /// Releases of connections the pool did not consider active.
    pub invalid_releases: u64,
    /// Idle connections evicted for exceeding the idle timeout.
    pub idle_evictions: u64,
    /// Health passes performed.
    pub health_checks_performed: u64,
    /// Liveness probes that failed.
    pub health_checks_failed: u64,
    /// Time since pool creation.
    pub uptime: Duration,
}

impl PoolMetrics {
    /// Calculate checkout success rate (0.0 to 1.0).
    #[must_use]
    pub fn checkout_success_rate(&self) -> f64 {
        let total = self.checkouts_successful + self.checkouts_failed;
        if total == 0 {
            return 1.0;
        }
        self.checkouts_successful as f64 / total as f64
    }

    /// Calculate liveness probe success rate (0.0 to 1.0).
    #[must_use]
    pub fn health_check_success_rate(&self) -> f64 {
        if self.health_checks_performed == 0 {
            return 1.0;
        }
        let successful = self
            .health_checks_performed
            .saturating_sub(self.health_checks_failed);
        successful as f64 / self.health_checks_performed as f64
    }
}

/// A connection on loan from the pool.
///
/// Dereferences to the raw connection. When dropped, the connection is
/// returned to the pool: to the oldest waiter when the pool is exhausted,
/// to the idle registry otherwise. Call [`invalidate`](Self::invalidate)
/// first to have it destroyed instead, or [`detach`](Self::detach) to take
/// it out of the pool permanently.
#[must_use]
pub struct PooledConnection<F: ConnectionFactory> {
    entry: Option<PoolEntry<F::Connection>>,
    pool: Weak<PoolInner<F>>,
    invalidated: bool,
}

impl<F: ConnectionFactory> PooledConnection<F> {
    fn new(entry: PoolEntry<F::Connection>, pool: Weak<PoolInner<F>>) -> Self {
        Self {
            entry: Some(entry),
            pool,
            invalidated: false,
        }
    }

    // The entry is present from construction until `drop`/`detach`
    // consumes the guard.
    #[allow(clippy::expect_used)]
    fn entry_ref(&self) -> &PoolEntry<F::Connection> {
        self.entry
            .as_ref()
            .expect("connection guard already consumed")
    }

    #[allow(clippy::expect_used)]
    fn entry_mut(&mut self) -> &mut PoolEntry<F::Connection> {
        self.entry
            .as_mut()
            .expect("connection guard already consumed")
    }

    /// Pool bookkeeping for this connection.
    #[must_use]
    pub fn metadata(&self) -> &ConnectionMetadata {
        &self.entry_ref().meta
    }

    /// Mark the connection broken.
    ///
    /// When the guard drops, the connection is destroyed instead of
    /// recycled and the pool tops back up as needed.
    pub fn invalidate(&mut self) {
        self.invalidated = true;
    }

    /// Whether [`invalidate`](Self::invalidate) has been called.
    #[must_use]
    pub fn is_invalidated(&self) -> bool {
        self.invalidated
    }

    /// Take the connection out of the pool permanently.
    ///
    /// Frees the connection's slot and returns the raw connection; the
    /// caller assumes responsibility for tearing it down.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn detach(mut self) -> F::Connection {
        let entry = self
            .entry
            .take()
            .expect("connection guard already consumed");
        if let Some(pool) = self.pool.upgrade() {
            pool.forget_loan(entry.meta.id);
        }
        entry.raw
    }
}

impl<F: ConnectionFactory> Deref for PooledConnection<F> {
    type Target = F::Connection;

    fn deref(&self) -> &F::Connection {
        &self.entry_ref().raw
    }
}

impl<F: ConnectionFactory> DerefMut for PooledConnection<F> {
    fn deref_mut(&mut self) -> &mut F::Connection {
        &mut self.entry_mut().raw
    }
}

impl<F: ConnectionFactory> AsRef<F::Connection> for PooledConnection<F> {
    fn as_ref(&self) -> &F::Connection {
        self
    }
}

impl<F: ConnectionFactory> AsMut<F::Connection> for PooledConnection<F> {
    fn as_mut(&mut self) -> &mut F::Connection {
        self
    }
}

impl<F: ConnectionFactory> fmt::Debug for PooledConnection<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("PooledConnection");
        if let Some(entry) = &self.entry {
            debug.field("metadata", &entry.meta);
        }
        debug.field("invalidated", &self.invalidated).finish()
    }
}

impl<F: ConnectionFactory> Drop for PooledConnection<F> {
    fn drop(&mut self) {
        let Some(entry) = self.entry.take() else {
            return;
        };
        let Some(pool) = self.pool.upgrade() else {
            // Pool gone while the loan was out; the raw connection drops
            // here without factory teardown.
            return;
        };
        pool.return_connection(entry, self.invalidated);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use tokio_test::assert_ok;

    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("test factory failure")]
    struct TestError;

    #[derive(Default)]
    struct TestFactory {
        serial: AtomicU64,
    }

    #[async_trait::async_trait]
    impl ConnectionFactory for TestFactory {
        type Connection = u64;
        type Error = TestError;

        async fn create(&self) -> Result<u64, TestError> {
            Ok(self.serial.fetch_add(1, Ordering::Relaxed))
        }

        async fn destroy(&self, _conn: u64) -> Result<(), TestError> {
            Ok(())
        }
    }

    #[test]
    fn test_pool_status_utilization() {
        let status = PoolStatus {
            idle: 5,
            in_use: 5,
            waiting: 0,
            total: 10,
            max: 20,
        };
        assert!((status.utilization() - 25.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_pool_status_at_capacity() {
        let status = PoolStatus {
            idle: 0,
            in_use: 10,
            waiting: 2,
            total: 10,
            max: 10,
        };
        assert!(status.is_at_capacity());

        let status2 = PoolStatus {
            idle: 5,
            in_use: 5,
            waiting: 0,
            total: 10,
            max: 20,
        };
        assert!(!status2.is_at_capacity());
    }

    #[test]
    fn test_pool_metrics_success_rates() {
        let metrics = PoolMetrics {
            connections_created: 10,
            connections_closed: 2,
            connections_detached: 0,
            checkouts_successful: 90,
            checkouts_failed: 10,
            acquire_timeouts: 4,
            creation_failures: 1,
            invalid_releases: 0,
            idle_evictions: 3,
            health_checks_performed: 100,
            health_checks_failed: 5,
            uptime: Duration::from_secs(3600),
        };

        assert!((metrics.checkout_success_rate() - 0.9).abs() < f64::EPSILON);
        assert!((metrics.health_check_success_rate() - 0.95).abs() < f64::EPSILON);
    }

    #[test]
    fn test_builder_default() {
        let builder = Pool::builder(TestFactory::default());
        assert_eq!(builder.config.min_connections, 1);
        assert_eq!(builder.config.max_connections, 10);
    }

    #[test]
    fn test_builder_fluent() {
        let builder = Pool::builder(TestFactory::default())
            .min_connections(5)
            .max_connections(50)
            .validate_on_health_check(true);

        assert_eq!(builder.config.min_connections, 5);
        assert_eq!(builder.config.max_connections, 50);
        assert!(builder.config.validate_on_health_check);
    }

    #[tokio::test]
    async fn test_get_creates_then_reuses() {
        let pool = Pool::builder(TestFactory::default())
            .min_connections(0)
            .max_connections(2)
            .build()
            .await
            .unwrap();

        let first_id = {
            let conn = pool.get().await.unwrap();
            assert_eq!(conn.metadata().usage_count, 1);
            conn.metadata().id
        };

        let conn = pool.get().await.unwrap();
        assert_eq!(conn.metadata().id, first_id);
        assert_eq!(conn.metadata().usage_count, 2);
        drop(conn);

        pool.close().await;
    }

    #[tokio::test]
    async fn test_try_get_exhausted_returns_none() {
        let pool = Pool::builder(TestFactory::default())
            .min_connections(1)
            .max_connections(1)
            .build()
            .await
            .unwrap();

        let held = tokio_test::assert_ok!(pool.try_get());
        assert!(held.is_some());
        assert!(pool.try_get().unwrap().is_none());

        drop(held);
        pool.close().await;
    }

    #[tokio::test]
    async fn test_closed_pool_rejects_get() {
        let pool = Pool::builder(TestFactory::default())
            .min_connections(0)
            .max_connections(1)
            .build()
            .await
            .unwrap();

        pool.close().await;
        assert!(matches!(pool.get().await, Err(PoolError::PoolClosed)));
        assert!(matches!(pool.try_get(), Err(PoolError::PoolClosed)));
    }
}
