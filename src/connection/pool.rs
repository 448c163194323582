use super::{ConnectionState, ManageConnection, config::PoolConfig};
use crate::core::{DbError, Result};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Longest single sleep of a blocked `acquire` between availability checks
const WAIT_SLICE: Duration = Duration::from_millis(25);

/// Connection pool
///
/// Owns a bounded set of live connections to one database target. Idle
/// connections are handed out most-recently-used first; new ones are opened
/// lazily up to `max_connections`, and `min_connections` are kept warm.
///
/// Cloning is cheap and every clone shares the same connections.
pub struct ConnectionPool<M: ManageConnection> {
    inner: Arc<PoolInner<M>>,
}

impl<M: ManageConnection> Clone for ConnectionPool<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct PoolInner<M: ManageConnection> {
    manager: M,
    config: PoolConfig,
    slots: Mutex<Slots<M::Connection>>,
    /// Signalled whenever a connection or a creation slot frees up
    released: Notify,
    next_id: AtomicU64,
}

/// Pool bookkeeping. Every field changes under the one lock, together with
/// the connection-state transition it describes.
struct Slots<C> {
    idle: VecDeque<PooledConnection<C>>,
    states: HashMap<u64, ConnectionState>,
    /// Creation slots reserved by in-flight connects
    pending: usize,
    total_created: u64,
    total_reused: u64,
    total_closed: u64,
    shut_down: bool,
}

impl<C> Slots<C> {
    fn new() -> Self {
        Self {
            idle: VecDeque::new(),
            states: HashMap::new(),
            pending: 0,
            total_created: 0,
            total_reused: 0,
            total_closed: 0,
            shut_down: false,
        }
    }

    fn live(&self) -> usize {
        self.states.len() + self.pending
    }

    fn count(&self, state: ConnectionState) -> usize {
        self.states.values().filter(|s| **s == state).count()
    }

    fn forget(&mut self, id: u64) {
        if self.states.remove(&id).is_some() {
            self.total_closed += 1;
        }
    }
}

/// A connection owned by the pool
struct PooledConnection<C> {
    id: u64,
    conn: C,
    created_at: Instant,
    last_used: Instant,
    reuse_count: u64,
}

impl<C> PooledConnection<C> {
    fn new(id: u64, conn: C) -> Self {
        let now = Instant::now();
        Self {
            id,
            conn,
            created_at: now,
            last_used: now,
            reuse_count: 0,
        }
    }

    fn is_expired(&self, max_lifetime: Option<Duration>) -> bool {
        if let Some(lifetime) = max_lifetime {
            self.created_at.elapsed() > lifetime
        } else {
            false
        }
    }

    fn is_idle_too_long(&self, idle_timeout: Option<Duration>) -> bool {
        if let Some(timeout) = idle_timeout {
            self.last_used.elapsed() > timeout
        } else {
            false
        }
    }

    fn refresh_last_used(&mut self) {
        self.last_used = Instant::now();
    }
}

/// Result of one checkout attempt. The first two variants own the
/// bookkeeping change they stand for and undo it when dropped.
enum Checkout<'a, M: ManageConnection> {
    Ready(PoolGuard<M>),
    Reserved(Reservation<'a, M>),
    Saturated,
}

/// Outcome of handing a connection back
enum Settled<C> {
    Parked,
    /// Failed its check; marked unhealthy and awaiting destruction
    Retire(PooledConnection<C>),
    /// Healthy but no longer wanted (shutdown or past max lifetime)
    Close(PooledConnection<C>),
}

/// A creation slot counted against `max_connections` while a connect is in
/// flight. Dropping it unfilled gives the slot back, so a failed or
/// cancelled acquire leaves no trace in the bookkeeping.
struct Reservation<'a, M: ManageConnection> {
    inner: &'a PoolInner<M>,
    armed: bool,
}

impl<'a, M: ManageConnection> Reservation<'a, M> {
    fn new(inner: &'a PoolInner<M>) -> Self {
        Self { inner, armed: true }
    }

    /// Register the new connection as checked out
    fn fill(mut self, conn: M::Connection) -> PooledConnection<M::Connection> {
        self.armed = false;
        let pooled = PooledConnection::new(self.inner.next_id.fetch_add(1, Ordering::Relaxed), conn);
        let mut slots = self.inner.slots();
        slots.pending -= 1;
        slots.states.insert(pooled.id, ConnectionState::InUse);
        slots.total_created += 1;
        pooled
    }

    /// Register the new connection as idle. Hands it back if the pool shut
    /// down while it was being opened.
    fn park(mut self, conn: M::Connection) -> Option<M::Connection> {
        self.armed = false;
        let mut slots = self.inner.slots();
        slots.pending -= 1;
        if slots.shut_down {
            return Some(conn);
        }
        let pooled = PooledConnection::new(self.inner.next_id.fetch_add(1, Ordering::Relaxed), conn);
        slots.states.insert(pooled.id, ConnectionState::Idle);
        slots.idle.push_back(pooled);
        slots.total_created += 1;
        drop(slots);
        self.inner.released.notify_one();
        None
    }
}

impl<M: ManageConnection> Drop for Reservation<'_, M> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.slots().pending -= 1;
            self.inner.released.notify_one();
        }
    }
}

/// An idle connection taken out of the pool for a sweep probe. Dropped
/// while still holding it (a cancelled sweep), it goes back to idle.
struct Probing<'a, M: ManageConnection> {
    inner: &'a PoolInner<M>,
    pooled: Option<PooledConnection<M::Connection>>,
}

impl<'a, M: ManageConnection> Probing<'a, M> {
    fn new(inner: &'a PoolInner<M>, pooled: PooledConnection<M::Connection>) -> Self {
        Self {
            inner,
            pooled: Some(pooled),
        }
    }

    async fn probe(&mut self) -> bool {
        match self.pooled.as_mut() {
            Some(pooled) => self.inner.probe(pooled).await,
            None => false,
        }
    }

    fn take(&mut self) -> Option<PooledConnection<M::Connection>> {
        self.pooled.take()
    }
}

impl<M: ManageConnection> Drop for Probing<'_, M> {
    fn drop(&mut self) {
        if let Some(pooled) = self.pooled.take() {
            // Already forgotten if the pool shut down meanwhile.
            drop(self.inner.restore_probed(pooled));
        }
    }
}

impl<M: ManageConnection> PoolInner<M> {
    /// Bookkeeping stays consistent even if a holder panicked, so a poisoned
    /// lock is simply taken over.
    fn slots(&self) -> MutexGuard<'_, Slots<M::Connection>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_stale(&self, pooled: &PooledConnection<M::Connection>) -> bool {
        pooled.is_idle_too_long(self.config.idle_timeout) || pooled.is_expired(self.config.max_lifetime)
    }

    fn checkout(self: &Arc<Self>) -> Result<(Checkout<'_, M>, Vec<PooledConnection<M::Connection>>)> {
        let mut guard = self.slots();
        let slots = &mut *guard;

        if slots.shut_down {
            return Err(DbError::PoolClosed);
        }

        let mut stale = Vec::new();
        let mut kept = VecDeque::with_capacity(slots.idle.len());
        while let Some(pooled) = slots.idle.pop_front() {
            if self.is_stale(&pooled) {
                slots.forget(pooled.id);
                stale.push(pooled);
            } else {
                kept.push_back(pooled);
            }
        }
        slots.idle = kept;

        if let Some(mut pooled) = slots.idle.pop_back() {
            slots.states.insert(pooled.id, ConnectionState::InUse);
            slots.total_reused += 1;
            pooled.reuse_count += 1;
            pooled.refresh_last_used();
            return Ok((Checkout::Ready(PoolGuard::new(Arc::clone(self), pooled)), stale));
        }

        if slots.live() < self.config.max_connections {
            slots.pending += 1;
            return Ok((Checkout::Reserved(Reservation::new(self)), stale));
        }

        Ok((Checkout::Saturated, stale))
    }

    /// Open a connection, retrying with exponential backoff
    async fn open(&self) -> Result<M::Connection> {
        let attempts = self.config.connect_retries.max(1);
        let mut reason = String::new();

        for attempt in 1..=attempts {
            match tokio::time::timeout(self.config.connect_timeout, self.manager.connect()).await {
                Ok(Ok(conn)) => return Ok(conn),
                Ok(Err(err)) => reason = err.to_string(),
                Err(_) => {
                    reason = format!("connect timed out after {:?}", self.config.connect_timeout)
                }
            }

            warn!(attempt, attempts, error = %reason, "Connection attempt failed");
            if attempt < attempts {
                tokio::time::sleep(self.config.backoff_for(attempt)).await;
            }
        }

        Err(DbError::PoolUnavailable { attempts, reason })
    }

    fn reserve_below_min(&self) -> Option<Reservation<'_, M>> {
        let mut slots = self.slots();
        if slots.shut_down || slots.live() >= self.config.min_connections {
            return None;
        }
        slots.pending += 1;
        drop(slots);
        Some(Reservation::new(self))
    }

    /// Open idle connections until the warm floor is reached
    async fn fill_to_min(&self) -> Result<usize> {
        let mut opened = 0;
        while let Some(reservation) = self.reserve_below_min() {
            let conn = self.open().await?;
            if let Some(conn) = reservation.park(conn) {
                self.manager.disconnect(conn).await;
                break;
            }
            opened += 1;
        }
        Ok(opened)
    }

    fn spawn_replenish(self: &Arc<Self>) {
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let inner = Arc::clone(self);
            handle.spawn(async move {
                if let Err(err) = inner.fill_to_min().await {
                    warn!(error = %err, "Could not restore the warm connection floor");
                }
            });
        }
    }

    /// Liveness round-trip bounded by `health_check_timeout`
    async fn probe(&self, pooled: &mut PooledConnection<M::Connection>) -> bool {
        let timeout = self.config.health_check_timeout;
        match tokio::time::timeout(timeout, self.manager.ping(&mut pooled.conn)).await {
            Ok(Ok(())) => true,
            Ok(Err(err)) => {
                warn!(connection_id = pooled.id, error = %err, "{}", DbError::ConnectionUnhealthy(pooled.id));
                false
            }
            Err(_) => {
                warn!(
                    connection_id = pooled.id,
                    timeout_ms = timeout.as_millis() as u64,
                    "{}",
                    DbError::ConnectionUnhealthy(pooled.id)
                );
                false
            }
        }
    }

    /// Move a checked-out connection back into the pool's custody
    fn settle(
        &self,
        mut pooled: PooledConnection<M::Connection>,
        healthy: bool,
    ) -> Result<Settled<M::Connection>> {
        let mut guard = self.slots();
        let slots = &mut *guard;

        if slots.states.get(&pooled.id) != Some(&ConnectionState::InUse) {
            return Err(DbError::LeaseReleased(pooled.id));
        }

        if !healthy {
            slots.states.insert(pooled.id, ConnectionState::Unhealthy);
            return Ok(Settled::Retire(pooled));
        }

        if slots.shut_down || pooled.is_expired(self.config.max_lifetime) {
            slots.forget(pooled.id);
            drop(guard);
            self.released.notify_one();
            return Ok(Settled::Close(pooled));
        }

        pooled.refresh_last_used();
        slots.states.insert(pooled.id, ConnectionState::Idle);
        slots.idle.push_back(pooled);
        drop(guard);
        self.released.notify_one();
        Ok(Settled::Parked)
    }

    /// Put a connection that passed a sweep probe back without counting it as used
    fn restore_probed(&self, pooled: PooledConnection<M::Connection>) -> Option<PooledConnection<M::Connection>> {
        let mut guard = self.slots();
        let slots = &mut *guard;
        if slots.shut_down {
            slots.forget(pooled.id);
            return Some(pooled);
        }
        slots.states.insert(pooled.id, ConnectionState::Idle);
        slots.idle.push_back(pooled);
        drop(guard);
        self.released.notify_one();
        None
    }

    async fn retire(&self, pooled: PooledConnection<M::Connection>) {
        let id = pooled.id;
        warn!(connection_id = id, reuse_count = pooled.reuse_count, "Destroying unhealthy connection");
        self.manager.disconnect(pooled.conn).await;
        self.slots().forget(id);
        self.released.notify_one();
    }

    async fn discard(&self, closed: Vec<PooledConnection<M::Connection>>) {
        for pooled in closed {
            debug!(connection_id = pooled.id, "Closing connection");
            self.manager.disconnect(pooled.conn).await;
        }
    }

    async fn check_in(&self, mut pooled: PooledConnection<M::Connection>, flagged: bool) -> Result<()> {
        let mut healthy = !flagged && !self.manager.has_broken(&mut pooled.conn);
        if healthy && self.config.test_on_release {
            healthy = self.probe(&mut pooled).await;
        }

        match self.settle(pooled, healthy)? {
            Settled::Parked => {}
            Settled::Close(pooled) => self.discard(vec![pooled]).await,
            Settled::Retire(pooled) => {
                self.retire(pooled).await;
                if let Err(err) = self.fill_to_min().await {
                    warn!(error = %err, "Could not restore the warm connection floor");
                }
            }
        }
        Ok(())
    }

    /// Synchronous check-in used when a lease is dropped without `release`
    fn check_in_on_drop(self: &Arc<Self>, mut pooled: PooledConnection<M::Connection>, flagged: bool) {
        let healthy = !flagged && !self.manager.has_broken(&mut pooled.conn);

        match self.settle(pooled, healthy) {
            Ok(Settled::Parked) => {}
            Ok(Settled::Close(pooled)) => drop(pooled),
            Ok(Settled::Retire(pooled)) => {
                let id = pooled.id;
                warn!(connection_id = id, "Destroying unhealthy connection");
                drop(pooled);
                self.slots().forget(id);
                self.released.notify_one();
                self.spawn_replenish();
            }
            Err(err) => warn!(error = %err, "Ignoring connection returned twice"),
        }
    }
}

impl<M: ManageConnection> ConnectionPool<M> {
    /// Create a pool and open `min_connections` connections up front
    pub async fn new(manager: M, config: PoolConfig) -> Result<Self> {
        config.validate().map_err(DbError::Config)?;

        let pool = Self {
            inner: Arc::new(PoolInner {
                manager,
                config,
                slots: Mutex::new(Slots::new()),
                released: Notify::new(),
                next_id: AtomicU64::new(1),
            }),
        };

        let opened = pool.inner.fill_to_min().await?;
        info!(
            warm = opened,
            max_connections = pool.inner.config.max_connections,
            "Connection pool ready"
        );

        Ok(pool)
    }

    /// Borrow a connection
    ///
    /// Reuses an idle connection when one is available, otherwise opens a
    /// new one if the pool is below `max_connections`. A saturated pool is
    /// waited on for at most `acquire_timeout`, after which this fails with
    /// [`DbError::PoolExhausted`].
    pub async fn acquire(&self) -> Result<PoolGuard<M>> {
        let deadline = Instant::now() + self.inner.config.acquire_timeout;

        loop {
            let (checkout, stale) = self.inner.checkout()?;
            self.inner.discard(stale).await;

            match checkout {
                Checkout::Ready(lease) => {
                    debug!(connection_id = lease.id(), reuse_count = lease.reuse_count(), "Reusing idle connection");
                    return Ok(lease);
                }
                Checkout::Reserved(reservation) => {
                    let conn = self.inner.open().await?;
                    let pooled = reservation.fill(conn);
                    debug!(connection_id = pooled.id, "Opened new connection");
                    return Ok(PoolGuard::new(Arc::clone(&self.inner), pooled));
                }
                Checkout::Saturated => {
                    let now = Instant::now();
                    if now >= deadline {
                        let waited = self.inner.config.acquire_timeout;
                        warn!(
                            max_connections = self.inner.config.max_connections,
                            waited_ms = waited.as_millis() as u64,
                            "Connection pool exhausted"
                        );
                        return Err(DbError::PoolExhausted { waited });
                    }
                    let slice = (deadline - now).min(WAIT_SLICE);
                    let _ = tokio::time::timeout(slice, self.inner.released.notified()).await;
                }
            }
        }
    }

    /// Return a lease to the pool. Equivalent to `lease.release().await`.
    pub async fn release(&self, lease: PoolGuard<M>) -> Result<()> {
        lease.release().await
    }

    /// Probe every idle connection
    ///
    /// Idle connections past the retention window or their max lifetime are
    /// closed without a probe. Connections failing the probe are destroyed.
    /// Afterwards the pool is topped back up to `min_connections`.
    pub async fn health_check(&self) -> Result<HealthReport> {
        let inner = &*self.inner;

        let (candidates, stale) = {
            let mut guard = inner.slots();
            let slots = &mut *guard;
            if slots.shut_down {
                return Err(DbError::PoolClosed);
            }
            let mut candidates = Vec::with_capacity(slots.idle.len());
            let mut stale = Vec::new();
            for pooled in slots.idle.drain(..) {
                if inner.is_stale(&pooled) {
                    stale.push(pooled);
                } else {
                    candidates.push(pooled);
                }
            }
            for pooled in &stale {
                slots.forget(pooled.id);
            }
            for pooled in &candidates {
                slots.states.insert(pooled.id, ConnectionState::InUse);
            }
            let candidates: Vec<Probing<'_, M>> = candidates
                .into_iter()
                .map(|pooled| Probing::new(inner, pooled))
                .collect();
            (candidates, stale)
        };

        let expired = stale.len();
        inner.discard(stale).await;

        let checked = candidates.len();
        let probes = candidates.into_iter().map(|mut probing| async move {
            let alive = probing.probe().await;
            (probing, alive)
        });
        let results = futures::future::join_all(probes).await;

        let mut unhealthy = 0;
        for (mut probing, alive) in results {
            let Some(pooled) = probing.take() else {
                continue;
            };
            if alive {
                if let Some(closed) = inner.restore_probed(pooled) {
                    inner.discard(vec![closed]).await;
                }
                continue;
            }
            unhealthy += 1;
            if let Ok(Settled::Retire(pooled)) = inner.settle(pooled, false) {
                inner.retire(pooled).await;
            }
        }

        let replenished = inner.fill_to_min().await?;

        let report = HealthReport {
            checked,
            healthy: checked - unhealthy,
            unhealthy,
            expired,
            replenished,
        };
        debug!(%report, "Health check finished");
        Ok(report)
    }

    /// Run `health_check` every `every` on a background task
    ///
    /// The task stops on its own once the pool is shut down or dropped.
    pub fn spawn_maintenance(&self, every: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let pool = ConnectionPool { inner };
                match pool.health_check().await {
                    Ok(report) if report.unhealthy > 0 || report.expired > 0 => {
                        info!(%report, "Pool maintenance retired connections");
                    }
                    Ok(_) => {}
                    Err(DbError::PoolClosed) => break,
                    Err(err) => warn!(error = %err, "Pool maintenance failed"),
                }
            }
        })
    }

    /// Close idle connections and refuse further acquisitions
    ///
    /// Leases still held are closed when they come back.
    pub async fn shutdown(&self) {
        let idle: Vec<_> = {
            let mut guard = self.inner.slots();
            let slots = &mut *guard;
            slots.shut_down = true;
            let idle: Vec<_> = slots.idle.drain(..).collect();
            for pooled in &idle {
                slots.forget(pooled.id);
            }
            idle
        };
        self.inner.released.notify_waiters();

        let closed = idle.len();
        self.inner.discard(idle).await;
        info!(closed, "Connection pool shut down");
    }

    /// Get pool statistics
    pub fn stats(&self) -> PoolStats {
        let slots = self.inner.slots();

        PoolStats {
            total_created: slots.total_created,
            total_reused: slots.total_reused,
            total_closed: slots.total_closed,
            active_connections: slots.count(ConnectionState::InUse),
            idle_connections: slots.idle.len(),
            min_connections: self.inner.config.min_connections,
            max_connections: self.inner.config.max_connections,
        }
    }

    /// Current state of a connection, or `None` once it has been destroyed
    pub fn connection_state(&self, id: u64) -> Option<ConnectionState> {
        self.inner.slots().states.get(&id).copied()
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.slots().shut_down
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn manager(&self) -> &M {
        &self.inner.manager
    }
}

/// Connection pool statistics
///
/// The `total_*` counters only ever grow; `active_connections` and
/// `idle_connections` describe the pool right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub total_created: u64,
    pub total_reused: u64,
    pub total_closed: u64,
    pub active_connections: usize,
    pub idle_connections: usize,
    pub min_connections: usize,
    pub max_connections: usize,
}

impl std::fmt::Display for PoolStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Pool Stats: {} active, {} idle (min {}, max {}); created {}, reused {}, closed {}",
            self.active_connections,
            self.idle_connections,
            self.min_connections,
            self.max_connections,
            self.total_created,
            self.total_reused,
            self.total_closed
        )
    }
}

/// Result of one [`ConnectionPool::health_check`] sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    /// Idle connections probed
    pub checked: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    /// Closed for exceeding the retention window or max lifetime
    pub expired: usize,
    /// Opened to restore `min_connections`
    pub replenished: usize,
}

impl std::fmt::Display for HealthReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "checked {}, healthy {}, unhealthy {}, expired {}, replenished {}",
            self.checked, self.healthy, self.unhealthy, self.expired, self.replenished
        )
    }
}

/// RAII guard for pooled connections
///
/// Derefs to the underlying connection. Returns the connection to the pool
/// when dropped; call [`release`](Self::release) instead when the check-in
/// should be able to await a probe or a graceful disconnect.
pub struct PoolGuard<M: ManageConnection> {
    pool: Arc<PoolInner<M>>,
    connection: Option<PooledConnection<M::Connection>>,
    id: u64,
    unhealthy: bool,
}

impl<M: ManageConnection> PoolGuard<M> {
    fn new(pool: Arc<PoolInner<M>>, pooled: PooledConnection<M::Connection>) -> Self {
        Self {
            id: pooled.id,
            pool,
            connection: Some(pooled),
            unhealthy: false,
        }
    }

    /// Pool-assigned connection id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// How many earlier leases this connection served
    pub fn reuse_count(&self) -> u64 {
        self.connection.as_ref().map_or(0, |pooled| pooled.reuse_count)
    }

    pub fn created_at(&self) -> Option<Instant> {
        self.connection.as_ref().map(|pooled| pooled.created_at)
    }

    /// Get a reference to the connection
    pub fn connection(&mut self) -> &mut M::Connection {
        &mut **self
    }

    /// Have the pool destroy this connection instead of reusing it
    pub fn mark_unhealthy(&mut self) {
        self.unhealthy = true;
    }

    /// Pass `result` through, marking the connection unhealthy if the error
    /// says the connection itself is gone
    pub fn check<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            if err.is_connection_lost() {
                warn!(connection_id = self.id, error = %err, "Connection lost mid-operation");
                self.mark_unhealthy();
            }
        }
        result
    }

    /// Explicitly return the connection to the pool
    pub async fn release(mut self) -> Result<()> {
        match self.connection.take() {
            Some(pooled) => self.pool.check_in(pooled, self.unhealthy).await,
            None => Err(DbError::LeaseReleased(self.id)),
        }
    }
}

impl<M: ManageConnection> Deref for PoolGuard<M> {
    type Target = M::Connection;

    fn deref(&self) -> &Self::Target {
        &self
            .connection
            .as_ref()
            .expect("Connection already returned to pool")
            .conn
    }
}

impl<M: ManageConnection> DerefMut for PoolGuard<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self
            .connection
            .as_mut()
            .expect("Connection already returned to pool")
            .conn
    }
}

impl<M: ManageConnection> Drop for PoolGuard<M> {
    fn drop(&mut self) {
        if let Some(pooled) = self.connection.take() {
            self.pool.check_in_on_drop(pooled, self.unhealthy);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeConnection, FakeManager};

    fn config(min: usize, max: usize) -> PoolConfig {
        PoolConfig::new(min, max)
            .acquire_timeout(Duration::from_millis(100))
            .retry_backoff(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_pool_creation() {
        let manager = FakeManager::default();
        let pool = ConnectionPool::new(manager.clone(), config(2, 5)).await.unwrap();
        let stats = pool.stats();

        assert_eq!(stats.total_created, 2); // min_connections
        assert_eq!(stats.idle_connections, 2);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(manager.opened(), 2);
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let result = ConnectionPool::new(FakeManager::default(), config(3, 1)).await;
        assert!(matches!(result, Err(DbError::Config(_))));
    }

    #[tokio::test]
    async fn test_connection_return_to_pool() {
        let pool = ConnectionPool::new(FakeManager::default(), config(1, 5)).await.unwrap();

        {
            let _conn = pool.acquire().await.unwrap();
            let stats = pool.stats();
            assert_eq!(stats.active_connections, 1);
            assert_eq!(stats.idle_connections, 0);
        } // Connection returned here

        let stats = pool.stats();
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.idle_connections, 1);
    }

    #[tokio::test]
    async fn test_idle_connection_is_reused() {
        let manager = FakeManager::default();
        let pool = ConnectionPool::new(manager.clone(), config(1, 5)).await.unwrap();

        let first = pool.acquire().await.unwrap();
        let id = first.id();
        assert_eq!(first.reuse_count(), 1);
        first.release().await.unwrap();

        let second = pool.acquire().await.unwrap();
        assert_eq!(second.id(), id);
        assert_eq!(second.reuse_count(), 2);
        assert_eq!(manager.opened(), 1);
        assert_eq!(pool.stats().total_reused, 2);
    }

    #[tokio::test]
    async fn test_max_connections_limit() {
        let manager = FakeManager::default();
        let pool = ConnectionPool::new(manager.clone(), config(0, 2)).await.unwrap();

        let _conn1 = pool.acquire().await.unwrap();
        let _conn2 = pool.acquire().await.unwrap();

        let started = Instant::now();
        let result = pool.acquire().await;
        assert!(matches!(result, Err(DbError::PoolExhausted { .. })));
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(manager.opened(), 2);
        assert_eq!(pool.stats().active_connections, 2);
    }

    #[tokio::test]
    async fn test_blocked_acquire_gets_released_connection() {
        let pool = ConnectionPool::new(
            FakeManager::default(),
            config(0, 1).acquire_timeout(Duration::from_secs(2)),
        )
        .await
        .unwrap();

        let held = pool.acquire().await.unwrap();
        let held_id = held.id();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|lease| lease.id()) })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        held.release().await.unwrap();

        assert_eq!(waiter.await.unwrap().unwrap(), held_id);
    }

    #[tokio::test]
    async fn test_unhealthy_release_destroys_and_replaces() {
        let manager = FakeManager::default();
        let pool = ConnectionPool::new(manager.clone(), config(1, 3)).await.unwrap();

        let mut lease = pool.acquire().await.unwrap();
        let id = lease.id();
        lease.broken = true;
        pool.release(lease).await.unwrap();

        assert_eq!(pool.connection_state(id), None);
        let stats = pool.stats();
        assert_eq!(stats.total_closed, 1);
        assert_eq!(stats.idle_connections, 1);
        assert_eq!(stats.total_created, 2);
        assert_eq!(manager.disconnected(), 1);
    }

    #[tokio::test]
    async fn test_mark_unhealthy_on_drop() {
        let pool = ConnectionPool::new(FakeManager::default(), config(0, 3)).await.unwrap();

        let mut lease = pool.acquire().await.unwrap();
        let id = lease.id();
        lease.mark_unhealthy();
        drop(lease);

        assert_eq!(pool.connection_state(id), None);
        assert_eq!(pool.stats().idle_connections, 0);
        assert_eq!(pool.stats().total_closed, 1);
    }

    #[tokio::test]
    async fn test_test_on_release_probes() {
        let manager = FakeManager::default();
        let pool = ConnectionPool::new(manager.clone(), config(0, 2).test_on_release(true))
            .await
            .unwrap();

        let lease = pool.acquire().await.unwrap();
        let id = lease.id();
        manager.kill(lease.serial);
        lease.release().await.unwrap();

        assert_eq!(pool.connection_state(id), None);
        assert_eq!(pool.stats().total_closed, 1);
    }

    #[tokio::test]
    async fn test_second_check_in_is_rejected() {
        let pool = ConnectionPool::new(FakeManager::default(), config(0, 2)).await.unwrap();

        let lease = pool.acquire().await.unwrap();
        let id = lease.id();
        lease.release().await.unwrap();
        let before = pool.stats();

        let forged = PooledConnection::new(
            id,
            FakeConnection {
                serial: 99,
                broken: false,
            },
        );
        let result = pool.inner.check_in(forged, false).await;

        assert!(matches!(result, Err(DbError::LeaseReleased(forged_id)) if forged_id == id));
        assert_eq!(pool.stats(), before);
        assert_eq!(pool.connection_state(id), Some(ConnectionState::Idle));
    }

    #[tokio::test]
    async fn test_connect_retries_then_succeeds() {
        let manager = FakeManager::default();
        let pool = ConnectionPool::new(manager.clone(), config(0, 2)).await.unwrap();

        manager.fail_next_connects(2);
        let mut lease = pool.acquire().await.unwrap();
        assert_eq!(lease.connection().serial, 1);
    }

    #[tokio::test]
    async fn test_connect_failure_rolls_back_bookkeeping() {
        let manager = FakeManager::default();
        let pool = ConnectionPool::new(manager.clone(), config(0, 1)).await.unwrap();

        manager.refuse_connects(true);
        let result = pool.acquire().await;
        assert!(matches!(result, Err(DbError::PoolUnavailable { attempts: 3, .. })));
        assert_eq!(pool.stats().total_created, 0);

        // The reserved slot was given back, so the single slot is usable again.
        manager.refuse_connects(false);
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn test_health_check_replaces_dead_connections() {
        let manager = FakeManager::default();
        let pool = ConnectionPool::new(manager.clone(), config(2, 4)).await.unwrap();

        manager.kill(1);
        let report = pool.health_check().await.unwrap();

        assert_eq!(report.checked, 2);
        assert_eq!(report.healthy, 1);
        assert_eq!(report.unhealthy, 1);
        assert_eq!(report.replenished, 1);
        assert_eq!(pool.connection_state(1), None);

        let stats = pool.stats();
        assert_eq!(stats.idle_connections, 2);
        assert_eq!(stats.total_closed, 1);
        assert_eq!(stats.total_created, 3);
    }

    #[tokio::test]
    async fn test_health_check_times_out_slow_probes() {
        let manager = FakeManager::default();
        let pool = ConnectionPool::new(
            manager.clone(),
            config(1, 2).health_check_timeout(Duration::from_millis(20)),
        )
        .await
        .unwrap();

        manager.slow_pings(Duration::from_millis(500));
        let started = Instant::now();
        let report = pool.health_check().await.unwrap();

        assert_eq!(report.unhealthy, 1);
        assert!(started.elapsed() < Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_idle_retention_window() {
        let manager = FakeManager::default();
        let pool = ConnectionPool::new(
            manager.clone(),
            config(0, 3).idle_timeout(Duration::from_millis(20)),
        )
        .await
        .unwrap();

        pool.acquire().await.unwrap().release().await.unwrap();
        assert_eq!(pool.stats().idle_connections, 1);

        tokio::time::sleep(Duration::from_millis(40)).await;
        let report = pool.health_check().await.unwrap();

        assert_eq!(report.expired, 1);
        assert_eq!(report.checked, 0);
        assert_eq!(pool.stats().idle_connections, 0);
        assert_eq!(manager.disconnected(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_acquire() {
        let manager = FakeManager::default();
        let pool = ConnectionPool::new(manager.clone(), config(2, 4)).await.unwrap();

        let lease = pool.acquire().await.unwrap();
        assert!(!pool.is_shut_down());
        pool.shutdown().await;
        assert!(pool.is_shut_down());

        assert!(matches!(pool.acquire().await, Err(DbError::PoolClosed)));
        assert!(matches!(pool.health_check().await, Err(DbError::PoolClosed)));

        lease.release().await.unwrap();
        let stats = pool.stats();
        assert_eq!(stats.idle_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.total_closed, 2);
        assert_eq!(manager.disconnected(), 2);
    }

    #[tokio::test]
    async fn test_max_lifetime_closes_on_release() {
        let manager = FakeManager::default();
        let pool = ConnectionPool::new(
            manager.clone(),
            config(0, 2).max_lifetime(Duration::from_millis(20)),
        )
        .await
        .unwrap();

        let lease = pool.acquire().await.unwrap();
        let id = lease.id();
        let created_at = lease.created_at().unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(created_at.elapsed() > Duration::from_millis(20));
        lease.release().await.unwrap();

        assert_eq!(pool.connection_state(id), None);
        let stats = pool.stats();
        assert_eq!(stats.total_closed, 1);
        assert_eq!(stats.idle_connections, 0);
        assert_eq!(manager.disconnected(), 1);
    }

    #[tokio::test]
    async fn test_expired_idle_connection_is_not_handed_out() {
        let pool = ConnectionPool::new(
            FakeManager::default(),
            config(0, 2).max_lifetime(Duration::from_millis(20)),
        )
        .await
        .unwrap();

        let first = pool.acquire().await.unwrap();
        let old_id = first.id();
        first.release().await.unwrap();
        assert_eq!(pool.connection_state(old_id), Some(ConnectionState::Idle));

        tokio::time::sleep(Duration::from_millis(30)).await;
        let second = pool.acquire().await.unwrap();

        assert_ne!(second.id(), old_id);
        assert_eq!(pool.connection_state(old_id), None);
        assert_eq!(pool.manager().opened(), 2);
        assert_eq!(pool.manager().disconnected(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_acquire_gives_back_creation_slot() {
        let manager = FakeManager::default();
        let pool = ConnectionPool::new(
            manager.clone(),
            config(0, 2).idle_timeout(Duration::from_millis(10)),
        )
        .await
        .unwrap();

        pool.acquire().await.unwrap().release().await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        // Closing the expired idle connection outlasts the caller's patience.
        manager.slow_disconnects(Duration::from_millis(200));
        let cancelled = tokio::time::timeout(Duration::from_millis(20), pool.acquire()).await;
        assert!(cancelled.is_err());

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(pool.stats().active_connections, 2);
    }

    #[tokio::test]
    async fn test_cancelled_acquire_returns_reused_connection() {
        let manager = FakeManager::default();
        let pool = ConnectionPool::new(
            manager.clone(),
            config(0, 2).idle_timeout(Duration::from_millis(30)),
        )
        .await
        .unwrap();

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        let (a_id, b_id) = (a.id(), b.id());
        a.release().await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        b.release().await.unwrap();

        manager.slow_disconnects(Duration::from_millis(200));
        let cancelled = tokio::time::timeout(Duration::from_millis(20), pool.acquire()).await;
        assert!(cancelled.is_err());

        assert_eq!(pool.connection_state(a_id), None);
        assert_eq!(pool.connection_state(b_id), Some(ConnectionState::Idle));
        let stats = pool.stats();
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.idle_connections, 1);
    }

    #[tokio::test]
    async fn test_cancelled_health_check_returns_connections() {
        let manager = FakeManager::default();
        let pool = ConnectionPool::new(manager.clone(), config(2, 2)).await.unwrap();

        manager.slow_pings(Duration::from_millis(500));
        let cancelled = tokio::time::timeout(Duration::from_millis(20), pool.health_check()).await;
        assert!(cancelled.is_err());

        let stats = pool.stats();
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.idle_connections, 2);

        let _a = pool.acquire().await.unwrap();
        let _b = pool.acquire().await.unwrap();
        assert_eq!(manager.opened(), 2);
    }

    #[tokio::test]
    async fn test_lost_connection_is_destroyed_on_return() {
        let manager = FakeManager::default();
        let pool = ConnectionPool::new(manager.clone(), config(0, 2)).await.unwrap();

        let mut lease = pool.acquire().await.unwrap();
        let id = lease.id();

        // A failed statement leaves the connection usable.
        let result = lease.check(Err::<(), _>(DbError::Query("syntax error".into())));
        assert!(matches!(result, Err(DbError::Query(_))));
        assert_eq!(lease.check(Ok(7)).unwrap(), 7);

        let result = lease.check(Err::<(), _>(DbError::ConnectionLost("broken pipe".into())));
        assert!(matches!(result, Err(DbError::ConnectionLost(_))));
        drop(lease);

        assert_eq!(pool.connection_state(id), None);
        assert_eq!(pool.stats().total_closed, 1);
        assert_eq!(pool.stats().idle_connections, 0);
    }

    #[tokio::test]
    async fn test_query_failure_keeps_connection() {
        let pool = ConnectionPool::new(FakeManager::default(), config(0, 2)).await.unwrap();

        let mut lease = pool.acquire().await.unwrap();
        let id = lease.id();
        let _ = lease.check(Err::<(), _>(DbError::Query("duplicate key".into())));
        lease.release().await.unwrap();

        assert_eq!(pool.connection_state(id), Some(ConnectionState::Idle));
    }

    #[tokio::test(start_paused = true)]
    async fn test_maintenance_task_retires_dead_connections() {
        let manager = FakeManager::default();
        let pool = ConnectionPool::new(manager.clone(), config(1, 2)).await.unwrap();
        manager.kill_all();

        let handle = pool.spawn_maintenance(Duration::from_secs(1));
        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert_eq!(pool.connection_state(1), None);
        let stats = pool.stats();
        assert_eq!(stats.total_created, 2);
        assert_eq!(stats.total_closed, 1);
        assert_eq!(stats.idle_connections, 1);

        pool.shutdown().await;
        let finished = tokio::time::timeout(Duration::from_secs(5), handle).await;
        assert!(finished.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_maintenance_task_stops_when_pool_dropped() {
        let pool = ConnectionPool::new(FakeManager::default(), config(1, 2)).await.unwrap();

        let handle = pool.spawn_maintenance(Duration::from_secs(1));
        drop(pool);

        let finished = tokio::time::timeout(Duration::from_secs(5), handle).await;
        assert!(finished.is_ok());
    }

    #[tokio::test]
    async fn test_pool_stats_display() {
        let pool = ConnectionPool::new(FakeManager::default(), config(2, 10)).await.unwrap();
        let stats = pool.stats();

        assert_eq!(stats.max_connections, 10);
        assert_eq!(
            stats.to_string(),
            "Pool Stats: 0 active, 2 idle (min 2, max 10); created 2, reused 0, closed 0"
        );
    }
}
