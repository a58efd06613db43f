//! The connection pool.
//!
//! All bookkeeping lives behind one mutex that is only held while the
//! connection list is inspected or mutated, never across I/O. Sockets are
//! closed after the lock is released.
//!
//! A cleanup task runs while the pool is non-empty. It evicts connections
//! that stayed idle past the keep-alive duration, idle connections in excess
//! of the idle limit (least recently used first), and idle connections that
//! died, then sleeps until the next connection could expire. Pool activity
//! wakes it early.

use std::fmt::{self, Debug};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use log::{debug, trace};
use tokio::sync::Notify;

use crate::address::Address;
use crate::connection::Connection;
use crate::route::RouteDatabase;
use crate::timeout::Timeout;

/// Default maximum number of idle connections kept, 5.
pub const DEFAULT_MAX_IDLE_CONNECTIONS: usize = 5;
/// Default keep-alive duration of idle connections, 5 minutes.
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(5 * 60);
/// Default number of concurrent exchanges per HTTP/2 connection, 100.
pub const DEFAULT_HTTP2_MAX_CONCURRENT_STREAMS: usize = 100;

/// Connections to reuse, shared by every call of a client.
///
/// Cloning is cheap; clones share the same connections.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    state: Mutex<PoolState>,
    /// Wakes the cleanup task
    notify: Arc<Notify>,
    max_idle: usize,
    keep_alive: Duration,
    http2_max_streams: usize,
    route_database: Arc<RouteDatabase>,
}

#[derive(Default)]
struct PoolState {
    connections: Vec<PooledConnection>,
    cleanup_running: bool,
}

struct PooledConnection {
    connection: Arc<Connection>,
    /// Calls holding a lease on this connection
    calls: Vec<u64>,
    /// When `calls` last became empty
    idle_since: Instant,
    /// Set once the connection must not be handed out again
    no_new_exchanges: bool,
    /// 1 for HTTP/1.1, the stream limit for HTTP/2
    allocation_limit: usize,
}

impl PooledConnection {
    fn has_capacity(&self) -> bool {
        !self.no_new_exchanges && self.calls.len() < self.allocation_limit
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new(
            DEFAULT_MAX_IDLE_CONNECTIONS,
            DEFAULT_KEEP_ALIVE,
            DEFAULT_HTTP2_MAX_CONCURRENT_STREAMS,
        )
    }
}

impl ConnectionPool {
    /// A pool keeping at most `max_idle` idle connections for `keep_alive`
    /// each, and allocating at most `http2_max_streams` calls to one
    /// HTTP/2 connection.
    #[must_use]
    pub fn new(max_idle: usize, keep_alive: Duration, http2_max_streams: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState::default()),
                notify: Arc::new(Notify::new()),
                max_idle,
                keep_alive,
                http2_max_streams: http2_max_streams.max(1),
                route_database: Arc::new(RouteDatabase::default()),
            }),
        }
    }

    /// Failed-route history shared by all calls using this pool
    #[must_use]
    pub fn route_database(&self) -> &Arc<RouteDatabase> {
        &self.inner.route_database
    }

    /// Lease a pooled connection to `address` with spare capacity, if any.
    ///
    /// Candidates are health-checked outside the lock; an unhealthy one is
    /// retired and the search repeats.
    #[must_use]
    pub fn acquire(&self, address: &Address, call_id: u64) -> Option<ConnectionLease> {
        loop {
            let candidate = {
                let mut state = self.inner.lock();
                let pooled = state
                    .connections
                    .iter_mut()
                    .find(|p| p.has_capacity() && p.connection.address() == address)?;
                pooled.calls.push(call_id);
                Arc::clone(&pooled.connection)
            };

            if candidate.is_healthy() {
                trace!("Reusing connection {} for call {call_id}", candidate.id());
                return Some(ConnectionLease::new(self, candidate, call_id));
            }

            debug!("Pooled connection {} is unhealthy", candidate.id());
            self.inner.no_new_exchanges(candidate.id());
            self.inner.release(&candidate, call_id);
        }
    }

    /// Register a newly established connection and lease it to `call_id`.
    ///
    /// If another call raced to establish a multiplexed connection to the
    /// same address, the existing one is leased instead and the newer
    /// connection is closed.
    #[must_use]
    pub fn put(&self, connection: Connection, call_id: u64) -> ConnectionLease {
        let connection = Arc::new(connection);
        let (leased, spawn_cleanup) = {
            let mut state = self.inner.lock();
            let duplicate = if connection.protocol().is_multiplexed() {
                state.connections.iter_mut().find(|p| {
                    p.connection.protocol().is_multiplexed()
                        && p.has_capacity()
                        && p.connection.address() == connection.address()
                        && !p.connection.is_closed()
                })
            } else {
                None
            };

            let leased = if let Some(existing) = duplicate {
                existing.calls.push(call_id);
                Arc::clone(&existing.connection)
            } else {
                let allocation_limit = if connection.protocol().is_multiplexed() {
                    self.inner.http2_max_streams
                } else {
                    1
                };
                state.connections.push(PooledConnection {
                    connection: Arc::clone(&connection),
                    calls: vec![call_id],
                    idle_since: Instant::now(),
                    no_new_exchanges: false,
                    allocation_limit,
                });
                Arc::clone(&connection)
            };

            let spawn_cleanup = !state.cleanup_running;
            state.cleanup_running = true;
            (leased, spawn_cleanup)
        };

        if leased.id() == connection.id() {
            debug!("Pooled new connection {}", connection.id());
        } else {
            debug!(
                "Closing connection {} in favor of pooled connection {}",
                connection.id(),
                leased.id()
            );
            connection.close();
        }

        if spawn_cleanup {
            self.spawn_cleanup();
        } else {
            self.inner.notify.notify_one();
        }
        ConnectionLease::new(self, leased, call_id)
    }

    /// Run one cleanup pass at `now`.
    ///
    /// Returns how long to wait until the next pass, zero to run again
    /// immediately, or `None` once the pool is empty.
    pub fn cleanup(&self, now: Instant) -> Option<Duration> {
        self.inner.cleanup(now)
    }

    /// Close every idle connection and retire the ones in use.
    pub fn evict_all(&self) {
        let evicted: Vec<PooledConnection> = {
            let mut state = self.inner.lock();
            for pooled in &mut state.connections {
                pooled.no_new_exchanges = true;
            }
            let (idle, in_use) = std::mem::take(&mut state.connections)
                .into_iter()
                .partition(|p| p.calls.is_empty());
            state.connections = in_use;
            idle
        };
        for pooled in evicted {
            pooled.connection.close();
        }
    }

    /// Number of pooled connections
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.inner.lock().connections.len()
    }

    /// Number of pooled connections that no call holds
    #[must_use]
    pub fn idle_connection_count(&self) -> usize {
        self.inner
            .lock()
            .connections
            .iter()
            .filter(|p| p.calls.is_empty())
            .count()
    }

    fn spawn_cleanup(&self) {
        let pool = Arc::downgrade(&self.inner);
        let notify = Arc::clone(&self.inner.notify);
        tokio::spawn(async move {
            // Clears the running flag if the runtime drops this task
            let mut running = CleanupRunning {
                pool: pool.clone(),
                armed: true,
            };
            loop {
                let wait = match pool.upgrade() {
                    Some(inner) => inner.cleanup(Instant::now()),
                    None => return,
                };
                match wait {
                    None => {
                        running.armed = false;
                        return;
                    }
                    Some(wait) if wait.is_zero() => tokio::task::yield_now().await,
                    Some(wait) => {
                        let _ = Timeout::new()
                            .with_timeout(wait)
                            .wait_until_notified(&notify)
                            .await;
                    }
                }
            }
        });
    }
}

impl Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("max_idle", &self.inner.max_idle)
            .field("keep_alive", &self.inner.keep_alive)
            .field("connections", &self.connection_count())
            .finish()
    }
}

struct CleanupRunning {
    pool: Weak<PoolInner>,
    armed: bool,
}

impl Drop for CleanupRunning {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Some(inner) = self.pool.upgrade() {
            inner.lock().cleanup_running = false;
        }
    }
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().expect("connection pool lock poisoned")
    }

    fn no_new_exchanges(&self, connection_id: u64) {
        let mut state = self.lock();
        if let Some(pooled) = state
            .connections
            .iter_mut()
            .find(|p| p.connection.id() == connection_id)
        {
            pooled.no_new_exchanges = true;
        }
    }

    /// Drop `call_id`'s allocation of `connection`, closing the connection
    /// if it is no longer kept.
    fn release(&self, connection: &Arc<Connection>, call_id: u64) {
        if !self.connection_became_idle(connection, call_id) {
            connection.close();
        }
    }

    /// Returns `false` if `connection` was removed from the pool and must
    /// be closed.
    fn connection_became_idle(&self, connection: &Connection, call_id: u64) -> bool {
        let mut state = self.lock();
        let Some(index) = state
            .connections
            .iter()
            .position(|p| p.connection.id() == connection.id())
        else {
            return false;
        };

        let pooled = &mut state.connections[index];
        if let Some(position) = pooled.calls.iter().position(|id| *id == call_id) {
            pooled.calls.swap_remove(position);
        }
        if !pooled.calls.is_empty() {
            return true;
        }

        pooled.idle_since = Instant::now();
        if pooled.no_new_exchanges || self.max_idle == 0 || connection.is_closed() {
            state.connections.remove(index);
            trace!("Removed connection {} from the pool", connection.id());
            return false;
        }
        drop(state);
        self.notify.notify_one();
        true
    }

    fn cleanup(&self, now: Instant) -> Option<Duration> {
        let (evicted, wait) = {
            let mut state = self.lock();
            let mut in_use = 0;
            let mut idle = 0;
            let mut dead = None;
            let mut longest_idle: Option<(usize, Duration)> = None;

            for (index, pooled) in state.connections.iter().enumerate() {
                if !pooled.calls.is_empty() {
                    in_use += 1;
                    continue;
                }
                if pooled.no_new_exchanges || pooled.connection.is_closed() {
                    dead = Some(index);
                    break;
                }
                idle += 1;
                let idle_for = now.saturating_duration_since(pooled.idle_since);
                if longest_idle.is_none_or(|(_, longest)| idle_for > longest) {
                    longest_idle = Some((index, idle_for));
                }
            }

            if let Some(index) = dead {
                (Some(state.connections.remove(index)), Some(Duration::ZERO))
            } else {
                match longest_idle {
                    Some((index, idle_for)) if idle_for >= self.keep_alive || idle > self.max_idle => {
                        (Some(state.connections.remove(index)), Some(Duration::ZERO))
                    }
                    Some((_, idle_for)) => (None, Some(self.keep_alive - idle_for)),
                    None if in_use > 0 => (None, Some(self.keep_alive)),
                    None => {
                        state.cleanup_running = false;
                        (None, None)
                    }
                }
            }
        };

        if let Some(pooled) = evicted {
            debug!("Evicting idle connection {}", pooled.connection.id());
            pooled.connection.close();
        }
        wait
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        self.notify.notify_one();
    }
}

/// A call's claim on a pooled connection.
///
/// Dropping the lease releases the claim exactly once, whether the call
/// completed, failed or was cancelled.
pub struct ConnectionLease {
    pool: Arc<PoolInner>,
    connection: Arc<Connection>,
    call_id: u64,
    exchange_pending: AtomicBool,
}

impl ConnectionLease {
    fn new(pool: &ConnectionPool, connection: Arc<Connection>, call_id: u64) -> Self {
        Self {
            pool: Arc::clone(&pool.inner),
            connection,
            call_id,
            exchange_pending: AtomicBool::new(false),
        }
    }

    /// The leased connection
    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Retire the connection: it finishes current exchanges but is never
    /// handed out again.
    pub fn no_new_exchanges(&self) {
        self.pool.no_new_exchanges(self.connection.id());
    }

    /// Mark an exchange as started or finished. An HTTP/1.1 connection
    /// released mid-exchange is in an unknown state and gets closed.
    pub(crate) fn set_exchange_pending(&self, pending: bool) {
        self.exchange_pending.store(pending, Ordering::Release);
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        if self.exchange_pending.load(Ordering::Acquire) && !self.connection.protocol().is_multiplexed()
        {
            debug!(
                "Connection {} released mid-exchange",
                self.connection.id()
            );
            self.pool.no_new_exchanges(self.connection.id());
        }
        self.pool.release(&self.connection, self.call_id);
    }
}

impl Debug for ConnectionLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionLease")
            .field("connection", &self.connection.id())
            .field("call_id", &self.call_id)
            .finish_non_exhaustive()
    }
}
