//! Generic connection pool with health checking, recycling, and overflow.
//!
//! The pool is parameterized by a [`ConnectionFactory`] that knows how to
//! create, validate, reset, and close one kind of connection. Acquired
//! connections come back as [`PooledConnection`] guards that return to the
//! pool on drop, on every exit path.
//!
//! ## Example
//!
//! ```rust,ignore
//! use stanchion::{ConnectionPool, PoolConfig};
//!
//! let pool = ConnectionPool::new("graph-db", Neo4jFactory::new(uri, auth), PoolConfig::default());
//!
//! {
//!     let conn = pool.acquire()?;
//!     conn.run("MATCH (n) RETURN count(n)")?;
//! } // connection returns to the pool here
//!
//! let stats = pool.stats();
//! println!("created={} recycled={}", stats.created, stats.recycled);
//! ```

use crate::error::Error;
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

// ============================================================================
// Configuration
// ============================================================================

/// Connection pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Connections the pool keeps alive at minimum.
    pub min_size: usize,
    /// Steady-state capacity; connections up to this count are recycled.
    pub max_size: usize,
    /// Additional one-shot connections beyond `max_size`.
    pub max_overflow: usize,
    /// Default timeout for [`ConnectionPool::acquire`].
    pub acquire_timeout: Duration,
    /// Connections older than this are destroyed instead of reused.
    pub recycle: Duration,
    /// Probe connections with the factory before handing them out.
    pub pre_ping: bool,
    /// Interval of the background health check; zero disables it.
    pub health_check_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 1,
            max_size: 10,
            max_overflow: 5,
            acquire_timeout: Duration::from_secs(30),
            recycle: Duration::from_secs(3600),
            pre_ping: true,
            health_check_interval: Duration::from_secs(60),
        }
    }
}

impl PoolConfig {
    /// Create a configuration with the given steady-state bounds.
    pub fn new(min_size: usize, max_size: usize) -> Self {
        Self {
            min_size,
            max_size,
            ..Default::default()
        }
    }

    /// Set the overflow allowance.
    pub fn max_overflow(mut self, overflow: usize) -> Self {
        self.max_overflow = overflow;
        self
    }

    /// Set the default acquire timeout.
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Set the recycle age.
    pub fn recycle(mut self, recycle: Duration) -> Self {
        self.recycle = recycle;
        self
    }

    /// Enable or disable pre-ping validation.
    pub fn pre_ping(mut self, pre_ping: bool) -> Self {
        self.pre_ping = pre_ping;
        self
    }

    /// Set the health check interval; zero disables the background check.
    pub fn health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }
}

// ============================================================================
// Connection Factory
// ============================================================================

/// Factory for one kind of pooled connection.
///
/// `reset` and `close` have no-op defaults for connection types that need
/// neither.
pub trait ConnectionFactory: Send + Sync + 'static {
    /// The connection type managed by this factory.
    type Connection: Send + 'static;

    /// Open a new connection.
    fn create(&self) -> crate::error::Result<Self::Connection>;

    /// Probe that a connection is still healthy.
    fn validate(&self, conn: &mut Self::Connection) -> bool;

    /// Return a connection to a clean state before reuse.
    fn reset(&self, _conn: &mut Self::Connection) -> crate::error::Result<()> {
        Ok(())
    }

    /// Tear down a connection.
    fn close(&self, conn: Self::Connection) {
        drop(conn);
    }
}

// ============================================================================
// Errors and Stats
// ============================================================================

/// Connection pool error.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// No connection became available within the timeout.
    #[error("timed out after {waited:?} waiting for a connection from pool '{name}'")]
    Timeout {
        /// Pool name.
        name: String,
        /// How long the caller waited.
        waited: Duration,
    },

    /// The pool has been closed.
    #[error("connection pool '{name}' is closed")]
    Closed {
        /// Pool name.
        name: String,
    },

    /// The factory failed to produce a connection.
    #[error(transparent)]
    Factory(#[from] Error),
}

impl From<PoolError> for Error {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Factory(inner) => inner,
            timeout @ PoolError::Timeout { .. } => Error::network(timeout.to_string())
                .with_suggestion("Increase the pool size or the acquire timeout"),
            closed @ PoolError::Closed { .. } => Error::unknown(closed.to_string()),
        }
    }
}

/// Point-in-time pool statistics.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    /// Connections created over the pool lifetime.
    pub created: u64,
    /// Connections destroyed over the pool lifetime.
    pub destroyed: u64,
    /// Releases that returned a connection to the pool.
    pub recycled: u64,
    /// Acquire calls.
    pub wait_count: u64,
    /// Total time acquire calls spent before being served.
    pub wait_time_total: Duration,
    /// Acquire calls that timed out.
    pub timeout_count: u64,
    /// Validation probes that failed.
    pub validation_failures: u64,
    /// Connections currently idle in the pool.
    pub available: usize,
    /// Connections currently handed out.
    pub in_use: usize,
    /// Overflow connections currently handed out.
    pub overflow: usize,
    /// Average wait per served acquire.
    pub average_wait: Duration,
    /// timeout_count / wait_count.
    pub timeout_rate: f64,
}

// ============================================================================
// Pool Internals
// ============================================================================

/// Bookkeeping for one pooled connection.
struct PooledConn<C> {
    conn: C,
    id: u64,
    created_at: Instant,
    last_used_at: Instant,
    use_count: u64,
    overflow: bool,
}

struct PoolState<C> {
    available: VecDeque<PooledConn<C>>,
    in_use: usize,
    overflow: usize,
    closed: bool,
    next_id: u64,
}

struct PoolShared<F: ConnectionFactory> {
    name: String,
    factory: F,
    config: PoolConfig,
    state: Mutex<PoolState<F::Connection>>,
    cond: Condvar,
    created: AtomicU64,
    destroyed: AtomicU64,
    recycled: AtomicU64,
    wait_count: AtomicU64,
    wait_micros: AtomicU64,
    timeout_count: AtomicU64,
    validation_failures: AtomicU64,
    health_stop: Mutex<bool>,
    health_cond: Condvar,
    health_handle: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl<F: ConnectionFactory> PoolShared<F> {
    fn new_conn(&self, state: &mut PoolState<F::Connection>, overflow: bool)
        -> crate::error::Result<PooledConn<F::Connection>>
    {
        let conn = self.factory.create()?;
        self.created.fetch_add(1, Ordering::Relaxed);
        let id = state.next_id;
        state.next_id += 1;
        let now = Instant::now();
        Ok(PooledConn {
            conn,
            id,
            created_at: now,
            last_used_at: now,
            use_count: 0,
            overflow,
        })
    }

    /// Age and (optionally) liveness check before reuse.
    fn is_usable(&self, pc: &mut PooledConn<F::Connection>) -> bool {
        if self.config.recycle > Duration::ZERO && pc.created_at.elapsed() > self.config.recycle {
            debug!(pool = %self.name, conn = pc.id, "Connection expired, recycling");
            return false;
        }
        if self.config.pre_ping && !self.factory.validate(&mut pc.conn) {
            self.validation_failures.fetch_add(1, Ordering::Relaxed);
            debug!(pool = %self.name, conn = pc.id, "Connection failed validation");
            return false;
        }
        true
    }

    fn destroy(&self, pc: PooledConn<F::Connection>) {
        self.factory.close(pc.conn);
        self.destroyed.fetch_add(1, Ordering::Relaxed);
    }

    /// Return a connection to the pool; called from guard drop.
    fn release(&self, mut pc: PooledConn<F::Connection>) {
        let mut state = self.state.lock();
        state.in_use = state.in_use.saturating_sub(1);

        if pc.overflow {
            state.overflow = state.overflow.saturating_sub(1);
            debug!(pool = %self.name, conn = pc.id, "Destroying overflow connection");
            self.destroy(pc);
            self.cond.notify_one();
            return;
        }

        if state.closed {
            self.destroy(pc);
            self.cond.notify_one();
            return;
        }

        if let Err(err) = self.factory.reset(&mut pc.conn) {
            warn!(pool = %self.name, conn = pc.id, error = %err, "Reset failed, destroying connection");
            self.destroy(pc);
            self.cond.notify_one();
            return;
        }

        if self.is_usable(&mut pc) {
            state.available.push_back(pc);
            self.recycled.fetch_add(1, Ordering::Relaxed);
        } else {
            self.destroy(pc);
        }
        self.cond.notify_one();
    }

    /// Remove a connection from pool accounting without closing it.
    fn forget(&self, pc: &PooledConn<F::Connection>) {
        let mut state = self.state.lock();
        state.in_use = state.in_use.saturating_sub(1);
        if pc.overflow {
            state.overflow = state.overflow.saturating_sub(1);
        }
        self.cond.notify_one();
    }

    /// One pass of the background health check: validate idle connections
    /// and top the pool back up to its minimum size.
    fn run_health_check(&self) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }

        let mut healthy = VecDeque::new();
        let mut removed = 0usize;
        while let Some(mut pc) = state.available.pop_front() {
            if self.is_usable(&mut pc) {
                healthy.push_back(pc);
            } else {
                removed += 1;
                self.destroy(pc);
            }
        }
        state.available = healthy;

        let mut topped_up = 0usize;
        while state.available.len() + state.in_use < self.config.min_size {
            match self.new_conn(&mut state, false) {
                Ok(pc) => {
                    state.available.push_back(pc);
                    topped_up += 1;
                }
                Err(err) => {
                    warn!(pool = %self.name, error = %err, "Health check failed to create connection");
                    break;
                }
            }
        }

        if removed > 0 || topped_up > 0 {
            info!(
                pool = %self.name,
                removed,
                created = topped_up,
                "Health check pass complete"
            );
        }
        if topped_up > 0 {
            self.cond.notify_all();
        }
    }
}

// ============================================================================
// Connection Pool
// ============================================================================

/// Generic connection pool. Cheap to clone; clones share one pool.
pub struct ConnectionPool<F: ConnectionFactory> {
    shared: Arc<PoolShared<F>>,
}

impl<F: ConnectionFactory> Clone for ConnectionPool<F> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<F: ConnectionFactory> ConnectionPool<F> {
    /// Create a pool, eagerly opening `min_size` connections and starting
    /// the background health check when an interval is configured.
    pub fn new(name: impl Into<String>, factory: F, config: PoolConfig) -> Self {
        let name = name.into();
        info!(
            pool = %name,
            min_size = config.min_size,
            max_size = config.max_size,
            max_overflow = config.max_overflow,
            "Connection pool initialized"
        );

        let shared = Arc::new(PoolShared {
            name,
            factory,
            config,
            state: Mutex::new(PoolState {
                available: VecDeque::new(),
                in_use: 0,
                overflow: 0,
                closed: false,
                next_id: 0,
            }),
            cond: Condvar::new(),
            created: AtomicU64::new(0),
            destroyed: AtomicU64::new(0),
            recycled: AtomicU64::new(0),
            wait_count: AtomicU64::new(0),
            wait_micros: AtomicU64::new(0),
            timeout_count: AtomicU64::new(0),
            validation_failures: AtomicU64::new(0),
            health_stop: Mutex::new(false),
            health_cond: Condvar::new(),
            health_handle: Mutex::new(None),
        });

        {
            let mut state = shared.state.lock();
            for _ in 0..shared.config.min_size {
                match shared.new_conn(&mut state, false) {
                    Ok(pc) => state.available.push_back(pc),
                    Err(err) => {
                        warn!(pool = %shared.name, error = %err, "Failed to create initial connection");
                    }
                }
            }
        }

        if shared.config.health_check_interval > Duration::ZERO {
            let worker = Arc::clone(&shared);
            let handle = std::thread::spawn(move || {
                loop {
                    let mut stop = worker.health_stop.lock();
                    if *stop {
                        break;
                    }
                    worker
                        .health_cond
                        .wait_for(&mut stop, worker.config.health_check_interval);
                    if *stop {
                        break;
                    }
                    drop(stop);
                    worker.run_health_check();
                }
            });
            *shared.health_handle.lock() = Some(handle);
        }

        Self { shared }
    }

    /// The pool name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// The pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Acquire a connection, waiting up to the configured timeout.
    pub fn acquire(&self) -> Result<PooledConnection<F>, PoolError> {
        self.acquire_timeout(self.shared.config.acquire_timeout)
    }

    /// Acquire a connection, waiting up to `timeout`.
    ///
    /// Tries, in order: an idle healthy connection, a fresh connection
    /// within `max_size`, an overflow connection within `max_overflow`;
    /// otherwise blocks until a release or creation frees a slot. All three
    /// paths are re-checked on every wakeup before the timeout fires.
    pub fn acquire_timeout(&self, timeout: Duration) -> Result<PooledConnection<F>, PoolError> {
        let shared = &self.shared;
        let started = Instant::now();
        let deadline = started + timeout;
        shared.wait_count.fetch_add(1, Ordering::Relaxed);

        let mut state = shared.state.lock();
        loop {
            if state.closed {
                return Err(PoolError::Closed {
                    name: shared.name.clone(),
                });
            }

            // Reuse an idle connection, destroying any that fail the checks.
            while let Some(mut pc) = state.available.pop_front() {
                if shared.is_usable(&mut pc) {
                    return Ok(self.hand_out(&mut state, pc, started));
                }
                shared.destroy(pc);
            }

            // Grow within steady-state capacity.
            if state.available.len() + state.in_use < shared.config.max_size {
                let pc = shared.new_conn(&mut state, false)?;
                return Ok(self.hand_out(&mut state, pc, started));
            }

            // Grow into the overflow allowance.
            if state.overflow < shared.config.max_overflow {
                let pc = shared.new_conn(&mut state, true)?;
                state.overflow += 1;
                info!(pool = %shared.name, conn = pc.id, "Created overflow connection");
                return Ok(self.hand_out(&mut state, pc, started));
            }

            let now = Instant::now();
            if now >= deadline {
                shared.timeout_count.fetch_add(1, Ordering::Relaxed);
                warn!(pool = %shared.name, waited = ?started.elapsed(), "Timed out waiting for connection");
                return Err(PoolError::Timeout {
                    name: shared.name.clone(),
                    waited: started.elapsed(),
                });
            }

            let remaining = deadline - now;
            shared
                .cond
                .wait_for(&mut state, remaining.min(Duration::from_secs(1)));
        }
    }

    /// Async adapter over [`Self::acquire`]; the wait runs on the blocking
    /// thread pool so the calling task is suspended, not its carrier thread.
    pub async fn acquire_async(&self) -> Result<PooledConnection<F>, PoolError> {
        self.acquire_timeout_async(self.shared.config.acquire_timeout)
            .await
    }

    /// Async adapter over [`Self::acquire_timeout`].
    pub async fn acquire_timeout_async(
        &self,
        timeout: Duration,
    ) -> Result<PooledConnection<F>, PoolError> {
        let pool = self.clone();
        match tokio::task::spawn_blocking(move || pool.acquire_timeout(timeout)).await {
            Ok(result) => result,
            Err(join_err) => Err(PoolError::Factory(Error::processing(format!(
                "pool acquire task failed: {join_err}"
            )))),
        }
    }

    fn hand_out(
        &self,
        state: &mut PoolState<F::Connection>,
        mut pc: PooledConn<F::Connection>,
        started: Instant,
    ) -> PooledConnection<F> {
        pc.last_used_at = Instant::now();
        pc.use_count += 1;
        state.in_use += 1;
        self.shared
            .wait_micros
            .fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);
        debug!(pool = %self.shared.name, conn = pc.id, "Connection acquired");
        PooledConnection {
            shared: Arc::clone(&self.shared),
            conn: Some(pc),
        }
    }

    /// Stop the health check, destroy idle connections, and fail waiters.
    ///
    /// Connections currently held by guards are destroyed as they are
    /// released.
    pub fn close(&self) {
        {
            let mut stop = self.shared.health_stop.lock();
            if *stop {
                return;
            }
            *stop = true;
        }
        self.shared.health_cond.notify_all();
        if let Some(handle) = self.shared.health_handle.lock().take() {
            let _ = handle.join();
        }

        let mut state = self.shared.state.lock();
        state.closed = true;
        while let Some(pc) = state.available.pop_front() {
            self.shared.destroy(pc);
        }
        drop(state);
        self.shared.cond.notify_all();
        info!(pool = %self.shared.name, "Connection pool closed");
    }

    /// Whether [`Self::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Point-in-time statistics.
    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock();
        let wait_count = self.shared.wait_count.load(Ordering::Relaxed);
        let timeout_count = self.shared.timeout_count.load(Ordering::Relaxed);
        let wait_time_total =
            Duration::from_micros(self.shared.wait_micros.load(Ordering::Relaxed));

        PoolStats {
            created: self.shared.created.load(Ordering::Relaxed),
            destroyed: self.shared.destroyed.load(Ordering::Relaxed),
            recycled: self.shared.recycled.load(Ordering::Relaxed),
            wait_count,
            wait_time_total,
            timeout_count,
            validation_failures: self.shared.validation_failures.load(Ordering::Relaxed),
            available: state.available.len(),
            in_use: state.in_use,
            overflow: state.overflow,
            average_wait: if wait_count > 0 {
                wait_time_total / wait_count as u32
            } else {
                Duration::ZERO
            },
            timeout_rate: if wait_count > 0 {
                timeout_count as f64 / wait_count as f64
            } else {
                0.0
            },
        }
    }
}

// ============================================================================
// Pooled Connection (RAII Guard)
// ============================================================================

/// A connection checked out of a pool; returns to the pool when dropped.
///
/// Dereferences to the underlying connection type.
pub struct PooledConnection<F: ConnectionFactory> {
    shared: Arc<PoolShared<F>>,
    conn: Option<PooledConn<F::Connection>>,
}

impl<F: ConnectionFactory> PooledConnection<F> {
    /// Identifier of the underlying connection, stable across reuse.
    pub fn id(&self) -> u64 {
        self.record().id
    }

    /// How many times this connection has been handed out.
    pub fn use_count(&self) -> u64 {
        self.record().use_count
    }

    /// Age of the underlying connection.
    pub fn age(&self) -> Duration {
        self.record().created_at.elapsed()
    }

    /// Whether this is an overflow connection, destroyed on release.
    pub fn is_overflow(&self) -> bool {
        self.record().overflow
    }

    /// Take ownership of the raw connection, removing it from pool
    /// accounting without closing it.
    pub fn take(mut self) -> F::Connection {
        let pc = self.conn.take().expect("connection already taken");
        self.shared.forget(&pc);
        pc.conn
    }

    fn record(&self) -> &PooledConn<F::Connection> {
        self.conn.as_ref().expect("connection already taken")
    }
}

impl<F: ConnectionFactory> Deref for PooledConnection<F> {
    type Target = F::Connection;

    fn deref(&self) -> &Self::Target {
        &self.record().conn
    }
}

impl<F: ConnectionFactory> DerefMut for PooledConnection<F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.conn.as_mut().expect("connection already taken").conn
    }
}

impl<F: ConnectionFactory> Drop for PooledConnection<F> {
    fn drop(&mut self) {
        if let Some(pc) = self.conn.take() {
            self.shared.release(pc);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32};

    struct TestConn {
        serial: u32,
    }

    #[derive(Default)]
    struct FactoryProbes {
        created: AtomicU32,
        closed: AtomicU32,
        resets: AtomicU32,
        valid: AtomicBool,
        fail_reset: AtomicBool,
        fail_create: AtomicBool,
    }

    struct TestFactory {
        probes: Arc<FactoryProbes>,
    }

    impl TestFactory {
        fn new() -> (Self, Arc<FactoryProbes>) {
            let probes = Arc::new(FactoryProbes {
                valid: AtomicBool::new(true),
                ..Default::default()
            });
            (
                Self {
                    probes: Arc::clone(&probes),
                },
                probes,
            )
        }
    }

    impl ConnectionFactory for TestFactory {
        type Connection = TestConn;

        fn create(&self) -> crate::error::Result<TestConn> {
            if self.probes.fail_create.load(Ordering::SeqCst) {
                return Err(Error::database("backend unreachable"));
            }
            let serial = self.probes.created.fetch_add(1, Ordering::SeqCst);
            Ok(TestConn { serial })
        }

        fn validate(&self, _conn: &mut TestConn) -> bool {
            self.probes.valid.load(Ordering::SeqCst)
        }

        fn reset(&self, _conn: &mut TestConn) -> crate::error::Result<()> {
            self.probes.resets.fetch_add(1, Ordering::SeqCst);
            if self.probes.fail_reset.load(Ordering::SeqCst) {
                return Err(Error::database("reset failed"));
            }
            Ok(())
        }

        fn close(&self, _conn: TestConn) {
            self.probes.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn quiet_config() -> PoolConfig {
        // No background health check so tests control every transition.
        PoolConfig::new(0, 2)
            .max_overflow(0)
            .acquire_timeout(Duration::from_millis(100))
            .health_check_interval(Duration::ZERO)
    }

    #[test]
    fn test_acquire_reuses_same_connection() {
        let (factory, probes) = TestFactory::new();
        let pool = ConnectionPool::new("test", factory, quiet_config());

        let first_id = {
            let conn = pool.acquire().unwrap();
            conn.id()
        };

        let conn = pool.acquire().unwrap();
        assert_eq!(conn.id(), first_id);
        assert_eq!(conn.use_count(), 2);
        assert_eq!(probes.created.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().recycled, 1);
    }

    #[test]
    fn test_min_size_created_eagerly() {
        let (factory, probes) = TestFactory::new();
        let pool = ConnectionPool::new(
            "test",
            factory,
            PoolConfig::new(3, 5).health_check_interval(Duration::ZERO),
        );

        assert_eq!(probes.created.load(Ordering::SeqCst), 3);
        assert_eq!(pool.stats().available, 3);
    }

    #[test]
    fn test_overflow_destroyed_on_release() {
        let (factory, probes) = TestFactory::new();
        let config = PoolConfig::new(0, 1)
            .max_overflow(1)
            .acquire_timeout(Duration::from_millis(50))
            .health_check_interval(Duration::ZERO);
        let pool = ConnectionPool::new("test", factory, config);

        let regular = pool.acquire().unwrap();
        assert!(!regular.is_overflow());

        let overflow = pool.acquire().unwrap();
        assert!(overflow.is_overflow());
        let overflow_id = overflow.id();
        assert_eq!(pool.stats().overflow, 1);

        drop(overflow);
        assert_eq!(probes.closed.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().overflow, 0);
        assert_eq!(pool.stats().available, 0);

        // A new overflow acquire gets a fresh connection, never the old one.
        let overflow = pool.acquire().unwrap();
        assert!(overflow.is_overflow());
        assert_ne!(overflow.id(), overflow_id);
        drop(regular);
    }

    #[test]
    fn test_acquire_times_out_at_capacity() {
        let (factory, _probes) = TestFactory::new();
        let config = PoolConfig::new(1, 1)
            .max_overflow(0)
            .acquire_timeout(Duration::from_millis(100))
            .health_check_interval(Duration::ZERO);
        let pool = ConnectionPool::new("test", factory, config);

        let _held = pool.acquire().unwrap();

        let started = Instant::now();
        let result = pool.acquire();
        let waited = started.elapsed();

        assert!(matches!(result, Err(PoolError::Timeout { .. })));
        assert!(waited >= Duration::from_millis(100));
        assert!(waited < Duration::from_secs(1));
        assert_eq!(pool.stats().timeout_count, 1);
    }

    #[test]
    fn test_waiter_woken_by_release() {
        let (factory, _probes) = TestFactory::new();
        let config = PoolConfig::new(1, 1)
            .max_overflow(0)
            .acquire_timeout(Duration::from_secs(2))
            .health_check_interval(Duration::ZERO);
        let pool = ConnectionPool::new("test", factory, config);

        let held = pool.acquire().unwrap();
        let waiter_pool = pool.clone();
        let waiter = std::thread::spawn(move || {
            let started = Instant::now();
            let conn = waiter_pool.acquire().unwrap();
            (conn.id(), started.elapsed())
        });

        std::thread::sleep(Duration::from_millis(50));
        let held_id = held.id();
        drop(held);

        let (acquired_id, waited) = waiter.join().unwrap();
        assert_eq!(acquired_id, held_id);
        assert!(waited < Duration::from_secs(2));
    }

    #[test]
    fn test_recycle_age_expires_connections() {
        let (factory, probes) = TestFactory::new();
        let config = quiet_config().recycle(Duration::from_millis(30));
        let pool = ConnectionPool::new("test", factory, config);

        let first_id = pool.acquire().unwrap().id();
        std::thread::sleep(Duration::from_millis(50));

        let conn = pool.acquire().unwrap();
        assert_ne!(conn.id(), first_id);
        assert_eq!(probes.closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_pre_ping_failure_replaces_connection() {
        let (factory, probes) = TestFactory::new();
        let pool = ConnectionPool::new("test", factory, quiet_config());

        let first_id = pool.acquire().unwrap().id();

        // The idle connection is now unhealthy; acquire probes it, destroys
        // it, and builds a replacement.
        probes.valid.store(false, Ordering::SeqCst);
        let result = pool.acquire();
        probes.valid.store(true, Ordering::SeqCst);

        let conn = result.unwrap();
        assert_ne!(conn.id(), first_id);
        assert!(pool.stats().validation_failures >= 1);
    }

    #[test]
    fn test_reset_failure_destroys_connection() {
        let (factory, probes) = TestFactory::new();
        let pool = ConnectionPool::new("test", factory, quiet_config());

        let conn = pool.acquire().unwrap();
        probes.fail_reset.store(true, Ordering::SeqCst);
        drop(conn);

        assert_eq!(probes.closed.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().available, 0);
        assert_eq!(pool.stats().recycled, 0);
    }

    #[test]
    fn test_factory_error_surfaces_as_pool_error() {
        let (factory, probes) = TestFactory::new();
        let pool = ConnectionPool::new("test", factory, quiet_config());
        probes.fail_create.store(true, Ordering::SeqCst);

        let result = pool.acquire();
        assert!(matches!(result, Err(PoolError::Factory(_))));
    }

    #[test]
    fn test_health_check_replaces_invalid_and_tops_up() {
        let (factory, probes) = TestFactory::new();
        let config = PoolConfig::new(1, 2)
            .health_check_interval(Duration::from_millis(40))
            .acquire_timeout(Duration::from_millis(100));
        let pool = ConnectionPool::new("test", factory, config);
        assert_eq!(probes.created.load(Ordering::SeqCst), 1);

        // Invalidate the idle connection; a health pass destroys it and
        // tops back up to min_size.
        probes.valid.store(false, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(80));
        probes.valid.store(true, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(80));

        assert!(probes.closed.load(Ordering::SeqCst) >= 1);
        assert!(probes.created.load(Ordering::SeqCst) >= 2);
        assert_eq!(pool.stats().available, 1);
        pool.close();
    }

    #[test]
    fn test_close_destroys_idle_and_fails_new_acquires() {
        let (factory, probes) = TestFactory::new();
        let pool = ConnectionPool::new("test", factory, quiet_config());

        let held = pool.acquire().unwrap();
        // Create a second connection and immediately return it to the pool.
        drop(pool.acquire().unwrap());

        pool.close();
        assert!(pool.is_closed());
        assert!(matches!(pool.acquire(), Err(PoolError::Closed { .. })));
        assert_eq!(pool.stats().available, 0);

        // The held connection is destroyed on release, not recycled.
        let closed_before = probes.closed.load(Ordering::SeqCst);
        drop(held);
        assert_eq!(probes.closed.load(Ordering::SeqCst), closed_before + 1);
    }

    #[test]
    fn test_close_wakes_blocked_waiters() {
        let (factory, _probes) = TestFactory::new();
        let config = PoolConfig::new(1, 1)
            .max_overflow(0)
            .acquire_timeout(Duration::from_secs(5))
            .health_check_interval(Duration::ZERO);
        let pool = ConnectionPool::new("test", factory, config);

        let _held = pool.acquire().unwrap();
        let waiter_pool = pool.clone();
        let waiter = std::thread::spawn(move || waiter_pool.acquire().map(|_| ()));

        std::thread::sleep(Duration::from_millis(50));
        pool.close();

        let result = waiter.join().unwrap();
        assert!(matches!(result, Err(PoolError::Closed { .. })));
    }

    #[test]
    fn test_take_removes_from_accounting() {
        let (factory, probes) = TestFactory::new();
        let pool = ConnectionPool::new("test", factory, quiet_config());

        let conn = pool.acquire().unwrap();
        let raw = conn.take();
        assert_eq!(raw.serial, 0);
        assert_eq!(pool.stats().in_use, 0);
        // The pool never saw a release, so nothing was closed or recycled.
        assert_eq!(probes.closed.load(Ordering::SeqCst), 0);
        assert_eq!(pool.stats().recycled, 0);
    }

    #[tokio::test]
    async fn test_async_acquire_adapter() {
        let (factory, _probes) = TestFactory::new();
        let pool = ConnectionPool::new("test", factory, quiet_config());

        let conn = pool.acquire_async().await.unwrap();
        assert_eq!(conn.use_count(), 1);
        drop(conn);

        let result = pool
            .acquire_timeout_async(Duration::from_millis(50))
            .await;
        assert!(result.is_ok());
    }

    #[test]
    fn test_stats_derived_fields() {
        let (factory, _probes) = TestFactory::new();
        let config = PoolConfig::new(1, 1)
            .max_overflow(0)
            .acquire_timeout(Duration::from_millis(50))
            .health_check_interval(Duration::ZERO);
        let pool = ConnectionPool::new("test", factory, config);

        let _held = pool.acquire().unwrap();
        let _ = pool.acquire(); // times out

        let stats = pool.stats();
        assert_eq!(stats.wait_count, 2);
        assert_eq!(stats.timeout_count, 1);
        assert!((stats.timeout_rate - 0.5).abs() < f64::EPSILON);
        assert_eq!(stats.in_use, 1);

        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["timeout_count"], 1);
    }
}
