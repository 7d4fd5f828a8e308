//! Connection pooling.
//!
//! The pool is a reuse cache of live transport connections. Requests
//! that share an [`Address`] may share a [`Connection`]; this module
//! implements the policy of which connections to keep open for future
//! use.
//!
//! One background sweeper task per pool walks the connections, prunes
//! allocations whose owners abandoned them, and evicts the
//! longest-idle connection once it outlives the keep-alive or the idle
//! count exceeds its cap. The sweeper's return value encodes its next
//! wake time, so the pool carries no per-connection timers.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

mod allocation;
mod connection;
pub mod mock;
mod route;

use self::allocation::AllocationInner;

pub use self::allocation::StreamAllocation;
pub use self::connection::{Connection, ConnectionId, Transport};
pub use self::route::{Address, Route, RouteDatabase};

/// Default number of idle connections retained.
const DEFAULT_MAX_IDLE_CONNECTIONS: usize = 5;

/// Default idle eviction threshold.
const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(5 * 60);

/// A pool of connections to remote hosts.
///
/// Cloning the pool is cheap and shares the underlying state. In-use
/// connections are unbounded; at steady state the pool holds at most
/// its configured number of idle connections.
#[derive(Debug, Clone)]
pub struct Pool {
    shared: Arc<PoolShared>,
}

#[derive(Debug)]
pub(crate) struct PoolShared {
    max_idle_connections: usize,
    keep_alive: Duration,
    state: Mutex<PoolState>,
    sweep: Arc<Notify>,
    routes: RouteDatabase,
}

#[derive(Debug)]
struct PoolState {
    /// Insertion-ordered; eviction scans favor the front on ties.
    connections: Vec<Arc<Connection>>,
    /// Serialises the single background sweeper.
    cleanup_running: bool,
}

/// What the sweeper should do after a cleanup pass.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Sweep {
    /// A connection was evicted; run again immediately.
    Again,
    /// Sleep until the next connection could become evictable.
    Wait(Duration),
    /// The pool is empty; the sweeper exits.
    Done,
}

impl Pool {
    /// A pool retaining up to `max_idle_connections` idle connections,
    /// each for at most `keep_alive`.
    ///
    /// # Panics
    ///
    /// Panics when `keep_alive` is zero: the sweeper would spin.
    pub fn new(max_idle_connections: usize, keep_alive: Duration) -> Self {
        assert!(!keep_alive.is_zero(), "keep_alive <= 0");
        Self {
            shared: Arc::new(PoolShared {
                max_idle_connections,
                keep_alive,
                state: Mutex::new(PoolState {
                    connections: Vec::new(),
                    cleanup_running: false,
                }),
                sweep: Arc::new(Notify::new()),
                routes: RouteDatabase::default(),
            }),
        }
    }

    /// A fresh allocation, not yet bound to any connection.
    pub fn allocate(&self) -> StreamAllocation {
        StreamAllocation::new(Arc::downgrade(&self.shared))
    }

    /// A recycled connection to `address`, with one slot transferred to
    /// `allocation`, or `None` if no such connection exists.
    ///
    /// Connections are scanned first-fit in insertion order.
    pub fn get(&self, address: &Address, allocation: &StreamAllocation) -> Option<Arc<Connection>> {
        let state = self.shared.state.lock();
        for connection in &state.connections {
            if connection.try_reserve(address, allocation.inner()) {
                trace!(connection = %connection.id(), %address, "connection re-used from pool");
                allocation.bind(connection);
                return Some(connection.clone());
            }
        }
        None
    }

    /// Insert a newly-created connection, starting the sweeper if it is
    /// not already running. The sweeper is spawned onto the ambient
    /// tokio runtime, so `put` must be called from within one.
    ///
    /// Bind the creating allocation with [`StreamAllocation::acquire`]
    /// before publishing the connection here, so it never appears idle.
    pub fn put(&self, connection: Arc<Connection>) {
        let mut state = self.shared.state.lock();
        if !state.cleanup_running {
            state.cleanup_running = true;
            start_sweeper(&self.shared);
        }
        trace!(connection = %connection.id(), route = %connection.route(), "connection added to pool");
        state.connections.push(connection);
    }

    /// Close and remove every idle connection in the pool.
    pub fn evict_all(&self) {
        let mut evicted = Vec::new();
        {
            let mut state = self.shared.state.lock();
            state.connections.retain(|connection| {
                if connection.allocation_count() == 0 {
                    connection.forbid_new_streams();
                    evicted.push(connection.clone());
                    false
                } else {
                    true
                }
            });
        }

        // Socket teardown happens outside the pool lock.
        for connection in evicted {
            debug!(connection = %connection.id(), "evicting connection");
            connection.close();
        }
    }

    /// Total connections, in use and idle.
    pub fn connection_count(&self) -> usize {
        self.shared.state.lock().connections.len()
    }

    /// Connections with no active streams.
    pub fn idle_connection_count(&self) -> usize {
        self.shared
            .state
            .lock()
            .connections
            .iter()
            .filter(|connection| connection.allocation_count() == 0)
            .count()
    }

    /// Connections whose transport multiplexes concurrent streams.
    pub fn multiplexed_connection_count(&self) -> usize {
        self.shared
            .state
            .lock()
            .connections
            .iter()
            .filter(|connection| connection.is_multiplexed())
            .count()
    }

    /// The blacklist of recently-failed routes.
    pub fn route_database(&self) -> &RouteDatabase {
        &self.shared.routes
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<PoolShared> {
        &self.shared
    }
}

impl Default for Pool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_IDLE_CONNECTIONS, DEFAULT_KEEP_ALIVE)
    }
}

impl PoolShared {
    /// Release `allocation`'s slot on `connection`. Returns `true` when
    /// the pool refused to retain the connection and the caller must
    /// close it.
    pub(crate) fn release(
        &self,
        connection: &Arc<Connection>,
        allocation: &Arc<AllocationInner>,
    ) -> bool {
        let mut state = self.state.lock();
        let remaining = connection.detach(allocation);
        if remaining > 0 {
            return false;
        }
        self.connection_became_idle(&mut state, connection)
    }

    /// The last stream on `connection` finished. Returns `true` when
    /// the connection was removed from the pool and should be closed.
    fn connection_became_idle(&self, state: &mut PoolState, connection: &Arc<Connection>) -> bool {
        if connection.no_new_streams() || self.max_idle_connections == 0 {
            state
                .connections
                .retain(|candidate| !Arc::ptr_eq(candidate, connection));
            true
        } else {
            connection.set_idle_at(Instant::now());
            // Wake the sweeper: the idle limit may now be exceeded.
            self.sweep.notify_one();
            false
        }
    }

    /// One maintenance pass: prune leaked allocations, then evict the
    /// longest-idle connection if it outlived the keep-alive or the
    /// idle count exceeds the cap.
    pub(crate) fn cleanup(&self, now: Instant) -> Sweep {
        let mut in_use = 0usize;
        let mut idle = 0usize;
        let mut longest_idle: Option<(Duration, usize)> = None;

        let mut state = self.state.lock();
        for (index, connection) in state.connections.iter().enumerate() {
            if connection.prune_allocations() > 0 {
                in_use += 1;
                continue;
            }

            idle += 1;
            let idle_for = connection.idle_duration(now);
            if longest_idle.map(|(longest, _)| idle_for > longest).unwrap_or(true) {
                longest_idle = Some((idle_for, index));
            }
        }

        match longest_idle {
            Some((idle_for, index))
                if idle_for >= self.keep_alive || idle > self.max_idle_connections =>
            {
                // Evict: remove under the lock, close outside it, and
                // immediately run another pass.
                let connection = state.connections.remove(index);
                drop(state);
                debug!(connection = %connection.id(), idle = ?idle_for, "evicting idle connection");
                connection.close();
                Sweep::Again
            }
            Some((idle_for, _)) => Sweep::Wait(self.keep_alive - idle_for),
            None if in_use > 0 => Sweep::Wait(self.keep_alive),
            None => {
                state.cleanup_running = false;
                Sweep::Done
            }
        }
    }
}

/// Spawn the background sweeper for `shared`.
///
/// The task holds only a weak reference between passes, so dropping the
/// pool mid-sleep lets everything unwind.
fn start_sweeper(shared: &Arc<PoolShared>) {
    let weak = Arc::downgrade(shared);
    let notify = shared.sweep.clone();

    tokio::spawn(async move {
        trace!("connection sweeper started");
        loop {
            let next = match weak.upgrade() {
                Some(shared) => shared.cleanup(Instant::now()),
                None => return,
            };

            match next {
                Sweep::Again => continue,
                Sweep::Wait(duration) => {
                    let _ = tokio::time::timeout(duration, notify.notified()).await;
                }
                Sweep::Done => {
                    trace!("connection sweeper finished");
                    return;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::mock::{route, MockTransport};
    use super::*;

    fn connection(pool: &Pool, host: &str, limit: usize) -> (Arc<Connection>, MockTransport) {
        let transport = MockTransport::new();
        let connection = Arc::new(Connection::new(
            route(host),
            Box::new(transport.clone()),
            limit,
        ));
        let allocation = pool.allocate();
        allocation.acquire(&connection);
        pool.put(connection.clone());
        allocation.release();
        (connection, transport)
    }

    #[tokio::test]
    async fn idle_connection_is_reused() {
        let _ = tracing_subscriber::fmt::try_init();
        let pool = Pool::default();
        let (connection, _transport) = connection(&pool, "example.com", 1);

        let allocation = pool.allocate();
        let found = pool.get(&Address::new("example.com", 80), &allocation);
        assert_eq!(found.unwrap().id(), connection.id());

        let other = pool.allocate();
        assert!(pool.get(&Address::new("other.com", 80), &other).is_none());
    }

    #[tokio::test]
    async fn http1_connection_is_not_shared() {
        let _ = tracing_subscriber::fmt::try_init();
        let pool = Pool::default();
        let (_connection, _transport) = connection(&pool, "example.com", 1);

        let first = pool.allocate();
        assert!(pool.get(&Address::new("example.com", 80), &first).is_some());

        let second = pool.allocate();
        assert!(pool.get(&Address::new("example.com", 80), &second).is_none());

        first.release();
        assert!(pool.get(&Address::new("example.com", 80), &second).is_some());
    }

    #[tokio::test]
    async fn multiplexed_connection_is_shared() {
        let _ = tracing_subscriber::fmt::try_init();
        let pool = Pool::default();
        let (connection, _transport) = connection(&pool, "example.com", 4);
        assert!(connection.is_multiplexed());
        assert_eq!(pool.multiplexed_connection_count(), 1);

        let allocations: Vec<_> = (0..4)
            .map(|_| {
                let allocation = pool.allocate();
                assert!(pool
                    .get(&Address::new("example.com", 80), &allocation)
                    .is_some());
                allocation
            })
            .collect();

        assert_eq!(connection.allocation_count(), 4);

        let overflow = pool.allocate();
        assert!(pool.get(&Address::new("example.com", 80), &overflow).is_none());

        for allocation in allocations {
            allocation.release();
        }
        assert_eq!(pool.idle_connection_count(), 1);
    }

    #[tokio::test]
    async fn pool_refuses_idle_when_retention_disabled() {
        let _ = tracing_subscriber::fmt::try_init();
        let pool = Pool::new(0, Duration::from_secs(60));

        let transport = MockTransport::new();
        let connection = Arc::new(Connection::new(
            route("example.com"),
            Box::new(transport.clone()),
            1,
        ));
        let allocation = pool.allocate();
        allocation.acquire(&connection);
        pool.put(connection);

        allocation.release();
        assert!(!transport.is_open());
        assert_eq!(pool.connection_count(), 0);
    }

    #[tokio::test]
    async fn pool_refuses_idle_when_streams_forbidden() {
        let _ = tracing_subscriber::fmt::try_init();
        let pool = Pool::default();
        let transport = MockTransport::new();
        let connection = Arc::new(Connection::new(
            route("example.com"),
            Box::new(transport.clone()),
            1,
        ));
        let allocation = pool.allocate();
        allocation.acquire(&connection);
        pool.put(connection.clone());

        connection.forbid_new_streams();
        allocation.release();
        assert!(!transport.is_open());
        assert_eq!(pool.connection_count(), 0);
    }

    #[tokio::test]
    async fn evict_all_spares_connections_in_use() {
        let _ = tracing_subscriber::fmt::try_init();
        let pool = Pool::default();
        let (_idle, idle_transport) = connection(&pool, "idle.com", 1);

        let busy_transport = MockTransport::new();
        let busy = Arc::new(Connection::new(
            route("busy.com"),
            Box::new(busy_transport.clone()),
            1,
        ));
        let allocation = pool.allocate();
        allocation.acquire(&busy);
        pool.put(busy);

        pool.evict_all();

        assert!(!idle_transport.is_open());
        assert!(busy_transport.is_open());
        assert_eq!(pool.connection_count(), 1);
    }

    /// Pre-claim the sweeper flag so `put` does not start the
    /// background task; these tests drive `cleanup` by hand.
    fn disable_sweeper(pool: &Pool) {
        pool.shared().state.lock().cleanup_running = true;
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_evicts_excess_idle_in_insertion_order() {
        let _ = tracing_subscriber::fmt::try_init();
        // S3: three idle connections against a cap of two.
        let pool = Pool::new(2, Duration::from_secs(60));
        disable_sweeper(&pool);
        let (first, first_transport) = connection(&pool, "a.com", 1);
        let (second, _t2) = connection(&pool, "b.com", 1);
        let (third, _t3) = connection(&pool, "c.com", 1);

        let now = Instant::now();
        assert_eq!(pool.shared().cleanup(now), Sweep::Again);
        assert!(!first_transport.is_open(), "first-inserted is the victim");
        assert_eq!(pool.connection_count(), 2);

        // The next pass finds the pool within its limits and sleeps.
        assert_eq!(
            pool.shared().cleanup(now),
            Sweep::Wait(Duration::from_secs(60))
        );

        let remaining: Vec<_> = [second, third].iter().map(|c| c.id()).collect();
        let allocation = pool.allocate();
        let found = pool.get(&Address::new("b.com", 80), &allocation).unwrap();
        assert!(remaining.contains(&found.id()));
        drop(first);
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_evicts_longest_idle_first() {
        let _ = tracing_subscriber::fmt::try_init();
        let pool = Pool::new(5, Duration::from_secs(60));
        disable_sweeper(&pool);
        let (_first, first_transport) = connection(&pool, "a.com", 1);

        tokio::time::advance(Duration::from_secs(30)).await;
        let (_second, second_transport) = connection(&pool, "b.com", 1);

        // Neither connection is evictable yet; the sweeper is told to
        // sleep until the older one expires.
        assert_eq!(
            pool.shared().cleanup(Instant::now()),
            Sweep::Wait(Duration::from_secs(30))
        );

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(pool.shared().cleanup(Instant::now()), Sweep::Again);
        assert!(!first_transport.is_open());
        assert!(second_transport.is_open());
    }

    #[tokio::test]
    async fn cleanup_waits_keep_alive_when_all_in_use() {
        let _ = tracing_subscriber::fmt::try_init();
        let pool = Pool::new(5, Duration::from_secs(60));
        let transport = MockTransport::new();
        let connection = Arc::new(Connection::new(
            route("a.com"),
            Box::new(transport.clone()),
            1,
        ));
        let allocation = pool.allocate();
        allocation.acquire(&connection);
        pool.put(connection);

        assert_eq!(
            pool.shared().cleanup(Instant::now()),
            Sweep::Wait(Duration::from_secs(60))
        );

        allocation.release();
        let _ = transport;
    }

    #[tokio::test]
    async fn cleanup_terminates_on_empty_pool() {
        let _ = tracing_subscriber::fmt::try_init();
        let pool = Pool::new(5, Duration::from_secs(60));
        assert_eq!(pool.shared().cleanup(Instant::now()), Sweep::Done);
        assert!(!pool.shared().state.lock().cleanup_running);
    }

    #[tokio::test]
    async fn leaked_allocation_poisons_and_expires_connection() {
        let _ = tracing_subscriber::fmt::try_init();
        let pool = Pool::new(5, Duration::from_secs(60));
        let transport = MockTransport::new();
        let connection = Arc::new(Connection::new(
            route("a.com"),
            Box::new(transport.clone()),
            1,
        ));
        let allocation = pool.allocate();
        allocation.acquire(&connection);
        pool.put(connection.clone());

        // The holder forgets to release.
        drop(allocation);

        assert_eq!(pool.shared().cleanup(Instant::now()), Sweep::Again);
        assert!(connection.no_new_streams());
        assert!(!transport.is_open());
        assert_eq!(pool.connection_count(), 0);
    }

    #[tokio::test]
    async fn leaked_sibling_spares_live_allocations() {
        let _ = tracing_subscriber::fmt::try_init();
        let pool = Pool::new(5, Duration::from_secs(60));
        let transport = MockTransport::new();
        let connection = Arc::new(Connection::new(
            route("a.com"),
            Box::new(transport.clone()),
            4,
        ));
        let leaked = pool.allocate();
        leaked.acquire(&connection);
        pool.put(connection.clone());

        let live = pool.allocate();
        assert!(pool.get(&Address::new("a.com", 80), &live).is_some());

        drop(leaked);

        // The live allocation keeps the connection in use, but the
        // leak still forbids new streams.
        assert_eq!(
            pool.shared().cleanup(Instant::now()),
            Sweep::Wait(Duration::from_secs(60))
        );
        assert!(connection.no_new_streams());
        assert!(transport.is_open());
        assert_eq!(connection.allocation_count(), 1);

        live.release();
    }

    #[test]
    #[should_panic(expected = "keep_alive <= 0")]
    fn zero_keep_alive_is_rejected() {
        Pool::new(5, Duration::ZERO);
    }
}
