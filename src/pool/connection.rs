//! Live connections and the transport seam.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::warn;

use super::allocation::AllocationInner;
use super::route::{Address, Route};

static IDENT: AtomicU64 = AtomicU64::new(1);

/// A unique identifier for a connection, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn new() -> Self {
        Self(IDENT.fetch_add(1, Ordering::SeqCst))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// The owned transport under a pooled connection.
///
/// Framing and TLS live behind this trait; the pool only ever needs to
/// shut a transport down when the connection is evicted. `close` must
/// tolerate being called more than once.
pub trait Transport: Send + Sync + fmt::Debug {
    /// Shut down the underlying socket.
    fn close(&self);
}

/// An owned, live transport connection.
///
/// Connections are held by the pool in insertion order and handed out
/// to stream allocations. An HTTP/1.1 connection carries one exchange
/// at a time; a multiplexed HTTP/2 connection carries up to its
/// allocation limit concurrently.
pub struct Connection {
    id: ConnectionId,
    route: Route,
    transport: Box<dyn Transport>,
    allocation_limit: usize,
    state: Mutex<State>,
}

struct State {
    /// Back-references to the active stream holders. An entry that no
    /// longer upgrades was abandoned by its owner.
    allocations: Vec<Weak<AllocationInner>>,
    /// Terminal: once set, no further streams may be allocated here.
    no_new_streams: bool,
    /// When the last allocation finished. `None` means "the distant
    /// past": the connection is immediately eligible for eviction.
    idle_at: Option<Instant>,
}

impl Connection {
    /// A new connection over `transport`.
    ///
    /// # Panics
    ///
    /// Panics when `allocation_limit` is zero.
    pub fn new(route: Route, transport: Box<dyn Transport>, allocation_limit: usize) -> Self {
        assert!(allocation_limit >= 1, "allocation_limit < 1");
        Self {
            id: ConnectionId::new(),
            route,
            transport,
            allocation_limit,
            state: Mutex::new(State {
                allocations: Vec::new(),
                no_new_streams: false,
                idle_at: Some(Instant::now()),
            }),
        }
    }

    /// This connection's identifier.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The route this connection travels.
    pub fn route(&self) -> &Route {
        &self.route
    }

    /// How many streams may run here concurrently.
    pub fn allocation_limit(&self) -> usize {
        self.allocation_limit
    }

    /// Whether the transport multiplexes concurrent streams.
    pub fn is_multiplexed(&self) -> bool {
        self.allocation_limit > 1
    }

    /// Whether new streams are forbidden on this connection.
    pub fn no_new_streams(&self) -> bool {
        self.state.lock().no_new_streams
    }

    /// Forbid new streams. Existing streams finish; the connection is
    /// then evicted rather than re-used.
    pub fn forbid_new_streams(&self) {
        self.state.lock().no_new_streams = true;
    }

    /// The number of stream holders currently tracked.
    pub fn allocation_count(&self) -> usize {
        self.state.lock().allocations.len()
    }

    /// Close the underlying transport.
    pub(crate) fn close(&self) {
        self.transport.close();
    }

    /// Reserve a slot for `allocation` if this connection can serve
    /// `address`: a free slot, a matching address, and streams still
    /// allowed.
    pub(crate) fn try_reserve(
        &self,
        address: &Address,
        allocation: &Arc<AllocationInner>,
    ) -> bool {
        let mut state = self.state.lock();
        if state.no_new_streams
            || state.allocations.len() >= self.allocation_limit
            || self.route.address() != address
        {
            return false;
        }
        state.allocations.push(Arc::downgrade(allocation));
        true
    }

    /// Track `allocation` on a connection that is not yet shared.
    pub(crate) fn attach(&self, allocation: &Arc<AllocationInner>) {
        self.state.lock().allocations.push(Arc::downgrade(allocation));
    }

    /// Stop tracking `allocation`. Returns the number of holders left.
    pub(crate) fn detach(&self, allocation: &Arc<AllocationInner>) -> usize {
        let mut state = self.state.lock();
        let target = Arc::as_ptr(allocation);
        state.allocations.retain(|weak| weak.as_ptr() != target);
        state.allocations.len()
    }

    /// Record that the connection went idle at `now`.
    pub(crate) fn set_idle_at(&self, now: Instant) {
        self.state.lock().idle_at = Some(now);
    }

    /// How long the connection has been idle. Only meaningful while no
    /// allocations are tracked.
    pub(crate) fn idle_duration(&self, now: Instant) -> Duration {
        match self.state.lock().idle_at {
            Some(idle_at) => now.saturating_duration_since(idle_at),
            None => Duration::MAX,
        }
    }

    /// Drop abandoned allocations and return the live count.
    ///
    /// An allocation whose owner dropped it without releasing is a
    /// leak: an application bug worth a diagnostic. The connection is
    /// poisoned so it cannot be handed out again, and once its list
    /// empties it becomes immediately eligible for eviction.
    pub(crate) fn prune_allocations(&self) -> usize {
        let mut state = self.state.lock();
        let mut index = 0;
        while index < state.allocations.len() {
            if state.allocations[index].strong_count() > 0 {
                index += 1;
                continue;
            }

            warn!(
                connection = %self.id,
                route = %self.route,
                "a connection allocation was leaked; did you forget to release a response?"
            );
            state.allocations.remove(index);
            state.no_new_streams = true;

            if state.allocations.is_empty() {
                state.idle_at = None;
                return 0;
            }
        }

        state.allocations.len()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("route", &self.route)
            .field("allocations", &state.allocations.len())
            .field("no_new_streams", &state.no_new_streams)
            .finish()
    }
}
