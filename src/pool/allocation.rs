//! Stream allocations: handles binding one exchange to one connection.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::trace;

use super::connection::Connection;
use super::PoolShared;

/// A handle representing one in-flight HTTP exchange bound to one
/// connection.
///
/// The allocation does not own its connection; the pool does. The
/// connection keeps a weak back-reference to the allocation, which is
/// how the sweeper notices holders that were dropped without calling
/// [`StreamAllocation::release`] — those show up as dead weak
/// references and are reported as leaks.
#[derive(Debug)]
pub struct StreamAllocation {
    inner: Arc<AllocationInner>,
}

#[derive(Debug)]
pub(crate) struct AllocationInner {
    pool: Weak<PoolShared>,
    connection: Mutex<Option<Arc<Connection>>>,
}

impl StreamAllocation {
    pub(super) fn new(pool: Weak<PoolShared>) -> Self {
        Self {
            inner: Arc::new(AllocationInner {
                pool,
                connection: Mutex::new(None),
            }),
        }
    }

    pub(crate) fn inner(&self) -> &Arc<AllocationInner> {
        &self.inner
    }

    /// The connection this allocation currently holds, if any.
    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.inner.connection.lock().clone()
    }

    /// Bind a freshly-created connection to this allocation.
    ///
    /// Used for connections that are not yet published to the pool;
    /// call before [`Pool::put`] so the connection never appears idle.
    ///
    /// # Panics
    ///
    /// Panics when the allocation already holds a connection.
    ///
    /// [`Pool::put`]: super::Pool::put
    pub fn acquire(&self, connection: &Arc<Connection>) {
        let mut held = self.inner.connection.lock();
        assert!(held.is_none(), "allocation already holds a connection");
        connection.attach(&self.inner);
        *held = Some(connection.clone());
    }

    pub(super) fn bind(&self, connection: &Arc<Connection>) {
        let mut held = self.inner.connection.lock();
        debug_assert!(held.is_none(), "allocation already holds a connection");
        *held = Some(connection.clone());
    }

    /// Release the allocation's slot on its connection.
    ///
    /// When this was the connection's last stream, the pool is told the
    /// connection went idle; if the pool refuses to retain it (streams
    /// are forbidden, or idle retention is disabled) the transport is
    /// closed here, outside the pool lock.
    pub fn release(self) {
        let connection = self.inner.connection.lock().take();
        let Some(connection) = connection else {
            return;
        };

        let close = match self.inner.pool.upgrade() {
            Some(pool) => pool.release(&connection, &self.inner),
            // The pool is gone; nobody else will close this socket.
            None => {
                connection.detach(&self.inner);
                true
            }
        };

        if close {
            trace!(connection = %connection.id(), "closing connection refused by pool");
            connection.close();
        }
    }
}
