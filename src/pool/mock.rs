//! Mock transports for testing.
//!
//! Mock transports have no wire behavior; they exist so pool and call
//! machinery can be exercised without sockets.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::connection::Transport;
use super::route::{Address, Route};

/// A transport that only remembers whether it has been closed.
///
/// Clones share the open flag, so a test can keep one clone and watch
/// what the pool does to the other.
#[derive(Debug, Clone)]
pub struct MockTransport {
    open: Arc<AtomicBool>,
}

impl MockTransport {
    /// A new, open mock transport.
    pub fn new() -> Self {
        Self {
            open: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Whether the transport is still open.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MockTransport {
    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

/// A direct loopback route to `host` on port 80.
pub fn route(host: &str) -> Route {
    Route::direct(Address::new(host, 80), "127.0.0.1:80".parse().unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_is_shared_and_idempotent() {
        let transport = MockTransport::new();
        let observer = transport.clone();
        assert!(observer.is_open());

        transport.close();
        transport.close();
        assert!(!observer.is_open());
    }
}
