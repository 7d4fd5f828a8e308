//! The client: configuration and the entry point for calls.

use std::fmt;
use std::sync::Arc;

use crate::arena::SegmentArena;
use crate::call::Call;
use crate::dispatcher::Dispatcher;
use crate::engine::EngineFactory;
use crate::interceptor::Interceptor;
use crate::pool::Pool;
use crate::request::Request;

/// Default number of follow-ups (redirects, auth challenges) chased
/// per call before giving up with a protocol error.
const DEFAULT_FOLLOW_UP_LIMIT: usize = 20;

/// An HTTP client: a dispatcher, a connection pool, an interceptor
/// stack, and the engine factory that talks to the wire.
///
/// Cloning is cheap and shares all state, so one client can serve an
/// entire application.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientRef>,
}

pub(crate) struct ClientRef {
    dispatcher: Dispatcher,
    pool: Pool,
    arena: Arc<SegmentArena>,
    interceptors: Vec<Arc<dyn Interceptor>>,
    engines: Arc<dyn EngineFactory>,
    follow_up_limit: usize,
}

impl ClientRef {
    pub(crate) fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub(crate) fn interceptors(&self) -> &[Arc<dyn Interceptor>] {
        &self.interceptors
    }

    pub(crate) fn engines(&self) -> &dyn EngineFactory {
        &*self.engines
    }

    pub(crate) fn follow_up_limit(&self) -> usize {
        self.follow_up_limit
    }
}

impl fmt::Debug for ClientRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("dispatcher", &self.dispatcher)
            .field("pool", &self.pool)
            .field("interceptors", &self.interceptors.len())
            .field("follow_up_limit", &self.follow_up_limit)
            .finish()
    }
}

impl Client {
    /// Start building a client.
    pub fn builder() -> Builder {
        Builder::default()
    }

    /// Prepare `request` to be executed or enqueued.
    pub fn new_call(&self, request: Request) -> Call {
        Call::new(self.inner.clone(), request)
    }

    /// The dispatcher scheduling this client's calls.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    /// The connection pool backing this client's exchanges.
    pub fn pool(&self) -> &Pool {
        &self.inner.pool
    }

    /// The segment arena engines buffer bodies through.
    pub fn arena(&self) -> &Arc<SegmentArena> {
        &self.inner.arena
    }

    /// Cancel every call tagged `tag`: queued, running, or in-flight
    /// synchronous.
    pub fn cancel(&self, tag: &str) {
        self.inner.dispatcher.cancel(tag);
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inner.fmt(f)
    }
}

/// Builder for [`Client`].
pub struct Builder {
    dispatcher: Option<Dispatcher>,
    pool: Option<Pool>,
    arena: Option<Arc<SegmentArena>>,
    interceptors: Vec<Arc<dyn Interceptor>>,
    engines: Option<Arc<dyn EngineFactory>>,
    follow_up_limit: usize,
}

impl Default for Builder {
    fn default() -> Self {
        Self {
            dispatcher: None,
            pool: None,
            arena: None,
            interceptors: Vec::new(),
            engines: None,
            follow_up_limit: DEFAULT_FOLLOW_UP_LIMIT,
        }
    }
}

impl Builder {
    /// Use `dispatcher` instead of a default one.
    pub fn dispatcher(mut self, dispatcher: Dispatcher) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Use `pool` instead of a default one.
    pub fn pool(mut self, pool: Pool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Use `arena` instead of a fresh per-client arena.
    pub fn arena(mut self, arena: Arc<SegmentArena>) -> Self {
        self.arena = Some(arena);
        self
    }

    /// Append `interceptor` to the stack. Interceptors run in the
    /// order they were added, outermost first.
    pub fn interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    /// The factory minting transport engines for this client.
    pub fn engine_factory(mut self, engines: Arc<dyn EngineFactory>) -> Self {
        self.engines = Some(engines);
        self
    }

    /// How many follow-ups to chase per call before failing.
    ///
    /// # Panics
    ///
    /// Panics when `limit` is zero.
    pub fn follow_up_limit(mut self, limit: usize) -> Self {
        assert!(limit >= 1, "max < 1: {limit}");
        self.follow_up_limit = limit;
        self
    }

    /// Build the client.
    ///
    /// # Panics
    ///
    /// Panics when no engine factory was supplied.
    pub fn build(self) -> Client {
        Client {
            inner: Arc::new(ClientRef {
                dispatcher: self.dispatcher.unwrap_or_default(),
                pool: self.pool.unwrap_or_default(),
                arena: self.arena.unwrap_or_default(),
                interceptors: self.interceptors,
                engines: self.engines.expect("client has no engine factory"),
                follow_up_limit: self.follow_up_limit,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::engine::mock::MockEngineFactory;

    #[test]
    fn builder_defaults() {
        let client = Client::builder()
            .engine_factory(Arc::new(MockEngineFactory::new()))
            .build();

        assert_eq!(client.dispatcher().max_requests(), 64);
        assert_eq!(client.dispatcher().max_requests_per_host(), 5);
        assert_eq!(client.inner.follow_up_limit, 20);
        assert_eq!(client.pool().connection_count(), 0);
    }

    #[test]
    #[should_panic(expected = "client has no engine factory")]
    fn engine_factory_is_required() {
        Client::builder().build();
    }
}
