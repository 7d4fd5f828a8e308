//! The transport engine contract.
//!
//! An engine is one attempt at one HTTP exchange: it owns the byte-level
//! work of writing a request and reading a response over a pooled
//! connection. The core never frames bytes itself; it drives engines
//! through this trait, retries through [`Engine::recover`], and chases
//! redirects through [`Engine::follow_up_request`].

use std::fmt;
use std::sync::Arc;

use futures_util::future::BoxFuture;

use crate::error::Error;
use crate::request::Request;
use crate::response::Response;

/// Best-effort handle to interrupt an engine's in-flight I/O.
///
/// Cancellation handles outlive the `&mut` borrows the engine's I/O
/// methods take, so a dispatcher thread can interrupt an exchange that
/// is blocked in another task.
#[derive(Clone)]
pub struct Canceller(Arc<dyn Fn() + Send + Sync>);

impl Canceller {
    /// A canceller invoking `cancel` when fired.
    pub fn new(cancel: impl Fn() + Send + Sync + 'static) -> Self {
        Self(Arc::new(cancel))
    }

    /// A canceller that does nothing.
    pub fn noop() -> Self {
        Self::new(|| {})
    }

    /// Interrupt the engine's in-flight I/O, best-effort.
    pub fn cancel(&self) {
        (self.0)();
    }
}

impl fmt::Debug for Canceller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Canceller").finish()
    }
}

/// One attempt at one HTTP exchange.
///
/// The core guarantees `release` runs on every terminal path of a call;
/// in exchange, an engine that hands its work to a successor through
/// [`Engine::recover`] must transfer or release its own stream
/// allocation.
pub trait Engine: Send {
    /// Write the request bytes, opening a stream allocation against a
    /// pool connection.
    fn send_request(&mut self) -> BoxFuture<'_, Result<(), Error>>;

    /// Read the response headers, returning the response.
    fn read_response(&mut self) -> BoxFuture<'_, Result<Response, Error>>;

    /// A handle that interrupts this engine's in-flight I/O.
    fn canceller(&self) -> Canceller;

    /// Inspect a failure and return a replacement engine to retry with,
    /// or `None` when recovery is not possible. Route failures should
    /// be reported to the pool's route database so later connections
    /// prefer alternatives.
    fn recover(&mut self, error: &Error) -> Option<Box<dyn Engine>>;

    /// The next request when `response` demands a redirect or an auth
    /// retry, or `None` when `response` is final.
    fn follow_up_request(&self, response: &Response) -> Option<Request>;

    /// Release this engine's stream allocation back to the pool.
    fn release(&mut self);
}

/// Mints one engine per exchange attempt.
///
/// A factory typically closes over the connection pool, the segment
/// arena, and whatever transport configuration the engines need.
pub trait EngineFactory: Send + Sync {
    /// An engine ready to attempt `request`.
    fn create(&self, request: &Request) -> Box<dyn Engine>;
}

pub mod mock {
    //! Scripted engines for testing.
    //!
    //! A [`MockEngineFactory`] mints engines that answer from a fixed
    //! script: a status and body, an optional gate that holds exchanges
    //! in flight until the test opens it, a number of attempts that
    //! fail before one succeeds, and a number of follow-up redirects.
    //! When built over a [`Pool`], each exchange checks a connection
    //! out and returns it, exercising the real reuse path.

    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    use bytes::Bytes;
    use futures_util::future::BoxFuture;
    use http::StatusCode;
    use tokio::sync::{Notify, Semaphore};

    use crate::arena::SegmentArena;
    use crate::error::Error;
    use crate::pool::{Address, Connection, Pool, Route, StreamAllocation};
    use crate::request::Request;
    use crate::response::{Handshake, Response};

    use super::{Canceller, Engine, EngineFactory};

    /// Shared script and telemetry for every engine a factory mints.
    #[derive(Debug)]
    struct Script {
        status: StatusCode,
        body: Bytes,
        /// Exchanges block here until a permit arrives.
        gate: Option<Arc<Semaphore>>,
        /// Attempts that fail with a network error, pool-wide.
        failures: AtomicUsize,
        /// Whether failed attempts may be retried at all.
        recoverable: bool,
        /// Redirect follow-ups still to serve, pool-wide.
        follow_ups: AtomicUsize,
        /// Exchanges that reached `read_response`.
        exchanges: AtomicUsize,
        pool: Option<Pool>,
        arena: Option<Arc<SegmentArena>>,
    }

    /// Builds [`MockEngineFactory`] scripts.
    #[derive(Debug)]
    pub struct MockEngineFactory {
        script: Arc<Script>,
    }

    impl MockEngineFactory {
        /// Engines that answer 200 with an empty body.
        pub fn new() -> Self {
            Self {
                script: Arc::new(Script {
                    status: StatusCode::OK,
                    body: Bytes::new(),
                    gate: None,
                    failures: AtomicUsize::new(0),
                    recoverable: true,
                    follow_ups: AtomicUsize::new(0),
                    exchanges: AtomicUsize::new(0),
                    pool: None,
                    arena: None,
                }),
            }
        }

        fn script_mut(&mut self) -> &mut Script {
            Arc::get_mut(&mut self.script).expect("script still shared")
        }

        /// Answer with `status` and `body`.
        pub fn respond(mut self, status: StatusCode, body: impl Into<Bytes>) -> Self {
            let script = self.script_mut();
            script.status = status;
            script.body = body.into();
            self
        }

        /// Hold every exchange in flight until the gate gets a permit.
        pub fn gated(mut self, gate: Arc<Semaphore>) -> Self {
            self.script_mut().gate = Some(gate);
            self
        }

        /// Fail the first `failures` attempts with a recoverable
        /// network error.
        pub fn failures(mut self, failures: usize) -> Self {
            self.script_mut().failures = AtomicUsize::new(failures);
            self
        }

        /// Refuse to recover from failed attempts: errors surface to
        /// the caller immediately.
        pub fn unrecoverable(mut self) -> Self {
            self.script_mut().recoverable = false;
            self
        }

        /// Serve `follow_ups` redirects before the final response.
        pub fn follow_ups(mut self, follow_ups: usize) -> Self {
            self.script_mut().follow_ups = AtomicUsize::new(follow_ups);
            self
        }

        /// Check connections out of `pool` for each exchange.
        pub fn pooled(mut self, pool: Pool) -> Self {
            self.script_mut().pool = Some(pool);
            self
        }

        /// Buffer response bodies through `arena`.
        pub fn with_arena(mut self, arena: Arc<SegmentArena>) -> Self {
            self.script_mut().arena = Some(arena);
            self
        }

        /// How many exchanges reached `read_response`.
        pub fn exchange_count(&self) -> usize {
            self.script.exchanges.load(Ordering::SeqCst)
        }
    }

    impl Default for MockEngineFactory {
        fn default() -> Self {
            Self::new()
        }
    }

    impl EngineFactory for MockEngineFactory {
        fn create(&self, request: &Request) -> Box<dyn Engine> {
            Box::new(MockEngine {
                request: request.clone(),
                script: self.script.clone(),
                canceled: Arc::new(AtomicBool::new(false)),
                interrupt: Arc::new(Notify::new()),
                allocation: None,
            })
        }
    }

    /// An engine answering from its factory's script.
    pub struct MockEngine {
        request: Request,
        script: Arc<Script>,
        canceled: Arc<AtomicBool>,
        interrupt: Arc<Notify>,
        allocation: Option<StreamAllocation>,
    }

    impl MockEngine {
        fn route(&self) -> Route {
            Route::direct(
                Address::from_url(self.request.url()),
                "127.0.0.1:80".parse().unwrap(),
            )
        }

        fn checkout(&mut self) {
            let Some(pool) = &self.script.pool else { return };
            let address = Address::from_url(self.request.url());
            let allocation = pool.allocate();
            if pool.get(&address, &allocation).is_none() {
                let route = self.route();
                pool.route_database().connected(&route);
                let connection = Arc::new(Connection::new(
                    route,
                    Box::new(crate::pool::mock::MockTransport::new()),
                    1,
                ));
                allocation.acquire(&connection);
                pool.put(connection);
            }
            self.allocation = Some(allocation);
        }

        fn response(&self) -> Response {
            let body = match &self.script.arena {
                Some(arena) => {
                    // Stage the body through a recycled segment, the
                    // way a real engine would fill its read buffer.
                    let mut segment = arena.take();
                    let length = self.script.body.len().min(segment.capacity());
                    segment.data_mut()[..length].copy_from_slice(&self.script.body[..length]);
                    segment.set_limit(length);
                    let body = Bytes::copy_from_slice(segment.readable());
                    arena.recycle(segment);
                    body
                }
                None => self.script.body.clone(),
            };

            let mut builder = Response::builder()
                .request(self.request.clone())
                .status(self.script.status)
                .body(body);
            if self.request.is_https() {
                builder = builder.handshake(Handshake::new("TLSv1.3", "TLS_AES_128_GCM_SHA256"));
            }
            builder.build()
        }
    }

    impl Engine for MockEngine {
        fn send_request(&mut self) -> BoxFuture<'_, Result<(), Error>> {
            Box::pin(async move {
                if self.canceled.load(Ordering::SeqCst) {
                    return Err(Error::Canceled);
                }
                if self.script.failures.load(Ordering::SeqCst) > 0 {
                    if let Some(pool) = &self.script.pool {
                        pool.route_database().failed(self.route());
                    }
                    return Err(Error::network(std::io::Error::other(
                        "mock connection reset",
                    )));
                }
                self.checkout();
                Ok(())
            })
        }

        fn read_response(&mut self) -> BoxFuture<'_, Result<Response, Error>> {
            Box::pin(async move {
                self.script.exchanges.fetch_add(1, Ordering::SeqCst);

                if let Some(gate) = self.script.gate.clone() {
                    tokio::select! {
                        permit = gate.acquire() => {
                            permit.expect("gate closed").forget();
                        }
                        _ = self.interrupt.notified() => {
                            return Err(Error::Canceled);
                        }
                    }
                }

                if self.canceled.load(Ordering::SeqCst) {
                    return Err(Error::Canceled);
                }

                Ok(self.response())
            })
        }

        fn canceller(&self) -> Canceller {
            let canceled = self.canceled.clone();
            let interrupt = self.interrupt.clone();
            Canceller::new(move || {
                canceled.store(true, Ordering::SeqCst);
                // notify_one stores a permit, so an interrupt that
                // lands before the exchange reaches its gate still
                // wakes it.
                interrupt.notify_one();
            })
        }

        fn recover(&mut self, error: &Error) -> Option<Box<dyn Engine>> {
            if !error.is_recoverable() || !self.script.recoverable {
                return None;
            }

            let failures = &self.script.failures;
            if failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                    left.checked_sub(1)
                })
                .is_err()
            {
                return None;
            }

            self.release();
            Some(Box::new(MockEngine {
                request: self.request.clone(),
                script: self.script.clone(),
                canceled: self.canceled.clone(),
                interrupt: self.interrupt.clone(),
                allocation: None,
            }))
        }

        fn follow_up_request(&self, response: &Response) -> Option<Request> {
            self.script
                .follow_ups
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .ok()
                .map(|_| response.request().clone())
        }

        fn release(&mut self) {
            if let Some(allocation) = self.allocation.take() {
                allocation.release();
            }
        }
    }
}
