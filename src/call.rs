//! Calls: units of work bound to a request and an owner.
//!
//! A call runs in one of two ways. `enqueue` hands it to the
//! dispatcher, which admits it under the concurrency caps and runs the
//! body on the worker executor, delivering the outcome to a callback
//! exactly once. `execute` runs the body on the caller's own task,
//! registered with the dispatcher only for accounting and cancellation.
//!
//! Either way the body is the same: the interceptor chain, terminated
//! by the engine loop that sends the request, recovers from retryable
//! failures, and chases follow-ups up to the configured limit. On every
//! terminal path the dispatcher is notified (a drop guard enforces
//! this) and the engine's stream allocation is released.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::client::ClientRef;
use crate::dispatcher::Dispatcher;
use crate::engine::Canceller;
use crate::error::Error;
use crate::interceptor::{Chain, Terminal};
use crate::request::Request;
use crate::response::Response;

static IDENT: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);

/// A unique identifier for a call, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallId(u64);

impl CallId {
    fn new() -> Self {
        Self(IDENT.fetch_add(1, Ordering::SeqCst))
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "call-{}", self.0)
    }
}

/// Receives the outcome of an enqueued call, exactly once.
///
/// Any `FnOnce(Result<Response, Error>)` closure is a callback.
pub trait Callback: Send + 'static {
    /// The call produced a response.
    fn on_response(self: Box<Self>, response: Response);

    /// The call failed, was cancelled, or exhausted recovery.
    fn on_failure(self: Box<Self>, error: Error);
}

impl<F> Callback for F
where
    F: FnOnce(Result<Response, Error>) + Send + 'static,
{
    fn on_response(self: Box<Self>, response: Response) {
        (self)(Ok(response))
    }

    fn on_failure(self: Box<Self>, error: Error) {
        (self)(Err(error))
    }
}

/// State shared between a call's owner, its worker, and the dispatcher.
pub(crate) struct CallShared {
    id: CallId,
    request: Request,
    host: String,
    tag: Option<String>,
    /// Monotonic: set once, never cleared.
    canceled: AtomicBool,
    /// At-most-once start.
    executed: AtomicBool,
    /// Interrupt handle for the engine currently in flight, if any.
    canceller: Mutex<Option<Canceller>>,
}

impl CallShared {
    pub(crate) fn new(request: Request) -> Self {
        let host = request.host().to_owned();
        let tag = request.tag().map(str::to_owned);
        Self {
            id: CallId::new(),
            request,
            host,
            tag,
            canceled: AtomicBool::new(false),
            executed: AtomicBool::new(false),
            canceller: Mutex::new(None),
        }
    }

    pub(crate) fn id(&self) -> CallId {
        self.id
    }

    pub(crate) fn request(&self) -> &Request {
        &self.request
    }

    pub(crate) fn host(&self) -> &str {
        &self.host
    }

    pub(crate) fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub(crate) fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    /// Set the cancellation flag and interrupt the in-flight engine
    /// when one is reachable.
    pub(crate) fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
        if let Some(canceller) = self.canceller.lock().as_ref() {
            canceller.cancel();
        }
    }

    pub(crate) fn set_canceller(&self, canceller: Option<Canceller>) {
        let mut slot = self.canceller.lock();
        *slot = canceller;
        // Cancelled while the engine was being swapped in: interrupt it
        // now rather than waiting for I/O that nobody will stop.
        if self.is_canceled() {
            if let Some(canceller) = slot.as_ref() {
                canceller.cancel();
            }
        }
    }

    /// Flip the executed flag, returning the previous value.
    fn mark_executed(&self) -> bool {
        self.executed.swap(true, Ordering::SeqCst)
    }
}

impl fmt::Debug for CallShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallShared")
            .field("id", &self.id)
            .field("host", &self.host)
            .field("canceled", &self.is_canceled())
            .finish()
    }
}

/// An asynchronous call queued in or admitted by the dispatcher: the
/// shared call state plus the not-yet-started body.
pub(crate) struct AsyncCall {
    shared: Arc<CallShared>,
    job: BoxFuture<'static, ()>,
}

impl AsyncCall {
    pub(crate) fn new(shared: Arc<CallShared>, job: BoxFuture<'static, ()>) -> Self {
        Self { shared, job }
    }

    pub(crate) fn shared(&self) -> &Arc<CallShared> {
        &self.shared
    }

    pub(crate) fn into_parts(self) -> (Arc<CallShared>, BoxFuture<'static, ()>) {
        (self.shared, self.job)
    }
}

impl fmt::Debug for AsyncCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AsyncCall").field(&self.shared).finish()
    }
}

/// A single request ready to be executed or enqueued.
///
/// A call runs at most once; starting it a second time is a usage
/// error.
pub struct Call {
    client: Arc<ClientRef>,
    shared: Arc<CallShared>,
}

impl fmt::Debug for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Call").field(&self.shared).finish()
    }
}

impl Call {
    pub(crate) fn new(client: Arc<ClientRef>, request: Request) -> Self {
        Self {
            client,
            shared: Arc::new(CallShared::new(request)),
        }
    }

    /// The original request, unadulterated by redirects or retries.
    pub fn request(&self) -> &Request {
        self.shared.request()
    }

    /// Whether this call has started.
    pub fn is_executed(&self) -> bool {
        self.shared.executed.load(Ordering::SeqCst)
    }

    /// Whether this call has been cancelled.
    pub fn is_canceled(&self) -> bool {
        self.shared.is_canceled()
    }

    /// Cancel this call. In-flight I/O is interrupted best-effort; the
    /// owner still hears back exactly once, with a cancellation error.
    pub fn cancel(&self) {
        self.shared.cancel();
    }

    /// Run the call on the caller's task and return its response.
    ///
    /// # Panics
    ///
    /// Panics when the call has already started.
    pub async fn execute(self) -> Result<Response, Error> {
        assert!(!self.shared.mark_executed(), "call already executed");

        let dispatcher = self.client.dispatcher().clone();
        dispatcher.executed(self.shared.clone());
        let _guard = FinishGuard::synchronous(dispatcher, self.shared.clone());

        let outcome = run_exchange(&self.client, &self.shared).await;
        if self.shared.is_canceled() {
            return Err(Error::Canceled);
        }
        outcome
    }

    /// Hand the call to the dispatcher; `callback` hears the outcome
    /// exactly once, on the worker executor.
    ///
    /// # Panics
    ///
    /// Panics when the call has already started.
    pub fn enqueue(self, callback: impl Callback) {
        assert!(!self.shared.mark_executed(), "call already executed");

        let dispatcher = self.client.dispatcher().clone();
        let job = {
            let client = self.client.clone();
            let shared = self.shared.clone();
            let dispatcher = dispatcher.clone();
            async move {
                // Whatever happens below, the dispatcher hears about
                // this call's termination exactly once.
                let _guard = FinishGuard::asynchronous(dispatcher, shared.clone());
                let outcome = run_exchange(&client, &shared).await;
                deliver(Box::new(callback), &shared, outcome);
            }
            .boxed()
        };

        dispatcher.enqueue(AsyncCall::new(self.shared, job));
    }
}

/// Deliver the outcome, downgrading it to a cancellation error when the
/// call was cancelled along the way. A panicking callback is logged and
/// swallowed; the call still terminates cleanly.
fn deliver(callback: Box<dyn Callback>, shared: &CallShared, outcome: Result<Response, Error>) {
    let outcome = if shared.is_canceled() {
        Err(Error::Canceled)
    } else {
        outcome
    };

    let delivered = std::panic::catch_unwind(AssertUnwindSafe(move || match outcome {
        Ok(response) => callback.on_response(response),
        Err(error) => callback.on_failure(error),
    }));

    if delivered.is_err() {
        warn!(call = %shared.id(), "callback panicked; failure suppressed");
    }
}

/// Notifies the dispatcher of a call's termination on drop, so every
/// exit path — return, error, or panic — promotes queued work.
struct FinishGuard {
    dispatcher: Dispatcher,
    shared: Arc<CallShared>,
    synchronous: bool,
}

impl FinishGuard {
    fn asynchronous(dispatcher: Dispatcher, shared: Arc<CallShared>) -> Self {
        Self {
            dispatcher,
            shared,
            synchronous: false,
        }
    }

    fn synchronous(dispatcher: Dispatcher, shared: Arc<CallShared>) -> Self {
        Self {
            dispatcher,
            shared,
            synchronous: true,
        }
    }
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        if self.synchronous {
            self.dispatcher.finished_sync(&self.shared);
        } else {
            self.dispatcher.finished_async(&self.shared);
        }
    }
}

/// Run the interceptor chain over the call's request; the terminal link
/// drives the transport engine.
async fn run_exchange(client: &Arc<ClientRef>, shared: &Arc<CallShared>) -> Result<Response, Error> {
    let link = EngineLink { client, shared };
    let chain = Chain::new(client.interceptors(), &link, shared.request().clone());
    chain.proceed(shared.request().clone()).await
}

/// The final chain link: sends the request through engines, recovering
/// from retryable failures and following redirects.
struct EngineLink<'a> {
    client: &'a Arc<ClientRef>,
    shared: &'a Arc<CallShared>,
}

impl Terminal for EngineLink<'_> {
    fn transmit(&self, request: Request) -> BoxFuture<'_, Result<Response, Error>> {
        Box::pin(self.run(request))
    }
}

impl EngineLink<'_> {
    async fn run(&self, mut request: Request) -> Result<Response, Error> {
        let shared = self.shared;
        let mut follow_up_count = 0usize;

        loop {
            if shared.is_canceled() {
                return Err(Error::Canceled);
            }

            let mut engine = self.client.engines().create(&request);
            shared.set_canceller(Some(engine.canceller()));

            // Attempt the exchange, recovering while the engine thinks
            // the failure is worth another try.
            let response = loop {
                let result = match engine.send_request().await {
                    Ok(()) => engine.read_response().await,
                    Err(error) => Err(error),
                };

                match result {
                    Ok(response) => break response,
                    Err(error) => match engine.recover(&error) {
                        Some(retry) => {
                            debug!(call = %shared.id(), %error, "recovered; retrying exchange");
                            engine = retry;
                            shared.set_canceller(Some(engine.canceller()));
                        }
                        None => {
                            engine.release();
                            shared.set_canceller(None);
                            return Err(error);
                        }
                    },
                }
            };

            let follow_up = engine.follow_up_request(&response);
            engine.release();
            shared.set_canceller(None);

            match follow_up {
                None => {
                    trace!(call = %shared.id(), status = %response.status(), "exchange complete");
                    return Ok(response);
                }
                Some(next) => {
                    follow_up_count += 1;
                    if follow_up_count > self.client.follow_up_limit() {
                        return Err(Error::TooManyFollowUps(follow_up_count));
                    }
                    trace!(call = %shared.id(), follow_up = follow_up_count, "following up");
                    request = next;
                }
            }
        }
    }
}
