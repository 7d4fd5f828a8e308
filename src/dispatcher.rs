//! Policy on when asynchronous calls are executed.
//!
//! The dispatcher admits calls under two caps: a global bound on
//! concurrently running calls, and a per-host bound keyed on the
//! request URL's host. Calls past either cap wait in a FIFO ready
//! queue and are promoted as running calls finish.
//!
//! All queue mutation happens under one mutex. Workers run the call
//! body with no dispatcher lock held and re-enter exactly once, through
//! `finished`, which is the single point where queued calls advance.
//! That property is what bounds the wait of every ready call: any
//! running call's termination promotes the next eligible one.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tracing::trace;

use crate::call::{AsyncCall, CallShared};

/// Default global concurrency cap.
const DEFAULT_MAX_REQUESTS: usize = 64;

/// Default per-host concurrency cap.
const DEFAULT_MAX_REQUESTS_PER_HOST: usize = 5;

/// Runs call bodies handed over by the dispatcher.
///
/// An executor must accept at least the configured maximum number of
/// concurrent tasks without blocking on submission, and must run every
/// submitted task to completion even while the dispatcher is being
/// reconfigured.
pub trait Executor: Send + Sync {
    /// Hand a call body to the executor. Must not block.
    fn execute(&self, task: BoxFuture<'static, ()>);
}

/// The default executor: spawns onto the ambient tokio runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioExecutor;

impl Executor for TokioExecutor {
    fn execute(&self, task: BoxFuture<'static, ()>) {
        tokio::spawn(task);
    }
}

/// Admission and scheduling for asynchronous calls.
///
/// Cloning shares the underlying queues.
#[derive(Clone)]
pub struct Dispatcher {
    shared: Arc<DispatcherShared>,
}

struct DispatcherShared {
    executor: Box<dyn Executor>,
    state: Mutex<DispatcherState>,
}

struct DispatcherState {
    max_requests: usize,
    max_requests_per_host: usize,

    /// Ready calls, in the order they will run.
    ready: VecDeque<AsyncCall>,

    /// Running asynchronous calls, including cancelled calls that have
    /// not finished yet.
    running_async: Vec<Arc<CallShared>>,

    /// In-flight synchronous calls, including cancelled calls that
    /// have not finished yet.
    running_sync: Vec<Arc<CallShared>>,
}

impl Dispatcher {
    /// A dispatcher with the default caps, running calls on tokio.
    pub fn new() -> Self {
        Self::with_executor(Box::new(TokioExecutor))
    }

    /// A dispatcher handing call bodies to `executor`.
    pub fn with_executor(executor: Box<dyn Executor>) -> Self {
        Self {
            shared: Arc::new(DispatcherShared {
                executor,
                state: Mutex::new(DispatcherState {
                    max_requests: DEFAULT_MAX_REQUESTS,
                    max_requests_per_host: DEFAULT_MAX_REQUESTS_PER_HOST,
                    ready: VecDeque::new(),
                    running_async: Vec::new(),
                    running_sync: Vec::new(),
                }),
            }),
        }
    }

    /// Set the maximum number of calls to run concurrently. Calls past
    /// the cap queue in memory waiting for running calls to complete.
    ///
    /// Calls already past admission are unaffected.
    ///
    /// # Panics
    ///
    /// Panics when `max_requests` is zero.
    pub fn set_max_requests(&self, max_requests: usize) {
        assert!(max_requests >= 1, "max < 1: {max_requests}");
        let mut state = self.shared.state.lock();
        state.max_requests = max_requests;
        self.shared.promote_calls(&mut state);
    }

    /// The global concurrency cap.
    pub fn max_requests(&self) -> usize {
        self.shared.state.lock().max_requests
    }

    /// Set the maximum number of calls to run concurrently against a
    /// single host, keyed on the URL's host name. Concurrency against
    /// a single IP may still exceed this: multiple host names can share
    /// an address.
    ///
    /// Calls already past admission are unaffected.
    ///
    /// # Panics
    ///
    /// Panics when `max_requests_per_host` is zero.
    pub fn set_max_requests_per_host(&self, max_requests_per_host: usize) {
        assert!(max_requests_per_host >= 1, "max < 1: {max_requests_per_host}");
        let mut state = self.shared.state.lock();
        state.max_requests_per_host = max_requests_per_host;
        self.shared.promote_calls(&mut state);
    }

    /// The per-host concurrency cap.
    pub fn max_requests_per_host(&self) -> usize {
        self.shared.state.lock().max_requests_per_host
    }

    /// Admit an asynchronous call: run it now if both caps allow,
    /// otherwise queue it.
    pub(crate) fn enqueue(&self, call: AsyncCall) {
        let mut state = self.shared.state.lock();
        if state.running_async.len() < state.max_requests
            && state.running_calls_for_host(call.shared().host()) < state.max_requests_per_host
        {
            trace!(call = %call.shared().id(), "call admitted");
            let (shared, job) = call.into_parts();
            state.running_async.push(shared);
            self.shared.executor.execute(job);
        } else {
            trace!(call = %call.shared().id(), "call queued");
            state.ready.push_back(call);
        }
    }

    /// Record that a synchronous call has begun on its caller's task.
    pub(crate) fn executed(&self, call: Arc<CallShared>) {
        self.shared.state.lock().running_sync.push(call);
    }

    /// Signal completion of an asynchronous call and promote queued
    /// calls into the freed capacity.
    ///
    /// # Panics
    ///
    /// Panics when `call` is not running: that is a bug in the caller.
    pub(crate) fn finished_async(&self, call: &Arc<CallShared>) {
        let mut state = self.shared.state.lock();
        let before = state.running_async.len();
        state
            .running_async
            .retain(|running| !Arc::ptr_eq(running, call));
        assert!(
            state.running_async.len() < before,
            "async call was not running"
        );
        self.shared.promote_calls(&mut state);
    }

    /// Signal completion of a synchronous call.
    ///
    /// # Panics
    ///
    /// Panics when `call` is not in flight: that is a bug in the caller.
    pub(crate) fn finished_sync(&self, call: &Arc<CallShared>) {
        let mut state = self.shared.state.lock();
        let before = state.running_sync.len();
        state
            .running_sync
            .retain(|running| !Arc::ptr_eq(running, call));
        assert!(
            state.running_sync.len() < before,
            "sync call was not in flight"
        );
    }

    /// Cancel every call whose tag equals `tag`, queued or running,
    /// synchronous or asynchronous.
    ///
    /// Cancellation is cooperative: queued calls are still dispatched
    /// and observe the flag before their callback fires, and running
    /// calls have their engine interrupted when one is reachable.
    pub fn cancel(&self, tag: &str) {
        let state = self.shared.state.lock();

        for call in &state.ready {
            if call.shared().tag() == Some(tag) {
                call.shared().cancel();
            }
        }

        for call in state.running_async.iter().chain(&state.running_sync) {
            if call.tag() == Some(tag) {
                call.cancel();
            }
        }
    }

    /// The number of asynchronous calls currently running.
    pub fn running_call_count(&self) -> usize {
        self.shared.state.lock().running_async.len()
    }

    /// The number of asynchronous calls awaiting admission.
    pub fn queued_call_count(&self) -> usize {
        self.shared.state.lock().ready.len()
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("Dispatcher")
            .field("max_requests", &state.max_requests)
            .field("max_requests_per_host", &state.max_requests_per_host)
            .field("ready", &state.ready.len())
            .field("running_async", &state.running_async.len())
            .field("running_sync", &state.running_sync.len())
            .finish()
    }
}

impl DispatcherShared {
    /// Walk the ready queue in FIFO order, moving calls whose host has
    /// headroom into the running set until the global cap is reached.
    fn promote_calls(&self, state: &mut DispatcherState) {
        if state.running_async.len() >= state.max_requests {
            return; // Already running at capacity.
        }
        if state.ready.is_empty() {
            return; // Nothing to promote.
        }

        let mut index = 0;
        while index < state.ready.len() {
            let host_saturated = {
                let call = &state.ready[index];
                state.running_calls_for_host(call.shared().host())
                    >= state.max_requests_per_host
            };

            if host_saturated {
                index += 1;
                continue;
            }

            let call = state
                .ready
                .remove(index)
                .expect("indexed ready call exists");
            trace!(call = %call.shared().id(), "call promoted");
            let (shared, job) = call.into_parts();
            state.running_async.push(shared);
            self.executor.execute(job);

            if state.running_async.len() >= state.max_requests {
                return; // Reached capacity.
            }
        }
    }
}

impl DispatcherState {
    /// The number of running asynchronous calls sharing `host`.
    fn running_calls_for_host(&self, host: &str) -> usize {
        self.running_async
            .iter()
            .filter(|call| call.host() == host)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::sync::oneshot;

    use futures_util::FutureExt;

    use crate::request::Request;

    /// A call whose body waits on a oneshot before reporting finished.
    fn gated_call(dispatcher: &Dispatcher, url: &str) -> (Arc<CallShared>, oneshot::Sender<()>) {
        let request = Request::get(url.parse().unwrap());
        let shared = Arc::new(CallShared::new(request));
        let (tx, rx) = oneshot::channel::<()>();

        let job = {
            let dispatcher = dispatcher.clone();
            let shared = shared.clone();
            async move {
                let _ = rx.await;
                dispatcher.finished_async(&shared);
            }
            .boxed()
        };

        let call = AsyncCall::new(shared.clone(), job);
        dispatcher.enqueue(call);
        (shared, tx)
    }

    async fn drain() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn global_cap_bounds_running_calls() {
        let _ = tracing_subscriber::fmt::try_init();
        let dispatcher = Dispatcher::new();
        dispatcher.set_max_requests(2);

        let mut gates = Vec::new();
        for index in 0..5 {
            let url = format!("http://host{index}.test/");
            gates.push(gated_call(&dispatcher, &url).1);
        }

        assert_eq!(dispatcher.running_call_count(), 2);
        assert_eq!(dispatcher.queued_call_count(), 3);

        for gate in gates {
            let _ = gate.send(());
            drain().await;
            assert!(dispatcher.running_call_count() <= 2);
        }

        assert_eq!(dispatcher.running_call_count(), 0);
        assert_eq!(dispatcher.queued_call_count(), 0);
    }

    #[tokio::test]
    async fn per_host_cap_bounds_running_calls() {
        let _ = tracing_subscriber::fmt::try_init();
        let dispatcher = Dispatcher::new();
        dispatcher.set_max_requests_per_host(2);

        let mut gates = Vec::new();
        for _ in 0..3 {
            gates.push(gated_call(&dispatcher, "http://crowded.test/").1);
        }
        assert_eq!(dispatcher.running_call_count(), 2);
        assert_eq!(dispatcher.queued_call_count(), 1);

        // A call to a different host is admitted past the queue.
        let (_elsewhere, gate) = gated_call(&dispatcher, "http://elsewhere.test/");
        assert_eq!(dispatcher.running_call_count(), 3);
        assert_eq!(dispatcher.queued_call_count(), 1);
        gates.push(gate);

        let _ = gates.remove(0).send(());
        drain().await;
        assert_eq!(dispatcher.running_call_count(), 3);
        assert_eq!(dispatcher.queued_call_count(), 0);

        for gate in gates {
            let _ = gate.send(());
        }
        drain().await;
        assert_eq!(dispatcher.running_call_count(), 0);
    }

    #[tokio::test]
    async fn promotion_is_fifo_per_host() {
        let _ = tracing_subscriber::fmt::try_init();
        let dispatcher = Dispatcher::new();
        dispatcher.set_max_requests_per_host(1);

        let (running, gate) = gated_call(&dispatcher, "http://h1.test/first");
        let (second, _gate_b) = gated_call(&dispatcher, "http://h1.test/second");
        let (third, _gate_c) = gated_call(&dispatcher, "http://h1.test/third");
        assert_eq!(dispatcher.queued_call_count(), 2);

        let _ = gate.send(());
        drain().await;

        // The earlier-enqueued call runs; the later one still waits.
        let state = dispatcher.shared.state.lock();
        assert!(state.running_async.iter().any(|c| Arc::ptr_eq(c, &second)));
        assert!(!state.running_async.iter().any(|c| Arc::ptr_eq(c, &third)));
        assert_eq!(state.ready.len(), 1);
        drop(state);
        drop(running);
    }

    #[tokio::test]
    async fn raising_the_cap_promotes_queued_calls() {
        let _ = tracing_subscriber::fmt::try_init();
        let dispatcher = Dispatcher::new();
        dispatcher.set_max_requests(1);

        let (_a, _gate_a) = gated_call(&dispatcher, "http://h1.test/");
        let (_b, _gate_b) = gated_call(&dispatcher, "http://h2.test/");
        assert_eq!(dispatcher.running_call_count(), 1);
        assert_eq!(dispatcher.queued_call_count(), 1);

        dispatcher.set_max_requests(2);
        assert_eq!(dispatcher.running_call_count(), 2);
        assert_eq!(dispatcher.queued_call_count(), 0);
    }

    #[tokio::test]
    async fn cancel_marks_every_queue_by_tag() {
        let _ = tracing_subscriber::fmt::try_init();
        let dispatcher = Dispatcher::new();
        dispatcher.set_max_requests(1);

        let request = |url: &str, tag: &str| {
            Request::builder()
                .url(url.parse().unwrap())
                .tag(tag)
                .build()
        };

        let running = Arc::new(CallShared::new(request("http://h1.test/", "batch")));
        {
            let dispatcher_clone = dispatcher.clone();
            let shared = running.clone();
            let (_tx, rx) = oneshot::channel::<()>();
            dispatcher.enqueue(AsyncCall::new(
                running.clone(),
                async move {
                    let _ = rx.await;
                    dispatcher_clone.finished_async(&shared);
                }
                .boxed(),
            ));
        }

        let queued = Arc::new(CallShared::new(request("http://h1.test/q", "batch")));
        dispatcher.enqueue(AsyncCall::new(queued.clone(), async {}.boxed()));

        let synchronous = Arc::new(CallShared::new(request("http://h1.test/s", "batch")));
        dispatcher.executed(synchronous.clone());

        let unrelated = Arc::new(CallShared::new(request("http://h1.test/u", "other")));
        dispatcher.executed(unrelated.clone());

        dispatcher.cancel("batch");

        assert!(running.is_canceled());
        assert!(queued.is_canceled());
        assert!(synchronous.is_canceled());
        assert!(!unrelated.is_canceled());

        // Cancelling a queued call does not remove it from the queue.
        assert_eq!(dispatcher.queued_call_count(), 1);

        dispatcher.finished_sync(&synchronous);
        dispatcher.finished_sync(&unrelated);
    }

    #[tokio::test]
    #[should_panic(expected = "async call was not running")]
    async fn finishing_an_unknown_call_is_a_bug() {
        let dispatcher = Dispatcher::new();
        let shared = Arc::new(CallShared::new(Request::get(
            "http://h1.test/".parse().unwrap(),
        )));
        dispatcher.finished_async(&shared);
    }

    #[test]
    #[should_panic(expected = "max < 1: 0")]
    fn zero_max_requests_is_rejected() {
        Dispatcher::new().set_max_requests(0);
    }

    #[test]
    #[should_panic(expected = "max < 1: 0")]
    fn zero_max_requests_per_host_is_rejected() {
        Dispatcher::new().set_max_requests_per_host(0);
    }
}
