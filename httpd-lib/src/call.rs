//! A single request/response exchange and its lifecycle.

use std::fmt::{self, Debug};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

use log::{debug, trace};
use strum::Display;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::chain::Chain;
use crate::dispatcher::HostKey;
use crate::route::{Route, RouteSelector};
use crate::timeout::Timeout;
use crate::{ErrorKind, Httpd, Request, Response, Result};

static NEXT_CALL_ID: AtomicU64 = AtomicU64::new(1);

/// Where a call is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum CallState {
    /// Built but not started
    Created,
    /// Handed to `execute`, `execute_blocking` or `enqueue`
    Executing,
    /// A response was produced
    Completed,
    /// The call failed
    Failed,
    /// The call was cancelled before it finished
    Cancelled,
}

/// A request that is ready to run.
///
/// A call runs at most once: through [`Call::execute`],
/// [`Call::execute_blocking`] or [`Call::enqueue`]. Cloning yields another
/// handle to the same call, which is how [`Call::cancel`] reaches a call
/// running elsewhere.
#[derive(Clone)]
pub struct Call {
    inner: Arc<CallInner>,
}

struct CallInner {
    id: u64,
    client: Httpd,
    request: Request,
    host: HostKey,
    token: CancellationToken,
    executed: AtomicBool,
    state: Mutex<CallState>,
    /// Routes of the current address, kept across retries of this call
    route_selector: tokio::sync::Mutex<Option<RouteSelector>>,
    /// Route of the connection most recently opened for this call
    route: Mutex<Option<Route>>,
}

impl Call {
    pub(crate) fn new(client: Httpd, request: Request) -> Self {
        let host = HostKey::from(request.url());
        Self {
            inner: Arc::new(CallInner {
                id: NEXT_CALL_ID.fetch_add(1, Ordering::Relaxed),
                client,
                request,
                host,
                token: CancellationToken::new(),
                executed: AtomicBool::new(false),
                state: Mutex::new(CallState::Created),
                route_selector: tokio::sync::Mutex::new(None),
                route: Mutex::new(None),
            }),
        }
    }

    /// Process-unique identifier
    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// The original request
    #[must_use]
    pub fn request(&self) -> &Request {
        &self.inner.request
    }

    /// The client this call was created by
    #[must_use]
    pub fn client(&self) -> &Httpd {
        &self.inner.client
    }

    /// The host the call counts against in the dispatcher
    #[must_use]
    pub fn host(&self) -> &HostKey {
        &self.inner.host
    }

    /// The current lifecycle state
    #[must_use]
    pub fn state(&self) -> CallState {
        *self.inner.state.lock().expect("call state lock poisoned")
    }

    /// Whether the call was started
    #[must_use]
    pub fn is_executed(&self) -> bool {
        self.inner.executed.load(Ordering::SeqCst)
    }

    /// Whether [`Call::cancel`] was invoked
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Cancel the call.
    ///
    /// Idempotent. A call that has not started fails with
    /// [`ErrorKind::Cancelled`] as soon as it is run; a running call is
    /// interrupted at its next suspension point and its in-flight
    /// connection work is dropped.
    pub fn cancel(&self) {
        if !self.inner.token.is_cancelled() {
            debug!("Cancelling call {} to {}", self.id(), self.request().url());
            self.inner.token.cancel();
        }
    }

    /// The route of the last connection opened for this call, if any.
    /// Pooled connections do not update it.
    #[must_use]
    pub fn route(&self) -> Option<Route> {
        self.inner
            .route
            .lock()
            .expect("call route lock poisoned")
            .clone()
    }

    pub(crate) fn set_route(&self, route: Route) {
        *self.inner.route.lock().expect("call route lock poisoned") = Some(route);
    }

    pub(crate) fn route_selector(&self) -> &tokio::sync::Mutex<Option<RouteSelector>> {
        &self.inner.route_selector
    }

    /// Run the call on the current task and wait for its response.
    ///
    /// The call is tracked by the dispatcher while it runs but does not
    /// count against its caps.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::AlreadyExecuted`] if the call was started before,
    /// otherwise whatever the pipeline fails with.
    pub async fn execute(&self) -> Result<Response> {
        self.mark_executed()?;
        self.execute_marked().await
    }

    async fn execute_marked(&self) -> Result<Response> {
        let dispatcher = self.client().dispatcher();
        dispatcher.executed(self);
        let _finished = SyncFinished(self);
        self.run().await
    }

    /// Run the call and block the current thread until it completes.
    ///
    /// The call is spawned on the client's runtime if one is configured,
    /// otherwise on a runtime created for this call.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::BlockingInRuntime`] when called from a thread that
    /// drives an async runtime, plus the errors of [`Call::execute`].
    pub fn execute_blocking(&self) -> Result<Response> {
        if Handle::try_current().is_ok() {
            return Err(ErrorKind::BlockingInRuntime);
        }
        self.mark_executed()?;

        let Some(handle) = self.client().runtime() else {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;
            return runtime.block_on(self.execute_marked());
        };

        let slot: Arc<ResultSlot> = Arc::new((Mutex::new(None), Condvar::new()));
        let mut outcome = BlockingOutcome {
            call: self.clone(),
            slot: Arc::clone(&slot),
            result: None,
        };
        handle.spawn(async move {
            let call = outcome.call.clone();
            outcome.result = Some(call.execute_marked().await);
        });

        let (lock, signal) = &*slot;
        let waiter = Timeout::new();
        let mut outcome = lock.lock().expect("call result lock poisoned");
        loop {
            if let Some(result) = outcome.take() {
                return result;
            }
            outcome = waiter.wait_until_signaled(signal, outcome)?;
        }
    }

    /// Schedule the call on the dispatcher. `callback` receives the outcome
    /// exactly once, on the executor.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::AlreadyExecuted`] if the call was started before. The
    /// callback is not invoked in that case.
    pub fn enqueue<F>(&self, callback: F) -> Result<()>
    where
        F: FnOnce(Result<Response>) + Send + 'static,
    {
        self.mark_executed()?;
        self.client()
            .dispatcher()
            .enqueue(self.clone(), Box::new(callback));
        Ok(())
    }

    fn mark_executed(&self) -> Result<()> {
        if self.inner.executed.swap(true, Ordering::SeqCst) {
            return Err(ErrorKind::AlreadyExecuted);
        }
        self.set_state(CallState::Executing);
        Ok(())
    }

    pub(crate) fn set_state(&self, state: CallState) {
        *self.inner.state.lock().expect("call state lock poisoned") = state;
    }

    /// Drive the request through the interceptor chain under the call
    /// timeout. Cancellation wins over every other outcome.
    pub(crate) async fn run(&self) -> Result<Response> {
        let client = self.client();
        let mut guard = Timeout::new().with_cancellation(self.inner.token.clone());
        if !client.call_timeout().is_zero() {
            guard = guard.with_deadline_at(Instant::now() + client.call_timeout());
        }
        trace!("Executing call {} to {}", self.id(), self.request().url());

        let chain = Chain::new(client.chain(), self.request().clone(), self, &guard);
        let result = match guard.run(chain.proceed(self.request().clone())).await {
            Err(_) if self.is_cancelled() => Err(ErrorKind::Cancelled),
            Err(ErrorKind::Interrupted) => Err(ErrorKind::Cancelled),
            result => result,
        };

        self.set_state(match &result {
            Ok(_) => CallState::Completed,
            Err(ErrorKind::Cancelled) => CallState::Cancelled,
            Err(_) => CallState::Failed,
        });
        match &result {
            Ok(response) => debug!(
                "Call {} completed with {} ({})",
                self.id(),
                response.status(),
                response.protocol()
            ),
            Err(e) => debug!("Call {} failed: {e}", self.id()),
        }
        result
    }
}

type ResultSlot = (Mutex<Option<Result<Response>>>, Condvar);

/// Hands the result of a blocking call to the waiting thread when the
/// spawned task ends. A task that panics or is dropped by a shutting down
/// runtime leaves no result, and the call ends as cancelled.
struct BlockingOutcome {
    call: Call,
    slot: Arc<ResultSlot>,
    result: Option<Result<Response>>,
}

impl Drop for BlockingOutcome {
    fn drop(&mut self) {
        let result = self.result.take().unwrap_or_else(|| {
            debug!("Call {} ended without a result", self.call.id());
            self.call.set_state(CallState::Cancelled);
            Err(ErrorKind::Cancelled)
        });
        let (lock, signal) = &*self.slot;
        if let Ok(mut outcome) = lock.lock() {
            *outcome = Some(result);
        }
        signal.notify_all();
    }
}

/// Tells the dispatcher a directly executed call is over, including when
/// its future is dropped early.
struct SyncFinished<'a>(&'a Call);

impl Drop for SyncFinished<'_> {
    fn drop(&mut self) {
        self.0.client().dispatcher().finished_sync(self.0);
    }
}

impl Debug for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Call")
            .field("id", &self.id())
            .field("method", self.request().method())
            .field("url", &self.request().url().as_str())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::CallState;
    use crate::{ErrorKind, HttpdBuilder, Request};

    #[tokio::test]
    async fn test_call_runs_once() {
        let mock_server = test_utils::mock_server!(http::StatusCode::OK);
        let client = HttpdBuilder::builder().build().client().unwrap();
        let call = client.new_call(Request::get(&mock_server.uri()).unwrap());
        assert_eq!(call.state(), CallState::Created);

        let response = call.execute().await.unwrap();
        assert_eq!(response.status(), http::StatusCode::OK);
        assert_eq!(call.state(), CallState::Completed);
        assert!(call.is_executed());

        assert_eq!(
            call.execute().await.unwrap_err(),
            ErrorKind::AlreadyExecuted
        );
        assert_eq!(call.enqueue(|_| {}).unwrap_err(), ErrorKind::AlreadyExecuted);
        assert_eq!(client.dispatcher().running_calls_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let client = HttpdBuilder::builder().build().client().unwrap();
        let call = client.new_call(Request::get("http://127.0.0.1:9/").unwrap());
        call.cancel();
        call.cancel();
        assert!(call.is_cancelled());
        assert_eq!(call.execute().await.unwrap_err(), ErrorKind::Cancelled);
        assert_eq!(call.state(), CallState::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_after_completion_changes_nothing() {
        let mock_server = test_utils::mock_server!(http::StatusCode::OK, set_body_string("done"));
        let client = HttpdBuilder::builder().build().client().unwrap();
        let call = client.new_call(Request::get(&mock_server.uri()).unwrap());

        let response = call.execute().await.unwrap();
        call.cancel();
        call.cancel();

        assert_eq!(call.state(), CallState::Completed);
        assert_eq!(response.status(), http::StatusCode::OK);
        assert_eq!(response.text(), "done");
        assert_eq!(client.dispatcher().running_calls_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_running_call() {
        let mock_server = test_utils::mock_server!(
            http::StatusCode::OK,
            set_delay(Duration::from_secs(10))
        );
        let client = HttpdBuilder::builder().build().client().unwrap();
        let call = client.new_call(Request::get(&mock_server.uri()).unwrap());

        let canceller = call.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let start = std::time::Instant::now();
        assert_eq!(call.execute().await.unwrap_err(), ErrorKind::Cancelled);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_enqueue_delivers_outcome() {
        let mock_server = test_utils::mock_server!(http::StatusCode::ACCEPTED);
        let client = HttpdBuilder::builder().build().client().unwrap();
        let call = client.new_call(Request::get(&mock_server.uri()).unwrap());

        let (tx, rx) = tokio::sync::oneshot::channel();
        call.enqueue(move |result| {
            let _ = tx.send(result);
        })
        .unwrap();
        let response = rx.await.unwrap().unwrap();
        assert_eq!(response.status(), http::StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn test_blocking_inside_runtime_is_rejected() {
        let client = HttpdBuilder::builder().build().client().unwrap();
        let call = client.new_call(Request::get("http://127.0.0.1:9/").unwrap());
        assert_eq!(
            call.execute_blocking().unwrap_err(),
            ErrorKind::BlockingInRuntime
        );
        assert!(!call.is_executed());
    }

    #[test]
    fn test_execute_blocking_on_client_runtime() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let mock_server = runtime.block_on(async { test_utils::mock_server!(http::StatusCode::OK) });
        let client = HttpdBuilder::builder()
            .runtime(runtime.handle().clone())
            .build()
            .client()
            .unwrap();

        let (tx, rx) = mpsc::channel();
        let uri = mock_server.uri();
        std::thread::spawn(move || {
            let call = client.new_call(Request::get(&uri).unwrap());
            tx.send(call.execute_blocking()).unwrap();
        });
        let response = rx.recv().unwrap().unwrap();
        assert_eq!(response.status(), http::StatusCode::OK);
    }

    #[test]
    fn test_execute_blocking_returns_when_runtime_shuts_down() {
        let server_runtime = tokio::runtime::Runtime::new().unwrap();
        let mock_server = server_runtime.block_on(async {
            test_utils::mock_server!(http::StatusCode::OK, set_delay(Duration::from_secs(30)))
        });
        let client_runtime = tokio::runtime::Runtime::new().unwrap();
        let client = HttpdBuilder::builder()
            .runtime(client_runtime.handle().clone())
            .build()
            .client()
            .unwrap();

        let (tx, rx) = mpsc::channel();
        let call = client.new_call(Request::get(&mock_server.uri()).unwrap());
        let blocking = call.clone();
        std::thread::spawn(move || {
            tx.send(blocking.execute_blocking()).unwrap();
        });
        while call.state() == CallState::Created {
            std::thread::sleep(Duration::from_millis(10));
        }
        std::thread::sleep(Duration::from_millis(200));
        drop(client_runtime);

        let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(result.unwrap_err(), ErrorKind::Cancelled);
        assert_eq!(call.state(), CallState::Cancelled);
    }
}
