//! Admission control for asynchronous calls.
//!
//! Enqueued calls wait in FIFO order until both the global cap and the cap
//! for their host leave room, then run on the [`Executor`]. Whenever a call
//! finishes the queue is scanned again and every call that fits is promoted.
//!
//! Caps never scale on their own. A busy host can delay calls to other
//! hosts only up to its per-host cap.

use std::collections::{HashMap, VecDeque};
use std::fmt::{self, Debug, Display};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::BoxFuture;
use log::{debug, trace};
use tokio::runtime::Handle;
use url::Url;

use crate::call::{Call, CallState};
use crate::{ErrorKind, Response, Result};

/// Default maximum number of concurrently running calls, 64.
pub const DEFAULT_MAX_REQUESTS: usize = 64;
/// Default maximum number of concurrently running calls per host, 5.
pub const DEFAULT_MAX_REQUESTS_PER_HOST: usize = 5;

/// Receives the outcome of an enqueued call, exactly once.
pub type Callback = Box<dyn FnOnce(Result<Response>) + Send + 'static>;

/// A unit of background work
pub type Task = BoxFuture<'static, ()>;

/// The worker pool enqueued calls run on.
pub trait Executor: Send + Sync + Debug {
    /// Run `task` to completion in the background.
    ///
    /// # Errors
    ///
    /// Fails if the task cannot be scheduled; it is dropped unpolled.
    fn execute(&self, task: Task) -> Result<()>;
}

/// Spawns tasks on a tokio runtime: the configured one, or else the one the
/// caller runs on.
#[derive(Debug, Default, Clone)]
pub struct TokioExecutor {
    handle: Option<Handle>,
}

impl TokioExecutor {
    /// Spawn on the caller's runtime
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn on the runtime behind `handle`
    #[must_use]
    pub const fn with_handle(handle: Handle) -> Self {
        Self {
            handle: Some(handle),
        }
    }

    /// The runtime tasks are spawned on, if one is available
    #[must_use]
    pub fn handle(&self) -> Option<Handle> {
        self.handle.clone().or_else(|| Handle::try_current().ok())
    }
}

impl Executor for TokioExecutor {
    fn execute(&self, task: Task) -> Result<()> {
        let handle = self.handle().ok_or(ErrorKind::NoRuntime)?;
        handle.spawn(task);
        Ok(())
    }
}

/// A normalized hostname, the unit of per-host admission.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostKey(String);

impl HostKey {
    /// Get the hostname as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&Url> for HostKey {
    fn from(url: &Url) -> Self {
        Self(url.host_str().unwrap_or_default().to_lowercase())
    }
}

impl From<&str> for HostKey {
    fn from(host: &str) -> Self {
        Self(host.to_lowercase())
    }
}

impl Display for HostKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hands the outcome of a call to its callback at most once, from whichever
/// side gets there first: the running task, or the dispatcher failing to
/// schedule it.
struct Completion(Mutex<Option<Callback>>);

impl Completion {
    fn complete(&self, result: Result<Response>) {
        let callback = self.0.lock().expect("completion lock poisoned").take();
        if let Some(callback) = callback {
            callback(result);
        }
    }
}

struct AsyncCall {
    call: Call,
    completion: Arc<Completion>,
}

/// Schedules enqueued calls under a global and a per-host concurrency cap.
///
/// Cloning is cheap; clones share the same queue.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    state: Mutex<DispatcherState>,
    executor: Arc<dyn Executor>,
}

struct DispatcherState {
    max_requests: usize,
    max_requests_per_host: usize,
    ready: VecDeque<AsyncCall>,
    running: Vec<Call>,
    running_sync: Vec<Call>,
    per_host: HashMap<HostKey, usize>,
    idle_callback: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl DispatcherState {
    fn running_count(&self) -> usize {
        self.running.len() + self.running_sync.len()
    }

    fn all_running(&self) -> Vec<Call> {
        self.running
            .iter()
            .chain(&self.running_sync)
            .cloned()
            .collect()
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::unchecked(
            DEFAULT_MAX_REQUESTS,
            DEFAULT_MAX_REQUESTS_PER_HOST,
            Arc::new(TokioExecutor::new()),
        )
    }
}

impl Dispatcher {
    /// A dispatcher running at most `max_requests` calls at once, at most
    /// `max_requests_per_host` of them to the same host.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Config`] if a cap is zero.
    pub fn new(
        max_requests: usize,
        max_requests_per_host: usize,
        executor: Arc<dyn Executor>,
    ) -> Result<Self> {
        validate_cap("max_requests", max_requests)?;
        validate_cap("max_requests_per_host", max_requests_per_host)?;
        Ok(Self::unchecked(max_requests, max_requests_per_host, executor))
    }

    fn unchecked(
        max_requests: usize,
        max_requests_per_host: usize,
        executor: Arc<dyn Executor>,
    ) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                state: Mutex::new(DispatcherState {
                    max_requests,
                    max_requests_per_host,
                    ready: VecDeque::new(),
                    running: Vec::new(),
                    running_sync: Vec::new(),
                    per_host: HashMap::new(),
                    idle_callback: None,
                }),
                executor,
            }),
        }
    }

    /// The executor calls run on
    #[must_use]
    pub fn executor(&self) -> &Arc<dyn Executor> {
        &self.inner.executor
    }

    fn lock(&self) -> MutexGuard<'_, DispatcherState> {
        self.inner.state.lock().expect("dispatcher lock poisoned")
    }

    /// Maximum number of concurrently running calls
    #[must_use]
    pub fn max_requests(&self) -> usize {
        self.lock().max_requests
    }

    /// Change the global cap. Raising it promotes queued calls right away.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Config`] if `max_requests` is zero.
    pub fn set_max_requests(&self, max_requests: usize) -> Result<()> {
        validate_cap("max_requests", max_requests)?;
        self.lock().max_requests = max_requests;
        self.promote_and_execute();
        Ok(())
    }

    /// Maximum number of concurrently running calls per host
    #[must_use]
    pub fn max_requests_per_host(&self) -> usize {
        self.lock().max_requests_per_host
    }

    /// Change the per-host cap. Raising it promotes queued calls right away.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Config`] if `max_requests_per_host` is zero.
    pub fn set_max_requests_per_host(&self, max_requests_per_host: usize) -> Result<()> {
        validate_cap("max_requests_per_host", max_requests_per_host)?;
        self.lock().max_requests_per_host = max_requests_per_host;
        self.promote_and_execute();
        Ok(())
    }

    /// Invoke `callback` each time the dispatcher becomes idle
    pub fn set_idle_callback(&self, callback: Option<Arc<dyn Fn() + Send + Sync>>) {
        self.lock().idle_callback = callback;
    }

    /// Calls waiting to run, in queue order
    #[must_use]
    pub fn queued_calls(&self) -> Vec<Call> {
        self.lock().ready.iter().map(|c| c.call.clone()).collect()
    }

    /// Calls currently running, enqueued ones first
    #[must_use]
    pub fn running_calls(&self) -> Vec<Call> {
        self.lock().all_running()
    }

    /// Number of calls waiting to run
    #[must_use]
    pub fn queued_calls_count(&self) -> usize {
        self.lock().ready.len()
    }

    /// Number of calls currently running, blocking ones included
    #[must_use]
    pub fn running_calls_count(&self) -> usize {
        self.lock().running_count()
    }

    /// Cancel every queued and running call.
    ///
    /// Queued calls are removed without running and fail with
    /// [`ErrorKind::Cancelled`]; running calls fail as soon as they observe
    /// the cancellation.
    pub fn cancel_all(&self) {
        let (queued, running) = {
            let mut state = self.lock();
            let queued: Vec<AsyncCall> = state.ready.drain(..).collect();
            (queued, state.all_running())
        };
        debug!(
            "Cancelling {} queued and {} running calls",
            queued.len(),
            running.len()
        );
        for async_call in queued {
            async_call.call.cancel();
            async_call.call.set_state(CallState::Cancelled);
            async_call.completion.complete(Err(ErrorKind::Cancelled));
        }
        for call in running {
            call.cancel();
        }
    }

    pub(crate) fn enqueue(&self, call: Call, callback: Callback) {
        trace!("Enqueueing call {} to {}", call.id(), call.host());
        self.lock().ready.push_back(AsyncCall {
            call,
            completion: Arc::new(Completion(Mutex::new(Some(callback)))),
        });
        self.promote_and_execute();
    }

    /// Track a blocking call so [`Dispatcher::cancel_all`] reaches it
    pub(crate) fn executed(&self, call: &Call) {
        self.lock().running_sync.push(call.clone());
    }

    /// A blocking call completed
    pub(crate) fn finished_sync(&self, call: &Call) {
        self.lock().running_sync.retain(|c| c.id() != call.id());
        self.after_finished();
    }

    /// An enqueued call completed: free its slot and promote queued calls
    pub(crate) fn finished(&self, call: &Call) {
        {
            let mut state = self.lock();
            state.running.retain(|c| c.id() != call.id());
            if let Some(count) = state.per_host.get_mut(call.host()) {
                *count -= 1;
                if *count == 0 {
                    state.per_host.remove(call.host());
                }
            }
        }
        self.after_finished();
    }

    fn after_finished(&self) {
        if !self.promote_and_execute() {
            let idle_callback = self.lock().idle_callback.clone();
            if let Some(idle_callback) = idle_callback {
                idle_callback();
            }
        }
    }

    /// Move every queued call that fits under the caps to running and hand
    /// it to the executor. Returns whether any call is running.
    fn promote_and_execute(&self) -> bool {
        let (executable, is_running) = {
            let mut state = self.lock();
            let mut executable = Vec::new();
            let mut index = 0;
            while index < state.ready.len() {
                if state.running.len() >= state.max_requests {
                    break;
                }
                let host = state.ready[index].call.host().clone();
                let host_count = state.per_host.get(&host).copied().unwrap_or(0);
                if host_count >= state.max_requests_per_host {
                    index += 1;
                    continue;
                }
                let Some(async_call) = state.ready.remove(index) else {
                    break;
                };
                *state.per_host.entry(host).or_default() += 1;
                state.running.push(async_call.call.clone());
                executable.push(async_call);
            }
            let is_running = state.running_count() > 0;
            (executable, is_running)
        };

        for async_call in executable {
            self.execute_on(async_call);
        }
        is_running
    }

    fn execute_on(&self, async_call: AsyncCall) {
        let AsyncCall { call, completion } = async_call;
        trace!("Running call {} to {}", call.id(), call.host());

        let dispatcher = self.clone();
        let task_call = call.clone();
        let task_completion = Arc::clone(&completion);
        let task: Task = Box::pin(async move {
            let result = task_call.run().await;
            task_completion.complete(result);
            dispatcher.finished(&task_call);
        });

        if let Err(e) = self.inner.executor.execute(task) {
            debug!("Executor rejected call {}: {e}", call.id());
            call.set_state(CallState::Failed);
            completion.complete(Err(e));
            self.finished(&call);
        }
    }
}

fn validate_cap(name: &str, value: usize) -> Result<()> {
    if value == 0 {
        return Err(ErrorKind::Config(format!("{name} must be at least 1")));
    }
    Ok(())
}

impl Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("Dispatcher")
            .field("max_requests", &state.max_requests)
            .field("max_requests_per_host", &state.max_requests_per_host)
            .field("queued", &state.ready.len())
            .field("running", &state.running_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::fmt::{self, Debug};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::{Callback, Dispatcher, Executor, Task};
    use crate::call::{Call, CallState};
    use crate::{ErrorKind, Httpd, HttpdBuilder, Request, Result};

    /// Keeps tasks instead of running them, so calls stay "running" until
    /// the test finishes them.
    #[derive(Default)]
    struct RecordingExecutor {
        tasks: Mutex<Vec<Task>>,
    }

    impl Debug for RecordingExecutor {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("RecordingExecutor")
                .field("tasks", &self.tasks.lock().unwrap().len())
                .finish()
        }
    }

    impl Executor for RecordingExecutor {
        fn execute(&self, task: Task) -> Result<()> {
            self.tasks.lock().unwrap().push(task);
            Ok(())
        }
    }

    #[derive(Debug)]
    struct RejectingExecutor;

    impl Executor for RejectingExecutor {
        fn execute(&self, _task: Task) -> Result<()> {
            Err(ErrorKind::NoRuntime)
        }
    }

    fn client() -> Httpd {
        HttpdBuilder::builder().build().client().unwrap()
    }

    fn call(client: &Httpd, url: &str) -> Call {
        client.new_call(Request::get(url).unwrap())
    }

    fn ignore() -> Callback {
        Box::new(|_| {})
    }

    fn urls(calls: &[Call]) -> Vec<String> {
        calls.iter().map(|c| c.request().url().to_string()).collect()
    }

    #[test]
    fn test_caps_are_validated() {
        let executor = Arc::new(RecordingExecutor::default());
        assert!(matches!(
            Dispatcher::new(0, 1, executor.clone()),
            Err(ErrorKind::Config(_))
        ));
        let dispatcher = Dispatcher::new(1, 1, executor).unwrap();
        assert!(dispatcher.set_max_requests_per_host(0).is_err());
        assert_eq!(dispatcher.max_requests_per_host(), 1);
    }

    #[test]
    fn test_promotion_respects_host_and_global_caps() {
        let client = client();
        let executor = Arc::new(RecordingExecutor::default());
        let dispatcher = Dispatcher::new(2, 1, executor.clone()).unwrap();

        let a1 = call(&client, "http://a/1");
        let a2 = call(&client, "http://a/2");
        let a3 = call(&client, "http://a/3");
        let b1 = call(&client, "http://b/1");
        for c in [&a1, &a2, &a3, &b1] {
            dispatcher.enqueue(c.clone(), ignore());
        }

        assert_eq!(urls(&dispatcher.running_calls()), vec!["http://a/1", "http://b/1"]);
        assert_eq!(urls(&dispatcher.queued_calls()), vec!["http://a/2", "http://a/3"]);
        assert_eq!(executor.tasks.lock().unwrap().len(), 2);

        dispatcher.finished(&a1);
        assert_eq!(urls(&dispatcher.running_calls()), vec!["http://b/1", "http://a/2"]);
        assert_eq!(urls(&dispatcher.queued_calls()), vec!["http://a/3"]);
        assert_eq!(executor.tasks.lock().unwrap().len(), 3);
    }

    #[rstest]
    #[case(1, 1)]
    #[case(3, 1)]
    #[case(4, 2)]
    #[case(10, 10)]
    fn test_running_never_exceeds_caps(#[case] max: usize, #[case] per_host: usize) {
        let client = client();
        let executor = Arc::new(RecordingExecutor::default());
        let dispatcher = Dispatcher::new(max, per_host, executor).unwrap();

        let calls: Vec<Call> = (0..30)
            .map(|i| call(&client, &format!("http://host{}/{i}", i % 3)))
            .collect();
        for c in &calls {
            dispatcher.enqueue(c.clone(), ignore());
        }

        for c in &calls {
            let running = dispatcher.running_calls();
            assert!(running.len() <= max);
            for host in ["host0", "host1", "host2"] {
                let count = running
                    .iter()
                    .filter(|r| r.host().as_str() == host)
                    .count();
                assert!(count <= per_host, "{count} calls to {host}");
            }
            if running.iter().any(|r| r.id() == c.id()) {
                dispatcher.finished(c);
            }
        }
    }

    #[test]
    fn test_raising_caps_promotes_immediately() {
        let client = client();
        let executor = Arc::new(RecordingExecutor::default());
        let dispatcher = Dispatcher::new(1, 1, executor).unwrap();
        dispatcher.enqueue(call(&client, "http://a/1"), ignore());
        dispatcher.enqueue(call(&client, "http://b/1"), ignore());
        assert_eq!(dispatcher.running_calls_count(), 1);

        dispatcher.set_max_requests(2).unwrap();
        assert_eq!(dispatcher.running_calls_count(), 2);
        assert_eq!(dispatcher.queued_calls_count(), 0);
    }

    #[test]
    fn test_cancel_all_fails_queued_calls() {
        let client = client();
        let executor = Arc::new(RecordingExecutor::default());
        let dispatcher = Dispatcher::new(1, 1, executor).unwrap();

        let running = call(&client, "http://a/1");
        let queued = call(&client, "http://a/2");
        let outcome = Arc::new(Mutex::new(None));
        dispatcher.enqueue(running.clone(), ignore());
        let slot = Arc::clone(&outcome);
        dispatcher.enqueue(
            queued.clone(),
            Box::new(move |result| *slot.lock().unwrap() = Some(result.map(|_| ()))),
        );

        dispatcher.cancel_all();
        assert!(running.is_cancelled());
        assert!(queued.is_cancelled());
        assert_eq!(dispatcher.queued_calls_count(), 0);
        assert_eq!(*outcome.lock().unwrap(), Some(Err(ErrorKind::Cancelled)));
        assert_eq!(queued.state(), CallState::Cancelled);
    }

    #[test]
    fn test_cancel_all_ends_calls_enqueued_on_a_client() {
        let executor = Arc::new(RecordingExecutor::default());
        let client = HttpdBuilder::builder()
            .executor(executor.clone() as Arc<dyn Executor>)
            .max_requests(1usize)
            .build()
            .client()
            .unwrap();
        let first = call(&client, "http://a/1");
        let second = call(&client, "http://b/1");
        first.enqueue(|_| {}).unwrap();
        let outcome = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&outcome);
        second
            .enqueue(move |result| *slot.lock().unwrap() = Some(result.map(|_| ())))
            .unwrap();
        assert_eq!(second.state(), CallState::Executing);

        client.dispatcher().cancel_all();
        assert_eq!(*outcome.lock().unwrap(), Some(Err(ErrorKind::Cancelled)));
        assert_eq!(second.state(), CallState::Cancelled);
        assert_eq!(executor.tasks.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_rejected_call_fails_and_goes_idle() {
        let client = client();
        let dispatcher = Dispatcher::new(4, 4, Arc::new(RejectingExecutor)).unwrap();
        let idle = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&idle);
        dispatcher.set_idle_callback(Some(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })));

        let outcome = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&outcome);
        let rejected = call(&client, "http://a/1");
        dispatcher.enqueue(
            rejected.clone(),
            Box::new(move |result| *slot.lock().unwrap() = Some(result.map(|_| ()))),
        );

        assert_eq!(*outcome.lock().unwrap(), Some(Err(ErrorKind::NoRuntime)));
        assert_eq!(rejected.state(), CallState::Failed);
        assert_eq!(dispatcher.running_calls_count(), 0);
        assert_eq!(idle.load(Ordering::SeqCst), 1);
    }
}
