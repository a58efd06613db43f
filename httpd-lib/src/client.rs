//! The client engine.
//!
//! This module defines two structs, [`Httpd`] and [`HttpdBuilder`].
//! `Httpd` creates calls and owns the state they share: the dispatcher,
//! the connection pool and the interceptor chain. `HttpdBuilder` exposes
//! every knob of the engine.
#![allow(
    clippy::module_name_repetitions,
    clippy::struct_excessive_bools,
    clippy::default_trait_access
)]
use std::fmt::{self, Debug};
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use tokio::runtime::Handle;
use typed_builder::TypedBuilder;
use url::Url;

use crate::address::{Address, ConnectionSpec, default_connection_specs, default_protocols};
use crate::auth::Authenticator;
use crate::cache::ResponseCache;
use crate::call::Call;
use crate::chain::Interceptor;
use crate::connection::Timeouts;
use crate::dispatcher::{
    DEFAULT_MAX_REQUESTS, DEFAULT_MAX_REQUESTS_PER_HOST, Dispatcher, Executor, TokioExecutor,
};
use crate::dns::{GaiResolver, Resolve};
use crate::interceptor;
use crate::pool::{
    ConnectionPool, DEFAULT_HTTP2_MAX_CONCURRENT_STREAMS, DEFAULT_KEEP_ALIVE,
    DEFAULT_MAX_IDLE_CONNECTIONS,
};
use crate::proxy::{NoProxySelector, Proxy, ProxySelector};
use crate::tls::{DefaultHostnameVerifier, HostnameVerifier, TlsConnect};
use crate::{ErrorKind, Protocol, Request, Result};

/// Default number of follow-up requests before a call fails, 20.
pub const DEFAULT_MAX_REDIRECTS: usize = 20;
/// Default connect, read and write timeout, 10 seconds.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
/// Default user agent, `httpd/<PKG_VERSION>`.
pub const DEFAULT_USER_AGENT: &str = concat!("httpd/", env!("CARGO_PKG_VERSION"));

/// Builder for [`Httpd`].
///
/// Timeouts of zero mean "no timeout".
///
/// ```
/// use std::time::Duration;
/// use httpd_lib::HttpdBuilder;
///
/// let client = HttpdBuilder::builder()
///     .call_timeout(Duration::from_secs(30))
///     .max_requests_per_host(2usize)
///     .build()
///     .client()
///     .unwrap();
/// assert_eq!(client.dispatcher().max_requests_per_host(), 2);
/// ```
#[derive(TypedBuilder, Clone)]
#[builder(field_defaults(default))]
#[builder(builder_method(doc = "
Create a builder for building `HttpdBuilder`.

On the builder call, call methods with same name as its fields to set their values.

Finally, call `.build()` to create the instance of `HttpdBuilder`.
"))]
pub struct HttpdBuilder {
    /// Bound of a whole call, including retries and follow-ups.
    call_timeout: Duration,
    /// Bound of socket connect, tunnel setup, TLS handshake and HTTP
    /// handshake, each.
    #[builder(default = DEFAULT_TIMEOUT)]
    connect_timeout: Duration,
    /// Bound of waiting for a response head, and then for its body.
    #[builder(default = DEFAULT_TIMEOUT)]
    read_timeout: Duration,
    /// Bound of waiting for a connection to accept a request.
    #[builder(default = DEFAULT_TIMEOUT)]
    write_timeout: Duration,
    /// HTTP/2 keep-alive ping interval. Zero disables pings.
    ping_interval: Duration,

    /// Protocols to offer, in order of preference.
    ///
    /// Must contain [`Protocol::Http11`] unless it is exactly
    /// `[Protocol::H2PriorKnowledge]`. [`Protocol::Http10`] is never valid.
    #[builder(default = default_protocols())]
    protocols: Vec<Protocol>,
    /// Connection specs to try, in order.
    #[builder(default = default_connection_specs())]
    connection_specs: Vec<ConnectionSpec>,

    /// Maximum number of enqueued calls running at once.
    #[builder(default = DEFAULT_MAX_REQUESTS)]
    max_requests: usize,
    /// Maximum number of enqueued calls to one host running at once.
    #[builder(default = DEFAULT_MAX_REQUESTS_PER_HOST)]
    max_requests_per_host: usize,

    /// Idle connections kept per pool.
    #[builder(default = DEFAULT_MAX_IDLE_CONNECTIONS)]
    max_idle_connections: usize,
    /// How long an idle connection is kept.
    #[builder(default = DEFAULT_KEEP_ALIVE)]
    keep_alive: Duration,
    /// Exchanges an HTTP/2 connection carries at once.
    #[builder(default = DEFAULT_HTTP2_MAX_CONCURRENT_STREAMS)]
    http2_max_concurrent_streams: usize,

    /// Try other routes after a connect failure and replay requests after
    /// recoverable connection failures.
    #[builder(default = true)]
    retry_on_connection_failure: bool,
    /// Follow 3xx responses with a `Location`.
    #[builder(default = true)]
    follow_redirects: bool,
    /// Follow redirects between `http` and `https`.
    #[builder(default = true)]
    follow_ssl_redirects: bool,
    /// Follow-up requests allowed per call.
    #[builder(default = DEFAULT_MAX_REDIRECTS)]
    max_redirects: usize,
    /// `User-Agent` sent when a request does not set one.
    #[builder(default = DEFAULT_USER_AGENT.to_string(), setter(into))]
    user_agent: String,

    /// Interceptors that see every call once, in order.
    interceptors: Vec<Arc<dyn Interceptor>>,
    /// Interceptors that see every network exchange, in order.
    network_interceptors: Vec<Arc<dyn Interceptor>>,

    /// Proxy used for every request, overriding `proxy_selector`.
    #[builder(setter(into))]
    proxy: Option<Proxy>,
    /// Chooses proxies per URL. Defaults to direct connections.
    #[builder(setter(strip_option))]
    proxy_selector: Option<Arc<dyn ProxySelector>>,
    /// Resolves host names. Defaults to the system resolver.
    #[builder(setter(strip_option))]
    resolver: Option<Arc<dyn Resolve>>,
    /// Sets up TLS sessions. Defaults to rustls with the `rustls-tls`
    /// feature.
    #[builder(setter(strip_option))]
    tls: Option<Arc<dyn TlsConnect>>,
    /// Checks TLS peer certificates.
    #[builder(setter(strip_option))]
    hostname_verifier: Option<Arc<dyn HostnameVerifier>>,
    /// Answers `401` challenges.
    #[builder(setter(strip_option))]
    pub(crate) authenticator: Option<Arc<dyn Authenticator>>,
    /// Answers `407` challenges, including while opening tunnels.
    #[builder(setter(strip_option))]
    pub(crate) proxy_authenticator: Option<Arc<dyn Authenticator>>,
    /// Serves and stores responses.
    #[builder(setter(strip_option))]
    cache: Option<Arc<dyn ResponseCache>>,

    /// Runtime for enqueued and blocking calls. Defaults to the runtime the
    /// call is started from.
    #[builder(setter(into))]
    runtime: Option<Handle>,
    /// Runs enqueued calls. Defaults to spawning on `runtime`.
    #[builder(setter(strip_option))]
    executor: Option<Arc<dyn Executor>>,
    /// Share a dispatcher with another client. Overrides `max_requests`,
    /// `max_requests_per_host` and `executor`.
    #[builder(setter(strip_option))]
    dispatcher: Option<Dispatcher>,
    /// Share a pool with another client. Overrides the pool settings.
    #[builder(setter(strip_option))]
    connection_pool: Option<ConnectionPool>,
}

impl Default for HttpdBuilder {
    #[must_use]
    #[inline]
    fn default() -> Self {
        Self::builder().build()
    }
}

impl HttpdBuilder {
    /// Instantiates an [`Httpd`].
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Config`] if:
    /// - The protocol list is empty, contains `http/1.0`, lacks `http/1.1`,
    ///   or mixes `h2_prior_knowledge` with other protocols.
    /// - No connection spec is given.
    /// - A dispatcher cap or the HTTP/2 stream limit is zero.
    pub fn client(self) -> Result<Httpd> {
        validate_protocols(&self.protocols)?;
        if self.connection_specs.is_empty() {
            return Err(ErrorKind::Config(
                "at least one connection spec is required".into(),
            ));
        }
        if self.http2_max_concurrent_streams == 0 {
            return Err(ErrorKind::Config(
                "http2_max_concurrent_streams must be at least 1".into(),
            ));
        }

        let dispatcher = match self.dispatcher {
            Some(dispatcher) => dispatcher,
            None => {
                let executor = self.executor.unwrap_or_else(|| match &self.runtime {
                    Some(handle) => {
                        Arc::new(TokioExecutor::with_handle(handle.clone())) as Arc<dyn Executor>
                    }
                    None => Arc::new(TokioExecutor::new()),
                });
                Dispatcher::new(self.max_requests, self.max_requests_per_host, executor)?
            }
        };
        let pool = self.connection_pool.unwrap_or_else(|| {
            ConnectionPool::new(
                self.max_idle_connections,
                self.keep_alive,
                self.http2_max_concurrent_streams,
            )
        });

        let stages = interceptor::stages(&self.interceptors, &self.network_interceptors);
        let client = Httpd {
            inner: Arc::new(HttpdInner {
                call_timeout: self.call_timeout,
                timeouts: Timeouts {
                    connect: self.connect_timeout,
                    read: self.read_timeout,
                    write: self.write_timeout,
                    ping: self.ping_interval,
                },
                protocols: self.protocols,
                connection_specs: self.connection_specs,
                retry_on_connection_failure: self.retry_on_connection_failure,
                follow_redirects: self.follow_redirects,
                follow_ssl_redirects: self.follow_ssl_redirects,
                max_redirects: self.max_redirects,
                user_agent: self.user_agent,
                interceptors: self.interceptors,
                network_interceptors: self.network_interceptors,
                stages,
                proxy: self.proxy,
                proxy_selector: self
                    .proxy_selector
                    .unwrap_or_else(|| Arc::new(NoProxySelector) as Arc<dyn ProxySelector>),
                resolver: self
                    .resolver
                    .unwrap_or_else(|| Arc::new(GaiResolver) as Arc<dyn Resolve>),
                tls: self.tls.or_else(default_tls),
                hostname_verifier: self
                    .hostname_verifier
                    .unwrap_or_else(|| Arc::new(DefaultHostnameVerifier) as Arc<dyn HostnameVerifier>),
                authenticator: self.authenticator,
                proxy_authenticator: self.proxy_authenticator,
                cache: self.cache,
                runtime: self.runtime,
                dispatcher,
                pool,
            }),
        };
        debug!("Created {client:?}");
        Ok(client)
    }
}

#[cfg(feature = "rustls-tls")]
fn default_tls() -> Option<Arc<dyn TlsConnect>> {
    Some(Arc::new(crate::tls::RustlsConnector::new()))
}

#[cfg(not(feature = "rustls-tls"))]
fn default_tls() -> Option<Arc<dyn TlsConnect>> {
    None
}

fn validate_protocols(protocols: &[Protocol]) -> Result<()> {
    if protocols.contains(&Protocol::Http10) {
        return Err(ErrorKind::Config("http/1.0 is not a valid protocol".into()));
    }
    if protocols.contains(&Protocol::H2PriorKnowledge) {
        if protocols.len() > 1 {
            return Err(ErrorKind::Config(
                "h2_prior_knowledge cannot be combined with other protocols".into(),
            ));
        }
        return Ok(());
    }
    if !protocols.contains(&Protocol::Http11) {
        return Err(ErrorKind::Config(
            "protocols must contain http/1.1 or h2_prior_knowledge".into(),
        ));
    }
    Ok(())
}

/// The client engine: a factory for [`Call`]s sharing one dispatcher, one
/// connection pool and one interceptor chain.
///
/// Cloning is cheap and clones share all state.
#[derive(Clone)]
pub struct Httpd {
    inner: Arc<HttpdInner>,
}

struct HttpdInner {
    call_timeout: Duration,
    timeouts: Timeouts,
    protocols: Vec<Protocol>,
    connection_specs: Vec<ConnectionSpec>,
    retry_on_connection_failure: bool,
    follow_redirects: bool,
    follow_ssl_redirects: bool,
    max_redirects: usize,
    user_agent: String,
    interceptors: Vec<Arc<dyn Interceptor>>,
    network_interceptors: Vec<Arc<dyn Interceptor>>,
    stages: Vec<Arc<dyn Interceptor>>,
    proxy: Option<Proxy>,
    proxy_selector: Arc<dyn ProxySelector>,
    resolver: Arc<dyn Resolve>,
    tls: Option<Arc<dyn TlsConnect>>,
    hostname_verifier: Arc<dyn HostnameVerifier>,
    authenticator: Option<Arc<dyn Authenticator>>,
    proxy_authenticator: Option<Arc<dyn Authenticator>>,
    cache: Option<Arc<dyn ResponseCache>>,
    runtime: Option<Handle>,
    dispatcher: Dispatcher,
    pool: ConnectionPool,
}

impl Default for Httpd {
    /// A client with default settings.
    ///
    /// # Panics
    ///
    /// Never: the default settings are valid.
    fn default() -> Self {
        HttpdBuilder::default()
            .client()
            .unwrap_or_else(|e| unreachable!("default client configuration is valid: {e}"))
    }
}

impl Httpd {
    /// Prepare `request` to be executed.
    #[must_use]
    pub fn new_call(&self, request: Request) -> Call {
        Call::new(self.clone(), request)
    }

    /// The address a request to `url` connects to.
    ///
    /// # Errors
    ///
    /// Fails for URLs that are not `http` or `https`, or have no host.
    pub fn address(&self, url: &Url) -> Result<Address> {
        let inner = &self.inner;
        let (https, host, port) = Address::origin(url)?;
        Ok(Address::builder()
            .https(https)
            .host(host)
            .port(port)
            .proxy(inner.proxy.clone())
            .proxy_selector(Arc::clone(&inner.proxy_selector))
            .resolver(Arc::clone(&inner.resolver))
            .tls(if https { inner.tls.clone() } else { None })
            .hostname_verifier(Arc::clone(&inner.hostname_verifier))
            .connection_specs(inner.connection_specs.clone())
            .protocols(inner.protocols.clone())
            .build())
    }

    /// The dispatcher scheduling enqueued calls
    #[must_use]
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    /// The connection pool
    #[must_use]
    pub fn connection_pool(&self) -> &ConnectionPool {
        &self.inner.pool
    }

    /// Bound of a whole call, zero if unbounded
    #[must_use]
    pub fn call_timeout(&self) -> Duration {
        self.inner.call_timeout
    }

    /// Bound of each connection setup step
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        self.inner.timeouts.connect
    }

    /// Bound of waiting for response data
    #[must_use]
    pub fn read_timeout(&self) -> Duration {
        self.inner.timeouts.read
    }

    /// Bound of handing a request to a connection
    #[must_use]
    pub fn write_timeout(&self) -> Duration {
        self.inner.timeouts.write
    }

    /// HTTP/2 ping interval, zero if disabled
    #[must_use]
    pub fn ping_interval(&self) -> Duration {
        self.inner.timeouts.ping
    }

    pub(crate) fn timeouts(&self) -> Timeouts {
        self.inner.timeouts
    }

    /// Protocols offered to servers
    #[must_use]
    pub fn protocols(&self) -> &[Protocol] {
        &self.inner.protocols
    }

    /// Connection specs tried in order
    #[must_use]
    pub fn connection_specs(&self) -> &[ConnectionSpec] {
        &self.inner.connection_specs
    }

    /// Whether connection failures are retried
    #[must_use]
    pub fn retry_on_connection_failure(&self) -> bool {
        self.inner.retry_on_connection_failure
    }

    /// Whether redirects are followed
    #[must_use]
    pub fn follow_redirects(&self) -> bool {
        self.inner.follow_redirects
    }

    /// Whether redirects between `http` and `https` are followed
    #[must_use]
    pub fn follow_ssl_redirects(&self) -> bool {
        self.inner.follow_ssl_redirects
    }

    /// Follow-up requests allowed per call
    #[must_use]
    pub fn max_redirects(&self) -> usize {
        self.inner.max_redirects
    }

    /// The default `User-Agent`
    #[must_use]
    pub fn user_agent(&self) -> &str {
        &self.inner.user_agent
    }

    /// The application interceptors
    #[must_use]
    pub fn interceptors(&self) -> &[Arc<dyn Interceptor>] {
        &self.inner.interceptors
    }

    /// The network interceptors
    #[must_use]
    pub fn network_interceptors(&self) -> &[Arc<dyn Interceptor>] {
        &self.inner.network_interceptors
    }

    /// The origin authenticator
    #[must_use]
    pub fn authenticator(&self) -> Option<&dyn Authenticator> {
        self.inner.authenticator.as_deref()
    }

    /// The proxy authenticator
    #[must_use]
    pub fn proxy_authenticator(&self) -> Option<&dyn Authenticator> {
        self.inner.proxy_authenticator.as_deref()
    }

    /// The response cache
    #[must_use]
    pub fn cache(&self) -> Option<&dyn ResponseCache> {
        self.inner.cache.as_deref()
    }

    /// The runtime configured for enqueued and blocking calls
    #[must_use]
    pub fn runtime(&self) -> Option<&Handle> {
        self.inner.runtime.as_ref()
    }

    /// Every stage of the pipeline, in order
    pub(crate) fn chain(&self) -> &[Arc<dyn Interceptor>] {
        &self.inner.stages
    }
}

impl Debug for Httpd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = &self.inner;
        f.debug_struct("Httpd")
            .field("call_timeout", &inner.call_timeout)
            .field("timeouts", &inner.timeouts)
            .field("protocols", &inner.protocols)
            .field("connection_specs", &inner.connection_specs)
            .field("proxy", &inner.proxy)
            .field("interceptors", &inner.interceptors.len())
            .field("network_interceptors", &inner.network_interceptors.len())
            .field("dispatcher", &inner.dispatcher)
            .finish_non_exhaustive()
    }
}

impl Debug for HttpdBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpdBuilder")
            .field("call_timeout", &self.call_timeout)
            .field("connect_timeout", &self.connect_timeout)
            .field("read_timeout", &self.read_timeout)
            .field("write_timeout", &self.write_timeout)
            .field("protocols", &self.protocols)
            .field("max_requests", &self.max_requests)
            .field("max_requests_per_host", &self.max_requests_per_host)
            .finish_non_exhaustive()
    }
}
