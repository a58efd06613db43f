//! File-based configuration of the engine.
//!
//! [`HttpdConfig`] mirrors the settings of [`HttpdBuilder`] that can be
//! written down, with durations in `humantime` notation:
//!
//! ```toml
//! call_timeout = "30s"
//! connect_timeout = "5s"
//! protocols = ["h2", "http/1.1"]
//! max_requests_per_host = 2
//! proxy = "http://proxy.internal:3128"
//! ```

use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::address::{ConnectionSpec, default_connection_specs, default_protocols};
use crate::auth::{Authenticator, BasicAuthenticator};
use crate::client::{DEFAULT_MAX_REDIRECTS, DEFAULT_TIMEOUT, DEFAULT_USER_AGENT};
use crate::dispatcher::{DEFAULT_MAX_REQUESTS, DEFAULT_MAX_REQUESTS_PER_HOST};
use crate::pool::{
    DEFAULT_HTTP2_MAX_CONCURRENT_STREAMS, DEFAULT_KEEP_ALIVE, DEFAULT_MAX_IDLE_CONNECTIONS,
};
use crate::proxy::Proxy;
use crate::{ErrorKind, HttpdBuilder, Protocol, Result};

/// Engine settings as read from a configuration file.
///
/// Missing keys take the engine defaults; unknown keys are rejected.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HttpdConfig {
    /// Bound of a whole call, `0s` for none
    #[serde(with = "humantime_serde")]
    pub call_timeout: Duration,
    /// Bound of each connection setup step
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Bound of waiting for response data
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,
    /// Bound of handing a request to a connection
    #[serde(with = "humantime_serde")]
    pub write_timeout: Duration,
    /// HTTP/2 ping interval, `0s` to disable
    #[serde(with = "humantime_serde")]
    pub ping_interval: Duration,
    /// Protocols to offer, by ALPN name
    pub protocols: Vec<Protocol>,
    /// Connection specs to try, in order
    pub connection_specs: Vec<ConnectionSpec>,
    /// Enqueued calls running at once
    pub max_requests: usize,
    /// Enqueued calls to one host running at once
    pub max_requests_per_host: usize,
    /// Idle connections kept
    pub max_idle_connections: usize,
    /// How long idle connections are kept
    #[serde(with = "humantime_serde")]
    pub keep_alive: Duration,
    /// Exchanges per HTTP/2 connection
    pub http2_max_concurrent_streams: usize,
    /// Retry routes and replay requests after connection failures
    pub retry_on_connection_failure: bool,
    /// Follow redirects
    pub follow_redirects: bool,
    /// Follow redirects between `http` and `https`
    pub follow_ssl_redirects: bool,
    /// Follow-up requests per call
    pub max_redirects: usize,
    /// Default `User-Agent`
    pub user_agent: String,
    /// HTTP proxy for every request, as `http://host:port`
    pub proxy: Option<String>,
    /// Basic credentials for `401` challenges, as `user:password`
    pub basic_auth: Option<String>,
    /// Basic credentials for `407` challenges, as `user:password`
    pub proxy_auth: Option<String>,
}

impl Default for HttpdConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::ZERO,
            connect_timeout: DEFAULT_TIMEOUT,
            read_timeout: DEFAULT_TIMEOUT,
            write_timeout: DEFAULT_TIMEOUT,
            ping_interval: Duration::ZERO,
            protocols: default_protocols(),
            connection_specs: default_connection_specs(),
            max_requests: DEFAULT_MAX_REQUESTS,
            max_requests_per_host: DEFAULT_MAX_REQUESTS_PER_HOST,
            max_idle_connections: DEFAULT_MAX_IDLE_CONNECTIONS,
            keep_alive: DEFAULT_KEEP_ALIVE,
            http2_max_concurrent_streams: DEFAULT_HTTP2_MAX_CONCURRENT_STREAMS,
            retry_on_connection_failure: true,
            follow_redirects: true,
            follow_ssl_redirects: true,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            proxy: None,
            basic_auth: None,
            proxy_auth: None,
        }
    }
}

impl HttpdConfig {
    /// Parse a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Config`] for malformed TOML, unknown keys and
    /// values of the wrong type.
    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| ErrorKind::Config(e.to_string()))
    }

    /// Read and parse a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Io`] if the file cannot be read, otherwise the
    /// errors of [`HttpdConfig::from_toml`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }
}

impl HttpdBuilder {
    /// A builder carrying the settings of `config`.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Config`] if the proxy URL or a credential
    /// string is malformed.
    pub fn from_config(config: &HttpdConfig) -> Result<Self> {
        let proxy = config.proxy.as_deref().map(Proxy::parse).transpose()?;
        let mut builder = Self::builder()
            .call_timeout(config.call_timeout)
            .connect_timeout(config.connect_timeout)
            .read_timeout(config.read_timeout)
            .write_timeout(config.write_timeout)
            .ping_interval(config.ping_interval)
            .protocols(config.protocols.clone())
            .connection_specs(config.connection_specs.clone())
            .max_requests(config.max_requests)
            .max_requests_per_host(config.max_requests_per_host)
            .max_idle_connections(config.max_idle_connections)
            .keep_alive(config.keep_alive)
            .http2_max_concurrent_streams(config.http2_max_concurrent_streams)
            .retry_on_connection_failure(config.retry_on_connection_failure)
            .follow_redirects(config.follow_redirects)
            .follow_ssl_redirects(config.follow_ssl_redirects)
            .max_redirects(config.max_redirects)
            .user_agent(config.user_agent.clone())
            .proxy(proxy)
            .build();
        builder.authenticator = credentials(config.basic_auth.as_deref())?;
        builder.proxy_authenticator = credentials(config.proxy_auth.as_deref())?;
        Ok(builder)
    }
}

fn credentials(value: Option<&str>) -> Result<Option<Arc<dyn Authenticator>>> {
    value
        .map(|v| BasicAuthenticator::from_str(v).map(|a| Arc::new(a) as Arc<dyn Authenticator>))
        .transpose()
}
