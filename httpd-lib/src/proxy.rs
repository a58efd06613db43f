use std::fmt::{self, Debug, Display};

use url::Url;

use crate::{ErrorKind, Result};

/// The hop a connection goes through before reaching the origin server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub enum Proxy {
    /// Connect to the origin server directly
    #[default]
    Direct,
    /// Go through an HTTP proxy. Cleartext requests are forwarded in
    /// absolute form, TLS requests are tunneled with `CONNECT`.
    Http {
        /// Proxy hostname or IP literal
        host: String,
        /// Proxy port
        port: u16,
    },
}

impl Proxy {
    /// An HTTP proxy at `host:port`
    #[must_use]
    pub fn http(host: impl Into<String>, port: u16) -> Self {
        Self::Http {
            host: host.into(),
            port,
        }
    }

    /// Parse a proxy URL such as `http://proxy.local:3128`.
    ///
    /// # Errors
    ///
    /// Fails if the URL is invalid, has no host, or uses another scheme
    /// than `http`.
    pub fn parse(url: &str) -> Result<Self> {
        let url = Url::parse(url)?;
        if url.scheme() != "http" {
            return Err(ErrorKind::UnsupportedScheme(url.scheme().to_string()));
        }
        let host = url.host_str().ok_or(ErrorKind::InvalidUrlHost)?;
        let port = url.port_or_known_default().unwrap_or(80);
        Ok(Self::http(host, port))
    }

    /// Whether this is the direct, proxy-less hop
    #[must_use]
    pub const fn is_direct(&self) -> bool {
        matches!(self, Self::Direct)
    }
}

impl Display for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct => write!(f, "DIRECT"),
            Self::Http { host, port } => write!(f, "http://{host}:{port}"),
        }
    }
}

/// Chooses the proxies to try, in order, for a URL.
pub trait ProxySelector: Send + Sync + Debug {
    /// Proxies to try for `url`. An empty list means a direct connection.
    fn select(&self, url: &Url) -> Vec<Proxy>;

    /// Told when connecting through `proxy` failed.
    fn connect_failed(&self, _url: &Url, _proxy: &Proxy, _error: &ErrorKind) {}
}

/// Always connects directly.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProxySelector;

impl ProxySelector for NoProxySelector {
    fn select(&self, _url: &Url) -> Vec<Proxy> {
        vec![Proxy::Direct]
    }
}
