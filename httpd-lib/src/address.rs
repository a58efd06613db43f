//! Connection targets and the reuse key of the pool.

use std::fmt::{self, Debug, Display};
use std::net::IpAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display as StrumDisplay, EnumString};
use typed_builder::TypedBuilder;
use url::{Host, Url};

use crate::dns::{GaiResolver, Resolve};
use crate::proxy::{NoProxySelector, Proxy, ProxySelector};
use crate::tls::{DefaultHostnameVerifier, HostnameVerifier, TlsConnect};
use crate::{ErrorKind, Protocol, Result};

/// A TLS protocol version
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, StrumDisplay, EnumString, AsRefStr, Serialize, Deserialize,
)]
pub enum TlsVersion {
    /// TLS 1.2
    #[strum(serialize = "TLSv1.2")]
    #[serde(rename = "TLSv1.2")]
    Tls12,
    /// TLS 1.3
    #[strum(serialize = "TLSv1.3")]
    #[serde(rename = "TLSv1.3")]
    Tls13,
}

/// How a socket is set up before HTTP runs on it.
///
/// `https` addresses use the TLS specs of the client's list, in order;
/// `http` addresses use [`ConnectionSpec::Cleartext`]. A spec that allows
/// fallback lets the next TLS spec be tried when its handshake fails.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    StrumDisplay,
    EnumString,
    AsRefStr,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ConnectionSpec {
    /// TLS 1.3 only
    RestrictedTls,
    /// TLS 1.3 or 1.2
    ModernTls,
    /// Unencrypted, for `http` URLs
    Cleartext,
}

impl ConnectionSpec {
    /// Whether this spec sets up TLS
    #[must_use]
    pub const fn is_tls(self) -> bool {
        !matches!(self, Self::Cleartext)
    }

    /// TLS versions offered in the handshake, newest first
    #[must_use]
    pub const fn tls_versions(self) -> &'static [TlsVersion] {
        match self {
            Self::RestrictedTls => &[TlsVersion::Tls13],
            Self::ModernTls => &[TlsVersion::Tls13, TlsVersion::Tls12],
            Self::Cleartext => &[],
        }
    }

    /// Whether a failed handshake may be retried with the next TLS spec
    #[must_use]
    pub const fn allows_fallback(self) -> bool {
        matches!(self, Self::RestrictedTls)
    }

    /// Whether this spec can carry a request with the given scheme
    #[must_use]
    pub fn supports(self, https: bool) -> bool {
        self.is_tls() == https
    }
}

/// Default connection specs: modern TLS for `https`, cleartext for `http`
#[must_use]
pub fn default_connection_specs() -> Vec<ConnectionSpec> {
    vec![ConnectionSpec::ModernTls, ConnectionSpec::Cleartext]
}

/// Default protocol preference: HTTP/2, then HTTP/1.1
#[must_use]
pub fn default_protocols() -> Vec<Protocol> {
    vec![Protocol::Http2, Protocol::Http11]
}

/// Everything needed to open a connection to an origin server.
///
/// Two addresses are equal when every field matches; collaborators compare
/// by identity. Equal addresses may share pooled connections.
#[derive(Clone, TypedBuilder)]
pub struct Address {
    /// `true` for `https`
    #[builder(default)]
    https: bool,
    /// Hostname or IP literal, without brackets
    #[builder(setter(into))]
    host: String,
    /// Port of the origin server
    port: u16,
    /// Proxy to use regardless of the selector
    #[builder(default)]
    proxy: Option<Proxy>,
    /// Consulted when `proxy` is not set
    #[builder(default = Arc::new(NoProxySelector) as Arc<dyn ProxySelector>)]
    proxy_selector: Arc<dyn ProxySelector>,
    /// Name resolver for the origin and proxy hosts
    #[builder(default = Arc::new(GaiResolver) as Arc<dyn Resolve>)]
    resolver: Arc<dyn Resolve>,
    /// TLS provider, required for `https`
    #[builder(default)]
    tls: Option<Arc<dyn TlsConnect>>,
    /// Checks the peer certificates of TLS sessions
    #[builder(default = Arc::new(DefaultHostnameVerifier) as Arc<dyn HostnameVerifier>)]
    hostname_verifier: Arc<dyn HostnameVerifier>,
    /// Connection specs to try, in order
    #[builder(default = default_connection_specs())]
    connection_specs: Vec<ConnectionSpec>,
    /// Protocols to offer, in order of preference
    #[builder(default = default_protocols())]
    protocols: Vec<Protocol>,
}

impl Address {
    /// Split `url` into `(https, host, port)`.
    ///
    /// # Errors
    ///
    /// Fails for schemes other than `http` and `https` and for URLs without
    /// a host.
    pub(crate) fn origin(url: &Url) -> Result<(bool, String, u16)> {
        let https = match url.scheme() {
            "https" => true,
            "http" => false,
            other => return Err(ErrorKind::UnsupportedScheme(other.to_string())),
        };
        let host = match url.host() {
            Some(Host::Domain(domain)) => domain.to_ascii_lowercase(),
            Some(Host::Ipv4(ip)) => ip.to_string(),
            Some(Host::Ipv6(ip)) => ip.to_string(),
            None => return Err(ErrorKind::InvalidUrlHost),
        };
        let port = url
            .port_or_known_default()
            .unwrap_or(if https { 443 } else { 80 });
        Ok((https, host, port))
    }

    /// Whether connections use TLS
    #[must_use]
    pub const fn is_https(&self) -> bool {
        self.https
    }

    /// The origin hostname
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The origin port
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// The explicit proxy, if any
    #[must_use]
    pub const fn proxy(&self) -> Option<&Proxy> {
        self.proxy.as_ref()
    }

    /// The proxy selector consulted when no explicit proxy is set
    #[must_use]
    pub fn proxy_selector(&self) -> &dyn ProxySelector {
        self.proxy_selector.as_ref()
    }

    /// The name resolver
    #[must_use]
    pub fn resolver(&self) -> &dyn Resolve {
        self.resolver.as_ref()
    }

    /// The TLS provider
    #[must_use]
    pub fn tls(&self) -> Option<&dyn TlsConnect> {
        self.tls.as_deref()
    }

    /// The hostname verifier
    #[must_use]
    pub fn hostname_verifier(&self) -> &dyn HostnameVerifier {
        self.hostname_verifier.as_ref()
    }

    /// Connection specs applicable to this address' scheme, in order
    pub fn applicable_specs(&self) -> impl Iterator<Item = ConnectionSpec> + '_ {
        self.connection_specs
            .iter()
            .copied()
            .filter(|spec| spec.supports(self.https))
    }

    /// Protocols offered to the server
    #[must_use]
    pub fn protocols(&self) -> &[Protocol] {
        &self.protocols
    }

    /// Whether the host is an IP literal and needs no resolution
    #[must_use]
    pub fn host_ip(&self) -> Option<IpAddr> {
        self.host.parse().ok()
    }

    /// `host:port`, bracketing IPv6 literals
    #[must_use]
    pub fn authority(&self) -> String {
        match self.host_ip() {
            Some(IpAddr::V6(ip)) => format!("[{ip}]:{}", self.port),
            _ => format!("{}:{}", self.host, self.port),
        }
    }

    /// The root URL of the origin, as handed to the proxy selector
    #[must_use]
    pub fn url(&self) -> Url {
        let scheme = if self.https { "https" } else { "http" };
        // Host and port were taken from a parsed URL
        Url::parse(&format!("{scheme}://{}/", self.authority()))
            .unwrap_or_else(|_| unreachable!("address authority is always valid"))
    }
}

fn same<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.https == other.https
            && self.host == other.host
            && self.port == other.port
            && self.proxy == other.proxy
            && same(&self.proxy_selector, &other.proxy_selector)
            && same(&self.resolver, &other.resolver)
            && match (&self.tls, &other.tls) {
                (Some(a), Some(b)) => same(a, b),
                (None, None) => true,
                _ => false,
            }
            && same(&self.hostname_verifier, &other.hostname_verifier)
            && self.connection_specs == other.connection_specs
            && self.protocols == other.protocols
    }
}

impl Eq for Address {}

impl Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Address")
            .field("https", &self.https)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("proxy", &self.proxy)
            .field("connection_specs", &self.connection_specs)
            .field("protocols", &self.protocols)
            .finish_non_exhaustive()
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.https { "https" } else { "http" };
        write!(f, "{scheme}://{}", self.authority())
    }
}
