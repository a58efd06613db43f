//! Live transports.
//!
//! A [`Connection`] is a socket, optionally wrapped in TLS and optionally
//! tunneled through a proxy, with an HTTP/1.1 or HTTP/2 codec running on
//! it. The codec's I/O is driven by a background task; when that task ends
//! the connection is closed for good.

use std::fmt::{self, Debug};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use http::header::{HOST, PROXY_AUTHORIZATION, USER_AGENT};
use http::{Method, StatusCode};
use http_body_util::{BodyExt, Empty, Full};
use hyper::client::conn::{http1, http2};
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use log::{debug, trace};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::AbortHandle;

use crate::address::{Address, TlsVersion};
use crate::auth::Authenticator;
use crate::route::Route;
use crate::timeout::Timeout;
use crate::tls::BoxedIo;
use crate::{ErrorKind, Protocol, Request, Response, Result};

/// Attempts at answering a proxy's authentication challenge for one tunnel
const MAX_TUNNEL_ATTEMPTS: usize = 21;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Per-operation bounds of socket work. Zero means unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Timeouts {
    pub(crate) connect: Duration,
    pub(crate) read: Duration,
    pub(crate) write: Duration,
    pub(crate) ping: Duration,
}

enum Codec {
    /// One exchange at a time; the lock serializes them
    Http1(Mutex<http1::SendRequest<Full<Bytes>>>),
    Http2(http2::SendRequest<Full<Bytes>>),
}

/// A live transport to an origin server.
pub struct Connection {
    id: u64,
    address: Address,
    route: Route,
    protocol: Protocol,
    tls_version: Option<TlsVersion>,
    peer_certificates: Vec<Vec<u8>>,
    codec: Codec,
    closed: Arc<AtomicBool>,
    driver: AbortHandle,
}

impl Connection {
    /// Open a connection to `address` over `route`.
    ///
    /// Socket connect, tunnel setup, TLS and the HTTP handshake each run
    /// under the connect timeout; everything is bounded by `guard`'s
    /// deadline.
    pub(crate) async fn connect(
        address: &Address,
        route: &Route,
        timeouts: &Timeouts,
        proxy_authenticator: Option<&dyn Authenticator>,
        guard: &Timeout,
    ) -> Result<Self> {
        let connect_guard = guard.child(timeouts.connect);
        trace!("Connecting to {address} over {route}");

        let tcp = connect_guard
            .run(async { Ok(TcpStream::connect(route.socket_addr()).await?) })
            .await?;
        tcp.set_nodelay(true)?;
        let mut io: BoxedIo = Box::new(tcp);

        if route.requires_tunnel() {
            io = tunnel(io, address, route, timeouts, proxy_authenticator, guard).await?;
        }

        let (io, protocol, tls_version, peer_certificates) = if address.is_https() {
            let tls = address
                .tls()
                .ok_or_else(|| ErrorKind::Tls("no TLS provider configured".into()))?;
            let alpn: Vec<Protocol> = address
                .protocols()
                .iter()
                .copied()
                .filter(|protocol| protocol.alpn_id().is_some())
                .collect();
            let session = connect_guard
                .run(tls.connect(io, address.host(), route.spec(), &alpn))
                .await?;
            if !address
                .hostname_verifier()
                .verify(address.host(), &session.peer_certificates)
            {
                return Err(ErrorKind::PeerUnverified(address.host().to_string()));
            }
            let protocol = match session.protocol {
                Some(Protocol::Http2) => Protocol::Http2,
                _ => Protocol::Http11,
            };
            (session.io, protocol, session.version, session.peer_certificates)
        } else if address.protocols().contains(&Protocol::H2PriorKnowledge) {
            (io, Protocol::H2PriorKnowledge, None, Vec::new())
        } else {
            (io, Protocol::Http11, None, Vec::new())
        };

        let closed = Arc::new(AtomicBool::new(false));
        let (codec, driver) = connect_guard
            .run(handshake(io, protocol, timeouts.ping, Arc::clone(&closed)))
            .await?;

        let connection = Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            address: address.clone(),
            route: route.clone(),
            protocol,
            tls_version,
            peer_certificates,
            codec,
            closed,
            driver,
        };
        debug!("Connected {connection:?}");
        Ok(connection)
    }

    /// Identifies this connection within the process
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// The address this connection serves
    #[must_use]
    pub const fn address(&self) -> &Address {
        &self.address
    }

    /// The route the socket took
    #[must_use]
    pub const fn route(&self) -> &Route {
        &self.route
    }

    /// The negotiated protocol
    #[must_use]
    pub const fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// The negotiated TLS version, `None` for cleartext
    #[must_use]
    pub const fn tls_version(&self) -> Option<TlsVersion> {
        self.tls_version
    }

    /// DER-encoded certificates the server presented
    #[must_use]
    pub fn peer_certificates(&self) -> &[Vec<u8>] {
        &self.peer_certificates
    }

    /// Whether the connection can carry new exchanges.
    ///
    /// An HTTP/1.1 connection busy with an exchange counts as healthy.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        if self.is_closed() {
            return false;
        }
        match &self.codec {
            Codec::Http1(sender) => sender.try_lock().map_or(true, |s| !s.is_closed()),
            Codec::Http2(sender) => !sender.is_closed(),
        }
    }

    /// Whether the connection was closed, by either side
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close the socket. In-flight exchanges fail.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            trace!("Closing connection {}", self.id);
        }
        self.driver.abort();
    }

    /// Send `request` and read the whole response.
    ///
    /// Waiting for the codec to accept the request is bounded by the write
    /// timeout; waiting for the response head and then its body by the read
    /// timeout, each.
    pub(crate) async fn exchange(
        &self,
        request: http::Request<Full<Bytes>>,
        timeouts: &Timeouts,
        guard: &Timeout,
    ) -> Result<(http::response::Parts, Bytes)> {
        let write_guard = guard.child(timeouts.write);
        let read_guard = guard.child(timeouts.read);

        let response = match &self.codec {
            Codec::Http1(sender) => {
                let mut sender = sender.lock().await;
                write_guard.run(async { Ok(sender.ready().await?) }).await?;
                read_guard
                    .run(async { Ok(sender.send_request(request).await?) })
                    .await?
            }
            Codec::Http2(sender) => {
                let mut sender = sender.clone();
                write_guard.run(async { Ok(sender.ready().await?) }).await?;
                read_guard
                    .run(async { Ok(sender.send_request(request).await?) })
                    .await?
            }
        };

        let (parts, body) = response.into_parts();
        let body = read_guard
            .run(async { Ok(body.collect().await?.to_bytes()) })
            .await?;
        Ok((parts, body))
    }

    /// A connection over an in-memory pipe, for tests. The returned server
    /// half must be kept alive for the connection to stay open.
    #[cfg(test)]
    pub(crate) async fn in_memory(
        address: Address,
        protocol: Protocol,
    ) -> (Self, tokio::io::DuplexStream) {
        use crate::address::ConnectionSpec;
        use crate::proxy::Proxy;

        let (client, server) = tokio::io::duplex(64 * 1024);
        let closed = Arc::new(AtomicBool::new(false));
        let (codec, driver) = handshake(
            Box::new(client),
            protocol,
            Duration::ZERO,
            Arc::clone(&closed),
        )
        .await
        .unwrap();
        let route = Route::new(
            Proxy::Direct,
            "127.0.0.1:80".parse().unwrap(),
            ConnectionSpec::Cleartext,
        );
        let connection = Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            address,
            route,
            protocol,
            tls_version: None,
            peer_certificates: Vec::new(),
            codec,
            closed,
            driver,
        };
        (connection, server)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

impl Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("address", &self.address.to_string())
            .field("route", &self.route.to_string())
            .field("protocol", &self.protocol)
            .field("tls_version", &self.tls_version)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Run the HTTP handshake for `protocol` on `io` and spawn the task that
/// drives the connection. The task flags `closed` when it ends.
async fn handshake(
    io: BoxedIo,
    protocol: Protocol,
    ping: Duration,
    closed: Arc<AtomicBool>,
) -> Result<(Codec, AbortHandle)> {
    let io = TokioIo::new(io);
    if protocol.is_multiplexed() {
        let mut builder = http2::Builder::new(TokioExecutor::new());
        builder.timer(TokioTimer::new());
        if !ping.is_zero() {
            builder.keep_alive_interval(ping).keep_alive_while_idle(true);
        }
        let (sender, connection) = builder.handshake(io).await?;
        trace!("HTTP/2 handshake complete");
        Ok((Codec::Http2(sender), spawn_driver(connection, closed)))
    } else {
        let (sender, connection) = http1::handshake(io).await?;
        trace!("HTTP/1.1 handshake complete");
        Ok((
            Codec::Http1(Mutex::new(sender)),
            spawn_driver(connection, closed),
        ))
    }
}

fn spawn_driver<F>(connection: F, closed: Arc<AtomicBool>) -> AbortHandle
where
    F: Future<Output = hyper::Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            debug!("Connection ended with error: {e}");
        }
        closed.store(true, Ordering::Release);
    })
    .abort_handle()
}

/// Open a `CONNECT` tunnel to `address` through the proxy at the end of
/// `io`, answering authentication challenges with `authenticator`.
async fn tunnel(
    io: BoxedIo,
    address: &Address,
    route: &Route,
    timeouts: &Timeouts,
    authenticator: Option<&dyn Authenticator>,
    guard: &Timeout,
) -> Result<BoxedIo> {
    let (mut sender, connection) = http1::handshake::<_, Empty<Bytes>>(TokioIo::new(io)).await?;
    let driver = tokio::spawn(async move {
        if let Err(e) = connection.with_upgrades().await {
            debug!("Proxy tunnel connection ended with error: {e}");
        }
    });

    let authority = address.authority();
    let mut tunnel_request = Request::builder()
        .method(Method::CONNECT)
        .url(address.url())
        .build();

    for _ in 0..MAX_TUNNEL_ATTEMPTS {
        let mut request = http::Request::builder()
            .method(Method::CONNECT)
            .uri(authority.as_str())
            .header(HOST, authority.as_str())
            .header(USER_AGENT, crate::DEFAULT_USER_AGENT);
        if let Some(credentials) = tunnel_request.headers().get(PROXY_AUTHORIZATION) {
            request = request.header(PROXY_AUTHORIZATION, credentials);
        }
        let request = request
            .body(Empty::new())
            .map_err(|e| ErrorKind::ProxyTunnel(e.to_string()))?;

        guard
            .child(timeouts.write)
            .run(async { Ok(sender.ready().await?) })
            .await?;
        let response = guard
            .child(timeouts.read)
            .run(async { Ok(sender.send_request(request).await?) })
            .await?;

        match response.status() {
            status if status.is_success() => {
                let upgraded = guard
                    .child(timeouts.read)
                    .run(async { Ok(hyper::upgrade::on(response).await?) })
                    .await?;
                trace!("Tunnel to {authority} open through {}", route.proxy());
                return Ok(Box::new(TokioIo::new(upgraded)));
            }
            StatusCode::PROXY_AUTHENTICATION_REQUIRED => {
                let (parts, _) = response.into_parts();
                let challenge = Response::new(
                    address.url(),
                    parts.status,
                    Protocol::Http11,
                    parts.headers,
                    Bytes::new(),
                );
                match authenticator
                    .and_then(|auth| auth.authenticate(Some(route), &tunnel_request, &challenge))
                {
                    Some(next) => tunnel_request = next,
                    None => {
                        driver.abort();
                        return Err(ErrorKind::ProxyTunnel(format!(
                            "{} requires authentication",
                            route.proxy()
                        )));
                    }
                }
            }
            status => {
                driver.abort();
                return Err(ErrorKind::ProxyTunnel(format!(
                    "unexpected response {status} from {}",
                    route.proxy()
                )));
            }
        }
    }

    driver.abort();
    Err(ErrorKind::ProxyTunnel(format!(
        "too many authentication attempts for {}",
        route.proxy()
    )))
}
