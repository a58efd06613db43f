//! Route selection.
//!
//! A [`RouteSelector`] turns an [`Address`] into the concrete attempts to
//! connect to it: one [`Route`] per proxy, resolved endpoint and applicable
//! connection spec. Routes that failed recently, as remembered by the
//! pool-wide [`RouteDatabase`], are postponed until every fresh route was
//! tried.

use std::collections::VecDeque;
use std::fmt::{self, Display};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use log::{debug, trace};

use crate::address::{Address, ConnectionSpec};
use crate::proxy::Proxy;
use crate::{ErrorKind, Result};

/// Maximum number of failed routes remembered by a [`RouteDatabase`]
pub const DEFAULT_ROUTE_DATABASE_CAPACITY: usize = 64;

/// One concrete way to reach an address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Route {
    proxy: Proxy,
    socket_addr: SocketAddr,
    spec: ConnectionSpec,
}

impl Route {
    /// Create a route
    #[must_use]
    pub const fn new(proxy: Proxy, socket_addr: SocketAddr, spec: ConnectionSpec) -> Self {
        Self {
            proxy,
            socket_addr,
            spec,
        }
    }

    /// The proxy this route goes through
    #[must_use]
    pub const fn proxy(&self) -> &Proxy {
        &self.proxy
    }

    /// The socket endpoint: the origin server, or the proxy
    #[must_use]
    pub const fn socket_addr(&self) -> SocketAddr {
        self.socket_addr
    }

    /// The connection spec used on this route
    #[must_use]
    pub const fn spec(&self) -> ConnectionSpec {
        self.spec
    }

    /// Whether a `CONNECT` tunnel must be opened through the proxy first
    #[must_use]
    pub const fn requires_tunnel(&self) -> bool {
        matches!(self.proxy, Proxy::Http { .. }) && self.spec.is_tls()
    }
}

impl Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.proxy {
            Proxy::Direct => write!(f, "{} ({})", self.socket_addr, self.spec),
            proxy => write!(f, "{} via {proxy} ({})", self.socket_addr, self.spec),
        }
    }
}

/// Routes that failed to connect recently.
///
/// Bounded: once full, the oldest failure is forgotten.
#[derive(Debug)]
pub struct RouteDatabase {
    failed: Mutex<VecDeque<Route>>,
    capacity: usize,
}

impl Default for RouteDatabase {
    fn default() -> Self {
        Self::new(DEFAULT_ROUTE_DATABASE_CAPACITY)
    }
}

impl RouteDatabase {
    /// A database remembering at most `capacity` failed routes
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            failed: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Remember that connecting to `route` failed
    pub fn failed(&self, route: &Route) {
        let mut failed = self.failed.lock().expect("route database lock poisoned");
        if failed.contains(route) || self.capacity == 0 {
            return;
        }
        if failed.len() == self.capacity {
            failed.pop_front();
        }
        failed.push_back(route.clone());
    }

    /// Forget a past failure of `route` after it connected
    pub fn connected(&self, route: &Route) {
        self.failed
            .lock()
            .expect("route database lock poisoned")
            .retain(|r| r != route);
    }

    /// Whether `route` failed recently
    #[must_use]
    pub fn should_postpone(&self, route: &Route) -> bool {
        self.failed
            .lock()
            .expect("route database lock poisoned")
            .contains(route)
    }

    /// Number of remembered failures
    #[must_use]
    pub fn len(&self) -> usize {
        self.failed.lock().expect("route database lock poisoned").len()
    }

    /// Whether no failure is remembered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Pull iterator over the routes of one address.
///
/// Proxies are chosen once, up front. Endpoints are resolved lazily: the
/// resolver runs for a proxy only when the routes of the previous one are
/// used up.
#[derive(Debug)]
pub struct RouteSelector {
    address: Address,
    database: Arc<RouteDatabase>,
    proxies: Vec<Proxy>,
    next_proxy: usize,
    routes: VecDeque<Route>,
    postponed: VecDeque<Route>,
}

impl RouteSelector {
    /// Plan the routes to `address`
    #[must_use]
    pub fn new(address: Address, database: Arc<RouteDatabase>) -> Self {
        let proxies = match address.proxy() {
            Some(proxy) => vec![proxy.clone()],
            None => {
                let selected = address.proxy_selector().select(&address.url());
                if selected.is_empty() {
                    vec![Proxy::Direct]
                } else {
                    selected
                }
            }
        };
        trace!("Proxies for {address}: {proxies:?}");

        Self {
            address,
            database,
            proxies,
            next_proxy: 0,
            routes: VecDeque::new(),
            postponed: VecDeque::new(),
        }
    }

    /// The address routes are selected for
    #[must_use]
    pub const fn address(&self) -> &Address {
        &self.address
    }

    /// Whether another route may be produced
    #[must_use]
    pub fn has_next(&self) -> bool {
        !self.routes.is_empty() || self.next_proxy < self.proxies.len() || !self.postponed.is_empty()
    }

    /// The next route to try.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::NoRouteAvailable`] once exhausted, or the resolver's
    /// error for the current proxy.
    pub async fn next(&mut self) -> Result<Route> {
        loop {
            if let Some(route) = self.routes.pop_front() {
                return Ok(route);
            }
            if self.next_proxy < self.proxies.len() {
                let proxy = self.proxies[self.next_proxy].clone();
                self.next_proxy += 1;
                self.plan(proxy).await?;
                continue;
            }
            if let Some(route) = self.postponed.pop_front() {
                debug!("Trying previously failed route {route}");
                return Ok(route);
            }
            return Err(ErrorKind::NoRouteAvailable(self.address.to_string()));
        }
    }

    async fn plan(&mut self, proxy: Proxy) -> Result<()> {
        let (host, port) = match &proxy {
            Proxy::Direct => (self.address.host().to_string(), self.address.port()),
            Proxy::Http { host, port } => (host.clone(), *port),
        };

        let endpoints = match host.parse() {
            Ok(ip) => vec![SocketAddr::new(ip, port)],
            Err(_) => self.address.resolver().resolve(&host, port).await?,
        };

        let specs: Vec<ConnectionSpec> = self.address.applicable_specs().collect();
        for socket_addr in endpoints {
            for spec in &specs {
                let route = Route::new(proxy.clone(), socket_addr, *spec);
                if self.database.should_postpone(&route) {
                    self.postponed.push_back(route);
                } else {
                    self.routes.push_back(route);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Arc;

    use pretty_assertions::assert_eq;

    use super::{Route, RouteDatabase, RouteSelector};
    use crate::address::{Address, ConnectionSpec};
    use crate::dns::StaticResolver;
    use crate::proxy::{Proxy, ProxySelector};
    use crate::ErrorKind;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn address(resolver: StaticResolver) -> Address {
        Address::builder()
            .host("example.com")
            .port(80)
            .resolver(Arc::new(resolver))
            .build()
    }

    #[tokio::test]
    async fn test_routes_follow_resolver_order() {
        let resolver = StaticResolver::new().with_host(
            "example.com",
            vec![addr("10.0.0.1:0"), addr("10.0.0.2:0")],
        );
        let mut selector = RouteSelector::new(address(resolver), Arc::default());

        assert!(selector.has_next());
        let first = selector.next().await.unwrap();
        let second = selector.next().await.unwrap();
        assert_eq!(first.socket_addr(), addr("10.0.0.1:80"));
        assert_eq!(second.socket_addr(), addr("10.0.0.2:80"));
        assert_eq!(first.spec(), ConnectionSpec::Cleartext);
        assert!(!selector.has_next());
        assert_eq!(
            selector.next().await,
            Err(ErrorKind::NoRouteAvailable("http://example.com:80".into()))
        );
    }

    #[tokio::test]
    async fn test_failed_routes_are_postponed() {
        let resolver = StaticResolver::new().with_host(
            "example.com",
            vec![addr("10.0.0.1:0"), addr("10.0.0.2:0")],
        );
        let database = Arc::new(RouteDatabase::default());
        database.failed(&Route::new(
            Proxy::Direct,
            addr("10.0.0.1:80"),
            ConnectionSpec::Cleartext,
        ));

        let mut selector = RouteSelector::new(address(resolver), database);
        assert_eq!(selector.next().await.unwrap().socket_addr(), addr("10.0.0.2:80"));
        assert!(selector.has_next());
        assert_eq!(selector.next().await.unwrap().socket_addr(), addr("10.0.0.1:80"));
        assert!(!selector.has_next());
    }

    #[tokio::test]
    async fn test_unknown_host() {
        let mut selector = RouteSelector::new(address(StaticResolver::new()), Arc::default());
        assert_eq!(
            selector.next().await,
            Err(ErrorKind::UnknownHost("example.com".into()))
        );
    }

    #[derive(Debug)]
    struct TwoProxies;

    impl ProxySelector for TwoProxies {
        fn select(&self, _url: &url::Url) -> Vec<Proxy> {
            vec![Proxy::http("10.1.1.1", 3128), Proxy::Direct]
        }
    }

    #[tokio::test]
    async fn test_proxies_in_selector_order() {
        let resolver =
            StaticResolver::new().with_host("example.com", vec![addr("10.0.0.1:0")]);
        let address = Address::builder()
            .host("example.com")
            .port(443)
            .https(true)
            .resolver(Arc::new(resolver))
            .proxy_selector(Arc::new(TwoProxies))
            .build();
        let mut selector = RouteSelector::new(address, Arc::default());

        let proxied = selector.next().await.unwrap();
        assert_eq!(proxied.socket_addr(), addr("10.1.1.1:3128"));
        assert!(proxied.requires_tunnel());

        let direct = selector.next().await.unwrap();
        assert_eq!(direct.proxy(), &Proxy::Direct);
        assert_eq!(direct.socket_addr(), addr("10.0.0.1:443"));
        assert_eq!(direct.spec(), ConnectionSpec::ModernTls);
        assert!(!selector.has_next());
    }

    #[test]
    fn test_route_database_is_bounded() {
        let database = RouteDatabase::new(2);
        let routes: Vec<Route> = (1..=3)
            .map(|i| {
                Route::new(
                    Proxy::Direct,
                    addr(&format!("10.0.0.{i}:80")),
                    ConnectionSpec::Cleartext,
                )
            })
            .collect();
        for route in &routes {
            database.failed(route);
        }
        assert_eq!(database.len(), 2);
        assert!(!database.should_postpone(&routes[0]));
        assert!(database.should_postpone(&routes[2]));

        database.connected(&routes[2]);
        assert!(!database.should_postpone(&routes[2]));
    }
}
