use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, warn};

use crate::address::Address;
use crate::call::Call;
use crate::chain::{Chain, Interceptor};
use crate::connection::Connection;
use crate::pool::ConnectionLease;
use crate::route::{Route, RouteSelector};
use crate::timeout::Timeout;
use crate::{ErrorKind, Response, Result};

/// Finds a connection for the request, pooled or new, and hands it to the
/// stages below.
#[derive(Debug)]
pub(super) struct Connect;

#[async_trait]
impl Interceptor for Connect {
    async fn intercept(&self, chain: Chain<'_>) -> Result<Response> {
        let address = chain.client().address(chain.request().url())?;
        let lease = find_connection(chain.call(), &address, chain.timeout()).await?;
        chain
            .proceed_with_lease(chain.request().clone(), &lease)
            .await
    }
}

/// A leased connection to `address`.
///
/// The pool is asked first. Otherwise the call's route selector produces
/// routes until one connects; the selector survives failed attempts, so a
/// retry of the same call continues with the routes not tried yet.
async fn find_connection(call: &Call, address: &Address, guard: &Timeout) -> Result<ConnectionLease> {
    let client = call.client();
    let pool = client.connection_pool();
    if let Some(lease) = pool.acquire(address, call.id()) {
        debug!("Reusing {:?} for call {}", lease.connection(), call.id());
        return Ok(lease);
    }

    let mut finder = call.route_selector().lock().await;
    let selector = match finder.as_mut() {
        Some(selector) if selector.address() == address => selector,
        _ => finder.insert(RouteSelector::new(
            address.clone(),
            Arc::clone(pool.route_database()),
        )),
    };

    let mut last_error = None;
    while selector.has_next() {
        guard.throw_if_reached()?;
        // Another call may have pooled a connection we can share meanwhile
        if let Some(lease) = pool.acquire(address, call.id()) {
            return Ok(lease);
        }
        let route = match selector.next().await {
            Ok(route) => route,
            Err(e) => {
                last_error = Some(e);
                break;
            }
        };

        match Connection::connect(
            address,
            &route,
            &client.timeouts(),
            client.proxy_authenticator(),
            guard,
        )
        .await
        {
            Ok(connection) => {
                pool.route_database().connected(&route);
                call.set_route(route);
                // A later retry of this call starts over with fresh routes
                *finder = None;
                return Ok(pool.put(connection, call.id()));
            }
            Err(e) if e.is_cancelled() || e == ErrorKind::DeadlineExceeded => return Err(e),
            Err(e) => {
                debug!("Connecting call {} over {route} failed: {e}", call.id());
                pool.route_database().failed(&route);
                if !route.proxy().is_direct() {
                    address
                        .proxy_selector()
                        .connect_failed(&address.url(), route.proxy(), &e);
                }
                let stop = is_final(&route, &e) || !client.retry_on_connection_failure();
                last_error = Some(ErrorKind::connect(&route, e));
                if stop {
                    break;
                }
            }
        }
    }

    let error = last_error.unwrap_or_else(|| ErrorKind::NoRouteAvailable(address.to_string()));
    warn!("Call {} could not connect to {address}: {error}", call.id());
    Err(error)
}

/// Failures that no other route is expected to fix
fn is_final(route: &Route, error: &ErrorKind) -> bool {
    match error {
        ErrorKind::PeerUnverified(_) | ErrorKind::Protocol(_) => true,
        ErrorKind::Tls(_) => !route.spec().allows_fallback(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::is_final;
    use crate::address::ConnectionSpec;
    use crate::proxy::Proxy;
    use crate::route::Route;
    use crate::ErrorKind;

    fn route(spec: ConnectionSpec) -> Route {
        Route::new(Proxy::Direct, SocketAddr::from(([127, 0, 0, 1], 443)), spec)
    }

    #[test]
    fn test_tls_failure_only_falls_back_when_allowed() {
        let error = ErrorKind::Tls("handshake failure".into());
        assert!(!is_final(&route(ConnectionSpec::RestrictedTls), &error));
        assert!(is_final(&route(ConnectionSpec::ModernTls), &error));
        assert!(is_final(
            &route(ConnectionSpec::RestrictedTls),
            &ErrorKind::PeerUnverified("example.com".into())
        ));
        assert!(!is_final(
            &route(ConnectionSpec::ModernTls),
            &ErrorKind::Io(std::io::ErrorKind::ConnectionRefused.into())
        ));
    }
}
