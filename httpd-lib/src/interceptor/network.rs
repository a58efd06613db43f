use async_trait::async_trait;
use bytes::Bytes;
use http::header::{CONNECTION, HOST, HeaderName, TRANSFER_ENCODING, UPGRADE};
use http::Version;
use http_body_util::Full;
use log::trace;
use url::Position;

use crate::chain::{Chain, Interceptor};
use crate::connection::Connection;
use crate::{ErrorKind, Protocol, Request, Response, Result};

/// Headers that are meaningless or forbidden in HTTP/2
const CONNECTION_SPECIFIC: [&str; 3] = ["keep-alive", "proxy-connection", "te"];

/// The last stage: writes the request to the leased connection and reads
/// the response.
#[derive(Debug)]
pub(super) struct CallServer;

#[async_trait]
impl Interceptor for CallServer {
    async fn intercept(&self, chain: Chain<'_>) -> Result<Response> {
        let lease = chain.lease().ok_or_else(|| {
            ErrorKind::Protocol("network stage reached without a connection".into())
        })?;
        let connection = lease.connection();
        let request = chain.request();
        let wire_request = to_wire(request, connection)?;
        trace!(
            "{} {} on connection {}",
            request.method(),
            request.url(),
            connection.id()
        );

        lease.set_exchange_pending(true);
        let result = connection
            .exchange(wire_request, &chain.client().timeouts(), chain.timeout())
            .await;
        let (parts, body) = match result {
            Ok(exchanged) => exchanged,
            Err(e) => {
                // An HTTP/2 connection survives a stream that merely timed out
                if !connection.protocol().is_multiplexed() || !(e.is_timeout() || e.is_cancelled()) {
                    lease.no_new_exchanges();
                }
                lease.set_exchange_pending(false);
                return Err(e);
            }
        };
        lease.set_exchange_pending(false);

        let protocol = match parts.version {
            Version::HTTP_10 => Protocol::Http10,
            Version::HTTP_2 => connection.protocol(),
            _ => Protocol::Http11,
        };
        Ok(Response::new(
            request.url().clone(),
            parts.status,
            protocol,
            parts.headers,
            body,
        ))
    }
}

/// Translate `request` into what goes on the wire of `connection`.
///
/// HTTP/1.1 uses the origin-form request target, except for cleartext
/// requests through an HTTP proxy, which use the absolute form. HTTP/2
/// always carries the full URI, from which the codec derives its
/// pseudo-headers.
fn to_wire(request: &Request, connection: &Connection) -> Result<http::Request<Full<Bytes>>> {
    let multiplexed = connection.protocol().is_multiplexed();
    let mut url = request.url().clone();
    url.set_fragment(None);

    let absolute = multiplexed
        || (!connection.route().proxy().is_direct() && !connection.address().is_https());
    let target = if absolute {
        url.to_string()
    } else {
        url[Position::BeforePath..Position::AfterQuery].to_string()
    };

    let mut headers = request.headers().clone();
    if multiplexed {
        for name in [CONNECTION, TRANSFER_ENCODING, UPGRADE, HOST] {
            headers.remove(name);
        }
        for name in CONNECTION_SPECIFIC {
            headers.remove(HeaderName::from_static(name));
        }
    }

    let mut wire = http::Request::builder()
        .method(request.method().clone())
        .uri(target)
        .version(if multiplexed {
            Version::HTTP_2
        } else {
            Version::HTTP_11
        })
        .body(Full::new(request.body().cloned().unwrap_or_default()))
        .map_err(|e| ErrorKind::Protocol(format!("invalid request: {e}")))?;
    *wire.headers_mut() = headers;
    Ok(wire)
}
