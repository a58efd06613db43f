use async_trait::async_trait;
use http::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, RETRY_AFTER, TRANSFER_ENCODING};
use http::{Method, StatusCode};
use log::debug;
use url::Url;

use crate::call::Call;
use crate::chain::{Chain, Interceptor};
use crate::retry::RetryExt;
use crate::{ErrorKind, Httpd, Redirects, Request, Response, Result};

/// How often a call replays its request after a recoverable connection
/// failure
pub const DEFAULT_MAX_RETRIES: usize = 3;

/// Recovers from connection failures and follows redirects,
/// authentication challenges and retryable statuses.
#[derive(Debug)]
pub(super) struct RetryAndFollowUp;

#[async_trait]
impl Interceptor for RetryAndFollowUp {
    async fn intercept(&self, chain: Chain<'_>) -> Result<Response> {
        let client = chain.client();
        let mut request = chain.request().clone();
        let mut redirects = Redirects::from(vec![request.url().clone()]);
        let mut follow_ups = 0;
        let mut retries = 0;
        let mut prior_status = None;

        loop {
            let response = match chain.proceed(request.clone()).await {
                Ok(response) => response,
                Err(e) if chain.call().is_cancelled() => {
                    debug!("Call {} cancelled: {e}", chain.call().id());
                    return Err(ErrorKind::Cancelled);
                }
                Err(e) => {
                    if client.retry_on_connection_failure()
                        && retries < DEFAULT_MAX_RETRIES
                        && e.should_retry()
                    {
                        retries += 1;
                        debug!(
                            "Retrying {} after recoverable failure ({retries}/{DEFAULT_MAX_RETRIES}): {e}",
                            request.url()
                        );
                        continue;
                    }
                    return Err(e);
                }
            };

            let Some(next) = follow_up(client, chain.call(), &request, &response, prior_status)
            else {
                if redirects.count() > 0 {
                    return Ok(response.with_redirects(redirects));
                }
                return Ok(response);
            };

            follow_ups += 1;
            if follow_ups > client.max_redirects() {
                return Err(ErrorKind::TooManyRedirects(follow_ups));
            }
            debug!(
                "Following up {} with {} {}",
                response.status(),
                next.method(),
                next.url()
            );
            if next.url() != request.url() {
                redirects.push(next.url().clone());
            }
            prior_status = Some(response.status());
            request = next;
        }
    }
}

/// The request answering `response`, or `None` if `response` is final
fn follow_up(
    client: &Httpd,
    call: &Call,
    request: &Request,
    response: &Response,
    prior_status: Option<StatusCode>,
) -> Option<Request> {
    match response.status() {
        StatusCode::PROXY_AUTHENTICATION_REQUIRED => client
            .proxy_authenticator()?
            .authenticate(call.route().as_ref(), request, response),
        StatusCode::UNAUTHORIZED => client
            .authenticator()?
            .authenticate(call.route().as_ref(), request, response),
        _ if response.is_redirect() => redirect(client, request, response),
        StatusCode::REQUEST_TIMEOUT => {
            let retry = client.retry_on_connection_failure()
                && prior_status != Some(StatusCode::REQUEST_TIMEOUT)
                && retry_after(response, 0) == 0;
            retry.then(|| request.clone())
        }
        StatusCode::SERVICE_UNAVAILABLE => {
            let retry = prior_status != Some(StatusCode::SERVICE_UNAVAILABLE)
                && retry_after(response, u64::MAX) == 0;
            retry.then(|| request.clone())
        }
        _ => None,
    }
}

fn redirect(client: &Httpd, request: &Request, response: &Response) -> Option<Request> {
    if !client.follow_redirects() {
        return None;
    }
    let location = response.header("location")?;
    let url = request.url().join(location).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    if url.scheme() != request.url().scheme() && !client.follow_ssl_redirects() {
        return None;
    }

    let method = request.method();
    let keeps_method = *method == Method::GET || *method == Method::HEAD;
    let mut next = match response.status() {
        StatusCode::TEMPORARY_REDIRECT | StatusCode::PERMANENT_REDIRECT if !keeps_method => {
            return None;
        }
        _ if keeps_method => request.with_url(url.clone()),
        _ => {
            let mut next = request.with_method(Method::GET, None).with_url(url.clone());
            for name in [TRANSFER_ENCODING, CONTENT_LENGTH, CONTENT_TYPE] {
                next.headers_mut().remove(name);
            }
            next
        }
    };

    if !same_origin(request.url(), &url) {
        next.headers_mut().remove(AUTHORIZATION);
    }
    Some(next)
}

fn same_origin(a: &Url, b: &Url) -> bool {
    a.scheme() == b.scheme()
        && a.host_str() == b.host_str()
        && a.port_or_known_default() == b.port_or_known_default()
}

/// `Retry-After` in seconds; `default` when absent, unbounded when it is
/// not a number of seconds
fn retry_after(response: &Response, default: u64) -> u64 {
    match response.headers().get(RETRY_AFTER) {
        None => default,
        Some(value) => value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(u64::MAX),
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use http::header::{AUTHORIZATION, HeaderValue, LOCATION, RETRY_AFTER};
    use http::{HeaderMap, Method, StatusCode};
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::{redirect, retry_after};
    use crate::{Httpd, HttpdBuilder, Protocol, Request, Response};

    fn response(status: StatusCode, header: Option<(http::HeaderName, &'static str)>) -> Response {
        let mut headers = HeaderMap::new();
        if let Some((name, value)) = header {
            headers.insert(name, HeaderValue::from_static(value));
        }
        Response::new(
            "http://example.com/a".parse().unwrap(),
            status,
            Protocol::Http11,
            headers,
            Bytes::new(),
        )
    }

    fn client() -> Httpd {
        HttpdBuilder::builder().build().client().unwrap()
    }

    fn post() -> Request {
        Request::builder()
            .url("http://example.com/a".parse().unwrap())
            .method(Method::POST)
            .body("form")
            .build()
    }

    #[rstest]
    #[case(StatusCode::MOVED_PERMANENTLY, Some(Method::GET))]
    #[case(StatusCode::FOUND, Some(Method::GET))]
    #[case(StatusCode::SEE_OTHER, Some(Method::GET))]
    #[case(StatusCode::TEMPORARY_REDIRECT, None)]
    #[case(StatusCode::PERMANENT_REDIRECT, None)]
    fn test_post_redirects(#[case] status: StatusCode, #[case] expected: Option<Method>) {
        let response = response(status, Some((LOCATION, "/b")));
        let next = redirect(&client(), &post(), &response);
        assert_eq!(next.as_ref().map(|r| r.method().clone()), expected);
        if let Some(next) = next {
            assert!(next.body().is_none());
            assert_eq!(next.url().as_str(), "http://example.com/b");
        }
    }

    #[test]
    fn test_cross_origin_redirect_drops_authorization() {
        let mut request = Request::get("http://example.com/a").unwrap();
        request
            .headers_mut()
            .insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));

        let same = response(StatusCode::FOUND, Some((LOCATION, "/b")));
        let next = redirect(&client(), &request, &same).unwrap();
        assert!(next.headers().contains_key(AUTHORIZATION));

        let other = response(StatusCode::FOUND, Some((LOCATION, "http://other.test/")));
        let next = redirect(&client(), &request, &other).unwrap();
        assert!(!next.headers().contains_key(AUTHORIZATION));
    }

    #[test]
    fn test_redirect_policies() {
        let request = Request::get("http://example.com/a").unwrap();
        let to_https = response(StatusCode::FOUND, Some((LOCATION, "https://example.com/")));
        assert!(redirect(&client(), &request, &to_https).is_some());

        let strict = HttpdBuilder::builder()
            .follow_ssl_redirects(false)
            .build()
            .client()
            .unwrap();
        assert!(redirect(&strict, &request, &to_https).is_none());

        let no_redirects = HttpdBuilder::builder()
            .follow_redirects(false)
            .build()
            .client()
            .unwrap();
        let local = response(StatusCode::FOUND, Some((LOCATION, "/b")));
        assert!(redirect(&no_redirects, &request, &local).is_none());

        let ftp = response(StatusCode::FOUND, Some((LOCATION, "ftp://example.com/")));
        assert!(redirect(&client(), &request, &ftp).is_none());
        assert!(redirect(&client(), &request, &response(StatusCode::FOUND, None)).is_none());
    }

    #[test]
    fn test_retry_after() {
        assert_eq!(retry_after(&response(StatusCode::SERVICE_UNAVAILABLE, None), 7), 7);
        let zero = response(StatusCode::SERVICE_UNAVAILABLE, Some((RETRY_AFTER, "0")));
        assert_eq!(retry_after(&zero, u64::MAX), 0);
        let date = response(
            StatusCode::SERVICE_UNAVAILABLE,
            Some((RETRY_AFTER, "Wed, 21 Oct 2015 07:28:00 GMT")),
        );
        assert_eq!(retry_after(&date, 0), u64::MAX);
    }
}
