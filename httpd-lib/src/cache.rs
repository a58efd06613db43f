//! Response caching collaborators consulted by the cache stage.

use std::fmt::Debug;

use dashmap::DashMap;
use http::header::CACHE_CONTROL;
use http::{Method, StatusCode};
use log::trace;
use url::Url;

use crate::{Request, Response};

/// Storage for responses that may be served without a network exchange.
pub trait ResponseCache: Send + Sync + Debug {
    /// A stored response for `request`, if one can be served
    fn get(&self, request: &Request) -> Option<Response>;

    /// Offer `response` to the cache after it was received for `request`
    fn put(&self, request: &Request, response: &Response);

    /// Forget what is stored for `url`, after a request that may have
    /// changed it
    fn remove(&self, _url: &Url) {}
}

/// An in-memory cache of successful `GET` responses, keyed by URL.
///
/// Honours `Cache-Control: no-store` and `no-cache` on both requests and
/// responses. There is no expiry; entries live until they are replaced or
/// invalidated by a non-`GET` request to the same URL.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: DashMap<Url, Response>,
}

impl MemoryCache {
    /// An empty cache
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored responses
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is stored
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn cache_directive(value: Option<&str>, directive: &str) -> bool {
    value.is_some_and(|v| {
        v.split(',')
            .any(|d| d.trim().eq_ignore_ascii_case(directive))
    })
}

/// Whether the `Cache-Control` header of a request or response names
/// `directive`
pub(crate) fn has_directive(headers: &http::HeaderMap, directive: &str) -> bool {
    headers
        .get_all(CACHE_CONTROL)
        .iter()
        .any(|v| cache_directive(v.to_str().ok(), directive))
}

impl ResponseCache for MemoryCache {
    fn get(&self, request: &Request) -> Option<Response> {
        if request.method() != Method::GET || has_directive(request.headers(), "no-cache") {
            return None;
        }
        self.entries.get(request.url()).map(|entry| entry.clone())
    }

    fn put(&self, request: &Request, response: &Response) {
        if request.method() != Method::GET
            || response.status() != StatusCode::OK
            || has_directive(request.headers(), "no-store")
            || has_directive(response.headers(), "no-store")
        {
            return;
        }
        trace!("Caching response for {}", request.url());
        self.entries.insert(request.url().clone(), response.clone());
    }

    fn remove(&self, url: &Url) {
        self.entries.remove(url);
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use http::header::CACHE_CONTROL;
    use http::{HeaderMap, HeaderValue, Method, StatusCode};

    use super::{MemoryCache, ResponseCache};
    use crate::{Protocol, Request, Response};

    fn response(status: StatusCode, cache_control: Option<&'static str>) -> Response {
        let mut headers = HeaderMap::new();
        if let Some(value) = cache_control {
            headers.insert(CACHE_CONTROL, HeaderValue::from_static(value));
        }
        Response::new(
            "http://example.com/".parse().unwrap(),
            status,
            Protocol::Http11,
            headers,
            Bytes::from_static(b"cached"),
        )
    }

    #[test]
    fn test_stores_successful_get() {
        let cache = MemoryCache::new();
        let request = Request::get("http://example.com/").unwrap();
        cache.put(&request, &response(StatusCode::OK, None));
        assert_eq!(cache.get(&request).unwrap().text(), "cached");

        cache.remove(request.url());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_skips_uncacheable_responses() {
        let cache = MemoryCache::new();
        let request = Request::get("http://example.com/").unwrap();
        cache.put(&request, &response(StatusCode::NOT_FOUND, None));
        cache.put(&request, &response(StatusCode::OK, Some("private, no-store")));
        assert!(cache.is_empty());

        let post = Request::builder()
            .url("http://example.com/".parse().unwrap())
            .method(Method::POST)
            .build();
        cache.put(&post, &response(StatusCode::OK, None));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_no_cache_request_bypasses_lookup() {
        let cache = MemoryCache::new();
        let mut request = Request::get("http://example.com/").unwrap();
        cache.put(&request, &response(StatusCode::OK, None));
        request
            .set_header(CACHE_CONTROL, "no-cache")
            .unwrap();
        assert!(cache.get(&request).is_none());
        assert_eq!(cache.len(), 1);
    }
}
