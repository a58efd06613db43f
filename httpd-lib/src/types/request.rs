use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use typed_builder::TypedBuilder;
use url::Url;

use crate::{ErrorKind, Result};

/// A request description handed to [`Httpd::new_call`](crate::Httpd::new_call).
///
/// Requests are cheap to clone: the body is reference counted, which is what
/// makes follow-ups and retries replayable.
///
/// ```
/// use httpd_lib::Request;
/// use url::Url;
///
/// let request = Request::builder()
///     .url(Url::parse("https://example.com/upload").unwrap())
///     .method(http::Method::POST)
///     .body("payload")
///     .build();
/// assert!(request.is_https());
/// ```
#[derive(Debug, Clone, TypedBuilder)]
pub struct Request {
    /// HTTP method, `GET` by default
    #[builder(default = Method::GET)]
    method: Method,
    /// Target of the request
    url: Url,
    /// Headers set by the caller; the bridge stage adds the rest
    #[builder(default)]
    headers: HeaderMap,
    /// Optional request body
    #[builder(default, setter(strip_option, into))]
    body: Option<Bytes>,
}

impl Request {
    /// Create a `GET` request for the given URL.
    ///
    /// # Errors
    ///
    /// Returns an error if `url` cannot be parsed.
    pub fn get(url: &str) -> Result<Self> {
        Ok(Self::builder().url(Url::parse(url)?).build())
    }

    /// The request method
    #[must_use]
    pub const fn method(&self) -> &Method {
        &self.method
    }

    /// The request target
    #[must_use]
    pub const fn url(&self) -> &Url {
        &self.url
    }

    /// The request headers
    #[must_use]
    pub const fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Mutable access to the request headers
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// The first value of header `name`, if it is valid UTF-8
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// The request body
    #[must_use]
    pub const fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    /// Whether the request targets an `https` URL
    #[must_use]
    pub fn is_https(&self) -> bool {
        self.url.scheme() == "https"
    }

    /// Replace or add a header.
    ///
    /// # Errors
    ///
    /// Returns an error if `value` is not a valid header value.
    pub fn set_header(&mut self, name: HeaderName, value: &str) -> Result<()> {
        let value = HeaderValue::from_str(value).map_err(ErrorKind::InvalidHeader)?;
        self.headers.insert(name, value);
        Ok(())
    }

    /// A copy of this request pointed at a new target.
    #[must_use]
    pub(crate) fn with_url(&self, url: Url) -> Self {
        Self {
            url,
            ..self.clone()
        }
    }

    /// A copy of this request with a different method and body.
    #[must_use]
    pub(crate) fn with_method(&self, method: Method, body: Option<Bytes>) -> Self {
        Self {
            method,
            body,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Request;
    use http::{Method, header};

    #[test]
    fn test_get_request() {
        let request = Request::get("http://example.com/path?q=1").unwrap();
        assert_eq!(request.method(), Method::GET);
        assert!(!request.is_https());
        assert!(request.body().is_none());
    }

    #[test]
    fn test_set_header() {
        let mut request = Request::get("https://example.com").unwrap();
        request.set_header(header::ACCEPT, "text/plain").unwrap();
        assert_eq!(request.header("accept"), Some("text/plain"));
        assert!(request.set_header(header::ACCEPT, "bad\nvalue").is_err());
    }

    #[test]
    fn test_with_method_drops_body() {
        let request = Request::builder()
            .url("http://example.com".parse().unwrap())
            .method(Method::POST)
            .body("data")
            .build();
        let follow_up = request.with_method(Method::GET, None);
        assert_eq!(follow_up.method(), Method::GET);
        assert!(follow_up.body().is_none());
    }
}
