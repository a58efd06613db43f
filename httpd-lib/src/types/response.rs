use std::fmt::Display;

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use url::Url;

use crate::types::Protocol;

/// A list of URLs that were followed through HTTP redirects,
/// starting from the original URL and ending at the final destination.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Redirects(Vec<Url>);

impl From<Vec<Url>> for Redirects {
    fn from(value: Vec<Url>) -> Self {
        Self(value)
    }
}

impl Display for Redirects {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let list = self
            .0
            .iter()
            .map(Url::as_str)
            .collect::<Vec<_>>()
            .join(" --> ");
        write!(f, "{list}")
    }
}

impl Redirects {
    /// Count how many times a redirect was followed.
    /// This is the length of the list minus one.
    #[must_use]
    pub const fn count(&self) -> usize {
        self.0.len().saturating_sub(1)
    }

    /// Represents zero redirects
    #[must_use]
    pub const fn none() -> Self {
        Redirects(vec![])
    }

    /// The URLs in the order they were requested
    #[must_use]
    pub fn urls(&self) -> &[Url] {
        &self.0
    }

    pub(crate) fn push(&mut self, url: Url) {
        self.0.push(url);
    }
}

/// A fully read response.
#[derive(Debug, Clone)]
pub struct Response {
    status: StatusCode,
    protocol: Protocol,
    headers: HeaderMap,
    body: Bytes,
    url: Url,
    redirects: Redirects,
}

impl Response {
    /// Create a response for `url`.
    ///
    /// Interceptors use this to short-circuit the chain.
    #[must_use]
    pub fn new(
        url: Url,
        status: StatusCode,
        protocol: Protocol,
        headers: HeaderMap,
        body: Bytes,
    ) -> Self {
        Self {
            status,
            protocol,
            headers,
            body,
            url,
            redirects: Redirects::none(),
        }
    }

    /// The response status code
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        self.status
    }

    /// The protocol the response was received with
    #[must_use]
    pub const fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Response headers
    #[must_use]
    pub const fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Mutable response headers, for interceptors rewriting responses
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// The first value of header `name`, if it is valid UTF-8
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// The response body
    #[must_use]
    pub const fn body(&self) -> &Bytes {
        &self.body
    }

    /// The body decoded as UTF-8, replacing invalid sequences
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// The URL of the request that produced this response
    #[must_use]
    pub const fn url(&self) -> &Url {
        &self.url
    }

    /// Redirects followed before this response was received
    #[must_use]
    pub const fn redirects(&self) -> &Redirects {
        &self.redirects
    }

    /// Whether the status code is in the range 200-299
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Whether the status code is a redirect
    #[must_use]
    pub fn is_redirect(&self) -> bool {
        matches!(
            self.status,
            StatusCode::MULTIPLE_CHOICES
                | StatusCode::MOVED_PERMANENTLY
                | StatusCode::FOUND
                | StatusCode::SEE_OTHER
                | StatusCode::TEMPORARY_REDIRECT
                | StatusCode::PERMANENT_REDIRECT
        )
    }

    pub(crate) fn with_redirects(mut self, redirects: Redirects) -> Self {
        self.redirects = redirects;
        self
    }
}
