use async_trait::async_trait;
use http::header::{
    ACCEPT_ENCODING, CONNECTION, CONTENT_LENGTH, HOST, HeaderValue, TRANSFER_ENCODING, USER_AGENT,
};
use http::Method;
use url::Url;

use crate::chain::{Chain, Interceptor};
use crate::{ErrorKind, Response, Result};

/// Fills in the headers every request needs on the wire, unless the caller
/// set them already.
#[derive(Debug)]
pub(super) struct Bridge;

#[async_trait]
impl Interceptor for Bridge {
    async fn intercept(&self, chain: Chain<'_>) -> Result<Response> {
        let mut request = chain.request().clone();
        let host = host_header(request.url())?;
        let body_len = request.body().map(bytes::Bytes::len);
        let needs_empty_length = body_len.is_none()
            && matches!(*request.method(), Method::POST | Method::PUT | Method::PATCH);
        let user_agent = HeaderValue::from_str(chain.client().user_agent())?;

        let headers = request.headers_mut();
        if !headers.contains_key(HOST) {
            headers.insert(HOST, host);
        }
        if !headers.contains_key(TRANSFER_ENCODING) {
            if let Some(len) = body_len {
                headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
            } else if needs_empty_length {
                headers.insert(CONTENT_LENGTH, HeaderValue::from(0));
            }
        }
        if !headers.contains_key(USER_AGENT) {
            headers.insert(USER_AGENT, user_agent);
        }
        if !headers.contains_key(ACCEPT_ENCODING) {
            headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("identity"));
        }
        if !headers.contains_key(CONNECTION) {
            headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        }

        chain.proceed(request).await
    }
}

/// `host[:port]`, with the port only when it is not the scheme's default
fn host_header(url: &Url) -> Result<HeaderValue> {
    let host = url.host_str().ok_or(ErrorKind::InvalidUrlHost)?;
    let value = match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };
    Ok(HeaderValue::from_str(&value)?)
}
