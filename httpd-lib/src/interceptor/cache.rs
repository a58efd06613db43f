use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use log::debug;

use crate::cache::has_directive;
use crate::chain::{Chain, Interceptor};
use crate::{Protocol, Response, Result};

/// Serves requests from the client's [`ResponseCache`](crate::cache::ResponseCache)
/// and offers it what comes back from the network.
#[derive(Debug)]
pub(super) struct Cache;

#[async_trait]
impl Interceptor for Cache {
    async fn intercept(&self, chain: Chain<'_>) -> Result<Response> {
        let Some(cache) = chain.client().cache() else {
            return chain.proceed(chain.request().clone()).await;
        };
        let request = chain.request();

        if let Some(response) = cache.get(request) {
            debug!("Serving {} from cache", request.url());
            return Ok(response);
        }
        if has_directive(request.headers(), "only-if-cached") {
            return Ok(Response::new(
                request.url().clone(),
                StatusCode::GATEWAY_TIMEOUT,
                Protocol::Http11,
                HeaderMap::new(),
                Bytes::new(),
            ));
        }

        let response = chain.proceed(request.clone()).await?;
        if *request.method() == Method::GET {
            cache.put(request, &response);
        } else if *request.method() != Method::HEAD {
            cache.remove(request.url());
        }
        Ok(response)
    }
}
