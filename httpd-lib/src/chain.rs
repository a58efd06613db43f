//! The interceptor pipeline.
//!
//! A call runs as a chain of [`Interceptor`]s. Each stage may rewrite the
//! request, short-circuit with a response of its own, or hand the request
//! on with [`Chain::proceed`] and post-process what comes back. The stage
//! order is fixed:
//!
//! 1. application interceptors
//! 2. retry and follow-up
//! 3. bridge (default headers)
//! 4. cache
//! 5. connect
//! 6. network interceptors
//! 7. call server (the wire exchange)

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;

use crate::call::Call;
use crate::connection::Connection;
use crate::pool::ConnectionLease;
use crate::timeout::Timeout;
use crate::{ErrorKind, Httpd, Request, Response, Result};

/// A stage of the pipeline.
///
/// Application interceptors run once per call and see the request as the
/// caller built it. Network interceptors run once per network exchange,
/// after a connection was acquired, so [`Chain::connection`] is always set
/// for them.
#[async_trait]
pub trait Interceptor: Send + Sync + Debug {
    /// Produce the response for `chain.request()`, usually by calling
    /// [`Chain::proceed`].
    async fn intercept(&self, chain: Chain<'_>) -> Result<Response>;
}

/// The view an interceptor has of the rest of the pipeline.
#[derive(Debug)]
pub struct Chain<'a> {
    interceptors: &'a [Arc<dyn Interceptor>],
    index: usize,
    request: Request,
    call: &'a Call,
    timeout: &'a Timeout,
    lease: Option<&'a ConnectionLease>,
}

impl<'a> Chain<'a> {
    pub(crate) fn new(
        interceptors: &'a [Arc<dyn Interceptor>],
        request: Request,
        call: &'a Call,
        timeout: &'a Timeout,
    ) -> Self {
        Self {
            interceptors,
            index: 0,
            request,
            call,
            timeout,
            lease: None,
        }
    }

    /// The request this stage was handed
    #[must_use]
    pub const fn request(&self) -> &Request {
        &self.request
    }

    /// The call the chain runs for
    #[must_use]
    pub const fn call(&self) -> &Call {
        self.call
    }

    /// The client the call belongs to
    #[must_use]
    pub fn client(&self) -> &Httpd {
        self.call.client()
    }

    /// The connection carrying the exchange. Only set once the connect
    /// stage ran, i.e. for network interceptors.
    #[must_use]
    pub fn connection(&self) -> Option<&Connection> {
        self.lease.map(ConnectionLease::connection)
    }

    /// The guard bounding the call
    pub(crate) const fn timeout(&self) -> &Timeout {
        self.timeout
    }

    pub(crate) const fn lease(&self) -> Option<&ConnectionLease> {
        self.lease
    }

    /// Hand `request` to the next stage.
    ///
    /// # Errors
    ///
    /// Fails with [`ErrorKind::Cancelled`] if the call was cancelled, or
    /// with whatever the rest of the chain fails with.
    pub async fn proceed(&self, request: Request) -> Result<Response> {
        self.proceed_on(request, self.lease).await
    }

    /// Like [`Chain::proceed`], with `lease` attached for the stages after
    /// the connect stage.
    pub(crate) async fn proceed_with_lease(
        &self,
        request: Request,
        lease: &ConnectionLease,
    ) -> Result<Response> {
        self.proceed_on(request, Some(lease)).await
    }

    async fn proceed_on(
        &self,
        request: Request,
        lease: Option<&ConnectionLease>,
    ) -> Result<Response> {
        if self.call.is_cancelled() {
            return Err(ErrorKind::Cancelled);
        }
        let interceptor = self.interceptors.get(self.index).ok_or_else(|| {
            ErrorKind::Protocol("the last stage of the chain must not proceed".into())
        })?;
        let next = Chain {
            interceptors: self.interceptors,
            index: self.index + 1,
            request,
            call: self.call,
            timeout: self.timeout,
            lease,
        };
        interceptor.intercept(next).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use bytes::Bytes;
    use http::{HeaderMap, StatusCode};
    use pretty_assertions::assert_eq;

    use super::{Chain, Interceptor};
    use crate::{ErrorKind, HttpdBuilder, Protocol, Request, Response, Result};

    /// Answers every request itself, recording what it saw
    #[derive(Debug, Default)]
    struct Responder {
        seen: AtomicUsize,
    }

    #[async_trait]
    impl Interceptor for Responder {
        async fn intercept(&self, chain: Chain<'_>) -> Result<Response> {
            self.seen.fetch_add(1, Ordering::SeqCst);
            assert!(chain.connection().is_none());
            Ok(Response::new(
                chain.request().url().clone(),
                StatusCode::IM_A_TEAPOT,
                Protocol::Http11,
                HeaderMap::new(),
                Bytes::from_static(b"short-circuited"),
            ))
        }
    }

    /// Rewrites the request path before proceeding
    #[derive(Debug)]
    struct Rewriter;

    #[async_trait]
    impl Interceptor for Rewriter {
        async fn intercept(&self, chain: Chain<'_>) -> Result<Response> {
            let url = chain.request().url().join("/rewritten").unwrap();
            let request = Request::builder().url(url).build();
            chain.proceed(request).await
        }
    }

    #[tokio::test]
    async fn test_application_interceptor_short_circuits() {
        let responder = Arc::new(Responder::default());
        let client = HttpdBuilder::builder()
            .interceptors(vec![
                Arc::new(Rewriter) as Arc<dyn Interceptor>,
                responder.clone(),
            ])
            .build()
            .client()
            .unwrap();

        // No server listens on this port; the chain must never reach it
        let call = client.new_call(Request::get("http://127.0.0.1:9/").unwrap());
        let response = call.execute().await.unwrap();

        assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
        assert_eq!(response.url().path(), "/rewritten");
        assert_eq!(response.text(), "short-circuited");
        assert_eq!(responder.seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_call_does_not_proceed() {
        let responder = Arc::new(Responder::default());
        let client = HttpdBuilder::builder()
            .interceptors(vec![responder.clone() as Arc<dyn Interceptor>])
            .build()
            .client()
            .unwrap();

        let call = client.new_call(Request::get("http://127.0.0.1:9/").unwrap());
        call.cancel();
        assert_eq!(call.execute().await.unwrap_err(), ErrorKind::Cancelled);
        assert_eq!(responder.seen.load(Ordering::SeqCst), 0);
    }
}
