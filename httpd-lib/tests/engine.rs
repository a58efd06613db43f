use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use http::{Method, StatusCode};
use httpd_lib::cache::MemoryCache;
use httpd_lib::dns::StaticResolver;
use httpd_lib::{
    Chain, ErrorKind, HttpdBuilder, Interceptor, Protocol, Request, Response, Result,
};
use pretty_assertions::assert_eq;
use url::Url;
use wiremock::matchers::{body_string, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn url(server: &MockServer, path: &str) -> Url {
    Url::parse(&format!("{}{path}", server.uri())).unwrap()
}

#[tokio::test]
async fn test_sequential_calls_share_a_connection() {
    let mock_server = test_utils::mock_server!(StatusCode::OK, set_body_string("hello"));
    let client = HttpdBuilder::default().client().unwrap();

    for _ in 0..3 {
        let response = client
            .new_call(Request::get(&mock_server.uri()).unwrap())
            .execute()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.protocol(), Protocol::Http11);
        assert_eq!(response.text(), "hello");
    }

    assert_eq!(client.connection_pool().connection_count(), 1);
    assert_eq!(client.connection_pool().idle_connection_count(), 1);
}

#[tokio::test]
async fn test_redirect_is_followed() {
    test_utils::redirecting_mock_server!(|redirect_url: Url, ok_url: Url| async move {
        let client = HttpdBuilder::default().client().unwrap();
        let response = client
            .new_call(Request::builder().url(redirect_url.clone()).build())
            .execute()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.url(), &ok_url);
        assert_eq!(response.redirects().count(), 1);
        assert_eq!(response.redirects().urls(), &[redirect_url, ok_url]);
    })
    .await;
}

#[tokio::test]
async fn test_twenty_redirects_are_allowed() {
    let mock_server = test_utils::redirect_chain_mock_server!(20);
    let client = HttpdBuilder::default().client().unwrap();
    let response = client
        .new_call(Request::builder().url(url(&mock_server, "/hop/0")).build())
        .execute()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.redirects().count(), 20);
}

#[tokio::test]
async fn test_twenty_one_redirects_fail() {
    let mock_server = test_utils::redirect_chain_mock_server!(21);
    let client = HttpdBuilder::default().client().unwrap();
    let result = client
        .new_call(Request::builder().url(url(&mock_server, "/hop/0")).build())
        .execute()
        .await;
    assert_eq!(result.unwrap_err(), ErrorKind::TooManyRedirects(21));
}

#[tokio::test]
async fn test_redirects_can_be_disabled() {
    let mock_server = test_utils::redirect_chain_mock_server!(1);
    let client = HttpdBuilder::builder()
        .follow_redirects(false)
        .build()
        .client()
        .unwrap();
    let response = client
        .new_call(Request::builder().url(url(&mock_server, "/hop/0")).build())
        .execute()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(response.header("location"), Some("/hop/1"));
}

#[tokio::test]
async fn test_read_timeout() {
    let mock_server =
        test_utils::mock_server!(StatusCode::OK, set_delay(Duration::from_secs(3)));
    let client = HttpdBuilder::builder()
        .read_timeout(Duration::from_millis(200))
        .build()
        .client()
        .unwrap();
    let result = client
        .new_call(Request::get(&mock_server.uri()).unwrap())
        .execute()
        .await;
    assert_eq!(result.unwrap_err(), ErrorKind::Timeout);
}

#[tokio::test]
async fn test_call_timeout_is_a_deadline() {
    let mock_server =
        test_utils::mock_server!(StatusCode::OK, set_delay(Duration::from_secs(3)));
    let client = HttpdBuilder::builder()
        .call_timeout(Duration::from_millis(200))
        .build()
        .client()
        .unwrap();
    let call = client.new_call(Request::get(&mock_server.uri()).unwrap());
    assert_eq!(call.execute().await.unwrap_err(), ErrorKind::DeadlineExceeded);
    assert_eq!(call.state(), httpd_lib::CallState::Failed);
}

#[tokio::test]
async fn test_enqueued_calls_respect_host_cap() {
    let mock_server =
        test_utils::mock_server!(StatusCode::OK, set_delay(Duration::from_millis(200)));
    let client = HttpdBuilder::builder()
        .max_requests_per_host(2usize)
        .build()
        .client()
        .unwrap();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    for _ in 0..6 {
        let tx = tx.clone();
        client
            .new_call(Request::get(&mock_server.uri()).unwrap())
            .enqueue(move |result| {
                let _ = tx.send(result.map(|r| r.status()));
            })
            .unwrap();
    }
    drop(tx);

    assert_eq!(client.dispatcher().running_calls_count(), 2);
    assert_eq!(client.dispatcher().queued_calls_count(), 4);

    let mut completed = 0;
    while let Some(result) = rx.recv().await {
        assert_eq!(result.unwrap(), StatusCode::OK);
        assert!(client.dispatcher().running_calls_count() <= 2);
        completed += 1;
    }
    assert_eq!(completed, 6);
}

fn multi_homed(server: &MockServer) -> (Url, Arc<StaticResolver>) {
    let port = server.address().port();
    // Nothing listens on 127.0.0.2; the mock server is bound to 127.0.0.1
    let resolver = StaticResolver::new().with_host(
        "multi.test",
        vec![
            SocketAddr::from(([127, 0, 0, 2], port)),
            SocketAddr::from(([127, 0, 0, 1], port)),
        ],
    );
    let url = Url::parse(&format!("http://multi.test:{port}/")).unwrap();
    (url, Arc::new(resolver))
}

#[tokio::test]
async fn test_failed_route_falls_back_to_next() {
    let mock_server = test_utils::mock_server!(StatusCode::OK);
    let (url, resolver) = multi_homed(&mock_server);
    let client = HttpdBuilder::builder()
        .resolver(resolver)
        .build()
        .client()
        .unwrap();

    let call = client.new_call(Request::builder().url(url).build());
    let response = call.execute().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        call.route().unwrap().socket_addr(),
        SocketAddr::from(([127, 0, 0, 1], mock_server.address().port()))
    );
    assert_eq!(client.connection_pool().route_database().len(), 1);
}

#[tokio::test]
async fn test_without_retries_first_failure_is_final() {
    let mock_server = test_utils::mock_server!(StatusCode::OK);
    let (url, resolver) = multi_homed(&mock_server);
    let client = HttpdBuilder::builder()
        .resolver(resolver)
        .retry_on_connection_failure(false)
        .build()
        .client()
        .unwrap();

    let result = client
        .new_call(Request::builder().url(url).build())
        .execute()
        .await;
    assert!(matches!(result, Err(ErrorKind::Connect { .. })));
}

#[tokio::test]
async fn test_exhausted_routes_fail_after_each_was_tried_once() {
    let mock_server = test_utils::mock_server!(StatusCode::OK);
    let port = mock_server.address().port();
    let unreachable: Vec<SocketAddr> = (2..=4)
        .map(|last| SocketAddr::from(([127, 0, 0, last], port)))
        .collect();
    let resolver = StaticResolver::new().with_host("dead.test", unreachable.clone());
    let client = HttpdBuilder::builder()
        .resolver(Arc::new(resolver))
        .build()
        .client()
        .unwrap();

    let url = Url::parse(&format!("http://dead.test:{port}/")).unwrap();
    let result = client
        .new_call(Request::builder().url(url).build())
        .execute()
        .await;
    assert!(matches!(result, Err(ErrorKind::Connect { .. })));
    assert_eq!(
        client.connection_pool().route_database().len(),
        unreachable.len()
    );
}

#[tokio::test]
async fn test_unknown_host() {
    let client = HttpdBuilder::builder()
        .resolver(Arc::new(StaticResolver::new()))
        .build()
        .client()
        .unwrap();
    let result = client
        .new_call(Request::get("http://nowhere.test/").unwrap())
        .execute()
        .await;
    assert!(matches!(result, Err(ErrorKind::UnknownHost(_))));
}

#[tokio::test]
async fn test_basic_auth_challenge() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(header("authorization", "Basic YWxpY2U6c2VjcmV0"))
        .respond_with(ResponseTemplate::new(StatusCode::OK))
        .with_priority(1)
        .expect(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(StatusCode::UNAUTHORIZED))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = HttpdBuilder::builder()
        .authenticator(Arc::new(httpd_lib::auth::BasicAuthenticator::new(
            "alice", "secret",
        )))
        .build()
        .client()
        .unwrap();
    let response = client
        .new_call(Request::get(&mock_server.uri()).unwrap())
        .execute()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_post_sends_body() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/upload"))
        .and(body_string("payload"))
        .and(header("content-length", "7"))
        .respond_with(ResponseTemplate::new(StatusCode::CREATED))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = HttpdBuilder::default().client().unwrap();
    let request = Request::builder()
        .url(url(&mock_server, "/upload"))
        .method(Method::POST)
        .body("payload")
        .build();
    let response = client.new_call(request).execute().await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
}

#[tokio::test]
async fn test_cached_response_skips_network() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(StatusCode::OK).set_body_string("fresh"))
        .expect(1)
        .mount(&mock_server)
        .await;

    let cache = Arc::new(MemoryCache::new());
    let client = HttpdBuilder::builder()
        .cache(cache.clone())
        .build()
        .client()
        .unwrap();
    for _ in 0..2 {
        let response = client
            .new_call(Request::get(&mock_server.uri()).unwrap())
            .execute()
            .await
            .unwrap();
        assert_eq!(response.text(), "fresh");
    }
    assert_eq!(cache.len(), 1);
}

/// Records the connection each network exchange ran on
#[derive(Debug, Default)]
struct ConnectionRecorder {
    seen: Mutex<Vec<(u64, Protocol)>>,
}

#[async_trait]
impl Interceptor for ConnectionRecorder {
    async fn intercept(&self, chain: Chain<'_>) -> Result<Response> {
        let connection = chain.connection().expect("network stages have a connection");
        self.seen
            .lock()
            .unwrap()
            .push((connection.id(), connection.protocol()));
        chain.proceed(chain.request().clone()).await
    }
}

#[tokio::test]
async fn test_network_interceptor_sees_every_exchange() {
    let mock_server = test_utils::redirect_chain_mock_server!(2);
    let recorder = Arc::new(ConnectionRecorder::default());
    let client = HttpdBuilder::builder()
        .network_interceptors(vec![recorder.clone() as Arc<dyn Interceptor>])
        .build()
        .client()
        .unwrap();

    client
        .new_call(Request::builder().url(url(&mock_server, "/hop/0")).build())
        .execute()
        .await
        .unwrap();

    let seen = recorder.seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 3);
    assert!(seen.iter().all(|(id, protocol)| *id == seen[0].0 && *protocol == Protocol::Http11));
}
