//! `test-utils` is used for testing in both `httpd-lib` and `httpd-bin`.
//! This crate does not depend on `httpd-lib` or `httpd-bin`, else we would get dependency cycles.
//! Macros are used instead, so that the importer is responsible for providing the dependencies
//! (`wiremock`, `http` and `url`).

/// Create a mock web server, which responds with a predefined status when
/// handling a matching request
#[macro_export]
macro_rules! mock_server {
    ($status:expr $(, $func:tt ($($arg:expr),*))*) => {{
        let mock_server = wiremock::MockServer::start().await;
        let response_template = wiremock::ResponseTemplate::new(http::StatusCode::from($status));
        let template = response_template$(.$func($($arg),*))*;
        wiremock::Mock::given(wiremock::matchers::method("GET")).respond_with(template).mount(&mock_server).await;
        mock_server
    }};
}

/// Set up a mock server with a single hop: `/redirect` answers `307` with a
/// `Location` of `/ok`, which answers `200 OK`. Each route must be hit
/// exactly once.
///
/// `$f` receives both absolute URLs and is awaited while the server runs.
#[macro_export]
macro_rules! redirecting_mock_server {
    ($f:expr) => {{
        async {
            let mock_server = wiremock::MockServer::start().await;
            let url = |path: &str| url::Url::parse(&format!("{}{path}", mock_server.uri())).unwrap();
            let (redirect_url, ok_url) = (url("/redirect"), url("/ok"));

            let routes = [
                (
                    "/redirect",
                    wiremock::ResponseTemplate::new(http::StatusCode::TEMPORARY_REDIRECT)
                        .insert_header("Location", ok_url.as_str()),
                ),
                ("/ok", wiremock::ResponseTemplate::new(http::StatusCode::OK)),
            ];
            for (path, template) in routes {
                wiremock::Mock::given(wiremock::matchers::method("GET"))
                    .and(wiremock::matchers::path(path))
                    .respond_with(template)
                    .expect(1)
                    .mount(&mock_server)
                    .await;
            }

            $f(redirect_url, ok_url).await;
        }
    }};
}

/// Set up a mock server where `/hop/{n}` redirects to `/hop/{n + 1}` for
/// `n < $hops` and `/hop/{$hops}` answers `200 OK`.
/// Evaluates to the server; the chain starts at `/hop/0`.
#[macro_export]
macro_rules! redirect_chain_mock_server {
    ($hops:expr) => {{
        let mock_server = wiremock::MockServer::start().await;
        let hops: usize = $hops;
        for hop in 0..hops {
            let redirect = wiremock::ResponseTemplate::new(http::StatusCode::FOUND)
                .insert_header("Location", format!("/hop/{}", hop + 1).as_str());
            wiremock::Mock::given(wiremock::matchers::method("GET"))
                .and(wiremock::matchers::path(format!("/hop/{hop}")))
                .respond_with(redirect)
                .mount(&mock_server)
                .await;
        }
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .and(wiremock::matchers::path(format!("/hop/{hops}")))
            .respond_with(wiremock::ResponseTemplate::new(http::StatusCode::OK))
            .mount(&mock_server)
            .await;
        mock_server
    }};
}

/// Gets the "main" binary name (e.g. `httpd`)
#[macro_export]
macro_rules! main_command {
    () => {
        Command::cargo_bin("httpd").expect("Couldn't get the httpd binary")
    };
}
