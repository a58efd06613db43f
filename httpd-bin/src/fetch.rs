use http::{HeaderMap, Method};
use httpd_lib::{ErrorKind, Httpd, Request, Response};
use log::{debug, error};
use tokio::sync::mpsc;
use url::Url;

use crate::ExitCode;

/// Enqueue a call per URL on the client's dispatcher and print each outcome
/// as it completes.
///
/// A call counts as failed if it ends in an error or with a `4xx` or `5xx`
/// status.
pub(crate) async fn fetch(
    client: &Httpd,
    urls: &[String],
    method: &Method,
    headers: &HeaderMap,
) -> ExitCode {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut failed = false;

    for raw in urls {
        let url = match Url::parse(raw) {
            Ok(url) => url,
            Err(e) => {
                println!("{}", format_error(raw, &ErrorKind::from(e)));
                failed = true;
                continue;
            }
        };
        let request = Request::builder()
            .url(url)
            .method(method.clone())
            .headers(headers.clone())
            .build();
        let call = client.new_call(request);
        debug!("Enqueueing call {} for {raw}", call.id());

        let tx = tx.clone();
        let raw_url = raw.clone();
        if let Err(e) = call.enqueue(move |result| {
            // The receiver outlives every enqueued call
            let _ = tx.send((raw_url, result));
        }) {
            error!("Cannot enqueue {raw}: {e}");
            failed = true;
        }
    }
    drop(tx);

    while let Some((url, result)) = rx.recv().await {
        match result {
            Ok(response) => {
                println!("{}", format_response(&url, &response));
                failed |= is_failure(&response);
            }
            Err(e) => {
                println!("{}", format_error(&url, &e));
                failed = true;
            }
        }
    }

    if failed {
        ExitCode::FetchFailure
    } else {
        ExitCode::Success
    }
}

fn is_failure(response: &Response) -> bool {
    response.status().is_client_error() || response.status().is_server_error()
}

fn format_response(url: &str, response: &Response) -> String {
    let redirects = response.redirects();
    match redirects.count() {
        0 => format!("{} {url}", response.status()),
        1 => format!("{} {url} (1 redirect: {redirects})", response.status()),
        n => format!("{} {url} ({n} redirects: {redirects})", response.status()),
    }
}

fn format_error(url: &str, error: &ErrorKind) -> String {
    format!("ERROR {url} ({error})")
}
