//! `httpd` is a pooled, multiplexed HTTP/1.1 and HTTP/2 client engine.
//! "Hello world" example:
//! ```no_run
//! use httpd_lib::{Httpd, Request, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!   let client = Httpd::default();
//!   let response = client
//!       .new_call(Request::get("https://example.com")?)
//!       .execute()
//!       .await?;
//!   println!("{} {}", response.status(), response.protocol());
//!   Ok(())
//! }
//! ```
//!
//! For more specific use-cases you can configure the engine yourself,
//! using the `HttpdBuilder`, and run calls on its dispatcher:
//!
//! ```no_run
//! use std::time::Duration;
//! use httpd_lib::{HttpdBuilder, Request, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!   let client = HttpdBuilder::builder()
//!       .call_timeout(Duration::from_secs(10))
//!       .max_requests_per_host(2usize)
//!       .build()
//!       .client()?;
//!   let (tx, rx) = tokio::sync::oneshot::channel();
//!   client
//!       .new_call(Request::get("https://example.com")?)
//!       .enqueue(move |result| { let _ = tx.send(result); })?;
//!   let response = rx.await.expect("callback runs exactly once")?;
//!   assert!(response.is_success());
//!   Ok(())
//! }
//! ```
// #![deny(missing_docs)]

mod call;
mod chain;
mod client;
mod config;
mod connection;
mod interceptor;
mod retry;
mod types;

pub mod address;
pub mod auth;
pub mod cache;
pub mod dispatcher;
pub mod dns;
pub mod pool;
pub mod proxy;
pub mod route;
pub mod timeout;
pub mod tls;

pub use address::{Address, ConnectionSpec, TlsVersion};
pub use call::{Call, CallState};
pub use chain::{Chain, Interceptor};
pub use client::{DEFAULT_MAX_REDIRECTS, DEFAULT_TIMEOUT, DEFAULT_USER_AGENT, Httpd, HttpdBuilder};
pub use config::HttpdConfig;
pub use connection::Connection;
pub use dispatcher::{Dispatcher, Executor, HostKey, TokioExecutor};
pub use interceptor::DEFAULT_MAX_RETRIES;
pub use pool::{ConnectionLease, ConnectionPool};
pub use route::{Route, RouteDatabase, RouteSelector};
pub use timeout::Timeout;
pub use types::*;
