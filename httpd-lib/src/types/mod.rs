#![allow(unreachable_pub)]

mod error;
mod protocol;
mod request;
mod response;

pub use error::ErrorKind;
pub use protocol::Protocol;
pub use request::Request;
pub use response::{Redirects, Response};

/// The httpd `Result` type
pub type Result<T> = std::result::Result<T, crate::ErrorKind>;
