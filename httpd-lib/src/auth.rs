use std::fmt::Debug;
use std::str::FromStr;

use headers::Authorization;
use headers::authorization::Credentials;
use http::StatusCode;
use http::header::{AUTHORIZATION, PROXY_AUTHORIZATION};
use log::debug;
use secrecy::{ExposeSecret, SecretString};

use crate::route::Route;
use crate::{ErrorKind, Request, Response};

/// Answers authentication challenges.
///
/// Consulted by the follow-up stage for `401 Unauthorized` (origin
/// authenticator) and `407 Proxy Authentication Required` (proxy
/// authenticator), and while opening proxy tunnels.
pub trait Authenticator: Send + Sync + Debug {
    /// A request carrying credentials for the challenge in `response`, or
    /// `None` to give up and return `response` to the caller.
    fn authenticate(
        &self,
        route: Option<&Route>,
        request: &Request,
        response: &Response,
    ) -> Option<Request>;
}

/// Responds to challenges with HTTP basic credentials.
///
/// Gives up when the challenged request already carried credentials, so a
/// wrong password fails instead of looping.
#[derive(Debug, Clone)]
pub struct BasicAuthenticator {
    username: String,
    password: SecretString,
}

impl BasicAuthenticator {
    /// Credentials for `username`
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: SecretString::from(password.into()),
        }
    }

    /// The username
    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    fn to_authorization(&self) -> Authorization<headers::authorization::Basic> {
        Authorization::basic(&self.username, self.password.expose_secret())
    }
}

/// Parses `<username>:<password>`.
impl FromStr for BasicAuthenticator {
    type Err = ErrorKind;

    fn from_str(credentials: &str) -> Result<Self, Self::Err> {
        let parts: Vec<_> = credentials.trim().split(':').collect();
        match parts.as_slice() {
            [username, password] if !username.is_empty() && !password.is_empty() => {
                Ok(Self::new(*username, *password))
            }
            [_, _] => Err(ErrorKind::Config(
                "basic auth username and password must not be empty".into(),
            )),
            _ => Err(ErrorKind::Config(
                "invalid basic auth credentials, expected '<username>:<password>'".into(),
            )),
        }
    }
}

impl Authenticator for BasicAuthenticator {
    fn authenticate(
        &self,
        _route: Option<&Route>,
        request: &Request,
        response: &Response,
    ) -> Option<Request> {
        let header = match response.status() {
            StatusCode::PROXY_AUTHENTICATION_REQUIRED => PROXY_AUTHORIZATION,
            StatusCode::UNAUTHORIZED => AUTHORIZATION,
            _ => return None,
        };
        if request.headers().contains_key(&header) {
            debug!("Credentials for {} were rejected", self.username);
            return None;
        }

        let mut authenticated = request.clone();
        authenticated
            .headers_mut()
            .insert(header, self.to_authorization().0.encode());
        Some(authenticated)
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use bytes::Bytes;
    use http::{HeaderMap, StatusCode};

    use super::{Authenticator, BasicAuthenticator};
    use crate::{ErrorKind, Protocol, Request, Response};

    fn challenge(status: StatusCode) -> Response {
        Response::new(
            "http://example.com/".parse().unwrap(),
            status,
            Protocol::Http11,
            HeaderMap::new(),
            Bytes::new(),
        )
    }

    #[test]
    fn test_parse_credentials() {
        let auth = BasicAuthenticator::from_str("alice:secret").unwrap();
        assert_eq!(auth.username(), "alice");
        assert!(matches!(
            BasicAuthenticator::from_str("alice"),
            Err(ErrorKind::Config(_))
        ));
        assert!(matches!(
            BasicAuthenticator::from_str("alice:"),
            Err(ErrorKind::Config(_))
        ));
    }

    #[test]
    fn test_answers_challenge_once() {
        let auth = BasicAuthenticator::new("alice", "secret");
        let request = Request::get("http://example.com/").unwrap();

        let retried = auth
            .authenticate(None, &request, &challenge(StatusCode::UNAUTHORIZED))
            .unwrap();
        assert_eq!(
            retried.header("authorization"),
            Some("Basic YWxpY2U6c2VjcmV0")
        );
        assert!(
            auth.authenticate(None, &retried, &challenge(StatusCode::UNAUTHORIZED))
                .is_none()
        );
    }

    #[test]
    fn test_proxy_challenge() {
        let auth = BasicAuthenticator::new("alice", "secret");
        let request = Request::get("http://example.com/").unwrap();
        let retried = auth
            .authenticate(
                None,
                &request,
                &challenge(StatusCode::PROXY_AUTHENTICATION_REQUIRED),
            )
            .unwrap();
        assert!(retried.header("proxy-authorization").is_some());
        assert!(retried.header("authorization").is_none());
    }
}
