use std::convert::Infallible;
use std::io;

use thiserror::Error;

/// Possible errors when executing calls with `httpd_lib`
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The client or one of its components was configured with invalid values.
    /// This is always reported before any call runs.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// A socket or TLS connection to a route could not be established
    #[error("Failed to connect to {route}: {source}")]
    Connect {
        /// The route that was attempted
        route: String,
        /// The underlying cause
        #[source]
        source: Box<ErrorKind>,
    },

    /// Every route of an address was attempted or none could be produced
    #[error("No route available to {0}")]
    NoRouteAvailable(String),

    /// The name resolver returned no address for a host
    #[error("Unable to resolve host `{0}`")]
    UnknownHost(String),

    /// The TLS provider failed to establish a session
    #[error("TLS handshake failed: {0}")]
    Tls(String),

    /// The hostname verifier rejected the peer certificates
    #[error("Hostname `{0}` not verified by the peer certificates")]
    PeerUnverified(String),

    /// An HTTP proxy refused to open a tunnel
    #[error("Proxy tunnel failed: {0}")]
    ProxyTunnel(String),

    /// A malformed response on an otherwise healthy connection
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Error raised by the HTTP/1.1 or HTTP/2 codec
    #[error("Network error: {0}")]
    Network(#[from] hyper::Error),

    /// Any form of I/O error on a socket
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A single operation exceeded its timeout
    #[error("Timeout")]
    Timeout,

    /// The deadline spanning the whole job elapsed
    #[error("Deadline exceeded")]
    DeadlineExceeded,

    /// A guarded wait was interrupted by cancellation
    #[error("Interrupted")]
    Interrupted,

    /// The call was cancelled
    #[error("Call cancelled")]
    Cancelled,

    /// The follow-up limit was exceeded
    #[error("Too many follow-up requests: {0}")]
    TooManyRedirects(usize),

    /// A call can only be executed once
    #[error("Call already executed")]
    AlreadyExecuted,

    /// No tokio runtime is available to spawn work on
    #[error("No tokio runtime available to execute the call")]
    NoRuntime,

    /// A blocking call was made from a thread driving an async runtime
    #[error("Cannot block on a call from within an async runtime, use `execute` instead")]
    BlockingInRuntime,

    /// The given string can not be parsed into a valid URL
    #[error("Cannot parse URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// An URL without a host was given
    #[error("URL is missing a host")]
    InvalidUrlHost,

    /// The engine only speaks `http` and `https`
    #[error("Unsupported scheme: {0}")]
    UnsupportedScheme(String),

    /// The given header could not be parsed.
    #[error("Header could not be parsed.")]
    InvalidHeader(#[from] http::header::InvalidHeaderValue),
}

impl ErrorKind {
    /// Wrap `source` as a connect failure for the given route.
    pub(crate) fn connect(route: impl ToString, source: ErrorKind) -> Self {
        Self::Connect {
            route: route.to_string(),
            source: Box::new(source),
        }
    }

    /// Returns `true` if this error was caused by a timeout or deadline
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout | Self::DeadlineExceeded => true,
            Self::Connect { source, .. } => source.is_timeout(),
            _ => false,
        }
    }

    /// Returns `true` if the call was cancelled or interrupted
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Interrupted)
    }

    /// Returns the underlying `hyper` error, if any
    #[must_use]
    pub fn hyper_error(&self) -> Option<&hyper::Error> {
        match self {
            Self::Network(e) => Some(e),
            Self::Connect { source, .. } => source.hyper_error(),
            _ => None,
        }
    }
}

impl PartialEq for ErrorKind {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Config(a), Self::Config(b))
            | (Self::NoRouteAvailable(a), Self::NoRouteAvailable(b))
            | (Self::UnknownHost(a), Self::UnknownHost(b))
            | (Self::Tls(a), Self::Tls(b))
            | (Self::PeerUnverified(a), Self::PeerUnverified(b))
            | (Self::ProxyTunnel(a), Self::ProxyTunnel(b))
            | (Self::Protocol(a), Self::Protocol(b))
            | (Self::UnsupportedScheme(a), Self::UnsupportedScheme(b)) => a == b,
            (
                Self::Connect {
                    route: r1,
                    source: s1,
                },
                Self::Connect {
                    route: r2,
                    source: s2,
                },
            ) => r1 == r2 && s1 == s2,
            (Self::Network(e1), Self::Network(e2)) => e1.to_string() == e2.to_string(),
            (Self::Io(e1), Self::Io(e2)) => e1.kind() == e2.kind(),
            (Self::TooManyRedirects(a), Self::TooManyRedirects(b)) => a == b,
            (Self::InvalidUrl(a), Self::InvalidUrl(b)) => a == b,
            (Self::InvalidHeader(_), Self::InvalidHeader(_))
            | (Self::Timeout, Self::Timeout)
            | (Self::DeadlineExceeded, Self::DeadlineExceeded)
            | (Self::Interrupted, Self::Interrupted)
            | (Self::Cancelled, Self::Cancelled)
            | (Self::AlreadyExecuted, Self::AlreadyExecuted)
            | (Self::NoRuntime, Self::NoRuntime)
            | (Self::BlockingInRuntime, Self::BlockingInRuntime)
            | (Self::InvalidUrlHost, Self::InvalidUrlHost) => true,
            _ => false,
        }
    }
}

impl From<tokio::task::JoinError> for ErrorKind {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Io(e.into())
    }
}

impl From<Infallible> for ErrorKind {
    fn from(_: Infallible) -> Self {
        // tautological
        unreachable!()
    }
}

#[cfg(test)]
mod tests {
    use super::ErrorKind;

    #[test]
    fn test_connect_error_keeps_timeout_cause() {
        let err = ErrorKind::connect("127.0.0.1:80", ErrorKind::Timeout);
        assert!(err.is_timeout());
        assert_eq!(
            err.to_string(),
            "Failed to connect to 127.0.0.1:80: Timeout"
        );
    }

    #[test]
    fn test_cancelled_and_interrupted() {
        assert!(ErrorKind::Cancelled.is_cancelled());
        assert!(ErrorKind::Interrupted.is_cancelled());
        assert!(!ErrorKind::Timeout.is_cancelled());
    }
}
