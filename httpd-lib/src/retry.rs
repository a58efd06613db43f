use std::io;

use crate::ErrorKind;

/// An extension trait to decide whether a failed exchange may be replayed
/// on a fresh connection.
///
/// Adapted from `Retryable` in [reqwest-middleware].
///
/// [reqwest-middleware]: https://github.com/TrueLayer/reqwest-middleware/blob/f854725791ccf4a02c401a26cab3d9db753f468c/reqwest-retry/src/retryable.rs
pub(crate) trait RetryExt {
    fn should_retry(&self) -> bool;
}

impl RetryExt for hyper::Error {
    fn should_retry(&self) -> bool {
        // The hyper::Error(IncompleteMessage) is raised if the HTTP
        // response is well formatted but does not contain all the
        // bytes. This happens when a pooled connection was closed by the
        // server while it sat idle.
        //
        // Instead hyper::Error(Canceled) is raised when the connection is
        // gracefully closed on the server side before the request was sent.
        if self.is_incomplete_message() || self.is_canceled() {
            true
        } else if self.is_parse() || self.is_user() {
            false
        } else if let Some(io_error) = get_source_error_type::<io::Error>(self) {
            should_retry_io(io_error)
        } else {
            false
        }
    }
}

impl RetryExt for ErrorKind {
    fn should_retry(&self) -> bool {
        match self {
            Self::Network(e) => e.should_retry(),
            Self::Io(e) => should_retry_io(e),
            // Connect errors are only reported once every route was tried.
            // Timeouts, cancellation and TLS verdicts are final.
            _ => false,
        }
    }
}

/// Classifies an `io::Error` into retryable or not.
fn should_retry_io(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}

/// Downcasts the given err source into T.
fn get_source_error_type<T: std::error::Error + 'static>(
    err: &dyn std::error::Error,
) -> Option<&T> {
    let mut source = err.source();

    while let Some(err) = source {
        if let Some(typed) = err.downcast_ref::<T>() {
            return Some(typed);
        }

        source = err.source();
    }
    None
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::RetryExt;
    use crate::ErrorKind;

    #[test]
    fn test_should_retry() {
        assert!(ErrorKind::Io(io::ErrorKind::ConnectionReset.into()).should_retry());
        assert!(ErrorKind::Io(io::ErrorKind::BrokenPipe.into()).should_retry());
        assert!(!ErrorKind::Io(io::ErrorKind::PermissionDenied.into()).should_retry());
        assert!(!ErrorKind::Timeout.should_retry());
        assert!(!ErrorKind::Cancelled.should_retry());
        assert!(!ErrorKind::PeerUnverified("example.com".into()).should_retry());
        assert!(
            !ErrorKind::connect("127.0.0.1:80", ErrorKind::Io(io::ErrorKind::ConnectionReset.into()))
                .should_retry()
        );
    }
}
