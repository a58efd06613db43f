//! The contracts the engine needs from a TLS provider.
//!
//! Handshakes are delegated to a [`TlsConnect`] implementation; peer
//! identity checks to a [`HostnameVerifier`]. With the `rustls-tls` feature
//! (on by default) [`RustlsConnector`] provides both halves of the default
//! behavior.

use std::fmt::Debug;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::address::{ConnectionSpec, TlsVersion};
use crate::{Protocol, Result};

/// A bidirectional byte stream the codecs can run on.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Io for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// An owned, type-erased stream
pub type BoxedIo = Box<dyn Io>;

/// An established TLS session over a socket.
pub struct TlsSession {
    /// The encrypted stream
    pub io: BoxedIo,
    /// The protocol selected through ALPN, if the server chose one
    pub protocol: Option<Protocol>,
    /// The negotiated TLS version
    pub version: Option<TlsVersion>,
    /// DER-encoded peer certificates, leaf first
    pub peer_certificates: Vec<Vec<u8>>,
}

impl Debug for TlsSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsSession")
            .field("protocol", &self.protocol)
            .field("version", &self.version)
            .field("peer_certificates", &self.peer_certificates.len())
            .finish_non_exhaustive()
    }
}

/// Creates TLS sessions on connected sockets.
#[async_trait]
pub trait TlsConnect: Send + Sync + Debug {
    /// Perform a client handshake for `host` on `io`, restricted to the TLS
    /// versions of `spec` and offering `alpn` protocols.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::Tls`](crate::ErrorKind::Tls) on handshake failure,
    /// [`ErrorKind::PeerUnverified`](crate::ErrorKind::PeerUnverified) if the
    /// certificate chain is rejected.
    async fn connect(
        &self,
        io: BoxedIo,
        host: &str,
        spec: ConnectionSpec,
        alpn: &[Protocol],
    ) -> Result<TlsSession>;
}

/// Decides whether the peer certificates identify `host`.
pub trait HostnameVerifier: Send + Sync + Debug {
    /// `true` if the session may be used for `host`
    fn verify(&self, host: &str, peer_certificates: &[Vec<u8>]) -> bool;
}

/// Accepts any session that presented certificates.
///
/// Chain and name validation already happen inside the default TLS
/// provider's handshake.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHostnameVerifier;

impl HostnameVerifier for DefaultHostnameVerifier {
    fn verify(&self, _host: &str, peer_certificates: &[Vec<u8>]) -> bool {
        !peer_certificates.is_empty()
    }
}

#[cfg(feature = "rustls-tls")]
pub use self::rustls_connector::RustlsConnector;

#[cfg(feature = "rustls-tls")]
mod rustls_connector {
    use std::io;
    use std::sync::Arc;

    use async_trait::async_trait;
    use dashmap::DashMap;
    use log::debug;
    use tokio_rustls::TlsConnector;
    use tokio_rustls::rustls::pki_types::ServerName;
    use tokio_rustls::rustls::{
        self, ClientConfig, ProtocolVersion, RootCertStore, SupportedProtocolVersion,
    };

    use super::{BoxedIo, TlsConnect, TlsSession};
    use crate::address::{ConnectionSpec, TlsVersion};
    use crate::{ErrorKind, Protocol, Result};

    /// [`TlsConnect`] backed by rustls and the Mozilla root store.
    #[derive(Debug)]
    pub struct RustlsConnector {
        roots: Arc<RootCertStore>,
        configs: DashMap<(ConnectionSpec, Vec<Protocol>), Arc<ClientConfig>>,
    }

    impl Default for RustlsConnector {
        fn default() -> Self {
            let mut roots = RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            Self::with_roots(roots)
        }
    }

    impl RustlsConnector {
        /// Trust the Mozilla root certificates
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Trust only the given roots
        #[must_use]
        pub fn with_roots(roots: RootCertStore) -> Self {
            Self {
                roots: Arc::new(roots),
                configs: DashMap::new(),
            }
        }

        pub(super) fn config(&self, spec: ConnectionSpec, alpn: &[Protocol]) -> Result<Arc<ClientConfig>> {
            let key = (spec, alpn.to_vec());
            if let Some(config) = self.configs.get(&key) {
                return Ok(Arc::clone(&config));
            }

            let versions: Vec<&'static SupportedProtocolVersion> = spec
                .tls_versions()
                .iter()
                .map(|version| match version {
                    TlsVersion::Tls12 => &rustls::version::TLS12,
                    TlsVersion::Tls13 => &rustls::version::TLS13,
                })
                .collect();

            let mut config = ClientConfig::builder_with_provider(Arc::new(
                rustls::crypto::ring::default_provider(),
            ))
            .with_protocol_versions(&versions)
            .map_err(|e| ErrorKind::Tls(e.to_string()))?
            .with_root_certificates(Arc::clone(&self.roots))
            .with_no_client_auth();
            config.alpn_protocols = alpn
                .iter()
                .filter_map(|protocol| protocol.alpn_id())
                .map(<[u8]>::to_vec)
                .collect();

            let config = Arc::new(config);
            self.configs.insert(key, Arc::clone(&config));
            Ok(config)
        }
    }

    #[async_trait]
    impl TlsConnect for RustlsConnector {
        async fn connect(
            &self,
            io: BoxedIo,
            host: &str,
            spec: ConnectionSpec,
            alpn: &[Protocol],
        ) -> Result<TlsSession> {
            let config = self.config(spec, alpn)?;
            let server_name = ServerName::try_from(host.to_string())
                .map_err(|e| ErrorKind::Tls(format!("invalid server name {host}: {e}")))?;

            let stream = TlsConnector::from(config)
                .connect(server_name, io)
                .await
                .map_err(|e| handshake_error(host, &e))?;

            let (_, session) = stream.get_ref();
            let protocol = session.alpn_protocol().and_then(Protocol::from_alpn);
            let version = match session.protocol_version() {
                Some(ProtocolVersion::TLSv1_3) => Some(TlsVersion::Tls13),
                Some(ProtocolVersion::TLSv1_2) => Some(TlsVersion::Tls12),
                _ => None,
            };
            let peer_certificates = session
                .peer_certificates()
                .map(|certs| certs.iter().map(|cert| cert.as_ref().to_vec()).collect())
                .unwrap_or_default();
            debug!("TLS session with {host}: {version:?}, ALPN {protocol:?}");

            Ok(TlsSession {
                io: Box::new(stream),
                protocol,
                version,
                peer_certificates,
            })
        }
    }

    fn handshake_error(host: &str, error: &io::Error) -> ErrorKind {
        let rejected = error
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<rustls::Error>())
            .is_some_and(|e| matches!(e, rustls::Error::InvalidCertificate(_)));
        if rejected {
            ErrorKind::PeerUnverified(host.to_string())
        } else {
            ErrorKind::Tls(error.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{DefaultHostnameVerifier, HostnameVerifier};

    #[test]
    fn test_default_verifier_requires_certificates() {
        assert!(!DefaultHostnameVerifier.verify("example.com", &[]));
        assert!(DefaultHostnameVerifier.verify("example.com", &[vec![0x30]]));
    }

    #[cfg(feature = "rustls-tls")]
    #[test]
    fn test_rustls_config_is_cached_per_spec() {
        use super::RustlsConnector;
        use crate::{ConnectionSpec, Protocol};

        let connector = RustlsConnector::new();
        let alpn = [Protocol::Http2, Protocol::Http11];
        let first = connector.config(ConnectionSpec::ModernTls, &alpn).unwrap();
        let second = connector.config(ConnectionSpec::ModernTls, &alpn).unwrap();
        assert!(std::sync::Arc::ptr_eq(&first, &second));
        assert_eq!(
            first.alpn_protocols,
            vec![b"h2".to_vec(), b"http/1.1".to_vec()]
        );

        let restricted = connector
            .config(ConnectionSpec::RestrictedTls, &alpn)
            .unwrap();
        assert!(!std::sync::Arc::ptr_eq(&first, &restricted));
    }
}
