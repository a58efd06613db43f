use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

/// Protocols that the engine can negotiate with a server.
///
/// The string forms are the ALPN identifiers where one exists.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, AsRefStr, Serialize, Deserialize,
)]
pub enum Protocol {
    /// An obsolete plaintext framing. Only ever reported by servers, never
    /// a valid client choice.
    #[strum(serialize = "http/1.0")]
    #[serde(rename = "http/1.0")]
    Http10,
    /// A plaintext framing that includes persistent connections.
    #[strum(serialize = "http/1.1")]
    #[serde(rename = "http/1.1")]
    Http11,
    /// HTTP/2, negotiated through ALPN on TLS connections.
    #[strum(serialize = "h2")]
    #[serde(rename = "h2")]
    Http2,
    /// Cleartext HTTP/2 with no upgrade round trip. The client must know in
    /// advance that the server speaks HTTP/2.
    #[strum(serialize = "h2_prior_knowledge")]
    #[serde(rename = "h2_prior_knowledge")]
    H2PriorKnowledge,
}

impl Protocol {
    /// Whether connections speaking this protocol carry several exchanges
    /// concurrently.
    #[must_use]
    pub const fn is_multiplexed(self) -> bool {
        matches!(self, Self::Http2 | Self::H2PriorKnowledge)
    }

    /// The ALPN identifier sent during the TLS handshake, if any.
    #[must_use]
    pub const fn alpn_id(self) -> Option<&'static [u8]> {
        match self {
            Self::Http11 => Some(b"http/1.1"),
            Self::Http2 => Some(b"h2"),
            Self::Http10 | Self::H2PriorKnowledge => None,
        }
    }

    /// Map a negotiated ALPN identifier back to a protocol.
    #[must_use]
    pub fn from_alpn(id: &[u8]) -> Option<Self> {
        match id {
            b"http/1.0" => Some(Self::Http10),
            b"http/1.1" => Some(Self::Http11),
            b"h2" => Some(Self::Http2),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Protocol;
    use std::str::FromStr;

    #[test]
    fn test_protocol_names() {
        assert_eq!(Protocol::Http11.to_string(), "http/1.1");
        assert_eq!(
            Protocol::from_str("h2_prior_knowledge").unwrap(),
            Protocol::H2PriorKnowledge
        );
        assert!(Protocol::from_str("spdy/3.1").is_err());
    }

    #[test]
    fn test_alpn() {
        assert_eq!(Protocol::from_alpn(b"h2"), Some(Protocol::Http2));
        assert_eq!(Protocol::H2PriorKnowledge.alpn_id(), None);
        assert!(Protocol::Http2.is_multiplexed());
        assert!(!Protocol::Http11.is_multiplexed());
    }
}
