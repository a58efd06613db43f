//! Pluggable name resolution.
//!
//! The route selector asks a [`Resolve`] implementation for the socket
//! addresses of a host. Resolution itself is delegated to the operating
//! system by default.

use std::collections::HashMap;
use std::fmt::Debug;
use std::net::SocketAddr;

use async_trait::async_trait;
use log::trace;

use crate::{ErrorKind, Result};

/// Turns a hostname into an ordered list of socket addresses.
#[async_trait]
pub trait Resolve: Send + Sync + Debug {
    /// Resolve `host`, attaching `port` to every returned address.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::UnknownHost`] if the host has no address.
    async fn resolve(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>>;
}

/// Resolver backed by the system's `getaddrinfo`.
#[derive(Debug, Default, Clone, Copy)]
pub struct GaiResolver;

#[async_trait]
impl Resolve for GaiResolver {
    async fn resolve(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>> {
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| {
                trace!("Lookup of {host} failed: {e}");
                ErrorKind::UnknownHost(host.to_string())
            })?
            .collect();

        if addrs.is_empty() {
            return Err(ErrorKind::UnknownHost(host.to_string()));
        }
        Ok(addrs)
    }
}

/// Resolver answering from a fixed table, for pinning hosts to addresses.
///
/// Ports in the table are replaced by the requested port.
#[derive(Debug, Default, Clone)]
pub struct StaticResolver {
    hosts: HashMap<String, Vec<SocketAddr>>,
}

impl StaticResolver {
    /// Create an empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `host` to `addrs`, in order
    #[must_use]
    pub fn with_host(mut self, host: &str, addrs: Vec<SocketAddr>) -> Self {
        self.hosts.insert(host.to_ascii_lowercase(), addrs);
        self
    }
}

#[async_trait]
impl Resolve for StaticResolver {
    async fn resolve(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>> {
        match self.hosts.get(&host.to_ascii_lowercase()) {
            Some(addrs) if !addrs.is_empty() => Ok(addrs
                .iter()
                .map(|addr| SocketAddr::new(addr.ip(), port))
                .collect()),
            _ => Err(ErrorKind::UnknownHost(host.to_string())),
        }
    }
}
