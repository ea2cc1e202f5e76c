//! Network module - Handles the TCP stream to the cluster
//!
//! Provides:
//! - The framed envelope connection
//! - A client that opens the connection in the background and hands the
//!   bridge its end of the link

mod client;
mod connection;

pub use client::*;
pub use connection::*;

use std::net::SocketAddr;

/// Configuration for network operations
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Cluster host name or address
    pub host: String,
    /// Port to connect to
    pub port: u16,
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: crate::protocol::DEFAULT_PORT,
            connect_timeout_ms: 5000,
        }
    }
}

impl NetworkConfig {
    #[cfg(test)]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }
}

/// Resolve a hostname to a socket address
pub async fn resolve_host(host: &str, port: u16) -> std::io::Result<SocketAddr> {
    use tokio::net::lookup_host;

    let addr_string = format!("{}:{}", host, port);
    let mut addrs = lookup_host(&addr_string).await?;

    addrs.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Could not resolve host: {}", host),
        )
    })
}
