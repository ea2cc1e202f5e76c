//! Cluster client
//!
//! Opens the connection in the background so the bridge can start queueing
//! outbound envelopes before the stream exists.

use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::Instrument;
use uuid::Uuid;

use super::connection::{run_connection, Connection, ConnectionEvent, ConnectionLink, LinkPeer};
use super::NetworkConfig;

/// Client errors
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection timeout")]
    Timeout,
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Resolve and connect within the configured timeout
pub async fn connect_stream(config: &NetworkConfig) -> ClientResult<Connection> {
    let addr = super::resolve_host(&config.host, config.port).await?;
    tracing::info!("Connecting to {}", addr);

    let stream = tokio::time::timeout(
        Duration::from_millis(config.connect_timeout_ms),
        TcpStream::connect(addr),
    )
    .await
    .map_err(|_| ClientError::Timeout)??;

    stream.set_nodelay(true)?;
    Ok(Connection::new(stream, addr))
}

/// Start connecting and return the bridge's end of the link immediately.
///
/// Must be called from within a tokio runtime. The link reports `Open` once
/// the stream is up, or `Closed` if connecting fails.
pub fn open_link(config: NetworkConfig) -> (Uuid, ConnectionLink) {
    let session_id = Uuid::new_v4();
    let (link, peer) = ConnectionLink::pair();
    let span = tracing::info_span!("session", id = %session_id);

    tokio::spawn(run_client(config, peer).instrument(span));

    (session_id, link)
}

async fn run_client(config: NetworkConfig, peer: LinkPeer) {
    match connect_stream(&config).await {
        Ok(conn) => {
            tracing::info!("Connected to {}", conn.remote_addr());
            run_connection(conn, peer).await;
        }
        Err(e) => {
            tracing::error!("Failed to connect to {}:{}: {}", config.host, config.port, e);
            let _ = peer.events.send(ConnectionEvent::Closed {
                reason: e.to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Envelope;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_open_link_reaches_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let (_session, mut link) = open_link(NetworkConfig::new("127.0.0.1", port));
        let (stream, peer_addr) = listener.accept().await.unwrap();
        let mut remote = Connection::new(stream, peer_addr);

        assert_eq!(link.events.recv().await, Some(ConnectionEvent::Open));

        remote.send(&Envelope::Chat { message: "welcome".to_string() }).await.unwrap();
        assert_eq!(
            link.events.recv().await,
            Some(ConnectionEvent::Message(Envelope::Chat { message: "welcome".to_string() }))
        );
    }

    #[tokio::test]
    async fn test_refused_connection_reports_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let (_session, mut link) = open_link(NetworkConfig::new("127.0.0.1", port));
        match link.events.recv().await {
            Some(ConnectionEvent::Closed { .. }) => {}
            other => panic!("Expected close, got {:?}", other),
        }
    }
}
