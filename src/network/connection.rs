//! Connection handling
//!
//! Manages the single stream to the cluster, including:
//! - Frame encoding/decoding
//! - Dropping malformed envelopes without losing the stream
//! - Connection statistics

use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::protocol::{decode_envelope, CodecError, Envelope, FrameDecoder, FrameEncoder};

/// Connection errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] CodecError),

    #[error("Connection closed mid-frame")]
    Closed,
}

pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// Notifications from the connection task to the bridge
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// The stream is established; queued sends may flow
    Open,
    /// One decoded envelope
    Message(Envelope),
    /// The stream is gone
    Closed { reason: String },
}

/// The bridge's end of a connection: inbound events and the outbound writer
#[derive(Debug)]
pub struct ConnectionLink {
    pub events: mpsc::UnboundedReceiver<ConnectionEvent>,
    pub outbound: mpsc::UnboundedSender<Bytes>,
}

/// The connection task's end of a link
#[derive(Debug)]
pub struct LinkPeer {
    pub events: mpsc::UnboundedSender<ConnectionEvent>,
    pub outbound: mpsc::UnboundedReceiver<Bytes>,
}

impl ConnectionLink {
    /// Create a connected link/peer pair
    pub fn pair() -> (ConnectionLink, LinkPeer) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        (
            ConnectionLink {
                events: events_rx,
                outbound: outbound_tx,
            },
            LinkPeer {
                events: events_tx,
                outbound: outbound_rx,
            },
        )
    }
}

/// Connection statistics
#[derive(Debug, Default, Clone)]
pub struct ConnectionStats {
    /// Envelopes sent
    pub messages_sent: u64,
    /// Envelopes received
    pub messages_received: u64,
    /// Envelopes dropped as malformed
    pub messages_dropped: u64,
    /// Bytes sent
    pub bytes_sent: u64,
    /// Bytes received
    pub bytes_received: u64,
}

/// A framed envelope stream to the cluster
pub struct Connection<S = TcpStream> {
    /// Remote peer address
    remote_addr: SocketAddr,
    /// The underlying stream
    stream: S,
    encoder: FrameEncoder,
    decoder: FrameDecoder,
    read_buf: BytesMut,
    write_buf: BytesMut,
    stats: ConnectionStats,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Connection<S> {
    /// Wrap an established stream
    pub fn new(stream: S, remote_addr: SocketAddr) -> Self {
        Self {
            remote_addr,
            stream,
            encoder: FrameEncoder::new(),
            decoder: FrameDecoder::new(),
            read_buf: BytesMut::with_capacity(4096),
            write_buf: BytesMut::with_capacity(4096),
            stats: ConnectionStats::default(),
        }
    }

    /// Get the remote address
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Get connection statistics
    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    /// Frame and write an already-encoded envelope body
    pub async fn send_body(&mut self, body: &[u8]) -> ConnectionResult<()> {
        self.write_buf.clear();
        self.encoder.encode_body(body, &mut self.write_buf)?;

        self.stream.write_all(&self.write_buf).await?;
        self.stream.flush().await?;

        self.stats.messages_sent += 1;
        self.stats.bytes_sent += self.write_buf.len() as u64;

        Ok(())
    }

    /// Encode and write an envelope
    pub async fn send(&mut self, envelope: &Envelope) -> ConnectionResult<()> {
        let body = crate::protocol::encode_envelope(envelope)?;
        self.send_body(&body).await
    }

    /// Receive the next well-formed envelope (None on clean close).
    ///
    /// Malformed bodies are logged and skipped; only framing and I/O
    /// failures end the stream.
    pub async fn recv(&mut self) -> ConnectionResult<Option<Envelope>> {
        loop {
            while let Some(body) = self.decoder.decode(&mut self.read_buf)? {
                match decode_envelope(&body) {
                    Ok(envelope) => {
                        self.stats.messages_received += 1;
                        return Ok(Some(envelope));
                    }
                    Err(e) if e.is_fatal() => return Err(e.into()),
                    Err(e) => {
                        self.stats.messages_dropped += 1;
                        tracing::warn!("Dropping envelope from {}: {}", self.remote_addr, e);
                    }
                }
            }

            let mut buf = [0u8; 4096];
            let n = self.stream.read(&mut buf).await?;

            if n == 0 {
                if self.read_buf.is_empty() {
                    return Ok(None); // Clean close
                } else {
                    return Err(ConnectionError::Closed);
                }
            }

            self.read_buf.extend_from_slice(&buf[..n]);
            self.stats.bytes_received += n as u64;
        }
    }

    /// Shut down the write half
    pub async fn close(&mut self) -> ConnectionResult<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

/// Drive a connection until either side goes away.
///
/// Forwards inbound envelopes to the bridge and writes the bridge's
/// outbound bodies. Always reports `Closed` on the way out.
pub async fn run_connection<S>(mut conn: Connection<S>, mut peer: LinkPeer)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if peer.events.send(ConnectionEvent::Open).is_err() {
        return;
    }

    let reason = loop {
        tokio::select! {
            result = conn.recv() => {
                match result {
                    Ok(Some(envelope)) => {
                        tracing::debug!("Received {:?}", envelope.op());
                        if peer.events.send(ConnectionEvent::Message(envelope)).is_err() {
                            break "Bridge dropped".to_string();
                        }
                    }
                    Ok(None) => break "Connection closed by peer".to_string(),
                    Err(e) => break format!("Error: {}", e),
                }
            }

            outbound = peer.outbound.recv() => {
                match outbound {
                    Some(body) => {
                        if let Err(e) = conn.send_body(&body).await {
                            break format!("Send error: {}", e);
                        }
                    }
                    None => break "Bridge dropped".to_string(),
                }
            }
        }
    };

    let _ = conn.close().await;
    let stats = conn.stats();
    tracing::info!(
        sent = stats.messages_sent,
        received = stats.messages_received,
        dropped = stats.messages_dropped,
        bytes_sent = stats.bytes_sent,
        bytes_received = stats.bytes_received,
        "Connection to {} ended: {}",
        conn.remote_addr(),
        reason
    );
    let _ = peer.events.send(ConnectionEvent::Closed { reason });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FrameEncoder;
    use std::time::Duration;
    use tokio::io::duplex;

    fn addr() -> SocketAddr {
        "127.0.0.1:29999".parse().unwrap()
    }

    #[tokio::test]
    async fn test_malformed_envelope_does_not_end_stream() {
        let (client, mut server) = duplex(4096);
        let mut conn = Connection::new(client, addr());

        let mut wire = BytesMut::new();
        let encoder = FrameEncoder::new();
        encoder.encode_body(&[0xA1, 0x62, b'O', b'p', 0x18, 0x63], &mut wire).unwrap();
        encoder
            .encode(&Envelope::Chat { message: "still here".to_string() }, &mut wire)
            .unwrap();
        server.write_all(&wire).await.unwrap();
        drop(server);

        let envelope = conn.recv().await.unwrap();
        assert_eq!(envelope, Some(Envelope::Chat { message: "still here".to_string() }));
        assert_eq!(conn.stats().messages_dropped, 1);
        assert_eq!(conn.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_send_is_framed() {
        let (client, server) = duplex(4096);
        let mut conn = Connection::new(client, addr());
        let mut remote = Connection::new(server, addr());

        conn.send(&Envelope::Connect { target: "lobby".to_string() }).await.unwrap();
        let received = tokio::time::timeout(Duration::from_secs(1), remote.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, Some(Envelope::Connect { target: "lobby".to_string() }));
        assert_eq!(conn.stats().messages_sent, 1);
    }

    #[tokio::test]
    async fn test_run_connection_reports_lifecycle() {
        let (client, server) = duplex(4096);
        let (mut link, peer) = ConnectionLink::pair();
        let mut remote = Connection::new(server, addr());

        let task = tokio::spawn(run_connection(Connection::new(client, addr()), peer));

        assert_eq!(link.events.recv().await, Some(ConnectionEvent::Open));

        remote.send(&Envelope::Chat { message: "hello".to_string() }).await.unwrap();
        assert_eq!(
            link.events.recv().await,
            Some(ConnectionEvent::Message(Envelope::Chat { message: "hello".to_string() }))
        );

        let body = crate::protocol::encode_envelope(&Envelope::Disconnect).unwrap();
        link.outbound.send(Bytes::from(body)).unwrap();
        assert_eq!(remote.recv().await.unwrap(), Some(Envelope::Disconnect));

        drop(remote);
        match link.events.recv().await {
            Some(ConnectionEvent::Closed { .. }) => {}
            other => panic!("Expected close, got {:?}", other),
        }
        task.await.unwrap();
    }
}
