//! Outbound queue
//!
//! Holds encoded envelopes until the connection reports it is open, then
//! writes straight through.

use bytes::Bytes;
use std::collections::VecDeque;
use tokio::sync::mpsc;

use super::{BridgeError, BridgeResult};
use crate::protocol::{encode_envelope, Envelope};

#[derive(Debug)]
enum OutboundState {
    /// Connection not established yet; bodies wait here in send order
    Connecting(VecDeque<Bytes>),
    Open,
    Closed,
}

/// Buffers outbound bodies until the connection is open
#[derive(Debug)]
pub struct OutboundQueue {
    state: OutboundState,
    writer: mpsc::UnboundedSender<Bytes>,
}

impl OutboundQueue {
    pub fn new(writer: mpsc::UnboundedSender<Bytes>) -> Self {
        Self {
            state: OutboundState::Connecting(VecDeque::new()),
            writer,
        }
    }

    /// Encode and send an envelope, or hold it until the connection opens
    pub fn send(&mut self, envelope: &Envelope) -> BridgeResult<()> {
        let body = Bytes::from(encode_envelope(envelope)?);

        match &mut self.state {
            OutboundState::Connecting(pending) => {
                tracing::debug!("Queueing {:?} until connection opens", envelope.op());
                pending.push_back(body);
                Ok(())
            }
            OutboundState::Open => self.write(body),
            OutboundState::Closed => Err(BridgeError::ConnectionClosed),
        }
    }

    /// Flush everything buffered, in order, and switch to write-through
    pub fn open(&mut self) -> BridgeResult<usize> {
        let pending = match std::mem::replace(&mut self.state, OutboundState::Open) {
            OutboundState::Connecting(pending) => pending,
            OutboundState::Open => return Ok(0),
            OutboundState::Closed => {
                self.state = OutboundState::Closed;
                return Err(BridgeError::ConnectionClosed);
            }
        };

        let flushed = pending.len();
        for body in pending {
            self.write(body)?;
        }
        if flushed > 0 {
            tracing::debug!("Flushed {} queued envelopes", flushed);
        }
        Ok(flushed)
    }

    /// Drop anything still buffered; later sends fail
    pub fn close(&mut self) {
        self.state = OutboundState::Closed;
    }

    #[cfg(test)]
    pub fn is_open(&self) -> bool {
        matches!(self.state, OutboundState::Open)
    }

    /// Number of bodies waiting for the connection
    pub fn pending(&self) -> usize {
        match &self.state {
            OutboundState::Connecting(pending) => pending.len(),
            _ => 0,
        }
    }

    fn write(&mut self, body: Bytes) -> BridgeResult<()> {
        if self.writer.send(body).is_err() {
            self.state = OutboundState::Closed;
            return Err(BridgeError::ConnectionClosed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::decode_envelope;

    fn connect(target: &str) -> Envelope {
        Envelope::Connect {
            target: target.to_string(),
        }
    }

    #[test]
    fn test_buffers_until_open() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut queue = OutboundQueue::new(tx);

        queue.send(&connect("lobby")).unwrap();
        queue.send(&Envelope::Disconnect).unwrap();
        assert_eq!(queue.pending(), 2);
        assert!(rx.try_recv().is_err());

        assert_eq!(queue.open().unwrap(), 2);
        assert_eq!(decode_envelope(&rx.try_recv().unwrap()).unwrap(), connect("lobby"));
        assert_eq!(decode_envelope(&rx.try_recv().unwrap()).unwrap(), Envelope::Disconnect);

        queue.send(&connect("ffa")).unwrap();
        assert_eq!(queue.pending(), 0);
        assert_eq!(decode_envelope(&rx.try_recv().unwrap()).unwrap(), connect("ffa"));
    }

    #[test]
    fn test_open_twice_is_harmless() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut queue = OutboundQueue::new(tx);
        assert_eq!(queue.open().unwrap(), 0);
        assert_eq!(queue.open().unwrap(), 0);
        assert!(queue.is_open());
    }

    #[test]
    fn test_send_after_close_fails() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut queue = OutboundQueue::new(tx);
        queue.send(&Envelope::Disconnect).unwrap();
        queue.close();

        assert_eq!(queue.pending(), 0);
        assert!(matches!(
            queue.send(&Envelope::Disconnect),
            Err(BridgeError::ConnectionClosed)
        ));
        assert!(queue.open().is_err());
    }

    #[test]
    fn test_dropped_writer_surfaces_as_closed() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut queue = OutboundQueue::new(tx);
        queue.open().unwrap();
        drop(rx);

        assert!(matches!(
            queue.send(&Envelope::Disconnect),
            Err(BridgeError::ConnectionClosed)
        ));
        assert!(!queue.is_open());
    }
}
