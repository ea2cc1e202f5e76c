//! Poll bridge
//!
//! Serializes the head of the ready queue into the frame layout the runtime
//! reads on each tick. All integers are little-endian:
//!
//! ```text
//! connect:    | event u16 |
//! disconnect: | event u16 | reason u16 |
//! receive:    | event u16 | channel u16 | length u32 | data (length bytes) |
//! ```

use bytes::BufMut;

use super::gate::WorldLoadGate;
use crate::protocol::{enet_event, Envelope};

/// Growth-only byte region backing every returned frame
#[derive(Debug, Default)]
pub struct ScratchBuffer {
    buf: Vec<u8>,
    reallocations: u64,
}

impl ScratchBuffer {
    /// Borrow `size` bytes, replacing the region only if it is too small
    fn region(&mut self, size: usize) -> &mut [u8] {
        if size > self.buf.len() {
            self.buf = vec![0u8; size];
            self.reallocations += 1;
        }
        &mut self.buf[..size]
    }

    #[cfg(test)]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    #[cfg(test)]
    pub fn as_ptr(&self) -> *const u8 {
        self.buf.as_ptr()
    }

    pub fn reallocations(&self) -> u64 {
        self.reallocations
    }
}

/// Size of the frame for an envelope, or `None` if it has no frame layout.
///
/// A packet whose declared length overruns its data has none.
pub fn frame_len(envelope: &Envelope) -> Option<usize> {
    match envelope {
        Envelope::ServerConnected { .. } => Some(2),
        Envelope::ServerDisconnected { .. } => Some(2 + 2),
        Envelope::Packet { .. } => envelope.payload().map(|data| 2 + 2 + 4 + data.len()),
        _ => None,
    }
}

fn write_frame(envelope: &Envelope, mut out: &mut [u8]) {
    match envelope {
        Envelope::ServerConnected { .. } => out.put_u16_le(enet_event::CONNECT),
        Envelope::ServerDisconnected { reason, .. } => {
            out.put_u16_le(enet_event::DISCONNECT);
            out.put_u16_le(*reason);
        }
        Envelope::Packet { channel, .. } => {
            let data = envelope.payload().unwrap_or_default();
            out.put_u16_le(enet_event::RECEIVE);
            out.put_u16_le(*channel);
            out.put_u32_le(data.len() as u32);
            out.put_slice(data);
        }
        _ => {}
    }
}

/// Drains the ready queue one frame at a time
#[derive(Debug, Default)]
pub struct PollBridge {
    scratch: ScratchBuffer,
    delivered: u64,
    skipped: u64,
}

impl PollBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pop the next deliverable envelope and return its frame.
    ///
    /// Never blocks. The frame borrows the scratch buffer and is gone on the
    /// next call. Envelopes without a frame layout are logged and skipped.
    pub fn poll(&mut self, gate: &mut WorldLoadGate) -> Option<&[u8]> {
        loop {
            let envelope = gate.pop_ready()?;
            let Some(size) = frame_len(&envelope) else {
                tracing::warn!("No runtime frame for {:?}, skipping", envelope.op());
                self.skipped += 1;
                continue;
            };

            write_frame(&envelope, self.scratch.region(size));
            self.delivered += 1;
            return Some(&self.scratch.buf[..size]);
        }
    }

    pub fn scratch(&self) -> &ScratchBuffer {
        &self.scratch
    }

    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    pub fn skipped(&self) -> u64 {
        self.skipped
    }
}
