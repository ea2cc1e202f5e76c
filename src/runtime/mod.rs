//! Headless runtime
//!
//! Stands in for the embedded game engine when the bridge runs on its own:
//! reads frames the way the engine's ENet shim does, reports world loads
//! finished on the next tick, and keeps the server browser in memory.

use bytes::Buf;

use crate::bridge::{Bridge, Runtime};
use crate::protocol::{enet_event, PacketKind};

/// A frame read back from the poll bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeEvent<'a> {
    Connect,
    Disconnect { reason: u16 },
    Receive { channel: u16, data: &'a [u8] },
}

impl<'a> RuntimeEvent<'a> {
    /// Parse a frame; `None` if it is truncated or has an unknown event code
    pub fn parse(mut frame: &'a [u8]) -> Option<Self> {
        if frame.remaining() < 2 {
            return None;
        }
        match frame.get_u16_le() {
            enet_event::CONNECT => Some(RuntimeEvent::Connect),
            enet_event::DISCONNECT if frame.remaining() >= 2 => Some(RuntimeEvent::Disconnect {
                reason: frame.get_u16_le(),
            }),
            enet_event::RECEIVE if frame.remaining() >= 6 => {
                let channel = frame.get_u16_le();
                let length = frame.get_u32_le() as usize;
                let data = frame.get(..length)?;
                Some(RuntimeEvent::Receive { channel, data })
            }
            _ => None,
        }
    }
}

/// A server the runtime has been told about
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownServer {
    pub host: String,
    pub port: u16,
}

/// Engine stand-in that logs what it receives
#[derive(Debug, Default)]
pub struct HeadlessRuntime {
    ticks: u64,
    boot_ticks: u32,
    servers: Vec<KnownServer>,
    connected: bool,
    packets: u64,
    maps_loaded: u64,
}

impl HeadlessRuntime {
    pub fn new(boot_ticks: u32) -> Self {
        Self {
            boot_ticks,
            ..Default::default()
        }
    }

    pub fn servers(&self) -> &[KnownServer] {
        &self.servers
    }

    #[cfg(test)]
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn packets(&self) -> u64 {
        self.packets
    }

    pub fn maps_loaded(&self) -> u64 {
        self.maps_loaded
    }
}

impl Runtime for HeadlessRuntime {
    fn ingestion_ready(&self) -> bool {
        self.ticks >= self.boot_ticks as u64
    }

    fn inject_server(&mut self, host: &str, port: u16, info: &[u8]) {
        tracing::debug!("Server {}:{} ({} info bytes)", host, port, info.len());
        self.servers.push(KnownServer {
            host: host.to_string(),
            port,
        });
    }

    fn execute(&mut self, command: &str) {
        if command == crate::bridge::SORT_COMMAND {
            self.servers
                .sort_by(|a, b| (&a.host, a.port).cmp(&(&b.host, b.port)));
        }
        tracing::debug!("Runtime command: {}", command);
    }
}

/// Run one engine tick: drain every ready frame, then finish any map load
pub fn tick(bridge: &mut Bridge<HeadlessRuntime>) {
    let booting = !bridge.runtime().ingestion_ready();
    bridge.runtime_mut().ticks += 1;
    if booting && bridge.runtime().ingestion_ready() {
        bridge.runtime_ready();
    }

    let mut connected = None;
    let mut packets = 0;
    let mut map_changed = false;

    while let Some(frame) = bridge.poll() {
        match RuntimeEvent::parse(frame) {
            Some(RuntimeEvent::Connect) => {
                tracing::info!("Runtime: connected to game server");
                connected = Some(true);
            }
            Some(RuntimeEvent::Disconnect { reason }) => {
                tracing::info!("Runtime: disconnected (reason {})", reason);
                connected = Some(false);
            }
            Some(RuntimeEvent::Receive { channel, data }) => {
                packets += 1;
                if let Some(kind) = PacketKind::read(data) {
                    tracing::trace!("Runtime: {} on channel {}", kind, channel);
                    if kind == PacketKind::MAP_CHANGE {
                        map_changed = true;
                    }
                }
            }
            None => tracing::warn!("Runtime: unreadable frame of {} bytes", frame.len()),
        }
    }

    let runtime = bridge.runtime_mut();
    if let Some(connected) = connected {
        runtime.connected = connected;
    }
    runtime.packets += packets;

    if map_changed {
        runtime.maps_loaded += 1;
        bridge.world_ready();
    }
}
