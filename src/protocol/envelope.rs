//! Envelope definitions
//!
//! Defines every message kind exchanged with the cluster. Envelopes are
//! immutable once built; the bridge moves them between queues whole.

use std::fmt;

use ciborium::Value;
use serde::{Deserialize, Serialize};

/// Operation codes carried in the `Op` tag of every envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Op {
    Info = 0,
    ServerConnected = 1,
    ServerDisconnected = 2,
    ServerResponse = 3,
    Connect = 4,
    Disconnect = 5,
    Command = 6,
    Packet = 7,
    DiscordCode = 8,
    AuthSucceeded = 9,
    AuthFailed = 10,
    Chat = 11,
}

impl Op {
    pub fn from_code(code: i128) -> Option<Self> {
        let op = match code {
            0 => Op::Info,
            1 => Op::ServerConnected,
            2 => Op::ServerDisconnected,
            3 => Op::ServerResponse,
            4 => Op::Connect,
            5 => Op::Disconnect,
            6 => Op::Command,
            7 => Op::Packet,
            8 => Op::DiscordCode,
            9 => Op::AuthSucceeded,
            10 => Op::AuthFailed,
            11 => Op::Chat,
            _ => return None,
        };
        Some(op)
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    /// Authentication envelopes are opaque to the bridge
    pub fn is_auth(self) -> bool {
        matches!(self, Op::DiscordCode | Op::AuthSucceeded | Op::AuthFailed)
    }
}

/// Game message kind found at the head of a packet's data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PacketKind(pub i32);

impl PacketKind {
    pub const SPAWN: PacketKind = PacketKind(18);
    pub const MAP_CHANGE: PacketKind = PacketKind(22);
    pub const ITEM_LIST: PacketKind = PacketKind(36);

    /// Read the leading compact integer of a game packet.
    ///
    /// One signed byte, where `-128` escapes to a little-endian i16 and
    /// `-127` to a little-endian i32. Returns `None` for empty or truncated
    /// data.
    pub fn read(data: &[u8]) -> Option<Self> {
        let (&first, rest) = data.split_first()?;
        let value = match first as i8 {
            -128 => {
                let bytes: [u8; 2] = rest.get(..2)?.try_into().ok()?;
                i16::from_le_bytes(bytes) as i32
            }
            -127 => {
                let bytes: [u8; 4] = rest.get(..4)?.try_into().ok()?;
                i32::from_le_bytes(bytes)
            }
            small => small as i32,
        };
        Some(PacketKind(value))
    }
}

impl fmt::Display for PacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            PacketKind::SPAWN => write!(f, "N_SPAWN"),
            PacketKind::MAP_CHANGE => write!(f, "N_MAPCHANGE"),
            PacketKind::ITEM_LIST => write!(f, "N_ITEMLIST"),
            PacketKind(other) => write!(f, "kind {}", other),
        }
    }
}

/// A discovered remote server advertised in an `Info` envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEntry {
    pub host: String,
    pub port: u16,
    /// Raw server info blob handed to the runtime as-is
    pub info: Vec<u8>,
}

impl ServerEntry {
    #[cfg(test)]
    pub fn new(host: impl Into<String>, port: u16, info: Vec<u8>) -> Self {
        Self {
            host: host.into(),
            port,
            info,
        }
    }
}

/// An authentication envelope, kept as its raw tag map
#[derive(Debug, Clone, PartialEq)]
pub struct AuthEnvelope {
    pub op: Op,
    /// Every tag other than `Op`, in wire order
    pub fields: Vec<(String, Value)>,
}

impl AuthEnvelope {
    pub fn new(op: Op) -> Self {
        Self {
            op,
            fields: Vec::new(),
        }
    }

    #[cfg(test)]
    pub fn with_field(mut self, tag: impl Into<String>, value: Value) -> Self {
        self.fields.push((tag.into(), value));
        self
    }

    #[cfg(test)]
    pub fn field(&self, tag: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|(name, _)| name == tag)
            .map(|(_, value)| value)
    }
}

/// All envelope kinds
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    /// Server lists advertised by the cluster and the master server
    Info {
        cluster: Vec<ServerEntry>,
        master: Vec<ServerEntry>,
    },

    /// Ask the cluster to join a server (or `lobby`)
    Connect { target: String },

    /// Leave the current server
    Disconnect,

    /// The cluster attached us to a game server
    ServerConnected {
        server: String,
        internal: bool,
        owned: bool,
    },

    /// The game server dropped us
    ServerDisconnected {
        reason: u16,
        message: Option<String>,
    },

    /// Answer to a `Command`
    ServerResponse {
        id: u16,
        payload: String,
        success: bool,
    },

    /// Cluster command, answered out of band by `ServerResponse`
    Command { text: String, id: u16 },

    /// Game packet on an ENet channel. Only `data[..length]` is meaningful.
    Packet {
        channel: u16,
        data: Vec<u8>,
        length: u32,
    },

    /// Chat line from the cluster
    Chat { message: String },

    /// Authentication traffic, forwarded untouched
    Auth(AuthEnvelope),
}

impl Envelope {
    /// Build a packet whose length covers all of `data`
    pub fn packet(channel: u16, data: Vec<u8>) -> Self {
        let length = data.len() as u32;
        Envelope::Packet {
            channel,
            data,
            length,
        }
    }

    pub fn op(&self) -> Op {
        match self {
            Envelope::Info { .. } => Op::Info,
            Envelope::Connect { .. } => Op::Connect,
            Envelope::Disconnect => Op::Disconnect,
            Envelope::ServerConnected { .. } => Op::ServerConnected,
            Envelope::ServerDisconnected { .. } => Op::ServerDisconnected,
            Envelope::ServerResponse { .. } => Op::ServerResponse,
            Envelope::Command { .. } => Op::Command,
            Envelope::Packet { .. } => Op::Packet,
            Envelope::Chat { .. } => Op::Chat,
            Envelope::Auth(auth) => auth.op,
        }
    }

    /// The meaningful bytes of a packet
    pub fn payload(&self) -> Option<&[u8]> {
        match self {
            Envelope::Packet { data, length, .. } => data.get(..*length as usize),
            _ => None,
        }
    }

    /// Game message kind of a packet, if it has a readable one
    pub fn packet_kind(&self) -> Option<PacketKind> {
        self.payload().and_then(PacketKind::read)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_codes() {
        for code in 0..=11 {
            let op = Op::from_code(code).unwrap();
            assert_eq!(op.code() as i128, code);
        }
        assert!(Op::from_code(12).is_none());
        assert!(Op::from_code(-1).is_none());
        assert!(Op::AuthFailed.is_auth());
        assert!(!Op::Chat.is_auth());
    }

    #[test]
    fn test_read_packet_kind() {
        assert_eq!(PacketKind::read(&[22, 1, 2]), Some(PacketKind::MAP_CHANGE));
        assert_eq!(PacketKind::read(&[0xFF]), Some(PacketKind(-1)));
        assert_eq!(PacketKind::read(&[0x80, 0x2C, 0x01]), Some(PacketKind(300)));
        assert_eq!(
            PacketKind::read(&[0x81, 0x00, 0x00, 0x01, 0x00]),
            Some(PacketKind(65536))
        );
        assert_eq!(PacketKind::read(&[]), None);
        assert_eq!(PacketKind::read(&[0x80, 0x01]), None);
    }

    #[test]
    fn test_packet_kind_respects_length() {
        let envelope = Envelope::Packet {
            channel: 1,
            data: vec![36, 9, 9],
            length: 0,
        };
        assert_eq!(envelope.packet_kind(), None);
        assert_eq!(Envelope::packet(1, vec![36, 9]).packet_kind(), Some(PacketKind::ITEM_LIST));
    }

    #[test]
    fn test_auth_field_lookup() {
        let auth = AuthEnvelope::new(Op::AuthSucceeded)
            .with_field("Code", Value::Text("abc".to_string()));
        assert_eq!(auth.field("Code"), Some(&Value::Text("abc".to_string())));
        assert!(auth.field("Missing").is_none());
        assert_eq!(Envelope::Auth(auth).op(), Op::AuthSucceeded);
    }
}
