//! Protocol codec for encoding/decoding envelopes
//!
//! Two layers: envelope bodies are CBOR maps keyed by short text tags, and
//! bodies are framed on the stream behind a magic + length header.

use bytes::{Buf, BufMut, BytesMut};
use ciborium::value::Integer;
use ciborium::Value;
use std::io;
use thiserror::Error;

use super::{AuthEnvelope, Envelope, Op, ServerEntry, COMMAND_ID_SPACE, MAGIC_BYTES};

/// Maximum body size (10 MB)
const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Header size: magic(4) + length(4) = 8 bytes
const HEADER_SIZE: usize = 8;

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Invalid magic bytes")]
    InvalidMagic,

    #[error("Message too large: {0} bytes (max: {1})")]
    MessageTooLarge(usize, usize),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("Encoding failed: {0}")]
    Encode(String),
}

impl CodecError {
    /// Whether the stream itself can no longer be trusted.
    ///
    /// A malformed body only costs that one envelope; bad framing desyncs
    /// everything after it.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CodecError::InvalidMagic | CodecError::MessageTooLarge(..) | CodecError::Io(_)
        )
    }
}

pub type CodecResult<T> = Result<T, CodecError>;

fn malformed(message: impl Into<String>) -> CodecError {
    CodecError::MalformedEnvelope(message.into())
}

fn text(value: &str) -> Value {
    Value::Text(value.to_string())
}

fn int<T: Into<Integer>>(value: T) -> Value {
    Value::Integer(value.into())
}

fn entry_value(entry: &ServerEntry) -> Value {
    Value::Map(vec![
        (text("Host"), text(&entry.host)),
        (text("Port"), int(entry.port)),
        (text("Info"), Value::Bytes(entry.info.clone())),
        (text("Length"), int(entry.info.len() as u64)),
    ])
}

/// Serialize an envelope into a CBOR body
pub fn encode_envelope(envelope: &Envelope) -> CodecResult<Vec<u8>> {
    let mut map = vec![(text("Op"), int(envelope.op().code()))];

    match envelope {
        Envelope::Info { cluster, master } => {
            map.push((text("Cluster"), Value::Array(cluster.iter().map(entry_value).collect())));
            map.push((text("Master"), Value::Array(master.iter().map(entry_value).collect())));
        }
        Envelope::Connect { target } => map.push((text("Target"), text(target))),
        Envelope::Disconnect => {}
        Envelope::ServerConnected {
            server,
            internal,
            owned,
        } => {
            map.push((text("Server"), text(server)));
            map.push((text("Internal"), Value::Bool(*internal)));
            map.push((text("Owned"), Value::Bool(*owned)));
        }
        Envelope::ServerDisconnected { reason, message } => {
            map.push((text("Reason"), int(*reason)));
            if let Some(message) = message {
                map.push((text("Message"), text(message)));
            }
        }
        Envelope::ServerResponse {
            id,
            payload,
            success,
        } => {
            map.push((text("Id"), int(*id)));
            map.push((text("Response"), text(payload)));
            map.push((text("Success"), Value::Bool(*success)));
        }
        Envelope::Command { text: command, id } => {
            map.push((text("Command"), text(command)));
            map.push((text("Id"), int(*id)));
        }
        Envelope::Packet {
            channel,
            data,
            length,
        } => {
            let body = data.get(..*length as usize).ok_or_else(|| {
                CodecError::Encode(format!(
                    "packet length {} exceeds {} data bytes",
                    length,
                    data.len()
                ))
            })?;
            map.push((text("Channel"), int(*channel)));
            map.push((text("Data"), Value::Bytes(body.to_vec())));
            map.push((text("Length"), int(*length)));
        }
        Envelope::Chat { message } => map.push((text("Message"), text(message))),
        Envelope::Auth(auth) => {
            map.extend(auth.fields.iter().map(|(tag, value)| (text(tag), value.clone())));
        }
    }

    let mut out = Vec::new();
    ciborium::ser::into_writer(&Value::Map(map), &mut out)
        .map_err(|e| CodecError::Encode(e.to_string()))?;
    Ok(out)
}

/// Tag lookups over a decoded CBOR map
struct Fields<'a> {
    op: Op,
    entries: &'a [(Value, Value)],
}

impl<'a> Fields<'a> {
    fn get(&self, tag: &str) -> Option<&'a Value> {
        self.entries.iter().find_map(|(key, value)| match key {
            Value::Text(name) if name == tag => Some(value),
            _ => None,
        })
    }

    fn require(&self, tag: &str) -> CodecResult<&'a Value> {
        self.get(tag)
            .ok_or_else(|| malformed(format!("{:?} is missing required tag {}", self.op, tag)))
    }

    fn mistyped(&self, tag: &str, expected: &str) -> CodecError {
        malformed(format!("{:?} tag {} is not {}", self.op, tag, expected))
    }

    fn text(&self, tag: &str) -> CodecResult<String> {
        match self.require(tag)? {
            Value::Text(value) => Ok(value.clone()),
            _ => Err(self.mistyped(tag, "text")),
        }
    }

    fn flag(&self, tag: &str) -> CodecResult<bool> {
        match self.require(tag)? {
            Value::Bool(value) => Ok(*value),
            _ => Err(self.mistyped(tag, "a bool")),
        }
    }

    fn uint<T: TryFrom<i128>>(&self, tag: &str) -> CodecResult<T> {
        match self.require(tag)? {
            Value::Integer(value) => {
                T::try_from(i128::from(*value)).map_err(|_| self.mistyped(tag, "in range"))
            }
            _ => Err(self.mistyped(tag, "an integer")),
        }
    }

    fn bytes(&self, tag: &str) -> CodecResult<Vec<u8>> {
        match self.require(tag)? {
            Value::Bytes(value) => Ok(value.clone()),
            _ => Err(self.mistyped(tag, "bytes")),
        }
    }

    /// Server lists may be absent or null, which both mean empty
    fn servers(&self, tag: &str) -> CodecResult<Vec<ServerEntry>> {
        match self.get(tag) {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(Value::Array(items)) => items.iter().map(|item| self.server(tag, item)).collect(),
            Some(_) => Err(self.mistyped(tag, "an array")),
        }
    }

    fn server(&self, tag: &str, item: &Value) -> CodecResult<ServerEntry> {
        let Value::Map(entries) = item else {
            return Err(self.mistyped(tag, "an array of maps"));
        };
        let entry = Fields {
            op: self.op,
            entries: entries.as_slice(),
        };
        let mut info = entry.bytes("Info")?;
        let length: usize = entry.uint("Length")?;
        if length > info.len() {
            return Err(malformed(format!(
                "server entry length {} exceeds {} info bytes",
                length,
                info.len()
            )));
        }
        info.truncate(length);
        Ok(ServerEntry {
            host: entry.text("Host")?,
            port: entry.uint("Port")?,
            info,
        })
    }
}

/// Parse a CBOR body into an envelope
pub fn decode_envelope(body: &[u8]) -> CodecResult<Envelope> {
    let value: Value = ciborium::de::from_reader(body)
        .map_err(|e| malformed(format!("invalid CBOR: {}", e)))?;

    let Value::Map(entries) = value else {
        return Err(malformed("body is not a map"));
    };

    let op_code = entries
        .iter()
        .find_map(|(key, value)| match (key, value) {
            (Value::Text(name), Value::Integer(code)) if name == "Op" => Some(i128::from(*code)),
            _ => None,
        })
        .ok_or_else(|| malformed("missing integer Op tag"))?;
    let op = Op::from_code(op_code).ok_or_else(|| malformed(format!("unknown Op {}", op_code)))?;

    if op.is_auth() {
        let fields = entries
            .into_iter()
            .filter_map(|(key, value)| match key {
                Value::Text(name) if name != "Op" => Some((name, value)),
                _ => None,
            })
            .collect();
        return Ok(Envelope::Auth(AuthEnvelope { op, fields }));
    }

    let fields = Fields {
        op,
        entries: entries.as_slice(),
    };

    let envelope = match op {
        Op::Info => Envelope::Info {
            cluster: fields.servers("Cluster")?,
            master: fields.servers("Master")?,
        },
        Op::ServerConnected => Envelope::ServerConnected {
            server: fields.text("Server")?,
            internal: fields.flag("Internal")?,
            owned: fields.flag("Owned")?,
        },
        Op::ServerDisconnected => Envelope::ServerDisconnected {
            reason: fields.uint("Reason")?,
            message: match fields.get("Message") {
                Some(Value::Text(message)) => Some(message.clone()),
                _ => None,
            },
        },
        Op::ServerResponse => {
            let id: u16 = fields.uint("Id")?;
            if id >= COMMAND_ID_SPACE {
                return Err(malformed(format!("command id {} out of range", id)));
            }
            Envelope::ServerResponse {
                id,
                payload: fields.text("Response")?,
                success: fields.flag("Success")?,
            }
        }
        Op::Connect => Envelope::Connect {
            target: fields.text("Target")?,
        },
        Op::Disconnect => Envelope::Disconnect,
        Op::Command => {
            let id: u16 = fields.uint("Id")?;
            if id >= COMMAND_ID_SPACE {
                return Err(malformed(format!("command id {} out of range", id)));
            }
            Envelope::Command {
                text: fields.text("Command")?,
                id,
            }
        }
        Op::Packet => {
            let data = fields.bytes("Data")?;
            let length: u32 = fields.uint("Length")?;
            if length as usize > data.len() {
                return Err(malformed(format!(
                    "packet length {} exceeds {} data bytes",
                    length,
                    data.len()
                )));
            }
            Envelope::Packet {
                channel: fields.uint("Channel")?,
                data,
                length,
            }
        }
        Op::Chat => Envelope::Chat {
            message: fields.text("Message")?,
        },
        Op::DiscordCode | Op::AuthSucceeded | Op::AuthFailed => unreachable!("handled above"),
    };

    Ok(envelope)
}

/// Writes framed envelopes into an output buffer
#[derive(Debug, Default)]
pub struct FrameEncoder;

impl FrameEncoder {
    pub fn new() -> Self {
        Self
    }

    /// Frame an already-encoded body
    pub fn encode_body(&self, body: &[u8], buf: &mut BytesMut) -> CodecResult<()> {
        if body.len() > MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(body.len(), MAX_MESSAGE_SIZE));
        }

        buf.reserve(HEADER_SIZE + body.len());
        buf.put_slice(&MAGIC_BYTES);
        buf.put_u32(body.len() as u32);
        buf.put_slice(body);
        Ok(())
    }

    /// Encode and frame an envelope
    pub fn encode(&self, envelope: &Envelope, buf: &mut BytesMut) -> CodecResult<()> {
        let body = encode_envelope(envelope)?;
        self.encode_body(&body, buf)
    }
}

/// Splits framed bodies out of a read buffer
pub struct FrameDecoder {
    state: DecodeState,
}

#[derive(Default)]
enum DecodeState {
    #[default]
    Header,
    Body {
        length: usize,
    },
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            state: DecodeState::Header,
        }
    }

    /// Attempt to split one complete body off the buffer.
    /// Returns Ok(None) if more data is needed.
    pub fn decode(&mut self, buf: &mut BytesMut) -> CodecResult<Option<BytesMut>> {
        loop {
            match self.state {
                DecodeState::Header => {
                    if buf.len() < HEADER_SIZE {
                        return Ok(None);
                    }

                    if buf[0..4] != MAGIC_BYTES {
                        return Err(CodecError::InvalidMagic);
                    }

                    let length = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
                    if length > MAX_MESSAGE_SIZE {
                        return Err(CodecError::MessageTooLarge(length, MAX_MESSAGE_SIZE));
                    }

                    buf.advance(HEADER_SIZE);
                    self.state = DecodeState::Body { length };
                }
                DecodeState::Body { length } => {
                    if buf.len() < length {
                        return Ok(None);
                    }

                    let body = buf.split_to(length);
                    self.state = DecodeState::Header;
                    return Ok(Some(body));
                }
            }
        }
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}
