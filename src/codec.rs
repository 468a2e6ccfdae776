//! Decoder boundary between raw telemetry datagrams and routed messages.
//!
//! The server never interprets payload bytes itself. A [`TelemetryCodec`]
//! turns a datagram into a [`SchemaEntry`] (what the message is) and a
//! [`DecodedMessage`] (CCSDS primary header, cFE telemetry secondary header and
//! a payload [`Value`] tree). The routing key is read from
//! [`PrimaryHeader::app_id`].

use crate::topic::RoutingKey;
use bytes::Bytes;
use std::fmt;
use thiserror::Error;

/// Size of the CCSDS space packet primary header.
pub const PRIMARY_HEADER_LEN: usize = 6;

/// Size of the cFE telemetry secondary header (4-byte seconds, 2-byte subseconds).
pub const SECONDARY_HEADER_LEN: usize = 6;

/// Errors produced while decoding a datagram.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CodecError {
    /// Datagram ends before a required region
    #[error("Datagram truncated: {region} needs {needed} bytes, {available} available")]
    Truncated {
        /// Region being decoded
        region: &'static str,
        /// Bytes required
        needed: usize,
        /// Bytes present
        available: usize,
    },

    /// No schema entry for the application id in the header
    #[error("No telemetry definition for application id {0}")]
    UnknownMessage(u16),

    /// Header or layout content that cannot be interpreted
    #[error("Malformed datagram: {0}")]
    Malformed(String),
}

/// Turns raw datagrams into decoded telemetry.
///
/// Implementations are shared between the receive loop and any tooling
/// (raw-datagram observers), so they must be thread safe.
pub trait TelemetryCodec: Send + Sync {
    fn decode(&self, datagram: &[u8]) -> Result<(SchemaEntry, DecodedMessage), CodecError>;
}

/// Schema metadata for a decoded message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaEntry {
    /// Human readable schema name, e.g. `CFE_ES/HousekeepingTlm`
    pub name: String,
}

impl SchemaEntry {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// CCSDS space packet primary header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrimaryHeader {
    pub version: u8,
    /// 0 = telemetry, 1 = command
    pub packet_type: u8,
    pub has_secondary_header: bool,
    /// 11-bit application process identifier; the routing key
    pub app_id: u16,
    pub sequence_flags: u8,
    pub sequence_count: u16,
    /// Packet data length field (total packet length minus 7)
    pub length: u16,
}

impl PrimaryHeader {
    /// Decodes the big-endian primary header from the start of `bytes`.
    pub fn parse(bytes: &[u8]) -> Result<Self, CodecError> {
        let b = bytes.get(..PRIMARY_HEADER_LEN).ok_or(CodecError::Truncated {
            region: "primary header",
            needed: PRIMARY_HEADER_LEN,
            available: bytes.len(),
        })?;
        let word0 = u16::from_be_bytes([b[0], b[1]]);
        let word1 = u16::from_be_bytes([b[2], b[3]]);
        Ok(Self {
            version: (word0 >> 13) as u8,
            packet_type: ((word0 >> 12) & 0x1) as u8,
            has_secondary_header: (word0 >> 11) & 0x1 == 1,
            app_id: word0 & 0x07FF,
            sequence_flags: (word1 >> 14) as u8,
            sequence_count: word1 & 0x3FFF,
            length: u16::from_be_bytes([b[4], b[5]]),
        })
    }

    /// Encodes the header; the inverse of [`PrimaryHeader::parse`].
    pub fn to_bytes(&self) -> [u8; PRIMARY_HEADER_LEN] {
        let word0 = (u16::from(self.version & 0x7) << 13)
            | (u16::from(self.packet_type & 0x1) << 12)
            | (u16::from(self.has_secondary_header) << 11)
            | (self.app_id & 0x07FF);
        let word1 = (u16::from(self.sequence_flags & 0x3) << 14) | (self.sequence_count & 0x3FFF);
        let [a, b] = word0.to_be_bytes();
        let [c, d] = word1.to_be_bytes();
        let [e, f] = self.length.to_be_bytes();
        [a, b, c, d, e, f]
    }

    /// Total packet length declared by the header.
    pub fn packet_len(&self) -> usize {
        usize::from(self.length) + 7
    }

    pub fn routing_key(&self) -> RoutingKey {
        RoutingKey(self.app_id)
    }
}

/// cFE telemetry secondary header time stamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SecondaryHeader {
    pub seconds: u32,
    /// Fraction of a second in units of 2^-16 s
    pub subseconds: u16,
}

impl SecondaryHeader {
    pub fn parse(bytes: &[u8]) -> Result<Self, CodecError> {
        let b = bytes
            .get(..SECONDARY_HEADER_LEN)
            .ok_or(CodecError::Truncated {
                region: "secondary header",
                needed: SECONDARY_HEADER_LEN,
                available: bytes.len(),
            })?;
        Ok(Self {
            seconds: u32::from_be_bytes([b[0], b[1], b[2], b[3]]),
            subseconds: u16::from_be_bytes([b[4], b[5]]),
        })
    }

    pub fn to_bytes(&self) -> [u8; SECONDARY_HEADER_LEN] {
        let [a, b, c, d] = self.seconds.to_be_bytes();
        let [e, f] = self.subseconds.to_be_bytes();
        [a, b, c, d, e, f]
    }

    pub fn seconds_f64(&self) -> f64 {
        f64::from(self.seconds) + f64::from(self.subseconds) / 65536.0
    }
}

/// Introspectable decoded field tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Container(Vec<(String, Value)>),
    Array(Vec<Value>),
    Unsigned(u64),
    Signed(i64),
    Float(f64),
    Text(String),
}

impl Value {
    pub fn is_container(&self) -> bool {
        matches!(self, Value::Container(_))
    }

    pub fn is_array(&self) -> bool {
        matches!(self, Value::Array(_))
    }

    /// Looks up a direct child of a container by name.
    pub fn field(&self, name: &str) -> Option<&Value> {
        match self {
            Value::Container(fields) => fields.iter().find(|(n, _)| n == name).map(|(_, v)| v),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Unsigned(v) => write!(f, "{}", v),
            Value::Signed(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Text(v) => write!(f, "{}", v),
            Value::Array(items) => write!(f, "[{} items]", items.len()),
            Value::Container(fields) => write!(f, "{{{} fields}}", fields.len()),
        }
    }
}

/// A fully decoded telemetry datagram.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedMessage {
    pub primary: PrimaryHeader,
    pub secondary: SecondaryHeader,
    pub payload: Value,
    /// The datagram the message was decoded from
    pub raw: Bytes,
}

impl DecodedMessage {
    pub fn routing_key(&self) -> RoutingKey {
        self.primary.routing_key()
    }

    /// Whole message as a value tree: `CCSDS`, `Sec` and `Payload` containers.
    pub fn to_value(&self) -> Value {
        let p = &self.primary;
        Value::Container(vec![
            (
                "CCSDS".to_string(),
                Value::Container(vec![
                    ("Version".to_string(), Value::Unsigned(p.version.into())),
                    ("PacketType".to_string(), Value::Unsigned(p.packet_type.into())),
                    (
                        "SecHdrFlags".to_string(),
                        Value::Unsigned(p.has_secondary_header.into()),
                    ),
                    ("AppId".to_string(), Value::Unsigned(p.app_id.into())),
                    ("SeqFlag".to_string(), Value::Unsigned(p.sequence_flags.into())),
                    ("Sequence".to_string(), Value::Unsigned(p.sequence_count.into())),
                    ("Length".to_string(), Value::Unsigned(p.length.into())),
                ]),
            ),
            (
                "Sec".to_string(),
                Value::Container(vec![
                    ("Seconds".to_string(), Value::Unsigned(self.secondary.seconds.into())),
                    (
                        "Subseconds".to_string(),
                        Value::Unsigned(self.secondary.subseconds.into()),
                    ),
                ]),
            ),
            ("Payload".to_string(), self.payload.clone()),
        ])
    }
}
