//! Reference mission message database.
//!
//! A small TOML description of a target's telemetry: one `[[message]]` per
//! telemetry packet with its topic, raw topic id and payload layout. It is the
//! source of the [`TopicMap`] the registry is built from and implements
//! [`TelemetryCodec`] for the receive loop.
//!
//! ```toml
//! mission = "samplemission"
//! target = "cpu1"
//! byte_order = "little"
//!
//! [[message]]
//! topic = "CFE_ES/Application/HousekeepingTlm"
//! topic_id = 88
//! fields = [
//!     { name = "CommandCounter", type = "u8" },
//!     { name = "CommandErrorCounter", type = "u8" },
//!     { name = "Spare", type = "u8", count = 2 },
//! ]
//! ```

use crate::codec::{
    CodecError, DecodedMessage, PrimaryHeader, SchemaEntry, SecondaryHeader, TelemetryCodec,
    Value, PRIMARY_HEADER_LEN, SECONDARY_HEADER_LEN,
};
use crate::topic::{parse_topic, TopicMap, ROUTING_KEY_OFFSET, TOPIC_TLM_TITLE_KEY};
use ahash::AHashMap;
use anyhow::{Context, Result};
use bytes::Bytes;
use serde::Deserialize;
use std::path::Path;
use tokio::fs;
use tracing::debug;

/// Largest payload a CCSDS packet can carry after its headers.
const MAX_PAYLOAD_LEN: usize = 65535;

/// Byte order of payload fields. Headers are always big-endian.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ByteOrder {
    #[default]
    Little,
    Big,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    U64,
    I64,
    F32,
    F64,
    String,
}

impl FieldType {
    fn size(self) -> usize {
        match self {
            FieldType::U8 | FieldType::I8 => 1,
            FieldType::U16 | FieldType::I16 => 2,
            FieldType::U32 | FieldType::I32 | FieldType::F32 => 4,
            FieldType::U64 | FieldType::I64 | FieldType::F64 => 8,
            FieldType::String => 1,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct FieldDef {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    /// Number of elements; decoded as an array when present
    pub count: Option<usize>,
    /// Byte length of a `string` field
    pub length: Option<usize>,
}

impl FieldDef {
    fn element_size(&self) -> usize {
        match self.field_type {
            FieldType::String => self.length.unwrap_or(0),
            t => t.size(),
        }
    }

    /// Bytes the field occupies in a payload; `None` on overflow.
    fn encoded_size(&self) -> Option<usize> {
        self.element_size().checked_mul(self.count.unwrap_or(1))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct MessageDef {
    pub topic: String,
    pub topic_id: u16,
    #[serde(default)]
    pub fields: Vec<FieldDef>,
}

impl MessageDef {
    /// Total encoded size of all fields; `None` on overflow.
    fn payload_len(&self) -> Option<usize> {
        self.fields
            .iter()
            .try_fold(0usize, |total, f| total.checked_add(f.encoded_size()?))
    }

    /// Schema name, `APP/MSG`.
    fn schema_name(&self) -> String {
        match parse_topic(&self.topic) {
            Ok((app, msg)) => format!("{}/{}", app, msg),
            Err(_) => self.topic.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct MissionFile {
    #[serde(default)]
    mission: String,
    #[serde(default)]
    target: String,
    #[serde(default)]
    byte_order: ByteOrder,
    #[serde(default)]
    message: Vec<MessageDef>,
}

/// Telemetry message database for one mission target.
#[derive(Debug)]
pub struct MissionDb {
    mission: String,
    target: String,
    byte_order: ByteOrder,
    messages: Vec<MessageDef>,
    by_app_id: AHashMap<u16, usize>,
}

impl MissionDb {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read mission database {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Failed to load mission database {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let file: MissionFile =
            toml::from_str(content).context("Failed to parse mission database")?;
        Self::from_messages(file.mission, file.target, file.byte_order, file.message)
    }

    pub fn from_messages(
        mission: impl Into<String>,
        target: impl Into<String>,
        byte_order: ByteOrder,
        messages: Vec<MessageDef>,
    ) -> Result<Self> {
        let mut by_app_id = AHashMap::new();
        let mut topics = std::collections::HashSet::new();

        for (i, msg) in messages.iter().enumerate() {
            parse_topic(&msg.topic)
                .with_context(|| format!("message {} has an invalid topic", i))?;
            if !topics.insert(msg.topic.to_uppercase()) {
                anyhow::bail!("Duplicate topic {} (message {})", msg.topic, i);
            }
            let app_id = msg
                .topic_id
                .checked_add(ROUTING_KEY_OFFSET)
                .filter(|id| *id <= 0x07FF)
                .with_context(|| {
                    format!("topic_id {} of {} does not fit an application id", msg.topic_id, msg.topic)
                })?;
            if by_app_id.insert(app_id, i).is_some() {
                anyhow::bail!("Duplicate application id {} ({})", app_id, msg.topic);
            }
            for field in &msg.fields {
                if field.field_type == FieldType::String && field.length.unwrap_or(0) == 0 {
                    anyhow::bail!(
                        "String field {} of {} needs a non-zero length",
                        field.name,
                        msg.topic
                    );
                }
                if field.count == Some(0) {
                    anyhow::bail!("Field {} of {} has count 0", field.name, msg.topic);
                }
            }
            match msg.payload_len() {
                Some(len) if len <= MAX_PAYLOAD_LEN => {}
                _ => anyhow::bail!(
                    "Fields of {} exceed the maximum payload of {} bytes",
                    msg.topic,
                    MAX_PAYLOAD_LEN
                ),
            }
        }

        Ok(Self {
            mission: mission.into(),
            target: target.into(),
            byte_order,
            messages,
            by_app_id,
        })
    }

    pub fn mission(&self) -> &str {
        &self.mission
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn messages(&self) -> &[MessageDef] {
        &self.messages
    }

    /// Topic mapping for the registry. Like the ground system's topic lists,
    /// it starts with the reserved title entry.
    pub fn topic_map(&self) -> TopicMap {
        let mut map = TopicMap::new();
        map.insert(TOPIC_TLM_TITLE_KEY, 0);
        for msg in &self.messages {
            map.insert(msg.topic.clone(), msg.topic_id);
        }
        map
    }

    fn decode_payload(&self, def: &MessageDef, bytes: &[u8]) -> Result<Value, CodecError> {
        let needed = def
            .payload_len()
            .ok_or_else(|| CodecError::Malformed(format!("{} has an oversized layout", def.topic)))?;
        if bytes.len() < needed {
            return Err(CodecError::Truncated {
                region: "payload",
                needed,
                available: bytes.len(),
            });
        }

        let mut offset = 0;
        let mut fields = Vec::with_capacity(def.fields.len());
        for field in &def.fields {
            let size = field.element_size();
            let value = match field.count {
                Some(count) => {
                    let items = (0..count)
                        .map(|i| {
                            let start = offset + i * size;
                            self.decode_scalar(field, &bytes[start..start + size])
                        })
                        .collect();
                    Value::Array(items)
                }
                None => self.decode_scalar(field, &bytes[offset..offset + size]),
            };
            offset += size * field.count.unwrap_or(1);
            fields.push((field.name.clone(), value));
        }
        Ok(Value::Container(fields))
    }

    fn decode_scalar(&self, field: &FieldDef, b: &[u8]) -> Value {
        macro_rules! read {
            ($t:ty) => {{
                let mut arr = [0u8; std::mem::size_of::<$t>()];
                arr.copy_from_slice(b);
                match self.byte_order {
                    ByteOrder::Little => <$t>::from_le_bytes(arr),
                    ByteOrder::Big => <$t>::from_be_bytes(arr),
                }
            }};
        }

        match field.field_type {
            FieldType::U8 => Value::Unsigned(b[0].into()),
            FieldType::I8 => Value::Signed((b[0] as i8).into()),
            FieldType::U16 => Value::Unsigned(read!(u16).into()),
            FieldType::I16 => Value::Signed(read!(i16).into()),
            FieldType::U32 => Value::Unsigned(read!(u32).into()),
            FieldType::I32 => Value::Signed(read!(i32).into()),
            FieldType::U64 => Value::Unsigned(read!(u64)),
            FieldType::I64 => Value::Signed(read!(i64)),
            FieldType::F32 => Value::Float(read!(f32).into()),
            FieldType::F64 => Value::Float(read!(f64)),
            FieldType::String => {
                let end = b.iter().position(|&c| c == 0).unwrap_or(b.len());
                Value::Text(String::from_utf8_lossy(&b[..end]).into_owned())
            }
        }
    }
}

impl TelemetryCodec for MissionDb {
    fn decode(&self, datagram: &[u8]) -> Result<(SchemaEntry, DecodedMessage), CodecError> {
        let primary = PrimaryHeader::parse(datagram)?;
        if primary.packet_type != 0 {
            return Err(CodecError::Malformed(format!(
                "application id {} is a command packet",
                primary.app_id
            )));
        }
        if !primary.has_secondary_header {
            return Err(CodecError::Malformed(format!(
                "application id {} has no secondary header",
                primary.app_id
            )));
        }
        if datagram.len() < primary.packet_len() {
            return Err(CodecError::Truncated {
                region: "packet",
                needed: primary.packet_len(),
                available: datagram.len(),
            });
        }

        let def = self
            .by_app_id
            .get(&primary.app_id)
            .map(|&i| &self.messages[i])
            .ok_or(CodecError::UnknownMessage(primary.app_id))?;

        let packet = &datagram[..primary.packet_len()];
        let secondary = SecondaryHeader::parse(&packet[PRIMARY_HEADER_LEN..])?;
        let payload =
            self.decode_payload(def, &packet[PRIMARY_HEADER_LEN + SECONDARY_HEADER_LEN..])?;

        debug!("Decoded {} ({} bytes)", def.topic, packet.len());

        Ok((
            SchemaEntry::new(def.schema_name()),
            DecodedMessage {
                primary,
                secondary,
                payload,
                raw: Bytes::copy_from_slice(packet),
            },
        ))
    }
}

/// Builds a telemetry packet with correct primary header length; used by
/// tooling and tests that need to originate traffic.
pub fn build_packet(app_id: u16, sequence: u16, seconds: u32, payload: &[u8]) -> Vec<u8> {
    let total = PRIMARY_HEADER_LEN + SECONDARY_HEADER_LEN + payload.len();
    let primary = PrimaryHeader {
        version: 0,
        packet_type: 0,
        has_secondary_header: true,
        app_id,
        sequence_flags: 3,
        sequence_count: sequence,
        length: (total.saturating_sub(7)).min(usize::from(u16::MAX)) as u16,
    };
    let secondary = SecondaryHeader {
        seconds,
        subseconds: 0,
    };
    let mut packet = Vec::with_capacity(total);
    packet.extend_from_slice(&primary.to_bytes());
    packet.extend_from_slice(&secondary.to_bytes());
    packet.extend_from_slice(payload);
    packet
}
