//! Packet decoder: (topic, payload) -> typed packet, "ignored", or a DecodeError.
//! Pure; nothing here touches a store.

use std::fmt;

use crate::identity::NodeId;
use crate::protocol::{MeshPacket, PacketKind};
use crate::{json, wire};

/// Successful decode outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Packet(MeshPacket),
    /// Well-formed but not something we aggregate (unknown type, stat topic, ...).
    Ignored { reason: String },
}

/// Malformed payload. Carries the raw bytes for diagnostics.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind} ({} raw bytes)", .raw.len())]
pub struct DecodeError {
    pub kind: DecodeErrorKind,
    pub raw: Vec<u8>,
}

impl DecodeError {
    pub fn new(kind: DecodeErrorKind, raw: &[u8]) -> Self {
        Self {
            kind,
            raw: raw.to_vec(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeErrorKind {
    #[error("truncated frame")]
    Truncated,
    #[error("frame too large")]
    TooLarge,
    #[error("{0} trailing bytes after frame")]
    TrailingBytes(usize),
    #[error("checksum mismatch")]
    ChecksumMismatch,
    #[error("unsupported envelope version {0}")]
    UnsupportedVersion(u8),
    #[error("envelope kind {header:?} does not match body {body:?}")]
    KindMismatch { header: PacketKind, body: PacketKind },
    #[error("body decode error: {0}")]
    Body(String),
    #[error("malformed json: {0}")]
    Json(String),
    #[error("invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// Payload encoding announced by the topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicFormat {
    Json,
    Binary,
    Other(String),
}

/// Parsed bus topic: `<mesh...>/2/<format>/<channel>/<gateway>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topic {
    /// Everything before the `/2/` segment, e.g. `msh/EU_868`.
    pub mesh: String,
    pub format: TopicFormat,
    pub channel: String,
    pub gateway: Option<NodeId>,
}

impl Topic {
    pub fn parse(topic: &str) -> Option<Topic> {
        let segments: Vec<&str> = topic.split('/').collect();
        let idx = segments.iter().skip(1).position(|s| *s == "2")? + 1;
        let rest = &segments[idx + 1..];
        if rest.len() < 3 {
            return None;
        }
        let format = match rest[0] {
            "json" => TopicFormat::Json,
            "e" | "c" => TopicFormat::Binary,
            other => TopicFormat::Other(other.to_string()),
        };
        Some(Topic {
            mesh: segments[..idx].join("/"),
            format,
            channel: rest[1].to_string(),
            gateway: rest[rest.len() - 1].parse().ok(),
        })
    }
}

impl fmt::Display for TopicFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopicFormat::Json => f.write_str("json"),
            TopicFormat::Binary => f.write_str("binary"),
            TopicFormat::Other(s) => f.write_str(s),
        }
    }
}

/// Decode one bus payload. The topic picks the envelope format; the envelope
/// header (binary `kind` byte or JSON `type`) picks the variant.
pub fn decode(topic: &str, payload: &[u8]) -> Result<Decoded, DecodeError> {
    let Some(parsed) = Topic::parse(topic) else {
        return Ok(Decoded::Ignored {
            reason: format!("unrecognized topic {topic}"),
        });
    };
    decode_with_topic(&parsed, payload)
}

pub fn decode_with_topic(topic: &Topic, payload: &[u8]) -> Result<Decoded, DecodeError> {
    match &topic.format {
        TopicFormat::Json => json::decode_json(payload),
        TopicFormat::Binary => wire::decode_envelope(payload),
        TopicFormat::Other(f) => Ok(Decoded::Ignored {
            reason: format!("unsupported topic format {f}"),
        }),
    }
}
