//! Node identity: 32-bit node numbers and their `!hex8` text form.

use std::fmt;
use std::str::FromStr;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Mesh node number. Text form is `!` + 8 lowercase hex digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(u32);

impl NodeId {
    /// Destination used for packets addressed to everyone. Never stored as a node.
    pub const BROADCAST: NodeId = NodeId(u32::MAX);

    pub const fn new(num: u32) -> Self {
        NodeId(num)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }
}

impl From<u32> for NodeId {
    fn from(num: u32) -> Self {
        NodeId(num)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "!{:08x}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid node id {0:?}: expected !hex8, hex8 or a decimal number")]
pub struct ParseNodeIdError(pub String);

impl FromStr for NodeId {
    type Err = ParseNodeIdError;

    /// Accepts `!a1b2c3d4`, `a1b2c3d4` and decimal `2712847316`. Bare digits
    /// are always decimal, so `12345678` is node 12345678, not 0x12345678.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseNodeIdError(s.to_string());
        if let Some(hex) = s.strip_prefix('!') {
            return parse_hex8(hex).ok_or_else(err);
        }
        if s.len() == 8 && s.bytes().any(|b| b.is_ascii_alphabetic()) {
            if let Some(id) = parse_hex8(s) {
                return Ok(id);
            }
        }
        if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) {
            return s.parse::<u32>().map(NodeId).map_err(|_| err());
        }
        Err(err())
    }
}

fn parse_hex8(s: &str) -> Option<NodeId> {
    if s.len() != 8 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u32::from_str_radix(s, 16).ok().map(NodeId)
}

// JSON gets the `!hex8` string, bincode the raw integer.
impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.collect_str(self)
        } else {
            serializer.serialize_u32(self.0)
        }
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        if d.is_human_readable() {
            d.deserialize_any(NodeIdVisitor)
        } else {
            u32::deserialize(d).map(NodeId)
        }
    }
}

struct NodeIdVisitor;

impl<'de> Visitor<'de> for NodeIdVisitor {
    type Value = NodeId;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a node number or a !hex8 node id string")
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<NodeId, E> {
        u32::try_from(v)
            .map(NodeId)
            .map_err(|_| E::custom(format!("node number {v} out of range")))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<NodeId, E> {
        u32::try_from(v)
            .map(NodeId)
            .map_err(|_| E::custom(format!("node number {v} out of range")))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<NodeId, E> {
        v.parse().map_err(E::custom)
    }
}
