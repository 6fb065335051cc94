//! Mesh packet model: a header plus one of six typed payloads.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::identity::NodeId;

/// Binary envelope version. Frames carrying another version are rejected.
pub const PROTOCOL_VERSION: u8 = 1;

/// Discriminator for the payload variants. The `u8` value is the binary envelope `kind` byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PacketKind {
    NodeInfo = 1,
    Position = 2,
    Telemetry = 3,
    Text = 4,
    NeighborInfo = 5,
    Traceroute = 6,
}

impl PacketKind {
    pub fn from_u8(b: u8) -> Option<Self> {
        Some(match b {
            1 => Self::NodeInfo,
            2 => Self::Position,
            3 => Self::Telemetry,
            4 => Self::Text,
            5 => Self::NeighborInfo,
            6 => Self::Traceroute,
            _ => return None,
        })
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Lookup by the `type` field used in JSON uplinks.
    pub fn from_json_type(s: &str) -> Option<Self> {
        Some(match s {
            "nodeinfo" => Self::NodeInfo,
            "position" => Self::Position,
            "telemetry" => Self::Telemetry,
            "text" => Self::Text,
            "neighborinfo" => Self::NeighborInfo,
            "traceroute" => Self::Traceroute,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::NodeInfo => "nodeinfo",
            Self::Position => "position",
            Self::Telemetry => "telemetry",
            Self::Text => "text",
            Self::NeighborInfo => "neighborinfo",
            Self::Traceroute => "traceroute",
        }
    }
}

/// Fields common to every packet. `rx_time` (unix seconds) is the logical message time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacketHeader {
    pub id: u32,
    pub from: NodeId,
    pub to: NodeId,
    pub channel: u32,
    pub rx_time: u64,
    pub snr: Option<f32>,
    pub rssi: Option<i32>,
    pub hops_away: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshPacket {
    pub header: PacketHeader,
    pub payload: Payload,
}

impl MeshPacket {
    pub fn kind(&self) -> PacketKind {
        self.payload.kind()
    }

    /// First float field holding NaN or an infinity, if any.
    pub fn non_finite_field(&self) -> Option<&'static str> {
        if self.header.snr.is_some_and(|v| !v.is_finite()) {
            return Some("snr");
        }
        match &self.payload {
            Payload::Telemetry(t) if t.metrics.values().any(|v| !v.is_finite()) => {
                Some("payload.metrics")
            }
            Payload::NeighborInfo(n) if n.neighbors.iter().any(|nb| !nb.snr.is_finite()) => {
                Some("payload.neighbors.snr")
            }
            Payload::Traceroute(t) if t.snr_towards.iter().any(|v| !v.is_finite()) => {
                Some("payload.snr_towards")
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    NodeInfo(NodeInfo),
    Position(Position),
    Telemetry(Telemetry),
    Text(Text),
    NeighborInfo(NeighborInfo),
    Traceroute(Traceroute),
}

impl Payload {
    pub fn kind(&self) -> PacketKind {
        match self {
            Payload::NodeInfo(_) => PacketKind::NodeInfo,
            Payload::Position(_) => PacketKind::Position,
            Payload::Telemetry(_) => PacketKind::Telemetry,
            Payload::Text(_) => PacketKind::Text,
            Payload::NeighborInfo(_) => PacketKind::NeighborInfo,
            Payload::Traceroute(_) => PacketKind::Traceroute,
        }
    }
}

/// User/device description a node broadcasts about itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub long_name: String,
    pub short_name: String,
    pub hardware: Option<u32>,
    pub role: Option<u32>,
}

/// Position in 1e-7 degree integer units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub latitude_i: i32,
    pub longitude_i: i32,
    pub altitude: Option<i32>,
    pub precision_bits: Option<u32>,
}

impl Position {
    pub fn latitude(&self) -> f64 {
        f64::from(self.latitude_i) / 1e7
    }

    pub fn longitude(&self) -> f64 {
        f64::from(self.longitude_i) / 1e7
    }

    /// (0, 0) is what devices without a GPS fix report.
    pub fn has_fix(&self) -> bool {
        self.latitude_i != 0 || self.longitude_i != 0
    }
}

/// Named numeric readings from one telemetry packet.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Telemetry {
    pub metrics: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Text {
    pub text: String,
}

/// Neighbor list as reported by `node_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NeighborInfo {
    pub node_id: NodeId,
    pub neighbors: Vec<Neighbor>,
    pub broadcast_interval_secs: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Neighbor {
    pub node_id: NodeId,
    pub snr: f32,
}

/// Route discovery frame. `request_id` is `None` on the request itself and
/// names the original request's packet id on responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Traceroute {
    pub request_id: Option<u32>,
    pub route: Vec<NodeId>,
    pub snr_towards: Vec<f32>,
}

impl Traceroute {
    pub fn is_response(&self) -> bool {
        self.request_id.is_some()
    }
}
