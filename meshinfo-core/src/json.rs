//! JSON uplink decoding. The envelope's `type` field selects the payload shape.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use crate::decoder::{DecodeError, DecodeErrorKind, Decoded};
use crate::identity::NodeId;
use crate::protocol::{
    MeshPacket, Neighbor, NeighborInfo, NodeInfo, PacketHeader, PacketKind, Payload, Position,
    Telemetry, Text, Traceroute,
};

#[derive(Deserialize)]
struct JsonEnvelope {
    id: u32,
    from: NodeId,
    to: NodeId,
    #[serde(default)]
    channel: u32,
    timestamp: u64,
    snr: Option<f32>,
    rssi: Option<i32>,
    hops_away: Option<u32>,
    #[serde(default)]
    payload: Value,
}

#[derive(Deserialize)]
struct JsonNodeInfo {
    longname: String,
    shortname: String,
    hardware: Option<u32>,
    role: Option<u32>,
}

#[derive(Deserialize)]
struct JsonPosition {
    latitude_i: i32,
    longitude_i: i32,
    altitude: Option<i32>,
    precision_bits: Option<u32>,
}

#[derive(Deserialize)]
struct JsonNeighborInfo {
    node_id: NodeId,
    #[serde(default)]
    neighbors: Vec<JsonNeighbor>,
    node_broadcast_interval_secs: Option<u32>,
}

#[derive(Deserialize)]
struct JsonNeighbor {
    node_id: NodeId,
    #[serde(default)]
    snr: f32,
}

#[derive(Deserialize)]
struct JsonTraceroute {
    #[serde(default)]
    route: Vec<NodeId>,
    #[serde(default)]
    snr_towards: Vec<f32>,
    request_id: Option<u32>,
}

pub(crate) fn decode_json(bytes: &[u8]) -> Result<Decoded, DecodeError> {
    decode_value(bytes).map_err(|kind| DecodeError::new(kind, bytes))
}

fn decode_value(bytes: &[u8]) -> Result<Decoded, DecodeErrorKind> {
    let value: Value =
        serde_json::from_slice(bytes).map_err(|e| DecodeErrorKind::Json(e.to_string()))?;
    if !value.is_object() {
        return Err(DecodeErrorKind::Json("envelope is not an object".into()));
    }
    // Discriminator first: unknown types are ignored even if the rest is odd.
    let type_name = value.get("type").and_then(Value::as_str).unwrap_or("");
    let Some(kind) = PacketKind::from_json_type(type_name) else {
        return Ok(Decoded::Ignored {
            reason: format!("unsupported json type {type_name:?}"),
        });
    };
    let env: JsonEnvelope =
        serde_json::from_value(value).map_err(|e| DecodeErrorKind::Json(e.to_string()))?;
    let header = PacketHeader {
        id: env.id,
        from: env.from,
        to: env.to,
        channel: env.channel,
        rx_time: env.timestamp,
        snr: env.snr,
        rssi: env.rssi,
        hops_away: env.hops_away,
    };
    let payload = match kind {
        PacketKind::NodeInfo => {
            let p: JsonNodeInfo = typed_payload(env.payload)?;
            Payload::NodeInfo(NodeInfo {
                long_name: p.longname,
                short_name: p.shortname,
                hardware: p.hardware,
                role: p.role,
            })
        }
        PacketKind::Position => {
            let p: JsonPosition = typed_payload(env.payload)?;
            Payload::Position(Position {
                latitude_i: p.latitude_i,
                longitude_i: p.longitude_i,
                altitude: p.altitude,
                precision_bits: p.precision_bits,
            })
        }
        PacketKind::Telemetry => Payload::Telemetry(telemetry_payload(env.payload)?),
        PacketKind::Text => Payload::Text(text_payload(env.payload)?),
        PacketKind::NeighborInfo => {
            let p: JsonNeighborInfo = typed_payload(env.payload)?;
            Payload::NeighborInfo(NeighborInfo {
                node_id: p.node_id,
                neighbors: p
                    .neighbors
                    .into_iter()
                    .map(|n| Neighbor {
                        node_id: n.node_id,
                        snr: n.snr,
                    })
                    .collect(),
                broadcast_interval_secs: p.node_broadcast_interval_secs,
            })
        }
        PacketKind::Traceroute => {
            let p: JsonTraceroute = typed_payload(env.payload)?;
            Payload::Traceroute(Traceroute {
                request_id: p.request_id,
                route: p.route,
                snr_towards: p.snr_towards,
            })
        }
    };
    Ok(Decoded::Packet(MeshPacket { header, payload }))
}

fn typed_payload<T: DeserializeOwned>(payload: Value) -> Result<T, DecodeErrorKind> {
    serde_json::from_value(payload).map_err(|e| DecodeErrorKind::InvalidField {
        field: "payload",
        reason: e.to_string(),
    })
}

/// Every numeric key becomes a metric; nested objects and strings are skipped.
fn telemetry_payload(payload: Value) -> Result<Telemetry, DecodeErrorKind> {
    let Value::Object(map) = payload else {
        return Err(DecodeErrorKind::InvalidField {
            field: "payload",
            reason: "telemetry payload is not an object".into(),
        });
    };
    let metrics: BTreeMap<String, f64> = map
        .into_iter()
        .filter_map(|(k, v)| v.as_f64().map(|f| (k, f)))
        .filter(|(_, f)| f.is_finite())
        .collect();
    Ok(Telemetry { metrics })
}

fn text_payload(payload: Value) -> Result<Text, DecodeErrorKind> {
    let text = match payload {
        Value::String(s) => s,
        Value::Object(mut map) => match map.remove("text") {
            Some(Value::String(s)) => s,
            _ => {
                return Err(DecodeErrorKind::InvalidField {
                    field: "payload.text",
                    reason: "missing or not a string".into(),
                })
            }
        },
        _ => {
            return Err(DecodeErrorKind::InvalidField {
                field: "payload",
                reason: "text payload is neither a string nor an object".into(),
            })
        }
    };
    Ok(Text { text })
}
