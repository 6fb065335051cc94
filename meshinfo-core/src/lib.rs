//! Mesh telemetry aggregation core.
//! Host-driven: no I/O; host passes decoded packets and clock ticks, receives delta events.

pub mod chat;
pub mod config;
pub mod core;
pub mod decoder;
pub mod events;
pub mod geo;
pub mod identity;
mod json;
pub mod protocol;
pub mod snapshot;
pub mod telemetry;
pub mod topology;
pub mod traceroute;
pub mod wire;

pub use chat::{ChatLog, ChatMessage, ChatOutcome};
pub use config::CoreConfig;
pub use core::{Counters, MeshCore, PacketLogEntry, Stats};
pub use decoder::{decode, DecodeError, DecodeErrorKind, Decoded, Topic, TopicFormat};
pub use events::DeltaEvent;
pub use identity::{NodeId, ParseNodeIdError};
pub use protocol::{MeshPacket, PacketHeader, PacketKind, Payload, PROTOCOL_VERSION};
pub use snapshot::{Snapshot, SNAPSHOT_VERSION};
pub use telemetry::{Retention, TelemetrySample, TelemetryStore};
pub use topology::{NeighborEdge, Node, Topology, TopologySnapshot, UpsertOutcome};
pub use traceroute::{RunId, RunStatus, TracerouteResolver, TracerouteRun};
pub use wire::{decode_envelope, encode_envelope, EnvelopeEncodeError};
