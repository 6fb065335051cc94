//! State deltas emitted by [`crate::MeshCore`] for live subscribers.

use serde::{Deserialize, Serialize};

use crate::chat::ChatMessage;
use crate::telemetry::TelemetrySample;
use crate::topology::{NeighborEdge, Node};
use crate::traceroute::TracerouteRun;

/// Each variant carries the affected record as it is after the change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "record", rename_all = "snake_case")]
pub enum DeltaEvent {
    NodeUpdated(Node),
    EdgeUpdated(NeighborEdge),
    TelemetryAppended(TelemetrySample),
    ChatAppended(ChatMessage),
    TracerouteUpdated(TracerouteRun),
}

impl DeltaEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::NodeUpdated(_) => "node_updated",
            Self::EdgeUpdated(_) => "edge_updated",
            Self::TelemetryAppended(_) => "telemetry_appended",
            Self::ChatAppended(_) => "chat_appended",
            Self::TracerouteUpdated(_) => "traceroute_updated",
        }
    }
}
