//! Durable image of every store, as handed to persistence backends.

use serde::{Deserialize, Serialize};

use crate::chat::ChatMessage;
use crate::telemetry::TelemetrySample;
use crate::topology::TopologySnapshot;
use crate::traceroute::TracerouteRun;

/// Bumped when the snapshot layout changes incompatibly.
pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub taken_at: u64,
    pub topology: TopologySnapshot,
    pub telemetry: Vec<TelemetrySample>,
    pub chat: Vec<ChatMessage>,
    #[serde(default)]
    pub traceroutes: Vec<TracerouteRun>,
}

impl Snapshot {
    pub fn empty(taken_at: u64) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            taken_at,
            topology: TopologySnapshot::default(),
            telemetry: Vec::new(),
            chat: Vec::new(),
            traceroutes: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.topology.nodes.is_empty()
            && self.topology.edges.is_empty()
            && self.telemetry.is_empty()
            && self.chat.is_empty()
            && self.traceroutes.is_empty()
    }
}
