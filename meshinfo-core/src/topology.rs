//! Topology store: nodes and directed neighbor edges, last-writer-wins by message time.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::geo;
use crate::identity::NodeId;
use crate::protocol::{NodeInfo, Position};

/// A value plus the message time it was taken from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Versioned<T> {
    pub value: T,
    pub updated_at: u64,
}

impl<T> Versioned<T> {
    pub fn new(value: T, updated_at: u64) -> Self {
        Self { value, updated_at }
    }
}

/// Battery and radio utilization, from device telemetry.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DeviceMetrics {
    pub battery_level: Option<f64>,
    pub voltage: Option<f64>,
    pub channel_utilization: Option<f64>,
    pub air_util_tx: Option<f64>,
    pub uptime_seconds: Option<f64>,
}

impl DeviceMetrics {
    /// Picks the device keys out of a telemetry reading. `None` when none are present.
    pub fn from_metrics(metrics: &BTreeMap<String, f64>) -> Option<Self> {
        let get = |k: &str| metrics.get(k).copied().filter(|v| v.is_finite());
        let m = DeviceMetrics {
            battery_level: get("battery_level"),
            voltage: get("voltage"),
            channel_utilization: get("channel_utilization"),
            air_util_tx: get("air_util_tx"),
            uptime_seconds: get("uptime_seconds"),
        };
        (m != DeviceMetrics::default()).then_some(m)
    }
}

/// How the node was last heard.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub snr: Option<f32>,
    pub rssi: Option<i32>,
    pub hops_away: Option<u32>,
}

/// Each attribute group is versioned on its own so a position and a nodeinfo
/// sharing a timestamp don't shadow each other.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub info: Option<Versioned<NodeInfo>>,
    pub position: Option<Versioned<Position>>,
    pub device: Option<Versioned<DeviceMetrics>>,
    pub signal: Option<Versioned<Signal>>,
    pub last_seen: Option<u64>,
}

impl Node {
    /// Known only because something referenced it.
    pub fn placeholder(id: NodeId) -> Self {
        Self {
            id,
            info: None,
            position: None,
            device: None,
            signal: None,
            last_seen: None,
        }
    }

    pub fn seen(id: NodeId, at: u64) -> Self {
        Self {
            last_seen: Some(at),
            ..Self::placeholder(id)
        }
    }

    pub fn long_name(&self) -> Option<&str> {
        self.info.as_ref().map(|i| i.value.long_name.as_str())
    }

    pub fn short_name(&self) -> Option<&str> {
        self.info.as_ref().map(|i| i.value.short_name.as_str())
    }

    pub fn is_active(&self, now: u64, window_secs: u64) -> bool {
        self.last_seen
            .is_some_and(|t| now.saturating_sub(t) <= window_secs)
    }

    /// Merge newer groups from `incoming`. Returns true if anything changed.
    fn merge(&mut self, incoming: Node) -> bool {
        let mut changed = merge_group(&mut self.info, incoming.info);
        changed |= merge_group(&mut self.position, incoming.position);
        changed |= merge_group(&mut self.device, incoming.device);
        changed |= merge_group(&mut self.signal, incoming.signal);
        if let Some(t) = incoming.last_seen {
            if self.last_seen.map_or(true, |cur| t > cur) {
                self.last_seen = Some(t);
                changed = true;
            }
        }
        changed
    }
}

fn merge_group<T>(current: &mut Option<Versioned<T>>, incoming: Option<Versioned<T>>) -> bool {
    match (current.as_ref(), incoming) {
        (_, None) => false,
        (Some(cur), Some(new)) if new.updated_at <= cur.updated_at => false,
        (_, Some(new)) => {
            *current = Some(new);
            true
        }
    }
}

/// Directed link quality as reported by `source`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NeighborEdge {
    pub source: NodeId,
    pub target: NodeId,
    pub snr: f32,
    pub updated_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
    /// Not newer than what is stored; nothing changed.
    Stale,
    /// Broadcast address or self-loop; never stored.
    Rejected,
}

impl UpsertOutcome {
    pub fn applied(self) -> bool {
        matches!(self, Self::Created | Self::Updated)
    }
}

/// Point-in-time copy of the graph.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TopologySnapshot {
    pub version: u64,
    pub nodes: Vec<Node>,
    pub edges: Vec<NeighborEdge>,
}

#[derive(Debug, Default)]
pub struct Topology {
    nodes: BTreeMap<NodeId, Node>,
    edges: BTreeMap<(NodeId, NodeId), NeighborEdge>,
    version: u64,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: TopologySnapshot) -> Self {
        Self {
            nodes: snapshot.nodes.into_iter().map(|n| (n.id, n)).collect(),
            edges: snapshot
                .edges
                .into_iter()
                .map(|e| ((e.source, e.target), e))
                .collect(),
            version: snapshot.version,
        }
    }

    pub fn upsert_node(&mut self, incoming: Node) -> UpsertOutcome {
        if incoming.id.is_broadcast() {
            return UpsertOutcome::Rejected;
        }
        let outcome = match self.nodes.get_mut(&incoming.id) {
            Some(existing) => {
                if existing.merge(incoming) {
                    UpsertOutcome::Updated
                } else {
                    UpsertOutcome::Stale
                }
            }
            None => {
                let mut node = Node::placeholder(incoming.id);
                node.merge(incoming);
                self.nodes.insert(node.id, node);
                UpsertOutcome::Created
            }
        };
        if outcome.applied() {
            self.version += 1;
        }
        outcome
    }

    /// Create a placeholder if `id` is unknown. Returns true when created.
    pub fn ensure_node(&mut self, id: NodeId) -> bool {
        if id.is_broadcast() || self.nodes.contains_key(&id) {
            return false;
        }
        self.nodes.insert(id, Node::placeholder(id));
        self.version += 1;
        true
    }

    /// Endpoints are created as placeholders if missing, even when the edge itself is stale.
    pub fn upsert_edge(&mut self, edge: NeighborEdge) -> UpsertOutcome {
        if edge.source == edge.target || edge.source.is_broadcast() || edge.target.is_broadcast() {
            return UpsertOutcome::Rejected;
        }
        self.ensure_node(edge.source);
        self.ensure_node(edge.target);
        let key = (edge.source, edge.target);
        let outcome = match self.edges.get(&key) {
            Some(cur) if edge.updated_at <= cur.updated_at => return UpsertOutcome::Stale,
            Some(_) => UpsertOutcome::Updated,
            None => UpsertOutcome::Created,
        };
        self.edges.insert(key, edge);
        self.version += 1;
        outcome
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn edge(&self, source: NodeId, target: NodeId) -> Option<&NeighborEdge> {
        self.edges.get(&(source, target))
    }

    pub fn edges_from(&self, source: NodeId) -> impl Iterator<Item = &NeighborEdge> {
        self.edges
            .range((source, NodeId::new(0))..=(source, NodeId::new(u32::MAX)))
            .map(|(_, e)| e)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn active_nodes(&self, now: u64, window_secs: u64) -> impl Iterator<Item = &Node> {
        self.nodes
            .values()
            .filter(move |n| n.is_active(now, window_secs))
    }

    /// Distance when both nodes have a position with a fix.
    pub fn distance_km(&self, a: NodeId, b: NodeId) -> Option<f64> {
        let pa = self.node(a)?.position.as_ref()?;
        let pb = self.node(b)?.position.as_ref()?;
        Some(geo::distance_km(&pa.value, &pb.value))
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn snapshot(&self) -> TopologySnapshot {
        TopologySnapshot {
            version: self.version,
            nodes: self.nodes.values().cloned().collect(),
            edges: self.edges.values().cloned().collect(),
        }
    }
}
