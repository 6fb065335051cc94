//! Query surface for presentation layers. Every read takes the shared lock
//! briefly and returns owned copies.

use meshinfo_core::{
    ChatMessage, MeshCore, NeighborEdge, Node, NodeId, PacketLogEntry, Snapshot, Stats,
    TelemetrySample, TopologySnapshot, TracerouteRun,
};
use serde::Serialize;

use crate::hub::{EventHub, Subscription};
use crate::ingest::{unix_now, SharedCore};
use crate::persistence::{HealthMonitor, HealthReport};

/// A node plus derived facts relative to now and the home node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeView {
    #[serde(flatten)]
    pub node: Node,
    pub active: bool,
    /// Kilometres from the configured home node, when both have a position.
    pub distance_km: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct MeshService {
    core: SharedCore,
    hub: EventHub,
    health: HealthMonitor,
    home: Option<NodeId>,
}

impl MeshService {
    pub fn new(core: SharedCore, hub: EventHub, health: HealthMonitor, home: Option<NodeId>) -> Self {
        Self {
            core,
            hub,
            health,
            home,
        }
    }

    pub async fn topology(&self) -> TopologySnapshot {
        self.core.read().await.topology_snapshot()
    }

    pub async fn node(&self, id: NodeId) -> Option<NodeView> {
        let core = self.core.read().await;
        let node = core.node(id)?;
        Some(self.view(&core, node, unix_now()))
    }

    /// All nodes, optionally only those heard within the active window.
    pub async fn nodes(&self, active_only: bool) -> Vec<NodeView> {
        let now = unix_now();
        let core = self.core.read().await;
        core.topology()
            .nodes()
            .map(|n| self.view(&core, n, now))
            .filter(|v| !active_only || v.active)
            .collect()
    }

    /// Links a node reported hearing, as edges from that node.
    pub async fn neighbors(&self, id: NodeId) -> Vec<NeighborEdge> {
        self.core
            .read()
            .await
            .topology()
            .edges_from(id)
            .cloned()
            .collect()
    }

    pub async fn telemetry_range(
        &self,
        node: NodeId,
        metric: &str,
        from: u64,
        to: u64,
    ) -> Vec<TelemetrySample> {
        self.core
            .read()
            .await
            .telemetry_range(node, metric, from, to)
    }

    /// Newest sample of every metric the node has reported.
    pub async fn latest_telemetry(&self, node: NodeId) -> Vec<TelemetrySample> {
        let core = self.core.read().await;
        let store = core.telemetry();
        store
            .metrics(node)
            .iter()
            .filter_map(|m| store.latest(node, m))
            .collect()
    }

    pub async fn recent_chat(&self, channel: u32, limit: usize) -> Vec<ChatMessage> {
        self.core.read().await.recent_chat(channel, limit)
    }

    /// Channels with at least one retained message.
    pub async fn chat_channels(&self) -> Vec<u32> {
        self.core.read().await.chat_channels()
    }

    pub async fn traceroute(&self, request_id: u32) -> Vec<TracerouteRun> {
        self.core.read().await.traceroute(request_id)
    }

    pub async fn recent_packets(&self, limit: usize) -> Vec<PacketLogEntry> {
        self.core.read().await.recent_packets(limit)
    }

    pub async fn snapshot_at(&self, now: u64) -> Snapshot {
        self.core.read().await.snapshot(now)
    }

    pub async fn stats(&self) -> Stats {
        self.core.read().await.stats(unix_now())
    }

    pub fn persistence_health(&self) -> HealthReport {
        self.health.report()
    }

    pub fn subscribe(&self) -> Subscription {
        self.hub.subscribe()
    }

    fn view(&self, core: &MeshCore, node: &Node, now: u64) -> NodeView {
        NodeView {
            active: node.is_active(now, core.config().active_window_secs),
            distance_km: self
                .home
                .filter(|h| *h != node.id)
                .and_then(|h| core.topology().distance_km(h, node.id)),
            node: node.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::hub::HubMessage;
    use crate::persistence::{MemoryStore, PersistenceHandle, RetryPolicy};
    use meshinfo_core::protocol::{
        Neighbor, NeighborInfo, PacketHeader, Payload, Position, Telemetry, Text,
    };
    use meshinfo_core::{CoreConfig, MeshPacket};
    use tokio::sync::RwLock;

    fn packet(from: u32, rx_time: u64, payload: Payload) -> MeshPacket {
        MeshPacket {
            header: PacketHeader {
                id: rx_time as u32,
                from: NodeId::new(from),
                to: NodeId::BROADCAST,
                channel: 0,
                rx_time,
                snr: Some(7.5),
                rssi: Some(-90),
                hops_away: Some(0),
            },
            payload,
        }
    }

    fn position(lat: f64, lon: f64) -> Payload {
        Payload::Position(Position {
            latitude_i: (lat * 1e7) as i32,
            longitude_i: (lon * 1e7) as i32,
            altitude: None,
            precision_bits: None,
        })
    }

    async fn service() -> (MeshService, SharedCore) {
        let core: SharedCore = Arc::new(RwLock::new(MeshCore::new(CoreConfig::default())));
        let policy = RetryPolicy {
            max_attempts: 1,
            initial: Duration::from_millis(1),
            max: Duration::from_millis(1),
        };
        let (persist, _worker) = PersistenceHandle::spawn(Box::new(MemoryStore::new()), policy, 4);
        let svc = MeshService::new(
            core.clone(),
            EventHub::new(8),
            persist.monitor(),
            Some(NodeId::new(1)),
        );
        (svc, core)
    }

    #[tokio::test]
    async fn node_view_reports_distance_from_home() {
        let (svc, core) = service().await;
        let now = unix_now();
        {
            let mut c = core.write().await;
            c.apply(&packet(1, now, position(51.5074, -0.1278)), now);
            c.apply(&packet(2, now, position(48.8566, 2.3522)), now);
            c.apply(&packet(3, now, position(0.0, 0.0)), now);
        }
        let paris = svc.node(NodeId::new(2)).await.unwrap();
        assert!(paris.active);
        let d = paris.distance_km.unwrap();
        assert!((d - 343.5).abs() < 2.0, "got {d}");
        assert!(svc.node(NodeId::new(1)).await.unwrap().distance_km.is_none());
        assert!(svc.node(NodeId::new(3)).await.unwrap().distance_km.is_none());
        assert_eq!(svc.nodes(true).await.len(), 3);
        assert_eq!(svc.persistence_health().backend, "memory");
    }

    #[tokio::test]
    async fn latest_telemetry_per_metric() {
        let (svc, core) = service().await;
        {
            let mut c = core.write().await;
            for (ts, v) in [(10, 90.0), (20, 85.0)] {
                let mut t = Telemetry::default();
                t.metrics.insert("battery_level".into(), v);
                t.metrics.insert("voltage".into(), 4.1);
                c.apply(&packet(5, ts, Payload::Telemetry(t)), ts);
            }
        }
        let latest = svc.latest_telemetry(NodeId::new(5)).await;
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].metric, "battery_level");
        assert_eq!(latest[0].value, 85.0);
        assert_eq!(svc.telemetry_range(NodeId::new(5), "voltage", 0, 15).await.len(), 1);
        assert_eq!(svc.recent_packets(10).await.len(), 2);
        assert_eq!(svc.stats().await.telemetry_series, 2);
    }

    #[tokio::test]
    async fn neighbors_and_chat_channels() {
        let (svc, core) = service().await;
        {
            let mut c = core.write().await;
            let info = NeighborInfo {
                node_id: NodeId::new(1),
                neighbors: vec![
                    Neighbor { node_id: NodeId::new(2), snr: 5.0 },
                    Neighbor { node_id: NodeId::new(3), snr: -2.5 },
                ],
                broadcast_interval_secs: None,
            };
            c.apply(&packet(1, 10, Payload::NeighborInfo(info)), 10);
            let mut chat = packet(2, 11, Payload::Text(Text { text: "hi".into() }));
            chat.header.channel = 3;
            c.apply(&chat, 11);
        }
        let edges = svc.neighbors(NodeId::new(1)).await;
        let targets: Vec<NodeId> = edges.iter().map(|e| e.target).collect();
        assert_eq!(targets, vec![NodeId::new(2), NodeId::new(3)]);
        assert!(svc.neighbors(NodeId::new(2)).await.is_empty());
        assert_eq!(svc.chat_channels().await, vec![3]);
    }

    #[tokio::test]
    async fn subscribe_goes_through_hub() {
        let (svc, _core) = service().await;
        let mut sub = svc.subscribe();
        svc.hub.publish(meshinfo_core::DeltaEvent::ChatAppended(ChatMessage {
            id: 1,
            from: NodeId::new(1),
            to: NodeId::BROADCAST,
            channel: 0,
            text: "hi".into(),
            timestamp: 1,
        }));
        assert!(matches!(sub.recv().await, Some(HubMessage::Event(_))));
    }
}
