//! Host-driven API: MeshCore takes decoded packets and clock ticks from the
//! host and returns the delta events they caused.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::chat::{ChatLog, ChatMessage, ChatOutcome};
use crate::config::CoreConfig;
use crate::events::DeltaEvent;
use crate::identity::NodeId;
use crate::protocol::{MeshPacket, PacketKind, Payload};
use crate::snapshot::{Snapshot, SNAPSHOT_VERSION};
use crate::telemetry::{AppendOutcome, TelemetrySample, TelemetryStore};
use crate::topology::{
    DeviceMetrics, NeighborEdge, Node, Signal, Topology, TopologySnapshot, UpsertOutcome,
    Versioned,
};
use crate::traceroute::{hops_from_route, TraceFrame, TracerouteResolver, TracerouteRun};

/// One line of the recent packet log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacketLogEntry {
    pub arrival: u64,
    pub id: u32,
    pub from: NodeId,
    pub to: NodeId,
    pub kind: PacketKind,
    pub channel: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    pub packets_applied: u64,
    pub decode_failures: u64,
    pub ignored: u64,
    /// Records dropped because something at least as new was already stored.
    pub stale: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    pub nodes: usize,
    pub active_nodes: usize,
    pub edges: usize,
    pub chat_messages: usize,
    pub telemetry_samples: usize,
    pub telemetry_series: usize,
    pub traceroute_runs: usize,
    pub topology_version: u64,
    #[serde(flatten)]
    pub counters: Counters,
}

/// Main coordinator. Owns every store; the host is expected to serialize
/// calls to the `&mut self` methods.
#[derive(Debug)]
pub struct MeshCore {
    config: CoreConfig,
    topology: Topology,
    telemetry: TelemetryStore,
    chat: ChatLog,
    traceroutes: TracerouteResolver,
    packet_log: VecDeque<PacketLogEntry>,
    counters: Counters,
}

impl MeshCore {
    pub fn new(config: CoreConfig) -> Self {
        Self {
            topology: Topology::new(),
            telemetry: TelemetryStore::new(config.retention),
            chat: ChatLog::new(config.chat_capacity, config.chat_dedup_capacity),
            traceroutes: TracerouteResolver::new(
                config.traceroute_timeout_secs,
                config.traceroute_retention_secs,
            ),
            packet_log: VecDeque::new(),
            counters: Counters::default(),
            config,
        }
    }

    /// Rebuild every store from a snapshot. Records are re-validated on the way in,
    /// so journal entries folded into the snapshot may overlap it.
    pub fn from_snapshot(config: CoreConfig, snapshot: Snapshot) -> Self {
        Self {
            topology: Topology::from_snapshot(snapshot.topology),
            telemetry: TelemetryStore::from_samples(config.retention, snapshot.telemetry),
            chat: ChatLog::from_messages(
                config.chat_capacity,
                config.chat_dedup_capacity,
                snapshot.chat,
            ),
            traceroutes: TracerouteResolver::from_runs(
                config.traceroute_timeout_secs,
                config.traceroute_retention_secs,
                snapshot.traceroutes,
            ),
            packet_log: VecDeque::new(),
            counters: Counters::default(),
            config,
        }
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Route a decoded packet to the stores. `arrival` is the host clock in unix
    /// seconds; it stands in for a missing `rx_time` and drives traceroute timeouts.
    pub fn apply(&mut self, packet: &MeshPacket, arrival: u64) -> Vec<DeltaEvent> {
        let header = &packet.header;
        let ts = if header.rx_time == 0 {
            arrival
        } else {
            header.rx_time
        };
        self.counters.packets_applied += 1;
        self.log_packet(packet, arrival);

        let mut events = Vec::new();
        let mut sender = Node::seen(header.from, ts);
        let snr = header.snr.filter(|v| v.is_finite());
        if snr.is_some() || header.rssi.is_some() || header.hops_away.is_some() {
            let signal = Signal {
                snr,
                rssi: header.rssi,
                hops_away: header.hops_away,
            };
            sender.signal = Some(Versioned::new(signal, ts));
        }
        match &packet.payload {
            Payload::NodeInfo(info) => sender.info = Some(Versioned::new(info.clone(), ts)),
            Payload::Position(pos) if pos.has_fix() => {
                sender.position = Some(Versioned::new(*pos, ts))
            }
            Payload::Telemetry(t) => {
                sender.device =
                    DeviceMetrics::from_metrics(&t.metrics).map(|d| Versioned::new(d, ts))
            }
            _ => {}
        }
        self.upsert_node(sender, &mut events);
        self.ensure_node(header.to, &mut events);

        match &packet.payload {
            Payload::Telemetry(t) => {
                // Non-finite values could not be written out again.
                for (metric, value) in t.metrics.iter().filter(|(_, v)| v.is_finite()) {
                    let sample = TelemetrySample {
                        node: header.from,
                        metric: metric.clone(),
                        value: *value,
                        timestamp: ts,
                    };
                    self.append_telemetry(sample, &mut events);
                }
            }
            Payload::Text(t) => {
                let msg = ChatMessage {
                    id: header.id,
                    from: header.from,
                    to: header.to,
                    channel: header.channel,
                    text: t.text.clone(),
                    timestamp: ts,
                };
                match self.chat.append(msg.clone()) {
                    ChatOutcome::Appended => events.push(DeltaEvent::ChatAppended(msg)),
                    ChatOutcome::Duplicate => self.counters.stale += 1,
                }
            }
            Payload::NeighborInfo(info) => {
                // Some firmware leaves node_id unset; the sender is the reporter then.
                let reporter = if info.node_id.as_u32() == 0 || info.node_id.is_broadcast() {
                    header.from
                } else {
                    info.node_id
                };
                for n in info.neighbors.iter().filter(|n| n.snr.is_finite()) {
                    let edge = NeighborEdge {
                        source: reporter,
                        target: n.node_id,
                        snr: n.snr,
                        updated_at: ts,
                    };
                    self.upsert_edge(edge, &mut events);
                }
            }
            Payload::Traceroute(tr) => {
                let hops = hops_from_route(&tr.route, &tr.snr_towards);
                for hop in &hops {
                    self.ensure_node(hop.node, &mut events);
                }
                let frame = TraceFrame {
                    request_id: tr.request_id.unwrap_or(header.id),
                    from: header.from,
                    to: header.to,
                    hops,
                    is_response: tr.is_response(),
                };
                let changed = self.traceroutes.observe(frame, arrival).changed_run();
                if let Some(run) = changed.and_then(|id| self.traceroutes.run(id)) {
                    events.push(DeltaEvent::TracerouteUpdated(run.clone()));
                }
            }
            Payload::NodeInfo(_) | Payload::Position(_) => {}
        }
        events
    }

    /// Count a payload the decoder rejected.
    pub fn record_decode_failure(&mut self) {
        self.counters.decode_failures += 1;
    }

    /// Count a payload the decoder skipped.
    pub fn record_ignored(&mut self) {
        self.counters.ignored += 1;
    }

    /// Time out quiet traceroute runs. Call periodically; no packet is needed.
    pub fn sweep(&mut self, now: u64) -> Vec<DeltaEvent> {
        self.traceroutes
            .sweep(now)
            .into_iter()
            .filter_map(|id| self.traceroutes.run(id))
            .map(|run| DeltaEvent::TracerouteUpdated(run.clone()))
            .collect()
    }

    pub fn snapshot(&self, now: u64) -> Snapshot {
        Snapshot {
            version: SNAPSHOT_VERSION,
            taken_at: now,
            topology: self.topology.snapshot(),
            telemetry: self.telemetry.samples(),
            chat: self.chat.messages(),
            traceroutes: self.traceroutes.runs().cloned().collect(),
        }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn topology_snapshot(&self) -> TopologySnapshot {
        self.topology.snapshot()
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.topology.node(id)
    }

    pub fn telemetry(&self) -> &TelemetryStore {
        &self.telemetry
    }

    pub fn telemetry_range(
        &self,
        node: NodeId,
        metric: &str,
        from: u64,
        to: u64,
    ) -> Vec<TelemetrySample> {
        self.telemetry.range(node, metric, from, to)
    }

    pub fn recent_chat(&self, channel: u32, limit: usize) -> Vec<ChatMessage> {
        self.chat.recent(channel, limit)
    }

    pub fn chat_channels(&self) -> Vec<u32> {
        self.chat.channels()
    }

    /// Every attempt for `request_id`, oldest first.
    pub fn traceroute(&self, request_id: u32) -> Vec<TracerouteRun> {
        self.traceroutes
            .runs_for(request_id)
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn traceroutes(&self) -> impl Iterator<Item = &TracerouteRun> {
        self.traceroutes.runs()
    }

    /// Up to `limit` packets, newest last.
    pub fn recent_packets(&self, limit: usize) -> Vec<PacketLogEntry> {
        let skip = self.packet_log.len().saturating_sub(limit);
        self.packet_log.iter().skip(skip).cloned().collect()
    }

    pub fn stats(&self, now: u64) -> Stats {
        Stats {
            nodes: self.topology.node_count(),
            active_nodes: self
                .topology
                .active_nodes(now, self.config.active_window_secs)
                .count(),
            edges: self.topology.edge_count(),
            chat_messages: self.chat.len(),
            telemetry_samples: self.telemetry.sample_count(),
            telemetry_series: self.telemetry.series_count(),
            traceroute_runs: self.traceroutes.len(),
            topology_version: self.topology.version(),
            counters: self.counters,
        }
    }

    fn upsert_node(&mut self, node: Node, events: &mut Vec<DeltaEvent>) {
        let id = node.id;
        match self.topology.upsert_node(node) {
            UpsertOutcome::Created | UpsertOutcome::Updated => self.push_node(id, events),
            UpsertOutcome::Stale => self.counters.stale += 1,
            UpsertOutcome::Rejected => {}
        }
    }

    fn ensure_node(&mut self, id: NodeId, events: &mut Vec<DeltaEvent>) {
        if self.topology.ensure_node(id) {
            self.push_node(id, events);
        }
    }

    fn upsert_edge(&mut self, edge: NeighborEdge, events: &mut Vec<DeltaEvent>) {
        let (source, target) = (edge.source, edge.target);
        let new_source = self.topology.node(source).is_none();
        let new_target = self.topology.node(target).is_none();
        let outcome = self.topology.upsert_edge(edge);
        if outcome == UpsertOutcome::Rejected {
            return;
        }
        if new_source {
            self.push_node(source, events);
        }
        if new_target {
            self.push_node(target, events);
        }
        if outcome.applied() {
            if let Some(e) = self.topology.edge(source, target) {
                events.push(DeltaEvent::EdgeUpdated(e.clone()));
            }
        } else {
            self.counters.stale += 1;
        }
    }

    fn append_telemetry(&mut self, sample: TelemetrySample, events: &mut Vec<DeltaEvent>) {
        match self.telemetry.append(sample.clone()) {
            AppendOutcome::Appended { .. } => events.push(DeltaEvent::TelemetryAppended(sample)),
            AppendOutcome::Stale { .. } => self.counters.stale += 1,
        }
    }

    fn push_node(&self, id: NodeId, events: &mut Vec<DeltaEvent>) {
        if let Some(n) = self.topology.node(id) {
            events.push(DeltaEvent::NodeUpdated(n.clone()));
        }
    }

    fn log_packet(&mut self, packet: &MeshPacket, arrival: u64) {
        let h = &packet.header;
        self.packet_log.push_back(PacketLogEntry {
            arrival,
            id: h.id,
            from: h.from,
            to: h.to,
            kind: packet.kind(),
            channel: h.channel,
        });
        while self.packet_log.len() > self.config.packet_log_capacity {
            self.packet_log.pop_front();
        }
    }
}

impl Default for MeshCore {
    fn default() -> Self {
        Self::new(CoreConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::protocol::{
        Neighbor, NeighborInfo, NodeInfo, PacketHeader, Position, Telemetry, Text, Traceroute,
    };
    use crate::traceroute::RunStatus;

    const A: NodeId = NodeId::new(0xa);
    const B: NodeId = NodeId::new(0xb);
    const C: NodeId = NodeId::new(0xc);

    fn packet(id: u32, from: NodeId, to: NodeId, rx_time: u64, payload: Payload) -> MeshPacket {
        MeshPacket {
            header: PacketHeader {
                id,
                from,
                to,
                channel: 0,
                rx_time,
                snr: None,
                rssi: None,
                hops_away: None,
            },
            payload,
        }
    }

    fn nodeinfo(name: &str, ts: u64) -> MeshPacket {
        let info = NodeInfo {
            long_name: name.into(),
            short_name: name.chars().take(4).collect(),
            hardware: Some(9),
            role: None,
        };
        packet(ts as u32, A, NodeId::BROADCAST, ts, Payload::NodeInfo(info))
    }

    fn battery(level: f64, ts: u64) -> MeshPacket {
        let mut metrics = BTreeMap::new();
        metrics.insert("battery_level".to_string(), level);
        packet(
            1000 + ts as u32,
            A,
            NodeId::BROADCAST,
            ts,
            Payload::Telemetry(Telemetry { metrics }),
        )
    }

    fn text(id: u32, body: &str, ts: u64) -> MeshPacket {
        packet(id, A, NodeId::BROADCAST, ts, Payload::Text(Text { text: body.into() }))
    }

    #[test]
    fn older_nodeinfo_does_not_replace_newer() {
        let mut core = MeshCore::default();
        core.apply(&nodeinfo("Alpha", 100), 100);
        core.apply(&nodeinfo("Alpha2", 50), 101);
        assert_eq!(core.node(A).unwrap().long_name(), Some("Alpha"));
        assert_eq!(core.node(A).unwrap().last_seen, Some(100));
        assert!(core.stats(100).counters.stale >= 1);
    }

    #[test]
    fn non_finite_readings_never_reach_state() {
        let mut core = MeshCore::default();
        let mut metrics = BTreeMap::new();
        metrics.insert("battery_level".to_string(), f64::NAN);
        metrics.insert("voltage".to_string(), 4.1);
        let mut p = packet(1, A, NodeId::BROADCAST, 10, Payload::Telemetry(Telemetry { metrics }));
        p.header.snr = Some(f32::NAN);
        core.apply(&p, 10);

        assert!(core.telemetry_range(A, "battery_level", 0, u64::MAX).is_empty());
        assert_eq!(core.telemetry_range(A, "voltage", 0, u64::MAX).len(), 1);
        let node = core.node(A).unwrap();
        assert_eq!(node.device.as_ref().unwrap().value.battery_level, None);
        assert_eq!(node.signal, None);

        let json = serde_json::to_string(&core.snapshot(20)).unwrap();
        let back: Snapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back.telemetry.len(), 1);
    }

    #[test]
    fn older_telemetry_rejected() {
        let mut core = MeshCore::default();
        let events = core.apply(&battery(80.0, 10), 10);
        assert!(events
            .iter()
            .any(|e| matches!(e, DeltaEvent::TelemetryAppended(s) if s.value == 80.0)));
        let events = core.apply(&battery(75.0, 9), 11);
        assert!(!events
            .iter()
            .any(|e| matches!(e, DeltaEvent::TelemetryAppended(_))));
        let r = core.telemetry_range(A, "battery_level", 0, u64::MAX);
        assert_eq!(r.len(), 1);
        assert_eq!(r[0].timestamp, 10);
        let device = core.node(A).unwrap().device.as_ref().unwrap();
        assert_eq!(device.value.battery_level, Some(80.0));
    }

    #[test]
    fn missing_rx_time_uses_arrival() {
        let mut core = MeshCore::default();
        core.apply(&text(1, "hi", 0), 1234);
        assert_eq!(core.recent_chat(0, 10)[0].timestamp, 1234);
        assert_eq!(core.node(A).unwrap().last_seen, Some(1234));
    }

    #[test]
    fn replayed_text_is_not_duplicated() {
        let mut core = MeshCore::default();
        let first = core.apply(&text(5, "hello", 10), 10);
        assert!(first
            .iter()
            .any(|e| matches!(e, DeltaEvent::ChatAppended(_))));
        for _ in 0..3 {
            let again = core.apply(&text(5, "hello", 10), 11);
            assert!(again.is_empty());
        }
        assert_eq!(core.recent_chat(0, 10).len(), 1);
    }

    #[test]
    fn position_without_fix_is_not_stored() {
        let mut core = MeshCore::default();
        let zero = Position {
            latitude_i: 0,
            longitude_i: 0,
            altitude: None,
            precision_bits: None,
        };
        core.apply(&packet(1, A, NodeId::BROADCAST, 5, Payload::Position(zero)), 5);
        assert!(core.node(A).unwrap().position.is_none());
    }

    #[test]
    fn neighborinfo_builds_edges_and_placeholders() {
        let mut core = MeshCore::default();
        let info = NeighborInfo {
            node_id: A,
            neighbors: vec![
                Neighbor { node_id: B, snr: 6.5 },
                Neighbor { node_id: C, snr: -2.0 },
            ],
            broadcast_interval_secs: Some(900),
        };
        let p = packet(1, A, NodeId::BROADCAST, 100, Payload::NeighborInfo(info));
        let events = core.apply(&p, 100);
        let edges = events
            .iter()
            .filter(|e| matches!(e, DeltaEvent::EdgeUpdated(_)))
            .count();
        assert_eq!(edges, 2);
        assert_eq!(core.topology().edge_count(), 2);
        assert!(core.node(B).unwrap().last_seen.is_none());

        // Replaying the same report changes nothing.
        assert!(core.apply(&p, 101).is_empty());
        assert_eq!(core.topology().edge_count(), 2);
    }

    #[test]
    fn unicast_destination_becomes_placeholder() {
        let mut core = MeshCore::default();
        core.apply(&packet(1, A, B, 10, Payload::Text(Text { text: "dm".into() })), 10);
        assert!(core.node(B).is_some());
        assert!(core.node(NodeId::BROADCAST).is_none());
    }

    #[test]
    fn traceroute_completes_and_times_out() {
        let mut core = MeshCore::default();
        let timeout = core.config().traceroute_timeout_secs;
        let req = Traceroute {
            request_id: None,
            route: vec![],
            snr_towards: vec![],
        };
        core.apply(&packet(77, A, C, 100, Payload::Traceroute(req)), 100);
        let reply = Traceroute {
            request_id: Some(77),
            route: vec![B],
            snr_towards: vec![4.0],
        };
        let events = core.apply(&packet(78, C, A, 101, Payload::Traceroute(reply)), 101);
        let run = events
            .iter()
            .find_map(|e| match e {
                DeltaEvent::TracerouteUpdated(r) => Some(r.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.hops[0].node, B);

        let req2 = Traceroute {
            request_id: None,
            route: vec![],
            snr_towards: vec![],
        };
        core.apply(&packet(90, A, B, 200, Payload::Traceroute(req2)), 200);
        assert!(core.sweep(200 + timeout).is_empty());
        let timed_out = core.sweep(201 + timeout);
        assert_eq!(timed_out.len(), 1);
        assert_eq!(core.traceroute(90)[0].status, RunStatus::TimedOut);
    }

    #[test]
    fn packet_log_is_bounded() {
        let config = CoreConfig {
            packet_log_capacity: 3,
            ..CoreConfig::default()
        };
        let mut core = MeshCore::new(config);
        for i in 0..5 {
            core.apply(&text(i, "x", 10 + u64::from(i)), 10);
        }
        let ids: Vec<u32> = core.recent_packets(10).iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![2, 3, 4]);
        assert_eq!(core.recent_packets(1)[0].kind, PacketKind::Text);
        assert_eq!(core.stats(20).counters.packets_applied, 5);
    }

    #[test]
    fn snapshot_restores_all_stores() {
        let mut core = MeshCore::default();
        core.apply(&nodeinfo("Alpha", 100), 100);
        core.apply(&battery(80.0, 110), 110);
        core.apply(&text(3, "hello", 120), 120);
        let tr = Traceroute {
            request_id: None,
            route: vec![],
            snr_towards: vec![],
        };
        core.apply(&packet(50, A, B, 130, Payload::Traceroute(tr)), 130);

        let snap = core.snapshot(140);
        let restored = MeshCore::from_snapshot(CoreConfig::default(), snap.clone());
        assert_eq!(restored.snapshot(140), snap);
        assert_eq!(restored.node(A).unwrap().long_name(), Some("Alpha"));
        assert_eq!(restored.traceroute(50).len(), 1);
    }

    #[test]
    fn stats_count_everything() {
        let mut core = MeshCore::default();
        core.apply(&nodeinfo("Alpha", 100), 100);
        core.apply(&battery(50.0, 100), 100);
        core.record_decode_failure();
        core.record_ignored();
        core.record_ignored();
        let s = core.stats(100);
        assert_eq!(s.nodes, 1);
        assert_eq!(s.active_nodes, 1);
        assert_eq!(s.telemetry_samples, 1);
        assert_eq!(s.counters.decode_failures, 1);
        assert_eq!(s.counters.ignored, 2);
        assert_eq!(s.counters.packets_applied, 2);
    }
}
