//! Ordered ingestion: source -> decode stage -> apply loop.
//!
//! The apply loop is the only writer of [`MeshCore`]. Traceroute sweeps and
//! scheduled snapshots run on timers inside the same loop.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use meshinfo_core::{decode, DecodeError, Decoded, DeltaEvent, MeshCore, MeshPacket, Snapshot};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::hub::EventHub;
use crate::persistence::PersistenceHandle;

/// The core, shared between the apply loop (writer) and readers.
pub type SharedCore = Arc<RwLock<MeshCore>>;

/// Wall clock in unix seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Time as seen by ingestion: the newest record arrival plus the wall time
/// since it came in. Replayed captures keep their own timeline this way.
#[derive(Debug, Default)]
struct IngestClock {
    latest: Option<(u64, Instant)>,
}

impl IngestClock {
    fn observe(&mut self, arrival: u64) {
        match self.latest {
            Some((seen, _)) if arrival < seen => {}
            _ => self.latest = Some((arrival, Instant::now())),
        }
    }

    fn now(&self) -> u64 {
        match self.latest {
            Some((arrival, at)) => arrival.saturating_add(at.elapsed().as_secs()),
            None => unix_now(),
        }
    }
}

/// One payload as delivered by the bus, with the time we received it.
#[derive(Debug, Clone, PartialEq)]
pub struct BusRecord {
    pub topic: String,
    pub payload: Vec<u8>,
    pub arrival: u64,
}

#[derive(Debug)]
enum Staged {
    Packet { packet: MeshPacket, arrival: u64 },
    Ignored { topic: String, reason: String },
    Failed { topic: String, error: DecodeError },
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineConfig {
    pub channel_depth: usize,
    pub sweep_interval: Duration,
    pub snapshot_interval: Duration,
}

/// Running pipeline. Dropping every clone of `records` drains and stops it.
#[derive(Debug)]
pub struct Pipeline {
    records: mpsc::Sender<BusRecord>,
    decode: JoinHandle<()>,
    apply: JoinHandle<Snapshot>,
}

impl Pipeline {
    pub fn spawn(
        core: SharedCore,
        hub: EventHub,
        persistence: PersistenceHandle,
        config: PipelineConfig,
    ) -> Self {
        let depth = config.channel_depth.max(1);
        let (records, raw_rx) = mpsc::channel(depth);
        let (staged_tx, staged_rx) = mpsc::channel(depth);
        let decode = tokio::spawn(decode_stage(raw_rx, staged_tx));
        let apply_loop = ApplyLoop {
            clock: IngestClock::default(),
            core,
            hub,
            persistence,
            sweep_interval: config.sweep_interval,
            snapshot_interval: config.snapshot_interval,
        };
        let apply = tokio::spawn(apply_loop.run(staged_rx));
        Self {
            records,
            decode,
            apply,
        }
    }

    /// Sender for sources. Records are applied in send order.
    pub fn sender(&self) -> mpsc::Sender<BusRecord> {
        self.records.clone()
    }

    /// Stop accepting input, drain what is queued, and return the final snapshot.
    /// Sources holding a sender must be stopped first.
    pub async fn drain(self) -> Option<Snapshot> {
        let Self {
            records,
            decode,
            apply,
        } = self;
        drop(records);
        if let Err(e) = decode.await {
            warn!(error = %e, "decode stage ended abnormally");
        }
        match apply.await {
            Ok(snap) => Some(snap),
            Err(e) => {
                warn!(error = %e, "apply loop ended abnormally");
                None
            }
        }
    }
}

async fn decode_stage(mut rx: mpsc::Receiver<BusRecord>, tx: mpsc::Sender<Staged>) {
    while let Some(rec) = rx.recv().await {
        let staged = match decode(&rec.topic, &rec.payload) {
            Ok(Decoded::Packet(packet)) => Staged::Packet {
                packet,
                arrival: rec.arrival,
            },
            Ok(Decoded::Ignored { reason }) => Staged::Ignored {
                topic: rec.topic,
                reason,
            },
            Err(error) => Staged::Failed {
                topic: rec.topic,
                error,
            },
        };
        if tx.send(staged).await.is_err() {
            break;
        }
    }
}

struct ApplyLoop {
    clock: IngestClock,
    core: SharedCore,
    hub: EventHub,
    persistence: PersistenceHandle,
    sweep_interval: Duration,
    snapshot_interval: Duration,
}

impl ApplyLoop {
    async fn run(mut self, mut rx: mpsc::Receiver<Staged>) -> Snapshot {
        let mut sweep = interval_at(Instant::now() + self.sweep_interval, self.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut snapshot = interval_at(
            Instant::now() + self.snapshot_interval,
            self.snapshot_interval,
        );
        snapshot.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                staged = rx.recv() => match staged {
                    Some(s) => self.apply(s).await,
                    None => break,
                },
                _ = sweep.tick() => {
                    let events = self.core.write().await.sweep(self.clock.now());
                    if !events.is_empty() {
                        debug!(count = events.len(), "traceroute runs timed out");
                    }
                    self.publish(events);
                }
                _ = snapshot.tick() => {
                    let snap = self.core.read().await.snapshot(unix_now());
                    self.persistence.save(snap);
                }
            }
        }
        let snap = self.core.read().await.snapshot(unix_now());
        info!(
            nodes = snap.topology.nodes.len(),
            samples = snap.telemetry.len(),
            "ingestion drained"
        );
        snap
    }

    async fn apply(&mut self, staged: Staged) {
        match staged {
            Staged::Packet { packet, arrival } => {
                self.clock.observe(arrival);
                let events = self.core.write().await.apply(&packet, arrival);
                debug!(
                    kind = packet.kind().name(),
                    from = %packet.header.from,
                    events = events.len(),
                    "applied"
                );
                self.publish(events);
            }
            Staged::Ignored { topic, reason } => {
                debug!(%topic, %reason, "ignored payload");
                self.core.write().await.record_ignored();
            }
            Staged::Failed { topic, error } => {
                warn!(%topic, %error, "decode failed");
                self.core.write().await.record_decode_failure();
            }
        }
    }

    fn publish(&self, events: Vec<DeltaEvent>) {
        for ev in &events {
            match ev {
                DeltaEvent::ChatAppended(m) => self.persistence.append_chat(m.clone()),
                DeltaEvent::TelemetryAppended(s) => self.persistence.append_telemetry(s.clone()),
                _ => {}
            }
        }
        self.hub.publish_all(events);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::HubMessage;
    use crate::persistence::{MemoryStore, RetryPolicy, SnapshotStore};
    use meshinfo_core::{CoreConfig, NodeId, RunStatus};

    const TOPIC: &str = "msh/US/2/json/LongFast/!00000001";

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 2,
            initial: Duration::from_millis(1),
            max: Duration::from_millis(2),
        }
    }

    fn config() -> PipelineConfig {
        PipelineConfig {
            channel_depth: 16,
            sweep_interval: Duration::from_secs(3600),
            snapshot_interval: Duration::from_secs(3600),
        }
    }

    fn record(json: &str, arrival: u64) -> BusRecord {
        BusRecord {
            topic: TOPIC.into(),
            payload: json.as_bytes().to_vec(),
            arrival,
        }
    }

    fn text(id: u32, ts: u64, body: &str) -> BusRecord {
        record(
            &format!(
                r#"{{"id":{id},"from":10,"to":4294967295,"timestamp":{ts},"type":"text","payload":"{body}"}}"#
            ),
            ts,
        )
    }

    fn traceroute(id: u32, from: u32, to: u32, request_id: Option<u32>, arrival: u64) -> BusRecord {
        let request_id = request_id.map_or("null".to_string(), |r| r.to_string());
        record(
            &format!(
                r#"{{"id":{id},"from":{from},"to":{to},"timestamp":{arrival},"type":"traceroute","payload":{{"route":[2],"request_id":{request_id}}}}}"#
            ),
            arrival,
        )
    }

    fn fast_sweep() -> PipelineConfig {
        PipelineConfig {
            sweep_interval: Duration::from_millis(20),
            ..config()
        }
    }

    async fn run_status(core: &SharedCore, request_id: u32) -> Option<RunStatus> {
        core.read()
            .await
            .traceroute(request_id)
            .first()
            .map(|r| r.status)
    }

    #[tokio::test]
    async fn sweeps_follow_capture_time_not_wall_clock() {
        let core: SharedCore = Arc::new(RwLock::new(MeshCore::new(CoreConfig::default())));
        let (persist, worker) = PersistenceHandle::spawn(Box::new(MemoryStore::new()), policy(), 64);
        let pipeline = Pipeline::spawn(core.clone(), EventHub::new(64), persist.clone(), fast_sweep());
        let tx = pipeline.sender();

        // A capture from long ago: the reply lands after several sweeps ran.
        tx.send(traceroute(40, 1, 9, None, 1_000)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(run_status(&core, 40).await, Some(RunStatus::Requested));
        tx.send(traceroute(41, 9, 1, Some(40), 1_002)).await.unwrap();
        drop(tx);

        let last = pipeline.drain().await.unwrap();
        persist
            .flush_and_close(last, worker, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(run_status(&core, 40).await, Some(RunStatus::Completed));
    }

    #[tokio::test]
    async fn capture_time_still_times_out_quiet_runs() {
        let core: SharedCore = Arc::new(RwLock::new(MeshCore::new(CoreConfig::default())));
        let timeout = core.read().await.config().traceroute_timeout_secs;
        let (persist, worker) = PersistenceHandle::spawn(Box::new(MemoryStore::new()), policy(), 64);
        let pipeline = Pipeline::spawn(core.clone(), EventHub::new(64), persist.clone(), fast_sweep());
        let tx = pipeline.sender();

        tx.send(traceroute(50, 1, 9, None, 1_000)).await.unwrap();
        tx.send(text(1, 1_001 + timeout, "later")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        drop(tx);

        let last = pipeline.drain().await.unwrap();
        persist
            .flush_and_close(last, worker, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(run_status(&core, 50).await, Some(RunStatus::TimedOut));
    }

    #[tokio::test]
    async fn applies_in_order_and_fans_out() {
        let core: SharedCore = Arc::new(RwLock::new(MeshCore::new(CoreConfig::default())));
        let hub = EventHub::new(64);
        let mut sub = hub.subscribe();
        let mem = MemoryStore::new();
        let (persist, worker) = PersistenceHandle::spawn(Box::new(mem.clone()), policy(), 64);
        let pipeline = Pipeline::spawn(core.clone(), hub, persist.clone(), config());
        let tx = pipeline.sender();

        for i in 1..=3 {
            tx.send(text(i, 100 + u64::from(i), &format!("m{i}")))
                .await
                .unwrap();
        }
        tx.send(record("not json", 104)).await.unwrap();
        tx.send(record(r#"{"type":"mapreport"}"#, 105)).await.unwrap();
        tx.send(text(2, 102, "m2")).await.unwrap();
        drop(tx);

        let last = pipeline.drain().await.unwrap();
        persist
            .flush_and_close(last, worker, Duration::from_secs(5))
            .await
            .unwrap();

        let core = core.read().await;
        let chat: Vec<String> = core.recent_chat(0, 10).into_iter().map(|m| m.text).collect();
        assert_eq!(chat, vec!["m1", "m2", "m3"]);
        let stats = core.stats(200);
        assert_eq!(stats.counters.decode_failures, 1);
        assert_eq!(stats.counters.ignored, 1);
        assert_eq!(stats.counters.packets_applied, 4);

        let mut chat_events = Vec::new();
        while let Some(HubMessage::Event(ev)) = sub.try_recv() {
            if let DeltaEvent::ChatAppended(m) = &*ev {
                chat_events.push(m.id);
            }
        }
        assert_eq!(chat_events, vec![1, 2, 3]);

        let mut stored = mem.clone();
        let saved = stored.load().unwrap().unwrap();
        assert_eq!(saved.chat.len(), 3);
        assert!(saved
            .topology
            .nodes
            .iter()
            .any(|n| n.id == NodeId::new(10)));
    }
}
