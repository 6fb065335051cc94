//! Wires the pieces together: restore from storage, start the persistence
//! worker and pipeline, and shut them down in order.

use std::sync::Arc;
use std::time::Duration;

use meshinfo_core::MeshCore;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::Config;
use crate::hub::EventHub;
use crate::ingest::{unix_now, BusRecord, Pipeline, PipelineConfig, SharedCore};
use crate::persistence::{self, PersistenceError, PersistenceHandle, RetryPolicy};
use crate::service::MeshService;

pub struct Daemon {
    service: MeshService,
    pipeline: Pipeline,
    persistence: PersistenceHandle,
    worker: JoinHandle<()>,
    shutdown_timeout: Duration,
}

impl Daemon {
    /// Load the last snapshot (if any) and start every task.
    pub async fn start(config: &Config) -> Result<Self, PersistenceError> {
        let storage = config.storage.clone();
        let (store, restored) = tokio::task::spawn_blocking(move || {
            let mut store = persistence::open_backend(&storage)?;
            let restored = store.load()?;
            Ok::<_, PersistenceError>((store, restored))
        })
        .await
        .map_err(|_| PersistenceError::WorkerGone)??;

        let core = match restored {
            Some(snap) => {
                info!(
                    backend = store.name(),
                    taken_at = snap.taken_at,
                    nodes = snap.topology.nodes.len(),
                    "restored snapshot"
                );
                MeshCore::from_snapshot(config.core.clone(), snap)
            }
            None => {
                info!(backend = store.name(), "starting empty");
                MeshCore::new(config.core.clone())
            }
        };
        let core: SharedCore = Arc::new(RwLock::new(core));

        let (persistence, worker) = PersistenceHandle::spawn(
            store,
            RetryPolicy::from(&config.storage.retry),
            config.storage.queue_depth,
        );
        let hub = EventHub::new(config.hub.capacity);
        let pipeline = Pipeline::spawn(
            core.clone(),
            hub.clone(),
            persistence.clone(),
            PipelineConfig {
                channel_depth: config.ingest.channel_depth,
                sweep_interval: Duration::from_secs(config.ingest.sweep_interval_secs.max(1)),
                snapshot_interval: Duration::from_secs(config.storage.snapshot_interval_secs.max(1)),
            },
        );
        let service = MeshService::new(core, hub, persistence.monitor(), config.server.home_node);
        Ok(Self {
            service,
            pipeline,
            persistence,
            worker,
            shutdown_timeout: Duration::from_secs(config.storage.shutdown_timeout_secs),
        })
    }

    pub fn service(&self) -> MeshService {
        self.service.clone()
    }

    pub fn ingest(&self) -> mpsc::Sender<BusRecord> {
        self.pipeline.sender()
    }

    /// Drain the pipeline and flush a final snapshot. Stop sources first.
    pub async fn shutdown(self) -> Result<(), PersistenceError> {
        let Self {
            service,
            pipeline,
            persistence,
            worker,
            shutdown_timeout,
        } = self;
        let snapshot = match pipeline.drain().await {
            Some(s) => s,
            None => {
                warn!("pipeline did not drain; snapshotting current state");
                service.snapshot_at(unix_now()).await
            }
        };
        persistence
            .flush_and_close(snapshot, worker, shutdown_timeout)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Backend;
    use crate::hub::HubMessage;
    use meshinfo_core::NodeId;

    fn json(id: u32, from: u32, ts: u64, kind: &str, payload: &str) -> BusRecord {
        BusRecord {
            topic: "msh/EU_868/2/json/LongFast/!00000001".into(),
            payload: format!(
                r#"{{"id":{id},"from":{from},"to":4294967295,"timestamp":{ts},"type":"{kind}","payload":{payload}}}"#
            )
            .into_bytes(),
            arrival: ts,
        }
    }

    fn file_config(dir: &std::path::Path) -> Config {
        let mut c = Config::default();
        c.storage.backend = Backend::File;
        c.storage.data_dir = dir.to_path_buf();
        c
    }

    #[tokio::test]
    async fn state_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let config = file_config(dir.path());

        let daemon = Daemon::start(&config).await.unwrap();
        let mut sub = daemon.service().subscribe();
        let tx = daemon.ingest();
        tx.send(json(1, 0xa, 100, "nodeinfo", r#"{"longname":"Alpha","shortname":"ALPH"}"#))
            .await
            .unwrap();
        tx.send(json(2, 0xa, 110, "telemetry", r#"{"battery_level":80}"#))
            .await
            .unwrap();
        tx.send(json(3, 0xa, 120, "text", r#""hello mesh""#))
            .await
            .unwrap();
        drop(tx);
        daemon.shutdown().await.unwrap();

        let mut kinds = Vec::new();
        while let Some(HubMessage::Event(ev)) = sub.try_recv() {
            kinds.push(ev.name());
        }
        assert!(kinds.contains(&"chat_appended"));
        assert!(kinds.contains(&"telemetry_appended"));

        let daemon = Daemon::start(&config).await.unwrap();
        let svc = daemon.service();
        let node = svc.node(NodeId::new(0xa)).await.unwrap();
        assert_eq!(node.node.long_name(), Some("Alpha"));
        assert_eq!(svc.recent_chat(0, 5).await[0].text, "hello mesh");
        assert_eq!(
            svc.telemetry_range(NodeId::new(0xa), "battery_level", 0, u64::MAX)
                .await
                .len(),
            1
        );

        // Replaying the same traffic after restart adds nothing.
        let mut sub = svc.subscribe();
        let tx = daemon.ingest();
        tx.send(json(3, 0xa, 120, "text", r#""hello mesh""#))
            .await
            .unwrap();
        drop(tx);
        daemon.shutdown().await.unwrap();
        assert!(sub.try_recv().is_none());
        assert_eq!(svc.recent_chat(0, 5).await.len(), 1);
        assert_eq!(svc.stats().await.counters.stale, 2);
    }

    #[tokio::test]
    async fn memory_backend_starts_empty() {
        let mut config = Config::default();
        config.storage.backend = Backend::Memory;
        let daemon = Daemon::start(&config).await.unwrap();
        assert_eq!(daemon.service().stats().await.nodes, 0);
        daemon.shutdown().await.unwrap();
    }
}
