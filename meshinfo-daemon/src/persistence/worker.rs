//! Persistence worker: owns the backend, runs each job on the blocking pool,
//! retries failures with jittered exponential backoff.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use meshinfo_core::{ChatMessage, Snapshot, TelemetrySample};
use rand::Rng;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{PersistenceError, SnapshotStore};
use crate::config::RetryConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial: Duration,
    pub max: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): `initial * 2^(attempt-1)`,
    /// capped at `max`, then jittered into `[d/2, d]`.
    pub fn delay<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let base = self
            .initial
            .saturating_mul(1u32 << exp)
            .min(self.max);
        let ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
        if ms < 2 {
            return base;
        }
        Duration::from_millis(rng.gen_range(ms / 2..=ms))
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(c: &RetryConfig) -> Self {
        Self {
            max_attempts: c.max_attempts.max(1),
            initial: Duration::from_millis(c.initial_backoff_ms),
            max: Duration::from_millis(c.max_backoff_ms.max(c.initial_backoff_ms)),
        }
    }
}

/// Persistence status, exposed through the query service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub backend: String,
    pub saves: u64,
    pub last_save_at: Option<u64>,
    pub appends: u64,
    /// Failed attempts, including ones a retry recovered from.
    pub failed_attempts: u64,
    /// Jobs abandoned after the last retry.
    pub gave_up: u64,
    /// Jobs not queued because the queue was full.
    pub dropped: u64,
    pub last_error: Option<String>,
}

#[derive(Debug)]
enum Job {
    Save(Snapshot),
    Chat(ChatMessage),
    Telemetry(TelemetrySample),
}

impl Job {
    fn run(&self, store: &mut dyn SnapshotStore) -> Result<(), PersistenceError> {
        match self {
            Job::Save(s) => store.save(s),
            Job::Chat(m) => store.append_chat(m),
            Job::Telemetry(t) => store.append_telemetry(t),
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Job::Save(_) => "save",
            Job::Chat(_) => "append_chat",
            Job::Telemetry(_) => "append_telemetry",
        }
    }
}

type SharedHealth = Arc<Mutex<HealthReport>>;

/// Sending side of the worker queue. Cheap to clone; the worker exits once
/// every handle is dropped and the queue is drained.
#[derive(Debug, Clone)]
pub struct PersistenceHandle {
    tx: mpsc::Sender<Job>,
    health: SharedHealth,
}

impl PersistenceHandle {
    /// Start the worker on the current runtime.
    pub fn spawn(
        store: Box<dyn SnapshotStore>,
        policy: RetryPolicy,
        queue_depth: usize,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        let health = Arc::new(Mutex::new(HealthReport {
            backend: store.name().to_string(),
            ..HealthReport::default()
        }));
        let task = tokio::spawn(run_worker(store, policy, rx, health.clone()));
        (Self { tx, health }, task)
    }

    /// Queue a snapshot. Dropped with a warning if the queue is full.
    pub fn save(&self, snapshot: Snapshot) {
        self.enqueue(Job::Save(snapshot));
    }

    pub fn append_chat(&self, message: ChatMessage) {
        self.enqueue(Job::Chat(message));
    }

    pub fn append_telemetry(&self, sample: TelemetrySample) {
        self.enqueue(Job::Telemetry(sample));
    }

    /// Queue a final snapshot, waiting for room, then wait for the worker to
    /// finish everything queued. Bounded by `timeout`.
    pub async fn flush_and_close(
        self,
        snapshot: Snapshot,
        worker: JoinHandle<()>,
        timeout: Duration,
    ) -> Result<(), PersistenceError> {
        let Self { tx, health } = self;
        tx.send(Job::Save(snapshot))
            .await
            .map_err(|_| PersistenceError::WorkerGone)?;
        drop(tx);
        match tokio::time::timeout(timeout, worker).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => return Err(PersistenceError::WorkerGone),
            Err(_) => return Err(PersistenceError::Timeout),
        }
        let h = lock(&health);
        match &h.last_error {
            Some(e) if h.gave_up > 0 => {
                warn!(gave_up = h.gave_up, error = %e, "persistence closed with failures")
            }
            _ => info!(saves = h.saves, "persistence closed"),
        }
        Ok(())
    }

    pub fn health(&self) -> HealthReport {
        lock(&self.health).clone()
    }

    /// Read-only view of the health report that does not keep the queue open.
    pub fn monitor(&self) -> HealthMonitor {
        HealthMonitor(self.health.clone())
    }

    fn enqueue(&self, job: Job) {
        match self.tx.try_send(job) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(job)) => {
                warn!(job = job.label(), "persistence queue full; dropping");
                lock(&self.health).dropped += 1;
            }
            Err(mpsc::error::TrySendError::Closed(job)) => {
                warn!(job = job.label(), "persistence worker gone; dropping");
                lock(&self.health).dropped += 1;
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct HealthMonitor(SharedHealth);

impl HealthMonitor {
    pub fn report(&self) -> HealthReport {
        lock(&self.0).clone()
    }
}

fn lock(health: &SharedHealth) -> std::sync::MutexGuard<'_, HealthReport> {
    health.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn run_worker(
    mut store: Box<dyn SnapshotStore>,
    policy: RetryPolicy,
    mut rx: mpsc::Receiver<Job>,
    health: SharedHealth,
) {
    debug!(backend = store.name(), "persistence worker started");
    while let Some(job) = rx.recv().await {
        store = match run_job(store, job, policy, &health).await {
            Some(s) => s,
            None => {
                error!("persistence backend lost; worker stopping");
                return;
            }
        };
    }
    debug!("persistence worker stopped");
}

/// Run one job to success or retry exhaustion. `None` if the blocking task panicked.
async fn run_job(
    mut store: Box<dyn SnapshotStore>,
    job: Job,
    policy: RetryPolicy,
    health: &SharedHealth,
) -> Option<Box<dyn SnapshotStore>> {
    let job = Arc::new(job);
    let mut attempt = 1;
    loop {
        let j = job.clone();
        let (s, result) = tokio::task::spawn_blocking(move || {
            let r = j.run(store.as_mut());
            (store, r)
        })
        .await
        .ok()?;
        store = s;

        match result {
            Ok(()) => {
                let mut h = lock(health);
                match &*job {
                    Job::Save(snap) => {
                        h.saves += 1;
                        h.last_save_at = Some(snap.taken_at);
                        debug!(taken_at = snap.taken_at, "snapshot saved");
                    }
                    _ => h.appends += 1,
                }
                return Some(store);
            }
            Err(e) => {
                {
                    let mut h = lock(health);
                    h.failed_attempts += 1;
                    h.last_error = Some(e.to_string());
                }
                if attempt >= policy.max_attempts {
                    lock(health).gave_up += 1;
                    error!(job = job.label(), attempts = attempt, error = %e, "persistence gave up");
                    return Some(store);
                }
                let delay = policy.delay(attempt, &mut rand::thread_rng());
                warn!(job = job.label(), attempt, error = %e, ?delay, "persistence failed; retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
