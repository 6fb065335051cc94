//! Event hub: fan-out of delta events to live subscribers.
//!
//! Every subscriber reads from its own cursor into a shared bounded ring. A
//! subscriber that falls behind loses the oldest events and is told how many.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use meshinfo_core::DeltaEvent;
use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct EventHub {
    tx: broadcast::Sender<Arc<DeltaEvent>>,
    published: Arc<AtomicU64>,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            published: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Never blocks. Having no subscribers is not an error.
    pub fn publish(&self, event: DeltaEvent) {
        self.published.fetch_add(1, Ordering::Relaxed);
        let _ = self.tx.send(Arc::new(event));
    }

    pub fn publish_all(&self, events: impl IntoIterator<Item = DeltaEvent>) {
        for ev in events {
            self.publish(ev);
        }
    }

    /// Starts at the next published event.
    pub fn subscribe(&self) -> Subscription {
        let id = Uuid::new_v4();
        tracing::debug!(subscriber = %id, "subscribed");
        Subscription {
            id,
            rx: self.tx.subscribe(),
            missed: 0,
            lagged: false,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

/// What a subscriber gets from [`Subscription::recv`].
#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    Event(Arc<DeltaEvent>),
    /// The subscriber fell behind and `n` of the oldest events were dropped.
    Missed(u64),
}

/// Dropping the subscription unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    id: Uuid,
    rx: broadcast::Receiver<Arc<DeltaEvent>>,
    missed: u64,
    lagged: bool,
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Next event, or `None` once the hub is gone.
    pub async fn recv(&mut self) -> Option<HubMessage> {
        match self.rx.recv().await {
            Ok(ev) => Some(HubMessage::Event(ev)),
            Err(broadcast::error::RecvError::Lagged(n)) => Some(self.note_lag(n)),
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }

    /// Non-waiting variant of [`recv`](Self::recv). `None` when nothing is queued.
    pub fn try_recv(&mut self) -> Option<HubMessage> {
        match self.rx.try_recv() {
            Ok(ev) => Some(HubMessage::Event(ev)),
            Err(broadcast::error::TryRecvError::Lagged(n)) => Some(self.note_lag(n)),
            Err(_) => None,
        }
    }

    /// True once any event has been dropped for this subscriber.
    pub fn lagged(&self) -> bool {
        self.lagged
    }

    /// Total events dropped for this subscriber.
    pub fn missed(&self) -> u64 {
        self.missed
    }

    fn note_lag(&mut self, n: u64) -> HubMessage {
        self.lagged = true;
        self.missed += n;
        tracing::warn!(subscriber = %self.id, missed = n, "subscriber fell behind");
        HubMessage::Missed(n)
    }
}
