//! In-memory backend. Clones share state, so a clone kept outside the worker
//! sees what was written.

use std::sync::{Arc, Mutex, PoisonError};

use meshinfo_core::{ChatMessage, Snapshot, TelemetrySample};

use super::{fold, PersistenceError, SnapshotStore};

#[derive(Debug, Default)]
struct Inner {
    snapshot: Option<Snapshot>,
    chat: Vec<ChatMessage>,
    telemetry: Vec<TelemetrySample>,
    saves: u64,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful saves so far.
    pub fn saves(&self) -> u64 {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).saves
    }
}

impl SnapshotStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn save(&mut self, snapshot: &Snapshot) -> Result<(), PersistenceError> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.snapshot = Some(snapshot.clone());
        inner.chat.clear();
        inner.telemetry.clear();
        inner.saves += 1;
        Ok(())
    }

    fn load(&mut self) -> Result<Option<Snapshot>, PersistenceError> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        fold(
            inner.snapshot.clone(),
            inner.chat.clone(),
            inner.telemetry.clone(),
        )
    }

    fn append_chat(&mut self, message: &ChatMessage) -> Result<(), PersistenceError> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.chat.push(message.clone());
        Ok(())
    }

    fn append_telemetry(&mut self, sample: &TelemetrySample) -> Result<(), PersistenceError> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.telemetry.push(sample.clone());
        Ok(())
    }
}
