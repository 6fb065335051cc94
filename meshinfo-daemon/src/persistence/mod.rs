//! Durable storage behind one interface. Backends are synchronous; the
//! [`worker`] runs them off the async runtime and retries failures.

mod file;
mod memory;
mod sqlite;
pub mod worker;

use meshinfo_core::{ChatMessage, Snapshot, TelemetrySample, SNAPSHOT_VERSION};

use crate::config::{Backend, StorageConfig};

pub use file::FileStore;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use worker::{HealthMonitor, HealthReport, PersistenceHandle, RetryPolicy};

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("snapshot version {found} is newer than supported {supported}")]
    IncompatibleVersion { found: u32, supported: u32 },
    #[error("persistence worker stopped")]
    WorkerGone,
    #[error("timed out waiting for persistence worker")]
    Timeout,
}

/// Snapshot plus append journals. `load` returns the last saved snapshot with
/// every journal entry appended since folded in.
pub trait SnapshotStore: Send {
    fn name(&self) -> &'static str;

    fn save(&mut self, snapshot: &Snapshot) -> Result<(), PersistenceError>;

    fn load(&mut self) -> Result<Option<Snapshot>, PersistenceError>;

    fn append_chat(&mut self, message: &ChatMessage) -> Result<(), PersistenceError>;

    fn append_telemetry(&mut self, sample: &TelemetrySample) -> Result<(), PersistenceError>;
}

pub fn open_backend(config: &StorageConfig) -> Result<Box<dyn SnapshotStore>, PersistenceError> {
    Ok(match config.backend {
        Backend::File => Box::new(FileStore::open(&config.data_dir)?),
        Backend::Sqlite => Box::new(SqliteStore::open(&config.data_dir.join("meshinfo.sqlite"))?),
        Backend::Memory => Box::new(MemoryStore::new()),
    })
}

fn check_version(snapshot: &Snapshot) -> Result<(), PersistenceError> {
    if snapshot.version > SNAPSHOT_VERSION {
        return Err(PersistenceError::IncompatibleVersion {
            found: snapshot.version,
            supported: SNAPSHOT_VERSION,
        });
    }
    Ok(())
}

/// Combine a stored snapshot with journal entries. `None` when there is nothing at all.
fn fold(
    snapshot: Option<Snapshot>,
    chat: Vec<ChatMessage>,
    telemetry: Vec<TelemetrySample>,
) -> Result<Option<Snapshot>, PersistenceError> {
    if snapshot.is_none() && chat.is_empty() && telemetry.is_empty() {
        return Ok(None);
    }
    let mut snap = snapshot.unwrap_or_else(|| Snapshot::empty(0));
    check_version(&snap)?;
    snap.chat.extend(chat);
    snap.telemetry.extend(telemetry);
    Ok(Some(snap))
}
