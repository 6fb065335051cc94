//! Flat-file backend: `snapshot.json` replaced atomically via a `.swp` file,
//! plus JSON-lines journals for chat and telemetry appends.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use meshinfo_core::{ChatMessage, Snapshot, TelemetrySample};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{fold, PersistenceError, SnapshotStore};

const SNAPSHOT_FILE: &str = "snapshot.json";
const CHAT_JOURNAL: &str = "chat.jsonl";
const TELEMETRY_JOURNAL: &str = "telemetry.jsonl";

#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn open(dir: &Path) -> Result<Self, PersistenceError> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    fn append_line<T: Serialize>(&self, journal: &str, record: &T) -> Result<(), PersistenceError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path(journal))?;
        f.write_all(&line)?;
        Ok(())
    }

    /// Unparseable lines (a torn write at crash time) are skipped.
    fn read_journal<T: DeserializeOwned>(&self, journal: &str) -> Result<Vec<T>, PersistenceError> {
        let path = self.path(journal);
        let f = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut out = Vec::new();
        for (n, line) in BufReader::new(f).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(v) => out.push(v),
                Err(e) => {
                    tracing::warn!(path = %path.display(), line = n + 1, error = %e, "skipping journal line")
                }
            }
        }
        Ok(out)
    }
}

impl SnapshotStore for FileStore {
    fn name(&self) -> &'static str {
        "file"
    }

    fn save(&mut self, snapshot: &Snapshot) -> Result<(), PersistenceError> {
        let body = serde_json::to_vec_pretty(snapshot)?;
        let target = self.path(SNAPSHOT_FILE);
        let swp = target.with_extension("json.swp");
        {
            let mut f = File::create(&swp)?;
            f.write_all(&body)?;
            f.sync_all()?;
        }
        fs::rename(&swp, &target)?;
        // Everything journaled so far is in the snapshot now.
        File::create(self.path(CHAT_JOURNAL))?;
        File::create(self.path(TELEMETRY_JOURNAL))?;
        Ok(())
    }

    fn load(&mut self) -> Result<Option<Snapshot>, PersistenceError> {
        let snapshot = match fs::read(self.path(SNAPSHOT_FILE)) {
            Ok(bytes) => Some(serde_json::from_slice::<Snapshot>(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        let chat: Vec<ChatMessage> = self.read_journal(CHAT_JOURNAL)?;
        let telemetry: Vec<TelemetrySample> = self.read_journal(TELEMETRY_JOURNAL)?;
        fold(snapshot, chat, telemetry)
    }

    fn append_chat(&mut self, message: &ChatMessage) -> Result<(), PersistenceError> {
        self.append_line(CHAT_JOURNAL, message)
    }

    fn append_telemetry(&mut self, sample: &TelemetrySample) -> Result<(), PersistenceError> {
        self.append_line(TELEMETRY_JOURNAL, sample)
    }
}
