//! Embedded database backend. The snapshot is one JSON blob row; chat and
//! telemetry appends go to journal tables that a save clears.

use std::path::Path;

use meshinfo_core::{ChatMessage, Snapshot, TelemetrySample};
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;

use super::{fold, PersistenceError, SnapshotStore};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS snapshot (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    taken_at INTEGER NOT NULL,
    body TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS chat_journal (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    body TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS telemetry_journal (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    body TEXT NOT NULL
);
";

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, PersistenceError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    #[cfg(test)]
    fn in_memory() -> Result<Self, PersistenceError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    fn read_journal<T: DeserializeOwned>(&self, table: &str) -> Result<Vec<T>, PersistenceError> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT body FROM {table} ORDER BY seq"))?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for body in rows {
            out.push(serde_json::from_str(&body?)?);
        }
        Ok(out)
    }
}

impl SnapshotStore for SqliteStore {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn save(&mut self, snapshot: &Snapshot) -> Result<(), PersistenceError> {
        let body = serde_json::to_string(snapshot)?;
        let taken_at = i64::try_from(snapshot.taken_at).unwrap_or(i64::MAX);
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO snapshot (id, taken_at, body) VALUES (1, ?1, ?2)",
            params![taken_at, body],
        )?;
        tx.execute("DELETE FROM chat_journal", [])?;
        tx.execute("DELETE FROM telemetry_journal", [])?;
        tx.commit()?;
        Ok(())
    }

    fn load(&mut self) -> Result<Option<Snapshot>, PersistenceError> {
        let body: Option<String> = self
            .conn
            .query_row("SELECT body FROM snapshot WHERE id = 1", [], |row| row.get(0))
            .optional()?;
        let snapshot = body
            .map(|b| serde_json::from_str::<Snapshot>(&b))
            .transpose()?;
        let chat: Vec<ChatMessage> = self.read_journal("chat_journal")?;
        let telemetry: Vec<TelemetrySample> = self.read_journal("telemetry_journal")?;
        fold(snapshot, chat, telemetry)
    }

    fn append_chat(&mut self, message: &ChatMessage) -> Result<(), PersistenceError> {
        self.conn.execute(
            "INSERT INTO chat_journal (body) VALUES (?1)",
            params![serde_json::to_string(message)?],
        )?;
        Ok(())
    }

    fn append_telemetry(&mut self, sample: &TelemetrySample) -> Result<(), PersistenceError> {
        self.conn.execute(
            "INSERT INTO telemetry_journal (body) VALUES (?1)",
            params![serde_json::to_string(sample)?],
        )?;
        Ok(())
    }
}
