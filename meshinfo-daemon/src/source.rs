//! Capture replay: feeds recorded bus traffic into the pipeline.
//!
//! Input is JSON lines of `{"topic": ..., "arrival": ..., "payload": ...}`.
//! `payload` is a byte array, a string (raw text of the payload), or a JSON
//! object (re-serialized). `arrival` defaults to the wall clock.

use serde::Deserialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::ingest::{unix_now, BusRecord};

#[derive(Debug, Deserialize)]
struct CaptureLine {
    topic: String,
    #[serde(default)]
    arrival: Option<u64>,
    payload: CapturePayload,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CapturePayload {
    Bytes(Vec<u8>),
    Text(String),
    Json(serde_json::Value),
}

impl CapturePayload {
    fn into_bytes(self) -> Vec<u8> {
        match self {
            CapturePayload::Bytes(b) => b,
            CapturePayload::Text(s) => s.into_bytes(),
            CapturePayload::Json(v) => v.to_string().into_bytes(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub forwarded: u64,
    pub filtered: u64,
    pub malformed: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("read capture: {0}")]
    Io(#[from] std::io::Error),
}

/// Bus-style subscription match: `+` is one level, a trailing `#` is any remainder.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut f = filter.split('/');
    let mut t = topic.split('/');
    loop {
        match (f.next(), t.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(a), Some(b)) if a == b => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Read `input` to the end (or until `shutdown` flips to true), forwarding
/// records whose topic matches one of `filters`.
pub async fn replay<R>(
    input: R,
    filters: &[String],
    tx: mpsc::Sender<BusRecord>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<ReplayStats, SourceError>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    let mut stats = ReplayStats::default();
    let mut line_no = 0u64;
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = shutdown.changed() => {
                debug!("replay cancelled");
                break;
            }
        };
        let Some(line) = line else { break };
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        let rec: CaptureLine = match serde_json::from_str(&line) {
            Ok(r) => r,
            Err(e) => {
                warn!(line = line_no, error = %e, "malformed capture line");
                stats.malformed += 1;
                continue;
            }
        };
        if !filters.iter().any(|f| topic_matches(f, &rec.topic)) {
            stats.filtered += 1;
            continue;
        }
        let record = BusRecord {
            arrival: rec.arrival.unwrap_or_else(unix_now),
            topic: rec.topic,
            payload: rec.payload.into_bytes(),
        };
        if tx.send(record).await.is_err() {
            break;
        }
        stats.forwarded += 1;
    }
    debug!(?stats, "replay finished");
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcards() {
        assert!(topic_matches("msh/#", "msh/US/2/json/LongFast/!a"));
        assert!(topic_matches("msh/+/2/json/#", "msh/US/2/json/LongFast/!a"));
        assert!(!topic_matches("msh/+/2/e/#", "msh/US/2/json/LongFast/!a"));
        assert!(topic_matches("msh/US", "msh/US"));
        assert!(!topic_matches("msh/US", "msh/US/2"));
        assert!(!topic_matches("msh/+", "msh"));
    }

    #[tokio::test]
    async fn forwards_matching_lines_in_order() {
        let input = concat!(
            r#"{"topic":"msh/US/2/json/LongFast/!1","arrival":5,"payload":{"type":"text"}}"#,
            "\n",
            "garbage\n",
            "\n",
            r#"{"topic":"other/x","arrival":6,"payload":"ignored"}"#,
            "\n",
            r#"{"topic":"msh/US/2/e/LongFast/!1","arrival":7,"payload":[1,2,3]}"#,
            "\n",
        );
        let (tx, mut rx) = mpsc::channel(8);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let filters = vec!["msh/#".to_string()];
        let stats = replay(input.as_bytes(), &filters, tx, stop_rx).await.unwrap();
        assert_eq!(
            stats,
            ReplayStats {
                forwarded: 2,
                filtered: 1,
                malformed: 1
            }
        );
        let first = rx.recv().await.unwrap();
        assert_eq!(first.arrival, 5);
        assert_eq!(first.payload, br#"{"type":"text"}"#.to_vec());
        let second = rx.recv().await.unwrap();
        assert_eq!(second.payload, vec![1, 2, 3]);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn stops_on_shutdown() {
        let (reader, _writer) = tokio::io::duplex(64);
        let (tx, _rx) = mpsc::channel(8);
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let filters = vec!["#".to_string()];
            replay(tokio::io::BufReader::new(reader), &filters, tx, stop_rx).await
        });
        stop_tx.send(true).unwrap();
        let stats = task.await.unwrap().unwrap();
        assert_eq!(stats.forwarded, 0);
    }
}
