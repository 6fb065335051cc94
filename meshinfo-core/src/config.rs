//! Tunables for [`crate::MeshCore`]. Deserializable so the host can embed it
//! in its own config file.

use serde::{Deserialize, Serialize};

use crate::telemetry::Retention;

/// Default traceroute timeout, counted from the last frame that touched a run.
pub const DEFAULT_TRACEROUTE_TIMEOUT_SECS: u64 = 60;

/// Default time finished runs are kept before being forgotten.
pub const DEFAULT_TRACEROUTE_RETENTION_SECS: u64 = 3600;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CoreConfig {
    #[serde(default)]
    pub retention: Retention,
    #[serde(default = "default_traceroute_timeout_secs")]
    pub traceroute_timeout_secs: u64,
    #[serde(default = "default_traceroute_retention_secs")]
    pub traceroute_retention_secs: u64,
    /// Messages kept per channel.
    #[serde(default = "default_chat_capacity")]
    pub chat_capacity: usize,
    /// Packet ids remembered for duplicate detection.
    #[serde(default = "default_chat_dedup_capacity")]
    pub chat_dedup_capacity: usize,
    #[serde(default = "default_packet_log_capacity")]
    pub packet_log_capacity: usize,
    /// A node counts as active if heard within this many seconds.
    #[serde(default = "default_active_window_secs")]
    pub active_window_secs: u64,
}

fn default_traceroute_timeout_secs() -> u64 {
    DEFAULT_TRACEROUTE_TIMEOUT_SECS
}

fn default_traceroute_retention_secs() -> u64 {
    DEFAULT_TRACEROUTE_RETENTION_SECS
}

fn default_chat_capacity() -> usize {
    500
}

fn default_chat_dedup_capacity() -> usize {
    5000
}

fn default_packet_log_capacity() -> usize {
    200
}

fn default_active_window_secs() -> u64 {
    2 * 60 * 60
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            retention: Retention::default(),
            traceroute_timeout_secs: default_traceroute_timeout_secs(),
            traceroute_retention_secs: default_traceroute_retention_secs(),
            chat_capacity: default_chat_capacity(),
            chat_dedup_capacity: default_chat_dedup_capacity(),
            packet_log_capacity: default_packet_log_capacity(),
            active_window_secs: default_active_window_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_gives_defaults() {
        let c: CoreConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(c, CoreConfig::default());
    }

    #[test]
    fn age_retention_parses() {
        let c: CoreConfig =
            serde_json::from_str(r#"{"retention":{"kind":"max_age","secs":86400}}"#).unwrap();
        assert_eq!(c.retention, Retention::MaxAge { secs: 86400 });
    }

    #[test]
    fn unknown_field_rejected() {
        assert!(serde_json::from_str::<CoreConfig>(r#"{"bogus":1}"#).is_err());
    }
}
