//! Chat log: per-channel message history, deduplicated by packet id.

use std::collections::{BTreeMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::identity::NodeId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: u32,
    pub from: NodeId,
    pub to: NodeId,
    pub channel: u32,
    pub text: String,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatOutcome {
    Appended,
    Duplicate,
}

/// Ordered by timestamp, ties kept in arrival order. Ids are remembered for
/// `dedup_capacity` messages, longer than they stay in the log.
#[derive(Debug)]
pub struct ChatLog {
    capacity_per_channel: usize,
    dedup_capacity: usize,
    channels: BTreeMap<u32, VecDeque<ChatMessage>>,
    seen: HashSet<u32>,
    seen_order: VecDeque<u32>,
}

impl ChatLog {
    pub fn new(capacity_per_channel: usize, dedup_capacity: usize) -> Self {
        let capacity_per_channel = capacity_per_channel.max(1);
        Self {
            capacity_per_channel,
            dedup_capacity: dedup_capacity.max(capacity_per_channel),
            channels: BTreeMap::new(),
            seen: HashSet::new(),
            seen_order: VecDeque::new(),
        }
    }

    pub fn append(&mut self, message: ChatMessage) -> ChatOutcome {
        if !self.seen.insert(message.id) {
            return ChatOutcome::Duplicate;
        }
        self.seen_order.push_back(message.id);
        while self.seen_order.len() > self.dedup_capacity {
            if let Some(old) = self.seen_order.pop_front() {
                self.seen.remove(&old);
            }
        }

        let log = self.channels.entry(message.channel).or_default();
        // Arrival order breaks timestamp ties, so insert after every entry with ts <= ours.
        let at = log.partition_point(|m| m.timestamp <= message.timestamp);
        log.insert(at, message);
        while log.len() > self.capacity_per_channel {
            log.pop_front();
        }
        ChatOutcome::Appended
    }

    /// Up to `limit` most recent messages on `channel`, oldest first.
    pub fn recent(&self, channel: u32, limit: usize) -> Vec<ChatMessage> {
        let Some(log) = self.channels.get(&channel) else {
            return Vec::new();
        };
        let skip = log.len().saturating_sub(limit);
        log.iter().skip(skip).cloned().collect()
    }

    pub fn contains(&self, id: u32) -> bool {
        self.channels
            .values()
            .any(|log| log.iter().any(|m| m.id == id))
    }

    pub fn channels(&self) -> Vec<u32> {
        self.channels.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.channels.values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All retained messages: channel by channel, each in log order.
    pub fn messages(&self) -> Vec<ChatMessage> {
        self.channels
            .values()
            .flat_map(|log| log.iter().cloned())
            .collect()
    }

    /// Rebuild from `messages()` output; re-appending in that order keeps tie order.
    pub fn from_messages(
        capacity_per_channel: usize,
        dedup_capacity: usize,
        messages: Vec<ChatMessage>,
    ) -> Self {
        let mut log = Self::new(capacity_per_channel, dedup_capacity);
        for m in messages {
            log.append(m);
        }
        log
    }
}
