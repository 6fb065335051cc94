//! Telemetry history: one bounded, timestamp-ordered series per (node, metric).

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::identity::NodeId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub node: NodeId,
    pub metric: String,
    pub value: f64,
    pub timestamp: u64,
}

/// Per-series bound. Oldest samples go first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum Retention {
    /// Keep at most `count` samples (minimum 1).
    MaxSamples { count: usize },
    /// Keep samples no older than `secs` before the newest sample of the series.
    MaxAge { secs: u64 },
}

impl Default for Retention {
    fn default() -> Self {
        Retention::MaxSamples { count: 1000 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended { evicted: usize },
    /// Timestamp not after the newest retained sample. Expected under replay.
    Stale { newest: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Point {
    timestamp: u64,
    value: f64,
}

#[derive(Debug)]
pub struct TelemetryStore {
    retention: Retention,
    series: BTreeMap<NodeId, BTreeMap<String, VecDeque<Point>>>,
    total: usize,
}

impl TelemetryStore {
    pub fn new(retention: Retention) -> Self {
        Self {
            retention,
            series: BTreeMap::new(),
            total: 0,
        }
    }

    pub fn retention(&self) -> Retention {
        self.retention
    }

    pub fn append(&mut self, sample: TelemetrySample) -> AppendOutcome {
        let series = self
            .series
            .entry(sample.node)
            .or_default()
            .entry(sample.metric)
            .or_default();
        if let Some(last) = series.back() {
            if sample.timestamp <= last.timestamp {
                return AppendOutcome::Stale {
                    newest: last.timestamp,
                };
            }
        }
        series.push_back(Point {
            timestamp: sample.timestamp,
            value: sample.value,
        });
        let evicted = evict(series, self.retention);
        self.total = self.total + 1 - evicted;
        AppendOutcome::Appended { evicted }
    }

    /// Samples with `from <= timestamp <= to`, oldest first.
    pub fn range(&self, node: NodeId, metric: &str, from: u64, to: u64) -> Vec<TelemetrySample> {
        let Some(series) = self.series.get(&node).and_then(|m| m.get(metric)) else {
            return Vec::new();
        };
        let start = series.partition_point(|p| p.timestamp < from);
        series
            .range(start..)
            .take_while(|p| p.timestamp <= to)
            .map(|p| TelemetrySample {
                node,
                metric: metric.to_string(),
                value: p.value,
                timestamp: p.timestamp,
            })
            .collect()
    }

    pub fn latest(&self, node: NodeId, metric: &str) -> Option<TelemetrySample> {
        let p = self.series.get(&node)?.get(metric)?.back()?;
        Some(TelemetrySample {
            node,
            metric: metric.to_string(),
            value: p.value,
            timestamp: p.timestamp,
        })
    }

    /// Metric names with at least one sample for `node`.
    pub fn metrics(&self, node: NodeId) -> Vec<String> {
        self.series
            .get(&node)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn sample_count(&self) -> usize {
        self.total
    }

    pub fn series_count(&self) -> usize {
        self.series.values().map(BTreeMap::len).sum()
    }

    /// Every retained sample, grouped by series and ordered by time.
    pub fn samples(&self) -> Vec<TelemetrySample> {
        let mut out = Vec::with_capacity(self.total);
        for (node, metrics) in &self.series {
            for (metric, points) in metrics {
                out.extend(points.iter().map(|p| TelemetrySample {
                    node: *node,
                    metric: metric.clone(),
                    value: p.value,
                    timestamp: p.timestamp,
                }));
            }
        }
        out
    }

    /// Rebuild from samples in any order. Duplicates collapse; retention applies.
    pub fn from_samples(retention: Retention, mut samples: Vec<TelemetrySample>) -> Self {
        samples.sort_by(|a, b| {
            (a.node, &a.metric, a.timestamp).cmp(&(b.node, &b.metric, b.timestamp))
        });
        let mut store = Self::new(retention);
        for s in samples {
            store.append(s);
        }
        store
    }
}

fn evict(series: &mut VecDeque<Point>, retention: Retention) -> usize {
    let mut evicted = 0;
    match retention {
        Retention::MaxSamples { count } => {
            while series.len() > count.max(1) {
                series.pop_front();
                evicted += 1;
            }
        }
        Retention::MaxAge { secs } => {
            let newest = series.back().map_or(0, |p| p.timestamp);
            let cutoff = newest.saturating_sub(secs);
            while series.front().is_some_and(|p| p.timestamp < cutoff) {
                series.pop_front();
                evicted += 1;
            }
        }
    }
    evicted
}
