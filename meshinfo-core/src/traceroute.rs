//! Traceroute resolver: reassembles route discovery runs from request and
//! response frames that may repeat or arrive out of order.
//!
//! A run's hop list only ever grows by extension. A frame whose route
//! disagrees with every known attempt for its request id starts a new attempt
//! (same request id, next attempt number), leaving the older run untouched.
//! Timeouts are driven by [`TracerouteResolver::sweep`], not by frames.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::identity::NodeId;

/// Synthetic run identity: the request packet id plus an attempt counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RunId {
    pub request_id: u32,
    pub attempt: u32,
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.request_id, self.attempt)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Hop {
    pub node: NodeId,
    pub snr: Option<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Requested,
    InProgress,
    Completed,
    TimedOut,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::TimedOut)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TracerouteRun {
    pub id: RunId,
    pub origin: NodeId,
    /// Unknown until the request is seen when a response arrived first.
    pub destination: Option<NodeId>,
    pub hops: Vec<Hop>,
    pub status: RunStatus,
    pub requested_at: u64,
    /// Last time a frame extended or created the run; the timeout counts from here.
    pub last_activity: u64,
    pub finished_at: Option<u64>,
    /// Senders of responses seen while the destination was unknown.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub early_responders: Vec<NodeId>,
}

impl TracerouteRun {
    fn consistent_with(&self, hops: &[Hop]) -> bool {
        self.hops
            .iter()
            .zip(hops)
            .all(|(a, b)| a.node == b.node)
    }
}

/// What a frame did. Carries the ids of runs whose state changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceOutcome {
    Created(RunId),
    Extended(RunId),
    Completed(RunId),
    /// The frame conflicted with every known attempt.
    Restarted { previous: RunId, run: RunId },
    Unchanged,
}

impl TraceOutcome {
    pub fn changed_run(self) -> Option<RunId> {
        match self {
            Self::Created(id) | Self::Extended(id) | Self::Completed(id) => Some(id),
            Self::Restarted { run, .. } => Some(run),
            Self::Unchanged => None,
        }
    }
}

/// A frame as the resolver sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceFrame {
    pub request_id: u32,
    /// Sender of the frame: the requester on requests, the responder on responses.
    pub from: NodeId,
    pub to: NodeId,
    pub hops: Vec<Hop>,
    pub is_response: bool,
}

#[derive(Debug)]
pub struct TracerouteResolver {
    timeout_secs: u64,
    retention_secs: u64,
    runs: BTreeMap<RunId, TracerouteRun>,
}

impl TracerouteResolver {
    pub fn new(timeout_secs: u64, retention_secs: u64) -> Self {
        Self {
            timeout_secs,
            retention_secs,
            runs: BTreeMap::new(),
        }
    }

    pub fn from_runs(timeout_secs: u64, retention_secs: u64, runs: Vec<TracerouteRun>) -> Self {
        let mut r = Self::new(timeout_secs, retention_secs);
        r.runs = runs.into_iter().map(|run| (run.id, run)).collect();
        r
    }

    pub fn observe(&mut self, frame: TraceFrame, now: u64) -> TraceOutcome {
        let attempts: Vec<RunId> = self
            .runs
            .range(run_range(frame.request_id))
            .map(|(id, _)| *id)
            .rev()
            .collect();

        let Some(latest) = attempts.first().copied() else {
            return self.create(frame, 0, now, None);
        };

        // Newest attempt whose recorded prefix agrees with this frame.
        let target = attempts
            .iter()
            .copied()
            .find(|id| self.runs[id].consistent_with(&frame.hops));
        let Some(target) = target else {
            let prev = &self.runs[&latest];
            let endpoints = Some((prev.origin, prev.destination));
            let run = match self.create(frame, latest.attempt + 1, now, endpoints) {
                TraceOutcome::Created(id) | TraceOutcome::Completed(id) => id,
                other => return other,
            };
            return TraceOutcome::Restarted {
                previous: latest,
                run,
            };
        };

        if !frame.is_response {
            return self.resolve_endpoints(&frame, now);
        }
        let Some(run) = self.runs.get_mut(&target) else {
            return TraceOutcome::Unchanged;
        };
        if run.status.is_terminal() {
            return TraceOutcome::Unchanged;
        }
        let extended = frame.hops.len() > run.hops.len();
        if extended {
            run.hops = frame.hops;
            run.last_activity = now;
        }
        let Some(destination) = run.destination else {
            if !run.early_responders.contains(&frame.from) {
                run.early_responders.push(frame.from);
            }
            if extended {
                return TraceOutcome::Extended(target);
            }
            return TraceOutcome::Unchanged;
        };
        if frame.from == destination {
            run.status = RunStatus::Completed;
            run.finished_at = Some(now);
            run.last_activity = now;
            return TraceOutcome::Completed(target);
        }
        if extended || run.status == RunStatus::Requested {
            run.status = RunStatus::InProgress;
            run.last_activity = now;
            return TraceOutcome::Extended(target);
        }
        TraceOutcome::Unchanged
    }

    /// A request seen after responses: fill in the endpoints of every attempt
    /// still missing them, completing those the destination already answered.
    fn resolve_endpoints(&mut self, frame: &TraceFrame, now: u64) -> TraceOutcome {
        let mut outcome = TraceOutcome::Unchanged;
        for (id, run) in self.runs.range_mut(run_range(frame.request_id)) {
            if run.destination.is_some() || run.status.is_terminal() {
                continue;
            }
            run.origin = frame.from;
            run.destination = Some(frame.to);
            let answered = run.early_responders.contains(&frame.to);
            run.early_responders.clear();
            outcome = if answered {
                run.status = RunStatus::Completed;
                run.finished_at = Some(now);
                run.last_activity = now;
                TraceOutcome::Completed(*id)
            } else {
                TraceOutcome::Extended(*id)
            };
        }
        outcome
    }

    /// `endpoints` is (origin, destination) inherited from an earlier attempt.
    fn create(
        &mut self,
        frame: TraceFrame,
        attempt: u32,
        now: u64,
        endpoints: Option<(NodeId, Option<NodeId>)>,
    ) -> TraceOutcome {
        let id = RunId {
            request_id: frame.request_id,
            attempt,
        };
        // A response seen before its request may come from any hop, so the
        // destination waits for the request.
        let (origin, destination) = match endpoints {
            Some(e) => e,
            None if frame.is_response => (frame.to, None),
            None => (frame.from, Some(frame.to)),
        };
        let status = match (frame.is_response, destination) {
            (true, Some(d)) if frame.from == d => RunStatus::Completed,
            (true, _) => RunStatus::InProgress,
            (false, _) => RunStatus::Requested,
        };
        let early_responders = if frame.is_response && destination.is_none() {
            vec![frame.from]
        } else {
            Vec::new()
        };
        let finished_at = (status == RunStatus::Completed).then_some(now);
        self.runs.insert(
            id,
            TracerouteRun {
                id,
                origin,
                destination,
                hops: frame.hops,
                status,
                requested_at: now,
                last_activity: now,
                finished_at,
                early_responders,
            },
        );
        if status == RunStatus::Completed {
            TraceOutcome::Completed(id)
        } else {
            TraceOutcome::Created(id)
        }
    }

    /// Time out quiet runs and forget old terminal ones. Returns the ids that timed out.
    pub fn sweep(&mut self, now: u64) -> Vec<RunId> {
        let mut timed_out = Vec::new();
        for run in self.runs.values_mut() {
            if !run.status.is_terminal() && now.saturating_sub(run.last_activity) > self.timeout_secs
            {
                run.status = RunStatus::TimedOut;
                run.finished_at = Some(now);
                timed_out.push(run.id);
            }
        }
        let retention = self.retention_secs;
        self.runs.retain(|_, run| {
            run.finished_at
                .map_or(true, |t| now.saturating_sub(t) <= retention)
        });
        timed_out
    }

    pub fn run(&self, id: RunId) -> Option<&TracerouteRun> {
        self.runs.get(&id)
    }

    /// All attempts for a request id, oldest attempt first.
    pub fn runs_for(&self, request_id: u32) -> Vec<&TracerouteRun> {
        self.runs.range(run_range(request_id)).map(|(_, r)| r).collect()
    }

    pub fn runs(&self) -> impl Iterator<Item = &TracerouteRun> {
        self.runs.values()
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}

fn run_range(request_id: u32) -> std::ops::RangeInclusive<RunId> {
    RunId {
        request_id,
        attempt: 0,
    }..=RunId {
        request_id,
        attempt: u32::MAX,
    }
}

/// Zip a route with its per-hop SNR list; missing SNRs become `None`.
pub fn hops_from_route(route: &[NodeId], snr: &[f32]) -> Vec<Hop> {
    route
        .iter()
        .enumerate()
        .map(|(i, node)| Hop {
            node: *node,
            snr: snr.get(i).copied().filter(|v| v.is_finite()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const ORIGIN: NodeId = NodeId::new(1);
    const DEST: NodeId = NodeId::new(9);

    fn hops(nodes: &[u32]) -> Vec<Hop> {
        nodes
            .iter()
            .map(|n| Hop {
                node: NodeId::new(*n),
                snr: Some(*n as f32),
            })
            .collect()
    }

    fn request(id: u32) -> TraceFrame {
        TraceFrame {
            request_id: id,
            from: ORIGIN,
            to: DEST,
            hops: vec![],
            is_response: false,
        }
    }

    fn response(id: u32, from: NodeId, route: &[u32]) -> TraceFrame {
        TraceFrame {
            request_id: id,
            from,
            to: ORIGIN,
            hops: hops(route),
            is_response: true,
        }
    }

    fn partial(id: u32, route: &[u32]) -> TraceFrame {
        response(id, NodeId::new(route[route.len() - 1]), route)
    }

    #[test]
    fn request_then_partials_then_completion() {
        let mut r = TracerouteResolver::new(30, 3600);
        let run = RunId {
            request_id: 7,
            attempt: 0,
        };
        assert_eq!(r.observe(request(7), 0), TraceOutcome::Created(run));
        assert_eq!(r.run(run).unwrap().status, RunStatus::Requested);
        assert_eq!(r.observe(partial(7, &[2]), 1), TraceOutcome::Extended(run));
        assert_eq!(r.observe(partial(7, &[2, 3]), 2), TraceOutcome::Extended(run));
        assert_eq!(r.run(run).unwrap().status, RunStatus::InProgress);
        assert_eq!(
            r.observe(response(7, DEST, &[2, 3]), 3),
            TraceOutcome::Completed(run)
        );
        let done = r.run(run).unwrap();
        assert_eq!(done.status, RunStatus::Completed);
        assert_eq!(done.hops, hops(&[2, 3]));
        assert_eq!(done.finished_at, Some(3));
    }

    #[test]
    fn out_of_order_frames_match_in_order_result() {
        let frames = vec![
            request(5),
            partial(5, &[2]),
            partial(5, &[2, 3]),
            partial(5, &[2, 3, 4]),
            response(5, DEST, &[2, 3, 4]),
        ];
        let mut in_order = TracerouteResolver::new(30, 3600);
        for f in frames.clone() {
            in_order.observe(f, 1);
        }
        let mut shuffled = TracerouteResolver::new(30, 3600);
        for i in [0, 4, 2, 3, 1] {
            shuffled.observe(frames[i].clone(), 1);
        }
        assert_eq!(in_order.runs_for(5), shuffled.runs_for(5));
        let run = shuffled.runs_for(5)[0];
        assert_eq!(run.hops, hops(&[2, 3, 4]));
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(shuffled.len(), 1);
    }

    #[test]
    fn partial_responses_out_of_order_without_completion() {
        let mut r = TracerouteResolver::new(30, 3600);
        r.observe(request(8), 0);
        r.observe(partial(8, &[2, 3, 4]), 1);
        assert_eq!(r.observe(partial(8, &[2]), 2), TraceOutcome::Unchanged);
        assert_eq!(r.observe(partial(8, &[2, 3]), 3), TraceOutcome::Unchanged);
        let run = r.runs_for(8)[0];
        assert_eq!(run.status, RunStatus::InProgress);
        assert_eq!(run.hops, hops(&[2, 3, 4]));
    }

    #[test]
    fn duplicate_frames_are_unchanged() {
        let mut r = TracerouteResolver::new(30, 3600);
        r.observe(request(1), 0);
        r.observe(partial(1, &[2, 3]), 1);
        assert_eq!(r.observe(request(1), 2), TraceOutcome::Unchanged);
        assert_eq!(r.observe(partial(1, &[2, 3]), 2), TraceOutcome::Unchanged);
        assert_eq!(r.observe(partial(1, &[2]), 2), TraceOutcome::Unchanged);
        assert_eq!(r.run(RunId { request_id: 1, attempt: 0 }).unwrap().last_activity, 1);
    }

    #[test]
    fn conflicting_hop_starts_new_attempt() {
        let mut r = TracerouteResolver::new(30, 3600);
        r.observe(request(3), 0);
        r.observe(partial(3, &[2, 3]), 1);
        let outcome = r.observe(partial(3, &[2, 8]), 2);
        assert_eq!(
            outcome,
            TraceOutcome::Restarted {
                previous: RunId { request_id: 3, attempt: 0 },
                run: RunId { request_id: 3, attempt: 1 },
            }
        );
        let runs = r.runs_for(3);
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].hops, hops(&[2, 3]));
        assert_eq!(runs[1].hops, hops(&[2, 8]));
        assert_eq!(runs[1].origin, ORIGIN);
        assert_eq!(runs[1].destination, Some(DEST));
        assert_eq!(runs[1].status, RunStatus::InProgress);

        // A frame consistent with the first attempt still lands there.
        assert_eq!(
            r.observe(partial(3, &[2, 3, 4]), 3),
            TraceOutcome::Extended(RunId { request_id: 3, attempt: 0 })
        );
    }

    #[test]
    fn quiet_run_times_out_without_input() {
        let mut r = TracerouteResolver::new(30, 3600);
        let run = RunId { request_id: 4, attempt: 0 };
        r.observe(request(4), 100);
        r.observe(partial(4, &[2]), 110);
        assert!(r.sweep(140).is_empty());
        assert_eq!(r.sweep(141), vec![run]);
        assert_eq!(r.run(run).unwrap().status, RunStatus::TimedOut);
        // Terminal runs ignore late consistent frames.
        assert_eq!(r.observe(partial(4, &[2, 3]), 150), TraceOutcome::Unchanged);
        assert!(r.sweep(500).is_empty());
    }

    #[test]
    fn final_response_before_request_completes_once_request_seen() {
        let mut r = TracerouteResolver::new(30, 3600);
        let run = RunId { request_id: 6, attempt: 0 };
        assert_eq!(r.observe(response(6, DEST, &[2]), 5), TraceOutcome::Created(run));
        let pending = r.run(run).unwrap();
        assert_eq!(pending.status, RunStatus::InProgress);
        assert_eq!(pending.destination, None);
        assert_eq!(r.observe(request(6), 6), TraceOutcome::Completed(run));
        let stored = r.run(run).unwrap();
        assert_eq!(stored.origin, ORIGIN);
        assert_eq!(stored.destination, Some(DEST));
        assert!(stored.early_responders.is_empty());
    }

    #[test]
    fn partial_response_before_request_matches_in_order() {
        let frames = vec![
            request(5),
            partial(5, &[2]),
            partial(5, &[2, 3]),
            response(5, DEST, &[2, 3]),
        ];
        let mut in_order = TracerouteResolver::new(30, 3600);
        for f in frames.clone() {
            in_order.observe(f, 1);
        }
        let mut shuffled = TracerouteResolver::new(30, 3600);
        let run = RunId { request_id: 5, attempt: 0 };
        assert_eq!(shuffled.observe(frames[1].clone(), 1), TraceOutcome::Created(run));
        assert_eq!(shuffled.run(run).unwrap().status, RunStatus::InProgress);
        assert_eq!(shuffled.observe(frames[0].clone(), 1), TraceOutcome::Extended(run));
        shuffled.observe(frames[2].clone(), 1);
        assert_eq!(shuffled.observe(frames[3].clone(), 1), TraceOutcome::Completed(run));

        assert_eq!(in_order.runs_for(5), shuffled.runs_for(5));
        let done = shuffled.run(run).unwrap();
        assert_eq!(done.destination, Some(DEST));
        assert_eq!(done.hops, hops(&[2, 3]));
    }

    #[test]
    fn terminal_runs_pruned_after_retention() {
        let mut r = TracerouteResolver::new(10, 100);
        r.observe(request(1), 0);
        r.sweep(20);
        assert_eq!(r.len(), 1);
        r.sweep(121);
        assert!(r.is_empty());
    }

    #[test]
    fn hops_zip_snr() {
        let h = hops_from_route(&[NodeId::new(1), NodeId::new(2)], &[3.5]);
        assert_eq!(h[0].snr, Some(3.5));
        assert_eq!(h[1].snr, None);
    }
}
