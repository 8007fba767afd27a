//! Experiment state machine and the global barrier at time zero.
//!
//! The coordinator owns exactly one [`GlobalBarrierState`] per experiment.
//! Handlers never touch it; they send arrival events and receive one release.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::PhaseError;
use crate::schedule::MAX_SCHEDULE_SECONDS;

/// Lifecycle of one experiment instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ExperimentPhase {
    #[default]
    Idle,
    NegativeTimeRunning,
    GlobalBarrierWait,
    PositiveTimeRunning,
    Completed,
    Aborted,
}

impl ExperimentPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Aborted)
    }

    fn allows(self, to: Self) -> bool {
        use ExperimentPhase::*;
        match (self, to) {
            (Idle, NegativeTimeRunning)
            | (NegativeTimeRunning, GlobalBarrierWait)
            | (GlobalBarrierWait, PositiveTimeRunning)
            | (PositiveTimeRunning, Completed) => true,
            (from, Aborted) => !from.is_terminal(),
            _ => false,
        }
    }

    /// Move to `to`, or report the illegal transition.
    pub fn transition(&mut self, to: Self) -> Result<(), PhaseError> {
        if !self.allows(to) {
            return Err(PhaseError { from: *self, to });
        }
        debug!(from = ?*self, to = ?to, "Experiment phase transition");
        *self = to;
        Ok(())
    }
}

/// Where one vertex stands, as seen by the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum VertexProgress {
    Pending,
    /// Draining negative-time buckets; last completed bucket time
    Configuring { last_bucket: Option<f64> },
    Arrived { at: DateTime<Utc> },
    Running,
    Drained,
    Failed { reason: String },
    Unreachable { reason: String },
    Aborted,
}

impl VertexProgress {
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            Self::Drained | Self::Failed { .. } | Self::Unreachable { .. } | Self::Aborted
        )
    }
}

/// Outcome of recording an arrival.
#[derive(Debug, Clone, PartialEq)]
pub enum BarrierStatus {
    Waiting { arrived: usize, expected: usize },
    /// At least one vertex failed; the barrier will not release on its own
    Blocked { failed: Vec<String> },
    Released { start: DateTime<Utc> },
}

/// Per-vertex arrival records for the barrier at time zero.
///
/// Each vertex writes only its own record and the first write wins, so the
/// map only ever grows.
#[derive(Debug, Clone)]
pub struct GlobalBarrierState {
    expected: BTreeSet<String>,
    arrivals: BTreeMap<String, DateTime<Utc>>,
    failures: BTreeMap<String, String>,
    buffer: TimeDelta,
    start: Option<DateTime<Utc>>,
}

impl GlobalBarrierState {
    pub fn new(expected: impl IntoIterator<Item = String>, buffer_seconds: f64) -> Self {
        let micros = (buffer_seconds.clamp(0.0, MAX_SCHEDULE_SECONDS) * 1_000_000.0).round() as i64;
        Self {
            expected: expected.into_iter().collect(),
            arrivals: BTreeMap::new(),
            failures: BTreeMap::new(),
            buffer: TimeDelta::microseconds(micros),
            start: None,
        }
    }

    pub fn expected(&self) -> usize {
        self.expected.len()
    }

    pub fn arrived(&self) -> usize {
        self.arrivals.len()
    }

    pub fn arrival(&self, vertex: &str) -> Option<DateTime<Utc>> {
        self.arrivals.get(vertex).copied()
    }

    /// Vertices that have not arrived yet.
    pub fn missing(&self) -> Vec<String> {
        self.expected
            .iter()
            .filter(|v| !self.arrivals.contains_key(*v))
            .cloned()
            .collect()
    }

    pub fn failures(&self) -> &BTreeMap<String, String> {
        &self.failures
    }

    /// Experiment start time, once released.
    pub fn start(&self) -> Option<DateTime<Utc>> {
        self.start
    }

    pub fn record_arrival(&mut self, vertex: &str, at: DateTime<Utc>) -> BarrierStatus {
        if !self.expected.contains(vertex) {
            warn!(vertex = %vertex, "Arrival from a vertex outside the experiment, ignoring");
        } else if let Some(first) = self.arrivals.get(vertex) {
            debug!(vertex = %vertex, first = %first, "Duplicate arrival, keeping the first");
        } else {
            self.arrivals.insert(vertex.to_string(), at);
            debug!(
                vertex = %vertex,
                arrived = self.arrivals.len(),
                expected = self.expected.len(),
                "Vertex reached the global barrier"
            );
        }
        self.status()
    }

    /// A vertex that fails in negative time keeps the barrier closed.
    pub fn record_failure(&mut self, vertex: &str, reason: impl Into<String>) -> BarrierStatus {
        if self.start.is_none() && self.expected.contains(vertex) {
            self.failures
                .entry(vertex.to_string())
                .or_insert_with(|| reason.into());
        }
        self.status()
    }

    /// Current status; computes the start time the moment the set completes.
    pub fn status(&mut self) -> BarrierStatus {
        if let Some(start) = self.start {
            return BarrierStatus::Released { start };
        }
        if !self.failures.is_empty() {
            return BarrierStatus::Blocked {
                failed: self.failures.keys().cloned().collect(),
            };
        }
        if self.arrivals.len() < self.expected.len() {
            return BarrierStatus::Waiting {
                arrived: self.arrivals.len(),
                expected: self.expected.len(),
            };
        }
        let last = self.arrivals.values().max().copied().unwrap_or_else(Utc::now);
        let start = last.checked_add_signed(self.buffer).unwrap_or(last);
        self.start = Some(start);
        info!(
            vertices = self.expected.len(),
            last_arrival = %last,
            start = %start,
            "Global barrier released"
        );
        BarrierStatus::Released { start }
    }
}

/// Seconds on the experiment clock (`now - start`).
pub fn experiment_clock(start: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    (now - start).num_microseconds().unwrap_or(i64::MAX) as f64 / 1_000_000.0
}

/// Absolute wall-clock instant of an experiment-clock reading.
///
/// `None` when the reading falls outside the representable range.
pub fn wall_time(start: DateTime<Utc>, clock: f64) -> Option<DateTime<Utc>> {
    let micros = clock * 1_000_000.0;
    if !micros.is_finite() || micros.abs() >= i64::MAX as f64 {
        return None;
    }
    start.checked_add_signed(TimeDelta::microseconds(micros.round() as i64))
}

/// Aggregated experiment status, broadcast on every phase change.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExperimentSummary {
    pub run_id: String,
    pub phase: ExperimentPhase,
    pub launched_at: Option<DateTime<Utc>>,
    pub experiment_start: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub vertices: BTreeMap<String, VertexProgress>,
    pub action_failures: usize,
    pub reboots: usize,
    /// Vertices that did not acknowledge an abort in time
    pub unacknowledged: Vec<String>,
}

impl ExperimentSummary {
    pub fn failed(&self) -> Vec<&str> {
        self.vertices
            .iter()
            .filter(|(_, p)| matches!(p, VertexProgress::Failed { .. }))
            .map(|(n, _)| n.as_str())
            .collect()
    }

    pub fn unreachable(&self) -> Vec<&str> {
        self.vertices
            .iter()
            .filter(|(_, p)| matches!(p, VertexProgress::Unreachable { .. }))
            .map(|(n, _)| n.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn vertices(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn releases_only_after_every_arrival() {
        let mut barrier = GlobalBarrierState::new(vertices(&["a", "b", "c"]), 5.0);
        assert_eq!(
            barrier.record_arrival("b", at(12)),
            BarrierStatus::Waiting { arrived: 1, expected: 3 }
        );
        barrier.record_arrival("a", at(30));
        assert!(barrier.start().is_none());

        let status = barrier.record_arrival("c", at(20));
        assert_eq!(status, BarrierStatus::Released { start: at(35) });
        assert_eq!(barrier.start(), Some(at(35)));
    }

    #[test]
    fn first_arrival_wins() {
        let mut barrier = GlobalBarrierState::new(vertices(&["a", "b"]), 1.0);
        barrier.record_arrival("a", at(10));
        barrier.record_arrival("a", at(99));
        assert_eq!(barrier.arrival("a"), Some(at(10)));
        barrier.record_arrival("stranger", at(50));
        assert_eq!(barrier.arrived(), 1);
        assert_eq!(barrier.missing(), vec!["b".to_string()]);
    }

    #[test]
    fn failure_keeps_the_barrier_closed() {
        let mut barrier = GlobalBarrierState::new(vertices(&["a", "b"]), 1.0);
        barrier.record_arrival("a", at(1));
        let status = barrier.record_failure("b", "setup failed to start");
        assert_eq!(status, BarrierStatus::Blocked { failed: vec!["b".into()] });
        // even a late arrival cannot release it
        assert!(matches!(
            barrier.record_arrival("b", at(2)),
            BarrierStatus::Blocked { .. }
        ));
        assert!(barrier.start().is_none());
    }

    #[test]
    fn empty_barrier_releases_immediately() {
        let mut barrier = GlobalBarrierState::new(Vec::new(), 0.0);
        assert!(matches!(barrier.status(), BarrierStatus::Released { .. }));
    }

    #[test]
    fn phase_machine_rejects_skips() {
        let mut phase = ExperimentPhase::Idle;
        assert!(phase.transition(ExperimentPhase::PositiveTimeRunning).is_err());
        phase.transition(ExperimentPhase::NegativeTimeRunning).unwrap();
        phase.transition(ExperimentPhase::GlobalBarrierWait).unwrap();
        phase.transition(ExperimentPhase::PositiveTimeRunning).unwrap();
        phase.transition(ExperimentPhase::Completed).unwrap();
        assert_eq!(
            phase.transition(ExperimentPhase::Aborted),
            Err(PhaseError {
                from: ExperimentPhase::Completed,
                to: ExperimentPhase::Aborted
            })
        );
    }

    #[test]
    fn clock_conversions_agree() {
        let start = at(100);
        assert_eq!(experiment_clock(start, at(130)), 30.0);
        assert_eq!(wall_time(start, 15.5), Some(start + TimeDelta::milliseconds(15_500)));
    }

    #[test]
    fn out_of_range_clock_readings_have_no_wall_time() {
        let start = at(0);
        assert_eq!(wall_time(start, 1e13), None);
        assert_eq!(wall_time(start, 1e20), None);
        assert_eq!(wall_time(start, f64::NAN), None);
        assert!(wall_time(start, -1e9).is_some());
    }

    #[test]
    fn oversized_buffer_is_clamped() {
        let mut barrier = GlobalBarrierState::new(vertices(&["a"]), 1e300);
        let status = barrier.record_arrival("a", at(0));
        assert_eq!(
            status,
            BarrierStatus::Released {
                start: at(0) + TimeDelta::seconds(MAX_SCHEDULE_SECONDS as i64)
            }
        );

        let mut barrier = GlobalBarrierState::new(vertices(&["a"]), f64::NAN);
        assert_eq!(
            barrier.record_arrival("a", at(0)),
            BarrierStatus::Released { start: at(0) }
        );
    }
}
