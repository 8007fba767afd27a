//! Results of an experiment run.
//!
//! Captures:
//! - The resolved component order and why each edge exists
//! - Graph size and per-vertex schedule sizes
//! - The final aggregated status (phase, per-vertex progress, failures)

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use emulation_kernel::resolver::ResolvedEdge;
use emulation_kernel::{ExperimentPhase, ExperimentSummary};

/// Outcome of one `run`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentResult {
    pub run_id: String,
    /// Requested roots as given
    pub roots: Vec<String>,
    /// Components in execution order
    pub order: Vec<String>,
    pub edges: Vec<ResolvedEdge>,
    pub vertex_count: usize,
    pub edge_count: usize,
    /// Schedule entries per vertex
    pub entries: BTreeMap<String, usize>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    /// Why the runner requested an abort, if it did
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<String>,
    /// Number of status updates observed
    pub status_updates: usize,
    pub summary: ExperimentSummary,
}

impl ExperimentResult {
    pub fn completed(&self) -> bool {
        self.summary.phase == ExperimentPhase::Completed
            && self.summary.failed().is_empty()
            && self.summary.unreachable().is_empty()
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let result = serde_json::from_str(&json)?;
        Ok(result)
    }
}

/// Format milliseconds as a human-readable duration.
pub fn format_duration(ms: i64) -> String {
    if ms < 1000 {
        format!("{}ms", ms)
    } else if ms < 60_000 {
        format!("{:.1}s", ms as f64 / 1000.0)
    } else {
        let mins = ms / 60_000;
        let secs = (ms % 60_000) / 1000;
        format!("{}m {}s", mins, secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use emulation_kernel::VertexProgress;

    fn result(phase: ExperimentPhase, h2: VertexProgress) -> ExperimentResult {
        let now = Utc::now();
        ExperimentResult {
            run_id: "experiment_01".into(),
            roots: vec!["web".into()],
            order: vec!["hosts".into(), "web".into()],
            edges: Vec::new(),
            vertex_count: 2,
            edge_count: 0,
            entries: BTreeMap::from([("h1".to_string(), 1), ("h2".to_string(), 1)]),
            started_at: now,
            ended_at: now,
            abort_reason: None,
            status_updates: 3,
            summary: ExperimentSummary {
                run_id: "experiment_01".into(),
                phase,
                vertices: BTreeMap::from([
                    ("h1".to_string(), VertexProgress::Drained),
                    ("h2".to_string(), h2),
                ]),
                ..Default::default()
            },
        }
    }

    #[test]
    fn completed_requires_every_vertex_drained() {
        assert!(result(ExperimentPhase::Completed, VertexProgress::Drained).completed());
        assert!(
            !result(
                ExperimentPhase::Completed,
                VertexProgress::Failed { reason: "x".into() }
            )
            .completed()
        );
        assert!(!result(ExperimentPhase::Aborted, VertexProgress::Aborted).completed());
    }

    #[test]
    fn results_survive_a_save_load_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.json");
        let saved = result(ExperimentPhase::Completed, VertexProgress::Drained);
        saved.save(&path).unwrap();
        let loaded = ExperimentResult::load(&path).unwrap();
        assert_eq!(loaded.summary, saved.summary);
        assert_eq!(loaded.order, saved.order);
    }

    #[test]
    fn durations_are_readable() {
        assert_eq!(format_duration(250), "250ms");
        assert_eq!(format_duration(1500), "1.5s");
        assert_eq!(format_duration(125_000), "2m 5s");
    }
}
