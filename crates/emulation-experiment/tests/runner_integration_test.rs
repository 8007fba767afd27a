//! End-to-end tests for the experiment runner.
//!
//! Component repositories are written to a temp directory, resolved,
//! constructed with the built-in units and run on a recording executor.

use std::path::Path;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::RwLock;

use emulation_experiment::config::ExperimentConfig;
use emulation_experiment::experiment::ExperimentRunner;
use emulation_kernel::error::ResolveError;
use emulation_kernel::schedule::{Action, ExecutableRef};
use emulation_kernel::{
    ActionExecutor, ActionOutcome, ActionRequest, ExperimentPhase, RootRequest, VertexProgress,
};

/// Records `(vertex, program)` for every run action.
#[derive(Default)]
struct RecordingExecutor {
    runs: RwLock<Vec<(String, String)>>,
}

impl ActionExecutor for RecordingExecutor {
    fn name(&self) -> &str {
        "recording"
    }

    fn execute(&self, request: ActionRequest) -> BoxFuture<'_, ActionOutcome> {
        Box::pin(async move {
            if let Action::RunExecutable {
                program: ExecutableRef::Path(program),
                ..
            } = &request.action
            {
                self.runs
                    .write()
                    .await
                    .push((request.vertex.clone(), program.clone()));
            }
            ActionOutcome::Success {
                exit_code: Some(0),
                stdout: String::new(),
                stderr: String::new(),
            }
        })
    }

    fn reboot(&self, _vertex: &str) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

fn write_descriptor(repo: &Path, file: &str, json: serde_json::Value) {
    std::fs::write(repo.join(file), serde_json::to_vec_pretty(&json).unwrap()).unwrap();
}

fn config(repo: &Path) -> ExperimentConfig {
    let mut config = ExperimentConfig {
        repositories: vec![repo.to_path_buf()],
        deadline_seconds: Some(10.0),
        ..ExperimentConfig::default()
    };
    config.kernel.barrier.buffer_seconds = 0.05;
    config
}

fn roots(raw: &[&str]) -> Vec<RootRequest> {
    raw.iter().map(|r| r.parse().unwrap()).collect()
}

#[tokio::test]
async fn resolves_constructs_and_runs_to_completion() {
    let repo = tempfile::tempdir().unwrap();
    write_descriptor(
        repo.path(),
        "hosts.json",
        serde_json::json!({
            "name": "hosts",
            "capability_provides": ["topology"],
            "unit": "core.hosts"
        }),
    );
    write_descriptor(
        repo.path(),
        "setup.json",
        serde_json::json!({
            "name": "setup",
            "capability_depends": ["topology"],
            "unit": "core.run"
        }),
    );
    write_descriptor(
        repo.path(),
        "workload.json",
        serde_json::json!({
            "name": "workload",
            "component_depends": ["setup"],
            "unit": "core.run"
        }),
    );

    let executor = Arc::new(RecordingExecutor::default());
    let runner = ExperimentRunner::new(config(repo.path())).with_executor(executor.clone());

    let requested = roots(&["workload:cmd=go,at=0.1", "setup:cmd=prep,at=-1", "hosts:h1,h2"]);
    let plan = runner.plan(&requested).unwrap();
    assert_eq!(plan.resolution.names(), vec!["hosts", "setup", "workload"]);

    let result = runner.run_plan(&plan).await.unwrap();

    assert!(result.completed(), "summary: {:?}", result.summary);
    assert_eq!(result.summary.phase, ExperimentPhase::Completed);
    assert_eq!(result.order, vec!["hosts", "setup", "workload"]);
    assert_eq!(result.vertex_count, 2);
    assert_eq!(result.entries.get("h1"), Some(&2));
    assert!(result.abort_reason.is_none());
    assert!(
        result
            .summary
            .vertices
            .values()
            .all(|p| *p == VertexProgress::Drained)
    );

    let runs = executor.runs.read().await.clone();
    assert_eq!(runs.len(), 4);
    for vertex in ["h1", "h2"] {
        let programs: Vec<&str> = runs
            .iter()
            .filter(|(v, _)| v == vertex)
            .map(|(_, p)| p.as_str())
            .collect();
        assert_eq!(programs, vec!["prep", "go"]);
    }

    let out = repo.path().join("results.json");
    result.save(&out).unwrap();
    let loaded = emulation_experiment::results::ExperimentResult::load(&out).unwrap();
    assert_eq!(loaded.run_id, result.run_id);
}

#[tokio::test]
async fn cyclic_components_fail_before_any_vertex_runs() {
    let repo = tempfile::tempdir().unwrap();
    write_descriptor(
        repo.path(),
        "a.json",
        serde_json::json!({ "name": "a", "component_depends": ["b"], "unit": "core.hosts" }),
    );
    write_descriptor(
        repo.path(),
        "b.json",
        serde_json::json!({ "name": "b", "component_depends": ["a"] }),
    );

    let executor = Arc::new(RecordingExecutor::default());
    let runner = ExperimentRunner::new(config(repo.path())).with_executor(executor.clone());

    let err = runner.run(&roots(&["a:h1"])).await.unwrap_err();
    match err.downcast_ref::<ResolveError>() {
        Some(ResolveError::CyclicDependency { cycle }) => {
            assert!(cycle.contains(&"a".to_string()));
            assert!(cycle.contains(&"b".to_string()));
        }
        other => panic!("expected a cycle, got {other:?}"),
    }
    assert!(executor.runs.read().await.is_empty());
}

#[tokio::test]
async fn missing_capability_is_reported_with_the_requester() {
    let repo = tempfile::tempdir().unwrap();
    write_descriptor(
        repo.path(),
        "app.json",
        serde_json::json!({ "name": "app", "capability_depends": ["database"] }),
    );

    let runner = ExperimentRunner::new(config(repo.path()));
    let err = runner.plan(&roots(&["app"])).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ResolveError>(),
        Some(ResolveError::UnsatisfiedCapability { .. })
    ));
}
