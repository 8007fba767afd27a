//! The emulation kernel: one coordinator plus one handler per vertex.
//!
//! ## Usage
//!
//! ```ignore
//! use emulation_kernel::{ExperimentBuilder, KernelConfig, ProcessExecutor};
//! use acton_reactive::prelude::*;
//!
//! let mut runtime = ActonApp::launch_async().await;
//!
//! // Coordinator first, then handlers - they self-register via HandlerReady
//! let experiment = ExperimentBuilder::new(config, &graph)
//!     .with_executor(Arc::new(ProcessExecutor::new(config.actions.clone())))
//!     .spawn(&mut runtime)
//!     .await;
//!
//! experiment.coordinator.send(WaitForHandlers { expected_count: experiment.vertices.len() }).await;
//! // ... on HandlersReady:
//! experiment.coordinator.send(LaunchExperiment).await;
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use acton_reactive::prelude::*;
use tracing::info;

use crate::actors::{ExperimentCoordinator, VertexHandler};
use crate::config::KernelConfig;
use crate::executor::{ActionExecutor, ProcessExecutor};
use crate::graph::FrozenGraph;
use crate::schedule::Schedule;
use crate::transport::{ActorTransport, HandlerTransport};

/// Handles of a spawned experiment.
#[derive(Debug, Clone)]
pub struct ExperimentHandle {
    pub coordinator: ActorHandle,
    pub run_id: String,
    /// Vertex names, one handler each
    pub vertices: Vec<String>,
}

/// Builder spawning the coordinator and the per-vertex handlers.
///
/// Uses the broker pub/sub pattern for registration: handlers announce
/// themselves with a `HandlerReady` broadcast the coordinator subscribes to.
pub struct ExperimentBuilder {
    config: KernelConfig,
    schedules: BTreeMap<String, Schedule>,
    executor: Option<Arc<dyn ActionExecutor>>,
    transport: Option<Arc<dyn HandlerTransport>>,
}

impl ExperimentBuilder {
    /// Build from a constructed graph; every vertex gets a handler.
    pub fn new(config: KernelConfig, graph: &FrozenGraph) -> Self {
        Self::from_schedules(config, graph.schedules())
    }

    pub fn from_schedules(config: KernelConfig, schedules: BTreeMap<String, Schedule>) -> Self {
        Self {
            config,
            schedules,
            executor: None,
            transport: None,
        }
    }

    /// Executor used by every handler; defaults to [`ProcessExecutor`].
    pub fn with_executor(mut self, executor: Arc<dyn ActionExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Coordinator → handler channel; defaults to [`ActorTransport`].
    pub fn with_transport(mut self, transport: Arc<dyn HandlerTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Spawn the coordinator, then one handler per vertex.
    pub async fn spawn(self, runtime: &mut ActorRuntime) -> ExperimentHandle {
        let executor = self
            .executor
            .unwrap_or_else(|| Arc::new(ProcessExecutor::new(self.config.actions.clone())));
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(ActorTransport::new()));
        let vertices: Vec<String> = self.schedules.keys().cloned().collect();
        let actions = self.config.actions.clone();

        // Spawn the coordinator first (it subscribes to HandlerReady)
        let (coordinator, run_id) =
            ExperimentCoordinator::new(self.config, self.schedules, transport)
                .spawn(runtime)
                .await;

        for vertex in &vertices {
            VertexHandler::new(
                vertex.clone(),
                executor.clone(),
                actions.clone(),
                coordinator.clone(),
            )
            .spawn(runtime)
            .await;
        }

        info!(
            run_id = %run_id,
            vertices = vertices.len(),
            executor = executor.name(),
            "Experiment actors spawned"
        );

        ExperimentHandle {
            coordinator,
            run_id,
            vertices,
        }
    }
}
