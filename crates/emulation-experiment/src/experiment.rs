//! Experiment runner: registry → resolver → graph → schedules → kernel.
//!
//! Resolution and graph construction happen before any actor is spawned, so
//! a bad component declaration fails the run without touching a vertex.

use std::sync::Arc;
use std::time::Duration;

use acton_reactive::prelude::*;
use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{info, warn};

use emulation_kernel::messages::{
    AbortExperiment, HandlersReady, LaunchExperiment, StatusUpdate, WaitForHandlers,
};
use emulation_kernel::resolver::CapabilityBindings;
use emulation_kernel::{
    ActionExecutor, ComponentRegistry, ExperimentBuilder, FrozenGraph, HandlerTransport,
    Resolution, Resolver, RootRequest, UnitTable, construct_graph,
};

use crate::config::ExperimentConfig;
use crate::driver::{StatusObserver, spawn_ready_observer};
use crate::results::ExperimentResult;
use crate::units::builtin_units;

/// Resolved plan for a set of roots; what a dry run prints.
#[derive(Debug, Clone)]
pub struct Plan {
    pub roots: Vec<RootRequest>,
    pub resolution: Resolution,
}

pub struct ExperimentRunner {
    config: ExperimentConfig,
    units: UnitTable,
    executor: Option<Arc<dyn ActionExecutor>>,
    transport: Option<Arc<dyn HandlerTransport>>,
}

impl ExperimentRunner {
    /// Runner with the built-in units and the local process executor.
    pub fn new(config: ExperimentConfig) -> Self {
        Self {
            config,
            units: builtin_units(),
            executor: None,
            transport: None,
        }
    }

    pub fn with_units(mut self, units: UnitTable) -> Self {
        self.units = units;
        self
    }

    pub fn with_executor(mut self, executor: Arc<dyn ActionExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn HandlerTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    pub fn registry(&self) -> Result<ComponentRegistry> {
        let registry = ComponentRegistry::load(&self.config.repositories)?;
        Ok(registry)
    }

    /// Resolve `roots` against the configured repositories.
    pub fn plan(&self, roots: &[RootRequest]) -> Result<Plan> {
        let registry = self.registry()?;
        self.plan_with(&registry, roots)
    }

    pub fn plan_with(&self, registry: &ComponentRegistry, roots: &[RootRequest]) -> Result<Plan> {
        let defaults: &CapabilityBindings = &self.config.capability_defaults;
        let resolution = Resolver::new(registry, defaults).resolve(roots)?;
        info!(
            roots = roots.len(),
            components = resolution.order.len(),
            edges = resolution.edges.len(),
            "Components resolved"
        );
        Ok(Plan {
            roots: roots.to_vec(),
            resolution,
        })
    }

    /// Run the constructed graph for a plan.
    pub fn construct(&self, plan: &Plan) -> Result<FrozenGraph> {
        let graph = construct_graph(&plan.resolution, &self.units)?;
        Ok(graph)
    }

    /// Resolve, construct and run an experiment to completion or abort.
    pub async fn run(&self, roots: &[RootRequest]) -> Result<ExperimentResult> {
        let plan = self.plan(roots)?;
        self.run_plan(&plan).await
    }

    pub async fn run_plan(&self, plan: &Plan) -> Result<ExperimentResult> {
        let graph = self.construct(plan)?;
        let started_at = Utc::now();

        let mut runtime = ActonApp::launch_async().await;

        // Observers first so no broadcast is missed
        let (status_tx, mut status_rx) = tokio::sync::mpsc::channel::<StatusUpdate>(256);
        StatusObserver::new(status_tx).spawn(&mut runtime).await;
        let (ready_tx, mut ready_rx) = tokio::sync::mpsc::channel::<HandlersReady>(1);
        spawn_ready_observer(&mut runtime, ready_tx).await;

        let mut builder = ExperimentBuilder::new(self.config.kernel.clone(), &graph);
        if let Some(executor) = &self.executor {
            builder = builder.with_executor(executor.clone());
        }
        if let Some(transport) = &self.transport {
            builder = builder.with_transport(transport.clone());
        }
        let experiment = builder.spawn(&mut runtime).await;

        experiment
            .coordinator
            .send(WaitForHandlers {
                expected_count: experiment.vertices.len(),
            })
            .await;
        let ready = ready_rx
            .recv()
            .await
            .context("handler registration channel closed")?;
        info!(
            run_id = %experiment.run_id,
            handlers = ready.registered_count,
            "All handlers registered"
        );

        experiment.coordinator.send(LaunchExperiment).await;

        let deadline = self
            .config
            .deadline_seconds
            .filter(|s| s.is_finite() && *s > 0.0)
            .map(Duration::from_secs_f64);
        let sleep = tokio::time::sleep(deadline.unwrap_or(Duration::from_secs(86_400)));
        tokio::pin!(sleep);
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);

        let mut abort_reason: Option<String> = None;
        let mut status_updates = 0usize;
        let mut last: Option<StatusUpdate> = None;

        loop {
            let reason = tokio::select! {
                update = status_rx.recv() => {
                    let Some(update) = update else {
                        warn!("Status channel closed before the experiment finished");
                        break;
                    };
                    status_updates += 1;
                    info!(
                        phase = ?update.summary.phase,
                        vertices = update.summary.vertices.len(),
                        failed = update.summary.failed().len(),
                        unreachable = update.summary.unreachable().len(),
                        "Experiment status"
                    );
                    let finished = update.finished;
                    last = Some(update);
                    if finished {
                        break;
                    }
                    continue;
                }
                _ = &mut sleep, if deadline.is_some() && abort_reason.is_none() => {
                    "deadline reached".to_string()
                }
                _ = &mut ctrl_c, if abort_reason.is_none() => {
                    "interrupted".to_string()
                }
            };
            warn!(reason = %reason, "Aborting experiment");
            experiment
                .coordinator
                .send(AbortExperiment {
                    reason: reason.clone(),
                })
                .await;
            abort_reason = Some(reason);
        }

        let _ = runtime.shutdown_all().await;

        let summary = last.map(|u| u.summary).unwrap_or_default();
        let result = ExperimentResult {
            run_id: experiment.run_id,
            roots: plan.roots.iter().map(ToString::to_string).collect(),
            order: plan
                .resolution
                .names()
                .into_iter()
                .map(String::from)
                .collect(),
            edges: plan.resolution.edges.clone(),
            vertex_count: graph.vertex_count(),
            edge_count: graph.edge_count(),
            entries: graph
                .schedules()
                .into_iter()
                .map(|(vertex, schedule)| (vertex, schedule.len()))
                .collect(),
            started_at,
            ended_at: Utc::now(),
            abort_reason,
            status_updates,
            summary,
        };
        info!(
            run_id = %result.run_id,
            phase = ?result.summary.phase,
            completed = result.completed(),
            "Experiment finished"
        );
        Ok(result)
    }
}
