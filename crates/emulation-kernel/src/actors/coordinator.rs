//! ExperimentCoordinator: drives one experiment through its phases.
//!
//! Each vertex is owned by a VertexHandler. The coordinator only:
//! 1. Collects `HandlerReady` registrations, announces `HandlersReady`
//! 2. On `LaunchExperiment`: ships every schedule frame (negative time starts)
//! 3. Records `NegativeTimeComplete` arrivals at the global barrier
//! 4. Once every vertex arrived: sends `Release { start }` to all handlers
//! 5. Relays resumes/injections, tracks drain, broadcasts `StatusUpdate`
//!
//! Deliveries run on spawned tasks with retry so a slow vertex never stalls
//! the mailbox; exhausted retries come back as `HandlerUnreachable`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use acton_reactive::prelude::*;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use mti::prelude::*;
use tracing::{debug, error, info, trace, warn};

use crate::barrier::{
    BarrierStatus, ExperimentPhase, ExperimentSummary, GlobalBarrierState, VertexProgress,
};
use crate::codec::encode_frame;
use crate::config::KernelConfig;
use crate::messages::{
    AbortDeadline, AbortExperiment, HandlerCommand, HandlerEvent, HandlerEventKind,
    HandlerReady, HandlerUnreachable, HandlersReady, InjectControl, LaunchExperiment,
    ResumeRequest, StatusUpdate, WaitForHandlers,
};
use crate::schedule::{ResumeTargets, Schedule};
use crate::transport::{HandlerTransport, deliver_with_retry};

/// Tracks abort acknowledgements.
#[derive(Debug, Clone, Default)]
struct PendingAbort {
    expected: BTreeSet<String>,
    acknowledged: BTreeSet<String>,
}

impl PendingAbort {
    fn is_complete(&self) -> bool {
        self.expected.is_subset(&self.acknowledged)
    }

    fn unacknowledged(&self) -> Vec<String> {
        self.expected
            .difference(&self.acknowledged)
            .cloned()
            .collect()
    }
}

/// Actor state for ExperimentCoordinator.
#[derive(Default, Clone)]
pub struct ExperimentCoordinatorState {
    config: KernelConfig,
    run_id: String,
    /// Schedule per vertex, frozen at graph construction
    schedules: BTreeMap<String, Schedule>,
    transport: Option<Arc<dyn HandlerTransport>>,
    /// Vertices whose handler announced itself
    registered: BTreeSet<String>,
    waiting_for: Option<usize>,
    phase: ExperimentPhase,
    barrier: Option<GlobalBarrierState>,
    /// Written only in response to the owning vertex's events
    progress: DashMap<String, VertexProgress>,
    launched_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    action_failures: usize,
    reboots: usize,
    pending_abort: Option<PendingAbort>,
}

impl std::fmt::Debug for ExperimentCoordinatorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExperimentCoordinatorState")
            .field("run_id", &self.run_id)
            .field("phase", &self.phase)
            .field("vertices", &self.schedules.len())
            .field("registered", &self.registered.len())
            .field("transport", &self.transport.is_some())
            .field("pending_abort", &self.pending_abort.is_some())
            .finish()
    }
}

impl ExperimentCoordinatorState {
    fn summary(&self) -> ExperimentSummary {
        ExperimentSummary {
            run_id: self.run_id.clone(),
            phase: self.phase,
            launched_at: self.launched_at,
            experiment_start: self.barrier.as_ref().and_then(|b| b.start()),
            finished_at: self.finished_at,
            vertices: self
                .progress
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
            action_failures: self.action_failures,
            reboots: self.reboots,
            unacknowledged: self
                .pending_abort
                .as_ref()
                .map(PendingAbort::unacknowledged)
                .unwrap_or_default(),
        }
    }

    fn status(&self) -> StatusUpdate {
        StatusUpdate {
            summary: self.summary(),
            finished: self.finished_at.is_some(),
        }
    }

    fn set_progress(&self, vertex: &str, progress: VertexProgress) {
        match self.progress.get_mut(vertex) {
            Some(mut current) if !current.is_settled() => *current = progress,
            Some(current) => {
                trace!(vertex = %vertex, current = ?*current, "Vertex already settled")
            }
            None => warn!(vertex = %vertex, "Event from a vertex outside the experiment"),
        }
    }

    fn move_to(&mut self, to: ExperimentPhase) -> bool {
        match self.phase.transition(to) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Ignoring phase change");
                false
            }
        }
    }

    fn targets(&self, targets: &ResumeTargets) -> Vec<String> {
        self.schedules
            .keys()
            .filter(|v| targets.includes(v))
            .cloned()
            .collect()
    }

    /// Release positive time; returns the commands to deliver.
    fn release(&mut self, start: DateTime<Utc>) -> Vec<(String, HandlerCommand)> {
        if self.phase == ExperimentPhase::NegativeTimeRunning {
            self.move_to(ExperimentPhase::GlobalBarrierWait);
        }
        if !self.move_to(ExperimentPhase::PositiveTimeRunning) {
            return Vec::new();
        }
        info!(
            run_id = %self.run_id,
            start = %start,
            vertices = self.schedules.len(),
            "Positive time released"
        );
        for mut entry in self.progress.iter_mut() {
            if matches!(*entry, VertexProgress::Arrived { .. }) {
                *entry = VertexProgress::Running;
            }
        }
        self.schedules
            .keys()
            .map(|v| (v.clone(), HandlerCommand::Release { start }))
            .collect()
    }

    /// Finish the experiment once every vertex settled in positive time.
    fn check_complete(&mut self) -> bool {
        if self.phase != ExperimentPhase::PositiveTimeRunning
            || !self.progress.iter().all(|e| e.value().is_settled())
        {
            return false;
        }
        if !self.move_to(ExperimentPhase::Completed) {
            return false;
        }
        self.finished_at = Some(Utc::now());
        let summary = self.summary();
        info!(
            run_id = %self.run_id,
            failed = summary.failed().len(),
            unreachable = summary.unreachable().len(),
            action_failures = self.action_failures,
            reboots = self.reboots,
            "Experiment completed"
        );
        true
    }

    fn finish_abort(&mut self) {
        if self.finished_at.is_some() {
            return;
        }
        self.finished_at = Some(Utc::now());
        let unacknowledged = self
            .pending_abort
            .as_ref()
            .map(PendingAbort::unacknowledged)
            .unwrap_or_default();
        if unacknowledged.is_empty() {
            info!(run_id = %self.run_id, "Abort acknowledged by every handler");
        } else {
            warn!(
                run_id = %self.run_id,
                unacknowledged = ?unacknowledged,
                "Handlers did not acknowledge the abort"
            );
        }
    }
}

/// Spawn a retried delivery; failures come back to the coordinator.
fn deliver(
    transport: &Option<Arc<dyn HandlerTransport>>,
    config: &KernelConfig,
    coordinator: &ActorHandle,
    commands: Vec<(String, HandlerCommand)>,
) {
    let Some(transport) = transport.clone() else {
        warn!("ExperimentCoordinator: transport not set");
        return;
    };
    for (vertex, command) in commands {
        let transport = transport.clone();
        let policy = config.transport.clone();
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            if let Err(error) =
                deliver_with_retry(transport.as_ref(), &policy, &vertex, command).await
            {
                coordinator.send(HandlerUnreachable { vertex, error }).await;
            }
        });
    }
}

/// Central coordinator actor for one experiment.
///
/// Handlers register themselves by broadcasting `HandlerReady` on start; the
/// coordinator subscribes to it and records a route through the transport.
pub struct ExperimentCoordinator {
    pub config: KernelConfig,
    pub schedules: BTreeMap<String, Schedule>,
    pub transport: Arc<dyn HandlerTransport>,
}

impl ExperimentCoordinator {
    pub fn new(
        config: KernelConfig,
        schedules: BTreeMap<String, Schedule>,
        transport: Arc<dyn HandlerTransport>,
    ) -> Self {
        Self {
            config,
            schedules,
            transport,
        }
    }

    /// Spawn the coordinator; returns its handle and the run id.
    pub async fn spawn(self, runtime: &mut ActorRuntime) -> (ActorHandle, String) {
        let run_id = "experiment".create_type_id::<V7>().to_string();
        let mut actor = runtime
            .new_actor_with_name::<ExperimentCoordinatorState>("ExperimentCoordinator".to_string());

        actor.model.config = self.config;
        actor.model.run_id = run_id.clone();
        for vertex in self.schedules.keys() {
            actor
                .model
                .progress
                .insert(vertex.clone(), VertexProgress::Pending);
        }
        actor.model.schedules = self.schedules;
        actor.model.transport = Some(self.transport);

        // Subscribe to handler registration BEFORE starting
        actor.handle().subscribe::<HandlerReady>().await;

        configure_handlers(&mut actor);

        (actor.start().await, run_id)
    }
}

fn configure_handlers(actor: &mut ManagedActor<Idle, ExperimentCoordinatorState>) {
    actor.mutate_on::<HandlerReady>(|actor, context| {
        let msg = context.message().clone();
        if !actor.model.schedules.contains_key(&msg.vertex) {
            debug!(vertex = %msg.vertex, "Handler for a vertex outside the experiment");
            return Reply::ready();
        }
        if let Some(transport) = &actor.model.transport {
            transport.register(&msg.vertex, msg.handle);
        }
        actor.model.registered.insert(msg.vertex.clone());
        debug!(
            vertex = %msg.vertex,
            registered = actor.model.registered.len(),
            "Handler registered"
        );

        match actor.model.waiting_for {
            Some(expected) if actor.model.registered.len() >= expected => {
                actor.model.waiting_for = None;
                let registered_count = actor.model.registered.len();
                let broker = actor.broker().clone();
                Reply::pending(async move {
                    broker.broadcast(HandlersReady { registered_count }).await;
                })
            }
            _ => Reply::ready(),
        }
    });

    actor.mutate_on::<WaitForHandlers>(|actor, context| {
        let expected = context.message().expected_count;
        let registered_count = actor.model.registered.len();
        if registered_count < expected {
            debug!(registered = registered_count, expected, "Waiting for handlers");
            actor.model.waiting_for = Some(expected);
            return Reply::ready();
        }
        let broker = actor.broker().clone();
        Reply::pending(async move {
            broker.broadcast(HandlersReady { registered_count }).await;
        })
    });

    actor.mutate_on::<LaunchExperiment>(|actor, _context| {
        if !actor.model.move_to(ExperimentPhase::NegativeTimeRunning) {
            return Reply::ready();
        }
        let vertices: Vec<String> = actor.model.schedules.keys().cloned().collect();
        actor.model.launched_at = Some(Utc::now());
        actor.model.barrier = Some(GlobalBarrierState::new(
            vertices.clone(),
            actor.model.config.barrier.buffer_seconds,
        ));
        info!(
            run_id = %actor.model.run_id,
            vertices = vertices.len(),
            "Launching experiment"
        );

        let mut commands = Vec::with_capacity(vertices.len());
        for (vertex, schedule) in &actor.model.schedules {
            match encode_frame(schedule) {
                Ok(frame) => {
                    actor.model.set_progress(
                        vertex,
                        VertexProgress::Configuring { last_bucket: None },
                    );
                    commands.push((vertex.clone(), HandlerCommand::Launch { frame }));
                }
                Err(e) => {
                    error!(vertex = %vertex, error = %e, "Schedule could not be encoded");
                    actor.model.set_progress(
                        vertex,
                        VertexProgress::Failed {
                            reason: e.to_string(),
                        },
                    );
                    if let Some(barrier) = actor.model.barrier.as_mut() {
                        barrier.record_failure(vertex, e.to_string());
                    }
                }
            }
        }

        // An experiment without vertices has nothing to wait for
        if let Some(BarrierStatus::Released { start }) =
            actor.model.barrier.as_mut().map(GlobalBarrierState::status)
        {
            commands.extend(actor.model.release(start));
            actor.model.check_complete();
        }

        let myself = actor.handle().clone();
        deliver(&actor.model.transport, &actor.model.config, &myself, commands);

        let status = actor.model.status();
        let broker = actor.broker().clone();
        Reply::pending(async move {
            broker.broadcast(status).await;
        })
    });

    actor.mutate_on::<HandlerEvent>(|actor, context| {
        let event = context.message().clone();
        let vertex = event.vertex.clone();
        let mut commands = Vec::new();
        let mut publish = false;

        match event.kind {
            HandlerEventKind::BucketComplete { bucket_time } => {
                trace!(vertex = %vertex, bucket_time, "Bucket complete");
                actor.model.set_progress(
                    &vertex,
                    VertexProgress::Configuring {
                        last_bucket: Some(bucket_time),
                    },
                );
            }
            HandlerEventKind::ActionFinished {
                entry,
                kind,
                exit_code,
                stdout,
                stderr,
            } => {
                debug!(
                    vertex = %vertex,
                    entry,
                    kind = ?kind,
                    exit_code = ?exit_code,
                    stdout = %stdout.trim_end(),
                    stderr = %stderr.trim_end(),
                    "Action finished"
                );
            }
            HandlerEventKind::ActionFailed {
                entry,
                bucket_time,
                reason,
                fatal,
                stdout,
                stderr,
            } => {
                actor.model.action_failures += 1;
                warn!(
                    vertex = %vertex,
                    entry,
                    bucket_time = ?bucket_time,
                    fatal,
                    reason = %reason,
                    "Action failed"
                );
                if !stdout.is_empty() || !stderr.is_empty() {
                    debug!(
                        vertex = %vertex,
                        entry,
                        stdout = %stdout.trim_end(),
                        stderr = %stderr.trim_end(),
                        "Output captured before failure"
                    );
                }
            }
            HandlerEventKind::RebootScheduled {
                bucket_time,
                entries,
            } => {
                actor.model.reboots += 1;
                info!(
                    vertex = %vertex,
                    bucket_time = ?bucket_time,
                    replay = ?entries,
                    "Vertex rebooting"
                );
            }
            HandlerEventKind::ResumeRequested { targets } => {
                let relay = actor.model.targets(&targets);
                info!(from = %vertex, targets = ?relay, "Relaying resume");
                commands.extend(
                    relay
                        .into_iter()
                        .map(|v| (v, HandlerCommand::Resume { at: event.timestamp })),
                );
            }
            HandlerEventKind::NegativeTimeComplete => {
                actor.model.set_progress(
                    &vertex,
                    VertexProgress::Arrived {
                        at: event.timestamp,
                    },
                );
                if actor.model.phase == ExperimentPhase::NegativeTimeRunning {
                    publish = actor.model.move_to(ExperimentPhase::GlobalBarrierWait);
                }
                let status = actor
                    .model
                    .barrier
                    .as_mut()
                    .map(|b| b.record_arrival(&vertex, event.timestamp));
                match status {
                    Some(BarrierStatus::Released { start })
                        if actor.model.phase == ExperimentPhase::GlobalBarrierWait =>
                    {
                        commands.extend(actor.model.release(start));
                        publish = true;
                    }
                    Some(BarrierStatus::Waiting { arrived, expected }) => {
                        debug!(vertex = %vertex, arrived, expected, "Arrival recorded");
                    }
                    Some(BarrierStatus::Blocked { failed }) => {
                        warn!(vertex = %vertex, failed = ?failed, "Barrier blocked by failed vertices");
                    }
                    _ => {}
                }
            }
            HandlerEventKind::ScheduleDrained => {
                info!(vertex = %vertex, "Vertex drained its schedule");
                actor.model.set_progress(&vertex, VertexProgress::Drained);
                publish = actor.model.check_complete();
            }
            HandlerEventKind::VertexFailed { reason } => {
                error!(vertex = %vertex, reason = %reason, "Vertex failed");
                actor.model.set_progress(
                    &vertex,
                    VertexProgress::Failed {
                        reason: reason.clone(),
                    },
                );
                if let Some(barrier) = actor.model.barrier.as_mut()
                    && let BarrierStatus::Blocked { failed } = barrier.record_failure(&vertex, reason)
                {
                    warn!(failed = ?failed, "Global barrier will not release");
                }
                actor.model.check_complete();
                publish = true;
            }
            HandlerEventKind::Aborted => {
                actor.model.set_progress(&vertex, VertexProgress::Aborted);
                if let Some(pending) = actor.model.pending_abort.as_mut() {
                    pending.acknowledged.insert(vertex.clone());
                    debug!(
                        vertex = %vertex,
                        acknowledged = pending.acknowledged.len(),
                        expected = pending.expected.len(),
                        "Abort acknowledged"
                    );
                    if pending.is_complete() {
                        actor.model.finish_abort();
                        publish = true;
                    }
                }
            }
        }

        let myself = actor.handle().clone();
        deliver(&actor.model.transport, &actor.model.config, &myself, commands);

        if !publish {
            return Reply::ready();
        }
        let status = actor.model.status();
        let broker = actor.broker().clone();
        Reply::pending(async move {
            broker.broadcast(status).await;
        })
    });

    actor.mutate_on::<HandlerUnreachable>(|actor, context| {
        let msg = context.message().clone();
        error!(vertex = %msg.vertex, error = %msg.error, "Handler unreachable");
        actor.model.set_progress(
            &msg.vertex,
            VertexProgress::Unreachable {
                reason: msg.error.to_string(),
            },
        );
        if let Some(barrier) = actor.model.barrier.as_mut() {
            barrier.record_failure(&msg.vertex, msg.error.to_string());
        }
        actor.model.check_complete();

        // always visible in aggregate status
        let status = actor.model.status();
        let broker = actor.broker().clone();
        Reply::pending(async move {
            broker.broadcast(status).await;
        })
    });

    actor.mutate_on::<ResumeRequest>(|actor, context| {
        let msg = context.message().clone();
        let relay = actor.model.targets(&msg.targets);
        info!(targets = ?relay, at = %msg.at, "Operator resume");
        let commands = relay
            .into_iter()
            .map(|v| (v, HandlerCommand::Resume { at: msg.at }))
            .collect();
        let myself = actor.handle().clone();
        deliver(&actor.model.transport, &actor.model.config, &myself, commands);
        Reply::ready()
    });

    actor.mutate_on::<InjectControl>(|actor, context| {
        let msg = context.message().clone();
        if !msg.action.is_suspension() || !(msg.start_time >= 0.0) {
            warn!(
                kind = ?msg.action.kind(),
                start_time = msg.start_time,
                "Only pause/break at a non-negative time can be injected"
            );
            return Reply::ready();
        }
        if actor.model.phase.is_terminal() {
            debug!("Experiment finished, dropping injection");
            return Reply::ready();
        }
        let relay = actor.model.targets(&msg.targets);
        info!(
            targets = ?relay,
            start_time = msg.start_time,
            kind = ?msg.action.kind(),
            "Injecting control entry"
        );
        let commands = relay
            .into_iter()
            .map(|v| {
                (
                    v,
                    HandlerCommand::Inject {
                        start_time: msg.start_time,
                        action: msg.action.clone(),
                    },
                )
            })
            .collect();
        let myself = actor.handle().clone();
        deliver(&actor.model.transport, &actor.model.config, &myself, commands);
        Reply::ready()
    });

    actor.mutate_on::<AbortExperiment>(|actor, context| {
        let reason = context.message().reason.clone();
        if !actor.model.move_to(ExperimentPhase::Aborted) {
            return Reply::ready();
        }
        warn!(run_id = %actor.model.run_id, reason = %reason, "Aborting experiment");

        let expected: BTreeSet<String> = actor.model.registered.clone();
        let commands = expected
            .iter()
            .map(|v| {
                (
                    v.clone(),
                    HandlerCommand::Abort {
                        reason: reason.clone(),
                    },
                )
            })
            .collect();
        actor.model.pending_abort = Some(PendingAbort {
            expected,
            acknowledged: BTreeSet::new(),
        });

        let myself = actor.handle().clone();
        deliver(&actor.model.transport, &actor.model.config, &myself, commands);

        if actor.model.pending_abort.as_ref().is_some_and(PendingAbort::is_complete) {
            actor.model.finish_abort();
            let status = actor.model.status();
            let broker = actor.broker().clone();
            return Reply::pending(async move {
                broker.broadcast(status).await;
            });
        }

        let ack_timeout = Duration::from_millis(actor.model.config.abort.ack_timeout_ms);
        tokio::spawn(async move {
            tokio::time::sleep(ack_timeout).await;
            myself.send(AbortDeadline).await;
        });
        Reply::ready()
    });

    actor.mutate_on::<AbortDeadline>(|actor, _context| {
        if actor.model.finished_at.is_some() {
            return Reply::ready();
        }
        actor.model.finish_abort();
        let status = actor.model.status();
        let broker = actor.broker().clone();
        Reply::pending(async move {
            broker.broadcast(status).await;
        })
    });
}
