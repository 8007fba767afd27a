//! VertexHandler: executes one vertex's schedule and reports to the coordinator.
//!
//! The actor itself only routes [`HandlerCommand`]s. Execution happens in a
//! runner task so the mailbox stays responsive to release, resume, inject and
//! abort while actions are in flight:
//!
//! ```text
//! Launch(frame) → decode → runner task
//!   ├─ negative buckets, most negative first (join_all per bucket)
//!   │   ├─ reboot requested → RebootScheduled, reboot, replay only those entries
//!   │   └─ BucketComplete
//!   ├─ NegativeTimeComplete, wait for Release(start)
//!   ├─ positive entries at start + effective time (non-blocking)
//!   └─ ScheduleDrained
//! ```

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use acton_reactive::prelude::*;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinError, JoinHandle, JoinSet};
use tracing::{debug, error, info, trace, warn};

use crate::barrier::{experiment_clock, wall_time};
use crate::codec::decode_frame;
use crate::config::ActionConfig;
use crate::executor::{ActionExecutor, ActionOutcome, ActionRequest};
use crate::messages::{HandlerCommand, HandlerEvent, HandlerEventKind, HandlerReady};
use crate::schedule::{Action, EntryId, PauseState, Schedule, ScheduleEntry, Timeline};

/// Commands forwarded from the actor to its running schedule.
#[derive(Debug)]
enum Control {
    Resume { at: DateTime<Utc> },
    Inject { start_time: f64, action: Action },
}

/// Actor state for a single vertex handler.
#[derive(Default, Clone)]
pub struct VertexHandlerState {
    vertex: String,
    coordinator: Option<ActorHandle>,
    executor: Option<Arc<dyn ActionExecutor>>,
    config: ActionConfig,
    control: Option<mpsc::UnboundedSender<Control>>,
    release: Option<Arc<watch::Sender<Option<DateTime<Utc>>>>>,
    task: Option<AbortHandle>,
}

impl std::fmt::Debug for VertexHandlerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VertexHandlerState")
            .field("vertex", &self.vertex)
            .field("coordinator", &self.coordinator.is_some())
            .field("executor", &self.executor.as_ref().map(|e| e.name()))
            .field("launched", &self.task.is_some())
            .finish()
    }
}

/// Actor executing the schedule of one vertex.
///
/// On start, broadcasts `HandlerReady` with its handle so the coordinator can
/// route commands to it without being handed the handle up front.
pub struct VertexHandler {
    pub vertex: String,
    pub executor: Arc<dyn ActionExecutor>,
    pub config: ActionConfig,
    pub coordinator: ActorHandle,
}

impl VertexHandler {
    pub fn new(
        vertex: impl Into<String>,
        executor: Arc<dyn ActionExecutor>,
        config: ActionConfig,
        coordinator: ActorHandle,
    ) -> Self {
        Self {
            vertex: vertex.into(),
            executor,
            config,
            coordinator,
        }
    }

    /// Spawn this handler in the given runtime.
    pub async fn spawn(self, runtime: &mut ActorRuntime) -> ActorHandle {
        let mut actor =
            runtime.new_actor_with_name::<VertexHandlerState>(format!("Handler:{}", self.vertex));

        actor.model.vertex = self.vertex;
        actor.model.coordinator = Some(self.coordinator);
        actor.model.executor = Some(self.executor);
        actor.model.config = self.config;

        actor.after_start(|actor| {
            let broker = actor.broker().clone();
            let ready = HandlerReady {
                vertex: actor.model.vertex.clone(),
                handle: actor.handle().clone(),
            };
            Reply::pending(async move {
                broker.broadcast(ready).await;
            })
        });

        configure_handler(&mut actor);

        actor.start().await
    }
}

fn configure_handler(actor: &mut ManagedActor<Idle, VertexHandlerState>) {
    actor.mutate_on::<HandlerCommand>(|actor, context| {
        let command = context.message().clone();
        let vertex = actor.model.vertex.clone();
        let Some(coordinator) = actor.model.coordinator.clone() else {
            warn!(vertex = %vertex, "VertexHandler: coordinator not set");
            return Reply::ready();
        };
        trace!(vertex = %vertex, command = command.label(), "Handler command");

        match command {
            HandlerCommand::Launch { frame } => {
                if actor.model.task.is_some() {
                    debug!(vertex = %vertex, "Schedule already launched, ignoring duplicate");
                    return Reply::ready();
                }
                let Some(executor) = actor.model.executor.clone() else {
                    warn!(vertex = %vertex, "VertexHandler: executor not set");
                    return Reply::ready();
                };
                let checked = match decode_frame(&frame) {
                    Ok(schedule) if schedule.owner() == vertex => Ok(schedule),
                    Ok(schedule) => Err(format!("received schedule for `{}`", schedule.owner())),
                    Err(e) => Err(format!("bad schedule frame: {e}")),
                };
                let schedule = match checked {
                    Ok(schedule) => schedule,
                    Err(reason) => {
                        warn!(vertex = %vertex, reason = %reason, "Rejecting schedule");
                        return Reply::pending(async move {
                            coordinator
                                .send(HandlerEvent::now(
                                    vertex,
                                    HandlerEventKind::VertexFailed { reason },
                                ))
                                .await;
                        });
                    }
                };

                let (control_tx, control_rx) = mpsc::unbounded_channel();
                let (release_tx, release_rx) = watch::channel(None);
                info!(
                    vertex = %vertex,
                    entries = schedule.len(),
                    buckets = schedule.negative_buckets().len(),
                    "Schedule received"
                );
                let reporter = Reporter {
                    vertex,
                    coordinator,
                };
                let runner = Runner {
                    reporter: reporter.clone(),
                    schedule,
                    executor,
                    config: actor.model.config.clone(),
                    control: control_rx,
                    release: release_rx,
                };
                let task = tokio::spawn(runner.run());
                actor.model.task = Some(task.abort_handle());
                tokio::spawn(supervise(task, reporter));
                actor.model.control = Some(control_tx);
                actor.model.release = Some(Arc::new(release_tx));
                Reply::ready()
            }
            HandlerCommand::Release { start } => {
                match &actor.model.release {
                    Some(release) => {
                        release.send_replace(Some(start));
                    }
                    None => warn!(vertex = %vertex, "Release before launch, ignoring"),
                }
                Reply::ready()
            }
            HandlerCommand::Resume { at } => {
                forward(&actor.model.control, &vertex, Control::Resume { at });
                Reply::ready()
            }
            HandlerCommand::Inject { start_time, action } => {
                forward(&actor.model.control, &vertex, Control::Inject { start_time, action });
                Reply::ready()
            }
            HandlerCommand::Abort { reason } => {
                if let Some(task) = actor.model.task.take() {
                    task.abort();
                }
                actor.model.control = None;
                info!(vertex = %vertex, reason = %reason, "Handler aborted");
                Reply::pending(async move {
                    coordinator
                        .send(HandlerEvent::now(vertex, HandlerEventKind::Aborted))
                        .await;
                })
            }
        }
    });
}

fn forward(control: &Option<mpsc::UnboundedSender<Control>>, vertex: &str, msg: Control) {
    match control {
        Some(tx) if tx.send(msg).is_ok() => {}
        _ => debug!(vertex = %vertex, "No running schedule, dropping control message"),
    }
}

/// Sends events for one vertex to the coordinator.
#[derive(Debug, Clone)]
struct Reporter {
    vertex: String,
    coordinator: ActorHandle,
}

impl Reporter {
    async fn send(&self, kind: HandlerEventKind) {
        self.coordinator
            .send(HandlerEvent::now(self.vertex.clone(), kind))
            .await;
    }
}

/// Turn a runner task that died without reporting into a vertex failure.
async fn supervise(task: JoinHandle<()>, reporter: Reporter) {
    match task.await {
        Ok(()) => {}
        Err(e) if e.is_cancelled() => {
            trace!(vertex = %reporter.vertex, "Runner cancelled");
        }
        Err(e) => {
            error!(vertex = %reporter.vertex, error = %e, "Runner task panicked");
            reporter
                .send(HandlerEventKind::VertexFailed {
                    reason: format!("handler task failed: {e}"),
                })
                .await;
        }
    }
}

/// How one action settled.
enum Settled {
    Done,
    Reboot,
    Fatal(String),
}

/// Report an action outcome; output is forwarded whatever the exit code.
async fn settle(
    reporter: &Reporter,
    entry: &ScheduleEntry,
    bucket_time: Option<f64>,
    outcome: ActionOutcome,
) -> Settled {
    let kind = entry.action.kind();
    match outcome {
        ActionOutcome::Success {
            exit_code,
            stdout,
            stderr,
        } => {
            reporter
                .send(HandlerEventKind::ActionFinished {
                    entry: entry.id,
                    kind,
                    exit_code,
                    stdout,
                    stderr,
                })
                .await;
            Settled::Done
        }
        ActionOutcome::RebootRequested {
            exit_code,
            stdout,
            stderr,
        } => {
            reporter
                .send(HandlerEventKind::ActionFinished {
                    entry: entry.id,
                    kind,
                    exit_code,
                    stdout,
                    stderr,
                })
                .await;
            Settled::Reboot
        }
        ActionOutcome::Timeout {
            after,
            stdout,
            stderr,
        } => {
            reporter
                .send(HandlerEventKind::ActionFailed {
                    entry: entry.id,
                    bucket_time,
                    reason: format!("timed out after {:.1}s", after.as_secs_f64()),
                    fatal: false,
                    stdout,
                    stderr,
                })
                .await;
            Settled::Done
        }
        ActionOutcome::ExecutionFailed { reason } => {
            reporter
                .send(HandlerEventKind::ActionFailed {
                    entry: entry.id,
                    bucket_time,
                    reason: reason.clone(),
                    fatal: true,
                    stdout: String::new(),
                    stderr: String::new(),
                })
                .await;
            Settled::Fatal(format!("entry {} could not run: {reason}", entry.id))
        }
    }
}

/// What woke the runner while it was waiting.
enum Wake {
    Due,
    Control(Control),
    Finished(Result<Option<String>, JoinError>),
    Released(bool),
}

struct Runner {
    reporter: Reporter,
    schedule: Schedule,
    executor: Arc<dyn ActionExecutor>,
    config: ActionConfig,
    control: mpsc::UnboundedReceiver<Control>,
    release: watch::Receiver<Option<DateTime<Utc>>>,
}

impl Runner {
    async fn run(mut self) {
        if let Err(reason) = self.negative_time().await {
            self.vertex_failed(reason).await;
            return;
        }
        self.reporter
            .send(HandlerEventKind::NegativeTimeComplete)
            .await;

        let Some(start) = self.await_release().await else {
            debug!(vertex = %self.reporter.vertex, "Release channel closed");
            return;
        };
        info!(vertex = %self.reporter.vertex, start = %start, "Entering positive time");

        match self.positive_time(start).await {
            Ok(()) => self.reporter.send(HandlerEventKind::ScheduleDrained).await,
            Err(reason) => self.vertex_failed(reason).await,
        }
    }

    async fn vertex_failed(&self, reason: String) {
        warn!(vertex = %self.reporter.vertex, reason = %reason, "Vertex failed");
        self.reporter
            .send(HandlerEventKind::VertexFailed { reason })
            .await;
    }

    fn request(&self, entry: &ScheduleEntry) -> ActionRequest {
        let seconds = match &entry.action {
            Action::RunExecutable {
                timeout_seconds, ..
            } => timeout_seconds.or(self.config.default_timeout_seconds),
            _ => self.config.default_timeout_seconds,
        };
        ActionRequest {
            vertex: self.reporter.vertex.clone(),
            entry: entry.id,
            action: entry.action.clone(),
            timeout: seconds
                .filter(|s| *s > 0.0)
                .and_then(|s| Duration::try_from_secs_f64(s).ok()),
        }
    }

    async fn negative_time(&mut self) -> Result<(), String> {
        let buckets: Vec<(f64, Vec<ScheduleEntry>)> = self
            .schedule
            .negative_buckets()
            .into_iter()
            .map(|b| (b.time, b.entries.into_iter().cloned().collect()))
            .collect();

        for (time, entries) in buckets {
            let (controls, actions): (Vec<_>, Vec<_>) =
                entries.into_iter().partition(|e| e.action.is_control());
            debug!(
                vertex = %self.reporter.vertex,
                bucket_time = time,
                actions = actions.len(),
                controls = controls.len(),
                "Running local barrier bucket"
            );

            self.run_bucket(time, actions).await?;
            for entry in controls {
                self.negative_control(&entry).await?;
            }
            self.reporter
                .send(HandlerEventKind::BucketComplete { bucket_time: time })
                .await;
        }
        Ok(())
    }

    /// Run one bucket to completion, replaying only reboot-requesting entries.
    async fn run_bucket(&self, time: f64, actions: Vec<ScheduleEntry>) -> Result<(), String> {
        let mut pending_reboot: BTreeSet<EntryId> = actions.iter().map(|e| e.id).collect();
        let mut reboots = 0u32;

        loop {
            let round: Vec<&ScheduleEntry> = actions
                .iter()
                .filter(|e| pending_reboot.contains(&e.id))
                .collect();
            if round.is_empty() {
                return Ok(());
            }

            let outcomes = join_all(
                round
                    .iter()
                    .map(|entry| self.executor.execute(self.request(entry))),
            )
            .await;

            pending_reboot.clear();
            let mut fatal = None;
            for (entry, outcome) in round.into_iter().zip(outcomes) {
                match settle(&self.reporter, entry, Some(time), outcome).await {
                    Settled::Done => {}
                    Settled::Reboot => {
                        pending_reboot.insert(entry.id);
                    }
                    Settled::Fatal(reason) => {
                        fatal.get_or_insert(reason);
                    }
                }
            }
            if let Some(reason) = fatal {
                return Err(reason);
            }
            if pending_reboot.is_empty() {
                return Ok(());
            }

            reboots += 1;
            if reboots > self.config.max_reboots_per_bucket {
                return Err(format!(
                    "bucket {time} requested more than {} reboots",
                    self.config.max_reboots_per_bucket
                ));
            }
            info!(
                vertex = %self.reporter.vertex,
                bucket_time = time,
                replay = pending_reboot.len(),
                round = reboots,
                "Rebooting host before replaying bucket entries"
            );
            self.reporter
                .send(HandlerEventKind::RebootScheduled {
                    bucket_time: Some(time),
                    entries: pending_reboot.iter().copied().collect(),
                })
                .await;
            self.executor
                .reboot(&self.reporter.vertex)
                .await
                .map_err(|e| format!("reboot failed: {e:#}"))?;
        }
    }

    async fn negative_control(&mut self, entry: &ScheduleEntry) -> Result<(), String> {
        match &entry.action {
            Action::Pause { duration } => {
                let wait = Duration::try_from_secs_f64(*duration)
                    .map_err(|e| format!("entry {} pauses for {duration}s: {e}", entry.id))?;
                debug!(vertex = %self.reporter.vertex, duration, "Pausing");
                tokio::time::sleep(wait).await;
            }
            Action::Break => {
                let mut pause = PauseState::default();
                pause.enter_break();
                let mut none = JoinSet::new();
                self.wait_for_resume(&pause, &mut none).await?;
            }
            Action::ResumeMarker { targets } => {
                self.reporter
                    .send(HandlerEventKind::ResumeRequested {
                        targets: targets.clone(),
                    })
                    .await;
            }
            _ => {}
        }
        Ok(())
    }

    /// Merge an injection, or hand back a resume that ends the current break.
    fn apply_control(
        &mut self,
        control: Control,
        pause: &PauseState,
        since: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        match control {
            Control::Inject { start_time, action } => {
                let kind = action.kind();
                match self.schedule.schedule_action(start_time, action) {
                    Ok(id) => info!(
                        vertex = %self.reporter.vertex,
                        entry = id,
                        start_time,
                        kind = ?kind,
                        "Injected control entry"
                    ),
                    Err(e) => warn!(vertex = %self.reporter.vertex, error = %e, "Rejected injection"),
                }
                None
            }
            Control::Resume { at } if pause.accepts_resume() && at >= since => Some(at),
            Control::Resume { .. } => {
                debug!(vertex = %self.reporter.vertex, "Not in a break, ignoring resume");
                None
            }
        }
    }

    async fn wait_for_resume(
        &mut self,
        pause: &PauseState,
        in_flight: &mut JoinSet<Option<String>>,
    ) -> Result<DateTime<Utc>, String> {
        let since = Utc::now();
        info!(vertex = %self.reporter.vertex, "In break, waiting for resume");
        loop {
            let wake = tokio::select! {
                Some(control) = self.control.recv() => Wake::Control(control),
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => Wake::Finished(joined),
                else => return Err("control channel closed during break".to_string()),
            };
            match wake {
                Wake::Control(control) => {
                    if let Some(at) = self.apply_control(control, pause, since) {
                        info!(vertex = %self.reporter.vertex, at = %at, "Resumed");
                        return Ok(at);
                    }
                }
                Wake::Finished(joined) => check_task(joined)?,
                Wake::Due | Wake::Released(_) => {}
            }
        }
    }

    async fn await_release(&mut self) -> Option<DateTime<Utc>> {
        let idle = PauseState::default();
        let since = Utc::now();
        loop {
            let current = *self.release.borrow_and_update();
            if current.is_some() {
                return current;
            }
            let wake = tokio::select! {
                changed = self.release.changed() => Wake::Released(changed.is_ok()),
                Some(control) = self.control.recv() => Wake::Control(control),
            };
            match wake {
                Wake::Released(false) => return None,
                Wake::Control(control) => {
                    self.apply_control(control, &idle, since);
                }
                _ => {}
            }
        }
    }

    async fn positive_time(&mut self, start: DateTime<Utc>) -> Result<(), String> {
        let mut timeline = Timeline::default();
        let mut pause = PauseState::default();
        let mut done: BTreeSet<EntryId> = BTreeSet::new();
        let mut in_flight: JoinSet<Option<String>> = JoinSet::new();

        loop {
            let next = self
                .schedule
                .positive_entries()
                .find(|e| !done.contains(&e.id))
                .cloned();
            let Some(entry) = next else {
                break;
            };

            let effective = timeline.effective(&entry);
            let out_of_range = || format!("entry {} due at {effective}s is out of range", entry.id);
            let due = wall_time(start, effective).ok_or_else(out_of_range)?;
            let wait = (due - Utc::now()).to_std().unwrap_or_default();
            let deadline = tokio::time::Instant::now()
                .checked_add(wait)
                .ok_or_else(out_of_range)?;

            let wake = tokio::select! {
                _ = tokio::time::sleep_until(deadline) => Wake::Due,
                Some(control) = self.control.recv() => Wake::Control(control),
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => Wake::Finished(joined),
            };
            match wake {
                Wake::Due => {}
                Wake::Control(control) => {
                    self.apply_control(control, &pause, Utc::now());
                    continue;
                }
                Wake::Finished(joined) => {
                    check_task(joined)?;
                    continue;
                }
                Wake::Released(_) => continue,
            }

            if pause.active && !pause.is_indefinite {
                pause.clear();
            }
            done.insert(entry.id);
            trace!(
                vertex = %self.reporter.vertex,
                entry = entry.id,
                effective,
                "Entry due"
            );

            match &entry.action {
                Action::Pause { duration } => {
                    timeline.apply_pause(*duration);
                    pause.pause_until(effective + duration);
                    info!(
                        vertex = %self.reporter.vertex,
                        duration,
                        resume_at = effective + duration,
                        "Paused"
                    );
                }
                Action::Break => {
                    pause.enter_break();
                    let resumed_at = self.wait_for_resume(&pause, &mut in_flight).await?;
                    timeline.apply_resume(effective, experiment_clock(start, resumed_at));
                    pause.clear();
                    debug!(
                        vertex = %self.reporter.vertex,
                        offset = timeline.offset(),
                        "Timeline rebased after break"
                    );
                }
                Action::ResumeMarker { targets } => {
                    self.reporter
                        .send(HandlerEventKind::ResumeRequested {
                            targets: targets.clone(),
                        })
                        .await;
                }
                _ => {
                    let executor = self.executor.clone();
                    let reporter = self.reporter.clone();
                    let request = self.request(&entry);
                    in_flight.spawn(async move {
                        let outcome = executor.execute(request).await;
                        match settle(&reporter, &entry, None, outcome).await {
                            Settled::Done => None,
                            Settled::Fatal(reason) => Some(reason),
                            Settled::Reboot => {
                                reporter
                                    .send(HandlerEventKind::RebootScheduled {
                                        bucket_time: None,
                                        entries: vec![entry.id],
                                    })
                                    .await;
                                executor
                                    .reboot(&reporter.vertex)
                                    .await
                                    .err()
                                    .map(|e| format!("reboot failed: {e:#}"))
                            }
                        }
                    });
                }
            }
        }

        while let Some(joined) = in_flight.join_next().await {
            check_task(joined)?;
        }
        Ok(())
    }
}

fn check_task(joined: Result<Option<String>, JoinError>) -> Result<(), String> {
    match joined {
        Ok(None) => Ok(()),
        Ok(Some(reason)) => Err(reason),
        Err(e) => Err(format!("action task failed: {e}")),
    }
}
