//! Message types for acton-reactive actor communication.
//!
//! Handlers announce themselves over the broker; everything else between the
//! coordinator and a handler is a direct send, so each vertex only ever
//! writes its own records.

use acton_reactive::prelude::ActorHandle;
use chrono::{DateTime, Utc};

use crate::barrier::ExperimentSummary;
use crate::error::TransportError;
use crate::schedule::{Action, ActionKind, EntryId, ResumeTargets};

/// Notification that a handler is ready - broadcast by VertexHandlers on start.
///
/// Carries the handle so the coordinator can route commands to the vertex.
#[derive(Debug, Clone)]
pub struct HandlerReady {
    pub vertex: String,
    pub handle: ActorHandle,
}

/// Ask the coordinator to announce `HandlersReady` once enough handlers registered.
#[derive(Debug, Clone)]
pub struct WaitForHandlers {
    pub expected_count: usize,
}

/// Broadcast by the coordinator when the expected handlers have registered.
#[derive(Debug, Clone)]
pub struct HandlersReady {
    pub registered_count: usize,
}

/// Start the experiment: ship every schedule and enter negative time.
#[derive(Debug, Clone)]
pub struct LaunchExperiment;

/// Coordinator → handler commands.
#[derive(Debug, Clone)]
pub enum HandlerCommand {
    /// Serialized schedule frame for this vertex
    Launch { frame: Vec<u8> },
    /// Global barrier released; positive time starts at `start`
    Release { start: DateTime<Utc> },
    /// End an unbounded break; `at` is when the resume was issued
    Resume { at: DateTime<Utc> },
    /// Merge an operator pause/break into the running schedule
    Inject { start_time: f64, action: Action },
    /// Tear down immediately and acknowledge
    Abort { reason: String },
}

impl HandlerCommand {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Launch { .. } => "launch",
            Self::Release { .. } => "release",
            Self::Resume { .. } => "resume",
            Self::Inject { .. } => "inject",
            Self::Abort { .. } => "abort",
        }
    }
}

/// What a handler is reporting.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerEventKind {
    /// Every action of a negative-time bucket settled
    BucketComplete { bucket_time: f64 },
    /// An action ran; output is forwarded whatever the exit code
    ActionFinished {
        entry: EntryId,
        kind: ActionKind,
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
    },
    ActionFailed {
        entry: EntryId,
        bucket_time: Option<f64>,
        reason: String,
        fatal: bool,
        stdout: String,
        stderr: String,
    },
    /// A host reboot follows; `entries` will be replayed afterwards
    RebootScheduled {
        bucket_time: Option<f64>,
        entries: Vec<EntryId>,
    },
    /// A resume marker was reached and should be relayed
    ResumeRequested { targets: ResumeTargets },
    /// Last negative-time bucket done; arrival at the global barrier
    NegativeTimeComplete,
    /// Every positive-time entry has run
    ScheduleDrained,
    VertexFailed { reason: String },
    /// Abort acknowledged
    Aborted,
}

/// Handler → coordinator report.
#[derive(Debug, Clone)]
pub struct HandlerEvent {
    pub vertex: String,
    pub kind: HandlerEventKind,
    pub timestamp: DateTime<Utc>,
}

impl HandlerEvent {
    pub fn now(vertex: impl Into<String>, kind: HandlerEventKind) -> Self {
        Self {
            vertex: vertex.into(),
            kind,
            timestamp: Utc::now(),
        }
    }
}

/// Delivery to a handler failed after every retry.
#[derive(Debug, Clone)]
pub struct HandlerUnreachable {
    pub vertex: String,
    pub error: TransportError,
}

/// Operator resume for vertices in an unbounded break.
#[derive(Debug, Clone)]
pub struct ResumeRequest {
    pub targets: ResumeTargets,
    pub at: DateTime<Utc>,
}

/// Operator pause/break injected at an experiment time.
#[derive(Debug, Clone)]
pub struct InjectControl {
    pub targets: ResumeTargets,
    pub start_time: f64,
    pub action: Action,
}

/// Best-effort teardown of every handler.
#[derive(Debug, Clone)]
pub struct AbortExperiment {
    pub reason: String,
}

/// Abort acknowledgement window elapsed.
#[derive(Debug, Clone)]
pub struct AbortDeadline;

/// Aggregate status - broadcast by the coordinator on every phase change.
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub summary: ExperimentSummary,
    /// Set on the final update of the experiment
    pub finished: bool,
}
