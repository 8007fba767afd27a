//! Typed failures for every kernel surface.
//!
//! Resolution failures are static and always fatal to a launch attempt, so
//! their `Display` text names the exact components and capabilities involved.

use std::path::PathBuf;

use thiserror::Error;

use crate::barrier::ExperimentPhase;

/// Failures while loading or validating component descriptors.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("component `{name}` is declared twice ({first} and {second})")]
    DuplicateComponent {
        name: String,
        first: String,
        second: String,
    },

    #[error("component `{name}` lists itself in `{field}`")]
    SelfReference { name: String, field: &'static str },

    #[error("component `{name}` provides capability `{capability}` and lists it in {field}")]
    SelfCapability {
        name: String,
        field: &'static str,
        capability: String,
    },

    #[error("component `{name}` has an empty name or capability entry")]
    EmptyName { name: String },

    #[error("failed to read descriptor {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse descriptor {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Failures while turning requested roots into an execution order.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("component `{component}` references unknown component `{missing}`")]
    UnknownComponent { component: String, missing: String },

    #[error("no component provides capability `{capability}` required by `{component}`")]
    UnsatisfiedCapability {
        component: String,
        capability: String,
    },

    #[error(
        "capability `{capability}` is provided by several components ({}); bind one as default or list exactly one as a root",
        candidates.join(", ")
    )]
    AmbiguousCapability {
        capability: String,
        candidates: Vec<String>,
    },

    #[error(
        "default `{component}` for capability `{capability}` is not one of its providers ({})",
        candidates.join(", ")
    )]
    InvalidDefault {
        capability: String,
        component: String,
        candidates: Vec<String>,
    },

    #[error("cyclic dependency: {}", render_cycle(cycle))]
    CyclicDependency { cycle: Vec<String> },
}

fn render_cycle(cycle: &[String]) -> String {
    match cycle.first() {
        Some(first) => format!("{} -> {}", cycle.join(" -> "), first),
        None => String::from("<empty>"),
    }
}

/// Failures raised by the experiment graph.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum GraphError {
    #[error("vertex `{0}` already exists")]
    DuplicateVertex(String),

    #[error("vertex `{0}` does not exist")]
    UnknownVertex(String),

    #[error("edge `{0}` does not exist")]
    UnknownEdge(String),

    #[error("invalid start time {time} for vertex `{vertex}`")]
    InvalidStartTime { vertex: String, time: f64 },

    #[error("invalid pause duration {duration} for vertex `{vertex}`")]
    InvalidDuration { vertex: String, duration: f64 },
}

/// Failures while executing resolved components against the graph.
#[derive(Debug, Error)]
pub enum ConstructError {
    #[error("component `{component}` references unregistered unit `{unit}`")]
    UnknownUnit { component: String, unit: String },

    #[error("component `{component}` failed while building the graph: {source:#}")]
    UnitFailed {
        component: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Failures of the binary schedule envelope.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("frame is truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("frame of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },

    #[error("unsupported wire version {0}")]
    Version(u16),

    #[error("malformed schedule: {0}")]
    Invalid(String),

    #[error("bincode: {0}")]
    Bincode(#[from] bincode::Error),
}

/// Failures of the coordinator → handler channel.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("handler for `{vertex}` unreachable after {attempts} attempt(s): {reason}")]
    Unreachable {
        vertex: String,
        attempts: u32,
        reason: String,
    },

    #[error("no route to handler for `{0}`")]
    NoRoute(String),

    #[error("channel to `{vertex}` failed: {reason}")]
    Send { vertex: String, reason: String },
}

/// Illegal transition of the experiment state machine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("illegal phase transition {from:?} -> {to:?}")]
pub struct PhaseError {
    pub from: ExperimentPhase,
    pub to: ExperimentPhase,
}
