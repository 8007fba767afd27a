//! Emulation Kernel: dependency-resolved experiment graphs with a global barrier
//!
//! Components declared in a registry are resolved into a deterministic order,
//! run against an experiment graph to produce per-vertex schedules, and then
//! executed by one handler actor per vertex. Negative time configures each
//! vertex bucket by bucket; positive time starts cluster-wide once every
//! vertex has reached the global barrier.

pub mod actors;
pub mod barrier;
pub mod codec;
pub mod config;
pub mod construct;
pub mod error;
pub mod executor;
pub mod graph;
pub mod kernel;
pub mod messages;
pub mod registry;
pub mod resolver;
pub mod schedule;
pub mod transport;

pub use barrier::{ExperimentPhase, ExperimentSummary, GlobalBarrierState, VertexProgress};
pub use config::KernelConfig;
pub use construct::{ComponentUnit, UnitContext, UnitTable, construct_graph};
pub use error::{
    CodecError, ConstructError, GraphError, PhaseError, RegistryError, ResolveError,
    TransportError,
};
pub use executor::{ActionExecutor, ActionOutcome, ActionRequest, ProcessExecutor};
pub use graph::{ExperimentGraph, FrozenGraph, VertexId};
pub use kernel::{ExperimentBuilder, ExperimentHandle};
pub use registry::{ComponentDescriptor, ComponentRegistry};
pub use resolver::{Resolution, Resolver, RootRequest};
pub use schedule::{Action, ActionKind, ExecutableRef, ResumeTargets, Schedule, ScheduleEntry};
pub use transport::{ActorTransport, HandlerTransport};
