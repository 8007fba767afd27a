//! Acton-reactive actors for the emulation kernel.
//!
//! ```text
//! HandlerReady (broadcast) → Coordinator (records route)
//! LaunchExperiment → Coordinator
//!   ├─ Launch(frame) → VertexHandlers (retried delivery)
//!   │   ├─ BucketComplete / ActionFinished / RebootScheduled → Coordinator
//!   │   └─ NegativeTimeComplete → Coordinator (global barrier arrival)
//!   ├─ Release(start) → VertexHandlers once every vertex arrived
//!   │   └─ ScheduleDrained → Coordinator
//!   └─ StatusUpdate (broadcast) on every phase change
//! ```
//!
//! Each handler owns its vertex's schedule and pause state; the coordinator
//! owns the barrier and nothing else writes to it.

mod coordinator;
mod handler;

pub use coordinator::{ExperimentCoordinator, ExperimentCoordinatorState};
pub use handler::{VertexHandler, VertexHandlerState};
