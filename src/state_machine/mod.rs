//! # State Machines
//!
//! Two kinds of state live here: the engine-side [`ExecutionPhase`] lifecycle
//! of a job execution, and the per-partition projection of event streams into
//! [`JobState`] maintained by [`DistributedStateMachine`].

pub mod distributed;
pub mod errors;
pub mod lifecycle;
pub mod registry;
pub mod states;

pub use distributed::{DistributedStateMachine, Projector};
pub use errors::{StateMachineError, StateMachineResult};
pub use lifecycle::{JobLifecycle, PhaseEvent};
pub use registry::StateRegistry;
pub use states::{ExecutionPhase, JobState, StateDelta};
