//! Hardware resource access for axon
//!
//! Wraps the platform's regulator, clock, GPIO, and register backends behind
//! the [`ResourceProvider`] trait and hands out [`ResourceHandle`]s with
//! bounded enable waits. Ships a simulated bench for tests and the demo
//! daemon.

pub mod provider;
pub mod resource;
pub mod sim;

pub use provider::{ControlError, ResourceControl, ResourceProvider, DEFAULT_ENABLE_TIMEOUT_MS};
pub use resource::{HardwareError, ResourceHandle};
pub use sim::{SimBench, SimOp, SimOpKind};
