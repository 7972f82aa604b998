//! Axon Core - identity, topology, and power model types
//!
//! This crate provides the foundational types for the Axon system:
//! - Node identity and roles for display pipeline components
//! - Declared pipeline topology with validation
//! - Binary power-state model with DPMS collapse at the host boundary
//! - Display mode payloads for mode staging

pub mod mode;
pub mod node;
pub mod topology;

pub use mode::{parse_mode_string, DisplayMode, ModeError};
pub use node::{
    ConnectionStatus, DpmsMode, NodeDescriptor, NodeId, NodeRole, PowerState, ResourceKind,
    ResourceSpec,
};
pub use topology::{PipelineTopology, TopologyError, TopologyIssue};
