//! Display pipeline binding and power sequencing
//!
//! Takes a declared [`axon_core::PipelineTopology`], tracks which components
//! have actually registered, binds them into a host framework once their
//! declared peers arrive, and walks their power resources up and down in
//! hardware order. Binds that cannot complete yet defer; the embedder
//! retries them on registry events.

pub mod binder;
pub mod device;
pub mod power;
pub mod registry;
pub mod resolve;
pub mod surface;

pub use binder::{BindError, BindOutcome, PipelineBinder, UnbindOutcome};
pub use device::{BindState, BindingRecord, Device, PowerError};
pub use power::PowerSequencer;
pub use registry::{PipelineEvent, PipelineRegistry, RegistryError};
pub use resolve::{DependencyResolver, Resolution};
pub use surface::{
    downstream_modes, AttachError, ConnectorSurface, FrameworkGraph, NodeOps, RelaySurface,
    SurfaceError,
};
