//! Resource provider seam between the power sequencer and hardware backends
//!
//! Regulator, clock, GPIO, and register-window drivers live behind these
//! traits. The pipeline never touches a backend directly; it acquires a
//! handle and drives it through the bounded operations in
//! [`crate::resource::ResourceHandle`].

use async_trait::async_trait;
use axon_core::ResourceSpec;
use thiserror::Error;

/// Bound on a single enable or disable call when the spec gives no override
pub const DEFAULT_ENABLE_TIMEOUT_MS: u64 = 500;

/// Failure reported by a resource backend
#[derive(Error, Debug)]
#[error("{0}")]
pub struct ControlError(pub String);

/// One controllable hardware resource
///
/// Implementations do not need to be idempotent; the owning handle never
/// calls `enable` while already enabled or `disable` while already disabled.
#[async_trait]
pub trait ResourceControl: Send + Sync {
    async fn enable(&mut self) -> Result<(), ControlError>;
    async fn disable(&mut self) -> Result<(), ControlError>;
}

/// Resolves declared resource requirements to controllable backends
#[async_trait]
pub trait ResourceProvider: Send + Sync {
    /// Look up the backend for a declared resource
    ///
    /// `None` means the provider has no such resource. Whether that fails
    /// the caller depends on the spec's optional flag.
    async fn lookup(&self, spec: &ResourceSpec) -> Option<Box<dyn ResourceControl>>;
}
