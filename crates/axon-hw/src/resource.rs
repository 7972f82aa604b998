//! Acquired resource handles with bounded enables and idempotent disables

use axon_core::{ResourceKind, ResourceSpec};
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::provider::{ResourceControl, ResourceProvider, DEFAULT_ENABLE_TIMEOUT_MS};

#[derive(Error, Debug)]
pub enum HardwareError {
    #[error("Required resource {0} not found")]
    RequiredMissing(String),
    #[error("Failed to enable {resource}: {reason}")]
    Enable { resource: String, reason: String },
    #[error("Timed out after {waited_ms}ms waiting for {resource}")]
    Timeout { resource: String, waited_ms: u64 },
}

/// An acquired hardware resource
///
/// The handle tracks software enable state so repeated enables and disables
/// are no-ops, and bounds every backend call so a stuck provider surfaces as
/// an error instead of a hang. A declared-optional resource the provider
/// does not have yields an invalid handle whose operations all skip.
pub struct ResourceHandle {
    spec: ResourceSpec,
    control: Option<Box<dyn ResourceControl>>,
    enabled: bool,
    timeout: Duration,
}

impl std::fmt::Debug for ResourceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceHandle")
            .field("spec", &self.spec)
            .field("valid", &self.control.is_some())
            .field("enabled", &self.enabled)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl ResourceHandle {
    /// Acquire the backend for a declared resource without enabling it
    pub async fn acquire(
        provider: &dyn ResourceProvider,
        spec: ResourceSpec,
    ) -> Result<Self, HardwareError> {
        let control = provider.lookup(&spec).await;
        if control.is_none() {
            if spec.optional {
                debug!(
                    resource = %spec.label(),
                    "Optional resource not present, continuing without it"
                );
            } else {
                return Err(HardwareError::RequiredMissing(spec.label()));
            }
        }
        let timeout_ms = spec.timeout_ms.unwrap_or(DEFAULT_ENABLE_TIMEOUT_MS);
        Ok(Self {
            spec,
            control,
            enabled: false,
            timeout: Duration::from_millis(timeout_ms),
        })
    }

    pub fn label(&self) -> String {
        self.spec.label()
    }

    pub fn kind(&self) -> ResourceKind {
        self.spec.kind
    }

    /// False when the resource was declared optional and the provider had
    /// no backend for it
    pub fn is_valid(&self) -> bool {
        self.control.is_some()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Enable the resource, bounded by the configured timeout
    ///
    /// No-op when already enabled or when the handle is invalid. Never
    /// retries; a failure or timeout leaves the handle disabled.
    pub async fn enable(&mut self) -> Result<(), HardwareError> {
        if self.enabled {
            return Ok(());
        }
        let control = match self.control.as_mut() {
            Some(control) => control,
            None => return Ok(()),
        };

        let waited_ms = self.timeout.as_millis() as u64;
        match timeout(self.timeout, control.enable()).await {
            Ok(Ok(())) => {
                self.enabled = true;
                debug!(resource = %self.spec.label(), "Resource enabled");
                Ok(())
            }
            Ok(Err(e)) => Err(HardwareError::Enable {
                resource: self.spec.label(),
                reason: e.to_string(),
            }),
            Err(_) => Err(HardwareError::Timeout {
                resource: self.spec.label(),
                waited_ms,
            }),
        }
    }

    /// Disable the resource
    ///
    /// Never fails: teardown paths must run to completion, so backend
    /// failures and timeouts are logged and swallowed. The handle counts as
    /// disabled afterwards regardless.
    pub async fn disable(&mut self) {
        if !self.enabled {
            return;
        }
        if let Some(control) = self.control.as_mut() {
            match timeout(self.timeout, control.disable()).await {
                Ok(Ok(())) => debug!(resource = %self.spec.label(), "Resource disabled"),
                Ok(Err(e)) => warn!(
                    resource = %self.spec.label(),
                    error = %e,
                    "Disable failed, continuing teardown"
                ),
                Err(_) => warn!(
                    resource = %self.spec.label(),
                    "Disable timed out, continuing teardown"
                ),
            }
        }
        self.enabled = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimBench, SimOpKind};

    fn spec(kind: ResourceKind, id: &str) -> ResourceSpec {
        ResourceSpec::new(kind, id)
    }

    #[tokio::test]
    async fn test_required_resource_missing() {
        let bench = SimBench::new();
        let err = ResourceHandle::acquire(&bench, spec(ResourceKind::Clock, "pclk"))
            .await
            .unwrap_err();
        assert!(matches!(err, HardwareError::RequiredMissing(_)));
    }

    #[tokio::test]
    async fn test_optional_resource_missing_is_skipped() {
        let bench = SimBench::new();
        let mut optional = spec(ResourceKind::Regulator, "vaa");
        optional.optional = true;

        let mut handle = ResourceHandle::acquire(&bench, optional).await.unwrap();
        assert!(!handle.is_valid());

        // operations on an invalid handle touch no hardware
        handle.enable().await.unwrap();
        assert!(!handle.is_enabled());
        handle.disable().await;
        assert!(bench.ops().await.is_empty());
    }

    #[tokio::test]
    async fn test_enable_is_idempotent() {
        let bench = SimBench::new();
        bench.add_line("pclk", ResourceKind::Clock).await;

        let mut handle = ResourceHandle::acquire(&bench, spec(ResourceKind::Clock, "pclk"))
            .await
            .unwrap();
        handle.enable().await.unwrap();
        handle.enable().await.unwrap();
        assert!(handle.is_enabled());

        let ops = bench.ops().await;
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].op, SimOpKind::Enable);
    }

    #[tokio::test]
    async fn test_disable_swallows_backend_failure() {
        let bench = SimBench::new();
        bench.add_line("pclk", ResourceKind::Clock).await;
        bench.set_fail_disable("pclk", true).await;

        let mut handle = ResourceHandle::acquire(&bench, spec(ResourceKind::Clock, "pclk"))
            .await
            .unwrap();
        handle.enable().await.unwrap();
        handle.disable().await;
        assert!(!handle.is_enabled());
        // the backend refused, so the line is physically still on
        assert!(bench.is_line_enabled("pclk").await);

        // disabling again is a no-op even with the fault cleared
        bench.set_fail_disable("pclk", false).await;
        handle.disable().await;
        assert!(bench.ops().await.iter().all(|op| op.op != SimOpKind::Disable));
    }

    #[tokio::test(start_paused = true)]
    async fn test_enable_timeout() {
        let bench = SimBench::new();
        bench.add_line("pclk", ResourceKind::Clock).await;
        bench.set_delay("pclk", Duration::from_secs(5)).await;

        let mut handle = ResourceHandle::acquire(&bench, spec(ResourceKind::Clock, "pclk"))
            .await
            .unwrap();
        let err = handle.enable().await.unwrap_err();
        assert!(matches!(err, HardwareError::Timeout { .. }));
        assert!(!handle.is_enabled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_override_extends_the_bound() {
        let bench = SimBench::new();
        bench.add_line("slow-pll", ResourceKind::Clock).await;
        bench.set_delay("slow-pll", Duration::from_secs(5)).await;

        // 5s of settle time would blow the default bound, but the spec
        // asks for more.
        let mut slow = spec(ResourceKind::Clock, "slow-pll");
        slow.timeout_ms = Some(10_000);
        let mut handle = ResourceHandle::acquire(&bench, slow).await.unwrap();
        handle.enable().await.unwrap();
        assert!(handle.is_enabled());
    }
}
