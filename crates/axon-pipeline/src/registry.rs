//! Device registry
//!
//! Tracks which topology nodes have registered, hands out shared [`Device`]
//! handles, and broadcasts [`PipelineEvent`]s so embedders can react to
//! arrivals and retry deferred binds. There is exactly one registry per
//! pipeline; nothing here is process-global.

use axon_core::{DpmsMode, NodeId, NodeRole, PipelineTopology, PowerState};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info};

use crate::device::{BindState, Device, PowerError};

/// Broadcast to every subscriber on registry and lifecycle changes
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    NodeRegistered(NodeId),
    NodeRemoved(NodeId),
    NodeBound(NodeId),
    NodeUnbound(NodeId),
    BindDeferred { node: NodeId, waiting_on: NodeId },
    PowerChanged { node: NodeId, state: PowerState },
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Node {0} is not declared in the pipeline topology")]
    UndeclaredNode(NodeId),
    #[error("Node {node} is declared as {declared:?} but registered as {registered:?}")]
    RoleMismatch {
        node: NodeId,
        declared: NodeRole,
        registered: NodeRole,
    },
    #[error("Node {0} is already registered")]
    AlreadyRegistered(NodeId),
    #[error("Node {0} is not registered")]
    NotRegistered(NodeId),
    #[error("Node {0} is still bound; unbind it before removal")]
    StillBound(NodeId),
}

/// Registry of arrived devices for one pipeline
pub struct PipelineRegistry {
    topology: PipelineTopology,
    // Map lock is held only across map operations, never across a device
    // await. The device mutex may be taken while holding no registry lock.
    devices: RwLock<HashMap<String, Arc<Device>>>,
    event_tx: broadcast::Sender<PipelineEvent>,
}

impl PipelineRegistry {
    pub fn new(topology: PipelineTopology) -> Self {
        let (event_tx, _) = broadcast::channel(100);
        Self {
            topology,
            devices: RwLock::new(HashMap::new()),
            event_tx,
        }
    }

    pub fn topology(&self) -> &PipelineTopology {
        &self.topology
    }

    /// Subscribe to pipeline events
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.event_tx.subscribe()
    }

    /// Register an arrived component against its topology declaration
    ///
    /// The node must be declared, must not already be registered, and the
    /// registering driver must agree with the declared role.
    pub async fn register_device(
        &self,
        id: &NodeId,
        role: NodeRole,
    ) -> Result<Arc<Device>, RegistryError> {
        let descriptor = self
            .topology
            .get(id)
            .ok_or_else(|| RegistryError::UndeclaredNode(id.clone()))?;
        if descriptor.role != role {
            return Err(RegistryError::RoleMismatch {
                node: id.clone(),
                declared: descriptor.role,
                registered: role,
            });
        }

        let device = {
            let mut devices = self.devices.write().await;
            if devices.contains_key(id.as_str()) {
                return Err(RegistryError::AlreadyRegistered(id.clone()));
            }
            let device = Arc::new(Device::new(descriptor.clone(), self.event_tx.clone()));
            devices.insert(id.as_str().to_string(), device.clone());
            device
        };

        info!(node = %id, role = ?role, instance = %device.instance, "Device registered");
        self.emit(PipelineEvent::NodeRegistered(id.clone()));
        Ok(device)
    }

    /// Drop a device from the registry
    ///
    /// Refused while the device is bound; unbind first. Removal does not
    /// cascade to peers that depend on this node, the embedder owns the
    /// teardown order.
    pub async fn remove_device(&self, id: &NodeId) -> Result<(), RegistryError> {
        let device = {
            let devices = self.devices.read().await;
            devices.get(id.as_str()).cloned()
        }
        .ok_or_else(|| RegistryError::NotRegistered(id.clone()))?;

        // The device lock stays held from the bind-state check through the
        // map removal, so no bind can land in between. Lock order is device
        // then map; the binder never takes the device lock while holding
        // the map lock, so the order cannot invert.
        let mut inner = device.inner.lock().await;
        if inner.bind == BindState::Bound {
            return Err(RegistryError::StillBound(id.clone()));
        }
        inner.removed = true;
        self.devices.write().await.remove(id.as_str());
        drop(inner);

        info!(node = %id, "Device removed");
        self.emit(PipelineEvent::NodeRemoved(id.clone()));
        Ok(())
    }

    pub async fn device(&self, id: &NodeId) -> Option<Arc<Device>> {
        self.devices.read().await.get(id.as_str()).cloned()
    }

    pub async fn devices(&self) -> Vec<Arc<Device>> {
        self.devices.read().await.values().cloned().collect()
    }

    pub async fn is_registered(&self, id: &NodeId) -> bool {
        self.devices.read().await.contains_key(id.as_str())
    }

    /// Host-side DPMS entry point
    ///
    /// STANDBY and SUSPEND collapse to Off before they reach the device, so
    /// the sequencer only ever sees the two real states.
    pub async fn on_power_event(
        &self,
        id: &NodeId,
        mode: DpmsMode,
    ) -> Result<PowerState, PowerError> {
        let device = self
            .device(id)
            .await
            .ok_or_else(|| PowerError::UnknownNode(id.clone()))?;
        let desired = mode.collapse();
        debug!(node = %id, dpms = ?mode, desired = ?desired, "Host power event");
        device.set_power(desired).await
    }

    pub(crate) fn emit(&self, event: PipelineEvent) {
        let _ = self.event_tx.send(event);
    }
}
