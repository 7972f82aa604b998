//! Role capability surfaces
//!
//! What the host framework sees once a node is bound: detection, mode
//! enumeration, mode setting, and DPMS. Connectors answer for themselves;
//! encoders and bridges relay for the sink at the end of their peer chain.

use async_trait::async_trait;
use axon_core::{ConnectionStatus, DisplayMode, DpmsMode, NodeId, PipelineTopology, PowerState};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::device::{BindState, Device, PowerError};
use crate::registry::PipelineRegistry;

#[derive(Error, Debug)]
pub enum SurfaceError {
    #[error("Mode {0} is not supported by the downstream sink")]
    UnsupportedMode(DisplayMode),
    #[error("Node {0} is not bound")]
    NotBound(NodeId),
}

#[derive(Error, Debug)]
pub enum AttachError {
    #[error("Host rejected attachment: {0}")]
    Rejected(String),
}

/// Capability surface a bound node exposes to the host
///
/// `get_modes` is a cheap snapshot of declared data. `detect` may consult
/// device state. `mode_set` stages a mode for the next power-on rather than
/// touching hardware immediately.
#[async_trait]
pub trait NodeOps: Send + Sync {
    async fn detect(&self) -> ConnectionStatus {
        ConnectionStatus::Unknown
    }

    fn get_modes(&self) -> Vec<DisplayMode> {
        Vec::new()
    }

    async fn mode_set(&self, mode: DisplayMode) -> Result<(), SurfaceError>;

    async fn dpms(&self, mode: DpmsMode) -> Result<PowerState, PowerError>;
}

/// Host-side component graph the binder attaches surfaces to
///
/// `attach` runs while the node's state lock is held; implementations
/// should store the surface and return promptly. `detach` is infallible,
/// teardown has no failure path to report into.
#[async_trait]
pub trait FrameworkGraph: Send + Sync {
    async fn attach(
        &self,
        node: &NodeId,
        peer: Option<&NodeId>,
        surface: Arc<dyn NodeOps>,
    ) -> Result<(), AttachError>;

    async fn detach(&self, node: &NodeId);
}

/// Walk the peer chain from `start` and return the first non-empty mode
/// list found
///
/// A node's own declaration terminates the walk, so a connector reports
/// its own modes. Cycles in a malformed topology end the walk at the first
/// repeated node.
pub fn downstream_modes(topology: &PipelineTopology, start: &NodeId) -> Vec<DisplayMode> {
    let mut seen = HashSet::new();
    let mut descriptor = topology.get(start);
    while let Some(node) = descriptor {
        if !seen.insert(node.id.as_str().to_string()) {
            return Vec::new();
        }
        if !node.modes.is_empty() {
            return node.modes.clone();
        }
        descriptor = topology.downstream_of(&node.id);
    }
    Vec::new()
}

/// Surface for connector nodes
pub struct ConnectorSurface {
    device: Arc<Device>,
}

impl ConnectorSurface {
    pub fn new(device: Arc<Device>) -> Self {
        Self { device }
    }
}

#[async_trait]
impl NodeOps for ConnectorSurface {
    async fn detect(&self) -> ConnectionStatus {
        if self.device.descriptor.hardwired {
            ConnectionStatus::Connected
        } else {
            ConnectionStatus::Unknown
        }
    }

    fn get_modes(&self) -> Vec<DisplayMode> {
        self.device.descriptor.modes.clone()
    }

    async fn mode_set(&self, mode: DisplayMode) -> Result<(), SurfaceError> {
        if !self.get_modes().contains(&mode) {
            debug!(node = %self.device.id, mode = %mode, "Rejected unsupported mode");
            return Err(SurfaceError::UnsupportedMode(mode));
        }
        self.device.stage_mode(mode).await
    }

    async fn dpms(&self, mode: DpmsMode) -> Result<PowerState, PowerError> {
        self.device.set_power(mode.collapse()).await
    }
}

/// Surface for encoder and bridge nodes
///
/// Both roles forward the stream rather than terminate it, so they report
/// Connected while bound and advertise their downstream sink's modes.
pub struct RelaySurface {
    device: Arc<Device>,
    registry: Arc<PipelineRegistry>,
}

impl RelaySurface {
    pub fn new(device: Arc<Device>, registry: Arc<PipelineRegistry>) -> Self {
        Self { device, registry }
    }
}

#[async_trait]
impl NodeOps for RelaySurface {
    async fn detect(&self) -> ConnectionStatus {
        match self.device.bind_state().await {
            BindState::Bound => ConnectionStatus::Connected,
            _ => ConnectionStatus::Unknown,
        }
    }

    fn get_modes(&self) -> Vec<DisplayMode> {
        downstream_modes(self.registry.topology(), &self.device.id)
    }

    async fn mode_set(&self, mode: DisplayMode) -> Result<(), SurfaceError> {
        if !self.get_modes().contains(&mode) {
            debug!(node = %self.device.id, mode = %mode, "Rejected unsupported mode");
            return Err(SurfaceError::UnsupportedMode(mode));
        }
        self.device.stage_mode(mode).await
    }

    async fn dpms(&self, mode: DpmsMode) -> Result<PowerState, PowerError> {
        self.device.set_power(mode.collapse()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::BindingRecord;
    use crate::power::PowerSequencer;
    use axon_core::{parse_mode_string, NodeDescriptor, NodeRole};
    use axon_hw::SimBench;

    fn chain_topology() -> PipelineTopology {
        let mut topology = PipelineTopology::new();
        let mut panel = NodeDescriptor::new(NodeId::from_name("panel0"), NodeRole::Connector);
        panel.hardwired = true;
        panel.modes = vec![
            parse_mode_string("1024x768@60").unwrap(),
            parse_mode_string("1920x1080@60").unwrap(),
        ];
        topology.add_node(panel).unwrap();

        let mut lvds = NodeDescriptor::new(NodeId::from_name("lvds0"), NodeRole::Encoder);
        lvds.peer = Some(NodeId::from_name("panel0"));
        topology.add_node(lvds).unwrap();

        let mut bridge = NodeDescriptor::new(NodeId::from_name("bridge0"), NodeRole::Bridge);
        bridge.peer = Some(NodeId::from_name("lvds0"));
        topology.add_node(bridge).unwrap();
        topology
    }

    async fn registered(registry: &Arc<PipelineRegistry>, name: &str, role: NodeRole) -> Arc<Device> {
        registry
            .register_device(&NodeId::from_name(name), role)
            .await
            .unwrap()
    }

    async fn mark_bound(device: &Device) {
        let mut inner = device.inner.lock().await;
        inner.bind = BindState::Bound;
        inner.power = Some(
            PowerSequencer::acquire(&SimBench::new(), &[])
                .await
                .unwrap(),
        );
        inner.binding = Some(BindingRecord::new());
    }

    #[tokio::test]
    async fn test_connector_detect() {
        let registry = Arc::new(PipelineRegistry::new(chain_topology()));
        let panel = registered(&registry, "panel0", NodeRole::Connector).await;
        let surface = ConnectorSurface::new(panel);
        assert_eq!(surface.detect().await, ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn test_relay_detect_tracks_bind_state() {
        let registry = Arc::new(PipelineRegistry::new(chain_topology()));
        let lvds = registered(&registry, "lvds0", NodeRole::Encoder).await;
        let surface = RelaySurface::new(lvds.clone(), registry.clone());

        assert_eq!(surface.detect().await, ConnectionStatus::Unknown);
        mark_bound(&lvds).await;
        assert_eq!(surface.detect().await, ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn test_modes_relay_down_the_chain() {
        let topology = chain_topology();
        let modes = downstream_modes(&topology, &NodeId::from_name("bridge0"));
        assert_eq!(modes.len(), 2);
        assert_eq!(modes[0], parse_mode_string("1024x768@60").unwrap());

        let registry = Arc::new(PipelineRegistry::new(topology));
        let lvds = registered(&registry, "lvds0", NodeRole::Encoder).await;
        let surface = RelaySurface::new(lvds, registry.clone());
        assert_eq!(surface.get_modes().len(), 2);
    }

    #[tokio::test]
    async fn test_mode_walk_survives_a_peer_cycle() {
        let mut topology = PipelineTopology::new();
        let mut a = NodeDescriptor::new(NodeId::from_name("a"), NodeRole::Bridge);
        a.peer = Some(NodeId::from_name("b"));
        topology.add_node(a).unwrap();
        let mut b = NodeDescriptor::new(NodeId::from_name("b"), NodeRole::Bridge);
        b.peer = Some(NodeId::from_name("a"));
        topology.add_node(b).unwrap();

        assert!(downstream_modes(&topology, &NodeId::from_name("a")).is_empty());
    }

    #[tokio::test]
    async fn test_mode_set_validates_against_sink() {
        let registry = Arc::new(PipelineRegistry::new(chain_topology()));
        let lvds = registered(&registry, "lvds0", NodeRole::Encoder).await;
        mark_bound(&lvds).await;
        let surface = RelaySurface::new(lvds.clone(), registry.clone());

        let bogus = parse_mode_string("800x600@75").unwrap();
        let err = surface.mode_set(bogus).await.unwrap_err();
        assert!(matches!(err, SurfaceError::UnsupportedMode(_)));
        assert_eq!(lvds.pending_mode().await, None);

        let good = parse_mode_string("1920x1080@60").unwrap();
        surface.mode_set(good).await.unwrap();
        assert_eq!(lvds.pending_mode().await, Some(good));
    }

    #[tokio::test]
    async fn test_dpms_collapses_intermediate_levels() {
        let registry = Arc::new(PipelineRegistry::new(chain_topology()));
        let panel = registered(&registry, "panel0", NodeRole::Connector).await;
        mark_bound(&panel).await;
        let surface = ConnectorSurface::new(panel.clone());

        assert_eq!(surface.dpms(DpmsMode::On).await.unwrap(), PowerState::On);
        assert_eq!(
            surface.dpms(DpmsMode::Standby).await.unwrap(),
            PowerState::Off
        );
        assert_eq!(panel.power_state().await, PowerState::Off);
    }
}
