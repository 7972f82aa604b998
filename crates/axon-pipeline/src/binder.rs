//! Pipeline binding
//!
//! Drives a registered device through dependency resolution, host-graph
//! attachment, and resource acquisition. A bind either completes, defers
//! until the missing peer arrives, or fails without leaving anything
//! half-attached; unbind releases exactly what bind took.

use axon_core::{NodeId, NodeRole, PowerState};
use axon_hw::{HardwareError, ResourceProvider};
use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::device::{BindState, BindingRecord};
use crate::power::PowerSequencer;
use crate::registry::{PipelineEvent, PipelineRegistry};
use crate::resolve::{DependencyResolver, Resolution};
use crate::surface::{AttachError, ConnectorSurface, FrameworkGraph, NodeOps, RelaySurface};

/// How a bind attempt ended, short of an error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindOutcome {
    Bound,
    /// The declared peer has not registered yet; retry when it does
    Deferred { waiting_on: NodeId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnbindOutcome {
    Released,
    /// Nothing to release; the node never completed a bind
    NotBound,
}

#[derive(Error, Debug)]
pub enum BindError {
    #[error("Node {0} is not registered")]
    UnknownNode(NodeId),
    #[error("Node {0} is already bound")]
    AlreadyBound(NodeId),
    #[error("Peer {peer} of node {node} is not declared and can never arrive")]
    PeerMissing { node: NodeId, peer: NodeId },
    #[error("Node {node} is missing a required resource")]
    ResourceMissing {
        node: NodeId,
        #[source]
        source: HardwareError,
    },
    #[error("Node {node} failed to attach to the host graph")]
    Attach {
        node: NodeId,
        #[source]
        source: AttachError,
    },
}

/// Binds registered devices into the host framework
///
/// The binder never schedules its own retries. A deferred bind is reported
/// to the caller, who retries on the registry's `NodeRegistered` events.
pub struct PipelineBinder {
    registry: Arc<PipelineRegistry>,
    resolver: DependencyResolver,
    provider: Arc<dyn ResourceProvider>,
    graph: Arc<dyn FrameworkGraph>,
}

impl PipelineBinder {
    pub fn new(
        registry: Arc<PipelineRegistry>,
        provider: Arc<dyn ResourceProvider>,
        graph: Arc<dyn FrameworkGraph>,
    ) -> Self {
        Self {
            resolver: DependencyResolver::new(registry.clone()),
            registry,
            provider,
            graph,
        }
    }

    /// Attempt to bind a registered node
    ///
    /// Resolves the declared peer edge, attaches the role surface to the
    /// host graph, then acquires the node's resources. Every failure path
    /// rolls back to Unbound; in particular a resource failure detaches
    /// the just-attached surface so a failed bind leaks nothing.
    ///
    /// Holds the device lock for the whole attempt, so a second bind call
    /// on the same node waits and then fails with [`BindError::AlreadyBound`].
    pub async fn bind(&self, id: &NodeId) -> Result<BindOutcome, BindError> {
        let device = self
            .registry
            .device(id)
            .await
            .ok_or_else(|| BindError::UnknownNode(id.clone()))?;

        let mut guard = device.inner.lock().await;
        let inner = &mut *guard;
        if inner.removed {
            // The registry dropped this device while we were waiting for
            // its lock.
            return Err(BindError::UnknownNode(id.clone()));
        }
        if inner.bind == BindState::Bound {
            return Err(BindError::AlreadyBound(id.clone()));
        }
        inner.bind = BindState::Resolving;
        match inner.binding.as_mut() {
            Some(record) => record.attempts += 1,
            None => inner.binding = Some(BindingRecord::new()),
        }

        let peer_device = match device.descriptor.peer.clone() {
            None => None,
            Some(peer) => match self.resolver.resolve(id, &peer).await {
                Resolution::Ready(peer_device) => {
                    debug!(
                        node = %id,
                        peer = %peer,
                        peer_instance = %peer_device.instance,
                        "Dependency resolved"
                    );
                    Some(peer_device)
                }
                Resolution::Deferred { waiting_on } => {
                    inner.bind = BindState::Unbound;
                    info!(node = %id, waiting_on = %waiting_on, "Bind deferred until the peer arrives");
                    self.registry.emit(PipelineEvent::BindDeferred {
                        node: id.clone(),
                        waiting_on: waiting_on.clone(),
                    });
                    return Ok(BindOutcome::Deferred { waiting_on });
                }
                Resolution::PermanentlyMissing { peer } => {
                    inner.bind = BindState::Unbound;
                    return Err(BindError::PeerMissing {
                        node: id.clone(),
                        peer,
                    });
                }
            },
        };

        let surface: Arc<dyn NodeOps> = match device.role {
            NodeRole::Connector => Arc::new(ConnectorSurface::new(device.clone())),
            NodeRole::Encoder | NodeRole::Bridge => {
                Arc::new(RelaySurface::new(device.clone(), self.registry.clone()))
            }
        };
        let peer_id = peer_device.as_ref().map(|peer| peer.id.clone());

        if let Err(err) = self.graph.attach(id, peer_id.as_ref(), surface).await {
            inner.bind = BindState::Unbound;
            return Err(BindError::Attach {
                node: id.clone(),
                source: err,
            });
        }
        if let Some(record) = inner.binding.as_mut() {
            record.attached = true;
        }

        let sequencer =
            match PowerSequencer::acquire(self.provider.as_ref(), &device.descriptor.resources)
                .await
            {
                Ok(sequencer) => sequencer,
                Err(err) => {
                    // Roll the attach back so the host graph never keeps a
                    // surface for a node that failed to bind.
                    self.graph.detach(id).await;
                    if let Some(record) = inner.binding.as_mut() {
                        record.attached = false;
                    }
                    inner.bind = BindState::Unbound;
                    return Err(BindError::ResourceMissing {
                        node: id.clone(),
                        source: err,
                    });
                }
            };

        let attempts = if let Some(record) = inner.binding.as_mut() {
            record.peer = peer_id.clone();
            record.bound_at = Some(Utc::now());
            record.attempts
        } else {
            1
        };
        inner.power = Some(sequencer);
        inner.bind = BindState::Bound;

        info!(node = %id, peer = ?peer_id, attempts, "Node bound");
        self.registry.emit(PipelineEvent::NodeBound(id.clone()));
        Ok(BindOutcome::Bound)
    }

    /// Release a node from the host framework
    ///
    /// Powers the node off if needed, detaches its surface, and destroys
    /// the binding record. A node that never completed a bind has nothing
    /// to release and reports [`UnbindOutcome::NotBound`].
    pub async fn unbind(&self, id: &NodeId) -> Result<UnbindOutcome, BindError> {
        let device = self
            .registry
            .device(id)
            .await
            .ok_or_else(|| BindError::UnknownNode(id.clone()))?;

        let mut guard = device.inner.lock().await;
        let inner = &mut *guard;
        let attached = inner
            .binding
            .as_ref()
            .map(|record| record.attached)
            .unwrap_or(false);
        if !attached {
            warn!(node = %id, "Unbind on a node that was never bound; nothing to do");
            return Ok(UnbindOutcome::NotBound);
        }

        let mut was_on = false;
        if let Some(seq) = inner.power.as_mut() {
            was_on = seq.state() == PowerState::On;
            seq.power_off().await;
        }
        if was_on {
            self.registry.emit(PipelineEvent::PowerChanged {
                node: id.clone(),
                state: PowerState::Off,
            });
        }

        self.graph.detach(id).await;
        inner.power = None;
        inner.binding = None;
        inner.bind = BindState::Unbound;

        info!(node = %id, "Node unbound");
        self.registry.emit(PipelineEvent::NodeUnbound(id.clone()));
        Ok(UnbindOutcome::Released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axon_core::{
        parse_mode_string, DpmsMode, NodeDescriptor, PipelineTopology, ResourceKind, ResourceSpec,
    };
    use axon_hw::{SimBench, SimOpKind};
    use crate::registry::RegistryError;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct RecordingGraph {
        calls: Mutex<Vec<String>>,
        reject_attach: AtomicBool,
    }

    impl RecordingGraph {
        async fn calls(&self) -> Vec<String> {
            self.calls.lock().await.clone()
        }
    }

    #[async_trait]
    impl FrameworkGraph for RecordingGraph {
        async fn attach(
            &self,
            node: &NodeId,
            _peer: Option<&NodeId>,
            _surface: Arc<dyn NodeOps>,
        ) -> Result<(), AttachError> {
            if self.reject_attach.load(Ordering::SeqCst) {
                return Err(AttachError::Rejected("graph full".to_string()));
            }
            self.calls.lock().await.push(format!("attach {node}"));
            Ok(())
        }

        async fn detach(&self, node: &NodeId) {
            self.calls.lock().await.push(format!("detach {node}"));
        }
    }

    const LVDS_LINES: [(&str, ResourceKind); 5] = [
        ("avdd", ResourceKind::Regulator),
        ("avee", ResourceKind::Regulator),
        ("pclk", ResourceKind::Clock),
        ("psave", ResourceKind::Gpio),
        ("mmio", ResourceKind::Registers),
    ];

    async fn fixture_with_lines(
        lines: &[(&str, ResourceKind)],
    ) -> (
        SimBench,
        Arc<PipelineRegistry>,
        PipelineBinder,
        Arc<RecordingGraph>,
    ) {
        let mut topology = PipelineTopology::new();
        let mut panel = NodeDescriptor::new(NodeId::from_name("panel0"), NodeRole::Connector);
        panel.hardwired = true;
        panel.modes = vec![parse_mode_string("1024x768@60").unwrap()];
        topology.add_node(panel).unwrap();

        let mut lvds = NodeDescriptor::new(NodeId::from_name("lvds0"), NodeRole::Encoder);
        lvds.peer = Some(NodeId::from_name("panel0"));
        lvds.resources = LVDS_LINES
            .iter()
            .map(|(id, kind)| ResourceSpec::new(*kind, id))
            .collect();
        topology.add_node(lvds).unwrap();

        let mut hdmi = NodeDescriptor::new(NodeId::from_name("hdmi0"), NodeRole::Encoder);
        hdmi.peer = Some(NodeId::from_name("ghost0"));
        topology.add_node(hdmi).unwrap();

        let bench = SimBench::new();
        for (line, kind) in lines {
            bench.add_line(line, *kind).await;
        }
        let registry = Arc::new(PipelineRegistry::new(topology));
        let graph = Arc::new(RecordingGraph::default());
        let binder =
            PipelineBinder::new(registry.clone(), Arc::new(bench.clone()), graph.clone());
        (bench, registry, binder, graph)
    }

    async fn fixture() -> (
        SimBench,
        Arc<PipelineRegistry>,
        PipelineBinder,
        Arc<RecordingGraph>,
    ) {
        fixture_with_lines(&LVDS_LINES).await
    }

    #[tokio::test]
    async fn test_bind_unregistered_node() {
        let (_bench, _registry, binder, _graph) = fixture().await;
        let err = binder.bind(&NodeId::from_name("panel0")).await.unwrap_err();
        assert!(matches!(err, BindError::UnknownNode(_)));
    }

    #[tokio::test]
    async fn test_deferred_bind_completes_after_arrival() {
        let (bench, registry, binder, _graph) = fixture().await;
        let lvds = NodeId::from_name("lvds0");
        let panel = NodeId::from_name("panel0");
        let mut rx = registry.subscribe();

        let device = registry.register_device(&lvds, NodeRole::Encoder).await.unwrap();
        let outcome = binder.bind(&lvds).await.unwrap();
        assert_eq!(
            outcome,
            BindOutcome::Deferred {
                waiting_on: panel.clone()
            }
        );
        assert_eq!(device.bind_state().await, BindState::Unbound);
        assert_eq!(device.bind_attempts().await, 1);

        registry
            .register_device(&panel, NodeRole::Connector)
            .await
            .unwrap();
        assert_eq!(binder.bind(&lvds).await.unwrap(), BindOutcome::Bound);
        assert_eq!(device.bind_state().await, BindState::Bound);
        assert_eq!(device.bind_attempts().await, 2);
        assert!(bench.ops().await.is_empty());

        // Registered, deferred, peer registered, bound.
        assert!(matches!(
            rx.recv().await.unwrap(),
            PipelineEvent::NodeRegistered(ref id) if id == &lvds
        ));
        assert!(matches!(
            rx.recv().await.unwrap(),
            PipelineEvent::BindDeferred { ref waiting_on, .. } if waiting_on == &panel
        ));
        assert!(matches!(
            rx.recv().await.unwrap(),
            PipelineEvent::NodeRegistered(ref id) if id == &panel
        ));
        assert!(matches!(
            rx.recv().await.unwrap(),
            PipelineEvent::NodeBound(ref id) if id == &lvds
        ));
    }

    #[tokio::test]
    async fn test_power_cycle_through_host_events() {
        let (bench, registry, binder, _graph) = fixture().await;
        let lvds = NodeId::from_name("lvds0");
        registry
            .register_device(&NodeId::from_name("panel0"), NodeRole::Connector)
            .await
            .unwrap();
        registry.register_device(&lvds, NodeRole::Encoder).await.unwrap();
        assert_eq!(binder.bind(&lvds).await.unwrap(), BindOutcome::Bound);

        assert_eq!(
            registry.on_power_event(&lvds, DpmsMode::On).await.unwrap(),
            PowerState::On
        );
        let enables: Vec<String> = bench
            .ops()
            .await
            .iter()
            .filter(|op| op.op == SimOpKind::Enable)
            .map(|op| op.line.clone())
            .collect();
        assert_eq!(enables, vec!["avdd", "avee", "pclk", "psave", "mmio"]);

        // A repeated request touches no hardware.
        bench.clear_ops().await;
        registry.on_power_event(&lvds, DpmsMode::On).await.unwrap();
        assert!(bench.ops().await.is_empty());

        assert_eq!(
            registry.on_power_event(&lvds, DpmsMode::Suspend).await.unwrap(),
            PowerState::Off
        );
        let disables: Vec<String> = bench
            .ops()
            .await
            .iter()
            .filter(|op| op.op == SimOpKind::Disable)
            .map(|op| op.line.clone())
            .collect();
        assert_eq!(disables, vec!["mmio", "psave", "pclk", "avee", "avdd"]);
    }

    #[tokio::test]
    async fn test_double_bind_is_a_protocol_violation() {
        let (_bench, registry, binder, _graph) = fixture().await;
        let panel = NodeId::from_name("panel0");
        registry
            .register_device(&panel, NodeRole::Connector)
            .await
            .unwrap();
        assert_eq!(binder.bind(&panel).await.unwrap(), BindOutcome::Bound);
        let err = binder.bind(&panel).await.unwrap_err();
        assert!(matches!(err, BindError::AlreadyBound(_)));
    }

    #[tokio::test]
    async fn test_undeclared_peer_fails_permanently() {
        let (_bench, registry, binder, _graph) = fixture().await;
        let hdmi = NodeId::from_name("hdmi0");
        let device = registry.register_device(&hdmi, NodeRole::Encoder).await.unwrap();
        let err = binder.bind(&hdmi).await.unwrap_err();
        assert!(matches!(
            err,
            BindError::PeerMissing { ref peer, .. } if peer.as_str() == "ghost0"
        ));
        assert_eq!(device.bind_state().await, BindState::Unbound);
    }

    #[tokio::test]
    async fn test_missing_resource_rolls_back_the_attach() {
        // Bench without the required avdd supply.
        let (bench, registry, binder, graph) = fixture_with_lines(&LVDS_LINES[1..]).await;
        let lvds = NodeId::from_name("lvds0");
        registry
            .register_device(&NodeId::from_name("panel0"), NodeRole::Connector)
            .await
            .unwrap();
        let device = registry.register_device(&lvds, NodeRole::Encoder).await.unwrap();

        let err = binder.bind(&lvds).await.unwrap_err();
        assert!(matches!(err, BindError::ResourceMissing { .. }));
        assert_eq!(device.bind_state().await, BindState::Unbound);
        assert_eq!(
            graph.calls().await,
            vec!["attach lvds0".to_string(), "detach lvds0".to_string()]
        );

        // The supply shows up; the retry goes through.
        bench.add_line("avdd", ResourceKind::Regulator).await;
        assert_eq!(binder.bind(&lvds).await.unwrap(), BindOutcome::Bound);
        assert_eq!(device.bind_attempts().await, 2);
    }

    #[tokio::test]
    async fn test_rejected_attach_leaves_node_unbound() {
        let (_bench, registry, binder, graph) = fixture().await;
        let panel = NodeId::from_name("panel0");
        let device = registry
            .register_device(&panel, NodeRole::Connector)
            .await
            .unwrap();

        graph.reject_attach.store(true, Ordering::SeqCst);
        let err = binder.bind(&panel).await.unwrap_err();
        assert!(matches!(err, BindError::Attach { .. }));
        assert_eq!(device.bind_state().await, BindState::Unbound);
        assert!(graph.calls().await.is_empty());

        graph.reject_attach.store(false, Ordering::SeqCst);
        assert_eq!(binder.bind(&panel).await.unwrap(), BindOutcome::Bound);
    }

    #[tokio::test]
    async fn test_unbind_without_a_completed_bind() {
        let (_bench, registry, binder, _graph) = fixture().await;
        let lvds = NodeId::from_name("lvds0");

        let err = binder.unbind(&NodeId::from_name("panel0")).await.unwrap_err();
        assert!(matches!(err, BindError::UnknownNode(_)));

        registry.register_device(&lvds, NodeRole::Encoder).await.unwrap();
        assert_eq!(binder.unbind(&lvds).await.unwrap(), UnbindOutcome::NotBound);

        // A deferred attempt still leaves nothing to release.
        binder.bind(&lvds).await.unwrap();
        assert_eq!(binder.unbind(&lvds).await.unwrap(), UnbindOutcome::NotBound);
    }

    #[tokio::test]
    async fn test_unbind_powers_off_and_detaches() {
        let (bench, registry, binder, graph) = fixture().await;
        let lvds = NodeId::from_name("lvds0");
        registry
            .register_device(&NodeId::from_name("panel0"), NodeRole::Connector)
            .await
            .unwrap();
        let device = registry.register_device(&lvds, NodeRole::Encoder).await.unwrap();
        binder.bind(&lvds).await.unwrap();
        registry.on_power_event(&lvds, DpmsMode::On).await.unwrap();
        bench.clear_ops().await;

        assert_eq!(binder.unbind(&lvds).await.unwrap(), UnbindOutcome::Released);
        assert_eq!(device.bind_state().await, BindState::Unbound);
        assert_eq!(device.power_state().await, PowerState::Off);
        assert!(!bench.is_line_enabled("avdd").await);
        assert!(graph.calls().await.contains(&"detach lvds0".to_string()));

        // The record is gone, so a second unbind has nothing to do.
        assert_eq!(binder.unbind(&lvds).await.unwrap(), UnbindOutcome::NotBound);
        assert_eq!(device.bind_attempts().await, 0);

        // And the freed node may be removed now.
        registry.remove_device(&lvds).await.unwrap();
    }

    #[tokio::test]
    async fn test_removal_cannot_interleave_with_bind() {
        let (_bench, registry, binder, _graph) = fixture().await;
        let binder = Arc::new(binder);
        let panel = NodeId::from_name("panel0");
        let device = registry
            .register_device(&panel, NodeRole::Connector)
            .await
            .unwrap();

        // Park a removal and a bind behind a held device lock so they land
        // back to back in whichever order the scheduler picks.
        let guard = device.inner.lock().await;
        let remove = {
            let registry = registry.clone();
            let id = panel.clone();
            tokio::spawn(async move { registry.remove_device(&id).await })
        };
        let bind = {
            let binder = binder.clone();
            let id = panel.clone();
            tokio::spawn(async move { binder.bind(&id).await })
        };
        tokio::task::yield_now().await;
        drop(guard);

        let removed = remove.await.unwrap();
        let bound = bind.await.unwrap();

        // Either the bind won and the removal was refused, or the removal
        // won and the bind found the device gone. A bound device the
        // registry no longer knows about must be impossible.
        match bound {
            Ok(BindOutcome::Bound) => {
                assert!(matches!(removed, Err(RegistryError::StillBound(_))));
                assert!(registry.is_registered(&panel).await);
            }
            other => {
                assert!(matches!(other, Err(BindError::UnknownNode(_))));
                assert!(removed.is_ok());
            }
        }
        assert!(
            device.bind_state().await != BindState::Bound
                || registry.is_registered(&panel).await
        );
    }

    #[tokio::test]
    async fn test_full_session() {
        // The whole lifecycle in one sitting: the encoder arrives first and
        // defers on its panel, binds once the panel shows up, powers up and
        // down through host requests, and unbinds back to a cold state.
        let (bench, registry, binder, _graph) = fixture().await;
        let lvds = NodeId::from_name("lvds0");
        let panel = NodeId::from_name("panel0");

        let device = registry.register_device(&lvds, NodeRole::Encoder).await.unwrap();
        assert!(matches!(
            binder.bind(&lvds).await.unwrap(),
            BindOutcome::Deferred { .. }
        ));

        registry
            .register_device(&panel, NodeRole::Connector)
            .await
            .unwrap();
        assert_eq!(binder.bind(&lvds).await.unwrap(), BindOutcome::Bound);
        assert_eq!(device.power_state().await, PowerState::Off);

        assert_eq!(
            registry.on_power_event(&lvds, DpmsMode::On).await.unwrap(),
            PowerState::On
        );
        let after_first = bench.ops().await.len();
        assert_eq!(
            registry.on_power_event(&lvds, DpmsMode::On).await.unwrap(),
            PowerState::On
        );
        assert_eq!(bench.ops().await.len(), after_first);

        assert_eq!(binder.unbind(&lvds).await.unwrap(), UnbindOutcome::Released);
        assert_eq!(device.power_state().await, PowerState::Off);
    }

    #[tokio::test]
    async fn test_devices_proceed_in_parallel() {
        let (_bench, registry, binder, _graph) = fixture().await;
        let panel = NodeId::from_name("panel0");
        let lvds = NodeId::from_name("lvds0");
        registry
            .register_device(&panel, NodeRole::Connector)
            .await
            .unwrap();
        registry.register_device(&lvds, NodeRole::Encoder).await.unwrap();

        let (a, b) = tokio::join!(binder.bind(&panel), binder.bind(&lvds));
        assert_eq!(a.unwrap(), BindOutcome::Bound);
        assert_eq!(b.unwrap(), BindOutcome::Bound);

        let (a, b) = tokio::join!(
            registry.on_power_event(&panel, DpmsMode::On),
            registry.on_power_event(&lvds, DpmsMode::On)
        );
        assert_eq!(a.unwrap(), PowerState::On);
        assert_eq!(b.unwrap(), PowerState::On);
    }

    #[tokio::test]
    async fn test_concurrent_power_requests_serialize() {
        let (bench, registry, binder, _graph) = fixture().await;
        let lvds = NodeId::from_name("lvds0");
        registry
            .register_device(&NodeId::from_name("panel0"), NodeRole::Connector)
            .await
            .unwrap();
        let device = registry.register_device(&lvds, NodeRole::Encoder).await.unwrap();
        binder.bind(&lvds).await.unwrap();

        let (a, b) = tokio::join!(
            device.set_power(PowerState::On),
            device.set_power(PowerState::On)
        );
        assert_eq!(a.unwrap(), PowerState::On);
        assert_eq!(b.unwrap(), PowerState::On);

        // One walk ran, the other found the state already satisfied.
        let enables = bench
            .ops()
            .await
            .iter()
            .filter(|op| op.op == SimOpKind::Enable)
            .count();
        assert_eq!(enables, 5);
    }
}
