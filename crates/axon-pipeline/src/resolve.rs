//! Deferred dependency resolution
//!
//! Answers one question: is a node's declared peer available right now?
//! The answer distinguishes a peer that has not arrived yet from one that
//! never will, because only the former is worth retrying.

use axon_core::NodeId;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::device::Device;
use crate::registry::PipelineRegistry;

/// Outcome of a single resolution pass
pub enum Resolution {
    /// The peer is registered; here is its device
    Ready(Arc<Device>),
    /// The peer is declared but has not registered yet; retry on arrival
    Deferred { waiting_on: NodeId },
    /// The peer is not declared in the topology at all and can never arrive
    PermanentlyMissing { peer: NodeId },
}

/// Resolves declared peer edges against the registry
///
/// Resolution is read-only: it changes no device state and emits no events,
/// so callers may probe as often as they like.
pub struct DependencyResolver {
    registry: Arc<PipelineRegistry>,
}

impl DependencyResolver {
    pub fn new(registry: Arc<PipelineRegistry>) -> Self {
        Self { registry }
    }

    pub async fn resolve(&self, node: &NodeId, peer: &NodeId) -> Resolution {
        if !self.registry.topology().contains(peer) {
            warn!(node = %node, peer = %peer, "Peer is not declared anywhere and can never arrive");
            return Resolution::PermanentlyMissing { peer: peer.clone() };
        }
        match self.registry.device(peer).await {
            Some(device) => {
                debug!(node = %node, peer = %peer, "Peer is registered");
                Resolution::Ready(device)
            }
            None => {
                debug!(node = %node, peer = %peer, "Peer not arrived yet, deferring");
                Resolution::Deferred {
                    waiting_on: peer.clone(),
                }
            }
        }
    }
}
