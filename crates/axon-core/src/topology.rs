//! Declared pipeline topology: which nodes exist and how they chain
//!
//! The topology is the authoritative list of identities. A dependency edge
//! naming a declared node that has not registered yet is a deferral; an edge
//! naming an identity that was never declared can never be satisfied.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::node::{NodeDescriptor, NodeId, ResourceKind};

#[derive(Error, Debug)]
pub enum TopologyError {
    #[error("Node '{0}' is declared more than once")]
    DuplicateNode(NodeId),
}

/// Non-fatal issues found while validating a declared topology
///
/// A dangling peer is reported here rather than rejected at load: the
/// resolver classifies that edge as permanently missing when the node binds,
/// which is the failure the embedding process acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyIssue {
    /// Peer edge names a node that is never declared
    DanglingPeer { node: NodeId, peer: NodeId },
    /// Node names itself as its own peer
    SelfPeer { node: NodeId },
    /// More than one resource of a single-slot kind on one node
    DuplicateResource { node: NodeId, kind: ResourceKind },
}

impl std::fmt::Display for TopologyIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TopologyIssue::DanglingPeer { node, peer } => {
                write!(f, "node '{}' depends on undeclared node '{}'", node, peer)
            }
            TopologyIssue::SelfPeer { node } => {
                write!(f, "node '{}' names itself as its own peer", node)
            }
            TopologyIssue::DuplicateResource { node, kind } => {
                write!(
                    f,
                    "node '{}' declares more than one {} resource",
                    node,
                    kind.as_str()
                )
            }
        }
    }
}

/// The declared pipeline: every node the embedding process may register
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineTopology {
    nodes: HashMap<String, NodeDescriptor>,
}

impl PipelineTopology {
    /// Create an empty topology
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
        }
    }

    /// Declare a node
    pub fn add_node(&mut self, descriptor: NodeDescriptor) -> Result<(), TopologyError> {
        if self.nodes.contains_key(descriptor.id.as_str()) {
            return Err(TopologyError::DuplicateNode(descriptor.id));
        }
        self.nodes.insert(descriptor.id.0.clone(), descriptor);
        Ok(())
    }

    /// Look up a declared node by identity
    pub fn get(&self, id: &NodeId) -> Option<&NodeDescriptor> {
        self.nodes.get(id.as_str())
    }

    /// Whether the identity is declared at all
    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id.as_str())
    }

    /// Iterate over all declared nodes
    pub fn nodes(&self) -> impl Iterator<Item = &NodeDescriptor> {
        self.nodes.values()
    }

    /// The declared downstream peer of a node, when both ends exist
    pub fn downstream_of(&self, id: &NodeId) -> Option<&NodeDescriptor> {
        self.get(id)?.peer.as_ref().and_then(|peer| self.get(peer))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Check the declared topology for issues
    pub fn validate(&self) -> Vec<TopologyIssue> {
        let mut issues = Vec::new();

        for node in self.nodes.values() {
            if let Some(peer) = &node.peer {
                if peer == &node.id {
                    issues.push(TopologyIssue::SelfPeer {
                        node: node.id.clone(),
                    });
                } else if !self.contains(peer) {
                    issues.push(TopologyIssue::DanglingPeer {
                        node: node.id.clone(),
                        peer: peer.clone(),
                    });
                }
            }

            // one slot each for clock, gpio, and registers
            for kind in [ResourceKind::Clock, ResourceKind::Gpio, ResourceKind::Registers] {
                let count = node.resources.iter().filter(|r| r.kind == kind).count();
                if count > 1 {
                    issues.push(TopologyIssue::DuplicateResource {
                        node: node.id.clone(),
                        kind,
                    });
                }
            }
        }

        issues
    }
}
