//! Node identity, roles, and the power model for pipeline components

use serde::{Deserialize, Serialize};

use crate::mode::DisplayMode;

/// Stable identifier for a pipeline node, derived from its position in the
/// declared topology
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    /// Create a NodeId from a topology node name
    pub fn from_name(name: &str) -> Self {
        Self(name.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role a node plays in the display pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Terminal sink exposing the physical output
    Connector,
    /// Converts the scanout stream for its sink
    Encoder,
    /// Forwards the stream to a further encoder or connector
    Bridge,
}

/// Power state of a node's hardware
///
/// The state machine is binary. DPMS standby and suspend collapse to Off at
/// the host boundary; see [`DpmsMode::collapse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerState {
    /// All resources disabled
    Off,
    /// All resources enabled in order
    On,
}

impl Default for PowerState {
    fn default() -> Self {
        Self::Off
    }
}

/// Host-facing DPMS power levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DpmsMode {
    On,
    Standby,
    Suspend,
    Off,
}

impl DpmsMode {
    /// Collapse the four DPMS levels onto the binary power model
    ///
    /// The hardware this models has no distinct low-power states between on
    /// and off, so standby and suspend both mean Off.
    pub fn collapse(self) -> PowerState {
        match self {
            DpmsMode::On => PowerState::On,
            DpmsMode::Standby | DpmsMode::Suspend | DpmsMode::Off => PowerState::Off,
        }
    }
}

/// Result of probing whether a connector has a sink attached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
    /// No probe hardware available to answer the question
    Unknown,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self::Unknown
    }
}

/// Kind of hardware resource a node depends on
///
/// The power sequence has one slot for each kind except regulators, which
/// may appear several times and keep their declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    /// Supply rail
    Regulator,
    /// Pixel or PLL clock
    Clock,
    /// Power-save line
    Gpio,
    /// Register window, enabled last
    Registers,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Regulator => "regulator",
            ResourceKind::Clock => "clock",
            ResourceKind::Gpio => "gpio",
            ResourceKind::Registers => "registers",
        }
    }
}

/// Declared hardware resource requirement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub kind: ResourceKind,
    /// Identifier the resource provider resolves (supply name, clock id,
    /// line name, window name)
    pub id: String,
    /// When true a provider miss leaves the handle invalid instead of
    /// failing the bind
    #[serde(default)]
    pub optional: bool,
    /// Per-resource override of the enable/disable wait bound
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl ResourceSpec {
    pub fn new(kind: ResourceKind, id: &str) -> Self {
        Self {
            kind,
            id: id.to_string(),
            optional: false,
            timeout_ms: None,
        }
    }

    /// Label used in logs and errors, e.g. "regulator/avdd-1v0"
    pub fn label(&self) -> String {
        format!("{}/{}", self.kind.as_str(), self.id)
    }
}

/// Declared description of a pipeline node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDescriptor {
    /// Topology identity
    pub id: NodeId,
    /// Role the registering driver must match
    pub role: NodeRole,
    /// Downstream dependency edge, by topology identity
    pub peer: Option<NodeId>,
    /// Connector is permanently wired to its sink, no probe needed
    #[serde(default)]
    pub hardwired: bool,
    /// Modes this node advertises
    #[serde(default)]
    pub modes: Vec<DisplayMode>,
    /// Hardware resources in power-on declaration order
    #[serde(default)]
    pub resources: Vec<ResourceSpec>,
}

impl NodeDescriptor {
    /// Create a descriptor with no edge, no modes, and no resources
    pub fn new(id: NodeId, role: NodeRole) -> Self {
        Self {
            id,
            role,
            peer: None,
            hardwired: false,
            modes: Vec::new(),
            resources: Vec::new(),
        }
    }
}
