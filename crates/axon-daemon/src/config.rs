//! Configuration loading and validation

use anyhow::Result;
use axon_core::{
    parse_mode_string, DpmsMode, NodeDescriptor, NodeId, NodeRole, PipelineTopology, ResourceKind,
    ResourceSpec,
};
use axon_hw::SimBench;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default, rename = "node")]
    pub nodes: Vec<NodeConfig>,
    #[serde(default, rename = "power")]
    pub power_steps: Vec<PowerStepConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Heartbeat interval in seconds (periodic status log)
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// Grace period after the last configured arrival before giving up on
    /// outstanding deferred binds
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval(),
            settle_ms: default_settle_ms(),
        }
    }
}

fn default_heartbeat_interval() -> u64 {
    2
}

fn default_settle_ms() -> u64 {
    2000
}

/// One declared pipeline component
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub id: String,
    pub role: NodeRole,
    /// Downstream peer this node needs before it can bind
    pub peer: Option<String>,
    #[serde(default)]
    pub hardwired: bool,
    /// Modes as "WIDTHxHEIGHT@HZ" strings
    #[serde(default)]
    pub modes: Vec<String>,
    /// Milliseconds after startup at which this component registers
    #[serde(default)]
    pub arrival_ms: u64,
    #[serde(default, rename = "resource")]
    pub resources: Vec<ResourceConfig>,
}

/// One declared hardware resource, plus its simulated bench behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    pub kind: ResourceKind,
    pub id: String,
    #[serde(default)]
    pub optional: bool,
    /// Per-resource enable wait bound override in milliseconds
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Simulated backend latency in milliseconds
    #[serde(default)]
    pub delay_ms: u64,
    #[serde(default)]
    pub fail_enable: bool,
    #[serde(default)]
    pub fail_disable: bool,
    /// Leave the line out of the bench entirely
    #[serde(default)]
    pub absent: bool,
}

/// One scripted host power request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowerStepConfig {
    pub node: String,
    pub dpms: DpmsMode,
    /// Milliseconds after startup at which the request fires
    #[serde(default)]
    pub at_ms: u64,
    /// Mode to stage before the transition
    pub mode: Option<String>,
}

impl Config {
    /// Build the declared topology
    pub fn to_topology(&self) -> Result<PipelineTopology> {
        let mut topology = PipelineTopology::new();
        for node in &self.nodes {
            let mut descriptor = NodeDescriptor::new(NodeId::from_name(&node.id), node.role);
            descriptor.peer = node.peer.as_deref().map(NodeId::from_name);
            descriptor.hardwired = node.hardwired;
            for mode in &node.modes {
                descriptor.modes.push(parse_mode_string(mode)?);
            }
            for resource in &node.resources {
                let mut spec = ResourceSpec::new(resource.kind, &resource.id);
                spec.optional = resource.optional;
                spec.timeout_ms = resource.timeout_ms;
                descriptor.resources.push(spec);
            }
            topology.add_node(descriptor)?;
        }
        Ok(topology)
    }

    /// Build the simulated bench the resource specs resolve against
    pub async fn to_bench(&self) -> SimBench {
        let bench = SimBench::new();
        for node in &self.nodes {
            for resource in &node.resources {
                if resource.absent {
                    continue;
                }
                bench.add_line(&resource.id, resource.kind).await;
                if resource.delay_ms > 0 {
                    bench
                        .set_delay(&resource.id, Duration::from_millis(resource.delay_ms))
                        .await;
                }
                if resource.fail_enable {
                    bench.set_fail_enable(&resource.id, true).await;
                }
                if resource.fail_disable {
                    bench.set_fail_disable(&resource.id, true).await;
                }
            }
        }
        bench
    }
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    } else {
        info!(
            path = %path.display(),
            "Configuration file not found, using defaults"
        );
        Ok(Config {
            daemon: DaemonConfig::default(),
            nodes: Vec::new(),
            power_steps: Vec::new(),
        })
    }
}

fn resource(kind: ResourceKind, id: &str) -> ResourceConfig {
    ResourceConfig {
        kind,
        id: id.to_string(),
        optional: false,
        timeout_ms: None,
        delay_ms: 0,
        fail_enable: false,
        fail_disable: false,
        absent: false,
    }
}

/// Save an example configuration to file
///
/// The example registers the encoder before its panel, so a fresh run shows
/// one deferred bind completing on the panel's arrival.
pub fn save_default_config(path: &Path) -> Result<()> {
    let config = Config {
        daemon: DaemonConfig::default(),
        nodes: vec![
            NodeConfig {
                id: "lvds0".to_string(),
                role: NodeRole::Encoder,
                peer: Some("panel0".to_string()),
                hardwired: false,
                modes: Vec::new(),
                arrival_ms: 0,
                resources: vec![
                    resource(ResourceKind::Regulator, "avdd-1v0"),
                    resource(ResourceKind::Regulator, "avdd-1v8"),
                    resource(ResourceKind::Regulator, "avdd-3v3"),
                    resource(ResourceKind::Clock, "pclk"),
                    resource(ResourceKind::Gpio, "psave"),
                    resource(ResourceKind::Registers, "lvds-mmio"),
                ],
            },
            NodeConfig {
                id: "panel0".to_string(),
                role: NodeRole::Connector,
                peer: None,
                hardwired: true,
                modes: vec!["1024x768@60".to_string()],
                arrival_ms: 150,
                resources: Vec::new(),
            },
        ],
        power_steps: vec![
            PowerStepConfig {
                node: "lvds0".to_string(),
                dpms: DpmsMode::On,
                at_ms: 500,
                mode: Some("1024x768@60".to_string()),
            },
            PowerStepConfig {
                node: "lvds0".to_string(),
                dpms: DpmsMode::Off,
                at_ms: 900,
                mode: None,
            },
        ],
    };

    let content = toml::to_string_pretty(&config)?;
    std::fs::write(path, content)?;
    Ok(())
}
