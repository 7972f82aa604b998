//! Pipeline session driver
//!
//! Wires the configured topology, bench, registry, and binder together and
//! plays the session: components register on their configured schedule,
//! deferred binds retry as peers arrive, scripted host power requests fire,
//! and everything is torn down in reverse at the end.

use anyhow::Result;
use async_trait::async_trait;
use axon_core::{parse_mode_string, NodeId};
use axon_pipeline::{
    AttachError, BindError, BindOutcome, BindState, FrameworkGraph, NodeOps, PipelineBinder,
    PipelineEvent, PipelineRegistry,
};
use chrono::Utc;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinSet;
use tokio::time::{interval, sleep, sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::report::{self, NodeReport, RunReport};

/// Host graph that retains attached surfaces for the session
struct HostGraph {
    surfaces: Mutex<HashMap<String, Arc<dyn NodeOps>>>,
}

impl HostGraph {
    fn new() -> Self {
        Self {
            surfaces: Mutex::new(HashMap::new()),
        }
    }

    async fn surface(&self, id: &NodeId) -> Option<Arc<dyn NodeOps>> {
        self.surfaces.lock().await.get(id.as_str()).cloned()
    }
}

#[async_trait]
impl FrameworkGraph for HostGraph {
    async fn attach(
        &self,
        node: &NodeId,
        peer: Option<&NodeId>,
        surface: Arc<dyn NodeOps>,
    ) -> Result<(), AttachError> {
        self.surfaces
            .lock()
            .await
            .insert(node.as_str().to_string(), surface);
        info!(node = %node, peer = ?peer.map(|p| p.as_str()), "Attached to host graph");
        Ok(())
    }

    async fn detach(&self, node: &NodeId) {
        self.surfaces.lock().await.remove(node.as_str());
        info!(node = %node, "Detached from host graph");
    }
}

pub async fn run(config: Config, once: bool, report_path: Option<&Path>) -> Result<()> {
    let started_at = Utc::now();
    let t0 = Instant::now();

    let topology = config.to_topology()?;
    for issue in topology.validate() {
        warn!(%issue, "Topology issue");
    }
    let bench = config.to_bench().await;
    let registry = Arc::new(PipelineRegistry::new(topology));
    let graph = Arc::new(HostGraph::new());
    let binder = PipelineBinder::new(registry.clone(), Arc::new(bench.clone()), graph.clone());

    // Subscribe before the first arrival so no registration is missed.
    let mut events = registry.subscribe();

    let mut arrivals = JoinSet::new();
    let expected = config.nodes.len();
    let mut last_arrival_ms = 0;
    for node in &config.nodes {
        last_arrival_ms = last_arrival_ms.max(node.arrival_ms);
        let registry = registry.clone();
        let id = NodeId::from_name(&node.id);
        let role = node.role;
        let delay = Duration::from_millis(node.arrival_ms);
        arrivals.spawn(async move {
            sleep(delay).await;
            if let Err(err) = registry.register_device(&id, role).await {
                warn!(node = %id, error = %err, "Registration failed");
            }
        });
    }

    let heartbeat = {
        let registry = registry.clone();
        let period = Duration::from_secs(config.daemon.heartbeat_interval_secs);
        tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                ticker.tick().await;
                for device in registry.devices().await {
                    let bind = device.bind_state().await;
                    let power = device.power_state().await;
                    debug!(
                        node = %device.id,
                        bind = ?bind,
                        power = ?power,
                        "Heartbeat"
                    );
                }
            }
        })
    };

    // Bind each component as it registers, and retry every deferred bind on
    // each new arrival; any of them may have been waiting for it.
    let mut deferred: Vec<NodeId> = Vec::new();
    let mut registered = 0usize;
    let mut bound = 0usize;
    let mut deferred_binds = 0u64;
    let mut events_seen = 0u64;
    let settle = sleep(Duration::from_millis(last_arrival_ms + config.daemon.settle_ms));
    tokio::pin!(settle);

    loop {
        if registered == expected && deferred.is_empty() {
            info!(bound, "All arrivals processed");
            break;
        }
        tokio::select! {
            event = events.recv() => {
                let event = match event {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Event stream lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                events_seen += 1;
                if let PipelineEvent::NodeRegistered(id) = event {
                    registered += 1;
                    let mut retry = std::mem::take(&mut deferred);
                    retry.push(id);
                    for node in retry {
                        match binder.bind(&node).await {
                            Ok(BindOutcome::Bound) => bound += 1,
                            Ok(BindOutcome::Deferred { waiting_on }) => {
                                deferred_binds += 1;
                                debug!(node = %node, waiting_on = %waiting_on, "Still waiting");
                                deferred.push(node);
                            }
                            Err(BindError::AlreadyBound(_)) => {}
                            Err(err) => warn!(node = %node, error = %err, "Bind failed"),
                        }
                    }
                }
            }
            _ = &mut settle => {
                warn!(outstanding = deferred.len(), "Settle deadline reached with binds outstanding");
                break;
            }
        }
    }
    heartbeat.abort();

    // Scripted host power requests, in time order relative to startup.
    let mut steps = config.power_steps.clone();
    steps.sort_by_key(|step| step.at_ms);
    for step in steps {
        sleep_until(t0 + Duration::from_millis(step.at_ms)).await;
        let id = NodeId::from_name(&step.node);
        let surface = match graph.surface(&id).await {
            Some(surface) => surface,
            None => {
                warn!(node = %id, "Power step for a node with no attached surface");
                continue;
            }
        };
        if let Some(mode) = &step.mode {
            let mode = parse_mode_string(mode)?;
            if let Err(err) = surface.mode_set(mode).await {
                warn!(node = %id, error = %err, "Mode set rejected");
            }
        }
        match surface.dpms(step.dpms).await {
            Ok(state) => info!(node = %id, ?state, "Power step applied"),
            Err(err) => warn!(node = %id, error = %err, "Power step failed"),
        }
    }

    // Snapshot for the report before teardown wipes the session.
    let mut nodes = Vec::new();
    for node in &config.nodes {
        let id = NodeId::from_name(&node.id);
        if let Some(device) = registry.device(&id).await {
            nodes.push(NodeReport {
                id: node.id.clone(),
                role: device.role,
                bound: device.bind_state().await == BindState::Bound,
                final_power: device.power_state().await,
                bind_attempts: device.bind_attempts().await,
            });
        }
    }

    if !once {
        info!("Session settled; press Ctrl-C to tear down");
        tokio::signal::ctrl_c().await?;
    }

    // Teardown in reverse configuration order.
    for node in config.nodes.iter().rev() {
        let id = NodeId::from_name(&node.id);
        match binder.unbind(&id).await {
            Ok(outcome) => debug!(node = %id, ?outcome, "Unbound"),
            Err(err) => warn!(node = %id, error = %err, "Unbind failed"),
        }
        if let Err(err) = registry.remove_device(&id).await {
            warn!(node = %id, error = %err, "Remove failed");
        }
    }

    let run_report = RunReport {
        started_at,
        finished_at: Utc::now(),
        nodes,
        deferred_binds,
        events_seen,
    };
    if let Some(path) = report_path {
        report::write_json(&run_report, path)?;
    }
    if once {
        println!("Session complete: {} nodes", run_report.nodes.len());
        for node in &run_report.nodes {
            println!(
                "  - {} ({:?}) bound={} power={:?} attempts={}",
                node.id, node.role, node.bound, node.final_power, node.bind_attempts
            );
        }
    }

    Ok(())
}
