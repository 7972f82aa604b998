//! Session run reports

use anyhow::Result;
use axon_core::{NodeRole, PowerState};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;
use tracing::info;

/// Snapshot of one session, written with `--report`
#[derive(Debug, Serialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub nodes: Vec<NodeReport>,
    /// Bind attempts that deferred before completing
    pub deferred_binds: u64,
    pub events_seen: u64,
}

#[derive(Debug, Serialize)]
pub struct NodeReport {
    pub id: String,
    pub role: NodeRole,
    pub bound: bool,
    pub final_power: PowerState,
    pub bind_attempts: u32,
}

pub fn write_json(report: &RunReport, path: &Path) -> Result<()> {
    let content = serde_json::to_string_pretty(report)?;
    std::fs::write(path, content)?;
    info!(path = %path.display(), "Run report written");
    Ok(())
}
