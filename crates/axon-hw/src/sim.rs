//! Simulated resource bench
//!
//! Stands in for the regulator, clock, GPIO, and register backends when
//! there is no hardware: every line is an in-memory switch with optional
//! latency and fault injection, and every successful backend call lands in
//! an operation log that tests assert ordering against.

use async_trait::async_trait;
use axon_core::{ResourceKind, ResourceSpec};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{trace, warn};

use crate::provider::{ControlError, ResourceControl, ResourceProvider};

/// One successful backend call recorded by the bench
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimOp {
    pub line: String,
    pub op: SimOpKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimOpKind {
    Enable,
    Disable,
}

#[derive(Debug, Clone)]
struct SimLine {
    kind: ResourceKind,
    delay: Duration,
    fail_enable: bool,
    fail_disable: bool,
    enabled: bool,
}

#[derive(Default)]
struct SimState {
    lines: HashMap<String, SimLine>,
    ops: Vec<SimOp>,
}

/// In-memory resource provider with per-line fault injection and an
/// operation log
///
/// Clones share state, so the instance handed to a sequencer and the one a
/// test asserts against see the same log.
#[derive(Clone)]
pub struct SimBench {
    state: Arc<Mutex<SimState>>,
}

impl SimBench {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState::default())),
        }
    }

    /// Add a line the provider will resolve
    pub async fn add_line(&self, id: &str, kind: ResourceKind) {
        let mut state = self.state.lock().await;
        state.lines.insert(
            id.to_string(),
            SimLine {
                kind,
                delay: Duration::ZERO,
                fail_enable: false,
                fail_disable: false,
                enabled: false,
            },
        );
    }

    /// Simulated latency applied before each enable or disable completes
    pub async fn set_delay(&self, id: &str, delay: Duration) {
        self.tune(id, |line| line.delay = delay).await;
    }

    /// Inject a fault into every enable on this line
    pub async fn set_fail_enable(&self, id: &str, fail: bool) {
        self.tune(id, |line| line.fail_enable = fail).await;
    }

    /// Inject a fault into every disable on this line
    pub async fn set_fail_disable(&self, id: &str, fail: bool) {
        self.tune(id, |line| line.fail_disable = fail).await;
    }

    /// Whether the line is currently switched on
    pub async fn is_line_enabled(&self, id: &str) -> bool {
        let state = self.state.lock().await;
        state.lines.get(id).map(|line| line.enabled).unwrap_or(false)
    }

    /// Snapshot of every successful backend call so far, in order
    pub async fn ops(&self) -> Vec<SimOp> {
        self.state.lock().await.ops.clone()
    }

    pub async fn clear_ops(&self) {
        self.state.lock().await.ops.clear();
    }

    async fn tune<F: FnOnce(&mut SimLine)>(&self, id: &str, f: F) {
        let mut state = self.state.lock().await;
        match state.lines.get_mut(id) {
            Some(line) => f(line),
            None => warn!(line = %id, "Tuning an unknown sim line"),
        }
    }
}

#[async_trait]
impl ResourceProvider for SimBench {
    async fn lookup(&self, spec: &ResourceSpec) -> Option<Box<dyn ResourceControl>> {
        let state = self.state.lock().await;
        let line = state.lines.get(&spec.id)?;
        if line.kind != spec.kind {
            trace!(
                line = %spec.id,
                want = spec.kind.as_str(),
                have = line.kind.as_str(),
                "Sim lookup kind mismatch"
            );
            return None;
        }
        Some(Box::new(SimControl {
            id: spec.id.clone(),
            state: self.state.clone(),
        }))
    }
}

struct SimControl {
    id: String,
    state: Arc<Mutex<SimState>>,
}

impl SimControl {
    async fn drive(&self, op: SimOpKind) -> Result<(), ControlError> {
        let (delay, fail) = {
            let state = self.state.lock().await;
            let line = self
                .line(&state)
                .ok_or_else(|| ControlError(format!("sim line {} is gone", self.id)))?;
            let fail = match op {
                SimOpKind::Enable => line.fail_enable,
                SimOpKind::Disable => line.fail_disable,
            };
            (line.delay, fail)
        };

        if !delay.is_zero() {
            sleep(delay).await;
        }

        let mut state = self.state.lock().await;
        if fail {
            trace!(line = %self.id, op = ?op, "Sim injected fault");
            return Err(ControlError(format!(
                "injected {} fault on {}",
                match op {
                    SimOpKind::Enable => "enable",
                    SimOpKind::Disable => "disable",
                },
                self.id
            )));
        }
        if let Some(line) = state.lines.get_mut(&self.id) {
            line.enabled = op == SimOpKind::Enable;
        }
        state.ops.push(SimOp {
            line: self.id.clone(),
            op,
        });
        trace!(line = %self.id, op = ?op, "Sim op");
        Ok(())
    }

    fn line<'a>(&self, state: &'a SimState) -> Option<&'a SimLine> {
        state.lines.get(&self.id)
    }
}

#[async_trait]
impl ResourceControl for SimControl {
    async fn enable(&mut self) -> Result<(), ControlError> {
        self.drive(SimOpKind::Enable).await
    }

    async fn disable(&mut self) -> Result<(), ControlError> {
        self.drive(SimOpKind::Disable).await
    }
}
