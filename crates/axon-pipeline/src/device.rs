//! Registered pipeline devices
//!
//! A [`Device`] is one topology node that has actually arrived. All of its
//! mutable state lives behind a single async mutex, so bind, unbind, and
//! power transitions on one device serialize while different devices stay
//! independent.

use axon_core::{DisplayMode, NodeDescriptor, NodeId, NodeRole, PowerState};
use axon_hw::HardwareError;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info};
use uuid::Uuid;

use crate::power::PowerSequencer;
use crate::registry::PipelineEvent;
use crate::surface::SurfaceError;

#[derive(Error, Debug)]
pub enum PowerError {
    #[error("Node {0} is not registered")]
    UnknownNode(NodeId),
    #[error("Node {0} is not bound; power transitions require a completed bind")]
    NotBound(NodeId),
    #[error("Hardware fault: {0}")]
    Hardware(#[from] HardwareError),
}

/// Where a device stands in its binding lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindState {
    Unbound,
    Resolving,
    Bound,
}

impl Default for BindState {
    fn default() -> Self {
        BindState::Unbound
    }
}

/// Book-keeping created on the first bind attempt and torn down by a
/// successful unbind
#[derive(Debug, Clone)]
pub struct BindingRecord {
    /// Whether the host graph currently holds our surface
    pub attached: bool,
    pub peer: Option<NodeId>,
    pub attempts: u32,
    pub bound_at: Option<DateTime<Utc>>,
}

impl BindingRecord {
    pub fn new() -> Self {
        Self {
            attached: false,
            peer: None,
            attempts: 1,
            bound_at: None,
        }
    }
}

#[derive(Default)]
pub(crate) struct DeviceInner {
    pub(crate) bind: BindState,
    pub(crate) binding: Option<BindingRecord>,
    pub(crate) power: Option<PowerSequencer>,
    pub(crate) pending_mode: Option<DisplayMode>,
    /// Set under this lock when the registry drops the device. A bind that
    /// was already waiting on the lock must fail instead of attaching an
    /// unregistered node.
    pub(crate) removed: bool,
}

/// A registered pipeline component
///
/// `instance` distinguishes re-registrations of the same topology node; two
/// devices with the same id from different sessions never compare equal.
pub struct Device {
    pub id: NodeId,
    pub role: NodeRole,
    pub descriptor: NodeDescriptor,
    pub instance: Uuid,
    pub registered_at: DateTime<Utc>,
    pub(crate) inner: Mutex<DeviceInner>,
    pub(crate) events: broadcast::Sender<PipelineEvent>,
}

// The mutex and the event sender have nothing useful to print; identity is
// what log and assertion output needs.
impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("instance", &self.instance)
            .finish_non_exhaustive()
    }
}

impl Device {
    pub(crate) fn new(descriptor: NodeDescriptor, events: broadcast::Sender<PipelineEvent>) -> Self {
        Self {
            id: descriptor.id.clone(),
            role: descriptor.role,
            instance: Uuid::new_v4(),
            registered_at: Utc::now(),
            inner: Mutex::new(DeviceInner::default()),
            descriptor,
            events,
        }
    }

    /// Drive the device to the desired power state
    ///
    /// Requires a completed bind. Holds the device lock across the whole
    /// hardware walk, so concurrent callers on the same device queue up
    /// while other devices proceed in parallel. Reaching the desired state
    /// emits [`PipelineEvent::PowerChanged`]; an already-satisfied request
    /// changes nothing and emits nothing.
    pub async fn set_power(&self, desired: PowerState) -> Result<PowerState, PowerError> {
        let mut guard = self.inner.lock().await;
        if guard.bind != BindState::Bound {
            return Err(PowerError::NotBound(self.id.clone()));
        }
        let inner = &mut *guard;
        let seq = match inner.power.as_mut() {
            Some(seq) => seq,
            None => return Err(PowerError::NotBound(self.id.clone())),
        };

        if seq.state() == desired {
            debug!(node = %self.id, state = ?desired, "Power state already satisfied");
            return Ok(desired);
        }
        match desired {
            PowerState::On => {
                seq.power_on(inner.pending_mode).await?;
                inner.pending_mode = None;
                info!(node = %self.id, "Powered on");
            }
            PowerState::Off => {
                seq.power_off().await;
                info!(node = %self.id, "Powered off");
            }
        }
        self.emit(PipelineEvent::PowerChanged {
            node: self.id.clone(),
            state: desired,
        });
        Ok(desired)
    }

    pub async fn bind_state(&self) -> BindState {
        self.inner.lock().await.bind
    }

    pub async fn power_state(&self) -> PowerState {
        self.inner
            .lock()
            .await
            .power
            .as_ref()
            .map(|seq| seq.state())
            .unwrap_or(PowerState::Off)
    }

    /// Mode staged by `mode_set` but not yet written to hardware
    pub async fn pending_mode(&self) -> Option<DisplayMode> {
        self.inner.lock().await.pending_mode
    }

    /// Mode most recently written into the register block
    pub async fn programmed_mode(&self) -> Option<DisplayMode> {
        self.inner
            .lock()
            .await
            .power
            .as_ref()
            .and_then(|seq| seq.programmed_mode())
    }

    /// Bind attempts so far, zero before the first attempt
    pub async fn bind_attempts(&self) -> u32 {
        self.inner
            .lock()
            .await
            .binding
            .as_ref()
            .map(|record| record.attempts)
            .unwrap_or(0)
    }

    pub(crate) async fn stage_mode(&self, mode: DisplayMode) -> Result<(), SurfaceError> {
        let mut inner = self.inner.lock().await;
        if inner.bind != BindState::Bound {
            return Err(SurfaceError::NotBound(self.id.clone()));
        }
        debug!(node = %self.id, mode = %mode, "Mode staged for the next power-on");
        inner.pending_mode = Some(mode);
        Ok(())
    }

    pub(crate) fn emit(&self, event: PipelineEvent) {
        let _ = self.events.send(event);
    }
}
