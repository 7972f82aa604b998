//! Power sequencing
//!
//! Brings a node's supply rails, clock, power-save GPIO, and register block
//! up in a fixed order and back down in reverse. A failure partway through
//! the power-on walk unwinds every step already taken, so a node is never
//! left between Off and On.

use axon_core::{DisplayMode, PowerState, ResourceKind, ResourceSpec};
use axon_hw::{HardwareError, ResourceHandle, ResourceProvider};
use tracing::{debug, warn};

/// Holds a node's acquired resources and walks them up and down
///
/// On: regulators in declaration order, then clock, then power-save GPIO,
/// then the register block with its enable bit written last. Off: the same
/// walk reversed. `power_off` cannot fail; backend disable faults are
/// logged and swallowed by the handles.
pub struct PowerSequencer {
    regulators: Vec<ResourceHandle>,
    clock: Option<ResourceHandle>,
    gpio: Option<ResourceHandle>,
    registers: Option<ResourceHandle>,
    state: PowerState,
    programmed: Option<DisplayMode>,
}

impl PowerSequencer {
    /// Acquire every resource a node declares and slot it by kind
    ///
    /// Fails only when a required resource is missing from the provider.
    /// Acquisition switches nothing on.
    pub async fn acquire(
        provider: &dyn ResourceProvider,
        specs: &[ResourceSpec],
    ) -> Result<Self, HardwareError> {
        let mut seq = Self {
            regulators: Vec::new(),
            clock: None,
            gpio: None,
            registers: None,
            state: PowerState::Off,
            programmed: None,
        };
        for spec in specs {
            let handle = ResourceHandle::acquire(provider, spec.clone()).await?;
            match spec.kind {
                ResourceKind::Regulator => seq.regulators.push(handle),
                ResourceKind::Clock => Self::fill(&mut seq.clock, handle),
                ResourceKind::Gpio => Self::fill(&mut seq.gpio, handle),
                ResourceKind::Registers => Self::fill(&mut seq.registers, handle),
            }
        }
        Ok(seq)
    }

    // Single slot per kind; the first declaration wins.
    fn fill(slot: &mut Option<ResourceHandle>, handle: ResourceHandle) {
        if slot.is_some() {
            warn!(resource = %handle.label(), "Duplicate resource declaration ignored");
        } else {
            *slot = Some(handle);
        }
    }

    /// Walk the power-on sequence, writing the staged mode configuration
    /// (when there is one) into the register block before its enable bit
    ///
    /// Already-On is a no-op. Any failure unwinds the steps taken so far
    /// and leaves the node Off.
    pub async fn power_on(&mut self, mode: Option<DisplayMode>) -> Result<(), HardwareError> {
        if self.state == PowerState::On {
            return Ok(());
        }
        if let Err(err) = self.raise(mode).await {
            warn!(error = %err, "Power-on failed, unwinding");
            self.lower().await;
            return Err(err);
        }
        self.state = PowerState::On;
        Ok(())
    }

    /// Walk the power-off sequence
    ///
    /// Never fails. Handles that were never enabled skip their backend
    /// call, which also makes repeated power-off a no-op.
    pub async fn power_off(&mut self) {
        self.lower().await;
        self.state = PowerState::Off;
    }

    pub fn state(&self) -> PowerState {
        self.state
    }

    /// Mode most recently written into the register block, if any
    pub fn programmed_mode(&self) -> Option<DisplayMode> {
        self.programmed
    }

    async fn raise(&mut self, mode: Option<DisplayMode>) -> Result<(), HardwareError> {
        for regulator in &mut self.regulators {
            regulator.enable().await?;
        }
        if let Some(clock) = self.clock.as_mut() {
            clock.enable().await?;
        }
        if let Some(gpio) = self.gpio.as_mut() {
            gpio.enable().await?;
        }
        if let Some(registers) = self.registers.as_mut() {
            if let Some(mode) = mode {
                debug!(mode = %mode, "Writing mode configuration ahead of the enable bit");
            }
            registers.enable().await?;
            // Recorded only once the enable bit went through; a mode staged
            // into a bank that never came up did not reach the hardware.
            if let Some(mode) = mode {
                self.programmed = Some(mode);
            }
        }
        Ok(())
    }

    async fn lower(&mut self) {
        if let Some(registers) = self.registers.as_mut() {
            registers.disable().await;
        }
        if let Some(gpio) = self.gpio.as_mut() {
            gpio.disable().await;
        }
        if let Some(clock) = self.clock.as_mut() {
            clock.disable().await;
        }
        for regulator in self.regulators.iter_mut().rev() {
            regulator.disable().await;
        }
    }
}
