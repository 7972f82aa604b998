//! Display mode payloads carried through mode staging
//!
//! Mode timing math (porches, sync widths, pixel clocks) is the panel and
//! host framework's business. The binder only needs a validated payload to
//! stage for the register step of the next power-on.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModeError {
    #[error("Invalid mode string '{0}': expected WIDTHxHEIGHT@REFRESH")]
    InvalidFormat(String),
    #[error("Invalid number in mode string '{0}'")]
    InvalidNumber(String),
}

/// Active resolution and refresh rate of a display mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayMode {
    pub hactive: u32,
    pub vactive: u32,
    pub refresh_hz: u32,
}

impl DisplayMode {
    pub fn new(hactive: u32, vactive: u32, refresh_hz: u32) -> Self {
        Self {
            hactive,
            vactive,
            refresh_hz,
        }
    }
}

impl std::fmt::Display for DisplayMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}@{}", self.hactive, self.vactive, self.refresh_hz)
    }
}

/// Parse a mode string like "1920x1080@60"
pub fn parse_mode_string(s: &str) -> Result<DisplayMode, ModeError> {
    let (resolution, refresh) = s
        .split_once('@')
        .ok_or_else(|| ModeError::InvalidFormat(s.to_string()))?;
    let (hactive, vactive) = resolution
        .split_once('x')
        .ok_or_else(|| ModeError::InvalidFormat(s.to_string()))?;

    let hactive = hactive
        .trim()
        .parse()
        .map_err(|_| ModeError::InvalidNumber(s.to_string()))?;
    let vactive = vactive
        .trim()
        .parse()
        .map_err(|_| ModeError::InvalidNumber(s.to_string()))?;
    let refresh_hz = refresh
        .trim()
        .parse()
        .map_err(|_| ModeError::InvalidNumber(s.to_string()))?;

    Ok(DisplayMode {
        hactive,
        vactive,
        refresh_hz,
    })
}
