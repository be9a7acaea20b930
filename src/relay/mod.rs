//! # Relay Output Driver
//!
//! Owns the single digital line that energizes the relay. The line is
//! claimed once at startup, driven to the de-energized state before any
//! network activity, and driven back to it when released.
//!
//! ## Fail-safe guarantee
//!
//! [`RelayDriver::release`] is idempotent and also runs from `Drop`, so the
//! line is de-energized on every exit path: graceful shutdown, an early
//! return through `?`, or a panic unwinding through the lifecycle.
//!
//! ## Backends
//!
//! ```text
//! relay/
//! ├── gpio.rs       - Raspberry Pi GPIO through rppal
//! └── simulated.rs  - In-memory line for bench runs and tests
//! ```

pub mod gpio;
pub mod simulated;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Raw electrical capability of an output line.
pub trait OutputLine: Send {
    fn set_high(&mut self);
    fn set_low(&mut self);
    fn describe(&self) -> String;
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RelayBackend {
    #[default]
    Gpio,
    Simulated,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct RelayConfig {
    /// BCM pin number
    pub pin: u8,
    /// Relay boards that energize on a low level
    pub active_low: bool,
    pub backend: RelayBackend,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            pin: 17,
            active_low: false,
            backend: RelayBackend::Gpio,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Output line {pin} unavailable: {reason}")]
    ResourceUnavailable { pin: u8, reason: String },

    #[error("Output line already released")]
    Released,
}

/// Relay output with idempotent assert/deassert.
pub struct RelayDriver {
    line: Option<Box<dyn OutputLine>>,
    active_low: bool,
    asserted: bool,
}

impl RelayDriver {
    /// Claims the configured line and leaves it deasserted.
    pub fn initialize(config: &RelayConfig) -> Result<Self, RelayError> {
        info!(
            "Claiming relay line {} ({:?} backend, active_low={})",
            config.pin, config.backend, config.active_low
        );
        let line: Box<dyn OutputLine> = match config.backend {
            RelayBackend::Gpio => Box::new(gpio::GpioLine::claim(config.pin, config.active_low)?),
            RelayBackend::Simulated => Box::new(simulated::SimulatedLine::new(config.pin)),
        };
        Ok(Self::with_line(line, config.active_low))
    }

    /// Wraps an already claimed line and drives it to the safe state.
    pub fn with_line(line: Box<dyn OutputLine>, active_low: bool) -> Self {
        let mut driver = RelayDriver {
            line: Some(line),
            active_low,
            asserted: false,
        };
        driver.drive(false);
        if let Some(line) = &driver.line {
            info!("Relay {} initialized to OFF", line.describe());
        }
        driver
    }

    pub fn is_asserted(&self) -> bool {
        self.asserted
    }

    #[cfg(test)]
    pub fn is_released(&self) -> bool {
        self.line.is_none()
    }

    /// Energizes the relay. No-op if it already is.
    pub fn assert(&mut self) -> Result<(), RelayError> {
        self.set(true)
    }

    /// De-energizes the relay. No-op if it already is.
    pub fn deassert(&mut self) -> Result<(), RelayError> {
        self.set(false)
    }

    /// De-energizes the relay and gives the line back. Safe to call any
    /// number of times.
    pub fn release(&mut self) {
        if self.line.is_none() {
            debug!("Relay line already released");
            return;
        }
        self.drive(false);
        if let Some(line) = self.line.take() {
            info!("Relay {} released in OFF state", line.describe());
        }
    }

    fn set(&mut self, asserted: bool) -> Result<(), RelayError> {
        if self.line.is_none() {
            return Err(RelayError::Released);
        }
        if self.asserted == asserted {
            debug!("Relay already {}, nothing to do", on_off(asserted));
            return Ok(());
        }
        self.drive(asserted);
        info!("Relay switched {}", on_off(asserted));
        Ok(())
    }

    fn drive(&mut self, asserted: bool) {
        let Some(line) = self.line.as_mut() else {
            return;
        };
        if asserted != self.active_low {
            line.set_high();
        } else {
            line.set_low();
        }
        self.asserted = asserted;
    }
}

impl Drop for RelayDriver {
    fn drop(&mut self) {
        self.release();
    }
}

fn on_off(asserted: bool) -> &'static str {
    if asserted {
        "ON"
    } else {
        "OFF"
    }
}
