use super::{OutputLine, RelayError};
use rppal::gpio::{Gpio, OutputPin};
use tracing::{debug, error};

/// A BCM-numbered Raspberry Pi pin configured as output.
///
/// rppal resets the pin to its original mode when the `OutputPin` is
/// dropped, which hands the line back to the system.
pub struct GpioLine {
    pin: OutputPin,
}

impl GpioLine {
    /// Claims `pin` as output. The initial level is the de-energized one so
    /// the relay never glitches on while the pin is being configured.
    pub fn claim(pin: u8, active_low: bool) -> Result<Self, RelayError> {
        debug!("Opening GPIO peripheral for pin {}", pin);
        let gpio = Gpio::new().map_err(|e| {
            error!("Failed to open GPIO peripheral: {}", e);
            RelayError::ResourceUnavailable {
                pin,
                reason: e.to_string(),
            }
        })?;

        let raw = gpio.get(pin).map_err(|e| {
            error!("Failed to claim GPIO pin {}: {}", pin, e);
            RelayError::ResourceUnavailable {
                pin,
                reason: e.to_string(),
            }
        })?;

        let mut output = if active_low {
            raw.into_output_high()
        } else {
            raw.into_output_low()
        };
        output.set_reset_on_drop(true);

        Ok(GpioLine { pin: output })
    }
}

impl OutputLine for GpioLine {
    fn set_high(&mut self) {
        self.pin.set_high();
    }

    fn set_low(&mut self) {
        self.pin.set_low();
    }

    fn describe(&self) -> String {
        format!("GPIO {}", self.pin.pin())
    }
}
