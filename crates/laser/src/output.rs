//! Clamped PWM wrapper around the laser diode pin.

use gpio_hal::{GpioBackend, Pin, PwmChannel};
use parking_lot::Mutex;
use tracing::debug;

use crate::LaserError;

/// One PWM channel driving the laser diode.
///
/// Every power value passing through here is clamped to the configured
/// ceiling, so no caller can push the diode past it.
pub struct LaserOutput {
    pwm: Mutex<Box<dyn PwmChannel>>,
    max_power_pct: u8,
}

impl LaserOutput {
    pub fn new(
        gpio: &dyn GpioBackend,
        pin: Pin,
        pwm_freq_hz: f64,
        max_power_pct: u8,
    ) -> Result<Self, LaserError> {
        let pwm = gpio.pwm_open(pin, pwm_freq_hz)?;
        debug!(pin, max_power_pct, "laser output opened");
        Ok(Self {
            pwm: Mutex::new(pwm),
            max_power_pct: max_power_pct.min(100),
        })
    }

    pub fn max_power_pct(&self) -> u8 {
        self.max_power_pct
    }

    pub fn clamp_power(&self, power_pct: u8) -> u8 {
        power_pct.min(self.max_power_pct)
    }

    /// Drives the diode at `power_pct` (clamped).
    pub fn on(&self, power_pct: u8) -> Result<(), LaserError> {
        let duty = self.clamp_power(power_pct) as f64;
        self.pwm.lock().start(duty)?;
        Ok(())
    }

    /// Forces the duty cycle to zero.
    pub fn off(&self) -> Result<(), LaserError> {
        self.pwm.lock().stop()?;
        Ok(())
    }

    /// Whether the live duty cycle is above zero.
    pub fn is_on(&self) -> bool {
        self.pwm.lock().duty() > 0.0
    }
}
