//! Laser power control with safety interlocks.
//!
//! [`LaserOutput`] wraps the diode's PWM channel and clamps every duty cycle
//! to the configured power ceiling. [`LaserSafetyController`] owns the
//! arm/disarm state machine on top of it: fire and burst sequencing, the
//! post-fire cooldown, and the guarantee that the duty cycle is zero on
//! every exit path.

mod output;
mod safety;

pub use output::LaserOutput;
pub use safety::{FireClaim, LaserLimits, LaserSafetyController, LaserState};

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LaserError {
    #[error("laser is disarmed")]
    Disarmed,

    #[error("laser is busy with another fire sequence")]
    Busy,

    #[error("laser cooling down for another {0:?}")]
    Cooldown(Duration),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Gpio(#[from] gpio_hal::GpioError),
}
