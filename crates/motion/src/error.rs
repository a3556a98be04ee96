//! Error types for stepper motion.

use crate::Direction;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MotionError {
    /// The requested direction's limit switch is latched; only this motion
    /// is refused.
    #[error("motion toward the {0:?} limit is blocked")]
    LimitBlocked(Direction),

    /// The axis enable line is released; pulses would be ignored by the
    /// driver.
    #[error("axis is disabled")]
    Disabled,

    #[error("invalid step request: {0}")]
    InvalidRequest(String),

    #[error("invalid axis config: {0}")]
    InvalidConfig(String),

    /// A single pulse-and-sleep cycle exceeded its wall-clock budget. The
    /// axis is left faulted with its driver released.
    #[error("single step exceeded its {0:?} budget")]
    StepTimeout(Duration),

    #[error("homing did not complete within {0:?}")]
    HomeTimeout(Duration),

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Hardware(#[from] gpio_hal::GpioError),
}
