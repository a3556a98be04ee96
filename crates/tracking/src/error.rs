//! Error types for the tracking controller.

use motion::MotionError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControlError {
    /// The command needs motor motion and the controller is in crosshair
    /// mode.
    #[error("motion commands are disabled in crosshair mode")]
    ModeDisabled,

    #[error("motors are disabled")]
    Disabled,

    #[error("mover queue is full")]
    QueueFull,

    #[error("mover is shut down")]
    Shutdown,

    #[error("invalid calibration: {0}")]
    InvalidCalibration(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Motion(#[from] MotionError),

    #[error("calibration i/o: {0}")]
    Io(#[from] std::io::Error),
}
