//! Target tracking for the turret.
//!
//! The [`TrackingController`] owns both stepper axes and everything between
//! a detector centroid and motor pulses: pixel-to-step conversion, dual-axis
//! PID compensation with dead-zone filtering, the manual/auto mode state
//! machine, loss-of-target recentering, and homing. All motion funnels
//! through a single mover thread so at most one axis-pair movement is ever
//! in flight; tracking samples that arrive mid-move are coalesced and only
//! the newest one is acted on.

mod calibration;
mod detector;
mod error;
mod pid;
mod tracker;

pub use calibration::{Calibration, CalibrationStore};
pub use detector::{Detection, DetectorBridge, TargetSink, TargetSource};
pub use error::ControlError;
pub use pid::{AxisPid, PidGains};
pub use tracker::{
    Axis, AxisTelemetry, ControlState, PidEcho, TrackMode, TrackerConfig, TrackerTelemetry,
    TrackingController,
};
