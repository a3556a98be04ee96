//! Per-axis stepper control for the turret.
//!
//! A [`StepperAxis`] owns the step/dir/enable lines and both limit switches
//! of one motor. It emits bounded, speed-profiled pulse trains, keeps the
//! step-accurate position, and honors limit interlocks and cooperative
//! cancellation. Everything is synchronous: the single mover task that owns
//! an axis calls into it directly and sleeps between pulses.

mod axis;
mod error;
mod profile;

pub use axis::{
    AxisConfig, AxisStatus, Direction, FaultKind, StepOutcome, StepperAxis, Termination,
};
pub use error::MotionError;
pub use profile::step_delay;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative cancellation flag shared between a requester and a motion
/// loop.
///
/// Cancellation is observed between step pulses; a pulse in progress always
/// completes before the flag is inspected again.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn clear(&self) {
        self.flag.store(false, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}
